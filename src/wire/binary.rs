//! Binary document codec. Tag-byte per value, little-endian fixed-width
//! integers, length-prefixed names and payloads. The layout is wire-stable.

use crate::error::EngineError;
use crate::wire::value::{Document, WireValue};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I8: u8 = 2;
const TAG_I16: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_TEXT: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_TYPED: u8 = 8;
const TAG_SEQUENCE: u8 = 9;
const TAG_FIELDS: u8 = 10;

pub fn encode(doc: &Document, out: &mut Vec<u8>) -> Result<(), EngineError> {
    write_events(doc, out)
}

pub fn decode(bytes: &[u8]) -> Result<Document, EngineError> {
    let mut r = Reader { buf: bytes, at: 0 };
    let doc = read_events(&mut r)?;
    if r.at != r.buf.len() {
        return Err(EngineError::Codec(format!(
            "{} trailing bytes after document",
            r.buf.len() - r.at
        )));
    }
    Ok(doc)
}

fn write_events(doc: &Document, out: &mut Vec<u8>) -> Result<(), EngineError> {
    let n = u32::try_from(doc.len()).map_err(|_| EngineError::Codec("too many events".into()))?;
    out.extend_from_slice(&n.to_le_bytes());
    for ev in doc.events() {
        write_name(&ev.name, out)?;
        write_value(&ev.value, out)?;
    }
    Ok(())
}

fn write_name(name: &str, out: &mut Vec<u8>) -> Result<(), EngineError> {
    let len =
        u16::try_from(name.len()).map_err(|_| EngineError::Codec("event name too long".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

fn write_len(len: usize, out: &mut Vec<u8>) -> Result<(), EngineError> {
    let len = u32::try_from(len).map_err(|_| EngineError::Codec("value too long".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_value(value: &WireValue, out: &mut Vec<u8>) -> Result<(), EngineError> {
    match value {
        WireValue::Null => out.push(TAG_NULL),
        WireValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        WireValue::I8(v) => {
            out.push(TAG_I8);
            out.push(*v as u8);
        }
        WireValue::I16(v) => {
            out.push(TAG_I16);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::I32(v) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::I64(v) => {
            out.push(TAG_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::Text(s) => {
            out.push(TAG_TEXT);
            write_len(s.len(), out)?;
            out.extend_from_slice(s.as_bytes());
        }
        WireValue::Bytes(b) => {
            out.push(TAG_BYTES);
            write_len(b.len(), out)?;
            out.extend_from_slice(b);
        }
        WireValue::Typed { class, payload } => {
            out.push(TAG_TYPED);
            write_name(class, out)?;
            write_len(payload.len(), out)?;
            out.extend_from_slice(payload);
        }
        WireValue::Sequence(items) => {
            out.push(TAG_SEQUENCE);
            write_len(items.len(), out)?;
            for item in items {
                write_value(item, out)?;
            }
        }
        WireValue::Fields(doc) => {
            out.push(TAG_FIELDS);
            write_events(doc, out)?;
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| EngineError::Codec("truncated document".into()))?;
        let s = &self.buf[self.at..end];
        self.at = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EngineError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, EngineError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn name(&mut self) -> Result<String, EngineError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| EngineError::Codec("name not utf-8".into()))
    }
}

fn read_events(r: &mut Reader<'_>) -> Result<Document, EngineError> {
    let n = r.u32()? as usize;
    let mut doc = Document::new();
    for _ in 0..n {
        let name = r.name()?;
        let value = read_value(r)?;
        doc.push(name, value);
    }
    Ok(doc)
}

fn read_value(r: &mut Reader<'_>) -> Result<WireValue, EngineError> {
    let tag = r.u8()?;
    Ok(match tag {
        TAG_NULL => WireValue::Null,
        TAG_BOOL => WireValue::Bool(r.u8()? != 0),
        TAG_I8 => WireValue::I8(r.u8()? as i8),
        TAG_I16 => WireValue::I16(r.u16()? as i16),
        TAG_I32 => WireValue::I32(r.u32()? as i32),
        TAG_I64 => WireValue::I64(r.i64()?),
        TAG_TEXT => {
            let len = r.u32()? as usize;
            let raw = r.take(len)?;
            WireValue::Text(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| EngineError::Codec("text not utf-8".into()))?,
            )
        }
        TAG_BYTES => {
            let len = r.u32()? as usize;
            WireValue::Bytes(r.take(len)?.to_vec())
        }
        TAG_TYPED => {
            let class = r.name()?;
            let len = r.u32()? as usize;
            WireValue::Typed {
                class,
                payload: r.take(len)?.to_vec(),
            }
        }
        TAG_SEQUENCE => {
            let len = r.u32()? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(read_value(r)?);
            }
            WireValue::Sequence(items)
        }
        TAG_FIELDS => WireValue::Fields(Box::new(read_events(r)?)),
        other => return Err(EngineError::Codec(format!("unknown value tag {other}"))),
    })
}
