//! Textual document codec, YAML-flavoured. One `name: value` pair per line,
//! nested documents in braces, sequences in brackets. Used on channels opened
//! for debuggability; the binary codec is the production form. Both sides of
//! a channel must agree on the codec at connect time.
//!
//! ```text
//! put: {
//!   key: 0x6161
//!   value: 0x0102
//! }
//! tid: 42
//! user: "peter"
//! small: !i8 -3
//! boot: !Bootstrap 0x0164
//! nil: ~
//! ```

use crate::error::EngineError;
use crate::wire::value::{Document, WireValue};

pub fn encode(doc: &Document, out: &mut Vec<u8>) -> Result<(), EngineError> {
    let mut s = String::new();
    write_events(doc, 0, &mut s);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<Document, EngineError> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| EngineError::Codec("document not utf-8".into()))?;
    let mut p = Parser {
        chars: text.chars().collect(),
        at: 0,
    };
    let doc = p.events_until(None)?;
    p.skip_ws();
    if !p.at_end() {
        return Err(EngineError::Codec("trailing input after document".into()));
    }
    Ok(doc)
}

/*──────────────────────── encoder ───────────────────────*/

fn indent(depth: usize, s: &mut String) {
    for _ in 0..depth {
        s.push_str("  ");
    }
}

fn write_events(doc: &Document, depth: usize, s: &mut String) {
    for ev in doc.events() {
        indent(depth, s);
        s.push_str(&ev.name);
        s.push_str(": ");
        write_value(&ev.value, depth, s);
        s.push('\n');
    }
}

fn write_value(value: &WireValue, depth: usize, s: &mut String) {
    match value {
        WireValue::Null => s.push('~'),
        WireValue::Bool(b) => s.push_str(if *b { "true" } else { "false" }),
        WireValue::I8(v) => {
            s.push_str("!i8 ");
            s.push_str(&v.to_string());
        }
        WireValue::I16(v) => {
            s.push_str("!i16 ");
            s.push_str(&v.to_string());
        }
        WireValue::I32(v) => {
            s.push_str("!i32 ");
            s.push_str(&v.to_string());
        }
        WireValue::I64(v) => s.push_str(&v.to_string()),
        WireValue::Text(t) => {
            s.push('"');
            for c in t.chars() {
                match c {
                    '"' => s.push_str("\\\""),
                    '\\' => s.push_str("\\\\"),
                    '\n' => s.push_str("\\n"),
                    c => s.push(c),
                }
            }
            s.push('"');
        }
        WireValue::Bytes(b) => write_hex(b, s),
        WireValue::Typed { class, payload } => {
            s.push('!');
            s.push_str(class);
            s.push(' ');
            write_hex(payload, s);
        }
        WireValue::Sequence(items) => {
            s.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                write_value(item, depth, s);
            }
            s.push(']');
        }
        WireValue::Fields(doc) => {
            s.push_str("{\n");
            write_events(doc, depth + 1, s);
            indent(depth, s);
            s.push('}');
        }
    }
}

fn write_hex(bytes: &[u8], s: &mut String) {
    s.push_str("0x");
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
}

/*──────────────────────── parser ────────────────────────*/

struct Parser {
    chars: Vec<char>,
    at: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.at >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.at).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.at += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace() || c == ',') {
            self.at += 1;
        }
    }

    fn err(&self, what: &str) -> EngineError {
        EngineError::Codec(format!("{what} at offset {}", self.at))
    }

    /// Parse `name: value` pairs until `stop` (or end of input when None).
    fn events_until(&mut self, stop: Option<char>) -> Result<Document, EngineError> {
        let mut doc = Document::new();
        loop {
            self.skip_ws();
            match (self.peek(), stop) {
                (None, None) => return Ok(doc),
                (None, Some(_)) => return Err(self.err("unterminated document")),
                (Some(c), Some(s)) if c == s => {
                    self.at += 1;
                    return Ok(doc);
                }
                _ => {}
            }
            let name = self.ident()?;
            self.skip_ws();
            if self.bump() != Some(':') {
                return Err(self.err("expected ':' after event name"));
            }
            self.skip_ws();
            let value = self.value()?;
            doc.push(name, value);
        }
    }

    fn ident(&mut self) -> Result<String, EngineError> {
        let start = self.at;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || "_.-".contains(c)) {
            self.at += 1;
        }
        if self.at == start {
            return Err(self.err("expected identifier"));
        }
        Ok(self.chars[start..self.at].iter().collect())
    }

    fn value(&mut self) -> Result<WireValue, EngineError> {
        match self.peek() {
            Some('~') => {
                self.at += 1;
                Ok(WireValue::Null)
            }
            Some('"') => self.quoted(),
            Some('{') => {
                self.at += 1;
                Ok(WireValue::Fields(Box::new(self.events_until(Some('}'))?)))
            }
            Some('[') => {
                self.at += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_ws();
                    if self.peek() == Some(']') {
                        self.at += 1;
                        return Ok(WireValue::Sequence(items));
                    }
                    if self.at_end() {
                        return Err(self.err("unterminated sequence"));
                    }
                    items.push(self.value()?);
                }
            }
            Some('!') => {
                self.at += 1;
                let tag = self.ident()?;
                self.skip_ws();
                match tag.as_str() {
                    "i8" => Ok(WireValue::I8(
                        self.int()?
                            .try_into()
                            .map_err(|_| self.err("i8 out of range"))?,
                    )),
                    "i16" => Ok(WireValue::I16(
                        self.int()?
                            .try_into()
                            .map_err(|_| self.err("i16 out of range"))?,
                    )),
                    "i32" => Ok(WireValue::I32(
                        self.int()?
                            .try_into()
                            .map_err(|_| self.err("i32 out of range"))?,
                    )),
                    _ => Ok(WireValue::Typed {
                        class: tag,
                        payload: self.hex()?,
                    }),
                }
            }
            Some('0') if self.chars.get(self.at + 1) == Some(&'x') => {
                Ok(WireValue::Bytes(self.hex()?))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(WireValue::I64(self.int()?)),
            Some('t') | Some('f') => {
                let word = self.ident()?;
                match word.as_str() {
                    "true" => Ok(WireValue::Bool(true)),
                    "false" => Ok(WireValue::Bool(false)),
                    _ => Err(self.err("expected boolean")),
                }
            }
            _ => Err(self.err("expected value")),
        }
    }

    fn quoted(&mut self) -> Result<WireValue, EngineError> {
        self.at += 1; // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some('"') => return Ok(WireValue::Text(s)),
                Some('\\') => match self.bump() {
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some('n') => s.push('\n'),
                    _ => return Err(self.err("bad escape")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn int(&mut self) -> Result<i64, EngineError> {
        let start = self.at;
        if self.peek() == Some('-') {
            self.at += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.at += 1;
        }
        let raw: String = self.chars[start..self.at].iter().collect();
        raw.parse().map_err(|_| self.err("bad integer"))
    }

    fn hex(&mut self) -> Result<Vec<u8>, EngineError> {
        if self.bump() != Some('0') || self.bump() != Some('x') {
            return Err(self.err("expected 0x"));
        }
        let start = self.at;
        while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
            self.at += 1;
        }
        let raw: String = self.chars[start..self.at].iter().collect();
        if raw.len() % 2 != 0 {
            return Err(self.err("odd hex length"));
        }
        let mut out = Vec::with_capacity(raw.len() / 2);
        for i in (0..raw.len()).step_by(2) {
            out.push(
                u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| self.err("bad hex byte"))?,
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(doc: Document) {
        let mut buf = Vec::new();
        encode(&doc, &mut buf).unwrap();
        assert_eq!(decode(&buf).unwrap(), doc, "{}", String::from_utf8_lossy(&buf));
    }

    #[test]
    fn renders_nested_put_readably() {
        let doc = Document::new().with(
            "put",
            WireValue::Fields(Box::new(
                Document::new()
                    .with("key", WireValue::Bytes(vec![0x61, 0x61]))
                    .with("value", WireValue::Bytes(vec![1, 2])),
            )),
        );
        let mut buf = Vec::new();
        encode(&doc, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "put: {\n  key: 0x6161\n  value: 0x0102\n}\n");
        round_trip(doc);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(
            Document::new()
                .with("tid", WireValue::I64(-9))
                .with("ok", WireValue::Bool(false))
                .with("id", WireValue::I8(3))
                .with("nil", WireValue::Null)
                .with("who", WireValue::Text("a \"b\"\nc".into()))
                .with(
                    "boot",
                    WireValue::Typed {
                        class: "Bootstrap".into(),
                        payload: vec![0xde, 0xad],
                    },
                ),
        );
    }

    #[test]
    fn sequences_may_hold_nested_documents() {
        round_trip(Document::new().with(
            "putAll",
            WireValue::Sequence(vec![
                WireValue::Fields(Box::new(
                    Document::new()
                        .with("key", WireValue::Bytes(vec![1]))
                        .with("value", WireValue::Bytes(vec![2])),
                )),
                WireValue::I64(5),
            ]),
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(b"put {").is_err());
        assert!(decode(b"k: 0x1").is_err());
        assert!(decode(b"k: \"unterminated").is_err());
    }
}
