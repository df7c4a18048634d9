use smallvec::SmallVec;

use crate::error::EngineError;

/// Well-known event and field names. All names are case-sensitive ASCII and
/// wire-stable: changing one breaks interop with existing peers.
pub mod fields {
    pub const CSP: &str = "csp";
    pub const CID: &str = "cid";
    pub const TID: &str = "tid";
    pub const REPLY: &str = "reply";
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const OLD_VALUE: &str = "oldValue";
    pub const NEW_VALUE: &str = "newValue";
    pub const EVENT_TYPE: &str = "eventType";
    pub const TOPIC: &str = "topic";
    pub const MESSAGE: &str = "message";
}

/// A single typed value carried on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Text(String),
    Bytes(Vec<u8>),
    /// Opaque payload tagged with a class literal. The payload encoding is
    /// bincode with the standard config; the tag is what the receiver
    /// dispatches on.
    Typed { class: String, payload: Vec<u8> },
    Sequence(Vec<WireValue>),
    /// A nested document used for named parameter groups.
    Fields(Box<Document>),
}

impl WireValue {
    pub fn typed<T: bincode::Encode>(class: &str, value: &T) -> Result<WireValue, EngineError> {
        let payload = bincode::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(WireValue::Typed {
            class: class.to_owned(),
            payload,
        })
    }

    /// Decode a `Typed` value, checking the class tag.
    pub fn decode_typed<T: bincode::Decode<()>>(&self, expect: &str) -> Result<T, EngineError> {
        match self {
            WireValue::Typed { class, payload } if class == expect => {
                bincode::decode_from_slice(payload, bincode::config::standard())
                    .map(|(v, _)| v)
                    .map_err(|e| EngineError::Codec(e.to_string()))
            }
            WireValue::Typed { class, .. } => Err(EngineError::Codec(format!(
                "expected typed {expect}, got {class}"
            ))),
            other => Err(EngineError::Codec(format!(
                "expected typed {expect}, got {other:?}"
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer widening: any integer variant reads back as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::I8(v) => Some(*v as i64),
            WireValue::I16(v) => Some(*v as i64),
            WireValue::I32(v) => Some(*v as i64),
            WireValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_fields(&self) -> Option<&Document> {
        match self {
            WireValue::Fields(d) => Some(d.as_ref()),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::Sequence(s) => Some(s),
            _ => None,
        }
    }
}

/// One `(eventName, value)` pair.
#[derive(Clone, Debug, PartialEq)]
pub struct WireEvent {
    pub name: String,
    pub value: WireValue,
}

/// A self-describing sequence of events. The first event of a data document
/// names the operation; the remaining events are its parameters.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Document {
    events: SmallVec<[WireEvent; 4]>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, value: WireValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: WireValue) {
        self.events.push(WireEvent {
            name: name.into(),
            value,
        });
    }

    pub fn events(&self) -> &[WireEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn first(&self) -> Option<&WireEvent> {
        self.events.first()
    }

    pub fn get(&self, name: &str) -> Option<&WireValue> {
        self.events.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(WireValue::as_i64)
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(WireValue::as_text)
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(WireValue::as_bytes)
    }
}

impl FromIterator<WireEvent> for Document {
    fn from_iter<I: IntoIterator<Item = WireEvent>>(iter: I) -> Self {
        Document {
            events: iter.into_iter().collect(),
        }
    }
}
