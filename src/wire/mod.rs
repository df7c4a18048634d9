pub mod binary;
pub mod frame;
pub mod text;
pub mod value;

pub use value::{fields, Document, WireEvent, WireValue};

use crate::error::EngineError;

/// Codec for a channel, fixed at connect time. Both forms share the same
/// document model; the text form exists for debuggability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Text,
}

impl WireFormat {
    pub fn encode(&self, doc: &Document, out: &mut Vec<u8>) -> Result<(), EngineError> {
        match self {
            WireFormat::Binary => binary::encode(doc, out),
            WireFormat::Text => text::encode(doc, out),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Document, EngineError> {
        match self {
            WireFormat::Binary => binary::decode(bytes),
            WireFormat::Text => text::decode(bytes),
        }
    }
}
