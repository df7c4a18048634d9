//! Wire transport: a multiplexed request/response protocol over a single
//! framed TCP channel per peer. Synchronous calls, long-lived subscriptions
//! and replication traffic all share the channel, correlated by transaction
//! id (TID).

pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod proxy;
pub mod server;

pub use client::{ClientConfig, EngineClient};
pub use proxy::{RemoteMap, RemoteSet, RemoteTopic};
pub use server::{EngineServer, ServerConfig};

use bincode::{Decode, Encode};

use crate::error::EngineError;
use crate::wire::{fields, frame, Document, WireFormat, WireValue};

/// Where a request is addressed: a csp on first use, its cid alias after,
/// or neither for system traffic.
#[derive(Clone, Copy, Debug)]
pub enum Target<'a> {
    Csp(&'a str),
    Cid(u64),
    None,
}

/// Collection views are never materialised into a reply; the server answers
/// with this descriptor and the client talks to the derived csp/cid instead.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SetProxy {
    pub csp: String,
    pub cid: u64,
}

pub const SET_PROXY_CLASS: &str = "set-proxy";

pub(crate) fn meta_document(target: Target<'_>, tid: u64) -> Document {
    let doc = match target {
        Target::Csp(csp) => Document::new().with(fields::CSP, WireValue::Text(csp.to_owned())),
        Target::Cid(cid) => Document::new().with(fields::CID, WireValue::I64(cid as i64)),
        Target::None => Document::new(),
    };
    doc.with(fields::TID, WireValue::I64(tid as i64))
}

/// Encode a meta document plus its data document into one framed chunk.
pub(crate) fn encode_exchange(
    format: WireFormat,
    meta: &Document,
    data: &Document,
    ready: bool,
    out: &mut Vec<u8>,
) -> Result<(), EngineError> {
    let mut payload = Vec::new();
    format.encode(meta, &mut payload)?;
    frame::append_frame(out, &payload, false, true)?;
    payload.clear();
    format.encode(data, &mut payload)?;
    frame::append_frame(out, &payload, true, ready)?;
    Ok(())
}
