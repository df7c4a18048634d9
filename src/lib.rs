//! chorus-db: a distributed, replicated key-value engine.
//!
//! One TCP channel per peer carries synchronous calls, long-lived
//! subscriptions and replication traffic, multiplexed by transaction id.
//! Multi-master replication tracks per-key dirty bits per remote peer and
//! resolves concurrent writes deterministically: newer timestamp wins,
//! equal timestamps go to the smaller node identifier.

pub mod asset;
pub mod clock;
pub mod csp;
pub mod error;
pub mod event_loop;
pub mod net;
pub mod replication;
pub mod store;
pub mod wire;

pub use asset::{AssetTree, MapEvent};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::EngineError;
pub use net::{ClientConfig, EngineClient, EngineServer, RemoteMap, ServerConfig};
pub use replication::{ReplicationHub, ReplicationState};
pub use wire::{Document, WireFormat, WireValue};

#[cfg(test)]
pub mod tests;
