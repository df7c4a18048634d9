//! Multi-master replication. Every local mutation is recorded against a
//! per-key record whose dirty bits say which remote peers have not yet seen
//! the current value; per-peer modification iterators drain those bits and
//! a per-peer hub session ships the entries over the ordinary wire channel.

pub mod hub;
pub mod iter;
pub mod state;

pub use hub::{ReplicationHub, SessionState};
pub use iter::ModificationIterator;
pub use state::{ReplicationState, DIRTY_WORD_COUNT, MAX_MODIFICATION_ITERATORS};

use bincode::{Decode, Encode};

use crate::error::EngineError;

/// Wire class literals for typed payloads. Stable.
pub mod classes {
    pub const REPLICATION_ENTRY: &str = "ReplicationEntry";
    pub const BOOTSTRAP: &str = "Bootstrap";
}

/// One replicated change as shipped to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationEntry {
    pub key: Vec<u8>,
    /// Absent for tombstones.
    pub value: Option<Vec<u8>>,
    pub deleted: bool,
    pub timestamp: u64,
    /// Identifier of the node that produced the current value.
    pub identifier: u8,
    /// The timestamp the remote should bootstrap from after a disconnection.
    /// May be later than `timestamp`: entries do not leave in chronological
    /// order.
    pub bootstrap_timestamp: u64,
}

/// Bootstrap handshake payload, both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Bootstrap {
    pub identifier: u8,
    pub last_updated_time: u64,
}

/// The replication engine's only view of the data it replicates: apply a
/// remote change, read a current value. Keeps the engine ignorant of map
/// views, subscriptions and everything else above the store.
pub trait StoreAccess: Send + Sync + 'static {
    fn apply_change(&self, entry: &ReplicationEntry) -> Result<(), EngineError>;
    fn current_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;
}
