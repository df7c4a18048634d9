//! Per-key replication records and per-peer replication state.
//!
//! Records are stored in their own `KvBackend` keyed by the data key, updated
//! exclusively through compare-and-set loops; there is no global lock. The
//! encode scratch for the CAS loops is a fixed stack buffer, so the
//! steady-state path does not allocate for record updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bincode::{Decode, Encode};
use dashmap::DashMap;
use tracing::debug;

use crate::error::EngineError;
use crate::replication::iter::ModificationIterator;
use crate::replication::{ReplicationEntry, StoreAccess};
use crate::store::KvBackend;

/// Iterator identifiers above 127 are reserved for internal use.
pub const RESERVED_MOD_ITER: usize = 8;
pub const MAX_MODIFICATION_ITERATORS: usize = 127 + RESERVED_MOD_ITER;
/// One u64 word serves 64 dirty bits.
pub const DIRTY_WORD_COUNT: usize = (MAX_MODIFICATION_ITERATORS + 63) / 64;

const PEER_SLOTS: usize = 256;

/// Per-key replication metadata, persisted next to the data it describes.
/// Created on first write, superseded on every write, never removed:
/// tombstones must outlive their value for convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationRecord {
    pub deleted: bool,
    pub timestamp: u64,
    pub origin: u8,
    /// Bit `i` set ⇔ peer `i` has not yet been sent the current value.
    pub dirty: [u64; DIRTY_WORD_COUNT],
}

impl ReplicationRecord {
    pub const MAX_ENCODED: usize = 64;

    fn raise_all(&mut self) {
        self.dirty = [!0u64; DIRTY_WORD_COUNT];
    }

    pub fn set_dirty(&mut self, id: usize) {
        self.dirty[id / 64] |= 1 << (id % 64);
    }

    pub fn clear_dirty(&mut self, id: usize) {
        self.dirty[id / 64] &= !(1 << (id % 64));
    }

    pub fn is_dirty(&self, id: usize) -> bool {
        self.dirty[id / 64] & (1 << (id % 64)) != 0
    }

    pub fn encode_into<'b>(&self, buf: &'b mut [u8; Self::MAX_ENCODED]) -> Result<&'b [u8], EngineError> {
        let n = bincode::encode_into_slice(self, &mut buf[..], bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(&buf[..n])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(r, _)| r)
            .map_err(|e| EngineError::Codec(e.to_string()))
    }
}

/*──────────────────── atomic bit-sets ───────────────────*/

/// Word-level atomic bit-set sized for every possible iterator id.
pub(crate) struct AtomicBitSet {
    words: [AtomicU64; DIRTY_WORD_COUNT],
}

impl AtomicBitSet {
    fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn set(&self, id: usize) {
        self.words[id / 64].fetch_or(1 << (id % 64), Ordering::AcqRel);
    }

    /// Atomically clear; true when the bit was set.
    pub(crate) fn clear_if_set(&self, id: usize) -> bool {
        let bit = 1 << (id % 64);
        self.words[id / 64].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub(crate) fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut id = from;
        while id < DIRTY_WORD_COUNT * 64 {
            let word = self.words[id / 64].load(Ordering::Acquire) >> (id % 64);
            if word == 0 {
                id = (id / 64 + 1) * 64;
                continue;
            }
            return Some(id + word.trailing_zeros() as usize);
        }
        None
    }
}

/*──────────────────── per-peer slots ────────────────────*/

#[derive(Default)]
struct PeerSlot {
    /// Timestamp below which the peer has been told every change. 0 = unset.
    last_bootstrap_ts: AtomicU64,
    /// Candidate for promotion into `last_bootstrap_ts`. 0 = unset.
    next_bootstrap_ts: AtomicU64,
    /// Max timestamp of any change received *from* this peer. Monotone.
    last_modification_time: AtomicU64,
}

/// State shared between the store facade and its per-peer iterators.
pub(crate) struct ReplCore {
    pub(crate) identifier: u8,
    pub(crate) records: Arc<dyn KvBackend>,
    pub(crate) access: Arc<dyn StoreAccess>,
    peers: Vec<PeerSlot>,
    /// Peers with a live modification iterator.
    pub(crate) mod_iter_set: AtomicBitSet,
    /// Peers whose next local write must publish a bootstrap timestamp.
    pub(crate) needs_bootstrap: AtomicBitSet,
}

impl ReplCore {
    pub(crate) fn reset_next_bootstrap(&self, peer: u8) {
        self.peers[peer as usize]
            .next_bootstrap_ts
            .store(0, Ordering::Release);
    }

    pub(crate) fn reset_last_bootstrap(&self, peer: u8) {
        self.peers[peer as usize]
            .last_bootstrap_ts
            .store(0, Ordering::Release);
    }

    /// Publish the bootstrap candidate; false when one is already pending.
    fn publish_next_bootstrap(&self, peer: usize, ts: u64) -> bool {
        self.peers[peer]
            .next_bootstrap_ts
            .compare_exchange(0, ts, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The timestamp a peer should request replay from. Promotes the pending
    /// candidate when there is one.
    pub(crate) fn bootstrap_timestamp(&self, peer: u8) -> u64 {
        let slot = &self.peers[peer as usize];
        loop {
            let next = slot.next_bootstrap_ts.load(Ordering::Acquire);
            if next == 0 {
                return slot.last_bootstrap_ts.load(Ordering::Acquire);
            }
            if slot
                .next_bootstrap_ts
                .compare_exchange(next, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.last_bootstrap_ts.store(next, Ordering::Release);
                return next;
            }
        }
    }

    pub(crate) fn last_modification_time(&self, peer: u8) -> u64 {
        self.peers[peer as usize]
            .last_modification_time
            .load(Ordering::Acquire)
    }

    pub(crate) fn set_last_modification_time(&self, peer: u8, ts: u64) {
        let slot = &self.peers[peer as usize].last_modification_time;
        let mut cur = slot.load(Ordering::Acquire);
        while cur < ts {
            match slot.compare_exchange(cur, ts, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

/*──────────────────── the state store ───────────────────*/

pub struct ReplicationState {
    core: Arc<ReplCore>,
    iterators: DashMap<u8, Arc<ModificationIterator>>,
}

impl ReplicationState {
    pub fn new(
        identifier: u8,
        records: Arc<dyn KvBackend>,
        access: Arc<dyn StoreAccess>,
    ) -> Arc<Self> {
        Arc::new(ReplicationState {
            core: Arc::new(ReplCore {
                identifier,
                records,
                access,
                peers: (0..PEER_SLOTS).map(|_| PeerSlot::default()).collect(),
                mod_iter_set: AtomicBitSet::new(),
                needs_bootstrap: AtomicBitSet::new(),
            }),
            iterators: DashMap::new(),
        })
    }

    pub fn identifier(&self) -> u8 {
        self.core.identifier
    }

    pub fn on_put(&self, key: &[u8], timestamp: u64) -> Result<(), EngineError> {
        self.on_change(key, false, timestamp)
    }

    pub fn on_remove(&self, key: &[u8], timestamp: u64) -> Result<(), EngineError> {
        self.on_change(key, true, timestamp)
    }

    /// Record a local mutation: bump the key's record past its previous
    /// timestamp, raise every dirty bit, then nudge the per-peer iterators.
    fn on_change(&self, key: &[u8], deleted: bool, timestamp: u64) -> Result<(), EngineError> {
        let mut scratch = [0u8; ReplicationRecord::MAX_ENCODED];
        let stamp;
        loop {
            let current = self.core.records.get(key)?;
            let decoded = match &current {
                Some(bytes) => Some(ReplicationRecord::decode(bytes)?),
                None => None,
            };
            let prev_ts = decoded.map(|r| r.timestamp).unwrap_or(0);
            // Strictly increasing per key, even against a skewed clock.
            let ts = timestamp.max(prev_ts + 1);
            let mut rec = ReplicationRecord {
                deleted,
                timestamp: ts,
                origin: self.core.identifier,
                dirty: [0; DIRTY_WORD_COUNT],
            };
            rec.raise_all();
            let encoded = rec.encode_into(&mut scratch)?;
            let updated = match &current {
                None => self.core.records.put_if_absent(key, encoded)?.is_none(),
                Some(old) => self.core.records.replace_if_equal(key, old, encoded)?,
            };
            if updated {
                stamp = ts;
                break;
            }
        }

        let mut next = self.core.mod_iter_set.next_set_bit(0);
        while let Some(peer) = next {
            if let Some(it) = self.iterators.get(&(peer as u8)) {
                it.notify();
            }
            if self.core.needs_bootstrap.clear_if_set(peer) {
                if !self.core.publish_next_bootstrap(peer, stamp) {
                    return Err(EngineError::Assertion(
                        "bootstrap timestamp already published for peer",
                    ));
                }
            }
            next = self.core.mod_iter_set.next_set_bit(peer + 1);
        }
        Ok(())
    }

    /// Apply an entry received from a peer. Newer timestamp wins; equal
    /// timestamps go to the smaller origin identifier. Accepted entries are
    /// written with all dirty bits low: arrival is not a local change.
    pub fn apply_replication(&self, entry: &ReplicationEntry) -> Result<(), EngineError> {
        let mut scratch = [0u8; ReplicationRecord::MAX_ENCODED];
        loop {
            let current = self.core.records.get(&entry.key)?;
            let decoded = match &current {
                Some(bytes) => Some(ReplicationRecord::decode(bytes)?),
                None => None,
            };
            let accept = match decoded {
                None => true,
                Some(local) => {
                    entry.timestamp > local.timestamp
                        || (entry.timestamp == local.timestamp
                            && entry.identifier <= local.origin)
                }
            };
            if !accept {
                debug!(
                    origin = entry.identifier,
                    ts = entry.timestamp,
                    "replication entry lost the conflict"
                );
                break;
            }
            let rec = ReplicationRecord {
                deleted: entry.deleted,
                timestamp: entry.timestamp,
                origin: entry.identifier,
                dirty: [0; DIRTY_WORD_COUNT],
            };
            let encoded = rec.encode_into(&mut scratch)?;
            let updated = match &current {
                None => self.core.records.put_if_absent(&entry.key, encoded)?.is_none(),
                Some(old) => self.core.records.replace_if_equal(&entry.key, old, encoded)?,
            };
            if updated {
                self.core.access.apply_change(entry)?;
                break;
            }
        }
        self.core
            .set_last_modification_time(entry.identifier, entry.timestamp);
        Ok(())
    }

    /// Lazily construct the per-peer iterator; idempotent and concurrent-safe.
    pub fn acquire_modification_iterator(
        &self,
        peer: u8,
    ) -> Result<Arc<ModificationIterator>, EngineError> {
        if peer as usize >= MAX_MODIFICATION_ITERATORS {
            return Err(EngineError::ProtocolViolation(format!(
                "peer identifier {peer} out of range"
            )));
        }
        let it = self
            .iterators
            .entry(peer)
            .or_insert_with(|| {
                self.core.needs_bootstrap.set(peer as usize);
                self.core.reset_next_bootstrap(peer);
                self.core.reset_last_bootstrap(peer);
                let it = Arc::new(ModificationIterator::new(self.core.clone(), peer));
                self.core.mod_iter_set.set(peer as usize);
                it
            })
            .clone();
        Ok(it)
    }

    pub fn last_modification_time(&self, peer: u8) -> u64 {
        self.core.last_modification_time(peer)
    }

    pub fn set_last_modification_time(&self, peer: u8, ts: u64) {
        self.core.set_last_modification_time(peer, ts)
    }

    pub fn bootstrap_timestamp(&self, peer: u8) -> u64 {
        self.core.bootstrap_timestamp(peer)
    }
}
