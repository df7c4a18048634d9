//! Per-peer modification iterator: a lazy cursor over the keys whose dirty
//! bit for that peer is raised. Entries are delivered at least once and not
//! in timestamp order; the receiver's conflict rule restores convergence.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::EngineError;
use crate::replication::state::{ReplCore, ReplicationRecord};
use crate::replication::ReplicationEntry;

pub type ModificationNotifier = Arc<dyn Fn() + Send + Sync>;

pub struct ModificationIterator {
    core: Arc<ReplCore>,
    peer: u8,
    notifier: Mutex<Option<ModificationNotifier>>,
}

impl ModificationIterator {
    pub(crate) fn new(core: Arc<ReplCore>, peer: u8) -> Self {
        ModificationIterator {
            core,
            peer,
            notifier: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> u8 {
        self.peer
    }

    /// Hook invoked after every dirty-bit raise for this peer, so the pump
    /// wakes without polling.
    pub fn set_modification_notifier(&self, notifier: ModificationNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    pub(crate) fn notify(&self) {
        if let Some(n) = self.notifier.lock().unwrap().as_ref() {
            n();
        }
    }

    /// Present every dirty entry to the consumer, clearing the bit after
    /// each delivery. A drain that found nothing flags the peer as needing a
    /// fresh bootstrap timestamp on the next local write.
    pub fn for_each(
        &self,
        consumer: &mut dyn FnMut(&ReplicationEntry) -> Result<(), EngineError>,
    ) -> Result<u64, EngineError> {
        let mut emitted = 0u64;
        let mut scratch = [0u8; ReplicationRecord::MAX_ENCODED];
        for key in self.core.records.keys()? {
            let Some(bytes) = self.core.records.get(&key)? else {
                continue;
            };
            let rec = ReplicationRecord::decode(&bytes)?;
            if !rec.is_dirty(self.peer as usize) {
                continue;
            }
            let entry = ReplicationEntry {
                value: if rec.deleted {
                    None
                } else {
                    self.core.access.current_value(&key)?
                },
                key,
                deleted: rec.deleted,
                timestamp: rec.timestamp,
                identifier: rec.origin,
                bootstrap_timestamp: self.core.bootstrap_timestamp(self.peer),
            };
            consumer(&entry)?;
            let mut cleared = rec;
            cleared.clear_dirty(self.peer as usize);
            let encoded = cleared.encode_into(&mut scratch)?;
            if !self.core.records.replace_if_equal(&entry.key, &bytes, encoded)? {
                // The consumer already saw this entry; losing the record now
                // would un-deliver it.
                return Err(EngineError::Assertion(
                    "record changed under for_each after delivery",
                ));
            }
            emitted += 1;
        }
        trace!(peer = self.peer, emitted, "modification drain");
        if emitted == 0 {
            self.core.needs_bootstrap.set(self.peer as usize);
            self.core.reset_next_bootstrap(self.peer);
        }
        Ok(emitted)
    }

    /// Side-effect-free scan for any dirty entry. O(keys).
    pub fn has_next(&self) -> Result<bool, EngineError> {
        for key in self.core.records.keys()? {
            if let Some(bytes) = self.core.records.get(&key)? {
                if ReplicationRecord::decode(&bytes)?.is_dirty(self.peer as usize) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Re-raise this peer's dirty bit on every record stamped at or after
    /// `from_ts`. Used to resend anything a reconnecting peer may have
    /// missed.
    pub fn dirty_entries(&self, from_ts: u64) -> Result<(), EngineError> {
        let mut scratch = [0u8; ReplicationRecord::MAX_ENCODED];
        for key in self.core.records.keys()? {
            loop {
                let Some(bytes) = self.core.records.get(&key)? else {
                    break;
                };
                let rec = ReplicationRecord::decode(&bytes)?;
                if rec.timestamp < from_ts {
                    break;
                }
                let mut raised = rec;
                raised.set_dirty(self.peer as usize);
                let encoded = raised.encode_into(&mut scratch)?;
                if self.core.records.replace_if_equal(&key, &bytes, encoded)? {
                    break;
                }
                // Raced with a concurrent write; reload and retry this key.
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::state::{ReplicationState, MAX_MODIFICATION_ITERATORS};
    use crate::replication::StoreAccess;
    use crate::store::{KvBackend, MemBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Plain(Arc<dyn KvBackend>);
    impl StoreAccess for Plain {
        fn apply_change(&self, entry: &ReplicationEntry) -> Result<(), EngineError> {
            if entry.deleted {
                self.0.remove(&entry.key)?;
            } else {
                self.0
                    .insert(&entry.key, entry.value.as_deref().unwrap_or_default())?;
            }
            Ok(())
        }
        fn current_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
            self.0.get(key)
        }
    }

    fn fixture(id: u8) -> (Arc<ReplicationState>, Arc<dyn KvBackend>) {
        let data: Arc<dyn KvBackend> = MemBackend::new();
        let state = ReplicationState::new(id, MemBackend::new(), Arc::new(Plain(data.clone())));
        (state, data)
    }

    fn drain(it: &ModificationIterator) -> Vec<ReplicationEntry> {
        let mut out = Vec::new();
        it.for_each(&mut |e| {
            out.push(e.clone());
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn drain_clears_bits_for_this_peer_only() {
        let (state, data) = fixture(1);
        let it2 = state.acquire_modification_iterator(2).unwrap();
        let it3 = state.acquire_modification_iterator(3).unwrap();

        data.insert(b"k", b"v").unwrap();
        state.on_put(b"k", 10).unwrap();

        assert!(it2.has_next().unwrap());
        let seen = drain(&it2);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, b"k");
        assert_eq!(seen[0].value.as_deref(), Some(&b"v"[..]));
        assert!(!it2.has_next().unwrap());
        // Peer 3 still owes this entry.
        assert!(it3.has_next().unwrap());
        assert_eq!(drain(&it3).len(), 1);
    }

    #[test]
    fn tombstones_are_delivered_without_a_value() {
        let (state, _data) = fixture(1);
        let it = state.acquire_modification_iterator(2).unwrap();
        state.on_remove(b"gone", 44).unwrap();
        let seen = drain(&it);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].deleted);
        assert_eq!(seen[0].value, None);
        assert_eq!(seen[0].timestamp, 44);
    }

    #[test]
    fn empty_drain_rearms_the_bootstrap_timestamp() {
        let (state, _) = fixture(1);
        let it = state.acquire_modification_iterator(2).unwrap();
        state.on_put(b"k", 10).unwrap();
        drain(&it);
        // Promote whatever the first write published.
        let first = state.bootstrap_timestamp(2);
        assert!(first >= 10);
        // An empty drain arms the flag again: the next write re-publishes.
        assert_eq!(drain(&it).len(), 0);
        state.on_put(b"k", 50).unwrap();
        assert_eq!(state.bootstrap_timestamp(2), 50);
    }

    #[test]
    fn dirty_entries_re_raises_from_timestamp() {
        let (state, data) = fixture(1);
        let it = state.acquire_modification_iterator(2).unwrap();
        for (key, ts) in [(b"a", 100u64), (b"b", 200), (b"c", 300)] {
            data.insert(key, b"x").unwrap();
            state.on_put(key, ts).unwrap();
        }
        drain(&it);
        assert!(!it.has_next().unwrap());

        it.dirty_entries(200).unwrap();
        let keys: Vec<_> = drain(&it).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn notifier_fires_on_every_raise() {
        let (state, _) = fixture(1);
        let it = state.acquire_modification_iterator(2).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        it.set_modification_notifier(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        state.on_put(b"a", 1).unwrap();
        state.on_put(b"b", 2).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn every_active_peer_sees_a_change_at_least_once() {
        let (state, data) = fixture(1);
        let peers: Vec<u8> = vec![0, 7, 63, 64, (MAX_MODIFICATION_ITERATORS - 1) as u8];
        let iters: Vec<_> = peers
            .iter()
            .map(|p| state.acquire_modification_iterator(*p).unwrap())
            .collect();
        data.insert(b"k", b"v").unwrap();
        state.on_put(b"k", 5).unwrap();
        for it in &iters {
            assert_eq!(drain(it).len(), 1, "peer {} missed the change", it.peer());
        }
    }
}
