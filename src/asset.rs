//! A minimal asset tree: each path names an asset carrying a byte-oriented
//! map view, its map-event subscription hub, a topic hub and the replication
//! state for the map. The wire dispatcher selects one of these through the
//! CSP's `view` parameter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::replication::{ReplicationEntry, ReplicationState, StoreAccess};
use crate::store::{KvBackend, MemBackend};

/*──────────────────────── map events ────────────────────*/

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapEvent {
    Insert {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Update {
        key: Vec<u8>,
        old_value: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        key: Vec<u8>,
        old_value: Vec<u8>,
    },
}

impl MapEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            MapEvent::Insert { key, .. }
            | MapEvent::Update { key, .. }
            | MapEvent::Remove { key, .. } => key,
        }
    }

    fn from_write(key: &[u8], old: Option<Vec<u8>>, new: &[u8]) -> MapEvent {
        match old {
            None => MapEvent::Insert {
                key: key.to_vec(),
                value: new.to_vec(),
            },
            Some(old_value) => MapEvent::Update {
                key: key.to_vec(),
                old_value,
                value: new.to_vec(),
            },
        }
    }
}

/*──────────────────────── hubs ──────────────────────────*/

/// Listener outcome: `false` drops the listener (dead channel, invalid
/// subscriber).
pub type MapEventFn = Arc<dyn Fn(&MapEvent) -> bool + Send + Sync>;
pub type TopicFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionHub {
    next: AtomicU64,
    listeners: Mutex<HashMap<u64, MapEventFn>>,
}

impl SubscriptionHub {
    pub fn register(&self, f: MapEventFn) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(token, f);
        token
    }

    pub fn unregister(&self, token: u64) -> bool {
        self.listeners.lock().unwrap().remove(&token).is_some()
    }

    pub fn publish(&self, event: &MapEvent) {
        let snapshot: Vec<(u64, MapEventFn)> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(t, f)| (*t, f.clone()))
            .collect();
        for (token, f) in snapshot {
            if !f(event) {
                debug!(token, "map subscriber invalid, removing");
                self.listeners.lock().unwrap().remove(&token);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct TopicHub {
    next: AtomicU64,
    listeners: Mutex<HashMap<u64, TopicFn>>,
}

impl TopicHub {
    pub fn register(&self, f: TopicFn) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(token, f);
        token
    }

    pub fn unregister(&self, token: u64) -> bool {
        self.listeners.lock().unwrap().remove(&token).is_some()
    }

    pub fn publish(&self, topic: &[u8], message: &[u8]) {
        let snapshot: Vec<(u64, TopicFn)> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(t, f)| (*t, f.clone()))
            .collect();
        for (token, f) in snapshot {
            if !f(topic, message) {
                debug!(token, "topic subscriber invalid, removing");
                self.listeners.lock().unwrap().remove(&token);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

/*──────────────────────── map view ──────────────────────*/

/// Byte-oriented map over a `KvBackend`. Every local mutation fires a map
/// event and records itself with the replication state; changes arriving
/// *from* replication go through `StoreAccess` instead and skip the record.
pub struct MapView {
    store: Arc<dyn KvBackend>,
    subscriptions: Arc<SubscriptionHub>,
    replication: Arc<ReplicationState>,
    clock: Arc<dyn Clock>,
}

impl MapView {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.store.get(key)
    }

    /// Insert or overwrite; returns the prior value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let old = self.store.insert(key, value)?;
        self.subscriptions
            .publish(&MapEvent::from_write(key, old.clone(), value));
        self.replication.on_put(key, self.clock.now())?;
        Ok(old)
    }

    /// Returns the prior value, `None` if the key was absent.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let old = self.store.remove(key)?;
        if let Some(old_value) = &old {
            self.subscriptions.publish(&MapEvent::Remove {
                key: key.to_vec(),
                old_value: old_value.clone(),
            });
            self.replication.on_remove(key, self.clock.now())?;
        }
        Ok(old)
    }

    /// Returns the existing value when present, `None` after inserting.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let existing = self.store.put_if_absent(key, value)?;
        if existing.is_none() {
            self.subscriptions.publish(&MapEvent::Insert {
                key: key.to_vec(),
                value: value.to_vec(),
            });
            self.replication.on_put(key, self.clock.now())?;
        }
        Ok(existing)
    }

    /// Overwrite only when present; returns the replaced value.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        loop {
            let Some(old) = self.store.get(key)? else {
                return Ok(None);
            };
            if self.store.replace_if_equal(key, &old, value)? {
                self.subscriptions.publish(&MapEvent::Update {
                    key: key.to_vec(),
                    old_value: old.clone(),
                    value: value.to_vec(),
                });
                self.replication.on_put(key, self.clock.now())?;
                return Ok(Some(old));
            }
        }
    }

    pub fn replace_if_equal(
        &self,
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, EngineError> {
        let swapped = self.store.replace_if_equal(key, expected, value)?;
        if swapped {
            self.subscriptions.publish(&MapEvent::Update {
                key: key.to_vec(),
                old_value: expected.to_vec(),
                value: value.to_vec(),
            });
            self.replication.on_put(key, self.clock.now())?;
        }
        Ok(swapped)
    }

    pub fn remove_if_equal(&self, key: &[u8], expected: &[u8]) -> Result<bool, EngineError> {
        let removed = self.store.remove_if_equal(key, expected)?;
        if removed {
            self.subscriptions.publish(&MapEvent::Remove {
                key: key.to_vec(),
                old_value: expected.to_vec(),
            });
            self.replication.on_remove(key, self.clock.now())?;
        }
        Ok(removed)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, EngineError> {
        Ok(self.store.get(key)?.is_some())
    }

    pub fn contains_value(&self, value: &[u8]) -> Result<bool, EngineError> {
        let mut found = false;
        self.store.for_each(&mut |_, v| {
            found |= v == value;
            Ok(())
        })?;
        Ok(found)
    }

    pub fn len(&self) -> Result<u64, EngineError> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        self.store.is_empty()
    }

    /// Remove every entry one by one, so events and replication both see
    /// each removal.
    pub fn clear(&self) -> Result<(), EngineError> {
        for key in self.store.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>, EngineError> {
        self.store.keys()
    }

    pub fn for_each(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        self.store.for_each(f)
    }
}

/// The replication engine's entry point into a map: applies remote changes
/// to the store and fires map events, without re-recording the change.
struct MapStoreAccess {
    store: Arc<dyn KvBackend>,
    subscriptions: Arc<SubscriptionHub>,
}

impl StoreAccess for MapStoreAccess {
    fn apply_change(&self, entry: &ReplicationEntry) -> Result<(), EngineError> {
        if entry.deleted {
            if let Some(old_value) = self.store.remove(&entry.key)? {
                self.subscriptions.publish(&MapEvent::Remove {
                    key: entry.key.clone(),
                    old_value,
                });
            }
        } else {
            let value = entry.value.as_deref().ok_or(EngineError::ProtocolViolation(
                "replication entry without value".into(),
            ))?;
            let old = self.store.insert(&entry.key, value)?;
            self.subscriptions
                .publish(&MapEvent::from_write(&entry.key, old, value));
        }
        Ok(())
    }

    fn current_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.store.get(key)
    }
}

/*──────────────────────── assets ────────────────────────*/

pub struct Asset {
    path: String,
    map: Arc<MapView>,
    subscriptions: Arc<SubscriptionHub>,
    topics: Arc<TopicHub>,
    replication: Arc<ReplicationState>,
}

impl Asset {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn map(&self) -> &Arc<MapView> {
        &self.map
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionHub> {
        &self.subscriptions
    }

    pub fn topics(&self) -> &Arc<TopicHub> {
        &self.topics
    }

    pub fn replication(&self) -> &Arc<ReplicationState> {
        &self.replication
    }
}

pub type StoreFactory =
    dyn Fn(&str) -> Result<Arc<dyn KvBackend>, EngineError> + Send + Sync + 'static;

/// Registry of assets, keyed by path. Assets are created on first acquire
/// and live for the lifetime of the tree.
pub struct AssetTree {
    identifier: u8,
    clock: Arc<dyn Clock>,
    factory: Box<StoreFactory>,
    assets: Mutex<HashMap<String, Arc<Asset>>>,
}

impl AssetTree {
    /// In-memory tree; node identifiers are one byte, unique per replica set.
    pub fn new(identifier: u8, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_store_factory(identifier, clock, Box::new(|_| Ok(MemBackend::new())))
    }

    /// The factory is called twice per asset: once for the data store and
    /// once (with a `#replication` suffix) for its replication records.
    pub fn with_store_factory(
        identifier: u8,
        clock: Arc<dyn Clock>,
        factory: Box<StoreFactory>,
    ) -> Arc<Self> {
        Arc::new(AssetTree {
            identifier,
            clock,
            factory,
            assets: Mutex::new(HashMap::new()),
        })
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn acquire(&self, path: &str) -> Result<Arc<Asset>, EngineError> {
        if let Some(asset) = self.assets.lock().unwrap().get(path) {
            return Ok(asset.clone());
        }
        // Build outside the registry lock; racing acquirers keep the first.
        let store = (self.factory)(path)?;
        let records = (self.factory)(&format!("{path}#replication"))?;
        let subscriptions = Arc::new(SubscriptionHub::default());
        let replication = ReplicationState::new(
            self.identifier,
            records,
            Arc::new(MapStoreAccess {
                store: store.clone(),
                subscriptions: subscriptions.clone(),
            }),
        );
        let asset = Arc::new(Asset {
            path: path.to_owned(),
            map: Arc::new(MapView {
                store,
                subscriptions: subscriptions.clone(),
                replication: replication.clone(),
                clock: self.clock.clone(),
            }),
            subscriptions,
            topics: Arc::new(TopicHub::default()),
            replication,
        });
        let mut assets = self.assets.lock().unwrap();
        let entry = assets.entry(path.to_owned()).or_insert_with(|| {
            info!(path, "asset created");
            asset
        });
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Mutex as StdMutex;

    fn tree() -> Arc<AssetTree> {
        AssetTree::new(1, Arc::new(MockClock::new(1_000)))
    }

    fn collect_events(hub: &SubscriptionHub) -> Arc<StdMutex<Vec<MapEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        hub.register(Arc::new(move |e: &MapEvent| {
            sink.lock().unwrap().push(e.clone());
            true
        }));
        events
    }

    #[test]
    fn put_fires_insert_then_update() {
        let tree = tree();
        let asset = tree.acquire("/m").unwrap();
        let events = collect_events(asset.subscriptions());

        asset.map().put(b"x", b"1").unwrap();
        asset.map().put(b"x", b"2").unwrap();

        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                MapEvent::Insert {
                    key: b"x".to_vec(),
                    value: b"1".to_vec()
                },
                MapEvent::Update {
                    key: b"x".to_vec(),
                    old_value: b"1".to_vec(),
                    value: b"2".to_vec()
                },
            ]
        );
    }

    #[test]
    fn mutations_land_in_replication_records() {
        let tree = tree();
        let asset = tree.acquire("/m").unwrap();
        let it = asset.replication().acquire_modification_iterator(2).unwrap();
        asset.map().put(b"k", b"v").unwrap();
        asset.map().remove(b"k").unwrap();
        let mut seen = Vec::new();
        it.for_each(&mut |e| {
            seen.push((e.key.clone(), e.deleted));
            Ok(())
        })
        .unwrap();
        // Latest state only: the remove superseded the put.
        assert_eq!(seen, vec![(b"k".to_vec(), true)]);
    }

    #[test]
    fn conditional_ops_fire_events_only_on_success() {
        let tree = tree();
        let asset = tree.acquire("/m").unwrap();
        let map = asset.map();
        let events = collect_events(asset.subscriptions());

        assert_eq!(map.put_if_absent(b"k", b"1").unwrap(), None);
        assert_eq!(map.put_if_absent(b"k", b"2").unwrap(), Some(b"1".to_vec()));
        assert!(!map.replace_if_equal(b"k", b"wrong", b"3").unwrap());
        assert!(map.replace_if_equal(b"k", b"1", b"3").unwrap());
        assert_eq!(map.replace(b"missing", b"x").unwrap(), None);
        assert!(!map.remove_if_equal(b"k", b"wrong").unwrap());
        assert!(map.remove_if_equal(b"k", b"3").unwrap());

        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[test]
    fn dead_listeners_are_dropped() {
        let tree = tree();
        let asset = tree.acquire("/m").unwrap();
        asset.subscriptions().register(Arc::new(|_| false));
        assert_eq!(asset.subscriptions().count(), 1);
        asset.map().put(b"k", b"v").unwrap();
        assert_eq!(asset.subscriptions().count(), 0);
    }

    #[test]
    fn acquire_is_idempotent() {
        let tree = tree();
        let a = tree.acquire("/m").unwrap();
        let b = tree.acquire("/m").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = tree.acquire("/other").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
