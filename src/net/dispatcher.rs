//! Per-connection demultiplex of inbound data documents. The event name is
//! parsed once into `EventId`; the CSP's view selects the handler family.
//! Unknown events and null arguments are protocol violations: logged, reply
//! omitted, connection kept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::asset::{Asset, SubscriptionHub, TopicHub};
use crate::csp::{views, Csp, CidTable};
use crate::error::EngineError;
use crate::event_loop::{EventHandler, HandlerDropped};
use crate::net::server::{ConnPublisher, EngineServer};
use crate::net::{SetProxy, SET_PROXY_CLASS};
use crate::replication::{classes, Bootstrap, ModificationIterator, ReplicationEntry};
use crate::wire::{fields, Document, WireEvent, WireValue};

/*──────────────────────── event catalogue ───────────────*/

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventId {
    // map view
    Put,
    Remove,
    PutAll,
    Get,
    GetAndPut,
    GetAndRemove,
    PutIfAbsent,
    Replace,
    ReplaceForOld,
    RemoveWithValue,
    ContainsKey,
    ContainsValue,
    Size,
    Clear,
    KeySet,
    Values,
    EntrySet,
    // collection views
    IsEmpty,
    Contains,
    // subscriptions
    RegisterSubscriber,
    UnRegisterSubscriber,
    KeySubscriberCount,
    EntrySubscriberCount,
    TopicSubscriberCount,
    // topic publisher
    Publish,
    RegisterTopicSubscriber,
    OnEndOfSubscription,
    // system
    Userid,
    Heartbeat,
    HeartbeatReply,
    // replication (misspellings are wire-stable)
    Identifier,
    IdentifierReply,
    Bootstap,
    BootstrapReply,
    ReplicationSubscribe,
    ReplicationEvent,
    ReplicactionReply,
}

impl EventId {
    pub fn parse(name: &str) -> Option<EventId> {
        use EventId::*;
        Some(match name {
            "put" => Put,
            "remove" => Remove,
            "putAll" => PutAll,
            "get" => Get,
            "getAndPut" => GetAndPut,
            "getAndRemove" => GetAndRemove,
            "putIfAbsent" => PutIfAbsent,
            "replace" => Replace,
            "replaceForOld" => ReplaceForOld,
            "removeWithValue" => RemoveWithValue,
            "containsKey" => ContainsKey,
            "containsValue" => ContainsValue,
            "size" => Size,
            "clear" => Clear,
            "keySet" => KeySet,
            "values" => Values,
            "entrySet" => EntrySet,
            "isEmpty" => IsEmpty,
            "contains" => Contains,
            "registerSubscriber" => RegisterSubscriber,
            "unRegisterSubscriber" => UnRegisterSubscriber,
            "keySubscriberCount" => KeySubscriberCount,
            "entrySubscriberCount" => EntrySubscriberCount,
            "topicSubscriberCount" => TopicSubscriberCount,
            "publish" => Publish,
            "registerTopicSubscriber" => RegisterTopicSubscriber,
            "onEndOfSubscription" => OnEndOfSubscription,
            "userid" => Userid,
            "heartbeat" => Heartbeat,
            "heartbeatReply" => HeartbeatReply,
            "identifier" => Identifier,
            "identifierReply" => IdentifierReply,
            "bootstap" => Bootstap,
            "bootstrapReply" => BootstrapReply,
            "replicationSubscribe" => ReplicationSubscribe,
            "replicationEvent" => ReplicationEvent,
            "replicactionReply" => ReplicactionReply,
            _ => return None,
        })
    }
}

/*──────────────────────── helpers ───────────────────────*/

fn violation(what: impl Into<String>) -> EngineError {
    EngineError::ProtocolViolation(what.into())
}

fn require_bytes<'a>(value: Option<&'a WireValue>, what: &str) -> Result<&'a [u8], EngineError> {
    match value {
        Some(WireValue::Bytes(b)) => Ok(b),
        _ => Err(violation(format!("{what} must be non-null bytes"))),
    }
}

fn require_fields<'a>(event: &'a WireEvent) -> Result<&'a Document, EngineError> {
    event
        .value
        .as_fields()
        .ok_or_else(|| violation(format!("{} expects named parameters", event.name)))
}

fn opt_bytes(value: Option<Vec<u8>>) -> WireValue {
    match value {
        Some(b) => WireValue::Bytes(b),
        None => WireValue::Null,
    }
}

/*──────────────────────── connection state ──────────────*/

struct Resolved {
    csp: Csp,
    asset: Arc<Asset>,
}

/// All dispatcher state for one connection. Lives on the read task.
pub(crate) struct Conn {
    server: Arc<EngineServer>,
    publisher: Arc<ConnPublisher>,
    peer: SocketAddr,
    cids: CidTable,
    tid: i64,
    system: bool,
    resolved: Option<Resolved>,
    last_uri: String,
    user: Option<String>,
    map_subs: HashMap<u64, (Arc<SubscriptionHub>, u64)>,
    topic_subs: HashMap<u64, (Arc<TopicHub>, u64)>,
    /// Bootstrap payloads received on this connection, by remote identifier.
    bootstraps: HashMap<u8, Bootstrap>,
    /// Close flags of replication pumps started by this connection.
    pumps: Vec<Arc<AtomicBool>>,
}

impl Conn {
    pub(crate) fn new(
        server: Arc<EngineServer>,
        publisher: Arc<ConnPublisher>,
        peer: SocketAddr,
    ) -> Conn {
        Conn {
            server,
            publisher,
            peer,
            cids: CidTable::new(),
            tid: -1,
            system: true,
            resolved: None,
            last_uri: String::new(),
            user: None,
            map_subs: HashMap::new(),
            topic_subs: HashMap::new(),
            bootstraps: HashMap::new(),
            pumps: Vec::new(),
        }
    }

    /// Meta documents carry `tid` and address the following data document by
    /// `csp` or `cid`; neither marks system traffic.
    pub(crate) fn on_meta(&mut self, doc: &Document) {
        self.tid = doc.get_i64(fields::TID).unwrap_or(-1);
        let uri: Option<String> = match (doc.get_text(fields::CSP), doc.get_i64(fields::CID)) {
            (Some(csp), _) => Some(csp.to_owned()),
            (None, Some(cid)) => match self.cids.resolve(cid as u64) {
                Some(uri) => Some(uri.to_owned()),
                None => {
                    warn!(peer = %self.peer, cid, "unknown cid in meta data");
                    self.system = false;
                    self.resolved = None;
                    self.last_uri.clear();
                    return;
                }
            },
            (None, None) => None,
        };
        match uri {
            None => {
                self.system = true;
            }
            Some(uri) => {
                self.system = false;
                if uri != self.last_uri {
                    self.resolved = None;
                    match Csp::parse(&uri) {
                        Ok(csp) => match self.server.tree().acquire(&csp.path) {
                            Ok(asset) => {
                                self.cids.bind(&uri);
                                self.resolved = Some(Resolved { csp, asset });
                                self.last_uri = uri;
                            }
                            Err(e) => {
                                warn!(peer = %self.peer, %uri, error = %e, "asset acquire failed")
                            }
                        },
                        Err(e) => warn!(peer = %self.peer, %uri, error = %e, "bad csp"),
                    }
                }
            }
        }
    }

    pub(crate) fn on_data(&mut self, doc: &Document) -> Result<(), EngineError> {
        if self.system {
            return self.system_event(doc);
        }
        let first = doc.first().ok_or_else(|| violation("empty data document"))?;
        let event = EventId::parse(&first.name)
            .ok_or_else(|| violation(format!("unknown event {}", first.name)))?;
        let resolved = self
            .resolved
            .as_ref()
            .ok_or_else(|| violation("data document without a resolved csp"))?;

        match resolved.csp.view.as_str() {
            views::MAP => self.map_event(event, first),
            views::KEY_SET | views::ENTRY_SET | views::VALUES => self.collection_event(event, first),
            views::TOPIC_PUBLISHER => self.topic_event(event, first),
            views::REPLICATION => self.replication_event(event, first),
            other => Err(violation(format!("unsupported view {other}"))),
        }
    }

    /// Tear down everything this connection registered elsewhere.
    pub(crate) fn cleanup(&mut self) {
        debug!(
            peer = %self.peer,
            user = self.user.as_deref().unwrap_or("-"),
            map_subs = self.map_subs.len(),
            topic_subs = self.topic_subs.len(),
            pumps = self.pumps.len(),
            "session torn down"
        );
        for (_, (hub, token)) in self.map_subs.drain() {
            hub.unregister(token);
        }
        for (_, (hub, token)) in self.topic_subs.drain() {
            hub.unregister(token);
        }
        for closed in self.pumps.drain(..) {
            closed.store(true, Ordering::Release);
        }
    }

    fn tid(&self) -> Result<u64, EngineError> {
        u64::try_from(self.tid).map_err(|_| violation("data document without a tid"))
    }

    fn resolved(&self) -> (&Csp, &Arc<Asset>) {
        let r = self.resolved.as_ref().expect("checked in on_data");
        (&r.csp, &r.asset)
    }

    /*──────── system ────────*/

    fn system_event(&mut self, doc: &Document) -> Result<(), EngineError> {
        let first = doc.first().ok_or_else(|| violation("empty system document"))?;
        match EventId::parse(&first.name) {
            Some(EventId::Userid) => {
                let user = first
                    .value
                    .as_text()
                    .ok_or_else(|| violation("userid must be text"))?;
                info!(peer = %self.peer, user, "session opened");
                self.user = Some(user.to_owned());
                Ok(())
            }
            Some(EventId::Heartbeat) => {
                let ts = first.value.as_i64().unwrap_or_default();
                let tid = self.tid.max(0) as u64;
                self.publisher.push_doc(
                    tid,
                    &Document::new().with("heartbeatReply", WireValue::I64(ts)),
                    true,
                );
                Ok(())
            }
            Some(EventId::HeartbeatReply) => {
                debug!(peer = %self.peer, "heartbeat reply");
                Ok(())
            }
            _ => Err(violation(format!("unknown system event {}", first.name))),
        }
    }

    /*──────── map view ──────*/

    fn map_event(&mut self, event: EventId, first: &WireEvent) -> Result<(), EngineError> {
        let (csp, asset) = {
            let (csp, asset) = self.resolved();
            (csp.clone(), asset.clone())
        };
        let map = asset.map();
        match event {
            // Fire-and-forget mutations: no reply document at all.
            EventId::Put => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let value = require_bytes(params.get(fields::VALUE), "value")?;
                map.put(key, value)?;
                Ok(())
            }
            EventId::Remove => {
                let key = require_bytes(Some(&first.value), "key")?;
                map.remove(key)?;
                Ok(())
            }
            EventId::PutAll => {
                let entries = first
                    .value
                    .as_sequence()
                    .ok_or_else(|| violation("putAll expects a sequence"))?;
                for item in entries {
                    let params = item
                        .as_fields()
                        .ok_or_else(|| violation("putAll entry must be named parameters"))?;
                    let key = require_bytes(params.get(fields::KEY), "key")?;
                    let value = require_bytes(params.get(fields::VALUE), "value")?;
                    map.put(key, value)?;
                }
                Ok(())
            }

            EventId::Get => {
                let key = require_bytes(Some(&first.value), "key")?;
                let value = map.get(key)?;
                self.reply(opt_bytes(value))
            }
            EventId::GetAndPut => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let value = require_bytes(params.get(fields::VALUE), "value")?;
                let old = map.put(key, value)?;
                let reply = if csp.put_returns_null {
                    WireValue::Null
                } else {
                    opt_bytes(old)
                };
                self.reply(reply)
            }
            EventId::GetAndRemove => {
                let key = require_bytes(Some(&first.value), "key")?;
                let old = map.remove(key)?;
                let reply = if csp.remove_returns_null {
                    WireValue::Null
                } else {
                    opt_bytes(old)
                };
                self.reply(reply)
            }
            EventId::PutIfAbsent => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let value = require_bytes(params.get(fields::VALUE), "value")?;
                let existing = map.put_if_absent(key, value)?;
                self.reply(opt_bytes(existing))
            }
            EventId::Replace => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let value = require_bytes(params.get(fields::VALUE), "value")?;
                let old = map.replace(key, value)?;
                self.reply(opt_bytes(old))
            }
            EventId::ReplaceForOld => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let old_value = require_bytes(params.get(fields::OLD_VALUE), "oldValue")?;
                let new_value = require_bytes(params.get(fields::NEW_VALUE), "newValue")?;
                let swapped = map.replace_if_equal(key, old_value, new_value)?;
                self.reply(WireValue::Bool(swapped))
            }
            EventId::RemoveWithValue => {
                let params = require_fields(first)?;
                let key = require_bytes(params.get(fields::KEY), "key")?;
                let value = require_bytes(params.get(fields::VALUE), "value")?;
                let removed = map.remove_if_equal(key, value)?;
                self.reply(WireValue::Bool(removed))
            }
            EventId::ContainsKey => {
                let key = require_bytes(Some(&first.value), "key")?;
                let b = map.contains_key(key)?;
                self.reply(WireValue::Bool(b))
            }
            EventId::ContainsValue => {
                let value = require_bytes(Some(&first.value), "value")?;
                let b = map.contains_value(value)?;
                self.reply(WireValue::Bool(b))
            }
            EventId::Size => self.reply(WireValue::I64(map.len()? as i64)),
            EventId::Clear => {
                map.clear()?;
                self.reply(WireValue::Null)
            }

            EventId::KeySet => self.set_proxy(&csp, views::KEY_SET),
            EventId::Values => self.set_proxy(&csp, views::VALUES),
            EventId::EntrySet => self.set_proxy(&csp, views::ENTRY_SET),

            EventId::RegisterSubscriber => self.register_subscriber(&csp, &asset),
            EventId::UnRegisterSubscriber => self.unregister_subscriber(),
            EventId::KeySubscriberCount | EventId::EntrySubscriberCount => {
                let n = asset.subscriptions().count().min(i8::MAX as usize) as i8;
                self.reply(WireValue::I8(n))
            }
            EventId::TopicSubscriberCount => {
                let n = asset.topics().count().min(i8::MAX as usize) as i8;
                self.reply(WireValue::I8(n))
            }

            other => Err(violation(format!("{other:?} is not a map event"))),
        }
    }

    /// Collection views answer against the parent map without materialising
    /// anything into the reply.
    fn collection_event(&mut self, event: EventId, first: &WireEvent) -> Result<(), EngineError> {
        let (csp, asset) = {
            let (csp, asset) = self.resolved();
            (csp.clone(), asset.clone())
        };
        let map = asset.map();
        match event {
            EventId::Size => self.reply(WireValue::I64(map.len()? as i64)),
            EventId::IsEmpty => self.reply(WireValue::Bool(map.is_empty()?)),
            EventId::Clear => {
                map.clear()?;
                self.reply(WireValue::Null)
            }
            EventId::Contains => match csp.view.as_str() {
                views::KEY_SET => {
                    let key = require_bytes(Some(&first.value), "element")?;
                    let b = map.contains_key(key)?;
                    self.reply(WireValue::Bool(b))
                }
                views::VALUES => {
                    let value = require_bytes(Some(&first.value), "element")?;
                    let b = map.contains_value(value)?;
                    self.reply(WireValue::Bool(b))
                }
                _ => {
                    let params = require_fields(first)?;
                    let key = require_bytes(params.get(fields::KEY), "key")?;
                    let value = require_bytes(params.get(fields::VALUE), "value")?;
                    let b = map.get(key)?.as_deref() == Some(value);
                    self.reply(WireValue::Bool(b))
                }
            },
            other => Err(violation(format!("{other:?} is not a collection event"))),
        }
    }

    /*──────── topics ────────*/

    fn topic_event(&mut self, event: EventId, first: &WireEvent) -> Result<(), EngineError> {
        let asset = self.resolved().1.clone();
        match event {
            EventId::Publish => {
                let params = require_fields(first)?;
                let topic = require_bytes(params.get(fields::TOPIC), "topic")?;
                let message = require_bytes(params.get(fields::MESSAGE), "message")?;
                asset.topics().publish(topic, message);
                Ok(())
            }
            EventId::RegisterTopicSubscriber => {
                let tid = self.tid()?;
                let publisher = self.publisher.clone();
                let token = asset.topics().register(Arc::new(move |topic, message| {
                    let inner = Document::new()
                        .with(fields::TOPIC, WireValue::Bytes(topic.to_vec()))
                        .with(fields::MESSAGE, WireValue::Bytes(message.to_vec()));
                    publisher.push_reply(tid, WireValue::Fields(Box::new(inner)), false)
                }));
                self.topic_subs.insert(tid, (asset.topics().clone(), token));
                Ok(())
            }
            other => Err(violation(format!("{other:?} is not a topic event"))),
        }
    }

    /*──────── subscriptions ─*/

    fn register_subscriber(&mut self, csp: &Csp, asset: &Arc<Asset>) -> Result<(), EngineError> {
        let tid = self.tid()?;
        let publisher = self.publisher.clone();
        let token = asset
            .subscriptions()
            .register(Arc::new(move |event| publisher.push_map_event(tid, event)));
        self.map_subs
            .insert(tid, (asset.subscriptions().clone(), token));
        debug!(peer = %self.peer, tid, "subscriber registered");

        if csp.bootstrap {
            // Replay current state as inserts so a fresh subscriber starts
            // from a full picture.
            let publisher = self.publisher.clone();
            asset.map().for_each(&mut |key, value| {
                publisher.push_map_event(
                    tid,
                    &crate::asset::MapEvent::Insert {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                );
                Ok(())
            })?;
        }
        Ok(())
    }

    fn unregister_subscriber(&mut self) -> Result<(), EngineError> {
        let tid = self.tid()?;
        match self.map_subs.remove(&tid) {
            Some((hub, token)) => {
                hub.unregister(token);
            }
            None => {
                warn!(peer = %self.peer, tid, "no subscriber to unregister");
            }
        }
        // Terminal document: ready framing ends the logical reply stream.
        self.publisher.push_reply(tid, WireValue::Null, true);
        Ok(())
    }

    /*──────── replication ───*/

    fn replication_event(&mut self, event: EventId, first: &WireEvent) -> Result<(), EngineError> {
        let asset = self.resolved().1.clone();
        let replication = asset.replication().clone();
        match event {
            EventId::Identifier => {
                let tid = self.tid()?;
                let doc = Document::new().with(
                    "identifierReply",
                    WireValue::I8(replication.identifier() as i8),
                );
                self.publisher.push_doc(tid, &doc, true);
                Ok(())
            }
            EventId::Bootstap => {
                let tid = self.tid()?;
                let bootstrap: Bootstrap =
                    first.value.decode_typed(classes::BOOTSTRAP)?;
                replication.acquire_modification_iterator(bootstrap.identifier)?;
                self.bootstraps.insert(bootstrap.identifier, bootstrap);
                // Our side of the handshake: the newest timestamp we have
                // received from this peer, so it knows where to replay from.
                let reply = Bootstrap {
                    identifier: replication.identifier(),
                    last_updated_time: replication.last_modification_time(bootstrap.identifier),
                };
                let doc = Document::new().with(
                    "bootstrapReply",
                    WireValue::typed(classes::BOOTSTRAP, &reply)?,
                );
                self.publisher.push_doc(tid, &doc, true);
                info!(
                    peer = %self.peer,
                    remote = bootstrap.identifier,
                    since = bootstrap.last_updated_time,
                    "replication bootstrap"
                );
                Ok(())
            }
            EventId::ReplicationSubscribe => {
                let tid = self.tid()?;
                let remote = first
                    .value
                    .as_i64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| violation("replicationSubscribe expects an identifier"))?;
                let mi = replication.acquire_modification_iterator(remote)?;
                // Resend anything the remote may have missed before pumping
                // live changes; ordered before the first drain so nothing
                // mutated in between is lost.
                let since = self
                    .bootstraps
                    .get(&remote)
                    .map(|b| b.last_updated_time)
                    .unwrap_or(0);
                mi.dirty_entries(since)?;
                let event_loop = self.server.event_loop().clone();
                let waker = event_loop.clone();
                mi.set_modification_notifier(Arc::new(move || waker.unpause()));
                let closed = Arc::new(AtomicBool::new(false));
                self.pumps.push(closed.clone());
                event_loop.add_handler(Arc::new(AcceptorPump {
                    mi,
                    publisher: self.publisher.clone(),
                    tid,
                    closed,
                }));
                info!(peer = %self.peer, remote, since, "replication subscription");
                Ok(())
            }
            EventId::ReplicationEvent => {
                let entry: ReplicationEntry =
                    first.value.decode_typed(classes::REPLICATION_ENTRY)?;
                replication.apply_replication(&entry)
            }
            other => Err(violation(format!("{other:?} is not a replication event"))),
        }
    }

    fn set_proxy(&mut self, csp: &Csp, view: &str) -> Result<(), EngineError> {
        let derived = csp.derived(view);
        let uri = derived.to_uri();
        let cid = self.cids.bind(&uri);
        let proxy = SetProxy { csp: uri, cid };
        self.reply(WireValue::typed(SET_PROXY_CLASS, &proxy)?)
    }

    fn reply(&mut self, value: WireValue) -> Result<(), EngineError> {
        let tid = self.tid()?;
        self.publisher.push_reply(tid, value, true);
        Ok(())
    }
}

/// Server-side push loop for one replication subscription: drains the
/// peer's modification iterator into `replicactionReply` documents on the
/// subscription's TID.
struct AcceptorPump {
    mi: Arc<ModificationIterator>,
    publisher: Arc<ConnPublisher>,
    tid: u64,
    closed: Arc<AtomicBool>,
}

impl EventHandler for AcceptorPump {
    fn run_once(&self) -> Result<bool, HandlerDropped> {
        if self.closed.load(Ordering::Acquire) || !self.publisher.is_open() {
            return Err(HandlerDropped);
        }
        match self.mi.has_next() {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => {
                warn!(error = %e, "replication pump scan failed");
                return Err(HandlerDropped);
            }
        }
        let publisher = self.publisher.clone();
        let tid = self.tid;
        let drained = self.mi.for_each(&mut |entry| {
            let doc = Document::new().with(
                "replicactionReply",
                WireValue::typed(classes::REPLICATION_ENTRY, entry)?,
            );
            if publisher.push_doc(tid, &doc, false) {
                Ok(())
            } else {
                Err(EngineError::ConnectionClosed)
            }
        });
        match drained {
            Ok(n) => Ok(n > 0),
            Err(EngineError::ConnectionClosed) => Err(HandlerDropped),
            Err(e) => {
                // Includes the fatal case: the iterator lost a record CAS
                // after the entry was already delivered.
                warn!(error = %e, "replication pump failed");
                Err(HandlerDropped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_case_sensitive_and_wire_stable() {
        assert_eq!(EventId::parse("put"), Some(EventId::Put));
        assert_eq!(EventId::parse("Put"), None);
        assert_eq!(EventId::parse("getAndPut"), Some(EventId::GetAndPut));
        // The historical misspellings must keep parsing.
        assert_eq!(EventId::parse("bootstap"), Some(EventId::Bootstap));
        assert_eq!(
            EventId::parse("replicactionReply"),
            Some(EventId::ReplicactionReply)
        );
        assert_eq!(EventId::parse("bootstrap"), None);
        assert_eq!(EventId::parse("replicationReply"), None);
        assert_eq!(EventId::parse("no-such-event"), None);
    }
}
