//! Initiator side of a peer replication session. Runs over an ordinary
//! client channel: identity exchange, bootstrap handshake, subscribe, then a
//! publish pump on the event loop shipping local dirty entries as
//! `replicationEvent` documents while inbound `replicactionReply` documents
//! are applied through the state store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::csp::{views, Csp};
use crate::error::EngineError;
use crate::event_loop::{EventHandler, HandlerDropped};
use crate::net::{EngineClient, Target};
use crate::replication::state::ReplicationState;
use crate::replication::{classes, Bootstrap, ModificationIterator, ReplicationEntry};
use crate::wire::{Document, WireValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Subscribed,
    Streaming,
    Closed,
}

pub struct ReplicationHub {
    client: EngineClient,
    uri: String,
    state: Mutex<SessionState>,
    closed: Arc<AtomicBool>,
}

impl ReplicationHub {
    pub fn new(client: EngineClient, path: &str) -> ReplicationHub {
        ReplicationHub {
            client,
            uri: Csp::new(path, views::REPLICATION).to_uri(),
            state: Mutex::new(SessionState::Handshake),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.state.lock().unwrap() = SessionState::Closed;
        self.client.event_loop().unpause();
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock().unwrap() = s;
    }

    /// Drive the whole session once. On failure the session is back in
    /// `Handshake` and may be bootstrapped again.
    pub async fn bootstrap(
        &self,
        replication: &Arc<ReplicationState>,
        local_identifier: u8,
    ) -> Result<u8, EngineError> {
        self.set_state(SessionState::Handshake);
        match self.try_bootstrap(replication, local_identifier).await {
            Ok(remote) => Ok(remote),
            Err(e) => {
                warn!(error = %e, "replication session failed, back to handshake");
                self.set_state(SessionState::Handshake);
                Err(e)
            }
        }
    }

    /// Re-run `bootstrap` with a back-off until it succeeds or the hub is
    /// closed; this is the restart-from-handshake path for broken sessions.
    pub async fn run(&self, replication: &Arc<ReplicationState>, local_identifier: u8) {
        while !self.closed.load(Ordering::Acquire) {
            match self.bootstrap(replication, local_identifier).await {
                Ok(remote) => {
                    info!(remote, "replication session established");
                    return;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(1_000)).await,
            }
        }
    }

    async fn try_bootstrap(
        &self,
        replication: &Arc<ReplicationState>,
        local_identifier: u8,
    ) -> Result<u8, EngineError> {
        let target = Target::Csp(&self.uri);

        // 1. Identity exchange.
        let reply = self
            .client
            .request(target, Document::new().with("identifier", WireValue::Null))
            .await?;
        let remote = reply
            .get("identifierReply")
            .and_then(WireValue::as_i64)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| {
                EngineError::ProtocolViolation("identifier exchange yielded no identity".into())
            })?;

        // 2. Bootstrap handshake: tell the remote the newest timestamp we
        // have seen from it, learn where it wants replay from.
        let mi = replication.acquire_modification_iterator(remote)?;
        let ours = Bootstrap {
            identifier: local_identifier,
            last_updated_time: replication.last_modification_time(remote),
        };
        let reply = self
            .client
            .request(
                target,
                Document::new().with("bootstap", WireValue::typed(classes::BOOTSTRAP, &ours)?),
            )
            .await?;
        let theirs: Bootstrap = reply
            .get("bootstrapReply")
            .ok_or_else(|| EngineError::ProtocolViolation("bootstrap reply missing".into()))?
            .decode_typed(classes::BOOTSTRAP)?;
        info!(
            remote,
            since = theirs.last_updated_time,
            "replication bootstrap agreed"
        );

        // 3. Subscribe: inbound pushes apply through the state store.
        let apply_to = replication.clone();
        let tid = self.client.subscribe(
            &self.uri,
            Document::new().with(
                "replicationSubscribe",
                WireValue::I8(local_identifier as i8),
            ),
            move |doc| match doc.first() {
                Some(ev) if ev.name == "replicactionReply" => {
                    match ev.value.decode_typed::<ReplicationEntry>(classes::REPLICATION_ENTRY) {
                        Ok(entry) => {
                            if let Err(e) = apply_to.apply_replication(&entry) {
                                warn!(error = %e, "failed to apply replication entry");
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable replication entry"),
                    }
                }
                Some(ev) => debug!(event = %ev.name, "unexpected document on replication tid"),
                None => {}
            },
        )?;
        self.set_state(SessionState::Subscribed);

        // 4. Mark everything the remote might have missed dirty again,
        // before the first pump runs, so nothing mutated in between is lost.
        mi.dirty_entries(theirs.last_updated_time)?;
        let event_loop = self.client.event_loop().clone();
        let waker = event_loop.clone();
        mi.set_modification_notifier(Arc::new(move || waker.unpause()));
        event_loop.add_handler(Arc::new(InitiatorPump {
            client: self.client.clone(),
            uri: self.uri.clone(),
            tid,
            mi,
            closed: self.closed.clone(),
        }));
        self.set_state(SessionState::Streaming);
        Ok(remote)
    }
}

/// Event-loop handler draining the local iterator to the remote peer.
/// Returns "did work"; reports itself invalid once the hub closes or the
/// iterator hits the fatal CAS assertion.
struct InitiatorPump {
    client: EngineClient,
    uri: String,
    tid: u64,
    mi: Arc<ModificationIterator>,
    closed: Arc<AtomicBool>,
}

impl EventHandler for InitiatorPump {
    fn run_once(&self) -> Result<bool, HandlerDropped> {
        if self.closed.load(Ordering::Acquire) {
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
        let drained = self.mi.for_each(&mut |entry| {
            let doc = Document::new().with(
                "replicationEvent",
                WireValue::typed(classes::REPLICATION_ENTRY, entry)?,
            );
            self.client.send_on(Target::Csp(&self.uri), self.tid, doc)
        });
        match drained {
            Ok(n) => Ok(n > 0),
            Err(e) => {
                warn!(error = %e, "replication pump failed");
                Err(HandlerDropped)
            }
        }
    }
}
