//! Client side of the channel: allocates transaction ids, parks synchronous
//! callers on per-TID waiters, feeds subscription callbacks, heartbeats the
//! server and reconnects (re-sending the handshake and every live
//! subscription) when the channel drops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::event_loop::{EventHandler, EventLoop, HandlerDropped, HandlerPriority};
use crate::net::channel::Outbound;
use crate::net::{encode_exchange, meta_document, Target};
use crate::wire::{fields, frame, Document, WireFormat, WireValue};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub format: WireFormat,
    /// Sent in the `userid` handshake on every (re)connect.
    pub user: String,
    pub call_timeout_ms: u64,
    pub heartbeat_ping_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub out_buffer_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Binary,
            user: std::env::var("USER").unwrap_or_else(|_| "anonymous".into()),
            call_timeout_ms: 10_000,
            heartbeat_ping_ms: 3_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_backoff_ms: 1_000,
            out_buffer_bytes: 64 << 10,
            max_frame_bytes: 16 << 20,
        }
    }
}

struct Subscription {
    csp: String,
    subscribe_doc: Document,
    on_document: Box<dyn Fn(&Document) + Send + Sync>,
}

#[derive(Clone)]
pub struct EngineClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    cfg: ClientConfig,
    addr: SocketAddr,
    clock: Arc<dyn Clock>,
    event_loop: Arc<EventLoop>,
    tid: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Document, EngineError>>>>,
    subs: Mutex<HashMap<u64, Arc<Subscription>>>,
    out: Outbound,
    last_rx: AtomicU64,
    awaiting_heartbeat: AtomicBool,
    /// Kicks the read task out of a blocked read (heartbeat timeout, close).
    kick: Notify,
    force_drop: AtomicBool,
    closed: AtomicBool,
}

impl EngineClient {
    pub async fn connect(
        addr: SocketAddr,
        cfg: ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<EngineClient, EngineError> {
        let event_loop = EventLoop::new();
        event_loop.start();

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();

        let shared = Arc::new(ClientShared {
            out: Outbound::new(cfg.out_buffer_bytes),
            tid: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            last_rx: AtomicU64::new(clock.now()),
            awaiting_heartbeat: AtomicBool::new(false),
            kick: Notify::new(),
            force_drop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            event_loop,
            addr,
            clock,
            cfg,
        });
        shared.out.attach(wr);
        shared.handshake()?;

        let reader = shared.clone();
        tokio::spawn(async move { reader.read_loop(rd).await });

        shared.event_loop.add_handler(Arc::new(HeartbeatHandler {
            shared: shared.clone(),
        }));
        info!(%addr, "connected");
        Ok(EngineClient { shared })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.shared.event_loop
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Strictly-increasing transaction ids, seeded from wall-clock millis.
    pub fn next_tid(&self) -> u64 {
        self.shared.next_tid()
    }

    /// Synchronous call: write the request, park until the reply document
    /// with the same TID arrives or the deadline passes.
    pub async fn request(
        &self,
        target: Target<'_>,
        doc: Document,
    ) -> Result<Document, EngineError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::ConnectionClosed);
        }
        let tid = shared.next_tid();
        let (tx, rx) = oneshot::channel();
        shared.waiters.lock().unwrap().insert(tid, tx);
        if let Err(e) = shared.send_exchange(target, tid, &doc, true) {
            shared.waiters.lock().unwrap().remove(&tid);
            return Err(e);
        }
        match tokio::time::timeout(Duration::from_millis(shared.cfg.call_timeout_ms), rx).await {
            Err(_) => {
                shared.waiters.lock().unwrap().remove(&tid);
                Err(EngineError::Timeout)
            }
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Ok(Ok(reply)) => reply,
        }
    }

    /// Fire-and-forget: a fresh TID is claimed but no waiter registered.
    pub fn send(&self, target: Target<'_>, doc: Document) -> Result<u64, EngineError> {
        let tid = self.shared.next_tid();
        self.shared.send_exchange(target, tid, &doc, true)?;
        Ok(tid)
    }

    /// Send on a known TID (e.g. pushes on an established subscription).
    pub fn send_on(&self, target: Target<'_>, tid: u64, doc: Document) -> Result<(), EngineError> {
        self.shared.send_exchange(target, tid, &doc, true)
    }

    /// Register a long-lived subscription: the callback sees every document
    /// the server emits on this TID. Survives reconnects until a terminal
    /// (ready) document or an explicit `unsubscribe`.
    pub fn subscribe(
        &self,
        csp: &str,
        doc: Document,
        on_document: impl Fn(&Document) + Send + Sync + 'static,
    ) -> Result<u64, EngineError> {
        let shared = &self.shared;
        let tid = shared.next_tid();
        let sub = Arc::new(Subscription {
            csp: csp.to_owned(),
            subscribe_doc: doc.clone(),
            on_document: Box::new(on_document),
        });
        shared.subs.lock().unwrap().insert(tid, sub);
        if let Err(e) = shared.send_exchange(Target::Csp(csp), tid, &doc, true) {
            shared.subs.lock().unwrap().remove(&tid);
            return Err(e);
        }
        Ok(tid)
    }

    /// Drop the local subscription state. The server-side listener is ended
    /// separately (`unRegisterSubscriber` on the same TID).
    pub fn unsubscribe(&self, tid: u64) -> bool {
        self.shared.subs.lock().unwrap().remove(&tid).is_some()
    }

    /// Abandon the current socket as if it had failed: waiting synchronous
    /// calls observe `ConnectionClosed`, subscriptions are reapplied on the
    /// new channel.
    pub fn drop_channel(&self) {
        self.shared.force_drop.store(true, Ordering::Release);
        self.shared.kick.notify_one();
    }

    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.kick.notify_one();
        shared.out.detach();
        shared.fail_waiters();
        shared.event_loop.close();
        info!(addr = %shared.addr, "client closed");
    }
}

impl ClientShared {
    fn next_tid(&self) -> u64 {
        let now = self.clock.now();
        loop {
            let old = self.tid.load(Ordering::SeqCst);
            let id = if old >= now { old + 1 } else { now };
            if self
                .tid
                .compare_exchange(old, id, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return id;
            }
        }
    }

    fn send_exchange(
        &self,
        target: Target<'_>,
        tid: u64,
        doc: &Document,
        ready: bool,
    ) -> Result<(), EngineError> {
        let mut chunk = Vec::new();
        let meta = meta_document(target, tid);
        encode_exchange(self.cfg.format, &meta, doc, ready, &mut chunk)?;
        self.out.enqueue(&chunk)
    }

    fn handshake(&self) -> Result<(), EngineError> {
        self.send_exchange(
            Target::None,
            0,
            &Document::new().with("userid", WireValue::Text(self.cfg.user.clone())),
            true,
        )
    }

    fn fail_waiters(&self) {
        for (_, tx) in self.waiters.lock().unwrap().drain() {
            let _ = tx.send(Err(EngineError::ConnectionClosed));
        }
    }

    async fn read_loop(self: Arc<Self>, mut rd: OwnedReadHalf) {
        let mut pending_tid: i64 = -1;
        loop {
            let res = tokio::select! {
                r = frame::read_frame(&mut rd, self.cfg.max_frame_bytes) => r,
                _ = self.kick.notified() => Err(EngineError::Timeout),
            };
            match res {
                Ok((header, payload)) => {
                    self.last_rx.store(self.clock.now(), Ordering::Release);
                    self.awaiting_heartbeat.store(false, Ordering::Release);
                    let doc = match self.cfg.format.decode(&payload) {
                        Ok(doc) => doc,
                        Err(e) => {
                            warn!(error = %e, "undecodable inbound document");
                            continue;
                        }
                    };
                    if !frame::is_data(header) {
                        pending_tid = doc.get_i64(fields::TID).unwrap_or(-1);
                    } else if pending_tid >= 0 {
                        self.route(pending_tid as u64, frame::is_ready(header), doc);
                    } else {
                        warn!("data document without a preceding tid");
                    }
                }
                Err(EngineError::Timeout) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let forced = self.force_drop.swap(false, Ordering::AcqRel);
                    let idle = self.clock.now().saturating_sub(self.last_rx.load(Ordering::Acquire));
                    if !forced && idle < self.cfg.heartbeat_timeout_ms {
                        continue; // stale kick, e.g. right after a reconnect
                    }
                    warn!(idle_ms = idle, forced, "no traffic, dropping the channel");
                    match self.reconnect().await {
                        Some(new_rd) => rd = new_rd,
                        None => return,
                    }
                }
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    warn!(error = %e, "read failed, reconnecting");
                    match self.reconnect().await {
                        Some(new_rd) => rd = new_rd,
                        None => return,
                    }
                }
            }
        }
    }

    /// Wake sync waiters with `ConnectionClosed`, then dial until the server
    /// is back: re-handshake and replay every live subscription.
    async fn reconnect(&self) -> Option<OwnedReadHalf> {
        self.fail_waiters();
        self.out.detach();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.reconnect_backoff_ms)).await;
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    if stream.set_nodelay(true).is_err() {
                        continue;
                    }
                    let (rd, wr) = stream.into_split();
                    self.out.attach(wr);
                    self.last_rx.store(self.clock.now(), Ordering::Release);
                    self.awaiting_heartbeat.store(false, Ordering::Release);
                    if let Err(e) = self.handshake() {
                        warn!(error = %e, "handshake after reconnect failed");
                        continue;
                    }
                    let subs: Vec<(u64, Arc<Subscription>)> = self
                        .subs
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|(tid, s)| (*tid, s.clone()))
                        .collect();
                    for (tid, sub) in subs {
                        if let Err(e) = self.send_exchange(
                            Target::Csp(&sub.csp),
                            tid,
                            &sub.subscribe_doc,
                            true,
                        ) {
                            warn!(error = %e, tid, "failed to reapply subscription");
                        }
                    }
                    info!(addr = %self.addr, "reconnected");
                    return Some(rd);
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    fn route(&self, tid: u64, ready: bool, doc: Document) {
        // TID 0 is reserved for server-originated system messages.
        if tid == 0 {
            if let Some(first) = doc.first() {
                if first.name == "heartbeat" {
                    let ts = first.value.as_i64().unwrap_or_default();
                    let reply =
                        Document::new().with("heartbeatReply", WireValue::I64(ts));
                    if let Err(e) = self.send_exchange(Target::None, 0, &reply, true) {
                        debug!(error = %e, "could not answer server heartbeat");
                    }
                }
            }
            return;
        }

        let sub = self.subs.lock().unwrap().get(&tid).cloned();
        if let Some(sub) = sub {
            (sub.on_document)(&doc);
            if ready {
                // A ready document terminates the logical reply stream.
                self.subs.lock().unwrap().remove(&tid);
                debug!(tid, "subscription ended by terminal document");
            }
            return;
        }

        if let Some(waiter) = self.waiters.lock().unwrap().remove(&tid) {
            let _ = waiter.send(Ok(doc));
            return;
        }
        warn!(tid, "document for unknown tid dropped");
    }
}

/// Emits `heartbeat` after `heartbeat_ping_ms` of inbound silence and forces
/// a reconnect after `heartbeat_timeout_ms`.
struct HeartbeatHandler {
    shared: Arc<ClientShared>,
}

impl EventHandler for HeartbeatHandler {
    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Monitor
    }

    fn run_once(&self) -> Result<bool, HandlerDropped> {
        let s = &self.shared;
        if s.closed.load(Ordering::Acquire) {
            return Err(HandlerDropped);
        }
        let now = s.clock.now();
        let idle = now.saturating_sub(s.last_rx.load(Ordering::Acquire));

        if idle >= s.cfg.heartbeat_timeout_ms {
            s.kick.notify_one();
            return Ok(true);
        }

        if idle >= s.cfg.heartbeat_ping_ms && !s.awaiting_heartbeat.swap(true, Ordering::AcqRel) {
            let tid = s.next_tid();
            let (tx, rx) = oneshot::channel();
            s.waiters.lock().unwrap().insert(tid, tx);
            tokio::spawn(async move {
                if let Ok(Ok(_)) = rx.await {
                    debug!("heartbeat acknowledged");
                }
            });
            let doc = Document::new().with("heartbeat", WireValue::I64(now as i64));
            if let Err(e) = s.send_exchange(Target::None, tid, &doc, true) {
                debug!(error = %e, "heartbeat send failed");
            }
            return Ok(true);
        }
        Ok(false)
    }
}
