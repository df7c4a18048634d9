//! Server side of the channel: accepts connections, reads meta/data document
//! pairs, and hands data documents to the dispatcher. Every connection gets
//! a writer task draining a wait-free publish queue, so replies, streaming
//! subscription events and replication pushes all serialise through one
//! socket writer in FIFO order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::asset::{AssetTree, MapEvent};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::event_loop::{EventHandler, EventLoop, HandlerDropped, HandlerPriority};
use crate::net::dispatcher::Conn;
use crate::net::encode_exchange;
use crate::wire::{fields, frame, Document, WireFormat, WireValue};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub format: WireFormat,
    pub heartbeat_ping_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Binary,
            heartbeat_ping_ms: 3_000,
            heartbeat_timeout_ms: 5_000,
            max_frame_bytes: 16 << 20,
        }
    }
}

pub struct EngineServer {
    tree: Arc<AssetTree>,
    cfg: ServerConfig,
    event_loop: Arc<EventLoop>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineServer {
    pub fn new(tree: Arc<AssetTree>, cfg: ServerConfig) -> Arc<Self> {
        let event_loop = EventLoop::new();
        event_loop.start();
        Arc::new(EngineServer {
            tree,
            cfg,
            event_loop,
            accept_task: Mutex::new(None),
        })
    }

    pub fn tree(&self) -> &Arc<AssetTree> {
        &self.tree
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.tree.clock()
    }

    /// Bind and start accepting; returns the bound address.
    pub async fn bind(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, EngineError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, identifier = self.tree.identifier(), "server listening");

        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(server, stream, peer).await {
                                warn!(%peer, error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(local)
    }

    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.event_loop.close();
    }
}

/*──────────────────────── per-connection state ──────────*/

/// The only face of the channel that handlers and listeners see: enqueue a
/// framed exchange. Enqueueing is wait-free; the writer task serialises.
pub(crate) struct ConnPublisher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) format: WireFormat,
}

impl ConnPublisher {
    /// Push a `meta{tid}` + data document pair; false once the channel died.
    pub(crate) fn push_doc(&self, tid: u64, doc: &Document, ready: bool) -> bool {
        let mut chunk = Vec::new();
        let meta = Document::new().with(fields::TID, WireValue::I64(tid as i64));
        if let Err(e) = encode_exchange(self.format, &meta, doc, ready, &mut chunk) {
            warn!(error = %e, "failed to encode outbound document");
            return false;
        }
        self.tx.send(chunk).is_ok()
    }

    pub(crate) fn push_reply(&self, tid: u64, value: WireValue, ready: bool) -> bool {
        self.push_doc(
            tid,
            &Document::new().with(fields::REPLY, value),
            ready,
        )
    }

    /// Streamed map event on a subscription TID; non-ready framing keeps the
    /// logical reply open.
    pub(crate) fn push_map_event(&self, tid: u64, event: &MapEvent) -> bool {
        let mut inner = Document::new();
        match event {
            MapEvent::Insert { key, value } => {
                inner.push(fields::EVENT_TYPE, WireValue::I8(1));
                inner.push(fields::KEY, WireValue::Bytes(key.clone()));
                inner.push(fields::NEW_VALUE, WireValue::Bytes(value.clone()));
            }
            MapEvent::Update {
                key,
                old_value,
                value,
            } => {
                inner.push(fields::EVENT_TYPE, WireValue::I8(2));
                inner.push(fields::KEY, WireValue::Bytes(key.clone()));
                inner.push(fields::OLD_VALUE, WireValue::Bytes(old_value.clone()));
                inner.push(fields::NEW_VALUE, WireValue::Bytes(value.clone()));
            }
            MapEvent::Remove { key, old_value } => {
                inner.push(fields::EVENT_TYPE, WireValue::I8(3));
                inner.push(fields::KEY, WireValue::Bytes(key.clone()));
                inner.push(fields::OLD_VALUE, WireValue::Bytes(old_value.clone()));
            }
        }
        self.push_reply(tid, WireValue::Fields(Box::new(inner)), false)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub(crate) struct ConnMonitor {
    pub(crate) last_rx: AtomicU64,
    pub(crate) awaiting_heartbeat: AtomicBool,
    pub(crate) kick: Notify,
    pub(crate) closed: AtomicBool,
}

async fn handle_connection(
    server: Arc<EngineServer>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), EngineError> {
    stream.set_nodelay(true)?;
    let clock = server.clock();
    let (mut rd, wr) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(write_loop(wr, rx));

    let publisher = Arc::new(ConnPublisher {
        tx,
        format: server.cfg.format,
    });
    let monitor = Arc::new(ConnMonitor {
        last_rx: AtomicU64::new(clock.now()),
        awaiting_heartbeat: AtomicBool::new(false),
        kick: Notify::new(),
        closed: AtomicBool::new(false),
    });
    server.event_loop.add_handler(Arc::new(ConnHeartbeat {
        publisher: publisher.clone(),
        monitor: monitor.clone(),
        clock: clock.clone(),
        ping_ms: server.cfg.heartbeat_ping_ms,
        timeout_ms: server.cfg.heartbeat_timeout_ms,
    }));

    let mut conn = Conn::new(server.clone(), publisher.clone(), peer);
    debug!(%peer, "connection open");

    let exit: EngineError = loop {
        let res = tokio::select! {
            r = frame::read_frame(&mut rd, server.cfg.max_frame_bytes) => r,
            _ = monitor.kick.notified() => Err(EngineError::Timeout),
        };
        match res {
            Ok((header, payload)) => {
                monitor.last_rx.store(clock.now(), Ordering::Release);
                monitor.awaiting_heartbeat.store(false, Ordering::Release);
                let doc = match server.cfg.format.decode(&payload) {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(%peer, error = %e, "undecodable inbound document");
                        continue;
                    }
                };
                if !frame::is_data(header) {
                    conn.on_meta(&doc);
                } else if let Err(e) = conn.on_data(&doc) {
                    // Protocol violations keep the connection; the reply is
                    // simply omitted and the caller times out.
                    warn!(%peer, error = %e, "dispatch error");
                }
            }
            Err(EngineError::Timeout) => {
                let idle = clock.now().saturating_sub(monitor.last_rx.load(Ordering::Acquire));
                if idle < server.cfg.heartbeat_timeout_ms {
                    continue; // stale kick
                }
                break EngineError::Timeout;
            }
            Err(e) => break e,
        }
    };

    monitor.closed.store(true, Ordering::Release);
    conn.cleanup();
    debug!(%peer, reason = %exit, "connection closed");
    Ok(())
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = wr.write_all(&bytes).await {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
    // Receiver drops here: later pushes fail and their owners clean up.
}

/// Per-connection server heartbeat: pings an idle client on TID 0 and kicks
/// the read task when the silence outlives the timeout.
struct ConnHeartbeat {
    publisher: Arc<ConnPublisher>,
    monitor: Arc<ConnMonitor>,
    clock: Arc<dyn Clock>,
    ping_ms: u64,
    timeout_ms: u64,
}

impl EventHandler for ConnHeartbeat {
    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Monitor
    }

    fn run_once(&self) -> Result<bool, HandlerDropped> {
        if self.monitor.closed.load(Ordering::Acquire) || !self.publisher.is_open() {
            return Err(HandlerDropped);
        }
        let idle = self
            .clock
            .now()
            .saturating_sub(self.monitor.last_rx.load(Ordering::Acquire));
        if idle >= self.timeout_ms {
            warn!(idle_ms = idle, "client silent, dropping connection");
            self.monitor.kick.notify_one();
            return Ok(true);
        }
        if idle >= self.ping_ms
            && !self
                .monitor
                .awaiting_heartbeat
                .swap(true, Ordering::AcqRel)
        {
            let doc = Document::new().with("heartbeat", WireValue::I64(self.clock.now() as i64));
            if !self.publisher.push_doc(0, &doc, true) {
                return Err(HandlerDropped);
            }
            return Ok(true);
        }
        Ok(false)
    }
}
