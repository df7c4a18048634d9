//! Cooperative event loop. Handlers are short and non-blocking; each call to
//! `run_once` returns whether the handler did work. Monitor handlers (e.g.
//! heartbeats) run before Medium handlers (e.g. replication pumps) on every
//! pass. A handler that returns `Err(HandlerDropped)` is removed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerPriority {
    Monitor,
    Medium,
}

/// Returned by a handler to take itself off the loop.
#[derive(Debug)]
pub struct HandlerDropped;

pub trait EventHandler: Send + Sync + 'static {
    /// Do a bounded amount of work. `Ok(true)` means "I was busy" and keeps
    /// the loop hot; `Ok(false)` lets it pause until woken.
    fn run_once(&self) -> Result<bool, HandlerDropped>;

    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Medium
    }
}

pub struct EventLoop {
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    wake: Notify,
    started: AtomicBool,
    closed: AtomicBool,
    /// How long an idle pass parks before polling timers again.
    idle_tick: Duration,
}

impl EventLoop {
    pub fn new() -> Arc<Self> {
        Self::with_idle_tick(Duration::from_millis(10))
    }

    pub fn with_idle_tick(idle_tick: Duration) -> Arc<Self> {
        Arc::new(EventLoop {
            handlers: Mutex::new(Vec::new()),
            wake: Notify::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            idle_tick,
        })
    }

    /// Spawn the driver task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = self.clone();
        tokio::spawn(async move { driver.run().await });
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut g = self.handlers.lock().unwrap();
        g.push(handler);
        g.sort_by_key(|h| h.priority());
        self.wake.notify_one();
    }

    /// Wake the loop out of its idle pause (e.g. a dirty bit was raised).
    pub fn unpause(&self) {
        self.wake.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn run(&self) {
        debug!("event loop started");
        while !self.is_closed() {
            let snapshot: Vec<Arc<dyn EventHandler>> =
                self.handlers.lock().unwrap().iter().cloned().collect();

            let mut busy = false;
            for handler in &snapshot {
                match handler.run_once() {
                    Ok(did_work) => busy |= did_work,
                    Err(HandlerDropped) => {
                        let mut g = self.handlers.lock().unwrap();
                        if let Some(at) = g.iter().position(|h| Arc::ptr_eq(h, handler)) {
                            g.remove(at);
                        }
                        debug!("event handler dropped, {} remain", g.len());
                    }
                }
            }

            if busy {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.idle_tick) => {}
                }
            }
        }
        let dropped = self.handlers.lock().unwrap().drain(..).count();
        if dropped > 0 {
            warn!(handlers = dropped, "event loop closed with live handlers");
        }
        debug!("event loop stopped");
    }
}
