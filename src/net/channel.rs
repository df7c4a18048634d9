//! Outbound half of a client channel: one send buffer behind one exclusive
//! lock. A writer appends its framed documents and, when other writers are
//! queued on the lock and the buffer still has headroom for another
//! largest-chunk-so-far, returns without flushing so the next writer
//! coalesces into the same socket write. The last writer in the queue always
//! drains, so batching never starves the buffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Default)]
struct OutBuf {
    bytes: Vec<u8>,
    largest_chunk: usize,
}

pub(crate) struct Outbound {
    buf: Mutex<OutBuf>,
    /// Writers currently contending for the buffer lock.
    queued: AtomicUsize,
    capacity: usize,
    sink: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Outbound {
    pub(crate) fn new(capacity: usize) -> Self {
        Outbound {
            buf: Mutex::new(OutBuf::default()),
            queued: AtomicUsize::new(0),
            capacity,
            sink: Mutex::new(None),
        }
    }

    /// Point the buffer at a fresh socket writer. The previous writer task,
    /// if any, exits once its sender is dropped here.
    pub(crate) fn attach(&self, write_half: OwnedWriteHalf) {
        let tx = spawn_writer(write_half);
        *self.sink.lock().unwrap() = Some(tx);
    }

    pub(crate) fn detach(&self) {
        *self.sink.lock().unwrap() = None;
    }

    /// Append one pre-framed chunk; flush unless a queued writer will.
    pub(crate) fn enqueue(&self, chunk: &[u8]) -> Result<(), EngineError> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let mut buf = self.buf.lock().unwrap();
        self.queued.fetch_sub(1, Ordering::AcqRel);

        buf.bytes.extend_from_slice(chunk);
        if chunk.len() > buf.largest_chunk {
            buf.largest_chunk = chunk.len();
        }

        let queued = self.queued.load(Ordering::Acquire);
        if queued > 0 && buf.bytes.len() + buf.largest_chunk <= self.capacity {
            // A contending writer takes over the flush.
            return Ok(());
        }

        let out = std::mem::take(&mut buf.bytes);
        drop(buf);
        let sink = self.sink.lock().unwrap();
        match sink.as_ref() {
            Some(tx) if tx.send(out).is_ok() => Ok(()),
            _ => Err(EngineError::ConnectionClosed),
        }
    }
}

fn spawn_writer(mut write_half: OwnedWriteHalf) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!(error = %e, "socket write failed");
                break;
            }
        }
        debug!("socket writer exit");
    });
    tx
}
