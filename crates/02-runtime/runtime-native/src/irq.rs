use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Mutex, RwLock};
use transport::wait::MAX_VECTOR;
use transport::{DoorbellLatch, Wakeup};
use transport_fabric::{InterruptController, InterruptHandler, InterruptLine};

#[derive(Default)]
struct IrqShared {
    latch: DoorbellLatch,
    handlers: RwLock<HashMap<u32, InterruptHandler>>,
    delivered: AtomicU64,
    unhandled: AtomicU64,
}

impl IrqShared {
    fn deliver(&self, pending: u32) {
        let mut bits = pending;
        while bits != 0 {
            let vector = bits.trailing_zeros();
            bits &= bits - 1;
            let handler = self.handlers.read().get(&vector).cloned();
            match handler {
                Some(handler) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    handler(vector);
                }
                None => {
                    self.unhandled.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(vector, "no handler for doorbell vector");
                }
            }
        }
    }
}

/// Interrupt delivery for one simulated domain.
///
/// A dedicated thread parks on a [`DoorbellLatch`]; [`IrqLine::trigger`] raises
/// a vector and the thread runs the registered handler, so handlers execute
/// outside the sender's context just as a real interrupt would.
pub struct IrqController {
    shared: Arc<IrqShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl IrqController {
    /// Starts the delivery thread.
    pub fn start(name: &str) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(IrqShared::default());
        let inner = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("irq-{name}"))
            .spawn(move || loop {
                match inner.latch.wait() {
                    Wakeup::Raised(pending) => inner.deliver(pending),
                    Wakeup::Closed => break,
                }
            })?;
        Ok(Arc::new(Self {
            shared,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// The line a remote domain uses to ring this domain's doorbells.
    pub fn line(&self) -> Arc<dyn InterruptLine> {
        Arc::new(IrqLine {
            shared: self.shared.clone(),
        })
    }

    /// Handler invocations so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Vectors raised with no handler registered.
    pub fn unhandled(&self) -> u64 {
        self.shared.unhandled.load(Ordering::Relaxed)
    }

    /// Stops the delivery thread. Pending vectors are discarded.
    pub fn shutdown(&self) {
        self.shared.latch.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

impl InterruptController for IrqController {
    fn vector_count(&self) -> u32 {
        MAX_VECTOR + 1
    }

    fn register(&self, vector: u32, handler: InterruptHandler) {
        self.shared.handlers.write().insert(vector, handler);
    }

    fn unregister(&self, vector: u32) {
        self.shared.handlers.write().remove(&vector);
    }
}

impl Drop for IrqController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Raises vectors on an [`IrqController`].
pub struct IrqLine {
    shared: Arc<IrqShared>,
}

impl InterruptLine for IrqLine {
    fn trigger(&self, vector: u32) {
        if !self.shared.latch.raise(vector) {
            tracing::warn!(vector, "doorbell vector out of range, dropped");
        }
    }
}

/// A line nobody listens to, for domains that only poll.
#[derive(Debug, Default)]
pub struct SilentLine;

impl InterruptLine for SilentLine {
    fn trigger(&self, vector: u32) {
        tracing::trace!(vector, "doorbell on a polling-only domain");
    }
}
