//! Transfer handles and the table that multiplexes them over links.
//!
//! A handle names one conversation: the remote domain and a port. Incoming
//! frames are routed to the handle's notifier, which either consumes the
//! payload in place or, with [`TransferHandle::enable_queue`], copies it into
//! the handle's pending queue for a reader thread. The queue is bounded; a
//! payload arriving at a full queue is dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;

use crate::error::{FabricError, FabricResult};
use crate::port::{self, PortClass, PORT_LIMIT, USER_PORT_BASE};

/// Pending queue depth of handles created by [`HandleTable::new`].
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Receives payloads delivered to a handle, in interrupt-delivery context.
pub trait FrameNotifier: Send + Sync {
    fn on_frame(&self, payload: &[u8]);
}

impl<F> FrameNotifier for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_frame(&self, payload: &[u8]) {
        self(payload)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub remote_id: u32,
    pub port: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    Open = 0,
    Closed = 1,
    /// The link carrying this handle went down.
    Dead = 2,
}

impl HandleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => HandleState::Open,
            1 => HandleState::Closed,
            _ => HandleState::Dead,
        }
    }
}

/// Outcome of handing a payload to a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Notified,
    NoNotifier,
    NotOpen,
    /// The pending queue was full; the payload was dropped.
    QueueFull,
}

/// Where a handle's payloads go.
#[derive(Clone)]
enum Sink {
    Notifier(Arc<dyn FrameNotifier>),
    Queue,
}

pub struct TransferHandle {
    key: HandleKey,
    state: AtomicU8,
    sink: RwLock<Option<Sink>>,
    pending_tx: Sender<Vec<u8>>,
    pending_rx: Receiver<Vec<u8>>,
    overflowed: AtomicU64,
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("overflowed", &self.overflowed())
            .finish()
    }
}

impl TransferHandle {
    fn new(key: HandleKey, queue_depth: usize) -> Self {
        let (pending_tx, pending_rx) = bounded(queue_depth);
        Self {
            key,
            state: AtomicU8::new(HandleState::Open as u8),
            sink: RwLock::new(None),
            pending_tx,
            pending_rx,
            overflowed: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> HandleKey {
        self.key
    }

    pub fn remote_id(&self) -> u32 {
        self.key.remote_id
    }

    pub fn port(&self) -> u32 {
        self.key.port
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    pub fn has_notifier(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Routes delivered payloads into the pending queue, replacing any notifier.
    pub fn enable_queue(&self) -> FabricResult<()> {
        self.set_sink(Sink::Queue)
    }

    /// Frames queued and not yet received.
    pub fn pending(&self) -> usize {
        self.pending_rx.len()
    }

    /// How many payloads the pending queue can hold.
    pub fn queue_depth(&self) -> usize {
        self.pending_tx.capacity().unwrap_or(usize::MAX)
    }

    /// Payloads dropped because the pending queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn try_recv(&self) -> FabricResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.pending_rx.try_recv().ok())
    }

    pub fn recv_timeout(&self, timeout: Duration) -> FabricResult<Vec<u8>> {
        self.ensure_open()?;
        match self.pending_rx.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => {
                self.ensure_open()?;
                Err(FabricError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.state_error()),
        }
    }

    pub(crate) fn deliver(&self, payload: &[u8]) -> Delivery {
        if !self.is_open() {
            return Delivery::NotOpen;
        }
        let sink = self.sink.read().clone();
        match sink {
            Some(Sink::Notifier(notifier)) => {
                notifier.on_frame(payload);
                Delivery::Notified
            }
            Some(Sink::Queue) => match self.pending_tx.try_send(payload.to_vec()) {
                Ok(()) => Delivery::Notified,
                Err(TrySendError::Full(_)) => {
                    self.overflowed.fetch_add(1, Ordering::Relaxed);
                    Delivery::QueueFull
                }
                // The receiver lives as long as the handle.
                Err(TrySendError::Disconnected(_)) => Delivery::NotOpen,
            },
            None => Delivery::NoNotifier,
        }
    }

    fn set_sink(&self, sink: Sink) -> FabricResult<()> {
        self.ensure_open()?;
        *self.sink.write() = Some(sink);
        Ok(())
    }

    fn ensure_open(&self) -> FabricResult<()> {
        match self.state() {
            HandleState::Open => Ok(()),
            _ => Err(self.state_error()),
        }
    }

    fn state_error(&self) -> FabricError {
        match self.state() {
            HandleState::Dead => FabricError::LinkDown {
                remote: self.key.remote_id,
            },
            _ => FabricError::HandleClosed {
                remote: self.key.remote_id,
                port: self.key.port,
            },
        }
    }

    /// Moves to `state`, drops the notifier and discards queued payloads.
    fn retire(&self, state: HandleState) -> usize {
        self.state.store(state as u8, Ordering::Release);
        self.sink.write().take();
        self.pending_rx.try_iter().count()
    }
}

/// `(remote, port)` to handle mapping shared by every link of an endpoint.
#[derive(Debug)]
pub struct HandleTable {
    local_id: u32,
    queue_depth: usize,
    entries: RwLock<HashMap<HandleKey, Arc<TransferHandle>>>,
}

impl HandleTable {
    pub fn new(local_id: u32) -> Self {
        Self::with_queue_depth(local_id, DEFAULT_QUEUE_DEPTH)
    }

    /// A table whose handles queue at most `queue_depth` payloads each
    /// (at least one).
    pub fn with_queue_depth(local_id: u32, queue_depth: usize) -> Self {
        Self {
            local_id,
            queue_depth: queue_depth.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the handle for `(remote_id, port)`, creating it on first use.
    pub fn open(&self, remote_id: u32, port: u32) -> FabricResult<Arc<TransferHandle>> {
        if remote_id == self.local_id {
            return Err(FabricError::SelfAddressed { id: remote_id });
        }
        port::validate(port)?;

        let key = HandleKey { remote_id, port };
        if let Some(existing) = self.entries.read().get(&key) {
            return Ok(existing.clone());
        }
        let mut entries = self.entries.write();
        let handle = entries
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(remote = remote_id, port, "handle opened");
                Arc::new(TransferHandle::new(key, self.queue_depth))
            })
            .clone();
        Ok(handle)
    }

    /// Opens a handle on the lowest free user port toward `remote_id`.
    pub fn allocate(&self, remote_id: u32) -> FabricResult<Arc<TransferHandle>> {
        if remote_id == self.local_id {
            return Err(FabricError::SelfAddressed { id: remote_id });
        }
        let mut entries = self.entries.write();
        let port = (USER_PORT_BASE..PORT_LIMIT)
            .find(|port| {
                !entries.contains_key(&HandleKey {
                    remote_id,
                    port: *port,
                })
            })
            .ok_or(FabricError::PortsExhausted { remote: remote_id })?;
        let key = HandleKey { remote_id, port };
        let handle = Arc::new(TransferHandle::new(key, self.queue_depth));
        entries.insert(key, handle.clone());
        tracing::debug!(remote = remote_id, port, "port allocated");
        Ok(handle)
    }

    pub fn get(&self, remote_id: u32, port: u32) -> Option<Arc<TransferHandle>> {
        self.entries.read().get(&HandleKey { remote_id, port }).cloned()
    }

    pub fn register_notifier(
        &self,
        handle: &TransferHandle,
        notifier: Arc<dyn FrameNotifier>,
    ) -> FabricResult<()> {
        handle.set_sink(Sink::Notifier(notifier))
    }

    /// Removes `handle` from the table. Returns how many queued payloads were
    /// discarded.
    pub fn close(&self, handle: &TransferHandle) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&handle.key) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), handle) => {
                    entries.remove(&handle.key)
                }
                _ => None,
            }
        };
        let discarded = handle.retire(HandleState::Closed);
        if removed.is_some() {
            tracing::debug!(remote = handle.key.remote_id, port = handle.key.port, discarded, "handle closed");
        }
        discarded
    }

    /// Marks every handle toward `remote_id` dead and forgets it.
    pub fn mark_remote_dead(&self, remote_id: u32) -> usize {
        let dead: Vec<Arc<TransferHandle>> = {
            let mut entries = self.entries.write();
            let keys: Vec<HandleKey> = entries
                .keys()
                .filter(|key| key.remote_id == remote_id)
                .copied()
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        for handle in &dead {
            handle.retire(HandleState::Dead);
        }
        if !dead.is_empty() {
            tracing::warn!(remote = remote_id, handles = dead.len(), "handles marked dead");
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Open user-class handles toward `remote_id`.
    pub fn user_handles(&self, remote_id: u32) -> Vec<Arc<TransferHandle>> {
        self.entries
            .read()
            .values()
            .filter(|handle| {
                handle.key.remote_id == remote_id
                    && PortClass::of(handle.key.port) == Some(PortClass::User)
            })
            .cloned()
            .collect()
    }
}
