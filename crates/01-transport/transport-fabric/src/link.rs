//! A bidirectional link to one remote domain.
//!
//! The link owns the two rings carved out of the shared region, the doorbell
//! toward the remote and the dispatcher for incoming frames. Sending pushes a
//! frame into the tx ring and then rings the doorbell; a doorbell that cannot
//! be rung leaves the frame in the ring for the next signal or for the
//! remote's polling pass. Receiving drains the rx ring in budgeted batches.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use transport::{FrameHeader, LinkError, MemoryWindow, RingBuffer, RingError};

use crate::config::TransportConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{FabricError, FabricResult};
use crate::handle::{HandleTable, TransferHandle};
use crate::handshake::{Established, ExposedRegion, Handshake, RegionMapper, SharedRegion};
use crate::layout::{LinkLayout, LinkRole};
use crate::mailbox::{Doorbell, MailboxMessage, SignalOutcome, CATEGORY_RING};
use crate::port::HEARTBEAT_PORT;
use crate::stats::{LinkStats, LinkStatsSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Up = 0,
    Dead = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued and the remote's doorbell rung.
    Signalled,
    /// Frame queued; the doorbell is owed and goes out with a later signal.
    Pending,
    /// Not enough ring space. Nothing was written.
    WouldBlock,
}

impl SendOutcome {
    pub fn is_queued(self) -> bool {
        !matches!(self, SendOutcome::WouldBlock)
    }
}

/// What a drain pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub frames: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub heartbeats: usize,
    /// A published frame never became visible during this pass.
    pub stalled: bool,
    /// The budget ran out with frames possibly left in the ring.
    pub budget_exhausted: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.frames += other.frames;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.heartbeats += other.heartbeats;
        self.stalled |= other.stalled;
        self.budget_exhausted = other.budget_exhausted;
    }
}

/// Everything both ends need besides the region itself.
pub struct LinkSetup<'a> {
    pub config: &'a TransportConfig,
    pub remote_id: u32,
    /// Bootstrap window the handshake runs over.
    pub boot: &'a dyn MemoryWindow,
    /// Doorbell into the remote domain's mailbox.
    pub doorbell: Arc<Doorbell>,
    pub handles: Arc<HandleTable>,
}

pub struct Link {
    local_id: u32,
    remote_id: u32,
    role: LinkRole,
    regions: Established,
    tx: RingBuffer,
    rx: RingBuffer,
    doorbell: Arc<Doorbell>,
    dispatcher: Dispatcher,
    /// Held across pop and dispatch so concurrent drainers deliver in ring order.
    drain_lock: Mutex<()>,
    handles: Arc<HandleTable>,
    stats: LinkStats,
    state: AtomicU8,
    signal_owed: AtomicBool,
    drain_budget: usize,
    heartbeat_seq: AtomicU64,
    last_heartbeat: AtomicU64,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("region", &self.regions.primary)
            .finish()
    }
}

impl Link {
    /// Owner side: lays the rings out in `primary`, then exposes it (and
    /// `extended`) to the peer.
    ///
    /// The counters are zeroed before the region is advertised, so the peer
    /// never observes a half-initialised ring.
    pub fn establish_owner(
        setup: LinkSetup<'_>,
        primary: ExposedRegion,
        extended: Option<ExposedRegion>,
    ) -> FabricResult<Arc<Self>> {
        let layout = LinkLayout::for_region(primary.window.len())?;
        let (tx_layout, rx_layout) = layout.split(LinkRole::Owner);
        let ring_config = setup.config.ring.ring_config();
        let tx = RingBuffer::init(primary.window.clone(), tx_layout, ring_config)?;
        let rx = RingBuffer::init(primary.window.clone(), rx_layout, ring_config)?;

        let handshake = Handshake::new(setup.boot, setup.config.handshake.poll.policy())?;
        let regions = handshake.expose(&primary, extended.as_ref())?;
        Ok(Self::assemble(setup, LinkRole::Owner, regions, tx, rx))
    }

    /// Peer side: waits for the owner's regions, maps them and attaches to the
    /// rings the owner laid out.
    pub fn establish_peer(setup: LinkSetup<'_>, mapper: &dyn RegionMapper) -> FabricResult<Arc<Self>> {
        let handshake = Handshake::new(setup.boot, setup.config.handshake.poll.policy())?;
        let regions = handshake.accept(mapper)?;

        let window = regions.primary.window().clone();
        let layout = LinkLayout::for_region(window.len())?;
        let (tx_layout, rx_layout) = layout.split(LinkRole::Peer);
        let ring_config = setup.config.ring.ring_config();
        let tx = RingBuffer::attach(window.clone(), tx_layout, ring_config)?;
        let rx = RingBuffer::attach(window, rx_layout, ring_config)?;
        Ok(Self::assemble(setup, LinkRole::Peer, regions, tx, rx))
    }

    fn assemble(
        setup: LinkSetup<'_>,
        role: LinkRole,
        regions: Established,
        tx: RingBuffer,
        rx: RingBuffer,
    ) -> Arc<Self> {
        tracing::info!(
            local = setup.config.local_id,
            remote = setup.remote_id,
            ?role,
            capacity = tx.capacity(),
            "link up"
        );
        Arc::new(Self {
            local_id: setup.config.local_id,
            remote_id: setup.remote_id,
            role,
            regions,
            tx,
            rx,
            doorbell: setup.doorbell,
            dispatcher: Dispatcher::new(setup.handles.clone()),
            drain_lock: Mutex::new(()),
            handles: setup.handles,
            stats: LinkStats::new(),
            state: AtomicU8::new(LinkState::Up as u8),
            signal_owed: AtomicBool::new(false),
            drain_budget: setup.config.drain_budget,
            heartbeat_seq: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
        })
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn region(&self) -> &SharedRegion {
        &self.regions.primary
    }

    pub fn extended_region(&self) -> Option<&SharedRegion> {
        self.regions.extended.as_ref()
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            0 => LinkState::Up,
            _ => LinkState::Dead,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state() == LinkState::Up
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a doorbell is owed for frames already in the tx ring.
    pub fn signal_owed(&self) -> bool {
        self.signal_owed.load(Ordering::Acquire)
    }

    /// Sequence number of the last heartbeat received, zero if none.
    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Acquire)
    }

    pub fn tx_ring(&self) -> &RingBuffer {
        &self.tx
    }

    pub fn rx_ring(&self) -> &RingBuffer {
        &self.rx
    }

    /// Queues `payload` for the handle's peer and rings its doorbell.
    pub fn send(
        &self,
        handle: &TransferHandle,
        slot: u32,
        payload: &[u8],
    ) -> FabricResult<SendOutcome> {
        if !handle.is_open() {
            return Err(FabricError::HandleClosed {
                remote: handle.remote_id(),
                port: handle.port(),
            });
        }
        if handle.remote_id() != self.remote_id {
            return Err(FabricError::UnknownRemote {
                remote: handle.remote_id(),
            });
        }
        self.transmit(handle.port(), slot, payload)
    }

    /// Sends a heartbeat carrying a fresh sequence number.
    pub fn heartbeat(&self) -> FabricResult<SendOutcome> {
        let seq = self.heartbeat_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let outcome = self.transmit(HEARTBEAT_PORT, 0, &seq.to_le_bytes())?;
        if outcome.is_queued() {
            self.stats.record_heartbeat_sent();
        }
        Ok(outcome)
    }

    fn transmit(&self, port: u32, slot: u32, payload: &[u8]) -> FabricResult<SendOutcome> {
        self.ensure_up()?;
        let header = FrameHeader::new(self.remote_id, slot, port);
        match self.tx.push(header, payload) {
            Ok(frame_size) => self.stats.record_push(frame_size, payload.len()),
            Err(RingError::Full { needed, free }) => {
                tracing::debug!(remote = self.remote_id, port, needed, free, "tx ring full");
                self.stats.record_would_block();
                // The remote may be waiting on an owed doorbell to make room.
                if self.signal_owed() {
                    self.ring_doorbell()?;
                }
                return Ok(SendOutcome::WouldBlock);
            }
            Err(RingError::Link(err)) => return Err(self.fail(err)),
            Err(err) => return Err(err.into()),
        }
        self.ring_doorbell()
    }

    fn ring_doorbell(&self) -> FabricResult<SendOutcome> {
        let (write, _) = self.tx.last_seen();
        let words = [write as u32, (write >> 32) as u32];
        match self.doorbell.signal(&words, CATEGORY_RING) {
            Ok(SignalOutcome::Signalled { latency, .. }) => {
                self.signal_owed.store(false, Ordering::Release);
                self.stats.record_signal(latency);
                Ok(SendOutcome::Signalled)
            }
            Ok(SignalOutcome::Backpressure { .. }) => {
                self.signal_owed.store(true, Ordering::Release);
                self.stats.record_backpressure();
                Ok(SendOutcome::Pending)
            }
            Err(FabricError::NoSlot { remote }) => {
                tracing::warn!(remote, "doorbell not rung, frame left for polling");
                self.signal_owed.store(true, Ordering::Release);
                self.stats.record_no_slot();
                Ok(SendOutcome::Pending)
            }
            Err(err) => Err(err),
        }
    }

    /// Pops and dispatches up to `budget` frames.
    ///
    /// Drains of one link are serialized: a second caller waits until the first
    /// one's pass is over. Notifiers run under that guard and must not drain
    /// their own link.
    pub fn drain(&self, budget: usize) -> FabricResult<DrainReport> {
        self.ensure_up()?;
        let _draining = self.drain_lock.lock();
        let mut report = DrainReport::default();
        for _ in 0..budget {
            let frame = match self.rx.pop(usize::MAX) {
                Ok(frame) => frame,
                Err(RingError::Empty) => return Ok(report),
                Err(RingError::NotVisible { offset }) => {
                    tracing::debug!(remote = self.remote_id, offset, "drain stopped at an incomplete frame");
                    self.stats.record_stall();
                    report.stalled = true;
                    return Ok(report);
                }
                Err(RingError::Corrupt {
                    offset,
                    frame_size,
                    used,
                }) => {
                    tracing::debug!(remote = self.remote_id, offset, frame_size, used, "skipped corrupt frame");
                    self.stats.record_corrupt();
                    continue;
                }
                Err(RingError::Link(err)) => return Err(self.fail(err)),
                Err(err) => return Err(err.into()),
            };

            report.frames += 1;
            self.stats.record_pop(frame.frame_size, frame.payload.len());

            if frame.header.port == HEARTBEAT_PORT && frame.header.target_id == self.local_id {
                self.absorb_heartbeat(&frame.payload);
                report.heartbeats += 1;
                continue;
            }

            let started = Instant::now();
            let outcome = self.dispatcher.dispatch(self.remote_id, &frame);
            self.stats.record_dispatch(outcome, started.elapsed());
            match outcome {
                DispatchOutcome::Delivered => report.delivered += 1,
                _ => report.dropped += 1,
            }
        }
        report.budget_exhausted = true;
        Ok(report)
    }

    /// Handles a doorbell from the remote: drains until the ring is empty,
    /// one budget at a time.
    pub fn on_doorbell(&self, message: &MailboxMessage) -> FabricResult<DrainReport> {
        tracing::trace!(
            remote = self.remote_id,
            slot = message.slot,
            category = message.info.category,
            "doorbell"
        );
        let mut total = DrainReport::default();
        loop {
            let report = self.drain(self.drain_budget)?;
            total.absorb(report);
            if !report.budget_exhausted || report.stalled {
                return Ok(total);
            }
        }
    }

    /// One polling pass: settles an owed doorbell, then drains one budget.
    pub fn poll(&self) -> FabricResult<DrainReport> {
        self.ensure_up()?;
        if self.signal_owed() {
            self.ring_doorbell()?;
        }
        self.drain(self.drain_budget)
    }

    /// Takes the link down and retires its handles.
    pub fn shutdown(&self) {
        if self.mark_dead() {
            tracing::info!(remote = self.remote_id, "link shut down");
        }
    }

    fn absorb_heartbeat(&self, payload: &[u8]) {
        let Ok(raw) = <[u8; 8]>::try_from(payload) else {
            tracing::warn!(remote = self.remote_id, len = payload.len(), "malformed heartbeat");
            return;
        };
        let seq = u64::from_le_bytes(raw);
        self.last_heartbeat.fetch_max(seq, Ordering::AcqRel);
        self.stats.record_heartbeat_received();
    }

    fn ensure_up(&self) -> FabricResult<()> {
        if self.is_up() {
            Ok(())
        } else {
            Err(FabricError::LinkDown {
                remote: self.remote_id,
            })
        }
    }

    fn fail(&self, err: LinkError) -> FabricError {
        if self.mark_dead() {
            tracing::error!(remote = self.remote_id, %err, "link failed");
        }
        FabricError::Link(err)
    }

    fn mark_dead(&self) -> bool {
        let was = self.state.swap(LinkState::Dead as u8, Ordering::AcqRel);
        if was == LinkState::Dead as u8 {
            return false;
        }
        self.handles.mark_remote_dead(self.remote_id);
        true
    }
}
