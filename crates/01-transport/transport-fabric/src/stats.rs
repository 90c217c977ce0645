use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::dispatch::DispatchOutcome;

/// Buckets of the received payload size histogram. Bucket `n` counts payloads
/// of `2^(n-1)..2^n` bytes; the last one takes everything larger.
pub const SIZE_BUCKETS: usize = 16;

fn size_bucket(len: usize) -> usize {
    ((usize::BITS - len.leading_zeros()) as usize).min(SIZE_BUCKETS - 1)
}

/// Per-link counters. Everything is relaxed; the numbers are for diagnostics,
/// not for synchronisation.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    largest_frame: AtomicU64,
    signals: AtomicU64,
    backpressure: AtomicU64,
    no_slot: AtomicU64,
    would_block: AtomicU64,
    delivered: AtomicU64,
    misaddressed: AtomicU64,
    no_handle: AtomicU64,
    no_notifier: AtomicU64,
    queue_full: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    stalls: AtomicU64,
    corrupt: AtomicU64,
    signal_ns_total: AtomicU64,
    signal_ns_max: AtomicU64,
    dispatch_ns_total: AtomicU64,
    dispatch_ns_max: AtomicU64,
    payload_sizes: [AtomicU64; SIZE_BUCKETS],
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_push(&self, frame_size: usize, payload_len: usize) {
        bump(&self.frames_sent);
        self.bytes_sent
            .fetch_add(payload_len as u64, Ordering::Relaxed);
        self.largest_frame
            .fetch_max(frame_size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_pop(&self, frame_size: usize, payload_len: usize) {
        bump(&self.frames_received);
        bump(&self.payload_sizes[size_bucket(payload_len)]);
        self.bytes_received
            .fetch_add(payload_len as u64, Ordering::Relaxed);
        self.largest_frame
            .fetch_max(frame_size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_signal(&self, latency: Duration) {
        bump(&self.signals);
        let ns = nanos(latency);
        self.signal_ns_total.fetch_add(ns, Ordering::Relaxed);
        self.signal_ns_max.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure(&self) {
        bump(&self.backpressure);
    }

    pub(crate) fn record_no_slot(&self) {
        bump(&self.no_slot);
    }

    pub(crate) fn record_would_block(&self) {
        bump(&self.would_block);
    }

    pub(crate) fn record_dispatch(&self, outcome: DispatchOutcome, elapsed: Duration) {
        match outcome {
            DispatchOutcome::Delivered => {
                bump(&self.delivered);
                let ns = nanos(elapsed);
                self.dispatch_ns_total.fetch_add(ns, Ordering::Relaxed);
                self.dispatch_ns_max.fetch_max(ns, Ordering::Relaxed);
            }
            DispatchOutcome::Misaddressed => bump(&self.misaddressed),
            DispatchOutcome::NoHandle => bump(&self.no_handle),
            DispatchOutcome::NoNotifier => bump(&self.no_notifier),
            DispatchOutcome::QueueFull => bump(&self.queue_full),
        }
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        bump(&self.heartbeats_sent);
    }

    pub(crate) fn record_heartbeat_received(&self) {
        bump(&self.heartbeats_received);
    }

    pub(crate) fn record_stall(&self) {
        bump(&self.stalls);
    }

    pub(crate) fn record_corrupt(&self) {
        bump(&self.corrupt);
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        LinkStatsSnapshot {
            frames_sent: load(&self.frames_sent),
            bytes_sent: load(&self.bytes_sent),
            frames_received: load(&self.frames_received),
            bytes_received: load(&self.bytes_received),
            largest_frame: load(&self.largest_frame),
            signals: load(&self.signals),
            backpressure: load(&self.backpressure),
            no_slot: load(&self.no_slot),
            would_block: load(&self.would_block),
            delivered: load(&self.delivered),
            misaddressed: load(&self.misaddressed),
            no_handle: load(&self.no_handle),
            no_notifier: load(&self.no_notifier),
            queue_full: load(&self.queue_full),
            heartbeats_sent: load(&self.heartbeats_sent),
            heartbeats_received: load(&self.heartbeats_received),
            stalls: load(&self.stalls),
            corrupt: load(&self.corrupt),
            signal_ns_total: load(&self.signal_ns_total),
            signal_ns_max: load(&self.signal_ns_max),
            dispatch_ns_total: load(&self.dispatch_ns_total),
            dispatch_ns_max: load(&self.dispatch_ns_max),
            payload_sizes: std::array::from_fn(|bucket| load(&self.payload_sizes[bucket])),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub largest_frame: u64,
    pub signals: u64,
    pub backpressure: u64,
    pub no_slot: u64,
    pub would_block: u64,
    pub delivered: u64,
    pub misaddressed: u64,
    pub no_handle: u64,
    pub no_notifier: u64,
    pub queue_full: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub stalls: u64,
    pub corrupt: u64,
    pub signal_ns_total: u64,
    pub signal_ns_max: u64,
    pub dispatch_ns_total: u64,
    pub dispatch_ns_max: u64,
    pub payload_sizes: [u64; SIZE_BUCKETS],
}

impl LinkStatsSnapshot {
    /// Frames popped but not handed to any notifier.
    pub fn dropped(&self) -> u64 {
        self.misaddressed + self.no_handle + self.no_notifier + self.queue_full
    }

    pub fn mean_signal_latency(&self) -> Duration {
        match self.signals {
            0 => Duration::ZERO,
            n => Duration::from_nanos(self.signal_ns_total / n),
        }
    }
}
