//! Routing popped frames to handles.

use std::sync::Arc;

use transport::Frame;

use crate::handle::{Delivery, HandleTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The frame names a different destination domain.
    Misaddressed,
    NoHandle,
    NoNotifier,
    /// The handle's pending queue was full.
    QueueFull,
}

impl DispatchOutcome {
    pub fn is_delivered(self) -> bool {
        self == DispatchOutcome::Delivered
    }
}

/// Delivers frames arriving over a link to the matching handle.
///
/// A frame's `target_id` names the domain it is addressed to; on arrival that
/// must be this domain. The handle it belongs to is the one this domain holds
/// toward the sender, `(source, port)`. Frames with nowhere to go are dropped
/// with a diagnostic; the ring has already advanced past them.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    local_id: u32,
    handles: Arc<HandleTable>,
}

impl Dispatcher {
    pub fn new(handles: Arc<HandleTable>) -> Self {
        Self {
            local_id: handles.local_id(),
            handles,
        }
    }

    pub fn dispatch(&self, source: u32, frame: &Frame) -> DispatchOutcome {
        let header = frame.header;
        if header.target_id != self.local_id {
            tracing::warn!(
                source,
                target = header.target_id,
                port = header.port,
                "dropping frame addressed to another domain"
            );
            return DispatchOutcome::Misaddressed;
        }

        let Some(handle) = self.handles.get(source, header.port) else {
            tracing::warn!(source, port = header.port, len = frame.payload.len(), "dropping frame for unopened port");
            return DispatchOutcome::NoHandle;
        };

        match handle.deliver(&frame.payload) {
            Delivery::Notified => DispatchOutcome::Delivered,
            Delivery::NoNotifier | Delivery::NotOpen => {
                tracing::warn!(source, port = header.port, "dropping frame, handle has no notifier");
                DispatchOutcome::NoNotifier
            }
            Delivery::QueueFull => {
                tracing::warn!(
                    source,
                    port = header.port,
                    overflowed = handle.overflowed(),
                    "dropping frame, handle queue full"
                );
                DispatchOutcome::QueueFull
            }
        }
    }
}
