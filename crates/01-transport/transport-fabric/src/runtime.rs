use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::link::Link;

/// Something a polling loop can drive. Returns the amount of work done.
pub trait Poller: Send + Sync {
    fn poll(&self) -> usize;
    fn name(&self) -> &'static str;
}

impl Poller for Link {
    fn poll(&self) -> usize {
        if !self.is_up() {
            return 0;
        }
        match Link::poll(self) {
            Ok(report) => report.frames,
            Err(err) => {
                tracing::debug!(remote = self.remote_id(), %err, "link poll failed");
                0
            }
        }
    }

    fn name(&self) -> &'static str {
        "link"
    }
}

impl Poller for Endpoint {
    fn poll(&self) -> usize {
        Endpoint::poll(self)
    }

    fn name(&self) -> &'static str {
        "endpoint"
    }
}

/// Drives registered pollers in place of (or alongside) doorbell delivery.
#[derive(Clone, Default)]
pub struct PollRuntime {
    pollers: Vec<Arc<dyn Poller>>,
}

impl PollRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, poller: Arc<dyn Poller>) {
        tracing::debug!(poller = poller.name(), "poller registered");
        self.pollers.push(poller);
    }

    pub fn run_tick(&self) -> usize {
        self.pollers.iter().map(|poller| poller.poll()).sum()
    }

    /// Ticks until no work has been found for `idle_threshold`.
    pub fn run_until_idle(&self, idle_threshold: Duration) -> usize {
        let mut total = 0;
        let mut last_work = Instant::now();
        loop {
            let work = self.run_tick();
            total += work;
            if work > 0 {
                last_work = Instant::now();
            } else if last_work.elapsed() >= idle_threshold {
                return total;
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Ticks on a background thread every `interval` until stopped.
    pub fn spawn(self, interval: Duration) -> std::io::Result<PollThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("fabric-poll".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if self.run_tick() == 0 {
                        std::thread::sleep(interval);
                    }
                }
            })?;
        Ok(PollThread {
            stop,
            join: Some(join),
        })
    }
}

/// Background polling started by [`PollRuntime::spawn`]. Stops on drop.
pub struct PollThread {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollThread {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.halt();
    }
}
