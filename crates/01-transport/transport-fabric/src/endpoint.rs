//! A domain's view of the fabric: its handle table and one link per remote.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::config::TransportConfig;
use crate::error::{FabricError, FabricResult};
use crate::handle::{FrameNotifier, HandleTable, TransferHandle};
use crate::handshake::{ExposedRegion, RegionMapper};
use crate::link::{DrainReport, Link, LinkSetup, SendOutcome};
use crate::mailbox::{
    Doorbell, InterruptController, InterruptLine, MailboxMessage, MailboxReader,
    MailboxRegisters, originator_of,
};
use transport::MemoryWindow;

pub struct Endpoint {
    config: TransportConfig,
    handles: Arc<HandleTable>,
    links: RwLock<HashMap<u32, Arc<Link>>>,
    /// Remotes whose handshake failed. Not retried until connected again.
    failed: RwLock<HashSet<u32>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_id", &self.config.local_id)
            .field("links", &self.links.read().keys().collect::<Vec<_>>())
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl Endpoint {
    pub fn new(config: TransportConfig) -> FabricResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            handles: Arc::new(HandleTable::with_queue_depth(
                config.local_id,
                config.queue_depth,
            )),
            config,
            links: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashSet::new()),
        }))
    }

    pub fn local_id(&self) -> u32 {
        self.config.local_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn open(&self, remote_id: u32, port: u32) -> FabricResult<Arc<TransferHandle>> {
        self.handles.open(remote_id, port)
    }

    pub fn allocate(&self, remote_id: u32) -> FabricResult<Arc<TransferHandle>> {
        self.handles.allocate(remote_id)
    }

    pub fn register_notifier(
        &self,
        handle: &TransferHandle,
        notifier: Arc<dyn FrameNotifier>,
    ) -> FabricResult<()> {
        self.handles.register_notifier(handle, notifier)
    }

    pub fn close(&self, handle: &TransferHandle) -> usize {
        self.handles.close(handle)
    }

    /// Builds the doorbell this endpoint uses to reach `remote_id`.
    pub fn doorbell(
        &self,
        remote_id: u32,
        regs: Arc<dyn MailboxRegisters>,
        line: Arc<dyn InterruptLine>,
    ) -> Arc<Doorbell> {
        Arc::new(Doorbell::new(
            self.config.local_id,
            remote_id,
            regs,
            line,
            &self.config.doorbell,
        ))
    }

    /// Owner side of a new link to `remote_id`.
    pub fn connect_owner(
        &self,
        remote_id: u32,
        boot: &dyn MemoryWindow,
        doorbell: Arc<Doorbell>,
        primary: ExposedRegion,
        extended: Option<ExposedRegion>,
    ) -> FabricResult<Arc<Link>> {
        let setup = self.setup(remote_id, boot, doorbell)?;
        self.install(remote_id, Link::establish_owner(setup, primary, extended))
    }

    /// Peer side of a new link to `remote_id`.
    pub fn connect_peer(
        &self,
        remote_id: u32,
        boot: &dyn MemoryWindow,
        doorbell: Arc<Doorbell>,
        mapper: &dyn RegionMapper,
    ) -> FabricResult<Arc<Link>> {
        let setup = self.setup(remote_id, boot, doorbell)?;
        self.install(remote_id, Link::establish_peer(setup, mapper))
    }

    fn setup<'a>(
        &'a self,
        remote_id: u32,
        boot: &'a dyn MemoryWindow,
        doorbell: Arc<Doorbell>,
    ) -> FabricResult<LinkSetup<'a>> {
        if remote_id == self.config.local_id {
            return Err(FabricError::SelfAddressed { id: remote_id });
        }
        let links = self.links.read();
        if let Some(existing) = links.get(&remote_id) {
            if existing.is_up() {
                return Err(FabricError::InvalidConfig("link to remote already up"));
            }
        }
        // Incoming doorbells are routed by originator alone.
        let originator = originator_of(remote_id);
        if let Some(&existing) = links
            .keys()
            .find(|&&id| id != remote_id && originator_of(id) == originator)
        {
            return Err(FabricError::OriginatorClash {
                remote: remote_id,
                existing,
                originator,
            });
        }
        drop(links);
        Ok(LinkSetup {
            config: &self.config,
            remote_id,
            boot,
            doorbell,
            handles: self.handles.clone(),
        })
    }

    fn install(&self, remote_id: u32, result: FabricResult<Arc<Link>>) -> FabricResult<Arc<Link>> {
        match result {
            Ok(link) => {
                self.failed.write().remove(&remote_id);
                self.links.write().insert(remote_id, link.clone());
                Ok(link)
            }
            Err(err) => {
                tracing::warn!(local = self.config.local_id, remote = remote_id, %err, "link establishment failed");
                self.failed.write().insert(remote_id);
                Err(err)
            }
        }
    }

    /// The live link to `remote_id`.
    pub fn link(&self, remote_id: u32) -> FabricResult<Arc<Link>> {
        if self.failed.read().contains(&remote_id) {
            return Err(FabricError::LinkDown { remote: remote_id });
        }
        let link = self
            .links
            .read()
            .get(&remote_id)
            .cloned()
            .ok_or(FabricError::UnknownRemote { remote: remote_id })?;
        if !link.is_up() {
            return Err(FabricError::LinkDown { remote: remote_id });
        }
        Ok(link)
    }

    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links.read().values().cloned().collect()
    }

    pub fn send(
        &self,
        handle: &TransferHandle,
        slot: u32,
        payload: &[u8],
    ) -> FabricResult<SendOutcome> {
        self.link(handle.remote_id())?.send(handle, slot, payload)
    }

    /// Routes a doorbell to the link of the domain that rang it.
    pub fn on_doorbell(&self, message: &MailboxMessage) -> FabricResult<DrainReport> {
        let originator = message.info.originator;
        let link = self
            .links
            .read()
            .values()
            .find(|link| originator_of(link.remote_id()) == originator)
            .cloned();
        match link {
            Some(link) => link.on_doorbell(message),
            None => {
                tracing::warn!(originator, slot = message.slot, "doorbell from unknown domain");
                Err(FabricError::UnknownRemote {
                    remote: originator as u32,
                })
            }
        }
    }

    /// Registers a handler for every slot of the local mailbox. Each handler
    /// takes the slot's message, releases the slot and drains the link of the
    /// domain that rang it.
    ///
    /// Slot `n` is delivered on vector `n`, so the controller must have a
    /// vector for every slot. Nothing is registered otherwise.
    pub fn attach_interrupts(
        self: &Arc<Self>,
        controller: &dyn InterruptController,
        mailbox: MailboxReader,
    ) -> FabricResult<()> {
        let slots = mailbox.slot_count();
        let vectors = controller.vector_count();
        if slots > vectors {
            return Err(FabricError::TooManySlots { slots, vectors });
        }
        for vector in 0..slots {
            let endpoint: Weak<Self> = Arc::downgrade(self);
            let mailbox = mailbox.clone();
            controller.register(
                vector,
                Arc::new(move |vector: u32| {
                    let message = mailbox.take(vector);
                    let Some(endpoint) = endpoint.upgrade() else {
                        return;
                    };
                    if let Err(err) = endpoint.on_doorbell(&message) {
                        tracing::debug!(vector, %err, "doorbell handling failed");
                    }
                }),
            );
        }
        tracing::debug!(local = self.config.local_id, slots, "interrupt handlers registered");
        Ok(())
    }

    /// Polls every live link once. Returns the number of frames drained.
    pub fn poll(&self) -> usize {
        let mut frames = 0;
        for link in self.links() {
            if !link.is_up() {
                continue;
            }
            match link.poll() {
                Ok(report) => frames += report.frames,
                Err(err) => tracing::debug!(remote = link.remote_id(), %err, "poll failed"),
            }
        }
        frames
    }

    /// Sends a heartbeat on every live link.
    pub fn heartbeat(&self) -> usize {
        self.links()
            .iter()
            .filter(|link| link.is_up())
            .filter(|link| matches!(link.heartbeat(), Ok(outcome) if outcome.is_queued()))
            .count()
    }

    /// Shuts the link to `remote_id` down and forgets it.
    pub fn disconnect(&self, remote_id: u32) -> bool {
        let removed = self.links.write().remove(&remote_id);
        match removed {
            Some(link) => {
                link.shutdown();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{regs, InterruptHandler};
    use parking_lot::Mutex;

    /// Mailbox that only reports its slot count.
    struct SlotCount(u32);

    impl MailboxRegisters for SlotCount {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                regs::SLOT_COUNT => self.0,
                _ => 0,
            }
        }

        fn write32(&self, _offset: usize, _value: u32) {}
    }

    struct FewVectors {
        count: u32,
        registered: Mutex<Vec<u32>>,
    }

    impl InterruptController for FewVectors {
        fn vector_count(&self) -> u32 {
            self.count
        }

        fn register(&self, vector: u32, _handler: InterruptHandler) {
            self.registered.lock().push(vector);
        }

        fn unregister(&self, vector: u32) {
            self.registered.lock().retain(|&v| v != vector);
        }
    }

    #[test]
    fn unknown_and_self_remotes() {
        let endpoint = Endpoint::new(TransportConfig::for_domain(3)).unwrap();
        assert!(matches!(
            endpoint.link(9),
            Err(FabricError::UnknownRemote { remote: 9 })
        ));
        assert!(matches!(
            endpoint.open(3, 20),
            Err(FabricError::SelfAddressed { id: 3 })
        ));
        let handle = endpoint.open(9, 20).unwrap();
        assert!(matches!(
            endpoint.send(&handle, 0, b"x"),
            Err(FabricError::UnknownRemote { remote: 9 })
        ));
        assert_eq!(endpoint.poll(), 0);
        assert!(!endpoint.disconnect(9));
    }

    #[test]
    fn every_slot_needs_a_vector() {
        let endpoint = Endpoint::new(TransportConfig::for_domain(3)).unwrap();
        let controller = FewVectors {
            count: 4,
            registered: Mutex::new(Vec::new()),
        };

        let wide = MailboxReader::new(Arc::new(SlotCount(8)));
        assert!(matches!(
            endpoint.attach_interrupts(&controller, wide),
            Err(FabricError::TooManySlots {
                slots: 8,
                vectors: 4
            })
        ));
        assert!(controller.registered.lock().is_empty());

        let fits = MailboxReader::new(Arc::new(SlotCount(4)));
        endpoint.attach_interrupts(&controller, fits).unwrap();
        assert_eq!(*controller.registered.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = TransportConfig {
            drain_budget: 0,
            ..TransportConfig::for_domain(1)
        };
        assert!(Endpoint::new(config).is_err());
    }
}
