use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure};
use transport::{BusMemory, RegionInit};
use transport_fabric::handshake::boot;
use transport_fabric::{
    Endpoint, ExposedRegion, InterruptLine, Link, MailboxReader, PollRuntime, RegionMapper,
    RetrySection, TransportConfig,
};

use crate::bus::BusMap;
use crate::fault::{FaultPlan, FaultyMapper};
use crate::irq::{IrqController, SilentLine};
use crate::mailbox::LoopbackMailbox;

const BOOT_BUS_ADDRESS: u64 = 0x0010_0000;
const REGION_BUS_BASE: u64 = 0x8000_0000;

/// Configuration with waits short enough for tests.
pub fn quick_config(local_id: u32) -> TransportConfig {
    let mut config = TransportConfig::for_domain(local_id);
    config.doorbell.slot_poll = RetrySection::new(4, 10, 1);
    config.doorbell.attempts = RetrySection::new(2, 50, 2);
    config.handshake.poll = RetrySection::new(5_000, 200, 1);
    config
}

/// Knobs for [`LoopbackPair::establish`].
#[derive(Clone)]
pub struct LoopbackOptions {
    /// Configuration of the domain that allocates the shared region.
    pub owner: TransportConfig,
    /// Configuration of the domain that maps it.
    pub peer: TransportConfig,
    /// Size of the primary shared region.
    pub region_len: usize,
    /// Size of the extended region, if one is exposed.
    pub extended_len: Option<usize>,
    /// Request slots in each domain's mailbox.
    pub mailbox_slots: u32,
    /// Deliver doorbells on interrupt threads; otherwise both sides must poll.
    pub interrupts: bool,
    /// Faults applied to every window the peer maps.
    pub peer_faults: Option<Arc<FaultPlan>>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            owner: quick_config(1),
            peer: quick_config(7),
            region_len: 64 * 1024,
            extended_len: None,
            mailbox_slots: 16,
            interrupts: true,
            peer_faults: None,
        }
    }
}

/// One side of a loopback link.
pub struct Domain {
    /// The domain's endpoint.
    pub endpoint: Arc<Endpoint>,
    /// Its link to the other side.
    pub link: Arc<Link>,
    /// The domain's own mailbox register file.
    pub mailbox: Arc<LoopbackMailbox>,
    /// Interrupt delivery, when enabled.
    pub irq: Option<Arc<IrqController>>,
}

impl Domain {
    /// Identity of this domain.
    pub fn id(&self) -> u32 {
        self.endpoint.local_id()
    }
}

/// Two domains in one process joined by a fully established link.
pub struct LoopbackPair {
    /// Domain that allocated and exposed the region.
    pub owner: Domain,
    /// Domain that mapped it.
    pub peer: Domain,
    /// The simulated address space both sides share.
    pub bus: Arc<BusMap>,
    /// Bootstrap window the handshake ran over.
    pub boot: Arc<BusMemory>,
}

impl LoopbackPair {
    /// Builds both domains and runs the handshake, the peer on its own thread.
    pub fn establish(options: LoopbackOptions) -> anyhow::Result<Self> {
        let owner_id = options.owner.local_id;
        let peer_id = options.peer.local_id;
        ensure!(owner_id != peer_id, "loopback domains need distinct ids");

        let bus = Arc::new(BusMap::new(REGION_BUS_BASE));
        let boot = Arc::new(BusMemory::new_aligned(
            boot::LEN,
            64,
            BOOT_BUS_ADDRESS,
            RegionInit::Zeroed,
        )?);
        let owner_mailbox = Arc::new(LoopbackMailbox::new(options.mailbox_slots));
        let peer_mailbox = Arc::new(LoopbackMailbox::new(options.mailbox_slots));
        let owner = Endpoint::new(options.owner)?;
        let peer = Endpoint::new(options.peer)?;

        let (owner_irq, peer_irq) = if options.interrupts {
            (
                Some(IrqController::start("owner")?),
                Some(IrqController::start("peer")?),
            )
        } else {
            (None, None)
        };
        if let Some(irq) = &owner_irq {
            owner.attach_interrupts(&**irq, MailboxReader::new(owner_mailbox.clone()))?;
        }
        if let Some(irq) = &peer_irq {
            peer.attach_interrupts(&**irq, MailboxReader::new(peer_mailbox.clone()))?;
        }
        let line_into = |irq: &Option<Arc<IrqController>>| -> Arc<dyn InterruptLine> {
            match irq {
                Some(irq) => irq.line(),
                None => Arc::new(SilentLine),
            }
        };
        let owner_doorbell = owner.doorbell(peer_id, peer_mailbox.clone(), line_into(&peer_irq));
        let peer_doorbell = peer.doorbell(owner_id, owner_mailbox.clone(), line_into(&owner_irq));

        let primary = bus.allocate(options.region_len)?;
        let extended = options
            .extended_len
            .map(|len| bus.allocate(len))
            .transpose()?;
        let mapper: Arc<dyn RegionMapper> = match &options.peer_faults {
            Some(plan) => Arc::new(FaultyMapper::new(bus.clone(), plan.clone())),
            None => bus.clone(),
        };

        let (owner_link, peer_link) = thread::scope(|scope| {
            let peer_side =
                scope.spawn(|| peer.connect_peer(owner_id, &*boot, peer_doorbell, &*mapper));
            let owner_link = owner.connect_owner(
                peer_id,
                &*boot,
                owner_doorbell,
                ExposedRegion::from_bus_memory(primary),
                extended.map(ExposedRegion::from_bus_memory),
            );
            let peer_link = peer_side
                .join()
                .map_err(|_| anyhow!("peer handshake thread panicked"))?;
            Ok::<_, anyhow::Error>((owner_link?, peer_link?))
        })?;

        tracing::info!(owner = owner_id, peer = peer_id, "loopback link established");
        Ok(Self {
            owner: Domain {
                endpoint: owner,
                link: owner_link,
                mailbox: owner_mailbox,
                irq: owner_irq,
            },
            peer: Domain {
                endpoint: peer,
                link: peer_link,
                mailbox: peer_mailbox,
                irq: peer_irq,
            },
            bus,
            boot,
        })
    }

    /// Default options: interrupt delivery on, no faults.
    pub fn new() -> anyhow::Result<Self> {
        Self::establish(LoopbackOptions::default())
    }

    /// Polls both endpoints until neither has found work for `idle`.
    pub fn poll_until_idle(&self, idle: Duration) -> usize {
        let mut runtime = PollRuntime::new();
        runtime.register(self.owner.endpoint.clone());
        runtime.register(self.peer.endpoint.clone());
        runtime.run_until_idle(idle)
    }
}
