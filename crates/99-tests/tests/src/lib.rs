//! End-to-end suite for the shared-memory link.
//!
//! Everything runs against the native loopback harness: two domains in one
//! process, each with its own mailbox and interrupt thread.

#[cfg(test)]
mod support;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod native_e2e;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod link_faults;

#[cfg(test)]
mod tests {
    use runtime_native::{LoopbackOptions, LoopbackPair};
    use transport_fabric::{SendOutcome, TransportConfig};

    const LINK_TOML: &str = include_str!("../fixtures/link.toml");

    #[test]
    fn fixture_config_parses() {
        let config = TransportConfig::from_toml_str(LINK_TOML).expect("fixture parses");
        assert_eq!(config.local_id, 1);
        assert_eq!(config.drain_budget, 4);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.doorbell.budget_limit, 4);
    }

    #[test]
    fn fixture_config_drives_a_link() {
        super::support::init_tracing();
        let owner = TransportConfig::from_toml_str(LINK_TOML).expect("fixture parses");
        let peer = TransportConfig {
            local_id: 7,
            ..owner
        };
        let pair = LoopbackPair::establish(LoopbackOptions {
            owner,
            peer,
            interrupts: false,
            ..LoopbackOptions::default()
        })
        .expect("link up");

        let handle = pair.owner.endpoint.open(7, 21).expect("open");
        let inbox = pair.peer.endpoint.open(1, 21).expect("open inbox");
        inbox.enable_queue().expect("queue");

        let outcomes: Vec<SendOutcome> = (0..6u8)
            .map(|n| pair.owner.endpoint.send(&handle, 0, &[n]).expect("send"))
            .collect();
        assert_eq!(
            outcomes.iter().filter(|o| **o == SendOutcome::Signalled).count(),
            4,
            "budget of four outstanding doorbells"
        );

        pair.poll_until_idle(std::time::Duration::from_millis(20));
        let received: Vec<Vec<u8>> = std::iter::from_fn(|| inbox.try_recv().expect("open")).collect();
        assert_eq!(received, (0..6u8).map(|n| vec![n]).collect::<Vec<_>>());
    }
}
