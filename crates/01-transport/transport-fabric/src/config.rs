//! Transport configuration.
//!
//! Every bounded wait and every budget in the fabric is driven from here.
//! Documents are TOML; every field has a default, so an empty document is a
//! valid configuration.
//!
//! ```toml
//! local_id = 0
//! drain_budget = 64
//! queue_depth = 1024
//!
//! [ring]
//! stall = "retain"
//! visibility = { max_attempts = 5, delay_us = 20 }
//!
//! [doorbell]
//! budget_limit = 8
//! slot_poll = { max_attempts = 20, delay_us = 50 }
//! attempts = { max_attempts = 3, delay_us = 1000, backoff = 2 }
//!
//! [handshake]
//! poll = { max_attempts = 100, delay_us = 1000000 }
//! ```

use std::time::Duration;

use serde::Deserialize;
use transport::{RetryPolicy, RingConfig, StallPolicy};

use crate::error::{FabricError, FabricResult};
use crate::handle::DEFAULT_QUEUE_DEPTH;

/// A [`RetryPolicy`] as written in configuration.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_us: u64,
    #[serde(default = "fixed_backoff")]
    pub backoff: u32,
}

fn fixed_backoff() -> u32 {
    1
}

impl RetrySection {
    pub const fn new(max_attempts: u32, delay_us: u64, backoff: u32) -> Self {
        Self {
            max_attempts,
            delay_us,
            backoff,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_micros(self.delay_us),
            self.backoff.max(1),
        )
    }
}

impl From<RetryPolicy> for RetrySection {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            delay_us: policy.delay.as_micros() as u64,
            backoff: policy.backoff,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StallSetting {
    #[default]
    Resync,
    Retain,
}

impl From<StallSetting> for StallPolicy {
    fn from(setting: StallSetting) -> Self {
        match setting {
            StallSetting::Resync => StallPolicy::Resync,
            StallSetting::Retain => StallPolicy::Retain,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RingSection {
    /// Polling for a published header's completion sentinel.
    pub visibility: RetrySection,
    pub stall: StallSetting,
}

impl Default for RingSection {
    fn default() -> Self {
        Self {
            visibility: RetrySection::new(3, 10, 1),
            stall: StallSetting::default(),
        }
    }
}

impl RingSection {
    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            visibility: self.visibility.policy(),
            stall: self.stall.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DoorbellSection {
    /// Outstanding (issued but unacknowledged) requests allowed per remote domain.
    pub budget_limit: u32,
    /// Polling the slot request register within one attempt.
    pub slot_poll: RetrySection,
    /// Whole acquisition attempts, with backoff in between.
    pub attempts: RetrySection,
}

impl Default for DoorbellSection {
    fn default() -> Self {
        Self {
            budget_limit: 8,
            slot_poll: RetrySection::new(20, 50, 1),
            attempts: RetrySection::new(3, 1_000, 2),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeSection {
    /// Polling for the other side's sentinel in each phase.
    pub poll: RetrySection,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            poll: RetrySection::new(100, 1_000_000, 1),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Identity of this domain.
    pub local_id: u32,
    /// Frames drained per doorbell before yielding.
    pub drain_budget: usize,
    /// Payloads a queueing handle holds before further ones are dropped.
    pub queue_depth: usize,
    pub ring: RingSection,
    pub doorbell: DoorbellSection,
    pub handshake: HandshakeSection,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            drain_budget: 64,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            ring: RingSection::default(),
            doorbell: DoorbellSection::default(),
            handshake: HandshakeSection::default(),
        }
    }
}

impl TransportConfig {
    /// Default configuration for the domain with identity `local_id`.
    pub fn for_domain(local_id: u32) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    pub fn from_toml_str(doc: &str) -> FabricResult<Self> {
        let config: Self = toml::from_str(doc).map_err(|err| FabricError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.drain_budget == 0 {
            return Err(FabricError::InvalidConfig("drain_budget must be non-zero"));
        }
        if self.queue_depth == 0 {
            return Err(FabricError::InvalidConfig("queue_depth must be non-zero"));
        }
        if self.doorbell.budget_limit == 0 {
            return Err(FabricError::InvalidConfig(
                "doorbell.budget_limit must be non-zero",
            ));
        }
        let sections = [
            self.ring.visibility,
            self.doorbell.slot_poll,
            self.doorbell.attempts,
            self.handshake.poll,
        ];
        if sections.iter().any(|section| section.max_attempts == 0) {
            return Err(FabricError::InvalidConfig("max_attempts must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.doorbell.budget_limit, 8);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.handshake.poll.policy().max_attempts, 100);
        assert_eq!(
            config.handshake.poll.policy().delay,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn partial_document_overrides() {
        let config = TransportConfig::from_toml_str(
            r#"
            local_id = 3
            queue_depth = 16

            [ring]
            stall = "retain"

            [doorbell]
            budget_limit = 2
            attempts = { max_attempts = 5, delay_us = 500, backoff = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(config.local_id, 3);
        assert_eq!(config.queue_depth, 16);
        assert_eq!(config.ring.ring_config().stall, StallPolicy::Retain);
        assert_eq!(config.doorbell.budget_limit, 2);
        let attempts = config.doorbell.attempts.policy();
        assert_eq!(attempts.delay_before(2), Duration::from_micros(1_500));
        assert_eq!(config.doorbell.slot_poll, DoorbellSection::default().slot_poll);
    }

    #[test]
    fn rejects_zero_budgets() {
        let err = TransportConfig::from_toml_str("drain_budget = 0").unwrap_err();
        assert!(matches!(err, FabricError::InvalidConfig(_)));
        let err = TransportConfig::from_toml_str("[doorbell]\nbudget_limit = 0").unwrap_err();
        assert!(matches!(err, FabricError::InvalidConfig(_)));
        let err = TransportConfig::from_toml_str("queue_depth = 0").unwrap_err();
        assert!(matches!(err, FabricError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = TransportConfig::from_toml_str("mystery = 1").unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }
}
