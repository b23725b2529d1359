//! Tracker configuration and lifecycle status.

use serde::{Deserialize, Serialize};

use crate::confirmation::{ConfirmationPolicy, ConfirmationTier};

/// Configuration for a tracker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// First block the backfill considers. Ignored when the store already
    /// holds confirmed blocks past it.
    pub start_height: u64,
    /// Confirmation threshold override. `None` resolves it from `policy`
    /// and `tier` once the chain id is known.
    pub confirmations: Option<u64>,
    /// Tier used when resolving the threshold from `policy`.
    pub tier: ConfirmationTier,
    /// Per-chain thresholds.
    pub policy: ConfirmationPolicy,
    /// Capacity of each subscriber's event queue.
    pub queue_capacity: usize,
    /// Capacity of each subscriber's error queue.
    pub error_queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            confirmations: None,
            tier: ConfirmationTier::Fast,
            policy: ConfirmationPolicy::default(),
            queue_capacity: 1024,
            error_queue_capacity: 16,
        }
    }
}

impl TrackerConfig {
    /// Threshold for `chain_id`, honouring the override.
    pub fn threshold_for(&self, chain_id: u64) -> u64 {
        self.confirmations
            .unwrap_or_else(|| self.policy.threshold(chain_id, self.tier))
    }
}

/// Lifecycle status of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerStatus {
    /// Never started, or stopped.
    #[default]
    Idle,
    /// Resolving the chain and waiting for the first live block.
    Starting,
    /// Following the chain tip, possibly backfilling.
    Running,
    /// Shutting down.
    Stopping,
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg: TrackerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.start_height, 0);
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.error_queue_capacity, 16);
        assert_eq!(cfg.tier, ConfirmationTier::Fast);
        assert!(cfg.confirmations.is_none());
    }

    #[test]
    fn override_wins_over_policy() {
        let mut cfg = TrackerConfig::default();
        assert_eq!(cfg.threshold_for(1), 12);
        cfg.confirmations = Some(3);
        assert_eq!(cfg.threshold_for(1), 3);
    }

    #[test]
    fn status_display() {
        assert_eq!(TrackerStatus::default().to_string(), "idle");
        assert_eq!(TrackerStatus::Stopping.to_string(), "stopping");
    }
}
