//! Fluent builder API for creating trackers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chaintrack_core::{ConfirmationTier, MemoryStore, TrackerBuilder};
//! # fn client() -> Arc<dyn chaintrack_core::ChainClient> { unimplemented!() }
//!
//! let tracker = TrackerBuilder::new()
//!     .start_height(19_000_000)
//!     .tier(ConfirmationTier::Safe)
//!     .queue_capacity(256)
//!     .build(client(), Arc::new(MemoryStore::new()));
//! ```

use std::sync::Arc;

use tracing::{info_span, Span};

use crate::client::ChainClient;
use crate::config::TrackerConfig;
use crate::confirmation::{ConfirmationPolicy, ConfirmationTier};
use crate::store::Store;
use crate::tracker::Tracker;

/// Fluent builder for [`Tracker`].
#[derive(Default)]
pub struct TrackerBuilder {
    config: TrackerConfig,
    span: Option<Span>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: TrackerConfig) -> Self {
        Self { config, span: None }
    }

    /// First block the backfill considers.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    /// Fixed confirmation threshold, bypassing the policy.
    pub fn confirmations(mut self, n: u64) -> Self {
        self.config.confirmations = Some(n);
        self
    }

    pub fn tier(mut self, tier: ConfirmationTier) -> Self {
        self.config.tier = tier;
        self
    }

    pub fn policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Capacity of each subscriber's event queue.
    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n;
        self
    }

    /// Capacity of each subscriber's error queue.
    pub fn error_queue_capacity(mut self, n: usize) -> Self {
        self.config.error_queue_capacity = n;
        self
    }

    /// Span the tracker logs under. Defaults to `info_span!("tracker")`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build_config(self) -> TrackerConfig {
        self.config
    }

    pub fn build(self, client: Arc<dyn ChainClient>, store: Arc<dyn Store>) -> Tracker {
        let span = self.span.unwrap_or_else(|| info_span!("tracker"));
        Tracker::with_config(client, store, self.config, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::Tiers;
    use crate::store::MemoryStore;
    use crate::testing::MockChain;

    #[test]
    fn builder_defaults() {
        let cfg = TrackerBuilder::new().build_config();
        assert_eq!(cfg.start_height, 0);
        assert_eq!(cfg.tier, ConfirmationTier::Fast);
        assert!(cfg.confirmations.is_none());
    }

    #[test]
    fn builder_custom() {
        let cfg = TrackerBuilder::new()
            .start_height(50_000_000)
            .confirmations(32)
            .queue_capacity(8)
            .error_queue_capacity(2)
            .build_config();
        assert_eq!(cfg.start_height, 50_000_000);
        assert_eq!(cfg.confirmations, Some(32));
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.error_queue_capacity, 2);
    }

    #[tokio::test]
    async fn built_tracker_carries_config() {
        let policy = ConfirmationPolicy::uniform(Tiers::new(1, 2, 3, 4));
        let tracker = TrackerBuilder::new()
            .start_height(7)
            .tier(ConfirmationTier::Safe)
            .policy(policy)
            .span(info_span!("test-tracker"))
            .build(Arc::new(MockChain::new(5)), Arc::new(MemoryStore::new()));
        assert_eq!(tracker.start_height(), 7);
        assert_eq!(tracker.config().threshold_for(5), 3);
        assert!(!tracker.is_running());
        assert!(tracker.confirmations().is_none());
    }
}
