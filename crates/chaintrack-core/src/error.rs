//! Error types for the tracking pipeline.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while tracking a chain.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A write collided with a row that already exists (duplicate number or hash).
    #[error("Conflict on chain {chain_id}: {what} already exists")]
    Conflict { chain_id: u64, what: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tracker is already running")]
    AlreadyRunning,

    #[error("Start height cannot change after chain {chain_id} was resolved")]
    HeightLocked { chain_id: u64 },

    /// A post-write hook failed; the write it belonged to was rolled back.
    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("Tracker aborted: {reason}")]
    Aborted { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl TrackError {
    /// Returns `true` if the error is a duplicate-key conflict from the store.
    ///
    /// The tracker swallows these: store-level uniqueness is what deduplicates
    /// the watch and sync paths.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Shorthand for a block-number conflict.
    pub fn head_conflict(chain_id: u64, number: u64) -> Self {
        Self::Conflict {
            chain_id,
            what: format!("block {number}"),
        }
    }
}

/// A notice delivered on a subscription's error queue.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The subscriber's event queue was full and a notice was dropped.
    #[error("subscription {subscription} queue full, dropped {dropped}")]
    QueueFull { subscription: u64, dropped: String },

    /// The tracker hit an unrecoverable error and is shutting down.
    #[error("tracker stopped: {0}")]
    Unrecoverable(Arc<TrackError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_structural() {
        assert!(TrackError::head_conflict(1, 10).is_conflict());
        // Message text alone does not make a conflict.
        assert!(!TrackError::Storage("block 10 already exists".into()).is_conflict());
    }

    #[test]
    fn subscription_error_display() {
        let err = SubscriptionError::Unrecoverable(Arc::new(TrackError::Rpc("boom".into())));
        assert_eq!(err.to_string(), "tracker stopped: RPC error: boom");
    }
}
