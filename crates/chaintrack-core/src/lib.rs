//! chaintrack-core — block/event tracking with confirmation states,
//! pluggable storage, and non-blocking subscriber fan-out.
//!
//! # Architecture
//!
//! ```text
//! TrackerBuilder → Tracker
//!                    ├── watch loop     (new heads → seen/skipped, N − T → confirmed)
//!                    ├── sync loop      (backfill up to the first live block)
//!                    ├── Dispatcher     (head + address subscribers, bounded queues)
//!                    ├── ChainClient    (node adapter: heads, headers, logs)
//!                    └── Store          (memory / SQLite, write hooks)
//! ```

pub mod bloom;
pub mod builder;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod queue;
pub mod store;
pub mod subscription;
pub mod tracker;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bloom::Bloom;
pub use builder::TrackerBuilder;
pub use client::{ChainClient, HeadStream};
pub use config::{TrackerConfig, TrackerStatus};
pub use confirmation::{ConfirmationPolicy, ConfirmationTier, Tiers};
pub use error::{SubscriptionError, TrackError};
pub use store::{EventsHook, HeadHook, MemoryStore, Store};
pub use subscription::{Dispatcher, Subscription};
pub use tracker::Tracker;
pub use types::{
    BlockHeader, BlockRecord, BlockState, EventQuery, EventRecord, HeadQuery, Log,
};
