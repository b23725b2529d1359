//! The storage contract the tracker persists through.
//!
//! Implementations include [`MemoryStore`] (this crate) and
//! `SqliteStore` (`chaintrack-storage`).
//!
//! Every write accepts post-write hooks. Hooks run after the write succeeds
//! and inside the same logical transaction: if any hook fails, the write is
//! rolled back and the hook's error is returned.

use async_trait::async_trait;

use crate::error::TrackError;
use crate::types::{BlockRecord, EventQuery, EventRecord, HeadQuery};

pub mod memory;

pub use memory::MemoryStore;

/// Hook run after a head write, with the record as stored.
pub type HeadHook = Box<dyn FnOnce(&BlockRecord) -> Result<(), TrackError> + Send>;

/// Hook run after an event write, with the events merged with their block.
pub type EventsHook = Box<dyn FnOnce(&[EventRecord]) -> Result<(), TrackError> + Send>;

/// Durable home of block and event records.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a new head. Fails with [`TrackError::Conflict`] if the chain
    /// already has a head at this number or with this hash.
    async fn create_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError>;

    /// Insert or update the head at `(chain_id, number)`.
    ///
    /// A stored `confirmed` state is never lowered.
    async fn upsert_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError>;

    /// Persist events owned by the block with `block_hash`.
    ///
    /// Fails with [`TrackError::NotFound`] if that block is not stored.
    /// Events already stored at the same log index are left untouched. An
    /// empty list is a no-op and runs no hooks. Returns the submitted events
    /// merged with their block's chain id and state.
    async fn save_logs(
        &self,
        chain_id: u64,
        block_hash: &str,
        events: Vec<EventRecord>,
        hooks: Vec<EventsHook>,
    ) -> Result<Vec<EventRecord>, TrackError>;

    /// Highest confirmed block number on the chain, or 0 if none.
    async fn get_height(&self, chain_id: u64) -> Result<u64, TrackError>;

    /// Heads matching `query`, ordered by chain id then number.
    async fn query_heads(&self, query: &HeadQuery) -> Result<Vec<BlockRecord>, TrackError>;

    async fn count_heads(&self, query: &HeadQuery) -> Result<u64, TrackError>;

    /// Events matching `query`, ordered by block number then log index.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, TrackError>;

    async fn count_events(&self, query: &EventQuery) -> Result<u64, TrackError>;

    /// The head at `number`, if stored.
    async fn get_head(&self, chain_id: u64, number: u64) -> Result<Option<BlockRecord>, TrackError> {
        let heads = self.query_heads(&HeadQuery::chain(chain_id).number(number)).await?;
        Ok(heads.into_iter().next())
    }

    /// The head with `hash`, if stored.
    async fn get_head_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<BlockRecord>, TrackError> {
        let heads = self.query_heads(&HeadQuery::chain(chain_id).hash(hash)).await?;
        Ok(heads.into_iter().next())
    }
}

/// Run head hooks in order, stopping at the first failure.
pub fn run_head_hooks(head: &BlockRecord, hooks: Vec<HeadHook>) -> Result<(), TrackError> {
    for hook in hooks {
        hook(head).map_err(into_hook_error)?;
    }
    Ok(())
}

/// Run event hooks in order, stopping at the first failure.
pub fn run_events_hooks(events: &[EventRecord], hooks: Vec<EventsHook>) -> Result<(), TrackError> {
    for hook in hooks {
        hook(events).map_err(into_hook_error)?;
    }
    Ok(())
}

/// Overwrite an event's block-derived fields with its owning block's.
pub fn merge_with_block(mut event: EventRecord, block: &BlockRecord) -> EventRecord {
    event.chain_id = block.chain_id;
    event.block_number = block.number;
    event.block_hash = block.hash.clone();
    event.state = block.state;
    event
}

fn into_hook_error(err: TrackError) -> TrackError {
    match err {
        TrackError::Hook(_) => err,
        other => TrackError::Hook(other.to_string()),
    }
}
