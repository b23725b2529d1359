//! In-memory store.
//!
//! Nested maps (chain → number for heads, chain → hash → events) behind one
//! coarse lock. All data is lost when the process exits; suited to tests and
//! low-volume embedding.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TrackError;
use crate::store::{merge_with_block, run_events_hooks, run_head_hooks, EventsHook, HeadHook, Store};
use crate::types::{BlockRecord, BlockState, EventQuery, EventRecord, HeadQuery};

#[derive(Debug, Default)]
struct ChainData {
    heads: BTreeMap<u64, BlockRecord>,
    /// hash → number
    by_hash: HashMap<String, u64>,
    /// block hash → events in insertion order
    events: HashMap<String, Vec<EventRecord>>,
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    chains: Mutex<HashMap<u64, ChainData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_head_sync(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        let mut chains = self.chains.lock();
        let chain = chains.entry(head.chain_id).or_default();
        if chain.heads.contains_key(&head.number) {
            return Err(TrackError::head_conflict(head.chain_id, head.number));
        }
        if chain.by_hash.contains_key(&head.hash) {
            return Err(TrackError::Conflict {
                chain_id: head.chain_id,
                what: format!("block hash {}", head.hash),
            });
        }
        chain.heads.insert(head.number, head.clone());
        chain.by_hash.insert(head.hash.clone(), head.number);

        if let Err(e) = run_head_hooks(&head, hooks) {
            chain.heads.remove(&head.number);
            chain.by_hash.remove(&head.hash);
            return Err(e);
        }
        Ok(head)
    }

    fn upsert_head_sync(
        &self,
        mut head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        let mut chains = self.chains.lock();
        let chain = chains.entry(head.chain_id).or_default();

        if let Some(owner) = chain.by_hash.get(&head.hash) {
            if *owner != head.number {
                return Err(TrackError::Conflict {
                    chain_id: head.chain_id,
                    what: format!("block hash {}", head.hash),
                });
            }
        }

        let previous = chain.heads.get(&head.number).cloned();
        if previous.as_ref().is_some_and(|p| p.state == BlockState::Confirmed) {
            head.state = BlockState::Confirmed;
        }
        // Events of a block replaced at this number go with it.
        let orphaned = match &previous {
            Some(prev) if prev.hash != head.hash => chain.events.remove(&prev.hash),
            _ => None,
        };
        if let Some(prev) = &previous {
            chain.by_hash.remove(&prev.hash);
        }
        chain.heads.insert(head.number, head.clone());
        chain.by_hash.insert(head.hash.clone(), head.number);

        if let Err(e) = run_head_hooks(&head, hooks) {
            chain.by_hash.remove(&head.hash);
            if let (Some(prev), Some(events)) = (&previous, orphaned) {
                chain.events.insert(prev.hash.clone(), events);
            }
            match previous {
                Some(prev) => {
                    chain.by_hash.insert(prev.hash.clone(), prev.number);
                    chain.heads.insert(prev.number, prev);
                }
                None => {
                    chain.heads.remove(&head.number);
                }
            }
            return Err(e);
        }
        Ok(head)
    }

    fn save_logs_sync(
        &self,
        chain_id: u64,
        block_hash: &str,
        events: Vec<EventRecord>,
        hooks: Vec<EventsHook>,
    ) -> Result<Vec<EventRecord>, TrackError> {
        if events.is_empty() {
            return Ok(events);
        }
        let mut chains = self.chains.lock();
        let chain = chains
            .get_mut(&chain_id)
            .ok_or_else(|| TrackError::NotFound(format!("block {block_hash} on chain {chain_id}")))?;
        let block = chain
            .by_hash
            .get(block_hash)
            .and_then(|n| chain.heads.get(n))
            .cloned()
            .ok_or_else(|| TrackError::NotFound(format!("block {block_hash} on chain {chain_id}")))?;

        let merged: Vec<EventRecord> = events.into_iter().map(|e| merge_with_block(e, &block)).collect();

        let stored = chain.events.entry(block.hash.clone()).or_default();
        let before = stored.len();
        let mut known: HashSet<u32> = stored.iter().map(|e| e.log_index).collect();
        for event in &merged {
            if known.insert(event.log_index) {
                stored.push(event.clone());
            }
        }

        if let Err(e) = run_events_hooks(&merged, hooks) {
            if let Some(stored) = chain.events.get_mut(&block.hash) {
                stored.truncate(before);
            }
            return Err(e);
        }
        Ok(merged)
    }

    fn heads_matching(&self, query: &HeadQuery) -> Vec<BlockRecord> {
        let chains = self.chains.lock();
        let mut out = Vec::new();
        for (chain_id, chain) in chains.iter() {
            if query.chain_id.is_some_and(|c| c != *chain_id) {
                continue;
            }
            out.extend(chain.heads.values().filter(|h| query.matches(h)).cloned());
        }
        out.sort_by_key(|h| (h.chain_id, h.number));
        out
    }

    fn events_matching(&self, query: &EventQuery) -> Vec<EventRecord> {
        let chains = self.chains.lock();
        let mut out = Vec::new();
        for (chain_id, chain) in chains.iter() {
            if query.chain_id.is_some_and(|c| c != *chain_id) {
                continue;
            }
            // Pass one: owning blocks. Pass two: events under those blocks,
            // merged with the block's current metadata.
            let block_filter = query.block_filter();
            for head in chain.heads.values() {
                if block_filter.as_ref().is_some_and(|f| !f.matches(head)) {
                    continue;
                }
                let Some(events) = chain.events.get(&head.hash) else {
                    continue;
                };
                out.extend(
                    events
                        .iter()
                        .filter(|e| query.matches_event_fields(e))
                        .map(|e| merge_with_block(e.clone(), head)),
                );
            }
        }
        out.sort_by(|a, b| {
            (a.chain_id, a.block_number, a.log_index).cmp(&(b.chain_id, b.block_number, b.log_index))
        });
        out
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        self.create_head_sync(head, hooks)
    }

    async fn upsert_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        self.upsert_head_sync(head, hooks)
    }

    async fn save_logs(
        &self,
        chain_id: u64,
        block_hash: &str,
        events: Vec<EventRecord>,
        hooks: Vec<EventsHook>,
    ) -> Result<Vec<EventRecord>, TrackError> {
        self.save_logs_sync(chain_id, block_hash, events, hooks)
    }

    async fn get_height(&self, chain_id: u64) -> Result<u64, TrackError> {
        let chains = self.chains.lock();
        Ok(chains
            .get(&chain_id)
            .and_then(|c| {
                c.heads
                    .values()
                    .rev()
                    .find(|h| h.state == BlockState::Confirmed)
                    .map(|h| h.number)
            })
            .unwrap_or(0))
    }

    async fn query_heads(&self, query: &HeadQuery) -> Result<Vec<BlockRecord>, TrackError> {
        Ok(self.heads_matching(query))
    }

    async fn count_heads(&self, query: &HeadQuery) -> Result<u64, TrackError> {
        Ok(self.heads_matching(query).len() as u64)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, TrackError> {
        Ok(self.events_matching(query))
    }

    async fn count_events(&self, query: &EventQuery) -> Result<u64, TrackError> {
        Ok(self.events_matching(query).len() as u64)
    }
}
