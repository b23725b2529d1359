//! Shared types: block/event records, chain-source payloads, and store queries.

use serde::{Deserialize, Serialize};

use crate::bloom::Bloom;

// ─── BlockState ───────────────────────────────────────────────────────────────

/// Lifecycle state of a block (and, by inheritance, of its events).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    #[default]
    Unset,
    /// Observed, but nothing subscribed could be in it.
    Skipped,
    /// Observed, not yet final.
    Seen,
    /// Final under the tracker's confirmation threshold.
    Confirmed,
    /// Invalidated by a reorg. Never produced by the tracker today.
    Removed,
}

impl BlockState {
    /// Stable integer code used by relational backends.
    pub fn code(self) -> i64 {
        match self {
            Self::Unset => 0,
            Self::Skipped => 1,
            Self::Seen => 2,
            Self::Confirmed => 3,
            Self::Removed => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Unset,
            1 => Self::Skipped,
            2 => Self::Seen,
            3 => Self::Confirmed,
            4 => Self::Removed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Skipped => write!(f, "skipped"),
            Self::Seen => write!(f, "seen"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for BlockState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unset" => Ok(Self::Unset),
            "skipped" => Ok(Self::Skipped),
            "seen" => Ok(Self::Seen),
            "confirmed" => Ok(Self::Confirmed),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown block state: {other}")),
        }
    }
}

// ─── Chain-source payloads ───────────────────────────────────────────────────

/// A block header as delivered by a [`ChainClient`](crate::client::ChainClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub bloom: Bloom,
}

/// A log as returned by a range filter on the chain source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    /// `topics[0]` is the event signature.
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    /// Set by the node when a reorg dropped the log.
    pub removed: bool,
}

// ─── BlockRecord ──────────────────────────────────────────────────────────────

/// A tracked block. Unique per `(chain_id, number)` and per `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub chain_id: u64,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub state: BlockState,
    pub timestamp: u64,
    pub bloom: Bloom,
}

impl BlockRecord {
    pub fn from_header(chain_id: u64, header: &BlockHeader, state: BlockState) -> Self {
        Self {
            chain_id,
            number: header.number,
            hash: header.hash.clone(),
            parent_hash: header.parent_hash.clone(),
            state,
            timestamp: header.timestamp,
            bloom: header.bloom.clone(),
        }
    }

    /// Copy of this record carrying a different state.
    pub fn with_state(&self, state: BlockState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

// ─── EventRecord ──────────────────────────────────────────────────────────────

/// A tracked event. Belongs to exactly one [`BlockRecord`]; `chain_id` and
/// `state` are the owning block's, merged in at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,
    pub state: BlockState,
    /// Emitting contract address.
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub tx_hash: String,
    pub tx_index: u32,
    /// Position within the block.
    pub log_index: u32,
    pub removed: bool,
}

impl EventRecord {
    pub fn from_log(chain_id: u64, state: BlockState, log: &Log) -> Self {
        Self {
            chain_id,
            block_number: log.block_number,
            block_hash: log.block_hash.clone(),
            state,
            address: log.address.clone(),
            topics: log.topics.clone(),
            data: log.data.clone(),
            tx_hash: log.tx_hash.clone(),
            tx_index: log.tx_index,
            log_index: log.log_index,
            removed: log.removed,
        }
    }

    /// The event signature (`topics[0]`), if any.
    pub fn signature(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── Queries ──────────────────────────────────────────────────────────────────

/// Filter for [`Store::query_heads`](crate::store::Store::query_heads).
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadQuery {
    pub chain_id: Option<u64>,
    pub number: Option<u64>,
    pub hash: Option<String>,
    pub parent_hash: Option<String>,
    pub state: Option<BlockState>,
}

impl HeadQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Default::default()
        }
    }

    pub fn number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn parent_hash(mut self, hash: impl Into<String>) -> Self {
        self.parent_hash = Some(hash.into());
        self
    }

    pub fn state(mut self, state: BlockState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, head: &BlockRecord) -> bool {
        self.chain_id.map_or(true, |c| c == head.chain_id)
            && self.number.map_or(true, |n| n == head.number)
            && self.hash.as_deref().map_or(true, |h| h == head.hash)
            && self.parent_hash.as_deref().map_or(true, |h| h == head.parent_hash)
            && self.state.map_or(true, |s| s == head.state)
    }
}

/// Filter for [`Store::query_events`](crate::store::Store::query_events).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub chain_id: Option<u64>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub state: Option<BlockState>,
    pub address: Option<String>,
    pub tx_hash: Option<String>,
    pub tx_index: Option<u32>,
    pub log_index: Option<u32>,
    /// Matches the event signature (`topics[0]`).
    pub topic: Option<String>,
    pub removed: Option<bool>,
}

impl EventQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Default::default()
        }
    }

    pub fn block_number(mut self, number: u64) -> Self {
        self.block_number = Some(number);
        self
    }

    pub fn block_hash(mut self, hash: impl Into<String>) -> Self {
        self.block_hash = Some(hash.into());
        self
    }

    pub fn state(mut self, state: BlockState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.tx_hash = Some(hash.into());
        self
    }

    pub fn tx_index(mut self, index: u32) -> Self {
        self.tx_index = Some(index);
        self
    }

    pub fn log_index(mut self, index: u32) -> Self {
        self.log_index = Some(index);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn removed(mut self, removed: bool) -> Self {
        self.removed = Some(removed);
        self
    }

    /// The block-level part of this filter, if it has one.
    ///
    /// Events do not store state or chain; backends resolve these through
    /// the owning blocks first.
    pub fn block_filter(&self) -> Option<HeadQuery> {
        let q = HeadQuery {
            chain_id: self.chain_id,
            number: self.block_number,
            hash: self.block_hash.clone(),
            parent_hash: None,
            state: self.state,
        };
        (q != HeadQuery::default()).then_some(q)
    }

    /// Match the event-level fields only (address, tx, position, topic, removed).
    pub fn matches_event_fields(&self, event: &EventRecord) -> bool {
        self.address
            .as_deref()
            .map_or(true, |a| a.eq_ignore_ascii_case(&event.address))
            && self.tx_hash.as_deref().map_or(true, |h| h == event.tx_hash)
            && self.tx_index.map_or(true, |i| i == event.tx_index)
            && self.log_index.map_or(true, |i| i == event.log_index)
            && self.topic.as_deref().map_or(true, |t| {
                event.signature().is_some_and(|s| s.eq_ignore_ascii_case(t))
            })
            && self.removed.map_or(true, |r| r == event.removed)
    }

    /// Match every field against a fully merged event.
    pub fn matches(&self, event: &EventRecord) -> bool {
        self.chain_id.map_or(true, |c| c == event.chain_id)
            && self.block_number.map_or(true, |n| n == event.block_number)
            && self.block_hash.as_deref().map_or(true, |h| h == event.block_hash)
            && self.state.map_or(true, |s| s == event.state)
            && self.matches_event_fields(event)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
