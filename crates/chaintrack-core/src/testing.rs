//! A scripted in-process chain for tests.
//!
//! [`MockChain`] starts with a genesis block. Blocks are appended with
//! [`MockChain::mine`] (announced to head subscribers) or
//! [`MockChain::mine_silent`] (history that existed before anyone listened).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bloom::Bloom;
use crate::client::{ChainClient, HeadStream};
use crate::error::TrackError;
use crate::types::{BlockHeader, Log};

/// An event to place in a mined block.
#[derive(Debug, Clone)]
pub struct MockEvent {
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

impl MockEvent {
    pub fn new(address: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topics: vec![signature.into()],
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, (BlockHeader, Vec<Log>)>,
    subscribers: Vec<mpsc::UnboundedSender<Result<BlockHeader, TrackError>>>,
    fail_chain_id: bool,
    fail_headers: bool,
    fail_logs: bool,
    removed_logs: bool,
}

/// Scripted [`ChainClient`].
pub struct MockChain {
    chain_id: u64,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        let chain = Self {
            chain_id,
            state: Mutex::new(MockState::default()),
        };
        chain.append(Vec::new());
        chain
    }

    /// Hash the mock assigns to block `number`.
    pub fn hash_of(&self, number: u64) -> String {
        format!("0x{:08x}{:056x}", self.chain_id, number)
    }

    /// Number of the newest block.
    pub fn head_number(&self) -> u64 {
        self.state
            .lock()
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default()
    }

    pub fn header(&self, number: u64) -> Option<BlockHeader> {
        self.state.lock().blocks.get(&number).map(|(h, _)| h.clone())
    }

    /// Append a block and announce it to head subscribers.
    pub fn mine(&self, events: Vec<MockEvent>) -> BlockHeader {
        let header = self.append(events);
        self.announce(Ok(header.clone()));
        header
    }

    /// Append `count` empty blocks, announcing each.
    pub fn mine_empty(&self, count: usize) {
        for _ in 0..count {
            self.mine(Vec::new());
        }
    }

    /// Append a block without announcing it.
    pub fn mine_silent(&self, events: Vec<MockEvent>) -> BlockHeader {
        self.append(events)
    }

    /// Push an error into every head stream.
    pub fn break_head_streams(&self, reason: &str) {
        self.announce(Err(TrackError::Rpc(reason.to_string())));
    }

    /// End every head stream.
    pub fn close_head_streams(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn fail_chain_id(&self, on: bool) {
        self.state.lock().fail_chain_id = on;
    }

    pub fn fail_headers(&self, on: bool) {
        self.state.lock().fail_headers = on;
    }

    pub fn fail_logs(&self, on: bool) {
        self.state.lock().fail_logs = on;
    }

    /// Report every log as removed by a reorg.
    pub fn mark_logs_removed(&self, on: bool) {
        self.state.lock().removed_logs = on;
    }

    /// Live head streams.
    pub fn head_subscribers(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Wait until at least `n` head streams are open.
    pub async fn wait_for_head_subscribers(&self, n: usize) {
        while self.head_subscribers() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn append(&self, events: Vec<MockEvent>) -> BlockHeader {
        let mut state = self.state.lock();
        let number = state
            .blocks
            .keys()
            .next_back()
            .map_or(0, |n| n + 1);
        let hash = self.hash_of(number);
        let parent_hash = if number == 0 {
            format!("0x{:064x}", 0)
        } else {
            self.hash_of(number - 1)
        };

        let mut bloom = Bloom::default();
        let mut logs = Vec::with_capacity(events.len());
        for (i, ev) in events.into_iter().enumerate() {
            bloom.accrue_address(&ev.address);
            for topic in &ev.topics {
                bloom.accrue_address(topic);
            }
            logs.push(Log {
                address: ev.address,
                topics: ev.topics,
                data: ev.data,
                block_number: number,
                block_hash: hash.clone(),
                tx_hash: format!("0x{:032x}{:032x}", number, i),
                tx_index: i as u32,
                log_index: i as u32,
                removed: false,
            });
        }

        let header = BlockHeader {
            number,
            hash,
            parent_hash,
            timestamp: 1_700_000_000 + number * 12,
            bloom,
        };
        state.blocks.insert(number, (header.clone(), logs));
        header
    }

    fn announce(&self, item: Result<BlockHeader, TrackError>) {
        let mut state = self.state.lock();
        match item {
            Ok(header) => state
                .subscribers
                .retain(|tx| tx.send(Ok(header.clone())).is_ok()),
            Err(err) => {
                let reason = err.to_string();
                state
                    .subscribers
                    .retain(|tx| tx.send(Err(TrackError::Rpc(reason.clone()))).is_ok());
            }
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, TrackError> {
        if self.state.lock().fail_chain_id {
            return Err(TrackError::Rpc("chain id unavailable".into()));
        }
        Ok(self.chain_id)
    }

    async fn subscribe_heads(&self, cancel: CancellationToken) -> Result<HeadStream, TrackError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .take_until(cancel.cancelled_owned());
        Ok(stream.boxed())
    }

    async fn header_by_number(&self, number: u64) -> Result<BlockHeader, TrackError> {
        let state = self.state.lock();
        if state.fail_headers {
            return Err(TrackError::Rpc(format!("header {number} unavailable")));
        }
        state
            .blocks
            .get(&number)
            .map(|(h, _)| h.clone())
            .ok_or_else(|| TrackError::NotFound(format!("block {number}")))
    }

    async fn filter_logs(
        &self,
        addresses: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, TrackError> {
        let state = self.state.lock();
        if state.fail_logs {
            return Err(TrackError::Rpc("log filter unavailable".into()));
        }
        let removed = state.removed_logs;
        Ok(state
            .blocks
            .range(from..=to)
            .flat_map(|(_, (_, logs))| logs.iter())
            .filter(|log| addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address)))
            .map(|log| Log {
                removed,
                ..log.clone()
            })
            .collect())
    }
}
