//! Polling head source: turns an [`EvmRpcClient`] into a [`ChainClient`].
//!
//! Nodes reached over plain HTTP cannot push new heads, so the adapter polls
//! `eth_blockNumber` every `interval` and emits every header between the
//! last one it reported and the current head, in order. The first poll
//! reports the current head only.
//!
//! Any RPC failure while polling is delivered as an `Err` item and ends the
//! stream; the tracker treats that as unrecoverable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use chaintrack_core::client::{ChainClient, HeadStream};
use chaintrack_core::error::TrackError;
use chaintrack_core::types::{BlockHeader, Log};

use crate::fetcher::{EvmFetcher, EvmRpcClient, RawLog};

/// Polling and batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Head polling interval in milliseconds.
    pub interval_ms: u64,
    /// Largest block span per `eth_getLogs` call, minus one.
    pub max_log_range: u64,
    /// Headers buffered between the poller and the tracker.
    pub buffer: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_log_range: 1_000,
            buffer: 64,
        }
    }
}

/// [`ChainClient`] backed by JSON-RPC polling.
pub struct PollingClient<C> {
    fetcher: Arc<EvmFetcher<C>>,
    config: PollConfig,
}

impl<C: EvmRpcClient> PollingClient<C> {
    pub fn new(client: C) -> Self {
        Self::with_config(client, PollConfig::default())
    }

    pub fn with_config(client: C, config: PollConfig) -> Self {
        Self {
            fetcher: Arc::new(EvmFetcher::new(client)),
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }
}

async fn poll_heads<C: EvmRpcClient>(
    fetcher: Arc<EvmFetcher<C>>,
    interval: Duration,
    tx: mpsc::Sender<Result<BlockHeader, TrackError>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let head = match fetcher.head_block_number().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "head poll failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let from = next.unwrap_or(head);
        for number in from..=head {
            if cancel.is_cancelled() {
                return;
            }
            let item = fetcher.header(number).await;
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                return;
            }
            next = Some(number + 1);
        }
    }
    debug!("head poller stopped");
}

#[async_trait]
impl<C: EvmRpcClient> ChainClient for PollingClient<C> {
    async fn chain_id(&self) -> Result<u64, TrackError> {
        self.fetcher.client().chain_id().await
    }

    async fn subscribe_heads(&self, cancel: CancellationToken) -> Result<HeadStream, TrackError> {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let interval = Duration::from_millis(self.config.interval_ms.max(1));
        tokio::spawn(
            poll_heads(Arc::clone(&self.fetcher), interval, tx, cancel)
                .instrument(tracing::info_span!("head_poller")),
        );
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn header_by_number(&self, number: u64) -> Result<BlockHeader, TrackError> {
        self.fetcher.header(number).await
    }

    async fn filter_logs(
        &self,
        addresses: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, TrackError> {
        self.fetcher
            .logs(from, to, addresses, self.config.max_log_range)
            .await?
            .into_iter()
            .map(RawLog::into_log)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chaintrack_core::bloom::Bloom;
    use parking_lot::Mutex;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct MockRpc {
        blocks: Mutex<Vec<BlockHeader>>,
        logs: Vec<RawLog>,
        log_calls: AtomicU32,
        fail: AtomicBool,
    }

    impl MockRpc {
        fn with_blocks(n: u64) -> Self {
            let rpc = Self::default();
            rpc.extend_to(n);
            rpc
        }

        fn extend_to(&self, tip: u64) {
            let mut blocks = self.blocks.lock();
            while blocks.len() as u64 <= tip {
                let number = blocks.len() as u64;
                blocks.push(BlockHeader {
                    number,
                    hash: format!("0x{number:064x}"),
                    parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
                    timestamp: number * 12,
                    bloom: Bloom::default(),
                });
            }
        }
    }

    #[async_trait]
    impl EvmRpcClient for MockRpc {
        async fn chain_id(&self) -> Result<u64, TrackError> {
            Ok(1)
        }

        async fn block_number(&self) -> Result<u64, TrackError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(TrackError::Rpc("node unreachable".into()));
            }
            Ok(self.blocks.lock().len() as u64 - 1)
        }

        async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, TrackError> {
            Ok(self.blocks.lock().get(number as usize).cloned())
        }

        async fn get_logs(
            &self,
            from: u64,
            to: u64,
            _addresses: &[String],
        ) -> Result<Vec<RawLog>, TrackError> {
            self.log_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .logs
                .iter()
                .filter(|l| {
                    let n = crate::fetcher::parse_hex_u64(&l.block_number).unwrap_or(u64::MAX);
                    (from..=to).contains(&n)
                })
                .cloned()
                .collect())
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            interval_ms: 5,
            max_log_range: 1,
            buffer: 8,
        }
    }

    #[tokio::test]
    async fn emits_current_head_then_every_new_block() {
        let client = PollingClient::with_config(MockRpc::with_blocks(3), fast());
        let cancel = CancellationToken::new();
        let mut heads = client.subscribe_heads(cancel.clone()).await.unwrap();

        let first = timeout(WAIT, heads.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(first.number, 3);

        client.fetcher.client().extend_to(6);
        for expected in 4..=6 {
            let h = timeout(WAIT, heads.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(h.number, expected);
        }

        cancel.cancel();
        assert!(timeout(WAIT, heads.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rpc_failure_ends_the_stream() {
        let client = PollingClient::with_config(MockRpc::with_blocks(1), fast());
        let mut heads = client.subscribe_heads(CancellationToken::new()).await.unwrap();
        assert!(timeout(WAIT, heads.next()).await.unwrap().unwrap().is_ok());

        client.fetcher.client().fail.store(true, Ordering::Relaxed);
        let item = timeout(WAIT, heads.next()).await.unwrap().unwrap();
        assert!(matches!(item, Err(TrackError::Rpc(_))));
        assert!(timeout(WAIT, heads.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filter_logs_batches_and_decodes() {
        let raw = |n: u64| RawLog {
            address: "0xaa".into(),
            topics: vec!["0x01".into()],
            data: "0x".into(),
            block_number: format!("0x{n:x}"),
            block_hash: format!("0x{n:064x}"),
            tx_hash: "0xt".into(),
            tx_index: "0x0".into(),
            log_index: "0x0".into(),
            removed: Some(n == 4),
        };
        let rpc = MockRpc {
            logs: (0..=4).map(raw).collect(),
            ..MockRpc::with_blocks(4)
        };
        let client = PollingClient::with_config(rpc, fast());

        let logs = client.filter_logs(&["0xaa".into()], 0, 4).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs[4].removed);
        // [0,1] [2,3] [4,4]
        assert_eq!(client.fetcher.client().log_calls.load(Ordering::Relaxed), 3);

        assert!(client.filter_logs(&[], 0, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_header_is_not_found() {
        let client = PollingClient::new(MockRpc::with_blocks(2));
        assert_eq!(client.header_by_number(2).await.unwrap().number, 2);
        assert!(matches!(
            client.header_by_number(9).await,
            Err(TrackError::NotFound(_))
        ));
    }
}
