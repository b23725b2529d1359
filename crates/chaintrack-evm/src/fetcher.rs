//! EVM block and log fetcher.
//!
//! Uses JSON-RPC `eth_getBlockByNumber` and `eth_getLogs` with range batching
//! to fetch headers and logs for the tracker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chaintrack_core::bloom::Bloom;
use chaintrack_core::error::TrackError;
use chaintrack_core::types::{BlockHeader, Log};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "transactionIndex")]
    pub tx_index: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Decode the hex fields.
    pub fn into_log(self) -> Result<Log, TrackError> {
        let data = hex::decode(self.data.strip_prefix("0x").unwrap_or(&self.data))
            .map_err(|e| TrackError::Rpc(format!("log data: {e}")))?;
        Ok(Log {
            block_number: parse_hex_u64(&self.block_number)?,
            tx_index: parse_hex_u64(&self.tx_index)? as u32,
            log_index: parse_hex_u64(&self.log_index)? as u32,
            removed: self.is_removed(),
            address: self.address,
            topics: self.topics,
            data,
            block_hash: self.block_hash,
            tx_hash: self.tx_hash,
        })
    }
}

/// Minimal EVM JSON-RPC surface the adapter needs.
#[async_trait]
pub trait EvmRpcClient: Send + Sync + 'static {
    /// `eth_chainId`
    async fn chain_id(&self) -> Result<u64, TrackError>;
    /// `eth_blockNumber`
    async fn block_number(&self) -> Result<u64, TrackError>;
    /// `eth_getBlockByNumber(number, false)`; `None` if the node does not have it.
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, TrackError>;
    /// `eth_getLogs` over `[from, to]` for `addresses`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<Vec<RawLog>, TrackError>;
}

/// EVM fetcher that wraps an `EvmRpcClient` and adds batching logic.
pub struct EvmFetcher<C> {
    client: C,
}

impl<C: EvmRpcClient> EvmFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Fetch the current chain head block number.
    pub async fn head_block_number(&self) -> Result<u64, TrackError> {
        self.client.block_number().await
    }

    /// Fetch a header, failing with `NotFound` if the node lacks it.
    pub async fn header(&self, number: u64) -> Result<BlockHeader, TrackError> {
        self.client
            .get_block(number)
            .await?
            .ok_or_else(|| TrackError::NotFound(format!("block {number}")))
    }

    /// Fetch all logs in `[from, to]` emitted by `addresses`.
    /// Splits the range into chunks of at most `max_range + 1` blocks.
    pub async fn logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        max_range: u64,
    ) -> Result<Vec<RawLog>, TrackError> {
        if to < from || addresses.is_empty() {
            return Ok(vec![]);
        }
        if to - from <= max_range {
            return self.client.get_logs(from, to, addresses).await;
        }
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(max_range).min(to);
            let chunk = self.client.get_logs(start, end, addresses).await?;
            all_logs.extend(chunk);
            start = end + 1;
        }
        Ok(all_logs)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, TrackError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| TrackError::Rpc(format!("bad quantity {s:?}: {e}")))
}

/// Convert a JSON block response to a [`BlockHeader`].
///
/// A missing or malformed `logsBloom` reads as a saturated bloom, so the
/// block is still checked for logs.
pub fn header_from_json(v: &Value) -> Option<BlockHeader> {
    Some(BlockHeader {
        number: parse_hex_u64(v["number"].as_str()?).ok()?,
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
        timestamp: parse_hex_u64(v["timestamp"].as_str()?).ok()?,
        bloom: v["logsBloom"]
            .as_str()
            .and_then(Bloom::from_hex)
            .unwrap_or_else(Bloom::saturated),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn raw_log_decodes() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
            "data": "0x00ff",
            "blockNumber": "0x12a05f200",
            "blockHash": "0xb1",
            "transactionHash": "0xt1",
            "transactionIndex": "0x3",
            "logIndex": "0x5"
        }))
        .unwrap();
        assert!(!raw.is_removed());
        let log = raw.into_log().unwrap();
        assert_eq!(log.block_number, 5_000_000_000);
        assert_eq!(log.tx_index, 3);
        assert_eq!(log.log_index, 5);
        assert_eq!(log.data, vec![0x00, 0xff]);
    }

    #[test]
    fn header_from_json_reads_bloom() {
        let mut bloom = Bloom::default();
        bloom.accrue_address("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        let v = json!({
            "number": "0x10",
            "hash": "0xabc",
            "parentHash": "0xabb",
            "timestamp": "0x6553f100",
            "logsBloom": format!("0x{}", hex::encode(bloom.as_bytes())),
        });
        let header = header_from_json(&v).unwrap();
        assert_eq!(header.number, 16);
        assert_eq!(header.timestamp, 0x6553f100);
        assert!(header.bloom.contains_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
    }

    #[test]
    fn unreadable_bloom_never_rules_a_block_out() {
        let watched = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
        let bare = json!({"number": "0x1", "hash": "0x1", "parentHash": "0x0", "timestamp": "0x0"});
        let header = header_from_json(&bare).unwrap();
        assert!(!header.bloom.is_empty());
        assert!(header.bloom.contains_address(watched));

        let short = json!({
            "number": "0x1",
            "hash": "0x1",
            "parentHash": "0x0",
            "timestamp": "0x0",
            "logsBloom": "0x00ff",
        });
        assert!(header_from_json(&short).unwrap().bloom.contains_address(watched));
    }

    #[test]
    fn header_from_json_needs_core_fields() {
        assert!(header_from_json(&json!({"number": "0x1"})).is_none());
    }
}
