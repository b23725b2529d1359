//! chaintrack-evm — EVM JSON-RPC adapter for the tracker.

pub mod fetcher;
pub mod poller;

pub use fetcher::{header_from_json, parse_hex_u64, EvmFetcher, EvmRpcClient, RawLog};
pub use poller::{PollConfig, PollingClient};
