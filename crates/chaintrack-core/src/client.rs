//! The chain-data source the tracker reads from.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TrackError;
use crate::types::{BlockHeader, Log};

/// Push-based stream of new heads. Dropping it unsubscribes.
///
/// An `Err` item or the end of the stream is unrecoverable for the tracker.
pub type HeadStream = BoxStream<'static, Result<BlockHeader, TrackError>>;

/// Capabilities the tracker needs from a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// The chain id the node serves.
    async fn chain_id(&self) -> Result<u64, TrackError>;

    /// Subscribe to new block heads.
    ///
    /// `cancel` is the tracker's shutdown signal; implementations should stop
    /// producing (and end the stream) once it fires.
    async fn subscribe_heads(&self, cancel: CancellationToken) -> Result<HeadStream, TrackError>;

    /// Fetch one header by number.
    async fn header_by_number(&self, number: u64) -> Result<BlockHeader, TrackError>;

    /// Logs emitted by any of `addresses` in blocks `[from, to]`, ordered by
    /// block then log index.
    async fn filter_logs(
        &self,
        addresses: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, TrackError>;
}
