//! The tracker: a live watch loop and a backfill loop sharing one store and
//! one set of subscribers.
//!
//! ```text
//! Tracker::start
//!   ├── watch   new heads → seen/skipped → (number − T) confirmed
//!   └── sync    [start, first − 1]: confirmed below the window, seen inside it
//! ```
//!
//! Both loops write through the same [`Store`]; its uniqueness constraints
//! are what stop the two paths from double-recording a block. Conflicts are
//! expected and swallowed. Any other failure is unrecoverable: it is
//! broadcast to address subscribers and the tracker stops itself.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::bloom::Bloom;
use crate::client::ChainClient;
use crate::config::{TrackerConfig, TrackerStatus};
use crate::error::TrackError;
use crate::store::{EventsHook, HeadHook, Store};
use crate::subscription::{Dispatcher, Subscription};
use crate::types::{BlockHeader, BlockRecord, BlockState, EventRecord};

#[derive(Default)]
struct Lifecycle {
    status: TrackerStatus,
    /// Bumped by every start; a stop requested by an older run is ignored.
    generation: u64,
    chain_id: Option<u64>,
    start_height: u64,
    confirmations: Option<u64>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    config: TrackerConfig,
    span: Span,
    lifecycle: RwLock<Lifecycle>,
    stopped: Notify,
}

/// Follows one chain and reports block and event transitions.
///
/// Cheap to clone; clones share the same loops and subscribers.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// A tracker with default settings. `confirmations` overrides the
    /// per-chain threshold.
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        confirmations: Option<u64>,
    ) -> Self {
        let config = TrackerConfig {
            confirmations,
            ..TrackerConfig::default()
        };
        Self::with_config(client, store, config, info_span!("tracker"))
    }

    pub(crate) fn with_config(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        config: TrackerConfig,
        span: Span,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            config.queue_capacity,
            config.error_queue_capacity,
        ));
        let lifecycle = Lifecycle {
            start_height: config.start_height,
            ..Lifecycle::default()
        };
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                dispatcher,
                config,
                span,
                lifecycle: RwLock::new(lifecycle),
                stopped: Notify::new(),
            }),
        }
    }

    /// Set the first block the backfill considers.
    ///
    /// Fails once any start has resolved the chain id.
    pub fn set_height(&self, height: u64) -> Result<(), TrackError> {
        let mut lc = self.inner.lifecycle.write();
        if let Some(chain_id) = lc.chain_id {
            return Err(TrackError::HeightLocked { chain_id });
        }
        lc.start_height = height;
        Ok(())
    }

    /// Start tracking.
    ///
    /// Resolves the chain id, launches the watch loop, and returns once the
    /// first live block has been observed; the backfill up to that block
    /// then runs in the background. Cancelling `ctx` stops the tracker.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), TrackError> {
        {
            let mut lc = self.inner.lifecycle.write();
            if lc.status != TrackerStatus::Idle {
                return Err(TrackError::AlreadyRunning);
            }
            lc.status = TrackerStatus::Starting;
        }

        let chain_id = match self.inner.client.chain_id().await {
            Ok(id) => id,
            Err(e) => {
                error!(parent: &self.inner.span, error = %e, "failed to resolve chain id");
                self.inner.lifecycle.write().status = TrackerStatus::Idle;
                return Err(e);
            }
        };
        // Read before the watch loop runs: its first confirmation would
        // otherwise raise the height past the range still to backfill.
        let height = match self.inner.store.get_height(chain_id).await {
            Ok(height) => height,
            Err(e) => {
                error!(parent: &self.inner.span, chain_id, error = %e, "failed to read stored height");
                self.inner.lifecycle.write().status = TrackerStatus::Idle;
                return Err(e);
            }
        };
        let confirmations = self.inner.config.threshold_for(chain_id);
        let cancel = ctx.child_token();
        let (first_tx, first_rx) = oneshot::channel();

        let (session, start_height) = {
            let mut lc = self.inner.lifecycle.write();
            if lc.status != TrackerStatus::Starting {
                // stopped while resolving the chain id
                return Err(TrackError::Cancelled);
            }
            lc.generation += 1;
            let session = Session {
                tracker: self.clone(),
                generation: lc.generation,
                chain_id,
                confirmations,
                cancel: cancel.clone(),
            };
            lc.chain_id = Some(chain_id);
            lc.confirmations = Some(confirmations);
            lc.cancel = Some(cancel.clone());
            let watch = session
                .clone()
                .watch(first_tx)
                .instrument(self.inner.span.clone());
            lc.tasks.push(tokio::spawn(watch));
            (session, resume_height(lc.start_height, height))
        };
        info!(
            parent: &self.inner.span,
            chain_id,
            confirmations,
            start_height,
            stored_height = height,
            "tracker started, waiting for first live block"
        );

        let first = tokio::select! {
            biased;
            first = first_rx => first,
            _ = cancel.cancelled() => {
                self.stop().await;
                return Err(TrackError::Cancelled);
            }
        };
        let first = match first {
            Ok(number) => number,
            Err(_) => {
                self.stop().await;
                if ctx.is_cancelled() {
                    return Err(TrackError::Cancelled);
                }
                return Err(TrackError::Aborted {
                    reason: "watch loop ended before the first live block".into(),
                });
            }
        };

        let mut lc = self.inner.lifecycle.write();
        if cancel.is_cancelled() || lc.status != TrackerStatus::Starting {
            debug!(parent: &self.inner.span, first, "stopped before backfill started");
            return Err(TrackError::Cancelled);
        }
        let sync = session
            .sync(start_height, first.saturating_sub(1))
            .instrument(self.inner.span.clone());
        lc.tasks.push(tokio::spawn(sync));
        lc.status = TrackerStatus::Running;
        Ok(())
    }

    /// Stop tracking.
    ///
    /// Closes every subscription, cancels both loops and waits for them to
    /// exit. A no-op when not running; waits for a stop already in progress.
    pub async fn stop(&self) {
        self.shutdown(None).await
    }

    /// Stop, but only if `generation` (when given) is still the current run.
    async fn shutdown(&self, generation: Option<u64>) {
        // Registered before the status check so the wake-up cannot be missed.
        let stopped = self.inner.stopped.notified();
        match self.begin_shutdown(generation) {
            Shutdown::Skipped => {}
            Shutdown::InProgress => stopped.await,
            Shutdown::Join(tasks) => self.finish_shutdown(tasks).await,
        }
    }

    /// Mark the run as stopping, cancel it and close every subscription.
    /// Does not wait.
    fn begin_shutdown(&self, generation: Option<u64>) -> Shutdown {
        let tasks = {
            let mut lc = self.inner.lifecycle.write();
            if generation.is_some_and(|g| g != lc.generation) {
                return Shutdown::Skipped;
            }
            match lc.status {
                TrackerStatus::Idle => return Shutdown::Skipped,
                TrackerStatus::Stopping => return Shutdown::InProgress,
                TrackerStatus::Starting | TrackerStatus::Running => {}
            }
            lc.status = TrackerStatus::Stopping;
            if let Some(cancel) = lc.cancel.take() {
                cancel.cancel();
            }
            std::mem::take(&mut lc.tasks)
        };
        let closed = self.inner.dispatcher.close_all();
        debug!(parent: &self.inner.span, subscriptions = closed, "tracker stopping");
        Shutdown::Join(tasks)
    }

    async fn finish_shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(parent: &self.inner.span, error = %e, "tracker task panicked");
                }
            }
        }

        self.inner.lifecycle.write().status = TrackerStatus::Idle;
        self.inner.stopped.notify_waiters();
        info!(parent: &self.inner.span, "tracker stopped");
    }

    /// Receive every block transition.
    pub fn subscribe_heads(&self) -> Subscription<BlockRecord> {
        self.inner.dispatcher.subscribe_heads()
    }

    /// Receive events emitted by `address`.
    pub fn subscribe_events(&self, address: impl Into<String>) -> Subscription<EventRecord> {
        self.inner.dispatcher.subscribe_events(address)
    }

    pub fn status(&self) -> TrackerStatus {
        self.inner.lifecycle.read().status
    }

    pub fn is_running(&self) -> bool {
        self.status() != TrackerStatus::Idle
    }

    /// The chain id resolved by the last start.
    pub fn chain_id(&self) -> Option<u64> {
        self.inner.lifecycle.read().chain_id
    }

    /// The threshold in effect, once a start has resolved it.
    pub fn confirmations(&self) -> Option<u64> {
        self.inner.lifecycle.read().confirmations
    }

    pub fn start_height(&self) -> u64 {
        self.inner.lifecycle.read().start_height
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.dispatcher.head_subscribers() + self.inner.dispatcher.event_subscribers()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }
}

enum Shutdown {
    /// Already idle, or the request came from an older run.
    Skipped,
    /// Another caller is stopping the run.
    InProgress,
    Join(Vec<JoinHandle<()>>),
}

/// First block the backfill should fetch: never at or below the stored
/// confirmed height.
fn resume_height(start_height: u64, stored: u64) -> u64 {
    if stored > 0 {
        start_height.max(stored + 1)
    } else {
        start_height
    }
}

/// Everything one run of the loops needs, fixed at start.
#[derive(Clone)]
struct Session {
    tracker: Tracker,
    generation: u64,
    chain_id: u64,
    confirmations: u64,
    cancel: CancellationToken,
}

impl Session {
    fn client(&self) -> &Arc<dyn ChainClient> {
        &self.tracker.inner.client
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.tracker.inner.store
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.tracker.inner.dispatcher
    }

    // ─── Loops ───────────────────────────────────────────────────────────────

    async fn watch(self, first: oneshot::Sender<u64>) {
        let mut heads = match self.client().subscribe_heads(self.cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        debug!(chain_id = self.chain_id, "subscribed to new heads");

        let mut first = Some(first);
        loop {
            let header = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // A no-op when stop() cancelled us; covers the caller's
                    // context being cancelled.
                    self.stop_in_background();
                    break;
                }
                next = heads.next() => match next {
                    Some(Ok(header)) => header,
                    Some(Err(e)) => {
                        self.fail(e);
                        break;
                    }
                    None => {
                        self.fail(TrackError::Rpc("head subscription ended".into()));
                        break;
                    }
                },
            };
            if let Some(tx) = first.take() {
                let _ = tx.send(header.number);
            }
            if let Err(e) = self.on_live_header(&header).await {
                self.fail(e);
                break;
            }
        }
        debug!(chain_id = self.chain_id, "watch loop exited");
    }

    async fn sync(self, start: u64, end: u64) {
        if let Err(e) = self.backfill(start, end).await {
            self.fail(e);
        }
    }

    async fn backfill(&self, start: u64, end: u64) -> Result<(), TrackError> {
        if end == 0 {
            debug!(chain_id = self.chain_id, "nothing to backfill");
            return Ok(());
        }
        if start > end {
            debug!(chain_id = self.chain_id, start, end, "store already covers the backfill range");
            return Ok(());
        }
        info!(
            chain_id = self.chain_id,
            from = start,
            to = end,
            confirmations = self.confirmations,
            "backfill started"
        );

        // Blocks already past the window go straight to confirmed.
        let seen_from = match end.checked_sub(self.confirmations) {
            Some(split) => {
                for number in start..=split {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let header = self.client().header_by_number(number).await?;
                    self.on_confirmed_header(&header).await?;
                }
                start.max(split.saturating_add(1))
            }
            None => start,
        };
        for number in seen_from..=end {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let header = self.client().header_by_number(number).await?;
            self.on_observed_header(&header).await?;
        }

        info!(chain_id = self.chain_id, to = end, "backfill complete");
        Ok(())
    }

    // ─── Block processing ────────────────────────────────────────────────────

    async fn on_live_header(&self, header: &BlockHeader) -> Result<(), TrackError> {
        self.on_observed_header(header).await?;
        if header.number >= self.confirmations {
            let target = self
                .client()
                .header_by_number(header.number - self.confirmations)
                .await?;
            self.on_confirmed_header(&target).await?;
        }
        Ok(())
    }

    /// Record a block that is not yet past the window as seen (or skipped
    /// when nothing subscribed can be in it).
    async fn on_observed_header(&self, header: &BlockHeader) -> Result<(), TrackError> {
        let seen = self.may_contain_subscribed(&header.bloom);
        let state = if seen { BlockState::Seen } else { BlockState::Skipped };
        let record = BlockRecord::from_header(self.chain_id, header, state);

        let dispatcher = Arc::clone(self.dispatcher());
        let notify: HeadHook = Box::new(move |stored: &BlockRecord| {
            dispatcher.dispatch_head(&stored.with_state(BlockState::Seen));
            Ok(())
        });
        match self.store().create_head(record, vec![notify]).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(chain_id = self.chain_id, number = header.number, "block already recorded");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if !seen {
            return Ok(());
        }

        let events = self.extract_events(header, BlockState::Seen).await?;
        if events.is_empty() {
            return Ok(());
        }
        let dispatcher = Arc::clone(self.dispatcher());
        let notify: EventsHook = Box::new(move |stored: &[EventRecord]| {
            dispatcher.dispatch_events(stored);
            Ok(())
        });
        self.store()
            .save_logs(self.chain_id, &header.hash, events, vec![notify])
            .await?;
        Ok(())
    }

    /// Promote a block that is past the window to confirmed.
    async fn on_confirmed_header(&self, header: &BlockHeader) -> Result<(), TrackError> {
        let events = if self.may_contain_subscribed(&header.bloom) {
            self.extract_events(header, BlockState::Confirmed).await?
        } else {
            Vec::new()
        };
        self.dispatcher().dispatch_events(&events);

        let record = BlockRecord::from_header(self.chain_id, header, BlockState::Confirmed);
        let dispatcher = Arc::clone(self.dispatcher());
        let notify: HeadHook = Box::new(move |stored: &BlockRecord| {
            dispatcher.dispatch_head(stored);
            Ok(())
        });
        self.store().upsert_head(record, vec![notify]).await?;

        if !events.is_empty() {
            self.store()
                .save_logs(self.chain_id, &header.hash, events, Vec::new())
                .await?;
        }
        debug!(chain_id = self.chain_id, number = header.number, "block confirmed");
        Ok(())
    }

    fn may_contain_subscribed(&self, bloom: &Bloom) -> bool {
        self.dispatcher()
            .addresses()
            .iter()
            .any(|address| bloom.contains_address(address))
    }

    async fn extract_events(
        &self,
        header: &BlockHeader,
        state: BlockState,
    ) -> Result<Vec<EventRecord>, TrackError> {
        let addresses = self.dispatcher().addresses();
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let logs = self
            .client()
            .filter_logs(&addresses, header.number, header.number)
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.removed {
                warn!(
                    chain_id = self.chain_id,
                    number = header.number,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    "dropping log removed by reorg"
                );
                continue;
            }
            events.push(EventRecord::from_log(self.chain_id, state, log));
        }
        Ok(events)
    }

    // ─── Failure ─────────────────────────────────────────────────────────────

    fn fail(&self, err: TrackError) {
        if self.cancel.is_cancelled() {
            debug!(chain_id = self.chain_id, error = %err, "error after shutdown ignored");
            return;
        }
        error!(chain_id = self.chain_id, error = %err, "unrecoverable tracker error, stopping");
        self.dispatcher().broadcast_error(Arc::new(err));
        self.stop_in_background();
    }

    /// Stop this run. The run is marked stopping before this returns; the
    /// join happens in the background, since the caller is one of the tasks
    /// being joined.
    fn stop_in_background(&self) {
        let Shutdown::Join(tasks) = self.tracker.begin_shutdown(Some(self.generation)) else {
            return;
        };
        let tracker = self.tracker.clone();
        let span = tracker.inner.span.clone();
        tokio::spawn(async move { tracker.finish_shutdown(tasks).await }.instrument(span));
    }
}
