//! SQLite storage backend for chaintrack.
//!
//! Persists blocks and events to a single SQLite file. Uses `sqlx` with WAL
//! mode for concurrent read performance. Every write runs in a transaction;
//! hooks run before commit, so a failing hook rolls the write back.
//!
//! # Usage
//! ```rust,no_run
//! use chaintrack_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./track.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use chaintrack_core::bloom::Bloom;
use chaintrack_core::error::TrackError;
use chaintrack_core::store::{
    merge_with_block, run_events_hooks, run_head_hooks, EventsHook, HeadHook, Store,
};
use chaintrack_core::types::{BlockRecord, BlockState, EventQuery, EventRecord, HeadQuery};

/// Largest `IN (...)` list sent in one statement.
const ID_CHUNK: usize = 500;

const BLOCK_COLUMNS: &str = "id, chain_id, number, hash, parent_hash, state, timestamp, bloom";

/// Connection settings for file-backed databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Enable write-ahead logging.
    pub wal: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout_ms: 5_000,
            wal: true,
        }
    }
}

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` with default options.
    ///
    /// The path may be a plain file path (`"./track.db"`) or a full
    /// SQLite URL (`"sqlite:./track.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, TrackError> {
        Self::open_with(path, &SqliteOptions::default()).await
    }

    pub async fn open_with(path: &str, options: &SqliteOptions) -> Result<Self, TrackError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let journal = if options.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let connect = SqliteConnectOptions::from_str(&url)
            .map_err(storage)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal)
            .busy_timeout(Duration::from_millis(options.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await
            .map_err(storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "sqlite store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the store is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, TrackError> {
        // One connection that never recycles: each connection to
        // `:memory:` is a separate database.
        let connect = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(storage)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes.
    async fn init_schema(&self) -> Result<(), TrackError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id    INTEGER NOT NULL,
                number      INTEGER NOT NULL,
                hash        TEXT    NOT NULL,
                parent_hash TEXT    NOT NULL,
                state       INTEGER NOT NULL,
                timestamp   INTEGER NOT NULL,
                bloom       BLOB    NOT NULL,
                updated_at  INTEGER NOT NULL,
                UNIQUE (chain_id, number),
                UNIQUE (chain_id, hash)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                block_id  INTEGER NOT NULL REFERENCES blocks (id) ON DELETE CASCADE,
                address   TEXT    NOT NULL,
                topics    TEXT    NOT NULL,
                topic0    TEXT,
                data      BLOB    NOT NULL,
                tx_hash   TEXT    NOT NULL,
                tx_index  INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                removed   INTEGER NOT NULL,
                UNIQUE (block_id, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_blocks_state ON blocks (chain_id, state, number);",
            "CREATE INDEX IF NOT EXISTS idx_events_address ON events (address COLLATE NOCASE);",
            "CREATE INDEX IF NOT EXISTS idx_events_topic0 ON events (topic0 COLLATE NOCASE);",
            "CREATE INDEX IF NOT EXISTS idx_events_tx ON events (tx_hash);",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(storage)?;
        }
        Ok(())
    }

    /// Rows of `blocks` matching `query`, keyed by row id.
    async fn blocks_matching(
        &self,
        query: &HeadQuery,
    ) -> Result<Vec<(i64, BlockRecord)>, TrackError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE 1 = 1"));
        push_head_filters(&mut qb, query, "");
        qb.push(" ORDER BY chain_id, number");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(storage)?;
            out.push((id, block_from_row(row)?));
        }
        Ok(out)
    }

    async fn blocks_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, BlockRecord>, TrackError> {
        let mut out = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb =
                QueryBuilder::<Sqlite>::new(format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id IN ("));
            let mut list = qb.separated(", ");
            for id in chunk {
                list.push_bind(*id);
            }
            list.push_unseparated(")");
            for row in qb.build().fetch_all(&self.pool).await.map_err(storage)? {
                out.insert(row.try_get("id").map_err(storage)?, block_from_row(&row)?);
            }
        }
        Ok(out)
    }

    /// Event rows matching the event-level filters, optionally restricted to
    /// `block_ids`. Returns `(block_id, event)` pairs.
    async fn event_rows(
        &self,
        query: &EventQuery,
        block_ids: Option<&[i64]>,
    ) -> Result<Vec<(i64, EventRecord)>, TrackError> {
        let chunks: Vec<Option<&[i64]>> = match block_ids {
            Some(ids) => ids.chunks(ID_CHUNK).map(Some).collect(),
            None => vec![None],
        };
        let mut out = Vec::new();
        for chunk in chunks {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT e.block_id, e.address, e.topics, e.data, e.tx_hash, e.tx_index, \
                 e.log_index, e.removed FROM events e WHERE 1 = 1",
            );
            if let Some(ids) = chunk {
                qb.push(" AND e.block_id IN (");
                let mut list = qb.separated(", ");
                for id in ids {
                    list.push_bind(*id);
                }
                list.push_unseparated(")");
            }
            push_event_filters(&mut qb, query);
            for row in qb.build().fetch_all(&self.pool).await.map_err(storage)? {
                out.push((row.try_get("block_id").map_err(storage)?, event_from_row(&row)?));
            }
        }
        Ok(out)
    }
}

fn storage(err: impl std::fmt::Display) -> TrackError {
    TrackError::Storage(err.to_string())
}

/// Map a write failure, turning unique-key violations into conflicts.
fn write_error(err: sqlx::Error, chain_id: u64, what: impl FnOnce() -> String) -> TrackError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => TrackError::Conflict {
            chain_id,
            what: what(),
        },
        _ => storage(err),
    }
}

fn push_head_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &HeadQuery, prefix: &str) {
    if let Some(chain_id) = query.chain_id {
        qb.push(format!(" AND {prefix}chain_id = ")).push_bind(chain_id as i64);
    }
    if let Some(number) = query.number {
        qb.push(format!(" AND {prefix}number = ")).push_bind(number as i64);
    }
    if let Some(hash) = &query.hash {
        qb.push(format!(" AND {prefix}hash = ")).push_bind(hash.clone());
    }
    if let Some(parent) = &query.parent_hash {
        qb.push(format!(" AND {prefix}parent_hash = ")).push_bind(parent.clone());
    }
    if let Some(state) = query.state {
        qb.push(format!(" AND {prefix}state = ")).push_bind(state.code());
    }
}

fn push_event_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &EventQuery) {
    if let Some(address) = &query.address {
        qb.push(" AND e.address = ")
            .push_bind(address.clone())
            .push(" COLLATE NOCASE");
    }
    if let Some(tx_hash) = &query.tx_hash {
        qb.push(" AND e.tx_hash = ").push_bind(tx_hash.clone());
    }
    if let Some(tx_index) = query.tx_index {
        qb.push(" AND e.tx_index = ").push_bind(tx_index as i64);
    }
    if let Some(log_index) = query.log_index {
        qb.push(" AND e.log_index = ").push_bind(log_index as i64);
    }
    if let Some(topic) = &query.topic {
        qb.push(" AND e.topic0 = ")
            .push_bind(topic.clone())
            .push(" COLLATE NOCASE");
    }
    if let Some(removed) = query.removed {
        qb.push(" AND e.removed = ").push_bind(removed);
    }
}

fn block_from_row(row: &SqliteRow) -> Result<BlockRecord, TrackError> {
    let code: i64 = row.try_get("state").map_err(storage)?;
    let state = BlockState::from_code(code)
        .ok_or_else(|| TrackError::Storage(format!("unknown block state code {code}")))?;
    let bloom: Vec<u8> = row.try_get("bloom").map_err(storage)?;
    Ok(BlockRecord {
        chain_id: row.try_get::<i64, _>("chain_id").map_err(storage)? as u64,
        number: row.try_get::<i64, _>("number").map_err(storage)? as u64,
        hash: row.try_get("hash").map_err(storage)?,
        parent_hash: row.try_get("parent_hash").map_err(storage)?,
        state,
        timestamp: row.try_get::<i64, _>("timestamp").map_err(storage)? as u64,
        bloom: Bloom::from_bytes(&bloom)
            .ok_or_else(|| TrackError::Storage(format!("bad bloom length {}", bloom.len())))?,
    })
}

/// Decode an event row. Block-derived fields are left for the caller to merge.
fn event_from_row(row: &SqliteRow) -> Result<EventRecord, TrackError> {
    let topics: String = row.try_get("topics").map_err(storage)?;
    Ok(EventRecord {
        chain_id: 0,
        block_number: 0,
        block_hash: String::new(),
        state: BlockState::Unset,
        address: row.try_get("address").map_err(storage)?,
        topics: serde_json::from_str(&topics).map_err(storage)?,
        data: row.try_get("data").map_err(storage)?,
        tx_hash: row.try_get("tx_hash").map_err(storage)?,
        tx_index: row.try_get::<i64, _>("tx_index").map_err(storage)? as u32,
        log_index: row.try_get::<i64, _>("log_index").map_err(storage)? as u32,
        removed: row.try_get("removed").map_err(storage)?,
    })
}

// ─── Store impl ───────────────────────────────────────────────────────────────

#[async_trait]
impl Store for SqliteStore {
    async fn create_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            "INSERT INTO blocks
             (chain_id, number, hash, parent_hash, state, timestamp, bloom, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(head.chain_id as i64)
        .bind(head.number as i64)
        .bind(&head.hash)
        .bind(&head.parent_hash)
        .bind(head.state.code())
        .bind(head.timestamp as i64)
        .bind(head.bloom.as_bytes())
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            write_error(e, head.chain_id, || format!("block {} ({})", head.number, head.hash))
        })?;

        // Dropping `tx` on a hook failure rolls the insert back.
        run_head_hooks(&head, hooks)?;
        tx.commit().await.map_err(storage)?;

        debug!(chain_id = head.chain_id, number = head.number, state = %head.state, "head created");
        Ok(head)
    }

    async fn upsert_head(
        &self,
        head: BlockRecord,
        hooks: Vec<HeadHook>,
    ) -> Result<BlockRecord, TrackError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // A different block at this number takes its events with it.
        sqlx::query(
            "DELETE FROM events WHERE block_id IN
             (SELECT id FROM blocks WHERE chain_id = ? AND number = ? AND hash <> ?)",
        )
        .bind(head.chain_id as i64)
        .bind(head.number as i64)
        .bind(&head.hash)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            "INSERT INTO blocks
             (chain_id, number, hash, parent_hash, state, timestamp, bloom, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, number) DO UPDATE SET
                hash        = excluded.hash,
                parent_hash = excluded.parent_hash,
                timestamp   = excluded.timestamp,
                bloom       = excluded.bloom,
                updated_at  = excluded.updated_at,
                state       = CASE WHEN blocks.state = ? THEN blocks.state ELSE excluded.state END",
        )
        .bind(head.chain_id as i64)
        .bind(head.number as i64)
        .bind(&head.hash)
        .bind(&head.parent_hash)
        .bind(head.state.code())
        .bind(head.timestamp as i64)
        .bind(head.bloom.as_bytes())
        .bind(chrono::Utc::now().timestamp())
        .bind(BlockState::Confirmed.code())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, head.chain_id, || format!("block hash {}", head.hash)))?;

        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE chain_id = ? AND number = ?"
        ))
        .bind(head.chain_id as i64)
        .bind(head.number as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        let stored = block_from_row(&row)?;

        run_head_hooks(&stored, hooks)?;
        tx.commit().await.map_err(storage)?;

        debug!(chain_id = stored.chain_id, number = stored.number, state = %stored.state, "head upserted");
        Ok(stored)
    }

    async fn save_logs(
        &self,
        chain_id: u64,
        block_hash: &str,
        events: Vec<EventRecord>,
        hooks: Vec<EventsHook>,
    ) -> Result<Vec<EventRecord>, TrackError> {
        if events.is_empty() {
            return Ok(events);
        }
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Insert first so the transaction takes the write lock up front.
        let mut inserted = 0u64;
        for event in &events {
            let topics = serde_json::to_string(&event.topics).map_err(storage)?;
            let result = sqlx::query(
                "INSERT INTO events
                 (block_id, address, topics, topic0, data, tx_hash, tx_index, log_index, removed)
                 SELECT id, ?, ?, ?, ?, ?, ?, ?, ? FROM blocks WHERE chain_id = ? AND hash = ?
                 ON CONFLICT (block_id, log_index) DO NOTHING",
            )
            .bind(&event.address)
            .bind(topics)
            .bind(event.signature())
            .bind(&event.data)
            .bind(&event.tx_hash)
            .bind(event.tx_index as i64)
            .bind(event.log_index as i64)
            .bind(event.removed)
            .bind(chain_id as i64)
            .bind(block_hash)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
            inserted += result.rows_affected();
        }

        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE chain_id = ? AND hash = ?"
        ))
        .bind(chain_id as i64)
        .bind(block_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or_else(|| TrackError::NotFound(format!("block {block_hash} on chain {chain_id}")))?;
        let block = block_from_row(&row)?;

        let merged: Vec<EventRecord> = events
            .into_iter()
            .map(|e| merge_with_block(e, &block))
            .collect();
        run_events_hooks(&merged, hooks)?;
        tx.commit().await.map_err(storage)?;

        debug!(chain_id, number = block.number, inserted, "logs saved");
        Ok(merged)
    }

    async fn get_height(&self, chain_id: u64) -> Result<u64, TrackError> {
        let height: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(number), 0) FROM blocks WHERE chain_id = ? AND state = ?",
        )
        .bind(chain_id as i64)
        .bind(BlockState::Confirmed.code())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(height as u64)
    }

    async fn query_heads(&self, query: &HeadQuery) -> Result<Vec<BlockRecord>, TrackError> {
        Ok(self
            .blocks_matching(query)
            .await?
            .into_iter()
            .map(|(_, block)| block)
            .collect())
    }

    async fn count_heads(&self, query: &HeadQuery) -> Result<u64, TrackError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blocks WHERE 1 = 1");
        push_head_filters(&mut qb, query, "");
        let count: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as u64)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, TrackError> {
        // Pass one: the owning blocks, when the query filters on them.
        let (rows, mut blocks) = match query.block_filter() {
            Some(filter) => {
                let blocks: HashMap<i64, BlockRecord> =
                    self.blocks_matching(&filter).await?.into_iter().collect();
                if blocks.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<i64> = blocks.keys().copied().collect();
                (self.event_rows(query, Some(&ids)).await?, blocks)
            }
            None => (self.event_rows(query, None).await?, HashMap::new()),
        };

        // Pass two: merge each event with its block, loading any not yet cached.
        let missing: Vec<i64> = {
            let mut ids: Vec<i64> = rows
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| !blocks.contains_key(id))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        if !missing.is_empty() {
            blocks.extend(self.blocks_by_id(&missing).await?);
        }

        let mut out = Vec::with_capacity(rows.len());
        for (block_id, event) in rows {
            let block = blocks
                .get(&block_id)
                .ok_or_else(|| TrackError::Storage(format!("event references missing block {block_id}")))?;
            out.push(merge_with_block(event, block));
        }
        out.sort_by(|a, b| {
            (a.chain_id, a.block_number, a.log_index).cmp(&(b.chain_id, b.block_number, b.log_index))
        });
        Ok(out)
    }

    async fn count_events(&self, query: &EventQuery) -> Result<u64, TrackError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM events e JOIN blocks b ON b.id = e.block_id WHERE 1 = 1",
        );
        if let Some(filter) = query.block_filter() {
            push_head_filters(&mut qb, &filter, "b.");
        }
        push_event_filters(&mut qb, query);
        let count: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as u64)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn head(number: u64, state: BlockState) -> BlockRecord {
        let mut bloom = Bloom::default();
        bloom.accrue_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        BlockRecord {
            chain_id: 1,
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            state,
            timestamp: 1_700_000_000 + number * 12,
            bloom,
        }
    }

    fn event(block: u64, log_index: u32, topic0: &str) -> EventRecord {
        EventRecord {
            chain_id: 0,
            block_number: block,
            block_hash: format!("0x{block:064x}"),
            state: BlockState::Unset,
            address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
            topics: vec![topic0.into(), "0x1111".into()],
            data: vec![0xde, 0xad],
            tx_hash: format!("0x{block:032x}{log_index:032x}"),
            tx_index: log_index,
            log_index,
            removed: false,
        }
    }

    fn failing_events_hook() -> EventsHook {
        Box::new(|_: &[EventRecord]| Err(TrackError::Other("subscriber gone".into())))
    }

    // ── Heads ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn head_roundtrip_keeps_bloom() {
        let store = SqliteStore::in_memory().await.unwrap();
        let written = head(10, BlockState::Seen);
        store.create_head(written.clone(), vec![]).await.unwrap();

        let loaded = store.get_head(1, 10).await.unwrap().unwrap();
        assert_eq!(loaded, written);
        assert!(loaded.bloom.contains_address("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));
        assert_eq!(
            store.get_head_by_hash(1, &written.hash).await.unwrap().unwrap().number,
            10
        );
    }

    #[tokio::test]
    async fn duplicate_head_is_a_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_head(head(1, BlockState::Seen), vec![]).await.unwrap();

        let err = store.create_head(head(1, BlockState::Skipped), vec![]).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");

        let mut same_hash = head(2, BlockState::Seen);
        same_hash.hash = head(1, BlockState::Seen).hash;
        assert!(store.create_head(same_hash, vec![]).await.unwrap_err().is_conflict());

        assert_eq!(store.count_heads(&HeadQuery::chain(1)).await.unwrap(), 1);
        assert_eq!(store.get_head(1, 1).await.unwrap().unwrap().state, BlockState::Seen);
    }

    #[tokio::test]
    async fn failed_hook_rolls_back_create() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store
            .create_head(
                head(3, BlockState::Seen),
                vec![Box::new(|_: &BlockRecord| Err(TrackError::Other("nope".into())))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Hook(_)));
        assert!(store.get_head(1, 3).await.unwrap().is_none());
        store.create_head(head(3, BlockState::Seen), vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_never_demotes_confirmed() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_head(head(5, BlockState::Seen), vec![]).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let stored = store
            .upsert_head(
                head(5, BlockState::Confirmed),
                vec![Box::new(move |h: &BlockRecord| {
                    assert_eq!(h.state, BlockState::Confirmed);
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })],
            )
            .await
            .unwrap();
        assert_eq!(stored.state, BlockState::Confirmed);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let after = store.upsert_head(head(5, BlockState::Seen), vec![]).await.unwrap();
        assert_eq!(after.state, BlockState::Confirmed);
        assert_eq!(store.get_height(1).await.unwrap(), 5);
        assert_eq!(store.get_height(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_with_foreign_hash_conflicts() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_head(head(1, BlockState::Seen), vec![]).await.unwrap();
        let mut stolen = head(2, BlockState::Confirmed);
        stolen.hash = head(1, BlockState::Seen).hash;
        assert!(store.upsert_head(stolen, vec![]).await.unwrap_err().is_conflict());
        assert!(store.get_head(1, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replacing_a_block_drops_its_events() {
        let store = SqliteStore::in_memory().await.unwrap();
        let original = head(4, BlockState::Seen);
        store.create_head(original.clone(), vec![]).await.unwrap();
        store
            .save_logs(1, &original.hash, vec![event(4, 0, "0xsig")], vec![])
            .await
            .unwrap();

        let mut fork = head(4, BlockState::Confirmed);
        fork.hash = "0xfork".into();
        store.upsert_head(fork, vec![]).await.unwrap();

        assert!(store.get_head_by_hash(1, &original.hash).await.unwrap().is_none());
        assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 0);
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn save_logs_needs_owning_block() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store
            .save_logs(1, &head(7, BlockState::Seen).hash, vec![event(7, 0, "0xsig")], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::NotFound(_)));
        assert_eq!(store.count_events(&EventQuery::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_logs_is_idempotent_per_log_index() {
        let store = SqliteStore::in_memory().await.unwrap();
        let block = head(8, BlockState::Seen);
        store.create_head(block.clone(), vec![]).await.unwrap();

        let saved = store
            .save_logs(1, &block.hash, vec![event(8, 0, "0xsig"), event(8, 1, "0xsig")], vec![])
            .await
            .unwrap();
        assert!(saved.iter().all(|e| e.chain_id == 1 && e.state == BlockState::Seen));

        store
            .save_logs(1, &block.hash, vec![event(8, 1, "0xsig")], vec![])
            .await
            .unwrap();
        assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 2);

        // empty submissions run no hooks
        store
            .save_logs(1, "0xmissing", vec![], vec![failing_events_hook()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_hook_rolls_back_events() {
        let store = SqliteStore::in_memory().await.unwrap();
        let block = head(9, BlockState::Seen);
        store.create_head(block.clone(), vec![]).await.unwrap();
        let err = store
            .save_logs(1, &block.hash, vec![event(9, 0, "0xsig")], vec![failing_events_hook()])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Hook(_)));
        assert_eq!(store.count_events(&EventQuery::chain(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn events_take_state_from_their_block() {
        let store = SqliteStore::in_memory().await.unwrap();
        let block = head(3, BlockState::Seen);
        store.create_head(block.clone(), vec![]).await.unwrap();
        store
            .save_logs(1, &block.hash, vec![event(3, 0, "0xsig")], vec![])
            .await
            .unwrap();
        store.upsert_head(head(3, BlockState::Confirmed), vec![]).await.unwrap();

        let events = store
            .query_events(&EventQuery::chain(1).state(BlockState::Confirmed))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, BlockState::Confirmed);
        assert_eq!(events[0].block_number, 3);
        assert_eq!(events[0].data, vec![0xde, 0xad]);
        assert_eq!(
            store
                .count_events(&EventQuery::chain(1).state(BlockState::Seen))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn topic_and_address_queries() {
        let store = SqliteStore::in_memory().await.unwrap();
        for n in 1..=3 {
            store.create_head(head(n, BlockState::Seen), vec![]).await.unwrap();
        }
        store
            .save_logs(
                1,
                &head(1, BlockState::Seen).hash,
                vec![event(1, 0, "0xTransfer"), event(1, 1, "0xapproval")],
                vec![],
            )
            .await
            .unwrap();
        store
            .save_logs(1, &head(3, BlockState::Seen).hash, vec![event(3, 0, "0xtransfer")], vec![])
            .await
            .unwrap();

        let transfers = store
            .query_events(&EventQuery::default().topic("0xtransfer"))
            .await
            .unwrap();
        assert_eq!(
            transfers.iter().map(|e| e.block_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
        // second topics never match
        assert_eq!(
            store.count_events(&EventQuery::default().topic("0x1111")).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .count_events(
                    &EventQuery::chain(1)
                        .address("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
                        .block_number(1)
                )
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn head_queries_filter_and_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_head(head(3, BlockState::Confirmed), vec![]).await.unwrap();
        store.create_head(head(1, BlockState::Skipped), vec![]).await.unwrap();
        store.create_head(head(2, BlockState::Seen), vec![]).await.unwrap();

        let all = store.query_heads(&HeadQuery::chain(1)).await.unwrap();
        assert_eq!(all.iter().map(|h| h.number).collect::<Vec<_>>(), vec![1, 2, 3]);
        let seen = store
            .query_heads(&HeadQuery::chain(1).state(BlockState::Seen))
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            store
                .count_heads(&HeadQuery::default().parent_hash(head(1, BlockState::Seen).hash))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("chaintrack-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("persist.db");
        let path = path.to_str().unwrap();
        let _ = std::fs::remove_file(path);

        {
            let store = SqliteStore::open(path).await.unwrap();
            store.upsert_head(head(42, BlockState::Confirmed), vec![]).await.unwrap();
        }
        let store = SqliteStore::open(path).await.unwrap();
        assert_eq!(store.get_height(1).await.unwrap(), 42);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
