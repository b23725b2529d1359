//! chaintrack-storage — durable storage backends for chaintrack.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The in-memory backend lives in `chaintrack-core` as `MemoryStore`.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOptions, SqliteStore};
