//! SQLite-backed chat store.
//!
//! One pooled database holds the historical baseline (messages and the
//! segment windows cut from them), per-segment embedding rows, the live
//! online conversation log, and versioned profile payloads. FTS5 shadow
//! tables over segments and online messages back the lexical retrieval
//! channel.

mod conversation_store;
mod profile_store;
mod schema;
mod segment_store;

pub use conversation_store::ConversationStore;
pub use profile_store::ProfileStore;
pub use schema::{OnlineMessage, PersonaKey, ProfileRow, Segment, SegmentLine, SCHEMA_SQL};
pub use segment_store::{LexicalHit, SegmentStore, StoredEmbedding};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

/// Owns the connection pool and hands out the per-concern store views.
#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
    pub segments: SegmentStore,
    pub conversations: ConversationStore,
    pub profiles: ProfileStore,
}

impl ChatStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;
                 PRAGMA busy_timeout=5000;",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("building sqlite connection pool")?;
        let pool = Arc::new(pool);

        {
            let conn = pool.get().context("acquiring connection for schema init")?;
            conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        }

        info!(db_path = %path.display(), "chat store opened");
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            segments: SegmentStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            profiles: ProfileStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn pool(&self) -> SqlitePool {
        Arc::clone(&self.pool)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_schema_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let store = ChatStore::open(&path).unwrap();

        let conn = store.pool().get().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'baseline_segments'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        drop(conn);

        // Reopening the same file must not fail or wipe data.
        let _again = ChatStore::open(&path).unwrap();
    }
}
