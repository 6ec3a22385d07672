//! Live conversation log with a searchable history window.

use anyhow::Result;
use rusqlite::params;
use tracing::warn;

use super::schema::OnlineMessage;
use super::{now_rfc3339, SqlitePool};

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO online_conversations (conversation_id, role, content, message_type, created_at)
             VALUES (?1, ?2, ?3, 'text', ?4)",
            params![conversation_id, role, content, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The last `limit` messages of a conversation in chronological order.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<OnlineMessage>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at FROM (
               SELECT id, role, content, created_at
               FROM online_conversations
               WHERE conversation_id = ?1
               ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let msgs = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(msgs)
    }

    /// Older lines of the same conversation related to the query, excluding
    /// everything newer than `cutoff_id` (the recent window already shown to
    /// the model) and everything created before `since` (rfc3339, compared
    /// lexically). Falls back to the latest qualifying lines when the match
    /// finds nothing.
    pub fn related_history(
        &self,
        conversation_id: &str,
        match_expr: &str,
        cutoff_id: i64,
        since: &str,
        limit: usize,
    ) -> Result<Vec<OnlineMessage>> {
        let conn = self.pool.get()?;
        if !match_expr.trim().is_empty() {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.role, c.content, c.created_at
                 FROM online_conversations_fts f
                 JOIN online_conversations c ON c.id = f.rowid
                 WHERE online_conversations_fts MATCH ?1
                   AND c.conversation_id = ?2 AND c.id < ?3 AND c.created_at >= ?4
                 ORDER BY bm25(online_conversations_fts)
                 LIMIT ?5",
            )?;
            let matched = stmt
                .query_map(
                    params![match_expr, conversation_id, cutoff_id, since, limit as i64],
                    row_to_message,
                )
                .and_then(|mapped| mapped.collect::<rusqlite::Result<Vec<_>>>());
            match matched {
                Ok(mut msgs) if !msgs.is_empty() => {
                    msgs.sort_by_key(|m| m.id);
                    return Ok(msgs);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "online history match failed, using recency fallback");
                }
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at FROM (
               SELECT id, role, content, created_at
               FROM online_conversations
               WHERE conversation_id = ?1 AND id < ?2 AND created_at >= ?3
               ORDER BY id DESC LIMIT ?4
             ) ORDER BY id ASC",
        )?;
        let msgs = stmt
            .query_map(
                params![conversation_id, cutoff_id, since, limit as i64],
                row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(msgs)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<OnlineMessage> {
    Ok(OnlineMessage {
        id: row.get(0)?,
        role: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
    })
}
