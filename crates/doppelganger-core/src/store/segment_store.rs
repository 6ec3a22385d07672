//! Baseline segments, their embedding rows, and the lexical (FTS5) channel.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::config::TextSource;

use super::schema::{PersonaKey, Segment, SegmentLine};
use super::{now_rfc3339, SqlitePool};

/// A persisted per-segment embedding, decoded from its blob.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub segment_id: i64,
    pub persona_key: PersonaKey,
    pub vector: Vec<f32>,
    pub norm: f32,
}

/// A lexical-channel match. `rank` is ascending-better (bm25 order for FTS
/// hits, large sentinel ranks for the weaker fallback channels).
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub segment_id: i64,
    pub anchor_text: String,
    pub anchor_timestamp_unix: Option<i64>,
    pub rank: f64,
}

const LIKE_RANK: f64 = 10_000.0;
const RECENT_RANK: f64 = 20_000.0;

/// SQLite caps bound parameters; chunk id lists well under the limit.
const ID_CHUNK: usize = 800;

#[derive(Clone)]
pub struct SegmentStore {
    pool: SqlitePool,
}

impl SegmentStore {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ===== Ingestion =====

    pub fn insert_baseline_message(
        &self,
        persona: &PersonaKey,
        sender: &str,
        role: &str,
        content: &str,
        msg_type: &str,
        timestamp_raw: &str,
        timestamp_unix: Option<i64>,
        is_garbled: bool,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO baseline_messages
               (sender, msg_type, timestamp_raw, timestamp_unix, persona_key, role, content, is_garbled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                sender,
                msg_type,
                timestamp_raw,
                timestamp_unix,
                persona.as_str(),
                role,
                content,
                is_garbled as i64,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_segment(
        &self,
        persona: &PersonaKey,
        anchor_id: i64,
        anchor_text: &str,
        segment_text: &str,
        start_msg_id: i64,
        end_msg_id: i64,
        anchor_timestamp_unix: Option<i64>,
        line_count: i64,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO baseline_segments
               (anchor_user_id, persona_key, anchor_text, segment_text,
                start_msg_id, end_msg_id, anchor_timestamp_unix, line_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                anchor_id,
                persona.as_str(),
                anchor_text,
                segment_text,
                start_msg_id,
                end_msg_id,
                anchor_timestamp_unix,
                line_count,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ===== Segment lookups =====

    pub fn segment_by_id(&self, segment_id: i64) -> Result<Option<Segment>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, persona_key, anchor_user_id, anchor_text, segment_text,
                    start_msg_id, end_msg_id, anchor_timestamp_unix, line_count
             FROM baseline_segments WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![segment_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_segment(row)?)),
            None => Ok(None),
        }
    }

    pub fn segments_by_ids(&self, ids: &[i64]) -> Result<Vec<Segment>> {
        let conn = self.pool.get()?;
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = placeholders(chunk.len());
            let sql = format!(
                "SELECT id, persona_key, anchor_user_id, anchor_text, segment_text,
                        start_msg_id, end_msg_id, anchor_timestamp_unix, line_count
                 FROM baseline_segments WHERE id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                out.push(row_to_segment(row)?);
            }
        }
        Ok(out)
    }

    /// Conversation lines inside a segment window, ordered by row id.
    /// Only plain text lines are returned; garbled rows are skipped.
    pub fn lines_in_range(
        &self,
        persona: &PersonaKey,
        start_msg_id: i64,
        end_msg_id: i64,
    ) -> Result<Vec<SegmentLine>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, role, sender, content, COALESCE(timestamp_raw, '')
             FROM baseline_messages
             WHERE persona_key = ?1 AND id BETWEEN ?2 AND ?3
               AND msg_type = '1' AND is_garbled = 0
             ORDER BY id ASC",
        )?;
        let lines = stmt
            .query_map(params![persona.as_str(), start_msg_id, end_msg_id], |row| {
                Ok(SegmentLine {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    timestamp_raw: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    // ===== Lexical channel =====

    /// FTS5 match over segment anchor/window text, bm25-ordered.
    pub fn fts_hits(
        &self,
        match_expr: &str,
        persona: &PersonaKey,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        if match_expr.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.anchor_text, s.anchor_timestamp_unix, bm25(baseline_segments_fts)
             FROM baseline_segments_fts f
             JOIN baseline_segments s ON s.id = f.rowid
             WHERE baseline_segments_fts MATCH ?1 AND s.persona_key = ?2
             ORDER BY bm25(baseline_segments_fts)
             LIMIT ?3",
        )?;
        let result = stmt.query_map(params![match_expr, persona.as_str(), limit as i64], |row| {
            Ok(LexicalHit {
                segment_id: row.get(0)?,
                anchor_text: row.get(1)?,
                anchor_timestamp_unix: row.get(2)?,
                rank: row.get(3)?,
            })
        });
        // Malformed MATCH expressions surface as SQL errors, either at bind
        // or at the first step; the caller falls through to the LIKE channel.
        let hits = result.and_then(|mapped| mapped.collect::<rusqlite::Result<Vec<_>>>());
        match hits {
            Ok(hits) => Ok(hits),
            Err(err) => {
                warn!(error = %err, "fts match failed, skipping channel");
                Ok(Vec::new())
            }
        }
    }

    /// Substring fallback over anchor text for the given n-gram patterns.
    pub fn like_hits(
        &self,
        patterns: &[String],
        persona: &PersonaKey,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let clauses = (0..patterns.len())
            .map(|i| format!("anchor_text LIKE ?{}", i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT id, anchor_text, anchor_timestamp_unix
             FROM baseline_segments
             WHERE persona_key = ?1 AND ({clauses})
             ORDER BY id DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(persona.as_str().to_string())];
        for p in patterns {
            bound.push(Box::new(format!("%{p}%")));
        }
        let hits = stmt
            .query_map(
                rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())),
                |row| {
                    Ok(LexicalHit {
                        segment_id: row.get(0)?,
                        anchor_text: row.get(1)?,
                        anchor_timestamp_unix: row.get(2)?,
                        rank: LIKE_RANK,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// Most recent segments, used when both keyword channels come up empty.
    pub fn recent_hits(&self, persona: &PersonaKey, limit: usize) -> Result<Vec<LexicalHit>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, anchor_text, anchor_timestamp_unix
             FROM baseline_segments
             WHERE persona_key = ?1
             ORDER BY anchor_timestamp_unix DESC, id DESC
             LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![persona.as_str(), limit as i64], |row| {
                Ok(LexicalHit {
                    segment_id: row.get(0)?,
                    anchor_text: row.get(1)?,
                    anchor_timestamp_unix: row.get(2)?,
                    rank: RECENT_RANK,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    // ===== Embedding rows =====

    /// Segments without an embedding row for the given model/source, paired
    /// with the text to embed. Empty window text falls back to anchor text.
    /// Segments whose effective text is blank are excluded in SQL, so the
    /// paged backfill loop never re-fetches them.
    pub fn segments_missing_embeddings(
        &self,
        model: &str,
        source: TextSource,
        limit: usize,
    ) -> Result<Vec<(i64, PersonaKey, String)>> {
        let conn = self.pool.get()?;
        let non_blank = match source {
            TextSource::AnchorText => "trim(s.anchor_text) <> ''",
            TextSource::SegmentText => "(trim(s.segment_text) <> '' OR trim(s.anchor_text) <> '')",
        };
        let sql = format!(
            "SELECT s.id, s.persona_key, s.anchor_text, s.segment_text
             FROM baseline_segments s
             LEFT JOIN segment_embeddings e
               ON e.segment_id = s.id AND e.model = ?1 AND e.text_source = ?2
             WHERE e.segment_id IS NULL AND {non_blank}
             ORDER BY s.id ASC
             LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![model, source.as_str(), limit as i64], |row| {
                let anchor: String = row.get(2)?;
                let window: String = row.get(3)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, anchor, window))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, persona, anchor, window)| {
                let text = match source {
                    TextSource::AnchorText => anchor,
                    TextSource::SegmentText => {
                        if window.trim().is_empty() {
                            anchor
                        } else {
                            window
                        }
                    }
                };
                (id, PersonaKey::new(persona), text)
            })
            .collect())
    }

    pub fn upsert_embedding(
        &self,
        segment_id: i64,
        persona: &PersonaKey,
        model: &str,
        source: TextSource,
        vector: &[f32],
    ) -> Result<()> {
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            return Err(anyhow!("degenerate embedding for segment {segment_id}"));
        }
        let blob = bincode::serialize(vector).context("encoding embedding blob")?;
        let now = now_rfc3339();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO segment_embeddings
               (segment_id, persona_key, model, dim, text_source, vector_blob, norm, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(segment_id) DO UPDATE SET
               persona_key = excluded.persona_key,
               model = excluded.model,
               dim = excluded.dim,
               text_source = excluded.text_source,
               vector_blob = excluded.vector_blob,
               norm = excluded.norm,
               updated_at = excluded.updated_at",
            params![
                segment_id,
                persona.as_str(),
                model,
                vector.len() as i64,
                source.as_str(),
                blob,
                norm as f64,
                now,
            ],
        )?;
        Ok(())
    }

    /// All embedding rows matching the active model/dim/source, decoded and
    /// ordered by segment id. This is the snapshot build input.
    pub fn embeddings_for_build(
        &self,
        model: &str,
        dim: usize,
        source: TextSource,
    ) -> Result<Vec<StoredEmbedding>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT segment_id, persona_key, vector_blob
             FROM segment_embeddings
             WHERE model = ?1 AND dim = ?2 AND text_source = ?3
             ORDER BY segment_id ASC",
        )?;
        let raw = stmt
            .query_map(params![model, dim as i64, source.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (segment_id, persona, blob) in raw {
            let vector: Vec<f32> = match bincode::deserialize(&blob) {
                Ok(v) => v,
                Err(err) => {
                    warn!(segment_id, error = %err, "skipping undecodable embedding blob");
                    continue;
                }
            };
            if vector.len() != dim {
                warn!(segment_id, got = vector.len(), want = dim, "skipping wrong-dim embedding");
                continue;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if !norm.is_finite() || norm <= 0.0 {
                warn!(segment_id, "skipping zero-norm embedding");
                continue;
            }
            out.push(StoredEmbedding {
                segment_id,
                persona_key: PersonaKey::new(persona),
                vector,
                norm,
            });
        }
        debug!(rows = out.len(), model, dim, "loaded embeddings for build");
        Ok(out)
    }

    pub fn embedding_count(&self, model: &str, dim: usize, source: TextSource) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM segment_embeddings
             WHERE model = ?1 AND dim = ?2 AND text_source = ?3",
            params![model, dim as i64, source.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Subset of `ids` that lack a compatible embedding row, paired with
    /// persona and the text to embed. Empty-text segments are skipped.
    pub fn missing_among(
        &self,
        ids: &[i64],
        model: &str,
        source: TextSource,
    ) -> Result<Vec<(i64, PersonaKey, String)>> {
        let conn = self.pool.get()?;
        let mut out = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = placeholders(chunk.len());
            let sql = format!(
                "SELECT s.id, s.persona_key, s.anchor_text, s.segment_text
                 FROM baseline_segments s
                 LEFT JOIN segment_embeddings e
                   ON e.segment_id = s.id AND e.model = ?{m} AND e.text_source = ?{t}
                 WHERE e.segment_id IS NULL AND s.id IN ({placeholders})",
                m = chunk.len() + 1,
                t = chunk.len() + 2,
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::with_capacity(chunk.len() + 2);
            for id in chunk {
                bound.push(Box::new(*id));
            }
            bound.push(Box::new(model.to_string()));
            bound.push(Box::new(source.as_str().to_string()));
            let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())))?;
            while let Some(row) = rows.next()? {
                let anchor: String = row.get(2)?;
                let window: String = row.get(3)?;
                let text = match source {
                    TextSource::AnchorText => anchor,
                    TextSource::SegmentText => {
                        if window.trim().is_empty() {
                            anchor
                        } else {
                            window
                        }
                    }
                };
                if text.trim().is_empty() {
                    continue;
                }
                out.push((
                    row.get::<_, i64>(0)?,
                    PersonaKey::new(row.get::<_, String>(1)?),
                    text,
                ));
            }
        }
        Ok(out)
    }

    /// One embedding row, decoded. Used as the authoritative fallback for
    /// ids not yet present in the exported snapshot.
    pub fn embedding_for_segment(
        &self,
        segment_id: i64,
        model: &str,
        dim: usize,
        source: TextSource,
    ) -> Result<Option<StoredEmbedding>> {
        let conn = self.pool.get()?;
        let row: Option<(String, Vec<u8>)> = conn
            .query_row(
                "SELECT persona_key, vector_blob FROM segment_embeddings
                 WHERE segment_id = ?1 AND model = ?2 AND dim = ?3 AND text_source = ?4",
                params![segment_id, model, dim as i64, source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((persona, blob)) = row else {
            return Ok(None);
        };
        let vector: Vec<f32> = bincode::deserialize(&blob).context("decoding embedding blob")?;
        if vector.len() != dim {
            return Ok(None);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            return Ok(None);
        }
        Ok(Some(StoredEmbedding {
            segment_id,
            persona_key: PersonaKey::new(persona),
            vector,
            norm,
        }))
    }

    /// All segment ids owned by a persona. Used to partition the dense
    /// snapshot per query.
    pub fn persona_segment_ids(&self, persona: &PersonaKey) -> Result<Vec<i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM baseline_segments WHERE persona_key = ?1 ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map(params![persona.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn segment_count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 =
            conn.query_row("SELECT count(*) FROM baseline_segments", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        persona_key: PersonaKey::new(row.get::<_, String>(1)?),
        anchor_id: row.get(2)?,
        anchor_text: row.get(3)?,
        segment_text: row.get(4)?,
        start_msg_id: row.get(5)?,
        end_msg_id: row.get(6)?,
        anchor_timestamp_unix: row.get(7)?,
        line_count: row.get(8)?,
    })
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}
