//! Lexical/semantic fusion retrieval.
//!
//! One query fans out to the FTS channel (with n-gram and recency
//! fallbacks) and the dense index, the two candidate sets are merged and
//! fused with a recency blend, and the winners come back as line windows
//! cut to a character budget.

pub mod text;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::Config;
use crate::index::SemanticIndex;
use crate::store::{ChatStore, LexicalHit, OnlineMessage, PersonaKey, SegmentLine};

const SEMANTIC_WEIGHT: f64 = 0.72;
const LEXICAL_WEIGHT: f64 = 0.18;
const RECENCY_WEIGHT: f64 = 0.10;

/// Per-line overhead charged against the segment character budget
/// (separator punctuation around the speaker label).
const LINE_OVERHEAD_CHARS: usize = 3;

/// A fused retrieval result: one segment with its reconstructed line
/// window and the scores that ranked it.
#[derive(Debug, Clone)]
pub struct RetrievedSegment {
    pub segment_id: i64,
    pub anchor_text: String,
    pub anchor_timestamp_unix: Option<i64>,
    pub lines: Vec<SegmentLine>,
    pub semantic_score: f64,
    pub lexical_rank: Option<usize>,
    pub lexical_score: f64,
    pub recency_score: f64,
    pub total_score: f64,
}

struct Fused {
    segment_id: i64,
    anchor_text: String,
    anchor_timestamp_unix: Option<i64>,
    semantic: f64,
    lexical_rank: Option<usize>,
}

pub struct FusionRetriever {
    config: Arc<Config>,
    store: ChatStore,
    index: Arc<SemanticIndex>,
}

impl FusionRetriever {
    pub fn new(config: Arc<Config>, store: ChatStore, index: Arc<SemanticIndex>) -> Self {
        Self { config, store, index }
    }

    /// The fusion pipeline: lexical candidates, semantic candidates, merge,
    /// best-effort autofill, score fusion, tie-broken sort, window build.
    pub async fn retrieve_segments(
        &self,
        query: &str,
        top_k: usize,
        persona: &PersonaKey,
    ) -> Result<Vec<RetrievedSegment>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let lexical = self.lexical_candidates(query, persona)?;

        let semantic: Vec<(i64, f64)> = if self.config.semantic_enabled && self.config.semantic_use_dense_index {
            let k = top_k.max(self.config.semantic_recall_k);
            match self.index.search(persona, query, k).await {
                Ok(hits) => hits
                    .into_iter()
                    .map(|h| (h.segment_id, h.score as f64))
                    .collect(),
                Err(err) => {
                    warn!(error = %err, "semantic search failed, lexical only");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if self.config.semantic_autofill_missing {
            self.spawn_autofill(&lexical);
        }

        let mut merged: HashMap<i64, Fused> = HashMap::new();
        for (rank, hit) in lexical.iter().enumerate() {
            merged.insert(
                hit.segment_id,
                Fused {
                    segment_id: hit.segment_id,
                    anchor_text: hit.anchor_text.clone(),
                    anchor_timestamp_unix: hit.anchor_timestamp_unix,
                    semantic: 0.0,
                    lexical_rank: Some(rank),
                },
            );
        }
        let mut semantic_only: Vec<i64> = Vec::new();
        for (id, score) in &semantic {
            match merged.get_mut(id) {
                Some(entry) => entry.semantic = *score,
                None => semantic_only.push(*id),
            }
        }
        if !semantic_only.is_empty() {
            let rows = self.store.segments.segments_by_ids(&semantic_only)?;
            let scores: HashMap<i64, f64> = semantic.iter().copied().collect();
            for seg in rows {
                if seg.persona_key != *persona {
                    continue;
                }
                merged.insert(
                    seg.id,
                    Fused {
                        segment_id: seg.id,
                        anchor_text: seg.anchor_text,
                        anchor_timestamp_unix: seg.anchor_timestamp_unix,
                        semantic: scores.get(&seg.id).copied().unwrap_or(0.0),
                        lexical_rank: None,
                    },
                );
            }
        }

        // Lexical-only ids may have embedding rows that just missed the
        // last export; resolve those against the authoritative records.
        let unscored: Vec<i64> = merged
            .values()
            .filter(|f| f.semantic == 0.0)
            .map(|f| f.segment_id)
            .collect();
        if !unscored.is_empty() {
            match self.index.scores_for_ids(query, &unscored).await {
                Ok(scores) => {
                    for (id, score) in scores {
                        if let Some(entry) = merged.get_mut(&id) {
                            entry.semantic = score as f64;
                        }
                    }
                }
                Err(err) => warn!(error = %err, "semantic backfill failed"),
            }
        }

        let candidates: Vec<Fused> = merged.into_values().collect();
        let (ts_min, ts_max) = timestamp_span(&candidates);

        let mut scored: Vec<RetrievedSegment> = candidates
            .into_iter()
            .map(|f| {
                let lexical_score = f.lexical_rank.map(text::lexical_score).unwrap_or(0.0);
                let recency_score = recency_position(f.anchor_timestamp_unix, ts_min, ts_max);
                let total = SEMANTIC_WEIGHT * f.semantic
                    + LEXICAL_WEIGHT * lexical_score
                    + RECENCY_WEIGHT * recency_score;
                RetrievedSegment {
                    segment_id: f.segment_id,
                    anchor_text: f.anchor_text,
                    anchor_timestamp_unix: f.anchor_timestamp_unix,
                    lines: Vec::new(),
                    semantic_score: f.semantic,
                    lexical_rank: f.lexical_rank,
                    lexical_score,
                    recency_score,
                    total_score: total,
                }
            })
            .collect();

        sort_fused(&mut scored);
        scored.truncate(top_k);

        let extra = text::dynamic_extra(
            query,
            self.config.rag_dynamic_window_enabled,
            self.config.rag_dynamic_window_extra,
        );
        let mut out = Vec::with_capacity(scored.len());
        for mut seg in scored {
            seg.lines = self.window_lines(persona, seg.segment_id, extra)?;
            if seg.lines.is_empty() {
                continue;
            }
            out.push(seg);
        }

        debug!(
            query = %crate::config::clip(query, 80),
            persona = %persona,
            segments = out.len(),
            "fusion retrieval done"
        );
        Ok(out)
    }

    fn lexical_candidates(&self, query: &str, persona: &PersonaKey) -> Result<Vec<LexicalHit>> {
        let pool = self.config.semantic_lexical_pool;
        let tokens = text::keyword_tokens(query);

        let mut hits = self
            .store
            .segments
            .fts_hits(&text::fts_match_expr(&tokens), persona, pool)?;
        if hits.is_empty() {
            hits = self
                .store
                .segments
                .like_hits(&text::like_patterns(query), persona, pool)?;
        }
        if hits.is_empty() {
            hits = self.store.segments.recent_hits(persona, pool)?;
        }

        // Dedup by segment id keeping the best (lowest) raw rank.
        let mut best: HashMap<i64, LexicalHit> = HashMap::new();
        for hit in hits {
            match best.get(&hit.segment_id) {
                Some(prev) if prev.rank <= hit.rank => {}
                _ => {
                    best.insert(hit.segment_id, hit);
                }
            }
        }
        let mut deduped: Vec<LexicalHit> = best.into_values().collect();
        deduped.sort_by(|a, b| {
            a.rank
                .partial_cmp(&b.rank)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.segment_id.cmp(&a.segment_id))
        });
        Ok(deduped)
    }

    /// Kick off embedding backfill for lexical hits the index cannot score
    /// yet. Never blocks or fails the current request.
    fn spawn_autofill(&self, lexical: &[LexicalHit]) {
        let ids: Vec<i64> = lexical
            .iter()
            .take(self.config.semantic_autofill_per_query)
            .map(|h| h.segment_id)
            .collect();
        if ids.is_empty() {
            return;
        }
        let index = Arc::clone(&self.index);
        tokio::spawn(async move {
            if let Err(err) = index.ensure_embeddings_for(&ids).await {
                warn!(error = %err, "retrieval autofill failed");
            }
        });
    }

    /// Rebuild a segment's line window around its anchor, expanded by the
    /// dynamic bonus, truncated to the segment character budget.
    fn window_lines(
        &self,
        persona: &PersonaKey,
        segment_id: i64,
        extra: i64,
    ) -> Result<Vec<SegmentLine>> {
        let Some(seg) = self.store.segments.segment_by_id(segment_id)? else {
            return Ok(Vec::new());
        };
        let before = self.config.segment_window_before + extra;
        let after = self.config.segment_window_after + extra;
        let start = seg.anchor_id - before;
        let end = seg.anchor_id + after;
        let lines = self.store.segments.lines_in_range(persona, start, end)?;

        let mut budget = self.config.rag_max_segment_chars;
        let mut kept = Vec::with_capacity(lines.len());
        for line in lines {
            let cost = text::char_len(&line.content) + text::char_len(&line.role) + LINE_OVERHEAD_CHARS;
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(line);
        }
        Ok(kept)
    }

    // ===== Supplemental context feeds =====

    /// Chronological tail of the live conversation.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<OnlineMessage>> {
        self.store.conversations.recent_messages(conversation_id, limit)
    }

    /// Older lines of the same conversation related to the query, excluding
    /// the recent window above `cutoff_id` and anything older than the
    /// configured memory horizon.
    pub fn online_memory(
        &self,
        conversation_id: &str,
        query: &str,
        cutoff_id: i64,
        limit: usize,
    ) -> Result<Vec<OnlineMessage>> {
        let since = (chrono::Utc::now()
            - chrono::Duration::days(self.config.online_memory_days.max(0)))
        .to_rfc3339();
        let tokens = text::keyword_tokens(query);
        self.store.conversations.related_history(
            conversation_id,
            &text::fts_match_expr(&tokens),
            cutoff_id,
            &since,
            limit,
        )
    }

    /// Assistant-voiced lines sampled from retrieved segments, used to top
    /// up style references when windows run short. Order-preserving dedup.
    pub fn style_references(segments: &[RetrievedSegment], limit: usize) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut refs = Vec::new();
        for seg in segments {
            for line in &seg.lines {
                if line.role != "assistant" {
                    continue;
                }
                let content = line.content.trim();
                if content.is_empty() || text::char_len(content) > 50 {
                    continue;
                }
                if seen.insert(content.to_string()) {
                    refs.push(content.to_string());
                    if refs.len() >= limit {
                        return refs;
                    }
                }
            }
        }
        refs
    }
}

fn timestamp_span(candidates: &[Fused]) -> (Option<i64>, Option<i64>) {
    let stamps: Vec<i64> = candidates
        .iter()
        .filter_map(|f| f.anchor_timestamp_unix)
        .collect();
    (stamps.iter().min().copied(), stamps.iter().max().copied())
}

/// Linear position of a timestamp within the batch span; 0 when the span
/// is degenerate or the timestamp is missing.
fn recency_position(ts: Option<i64>, min: Option<i64>, max: Option<i64>) -> f64 {
    match (ts, min, max) {
        (Some(t), Some(lo), Some(hi)) if hi > lo => (t - lo) as f64 / (hi - lo) as f64,
        _ => 0.0,
    }
}

/// Descending by total, then semantic, then better lexical rank, then
/// newer (higher) segment id.
fn sort_fused(segments: &mut [RetrievedSegment]) {
    segments.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.semantic_score
                    .partial_cmp(&a.semantic_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then_with(|| {
                let ar = a.lexical_rank.unwrap_or(usize::MAX);
                let br = b.lexical_rank.unwrap_or(usize::MAX);
                ar.cmp(&br)
            })
            .then(b.segment_id.cmp(&a.segment_id))
    });
}
