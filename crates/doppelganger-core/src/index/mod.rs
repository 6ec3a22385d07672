//! Persona-partitioned dense vector index.
//!
//! Embedding rows live in SQLite; the searchable form is a compact on-disk
//! snapshot (id array + unit-normalized matrix) that is memory-mapped and
//! swapped in atomically. Queries embed through a small FIFO cache, then
//! run a partial-selection cosine top-k over the rows the persona owns.

mod query_cache;
mod snapshot;

pub use snapshot::{DenseSnapshot, SnapshotMeta, SnapshotMismatch, SnapshotPaths};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm::{EmbeddingKind, EmbeddingTask, LanguageModel};
use crate::store::{ChatStore, PersonaKey};

use query_cache::QueryEmbeddingCache;

const QUERY_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub segment_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub loaded: bool,
    pub snapshot_count: usize,
    pub dim: usize,
    pub model: String,
    pub text_source: String,
    pub built_at: Option<String>,
    pub total_segments: usize,
    pub embedded_segments: usize,
    pub pending_segments: usize,
}

pub struct SemanticIndex {
    config: Arc<Config>,
    store: ChatStore,
    model: Arc<dyn LanguageModel>,
    snapshot: ArcSwapOption<DenseSnapshot>,
    query_cache: QueryEmbeddingCache,
}

impl SemanticIndex {
    pub fn new(config: Arc<Config>, store: ChatStore, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            config,
            store,
            model,
            snapshot: ArcSwapOption::const_empty(),
            query_cache: QueryEmbeddingCache::new(QUERY_CACHE_CAPACITY),
        }
    }

    fn paths(&self) -> SnapshotPaths {
        SnapshotPaths {
            ids: self.config.segment_ids_path.clone(),
            vectors: self.config.segment_vectors_path.clone(),
            meta: self.config.segment_index_meta_path.clone(),
        }
    }

    // ===== Embedding backfill =====

    /// Embed segments that have no row for the active model/source yet,
    /// batch by batch. `limit` caps how many segments one call may embed;
    /// `None` drains the backlog. Returns how many were embedded.
    pub async fn ensure_embeddings(&self, limit: Option<usize>) -> Result<usize> {
        let batch_size = self.config.embedding_batch_size.max(1);
        let mut embedded = 0usize;

        loop {
            let remaining = match limit {
                Some(cap) if embedded >= cap => break,
                Some(cap) => (cap - embedded).min(batch_size),
                None => batch_size,
            };
            let pending = self.store.segments.segments_missing_embeddings(
                &self.config.embedding_model,
                self.config.embedding_text_source,
                remaining,
            )?;
            if pending.is_empty() {
                break;
            }

            let inputs: Vec<String> = pending.iter().map(|(_, _, text)| text.clone()).collect();
            let vectors = self
                .model
                .embed(EmbeddingTask {
                    model: self.config.embedding_model.clone(),
                    dim: self.config.embedding_dim,
                    kind: EmbeddingKind::Document,
                    inputs,
                })
                .await
                .context("embedding segment batch")?;

            for ((segment_id, persona, _), vector) in pending.iter().zip(vectors.iter()) {
                self.store.segments.upsert_embedding(
                    *segment_id,
                    persona,
                    &self.config.embedding_model,
                    self.config.embedding_text_source,
                    vector,
                )?;
            }
            embedded += pending.len();
            debug!(batch = pending.len(), embedded, "embedded segment batch");
        }

        if embedded > 0 {
            info!(embedded, "segment embedding backfill complete");
        }
        Ok(embedded)
    }

    /// Embed a specific set of segments if they lack compatible rows. Used
    /// by the retrieval autofill path; does not export a snapshot.
    pub async fn ensure_embeddings_for(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let pending = self.store.segments.missing_among(
            ids,
            &self.config.embedding_model,
            self.config.embedding_text_source,
        )?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for batch in pending.chunks(self.config.embedding_batch_size.max(1)) {
            let inputs: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
            let vectors = self
                .model
                .embed(EmbeddingTask {
                    model: self.config.embedding_model.clone(),
                    dim: self.config.embedding_dim,
                    kind: EmbeddingKind::Document,
                    inputs,
                })
                .await
                .context("embedding autofill batch")?;
            for ((segment_id, persona, _), vector) in batch.iter().zip(vectors.iter()) {
                self.store.segments.upsert_embedding(
                    *segment_id,
                    persona,
                    &self.config.embedding_model,
                    self.config.embedding_text_source,
                    vector,
                )?;
                written += 1;
            }
        }
        debug!(written, "autofill embeddings written");
        Ok(written)
    }

    // ===== Snapshot build =====

    /// Rebuild the on-disk snapshot from every embedding row matching the
    /// active model/dim/source. The in-memory handle is dropped so the next
    /// query maps the fresh files.
    pub fn export_snapshot(&self) -> Result<usize> {
        let rows = self.store.segments.embeddings_for_build(
            &self.config.embedding_model,
            self.config.embedding_dim,
            self.config.embedding_text_source,
        )?;

        let dim = self.config.embedding_dim;
        let mut ids = Vec::with_capacity(rows.len());
        let mut flat = Vec::with_capacity(rows.len() * dim);
        for row in &rows {
            ids.push(row.segment_id);
            for v in &row.vector {
                flat.push(v / row.norm);
            }
        }

        let meta = SnapshotMeta {
            count: ids.len(),
            dim,
            model: self.config.embedding_model.clone(),
            text_source: self.config.embedding_text_source.as_str().to_string(),
            built_at: chrono::Utc::now().to_rfc3339(),
        };
        DenseSnapshot::write_files(&self.paths(), &ids, &flat, &meta)?;

        // Drop the mapped handle so the next query maps the new files. The
        // persona partitions live inside the snapshot and die with it.
        self.snapshot.store(None);
        info!(count = ids.len(), dim, "dense snapshot exported");
        Ok(ids.len())
    }

    /// Backfill missing embeddings, then export a fresh snapshot.
    pub async fn build_all(&self) -> Result<IndexStatus> {
        self.ensure_embeddings(None).await?;
        self.export_snapshot()?;
        self.status()
    }

    // ===== Loading =====

    /// Return the current snapshot, (re)mapping the files when they changed
    /// on disk. Absent or stale-generation files yield `None`; only a dim
    /// mismatch is a hard error since it means the deployment is
    /// misconfigured rather than merely behind.
    fn ensure_loaded(&self) -> Result<Option<Arc<DenseSnapshot>>> {
        let paths = self.paths();
        if !paths.exist() {
            self.snapshot.store(None);
            return Ok(None);
        }

        let signature = paths.signature()?;
        if let Some(current) = self.snapshot.load_full() {
            if *current.signature() == signature {
                return Ok(Some(current));
            }
        }

        match DenseSnapshot::load(
            &paths,
            &self.config.embedding_model,
            self.config.embedding_dim,
            self.config.embedding_text_source,
        ) {
            Ok(snap) => {
                info!(count = snap.len(), "dense snapshot mapped");
                let snap = Arc::new(snap);
                self.snapshot.store(Some(Arc::clone(&snap)));
                Ok(Some(snap))
            }
            Err(err) => {
                if matches!(
                    err.downcast_ref::<SnapshotMismatch>(),
                    Some(SnapshotMismatch::Dim { .. })
                ) {
                    Err(err)
                } else {
                    warn!(error = %err, "snapshot rejected, dense channel disabled");
                    self.snapshot.store(None);
                    Ok(None)
                }
            }
        }
    }

    // ===== Queries =====

    /// Embed a query, going through the FIFO cache. The cache lock is never
    /// held across the backend call, so concurrent misses may both embed;
    /// last write wins and both get a usable vector.
    async fn embed_query(&self, query: &str) -> Result<Arc<Vec<f32>>> {
        let key = query.trim().to_string();
        if let Some(hit) = self.query_cache.get(&key) {
            return Ok(hit);
        }

        let mut vectors = self
            .model
            .embed(EmbeddingTask {
                model: self.config.embedding_model.clone(),
                dim: self.config.embedding_dim,
                kind: EmbeddingKind::Query,
                inputs: vec![key.clone()],
            })
            .await
            .context("embedding query")?;
        let mut vector = match vectors.pop() {
            Some(v) if vectors.is_empty() => v,
            _ => bail!("embedding backend returned wrong batch size for query"),
        };

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            bail!("degenerate query embedding");
        }
        for v in &mut vector {
            *v /= norm;
        }

        let vector = Arc::new(vector);
        self.query_cache.insert(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Persona-scoped cosine top-k over the snapshot. Empty when the dense
    /// channel is unavailable or the query is blank.
    pub async fn search(&self, persona: &PersonaKey, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let Some(snapshot) = self.ensure_loaded()? else {
            return Ok(Vec::new());
        };
        let rows = snapshot
            .rows_for_persona(persona, || self.store.segments.persona_segment_ids(persona))?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embed_query(query).await?;
        let hits = snapshot
            .search(&query_vec, Some(&rows), k)
            .into_iter()
            .map(|(segment_id, score)| SearchHit { segment_id, score })
            .collect();
        Ok(hits)
    }

    /// Cosine of the query against specific segment ids. Ids present in the
    /// snapshot are answered from the mapped matrix; the rest fall back to
    /// the authoritative embedding rows (written but not yet exported).
    pub async fn scores_for_ids(&self, query: &str, ids: &[i64]) -> Result<HashMap<i64, f32>> {
        if query.trim().is_empty() || ids.is_empty() {
            return Ok(HashMap::new());
        }
        let snapshot = self.ensure_loaded()?;
        let query_vec = self.embed_query(query).await?;

        let mut scores = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(snap) = snapshot.as_ref() {
                if let Some(row) = snap.row_of(id) {
                    scores.insert(id, dot(snap.row(row), &query_vec));
                    continue;
                }
            }
            let stored = self.store.segments.embedding_for_segment(
                id,
                &self.config.embedding_model,
                self.config.embedding_dim,
                self.config.embedding_text_source,
            )?;
            if let Some(rec) = stored {
                let raw = dot(&rec.vector, &query_vec);
                scores.insert(id, raw / rec.norm);
            }
        }
        Ok(scores)
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let total = self.store.segments.segment_count()?;
        let embedded = self.store.segments.embedding_count(
            &self.config.embedding_model,
            self.config.embedding_dim,
            self.config.embedding_text_source,
        )?;
        let snapshot = self.ensure_loaded()?;

        Ok(IndexStatus {
            loaded: snapshot.is_some(),
            snapshot_count: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            dim: self.config.embedding_dim,
            model: self.config.embedding_model.clone(),
            text_source: self.config.embedding_text_source.as_str().to_string(),
            built_at: snapshot.map(|s| s.meta().built_at.clone()),
            total_segments: total,
            embedded_segments: embedded,
            pending_segments: total.saturating_sub(embedded),
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
