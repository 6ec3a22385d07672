//! On-disk dense snapshot: a flat id array, a row-major f32 matrix that is
//! memory-mapped at load, and a JSON meta sidecar describing how the matrix
//! was built.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::config::TextSource;
use crate::store::PersonaKey;

/// Why an on-disk snapshot cannot serve the active embedding configuration.
/// A `Dim` mismatch means the deployment is misconfigured; the other
/// variants mark a stale generation that the next export replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotMismatch {
    Dim { found: usize, expected: usize },
    Model { found: String, expected: String },
    TextSource { found: String, expected: String },
}

impl std::fmt::Display for SnapshotMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dim { found, expected } => {
                write!(f, "snapshot dim {found} does not match configured dim {expected}")
            }
            Self::Model { found, expected } => {
                write!(f, "snapshot built with model {found} (configured {expected})")
            }
            Self::TextSource { found, expected } => {
                write!(f, "snapshot built from {found} (configured {expected})")
            }
        }
    }
}

impl std::error::Error for SnapshotMismatch {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub count: usize,
    pub dim: usize,
    pub model: String,
    pub text_source: String,
    pub built_at: String,
}

/// File identity of a snapshot on disk. Two signatures compare equal only
/// when neither the id array nor the matrix changed underneath us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSignature {
    entries: Vec<(SystemTime, u64)>,
}

/// Paths of the three snapshot files.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub ids: PathBuf,
    pub vectors: PathBuf,
    pub meta: PathBuf,
}

impl SnapshotPaths {
    pub fn exist(&self) -> bool {
        self.ids.is_file() && self.vectors.is_file() && self.meta.is_file()
    }

    pub fn signature(&self) -> Result<SnapshotSignature> {
        let mut entries = Vec::with_capacity(2);
        for path in [&self.ids, &self.vectors] {
            let stat = std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?;
            let mtime = stat.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((mtime, stat.len()));
        }
        Ok(SnapshotSignature { entries })
    }
}

#[derive(Debug)]
pub struct DenseSnapshot {
    meta: SnapshotMeta,
    ids: Vec<i64>,
    id_to_row: HashMap<i64, usize>,
    vectors: Mmap,
    signature: SnapshotSignature,
    /// Persona partitions over this matrix. Lives inside the snapshot so a
    /// partition can never outlive the generation it was computed against.
    persona_rows: Mutex<HashMap<PersonaKey, Arc<Vec<usize>>>>,
}

impl DenseSnapshot {
    /// Write the three snapshot files. Each file is written to a sibling
    /// temp path and renamed into place so a concurrent loader never sees a
    /// half-written file.
    pub fn write_files(
        paths: &SnapshotPaths,
        ids: &[i64],
        vectors: &[f32],
        meta: &SnapshotMeta,
    ) -> Result<()> {
        if meta.count != ids.len() || vectors.len() != ids.len() * meta.dim {
            bail!(
                "inconsistent snapshot shapes: {} ids, {} floats, dim {}",
                ids.len(),
                vectors.len(),
                meta.dim
            );
        }
        if let Some(parent) = paths.ids.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut id_bytes = Vec::with_capacity(ids.len() * 8);
        for id in ids {
            id_bytes.extend_from_slice(&id.to_le_bytes());
        }
        write_atomic(&paths.ids, &id_bytes)?;

        let mut vec_bytes = Vec::with_capacity(vectors.len() * 4);
        for v in vectors {
            vec_bytes.extend_from_slice(&v.to_le_bytes());
        }
        write_atomic(&paths.vectors, &vec_bytes)?;

        let meta_json = serde_json::to_vec_pretty(meta).context("encoding snapshot meta")?;
        write_atomic(&paths.meta, &meta_json)?;
        Ok(())
    }

    /// Memory-map an existing snapshot, verifying it against the active
    /// embedding configuration. A dim or model mismatch means the files
    /// belong to a different index generation and cannot be used.
    pub fn load(
        paths: &SnapshotPaths,
        expect_model: &str,
        expect_dim: usize,
        expect_source: TextSource,
    ) -> Result<Self> {
        let signature = paths.signature()?;

        let meta_bytes = std::fs::read(&paths.meta)
            .with_context(|| format!("reading {}", paths.meta.display()))?;
        let meta: SnapshotMeta =
            serde_json::from_slice(&meta_bytes).context("decoding snapshot meta")?;

        if meta.dim != expect_dim {
            return Err(SnapshotMismatch::Dim { found: meta.dim, expected: expect_dim }.into());
        }
        if meta.model != expect_model {
            return Err(SnapshotMismatch::Model {
                found: meta.model.clone(),
                expected: expect_model.to_string(),
            }
            .into());
        }
        if meta.text_source != expect_source.as_str() {
            return Err(SnapshotMismatch::TextSource {
                found: meta.text_source.clone(),
                expected: expect_source.as_str().to_string(),
            }
            .into());
        }

        let id_bytes = std::fs::read(&paths.ids)
            .with_context(|| format!("reading {}", paths.ids.display()))?;
        if id_bytes.len() % 8 != 0 {
            bail!("id file length {} is not a multiple of 8", id_bytes.len());
        }
        let ids: Vec<i64> = id_bytes
            .chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                i64::from_le_bytes(buf)
            })
            .collect();
        if ids.len() != meta.count {
            bail!("id file holds {} ids, meta says {}", ids.len(), meta.count);
        }

        let file = File::open(&paths.vectors)
            .with_context(|| format!("opening {}", paths.vectors.display()))?;
        // The mapping stays read-only and the writer replaces files by
        // rename, so the underlying bytes never change under the map.
        let vectors = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping {}", paths.vectors.display()))?;
        if vectors.len() != meta.count * meta.dim * 4 {
            bail!(
                "matrix file is {} bytes, expected {} ({} x {})",
                vectors.len(),
                meta.count * meta.dim * 4,
                meta.count,
                meta.dim
            );
        }
        // Page-aligned mappings always satisfy f32 alignment; verify anyway
        // so row() can slice without checks.
        if vectors.as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
            bail!("matrix mapping is not f32-aligned");
        }

        let id_to_row = ids.iter().enumerate().map(|(row, id)| (*id, row)).collect();
        Ok(Self {
            meta,
            ids,
            id_to_row,
            vectors,
            signature,
            persona_rows: Mutex::new(HashMap::new()),
        })
    }

    /// Sorted row indices owned by a persona, computed at most once per
    /// mapped snapshot. `fetch_ids` supplies the persona's segment ids on a
    /// cache miss.
    pub fn rows_for_persona<F>(&self, persona: &PersonaKey, fetch_ids: F) -> Result<Arc<Vec<usize>>>
    where
        F: FnOnce() -> Result<Vec<i64>>,
    {
        if let Ok(cache) = self.persona_rows.lock() {
            if let Some(rows) = cache.get(persona) {
                return Ok(Arc::clone(rows));
            }
        }

        let ids = fetch_ids()?;
        let mut rows: Vec<usize> = ids.iter().filter_map(|id| self.row_of(*id)).collect();
        rows.sort_unstable();
        let rows = Arc::new(rows);
        if let Ok(mut cache) = self.persona_rows.lock() {
            cache.entry(persona.clone()).or_insert_with(|| Arc::clone(&rows));
        }
        Ok(rows)
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    pub fn signature(&self) -> &SnapshotSignature {
        &self.signature
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn row_of(&self, segment_id: i64) -> Option<usize> {
        self.id_to_row.get(&segment_id).copied()
    }

    pub fn id_at(&self, row: usize) -> i64 {
        self.ids[row]
    }

    fn floats(&self) -> &[f32] {
        // Alignment checked at load.
        let (prefix, body, suffix) = unsafe { self.vectors.align_to::<f32>() };
        debug_assert!(prefix.is_empty() && suffix.is_empty());
        body
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let dim = self.meta.dim;
        &self.floats()[row * dim..(row + 1) * dim]
    }

    /// Cosine top-k over (optionally) a subset of rows. Rows are stored
    /// unit-normalized, so the dot product is the cosine. Ties break toward
    /// the lower segment id.
    pub fn search(&self, query: &[f32], allowed_rows: Option<&[usize]>, k: usize) -> Vec<(i64, f32)> {
        if k == 0 || self.is_empty() || query.len() != self.meta.dim {
            return Vec::new();
        }

        let mut scored: Vec<(f32, i64)> = match allowed_rows {
            Some(rows) => rows
                .iter()
                .filter(|&&r| r < self.len())
                .map(|&r| (dot(self.row(r), query), self.id_at(r)))
                .collect(),
            None => (0..self.len())
                .map(|r| (dot(self.row(r), query), self.id_at(r)))
                .collect(),
        };

        let by_score_desc = |a: &(f32, i64), b: &(f32, i64)| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        };
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_score_desc);
            scored.truncate(k);
        }
        scored.sort_by(by_score_desc);
        scored.into_iter().map(|(score, id)| (id, score)).collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &Path) -> SnapshotPaths {
        SnapshotPaths {
            ids: dir.join("ids.bin"),
            vectors: dir.join("vectors.bin"),
            meta: dir.join("meta.json"),
        }
    }

    fn meta(count: usize, dim: usize) -> SnapshotMeta {
        SnapshotMeta {
            count,
            dim,
            model: "m".into(),
            text_source: "anchor_text".into(),
            built_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn write_load_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let ids = [10i64, 20, 30];
        let vectors = [1.0f32, 0.0, 0.0, 1.0, 0.6, 0.8];
        DenseSnapshot::write_files(&p, &ids, &vectors, &meta(3, 2)).unwrap();

        let snap = DenseSnapshot::load(&p, "m", 2, TextSource::AnchorText).unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.row_of(20), Some(1));

        let hits = snap.search(&[1.0, 0.0], None, 2);
        assert_eq!(hits[0].0, 10);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, 30);
        assert!((hits[1].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn search_respects_allowed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let ids = [10i64, 20, 30];
        let vectors = [1.0f32, 0.0, 0.0, 1.0, 0.6, 0.8];
        DenseSnapshot::write_files(&p, &ids, &vectors, &meta(3, 2)).unwrap();
        let snap = DenseSnapshot::load(&p, "m", 2, TextSource::AnchorText).unwrap();

        let hits = snap.search(&[1.0, 0.0], Some(&[1, 2]), 5);
        let got: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(got, vec![30, 20]);
    }

    #[test]
    fn dim_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        DenseSnapshot::write_files(&p, &[1], &[1.0, 0.0], &meta(1, 2)).unwrap();
        let err = DenseSnapshot::load(&p, "m", 3, TextSource::AnchorText).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SnapshotMismatch>(),
            Some(SnapshotMismatch::Dim { found: 2, expected: 3 })
        ));
    }

    #[test]
    fn text_source_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        DenseSnapshot::write_files(&p, &[1], &[1.0, 0.0], &meta(1, 2)).unwrap();
        let err = DenseSnapshot::load(&p, "m", 2, TextSource::SegmentText).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SnapshotMismatch>(),
            Some(SnapshotMismatch::TextSource { .. })
        ));
    }

    #[test]
    fn persona_rows_computed_once_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let ids = [10i64, 20, 30];
        let vectors = [1.0f32, 0.0, 0.0, 1.0, 0.6, 0.8];
        DenseSnapshot::write_files(&p, &ids, &vectors, &meta(3, 2)).unwrap();
        let snap = DenseSnapshot::load(&p, "m", 2, TextSource::AnchorText).unwrap();

        let persona = PersonaKey::new("dxa");
        let calls = std::cell::Cell::new(0usize);
        let rows = snap
            .rows_for_persona(&persona, || {
                calls.set(calls.get() + 1);
                // Ids absent from the snapshot are dropped.
                Ok(vec![30, 10, 99])
            })
            .unwrap();
        assert_eq!(*rows, vec![0, 2]);

        let again = snap
            .rows_for_persona(&persona, || {
                calls.set(calls.get() + 1);
                Ok(Vec::new())
            })
            .unwrap();
        assert_eq!(*again, vec![0, 2]);
        assert_eq!(calls.get(), 1);

        // A freshly mapped snapshot starts with an empty partition cache.
        let remapped = DenseSnapshot::load(&p, "m", 2, TextSource::AnchorText).unwrap();
        let fresh = remapped.rows_for_persona(&persona, || Ok(vec![20])).unwrap();
        assert_eq!(*fresh, vec![1]);
    }

    #[test]
    fn signature_changes_when_files_change() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        DenseSnapshot::write_files(&p, &[1], &[1.0, 0.0], &meta(1, 2)).unwrap();
        let sig1 = p.signature().unwrap();
        DenseSnapshot::write_files(&p, &[1, 2], &[1.0, 0.0, 0.0, 1.0], &meta(2, 2)).unwrap();
        let sig2 = p.signature().unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn tie_breaks_toward_lower_id() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let ids = [7i64, 3];
        let vectors = [1.0f32, 0.0, 1.0, 0.0];
        DenseSnapshot::write_files(&p, &ids, &vectors, &meta(2, 2)).unwrap();
        let snap = DenseSnapshot::load(&p, "m", 2, TextSource::AnchorText).unwrap();
        let hits = snap.search(&[1.0, 0.0], None, 2);
        assert_eq!(hits[0].0, 3);
        assert_eq!(hits[1].0, 7);
    }
}
