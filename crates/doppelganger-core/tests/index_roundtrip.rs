//! Dense index lifecycle: backfill embeddings, export a snapshot, map it
//! and search, including the rejection paths for incompatible snapshots.

mod common;

use std::sync::Arc;

use doppelganger_core::index::SnapshotMismatch;
use doppelganger_core::store::ChatStore;
use doppelganger_core::{Config, LanguageModel, PersonaKey, SemanticIndex, TextSource};

use common::{scripted_embedding, seed_dialogue, test_config, ScriptedModel};

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn index_with(config: Config, store: ChatStore) -> SemanticIndex {
    let model: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(&[]));
    SemanticIndex::new(Arc::new(config), store, model)
}

fn seeded(dir: &std::path::Path) -> (Config, ChatStore, PersonaKey, Vec<i64>) {
    let config = test_config(dir);
    let store = ChatStore::open(&config.sqlite_path).unwrap();
    let persona = PersonaKey::from("dxa");
    let ids = vec![
        seed_dialogue(&store, &persona, "今天要不要看电影", &["可以呀", "看几点的"], 1_700_000_000),
        seed_dialogue(&store, &persona, "晚上吃什么", &["随便", "你定"], 1_700_000_600),
        seed_dialogue(&store, &persona, "周末去哪玩", &["爬山怎么样"], 1_700_001_200),
    ];
    (config, store, persona, ids)
}

#[tokio::test]
async fn ensure_export_search_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, ids) = seeded(dir.path());
    let dim = config.embedding_dim;
    let index = index_with(config, store);

    let embedded = index.ensure_embeddings(None).await.unwrap();
    assert_eq!(embedded, 3);
    let exported = index.export_snapshot().unwrap();
    assert_eq!(exported, 3);

    let query = "今天要不要看电影";
    let hits = index.search(&persona, query, 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].segment_id, ids[0]);

    // Search scores are dot products of unit vectors, so each must equal
    // the direct cosine of the scripted embeddings.
    let query_vec = scripted_embedding(query, dim);
    for hit in &hits {
        let anchor = match hit.segment_id {
            id if id == ids[0] => "今天要不要看电影",
            id if id == ids[1] => "晚上吃什么",
            _ => "周末去哪玩",
        };
        let expected = dot(&query_vec, &scripted_embedding(anchor, dim));
        assert!((hit.score - expected).abs() < 1e-5, "hit {hit:?} expected {expected}");
    }

    // Scores strictly ordered, best first.
    assert!(hits[0].score >= hits[1].score);
}

#[tokio::test]
async fn search_is_persona_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, ids) = seeded(dir.path());
    let other = PersonaKey::from("other");
    // The other persona owns the closest match for the query.
    let foreign = seed_dialogue(&store, &other, "今天要不要看电影", &["不了"], 1_700_002_000);

    let index = index_with(config, store);
    index.build_all().await.unwrap();

    let hits = index.search(&persona, "今天要不要看电影", 10).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| ids.contains(&h.segment_id)));
    assert!(hits.iter().all(|h| h.segment_id != foreign));

    let other_hits = index.search(&other, "今天要不要看电影", 10).await.unwrap();
    assert_eq!(other_hits.len(), 1);
    assert_eq!(other_hits[0].segment_id, foreign);
}

#[tokio::test]
async fn export_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, _) = seeded(dir.path());
    let index = index_with(config, store);

    index.ensure_embeddings(None).await.unwrap();
    let first = index.export_snapshot().unwrap();
    let hits_a = index.search(&persona, "晚上吃什么", 3).await.unwrap();

    // No new embeddings, so a re-export writes the same generation.
    assert_eq!(index.ensure_embeddings(None).await.unwrap(), 0);
    let second = index.export_snapshot().unwrap();
    assert_eq!(first, second);

    let hits_b = index.search(&persona, "晚上吃什么", 3).await.unwrap();
    assert_eq!(hits_a.len(), hits_b.len());
    for (a, b) in hits_a.iter().zip(&hits_b) {
        assert_eq!(a.segment_id, b.segment_id);
        assert!((a.score - b.score).abs() < 1e-6);
    }
}

#[tokio::test]
async fn reload_picks_up_new_generation() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, _) = seeded(dir.path());
    let index = index_with(config, store.clone());
    index.build_all().await.unwrap();
    assert_eq!(index.status().unwrap().snapshot_count, 3);

    let late = seed_dialogue(&store, &persona, "电影院新开了一家", &["哪家"], 1_700_003_000);
    index.ensure_embeddings(None).await.unwrap();
    index.export_snapshot().unwrap();

    let hits = index.search(&persona, "电影院新开了一家", 1).await.unwrap();
    assert_eq!(hits[0].segment_id, late);
    assert_eq!(index.status().unwrap().snapshot_count, 4);
}

#[tokio::test]
async fn status_reports_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, _, _) = seeded(dir.path());
    let index = index_with(config, store);

    let before = index.status().unwrap();
    assert!(!before.loaded);
    assert_eq!(before.total_segments, 3);
    assert_eq!(before.embedded_segments, 0);
    assert_eq!(before.pending_segments, 3);

    index.build_all().await.unwrap();
    let after = index.status().unwrap();
    assert!(after.loaded);
    assert_eq!(after.snapshot_count, 3);
    assert_eq!(after.pending_segments, 0);
    assert!(after.built_at.is_some());
}

#[tokio::test]
async fn text_source_mismatch_disables_dense_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, _) = seeded(dir.path());
    let sqlite_path = config.sqlite_path.clone();
    let index = index_with(config.clone(), store);
    index.build_all().await.unwrap();

    // Same files, different configured source: a stale generation, not a
    // deployment error, so search degrades to empty.
    let mut other_config = config;
    other_config.embedding_text_source = TextSource::SegmentText;
    let store = ChatStore::open(&sqlite_path).unwrap();
    let stale = index_with(other_config, store);
    let hits = stale.search(&persona, "今天要不要看电影", 5).await.unwrap();
    assert!(hits.is_empty());
    assert!(!stale.status().unwrap().loaded);
}

#[tokio::test]
async fn dim_mismatch_is_a_hard_error() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, _) = seeded(dir.path());
    let sqlite_path = config.sqlite_path.clone();
    let index = index_with(config.clone(), store);
    index.build_all().await.unwrap();

    let mut wrong = config;
    wrong.embedding_dim = 16;
    let store = ChatStore::open(&sqlite_path).unwrap();
    let broken = index_with(wrong, store);
    let err = broken
        .search(&persona, "今天要不要看电影", 5)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<SnapshotMismatch>(),
            Some(SnapshotMismatch::Dim { found: 32, expected: 16 })
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn blank_segments_are_skipped_by_backfill() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = ChatStore::open(&config.sqlite_path).unwrap();
    let persona = PersonaKey::from("dxa");
    seed_dialogue(&store, &persona, "   ", &["嗯"], 1_700_000_000);
    let real = seed_dialogue(&store, &persona, "看电影", &["可以呀"], 1_700_000_600);

    let index = index_with(config, store);
    assert_eq!(index.ensure_embeddings(None).await.unwrap(), 1);
    // Drained: a second pass must not see the blank segment again.
    assert_eq!(index.ensure_embeddings(None).await.unwrap(), 0);

    index.export_snapshot().unwrap();
    let hits = index.search(&persona, "看电影", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].segment_id, real);
}

#[tokio::test]
async fn persona_partition_tracks_the_mapped_generation() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, ids) = seeded(dir.path());
    let index = index_with(config, store.clone());
    index.build_all().await.unwrap();
    // Warm the partition against the first generation.
    assert_eq!(index.search(&persona, "今天要不要看电影", 10).await.unwrap().len(), 3);

    let other = PersonaKey::from("other");
    let foreign = seed_dialogue(&store, &other, "今天要不要看电影", &["不了"], 1_700_002_000);
    index.build_all().await.unwrap();

    // Partitions are rebuilt for the new matrix; neither persona bleeds.
    let hits = index.search(&persona, "今天要不要看电影", 10).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| ids.contains(&h.segment_id)));
    let other_hits = index.search(&other, "今天要不要看电影", 10).await.unwrap();
    assert_eq!(other_hits.len(), 1);
    assert_eq!(other_hits[0].segment_id, foreign);
}

#[tokio::test]
async fn missing_snapshot_files_mean_empty_search() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store, persona, _) = seeded(dir.path());
    let index = index_with(config, store);
    // Embeddings exist but no export yet.
    index.ensure_embeddings(None).await.unwrap();
    let hits = index.search(&persona, "今天要不要看电影", 5).await.unwrap();
    assert!(hits.is_empty());
}
