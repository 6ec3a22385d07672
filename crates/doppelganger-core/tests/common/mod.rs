//! Shared fixtures: a scripted language model and seed data builders.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use doppelganger_core::retrieval::text::keyword_tokens;
use doppelganger_core::store::ChatStore;
use doppelganger_core::{
    CallResult, Config, EmbeddingTask, GenerateRequest, LanguageModel, PersonaKey, TextSource,
};

/// Deterministic embedding: a shared bias dimension plus one hashed bucket
/// per keyword token, unit-normalized. Token overlap between two texts
/// shows up as cosine similarity.
pub fn scripted_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    v[0] = 1.5;
    for token in keyword_tokens(text) {
        let mut h = DefaultHasher::new();
        token.hash(&mut h);
        let idx = 1 + (h.finish() as usize) % (dim - 1);
        v[idx] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

/// A language model driven by a queue of canned chat responses. Embeddings
/// are always the deterministic projection above. When the queue runs dry,
/// chat calls fail, which exercises the pipeline's fallbacks.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: GenerateRequest) -> Result<CallResult> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(text) => Ok(CallResult {
                text,
                model: "scripted".to_string(),
            }),
            None => Err(anyhow!("script exhausted")),
        }
    }

    async fn embed(&self, task: EmbeddingTask) -> Result<Vec<Vec<f32>>> {
        Ok(task
            .inputs
            .iter()
            .map(|t| scripted_embedding(t, task.dim))
            .collect())
    }
}

/// Test config rooted in a temp dir, with a small embedding dim matching
/// the scripted model.
pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.embedding_dim = 32;
    config.embedding_model = "scripted-embed".to_string();
    config.embedding_text_source = TextSource::AnchorText;
    config.sqlite_path = dir.join("chat.db");
    config.segment_ids_path = dir.join("ids.bin");
    config.segment_vectors_path = dir.join("vectors.bin");
    config.segment_index_meta_path = dir.join("meta.json");
    config
}

/// Seed one segment: an anchor user message, two assistant replies, and
/// the segment row covering them. Returns the segment id.
pub fn seed_dialogue(
    store: &ChatStore,
    persona: &PersonaKey,
    anchor: &str,
    replies: &[&str],
    ts: i64,
) -> i64 {
    let anchor_id = store
        .segments
        .insert_baseline_message(persona, "甲", "user", anchor, "1", "2024-01-01 10:00", Some(ts), false)
        .unwrap();
    let mut last = anchor_id;
    for reply in replies {
        last = store
            .segments
            .insert_baseline_message(persona, "乙", "assistant", reply, "1", "2024-01-01 10:01", Some(ts + 60), false)
            .unwrap();
    }
    let window: String = std::iter::once(anchor.to_string())
        .chain(replies.iter().map(|r| r.to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    store
        .segments
        .insert_segment(persona, anchor_id, anchor, &window, anchor_id, last, Some(ts), 1 + replies.len() as i64)
        .unwrap()
}
