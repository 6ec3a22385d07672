use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Which segment column embeddings are computed from. An embedding row is
/// only compatible with the active configuration when its recorded source
/// matches this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    AnchorText,
    SegmentText,
}

impl TextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextSource::AnchorText => "anchor_text",
            TextSource::SegmentText => "segment_text",
        }
    }

    /// Unknown values fall back to `segment_text`, matching the service
    /// default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "anchor_text" => TextSource::AnchorText,
            _ => TextSource::SegmentText,
        }
    }
}

impl std::fmt::Display for TextSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // LLM backend
    pub backend_url: String,
    pub planner_model: String,
    pub generator_model: String,
    pub fallback_models: Vec<String>,

    // Embeddings
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub embedding_text_source: TextSource,
    pub embedding_batch_size: usize,

    // Storage and snapshot files
    pub sqlite_path: PathBuf,
    pub segment_ids_path: PathBuf,
    pub segment_vectors_path: PathBuf,
    pub segment_index_meta_path: PathBuf,

    // Persona policy
    pub default_persona_key: String,
    pub strict_nickname: String,
    pub forbidden_nicknames: Vec<String>,

    // Retrieval
    pub retrieval_top_k: usize,
    pub semantic_enabled: bool,
    pub semantic_lexical_pool: usize,
    pub semantic_top_segments: usize,
    pub semantic_recall_k: usize,
    pub semantic_use_dense_index: bool,
    pub semantic_autofill_missing: bool,
    pub semantic_autofill_per_query: usize,
    pub segment_window_before: i64,
    pub segment_window_after: i64,
    pub rag_max_segment_chars: usize,
    pub rag_dynamic_window_enabled: bool,
    pub rag_dynamic_window_extra: i64,
    pub online_memory_days: i64,

    // Candidate pipeline
    pub generation_candidates: usize,
    pub rerank_top_k: usize,
    pub enable_offtopic_penalty: bool,
    pub enable_repair_pass: bool,
    pub enable_persona_guard: bool,
    pub offtopic_penalty_weight: f64,
    pub repair_threshold_low: f64,
    pub repair_threshold_mid: f64,
    pub repair_threshold_high: f64,
    pub persona_guard_penalty_weight: f64,
    pub persona_guard_repair_threshold: f64,
    pub persona_cache_ttl_sec: u64,
    pub context_frame_recent_messages: usize,
    pub context_frame_anchor_chars: usize,

    // Logging
    pub log_raw_model_output: bool,
    pub log_max_chars: usize,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => raw.trim().eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(key, default))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8081".to_string(),
            planner_model: "gemini-3-pro-preview".to_string(),
            generator_model: "gemini-3-pro-preview".to_string(),
            fallback_models: vec!["gemini-3-pro-preview".to_string()],
            embedding_model: "gemini-embedding-001".to_string(),
            embedding_dim: 3072,
            embedding_text_source: TextSource::SegmentText,
            embedding_batch_size: 24,
            sqlite_path: PathBuf::from("runtime/doppelganger.db"),
            segment_ids_path: PathBuf::from("runtime/rag_segment_ids.bin"),
            segment_vectors_path: PathBuf::from("runtime/rag_segment_vectors.bin"),
            segment_index_meta_path: PathBuf::from("runtime/rag_segment_index_meta.json"),
            default_persona_key: "dxa".to_string(),
            strict_nickname: "宝贝".to_string(),
            forbidden_nicknames: ["亲亲", "宝宝", "老婆", "老公", "宝子", "乖乖"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retrieval_top_k: 30,
            semantic_enabled: true,
            semantic_lexical_pool: 100,
            semantic_top_segments: 5,
            semantic_recall_k: 120,
            semantic_use_dense_index: true,
            semantic_autofill_missing: true,
            semantic_autofill_per_query: 36,
            segment_window_before: 6,
            segment_window_after: 8,
            rag_max_segment_chars: 1200,
            rag_dynamic_window_enabled: true,
            rag_dynamic_window_extra: 4,
            online_memory_days: 14,
            generation_candidates: 12,
            rerank_top_k: 6,
            enable_offtopic_penalty: true,
            enable_repair_pass: true,
            enable_persona_guard: true,
            offtopic_penalty_weight: 0.22,
            repair_threshold_low: 0.32,
            repair_threshold_mid: 0.55,
            repair_threshold_high: 0.76,
            persona_guard_penalty_weight: 0.12,
            persona_guard_repair_threshold: 0.6,
            persona_cache_ttl_sec: 600,
            context_frame_recent_messages: 8,
            context_frame_anchor_chars: 180,
            log_raw_model_output: true,
            log_max_chars: 6000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Config::default();
        let config = Self {
            backend_url: env_string("LLM_BACKEND_URL", &defaults.backend_url),
            planner_model: env_string("PLANNER_MODEL", &defaults.planner_model),
            generator_model: env_string("GENERATOR_MODEL", &defaults.generator_model),
            fallback_models: env_csv("FALLBACK_MODELS", "gemini-3-pro-preview"),
            embedding_model: env_string("EMBEDDING_MODEL", &defaults.embedding_model),
            embedding_dim: env_parse("EMBEDDING_DIM", defaults.embedding_dim),
            embedding_text_source: TextSource::parse(&env_string(
                "EMBEDDING_TEXT_SOURCE",
                defaults.embedding_text_source.as_str(),
            )),
            embedding_batch_size: env_parse("EMBEDDING_BATCH_SIZE", defaults.embedding_batch_size).max(1),
            sqlite_path: env_path("SQLITE_PATH", "runtime/doppelganger.db"),
            segment_ids_path: env_path("SEGMENT_IDS_PATH", "runtime/rag_segment_ids.bin"),
            segment_vectors_path: env_path("SEGMENT_VECTORS_PATH", "runtime/rag_segment_vectors.bin"),
            segment_index_meta_path: env_path(
                "SEGMENT_INDEX_META_PATH",
                "runtime/rag_segment_index_meta.json",
            ),
            default_persona_key: {
                let key = env_string("DEFAULT_PERSONA_KEY", &defaults.default_persona_key);
                let key = key.trim().to_string();
                if key.is_empty() { defaults.default_persona_key.clone() } else { key }
            },
            strict_nickname: env_string("STRICT_NICKNAME", &defaults.strict_nickname),
            forbidden_nicknames: env_csv("FORBIDDEN_NICKNAMES", "亲亲,宝宝,老婆,老公,宝子,乖乖"),
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", defaults.retrieval_top_k),
            semantic_enabled: env_bool("SEMANTIC_ENABLED", defaults.semantic_enabled),
            semantic_lexical_pool: env_parse("SEMANTIC_LEXICAL_POOL", defaults.semantic_lexical_pool),
            semantic_top_segments: env_parse("SEMANTIC_TOP_SEGMENTS", defaults.semantic_top_segments),
            semantic_recall_k: env_parse("SEMANTIC_RECALL_K", defaults.semantic_recall_k),
            semantic_use_dense_index: env_bool("SEMANTIC_USE_DENSE_INDEX", defaults.semantic_use_dense_index),
            semantic_autofill_missing: env_bool("SEMANTIC_AUTOFILL_MISSING", defaults.semantic_autofill_missing),
            semantic_autofill_per_query: env_parse(
                "SEMANTIC_AUTOFILL_PER_QUERY",
                defaults.semantic_autofill_per_query,
            ),
            segment_window_before: env_parse("SEGMENT_WINDOW_BEFORE", defaults.segment_window_before),
            segment_window_after: env_parse("SEGMENT_WINDOW_AFTER", defaults.segment_window_after),
            rag_max_segment_chars: env_parse("RAG_MAX_SEGMENT_CHARS", defaults.rag_max_segment_chars),
            rag_dynamic_window_enabled: env_bool(
                "RAG_DYNAMIC_WINDOW_ENABLED",
                defaults.rag_dynamic_window_enabled,
            ),
            rag_dynamic_window_extra: env_parse("RAG_DYNAMIC_WINDOW_EXTRA", defaults.rag_dynamic_window_extra),
            online_memory_days: env_parse("ONLINE_MEMORY_DAYS", defaults.online_memory_days),
            generation_candidates: env_parse("GENERATION_CANDIDATES", defaults.generation_candidates),
            rerank_top_k: env_parse("RERANK_TOP_K", defaults.rerank_top_k),
            enable_offtopic_penalty: env_bool("ENABLE_OFFTOPIC_PENALTY", defaults.enable_offtopic_penalty),
            enable_repair_pass: env_bool("ENABLE_REPAIR_PASS", defaults.enable_repair_pass),
            enable_persona_guard: env_bool("ENABLE_PERSONA_GUARD", defaults.enable_persona_guard),
            offtopic_penalty_weight: env_parse("OFFTOPIC_PENALTY_WEIGHT", defaults.offtopic_penalty_weight),
            repair_threshold_low: env_parse("REPAIR_THRESHOLD_LOW", defaults.repair_threshold_low),
            repair_threshold_mid: env_parse("REPAIR_THRESHOLD_MID", defaults.repair_threshold_mid),
            repair_threshold_high: env_parse("REPAIR_THRESHOLD_HIGH", defaults.repair_threshold_high),
            persona_guard_penalty_weight: env_parse(
                "PERSONA_GUARD_PENALTY_WEIGHT",
                defaults.persona_guard_penalty_weight,
            ),
            persona_guard_repair_threshold: env_parse(
                "PERSONA_GUARD_REPAIR_THRESHOLD",
                defaults.persona_guard_repair_threshold,
            ),
            persona_cache_ttl_sec: env_parse("PERSONA_CACHE_TTL_SEC", defaults.persona_cache_ttl_sec).max(5),
            context_frame_recent_messages: env_parse(
                "CONTEXT_FRAME_RECENT_MESSAGES",
                defaults.context_frame_recent_messages,
            ),
            context_frame_anchor_chars: env_parse(
                "CONTEXT_FRAME_ANCHOR_CHARS",
                defaults.context_frame_anchor_chars,
            ),
            log_raw_model_output: env_bool("LOG_RAW_MODEL_OUTPUT", defaults.log_raw_model_output),
            log_max_chars: env_parse("LOG_MAX_CHARS", defaults.log_max_chars),
        };

        Ok(config)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Backend URL: {}", self.backend_url);
        info!("- Planner Model: {}", self.planner_model);
        info!("- Generator Model: {}", self.generator_model);
        info!("- Embedding: {} dim={} source={}", self.embedding_model, self.embedding_dim, self.embedding_text_source);
        info!("- SQLite: {}", self.sqlite_path.display());
        info!("- Snapshot: {} / {}", self.segment_ids_path.display(), self.segment_vectors_path.display());
        info!("- Default Persona: {}", self.default_persona_key);
        info!("- Lexical Pool: {}, Recall K: {}", self.semantic_lexical_pool, self.semantic_recall_k);
        info!("- Candidates: {}, Rerank Top K: {}", self.generation_candidates, self.rerank_top_k);
    }

    /// Truncate a string for logging, keeping at most `log_max_chars` chars.
    pub fn clip(&self, text: &str) -> String {
        clip(text, self.log_max_chars)
    }
}

/// Truncate a string for logging, keeping at most `max_chars` chars.
pub fn clip(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...(truncated {} chars)", head, count - max_chars)
}
