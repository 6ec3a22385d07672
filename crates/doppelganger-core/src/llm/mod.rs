//! Language-model backend abstraction.
//!
//! Everything above this layer (index builds, planning, generation,
//! critic calls) talks to a [`LanguageModel`]; the HTTP implementation in
//! [`http`] speaks the OpenAI-compatible wire shape. Tests swap in scripted
//! implementations.

mod http;

pub use http::HttpLanguageModel;

use anyhow::Result;
use async_trait::async_trait;

/// One chat-completion call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A completed chat call, tagged with the model that actually served it
/// (may be a fallback, not the requested one).
#[derive(Debug, Clone)]
pub struct CallResult {
    pub text: String,
    pub model: String,
}

/// Whether a batch embeds search queries or stored documents. Some
/// backends train asymmetric representations and want to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Query,
    Document,
}

impl EmbeddingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "retrieval_query",
            Self::Document => "retrieval_document",
        }
    }
}

/// A batch embedding call.
#[derive(Debug, Clone)]
pub struct EmbeddingTask {
    pub model: String,
    pub dim: usize,
    pub kind: EmbeddingKind,
    pub inputs: Vec<String>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run a chat completion, falling back across the configured model
    /// chain on per-model failure.
    async fn generate(&self, request: GenerateRequest) -> Result<CallResult>;

    /// Embed a batch of texts. Implementations must return one vector per
    /// input, each exactly `task.dim` wide.
    async fn embed(&self, task: EmbeddingTask) -> Result<Vec<Vec<f32>>>;
}
