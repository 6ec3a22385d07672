//! Core retrieval and candidate-generation engine behind the Doppelganger
//! reply service: a persona-partitioned dense vector index over a
//! memory-mapped snapshot, lexical/semantic fusion retrieval, and the
//! generation → scoring → repair → fallback candidate pipeline.

pub mod config;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod store;
pub mod telemetry;

// Public API exports
pub use config::{Config, TextSource};
pub use index::{IndexStatus, SearchHit, SemanticIndex};
pub use llm::{
    CallResult, EmbeddingKind, EmbeddingTask, GenerateRequest, HttpLanguageModel, LanguageModel,
};
pub use pipeline::{CandidatePipeline, GenerationDebug, GenerationResult, PathTag, ScoredCandidate};
pub use retrieval::{FusionRetriever, RetrievedSegment};
pub use store::{ChatStore, PersonaKey, Segment, SegmentLine};
