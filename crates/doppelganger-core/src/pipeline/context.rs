//! Bounded context block fed into the planning and generation prompts.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::retrieval::{FusionRetriever, RetrievedSegment};
use crate::store::{OnlineMessage, PersonaKey};

use super::frame::ContextFrame;

const MAX_RECENT: usize = 12;
const MAX_ONLINE_MEMORY: usize = 10;
const MAX_STYLE_REFS: usize = 18;

#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub frame: ContextFrame,
    pub recent: Vec<OnlineMessage>,
    pub online_memory: Vec<String>,
    pub style_refs: Vec<String>,
    pub segments: Vec<RetrievedSegment>,
    pub persona_brief: String,
    pub rag_chars: usize,
}

pub struct ContextAssembler {
    config: Arc<Config>,
}

impl ContextAssembler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn assemble(
        &self,
        retriever: &FusionRetriever,
        conversation_id: &str,
        user_text: &str,
        persona: &PersonaKey,
        persona_brief: String,
    ) -> Result<ContextBlock> {
        let recent_limit = self.config.context_frame_recent_messages.min(MAX_RECENT);
        let recent = retriever.recent_messages(conversation_id, recent_limit)?;
        let frame = ContextFrame::build(user_text, &recent, self.config.context_frame_anchor_chars);

        let segments = retriever
            .retrieve_segments(user_text, self.config.semantic_top_segments, persona)
            .await?;

        let cutoff_id = recent.first().map(|m| m.id).unwrap_or(i64::MAX);
        let online_memory: Vec<String> = retriever
            .online_memory(conversation_id, user_text, cutoff_id, MAX_ONLINE_MEMORY)?
            .into_iter()
            .map(|m| m.content)
            .collect();

        // Reply-voice lines straight from the windows first, then top up
        // with the sampler if they run short.
        let mut style_refs: Vec<String> = Vec::new();
        for seg in &segments {
            for line in &seg.lines {
                if line.role == "assistant" && !style_refs.contains(&line.content) {
                    style_refs.push(line.content.clone());
                }
                if style_refs.len() >= MAX_STYLE_REFS {
                    break;
                }
            }
        }
        if style_refs.len() < MAX_STYLE_REFS {
            for extra in FusionRetriever::style_references(&segments, MAX_STYLE_REFS) {
                if !style_refs.contains(&extra) {
                    style_refs.push(extra);
                }
                if style_refs.len() >= MAX_STYLE_REFS {
                    break;
                }
            }
        }

        let rag_chars = segments
            .iter()
            .flat_map(|s| s.lines.iter())
            .map(|l| l.content.chars().count())
            .sum();

        Ok(ContextBlock {
            frame,
            recent,
            online_memory,
            style_refs,
            segments,
            persona_brief,
            rag_chars,
        })
    }
}
