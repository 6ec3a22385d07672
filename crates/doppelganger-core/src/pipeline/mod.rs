//! Candidate pipeline: PLAN → GENERATE → FILTER → SCORE → RERANK →
//! REPAIR? → FALLBACK? → DONE.
//!
//! Every stage has exactly one named fallback; the entry point always
//! produces a reply and never surfaces an external-service error.

mod context;
mod frame;
mod parse;
mod persona;
mod plan;
mod prompts;
mod scoring;

pub use context::{ContextAssembler, ContextBlock};
pub use frame::{BubbleBand, ContextFrame};
pub use persona::{PersonaCache, PersonaProfile, ScoreWeights};
pub use plan::ReplyPlan;
pub use scoring::{ScoreInput, ScoreSet};

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::index::SemanticIndex;
use crate::llm::{EmbeddingKind, EmbeddingTask, GenerateRequest, LanguageModel};
use crate::retrieval::FusionRetriever;
use crate::store::{ChatStore, PersonaKey};

const CRITIC_MARGIN: f64 = 0.04;
const REPAIR_FLOW_FLOOR: f64 = 0.35;
const REPAIR_OFFTOPIC_IMPROVEMENT: f64 = 0.08;
const REPAIR_TOTAL_IMPROVEMENT: f64 = 0.03;
const FALLBACK_RELEVANCE_LOW: f64 = 0.52;
const FALLBACK_FLOW_LOW: f64 = 0.35;
const FALLBACK_FLOW_BROKEN: f64 = 0.15;
const FALLBACK_RELEVANCE_MID: f64 = 0.45;

const TYPING_BASE_MS: u64 = 500;
const TYPING_CHAR_CAP: usize = 26;
const TYPING_MS_PER_CHAR: (u64, u64) = (45, 88);

/// Which branch produced the final reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTag {
    Direct,
    Repair,
    Fallback,
}

impl PathTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Repair => "repair",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub bubbles: Vec<String>,
    pub scores: ScoreSet,
}

#[derive(Debug, Clone)]
pub struct GenerationDebug {
    pub path: PathTag,
    pub repair_reason: Option<String>,
    pub fallback_reason: Option<String>,
    pub rejected_candidates: usize,
    /// Cumulative per-bubble delivery offsets, strictly increasing.
    pub delays_ms: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub bubbles: Vec<String>,
    pub chosen_index: usize,
    pub pool: Vec<ScoredCandidate>,
    pub planner_model: Option<String>,
    pub generator_model: Option<String>,
    pub debug: GenerationDebug,
}

pub struct CandidatePipeline {
    config: Arc<Config>,
    store: ChatStore,
    retriever: FusionRetriever,
    assembler: ContextAssembler,
    model: Arc<dyn LanguageModel>,
    personas: PersonaCache,
}

impl CandidatePipeline {
    pub fn new(
        config: Arc<Config>,
        store: ChatStore,
        index: Arc<SemanticIndex>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let retriever = FusionRetriever::new(Arc::clone(&config), store.clone(), index);
        let assembler = ContextAssembler::new(Arc::clone(&config));
        let personas = PersonaCache::new(config.persona_cache_ttl_sec);
        Self {
            config,
            store,
            retriever,
            assembler,
            model,
            personas,
        }
    }

    pub fn retriever(&self) -> &FusionRetriever {
        &self.retriever
    }

    /// Run the whole pipeline for one incoming message. Always yields a
    /// reply; stage failures take their named fallback instead of erroring.
    pub async fn generate(
        &self,
        conversation_id: &str,
        user_text: &str,
        persona_key: &PersonaKey,
    ) -> Result<GenerationResult> {
        if let Err(err) = self
            .store
            .conversations
            .append_message(conversation_id, "user", user_text)
        {
            warn!(error = %err, "failed to log incoming message");
        }

        let persona = self
            .personas
            .profile(&self.store, persona_key)
            .unwrap_or_else(|err| {
                warn!(error = %err, "persona profile load failed, using defaults");
                Arc::new(PersonaProfile::default())
            });
        let weights = self
            .personas
            .weights(&self.store, persona_key)
            .unwrap_or_else(|err| {
                warn!(error = %err, "preference weights load failed, using defaults");
                Arc::new(ScoreWeights::default())
            });

        let block = match self
            .assembler
            .assemble(
                &self.retriever,
                conversation_id,
                user_text,
                persona_key,
                persona.brief(&self.config),
            )
            .await
        {
            Ok(block) => block,
            Err(err) => {
                warn!(error = %err, "context assembly failed, using bare frame");
                ContextBlock {
                    frame: ContextFrame::build(user_text, &[], self.config.context_frame_anchor_chars),
                    recent: Vec::new(),
                    online_memory: Vec::new(),
                    style_refs: Vec::new(),
                    segments: Vec::new(),
                    persona_brief: persona.brief(&self.config),
                    rag_chars: 0,
                }
            }
        };

        // ===== PLAN =====
        let (plan, planner_model) = self.plan_stage(&block).await;

        // ===== GENERATE =====
        let (raw_candidates, generator_model) = self.generate_stage(&block, &plan).await;

        // ===== FILTER =====
        let forbidden = persona.forbidden(&self.config);
        let mut survivors: Vec<Vec<String>> = Vec::new();
        let mut rejected = 0usize;
        for bubbles in raw_candidates {
            let cleaned: Vec<String> = bubbles
                .iter()
                .map(|b| parse::sanitize_bubble(b, &forbidden))
                .filter(|b| !b.is_empty())
                .collect();
            match parse::reject_candidate(&cleaned, &forbidden) {
                None => survivors.push(cleaned),
                Some(reason) => {
                    debug!(reason = ?reason, "candidate rejected");
                    rejected += 1;
                }
            }
        }

        // ===== SCORE =====
        let reference_lines: Vec<String> = block
            .segments
            .first()
            .map(|s| {
                s.lines
                    .iter()
                    .filter(|l| l.role == "assistant")
                    .map(|l| l.content.clone())
                    .collect()
            })
            .unwrap_or_default();
        let copy_reference_lines: Vec<String> = block
            .segments
            .iter()
            .take(2)
            .flat_map(|s| s.lines.iter().map(|l| l.content.clone()))
            .collect();
        let input = ScoreInput {
            config: &self.config,
            frame: &block.frame,
            persona: &persona,
            weights: &weights,
            reference_lines: &reference_lines,
            copy_reference_lines: &copy_reference_lines,
            online_memory: &block.online_memory,
        };

        let relevances = self.relevance_stage(user_text, &survivors).await;
        let mut scored: Vec<ScoredCandidate> = survivors
            .into_iter()
            .zip(relevances)
            .map(|(bubbles, relevance)| {
                let scores = scoring::score_candidate(&bubbles, relevance, &input);
                ScoredCandidate { bubbles, scores }
            })
            .filter(|c| c.scores.relevance >= scoring::RELEVANCE_FLOOR)
            .collect();

        // ===== RERANK =====
        let mut path = PathTag::Direct;
        let mut fallback_reason = None;
        let mut repair_reason = None;

        if scored.is_empty() {
            let bubbles = self.fallback_bubbles(&persona, user_text);
            let scores = scoring::score_candidate(&bubbles, 0.0, &input);
            scored.push(ScoredCandidate { bubbles, scores });
            path = PathTag::Fallback;
            fallback_reason = Some("empty_pool".to_string());
        }
        scored.sort_by(|a, b| {
            b.scores
                .total
                .partial_cmp(&a.scores.total)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let pool: Vec<ScoredCandidate> = scored
            .into_iter()
            .take(self.config.rerank_top_k.max(1))
            .collect();

        let mut chosen_index = 0usize;
        if pool.len() > 1 && path == PathTag::Direct {
            chosen_index = self.critic_stage(user_text, &pool).await;
        }

        let mut selection = pool[chosen_index].clone();

        // ===== REPAIR =====
        if path == PathTag::Direct && self.config.enable_repair_pass {
            if let Some(reason) = self.repair_trigger(&selection.scores) {
                match self.repair_stage(&block, &selection, &input, &forbidden).await {
                    Some(repaired) => {
                        selection = repaired;
                        path = PathTag::Repair;
                        repair_reason = Some(reason);
                    }
                    None => debug!(reason, "repair rejected, keeping original"),
                }
            }
        }

        // ===== FALLBACK =====
        if path != PathTag::Fallback {
            if let Some(reason) = self.fallback_trigger(&selection.scores) {
                let bubbles = self.fallback_bubbles(&persona, user_text);
                let scores = scoring::score_candidate(&bubbles, 0.0, &input);
                selection = ScoredCandidate { bubbles, scores };
                path = PathTag::Fallback;
                fallback_reason = Some(reason);
            }
        }

        // ===== DONE =====
        for bubble in &selection.bubbles {
            if let Err(err) =
                self.store
                    .conversations
                    .append_message(conversation_id, "assistant", bubble)
            {
                warn!(error = %err, "failed to log reply bubble");
            }
        }

        let delays_ms = typing_delays(&selection.bubbles);
        info!(
            conversation_id,
            persona = %persona_key,
            path = path.as_str(),
            pool = pool.len(),
            chosen = chosen_index,
            total = format!("{:.3}", selection.scores.total),
            offtopic = format!("{:.3}", selection.scores.offtopic),
            "reply generated"
        );

        Ok(GenerationResult {
            bubbles: selection.bubbles,
            chosen_index,
            pool,
            planner_model,
            generator_model,
            debug: GenerationDebug {
                path,
                repair_reason,
                fallback_reason,
                rejected_candidates: rejected,
                delays_ms,
            },
        })
    }

    // ===== Stages =====

    async fn plan_stage(&self, block: &ContextBlock) -> (ReplyPlan, Option<String>) {
        let prompt = prompts::plan_prompt(block);
        let request = GenerateRequest::new(&self.config.planner_model, prompt.system, prompt.user)
            .with_temperature(0.4)
            .with_max_tokens(200);
        match self.model.generate(request).await {
            Ok(call) => {
                let plan = parse::extract_json(&call.text)
                    .map(|v| ReplyPlan::from_value(&v, &self.config, &block.frame))
                    .unwrap_or_else(|| ReplyPlan::heuristic(&self.config, &block.frame));
                (plan, Some(call.model))
            }
            Err(err) => {
                warn!(error = %err, "planner call failed, heuristic plan");
                (ReplyPlan::heuristic(&self.config, &block.frame), None)
            }
        }
    }

    async fn generate_stage(
        &self,
        block: &ContextBlock,
        plan: &ReplyPlan,
    ) -> (Vec<Vec<String>>, Option<String>) {
        let prompt = prompts::generation_prompt(block, plan);
        let request = GenerateRequest::new(&self.config.generator_model, prompt.system, prompt.user)
            .with_temperature(0.9)
            .with_max_tokens(1200);
        match self.model.generate(request).await {
            Ok(call) => {
                if self.config.log_raw_model_output {
                    debug!(raw = %self.config.clip(&call.text), "generator output");
                }
                let mut candidates = parse::extract_json(&call.text)
                    .map(|v| parse::candidates_from_value(&v))
                    .unwrap_or_default();
                if candidates.is_empty() {
                    candidates = parse::coerce_candidates_from_text(&call.text);
                }
                (candidates, Some(call.model))
            }
            Err(err) => {
                warn!(error = %err, "generation call failed");
                (Vec::new(), None)
            }
        }
    }

    /// Batch relevance: one embedding call for the query plus all survivors;
    /// keyword overlap when the call fails.
    async fn relevance_stage(&self, user_text: &str, survivors: &[Vec<String>]) -> Vec<f64> {
        if survivors.is_empty() {
            return Vec::new();
        }
        let mut inputs = Vec::with_capacity(survivors.len() + 1);
        inputs.push(user_text.to_string());
        inputs.extend(survivors.iter().map(|b| b.join(" ")));

        let task = EmbeddingTask {
            model: self.config.embedding_model.clone(),
            dim: self.config.embedding_dim,
            kind: EmbeddingKind::Query,
            inputs,
        };
        match self.model.embed(task).await {
            Ok(vectors) if vectors.len() == survivors.len() + 1 => {
                let query = &vectors[0];
                vectors[1..]
                    .iter()
                    .map(|v| cosine(query, v).clamp(0.0, 1.0))
                    .collect()
            }
            Ok(_) | Err(_) => {
                warn!("relevance embedding failed, keyword overlap fallback");
                survivors
                    .iter()
                    .map(|b| scoring::keyword_relevance(user_text, b))
                    .collect()
            }
        }
    }

    async fn critic_stage(&self, user_text: &str, pool: &[ScoredCandidate]) -> usize {
        let bubble_lists: Vec<Vec<String>> = pool.iter().map(|c| c.bubbles.clone()).collect();
        let prompt = prompts::critic_prompt(user_text, &bubble_lists);
        let request = GenerateRequest::new(&self.config.planner_model, prompt.system, prompt.user)
            .with_temperature(0.0)
            .with_max_tokens(8);
        let pick = match self.model.generate(request).await {
            Ok(call) => parse_index(&call.text),
            Err(err) => {
                warn!(error = %err, "critic call failed, keeping leader");
                None
            }
        };
        match pick {
            Some(i) if i < pool.len() => {
                // Accept only if the critic's pick is not clearly less
                // relevant than the score leader.
                if pool[i].scores.relevance >= pool[0].scores.relevance - CRITIC_MARGIN {
                    i
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn repair_trigger(&self, scores: &ScoreSet) -> Option<String> {
        let c = &self.config;
        if scores.offtopic > c.repair_threshold_low && scores.offtopic <= c.repair_threshold_high {
            return Some(format!("offtopic_band:{:.2}", scores.offtopic));
        }
        if c.enable_persona_guard && scores.persona < c.persona_guard_repair_threshold {
            return Some(format!("persona_low:{:.2}", scores.persona));
        }
        if scores.flow < REPAIR_FLOW_FLOOR {
            return Some(format!("flow_low:{:.2}", scores.flow));
        }
        None
    }

    async fn repair_stage(
        &self,
        block: &ContextBlock,
        selection: &ScoredCandidate,
        input: &ScoreInput<'_>,
        forbidden: &[&str],
    ) -> Option<ScoredCandidate> {
        let prompt = prompts::repair_prompt(block, &selection.bubbles);
        let request = GenerateRequest::new(&self.config.planner_model, prompt.system, prompt.user)
            .with_temperature(0.5)
            .with_max_tokens(300);
        let call = match self.model.generate(request).await {
            Ok(call) => call,
            Err(err) => {
                warn!(error = %err, "repair call failed");
                return None;
            }
        };

        let value = parse::extract_json(&call.text)?;
        let bubbles: Vec<String> = parse::candidates_from_value(&value)
            .into_iter()
            .next()?
            .iter()
            .map(|b| parse::sanitize_bubble(b, forbidden))
            .filter(|b| !b.is_empty())
            .collect();
        if parse::reject_candidate(&bubbles, forbidden).is_some() {
            return None;
        }

        let relevances = self.relevance_stage(&block.frame.user_text, &[bubbles.clone()]).await;
        let relevance = relevances.first().copied().unwrap_or(0.0);
        let scores = scoring::score_candidate(&bubbles, relevance, input);

        let improved_offtopic =
            selection.scores.offtopic - scores.offtopic > REPAIR_OFFTOPIC_IMPROVEMENT;
        let improved_total = scores.total - selection.scores.total > REPAIR_TOTAL_IMPROVEMENT;
        let acceptable = scores.offtopic <= self.config.repair_threshold_high
            && scores.persona >= (self.config.persona_guard_repair_threshold - 0.2).min(0.3);

        if improved_offtopic || improved_total || acceptable {
            Some(ScoredCandidate { bubbles, scores })
        } else {
            None
        }
    }

    fn fallback_trigger(&self, scores: &ScoreSet) -> Option<String> {
        let c = &self.config;
        if scores.offtopic > c.repair_threshold_high
            && scores.relevance < FALLBACK_RELEVANCE_LOW
            && scores.flow < FALLBACK_FLOW_LOW
        {
            return Some("severe_offtopic".to_string());
        }
        if c.enable_persona_guard
            && scores.persona < (c.persona_guard_repair_threshold - 0.25).max(0.2)
        {
            return Some("persona_broken".to_string());
        }
        if scores.flow < FALLBACK_FLOW_BROKEN && scores.relevance < FALLBACK_RELEVANCE_MID {
            return Some("flow_broken".to_string());
        }
        None
    }

    /// Deterministic two-bubble reply: the persona's nickname plus a soft
    /// echo of the user's message.
    fn fallback_bubbles(&self, persona: &PersonaProfile, user_text: &str) -> Vec<String> {
        let nickname = persona.nickname(&self.config);
        let echo: String = user_text.chars().take(18).collect();
        if echo.trim().is_empty() {
            vec![format!("{nickname}在呢"), "刚刚走神了，你说".to_string()]
        } else {
            vec![
                format!("{nickname}在呢"),
                format!("你说{echo}呀，我们慢慢聊"),
            ]
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    (dot / (na * nb)) as f64
}

fn parse_index(text: &str) -> Option<usize> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Length-proportional randomized typing delays, returned as strictly
/// increasing cumulative offsets.
fn typing_delays(bubbles: &[String]) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut cumulative = 0u64;
    bubbles
        .iter()
        .map(|b| {
            let chars = b.chars().count().min(TYPING_CHAR_CAP) as u64;
            let per_char = rng.gen_range(TYPING_MS_PER_CHAR.0..=TYPING_MS_PER_CHAR.1);
            cumulative += TYPING_BASE_MS + chars * per_char;
            cumulative
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_delays_are_strictly_increasing() {
        let bubbles: Vec<String> = vec!["好".into(), "今天就看电影".into(), "几点".into()];
        let delays = typing_delays(&bubbles);
        assert_eq!(delays.len(), 3);
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert!(delays[0] >= TYPING_BASE_MS);
    }

    #[test]
    fn typing_delay_caps_char_contribution() {
        let long = vec!["啊".repeat(200)];
        let delays = typing_delays(&long);
        let max = TYPING_BASE_MS + TYPING_CHAR_CAP as u64 * TYPING_MS_PER_CHAR.1;
        assert!(delays[0] <= max);
    }

    #[test]
    fn critic_index_parsing() {
        assert_eq!(parse_index("2"), Some(2));
        assert_eq!(parse_index("选 3 号"), Some(3));
        assert_eq!(parse_index("没有数字"), None);
    }

    #[test]
    fn path_tags_render() {
        assert_eq!(PathTag::Direct.as_str(), "direct");
        assert_eq!(PathTag::Repair.as_str(), "repair");
        assert_eq!(PathTag::Fallback.as_str(), "fallback");
    }
}
