//! Reply plan: how many candidates to draft and in what shape.

use serde_json::Value;

use crate::config::Config;

use super::frame::ContextFrame;

pub const CANDIDATE_MIN: usize = 8;
pub const CANDIDATE_MAX: usize = 20;

#[derive(Debug, Clone)]
pub struct ReplyPlan {
    pub candidate_count: usize,
    pub bubble_target: usize,
    pub tone_tags: Vec<String>,
}

impl ReplyPlan {
    /// Parse a plan out of model JSON; any missing field falls back to the
    /// heuristic value. Candidate count is always clamped to the band.
    pub fn from_value(value: &Value, config: &Config, frame: &ContextFrame) -> Self {
        let fallback = Self::heuristic(config, frame);
        let candidate_count = value
            .get("candidate_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback.candidate_count)
            .clamp(CANDIDATE_MIN, CANDIDATE_MAX);
        let bubble_target = value
            .get("bubble_count")
            .or_else(|| value.get("bubble_target"))
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).clamp(1, frame.bubbles.max))
            .unwrap_or(fallback.bubble_target);
        let tone_tags = value
            .get("tone_tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.to_string())
                    .take(4)
                    .collect()
            })
            .unwrap_or(fallback.tone_tags);
        Self {
            candidate_count,
            bubble_target,
            tone_tags,
        }
    }

    /// Deterministic plan from short-term context signals, used when the
    /// planner call fails or returns garbage.
    pub fn heuristic(config: &Config, frame: &ContextFrame) -> Self {
        let tone = if frame.question_like {
            "回应提问"
        } else if frame.status_update {
            "接住状态"
        } else {
            "自然闲聊"
        };
        Self {
            candidate_count: config
                .generation_candidates
                .clamp(CANDIDATE_MIN, CANDIDATE_MAX),
            bubble_target: frame.bubbles.target,
            tone_tags: vec![tone.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(user: &str) -> ContextFrame {
        ContextFrame::build(user, &[], 180)
    }

    #[test]
    fn heuristic_tracks_frame_shape() {
        let config = Config::default();
        let plan = ReplyPlan::heuristic(&config, &frame("今天要不要看电影？"));
        assert_eq!(plan.bubble_target, 2);
        assert_eq!(plan.tone_tags, vec!["回应提问".to_string()]);
        assert!((CANDIDATE_MIN..=CANDIDATE_MAX).contains(&plan.candidate_count));
    }

    #[test]
    fn parsed_count_is_clamped() {
        let config = Config::default();
        let f = frame("在吗");
        let low = ReplyPlan::from_value(&json!({"candidate_count": 1}), &config, &f);
        assert_eq!(low.candidate_count, CANDIDATE_MIN);
        let high = ReplyPlan::from_value(&json!({"candidate_count": 99}), &config, &f);
        assert_eq!(high.candidate_count, CANDIDATE_MAX);
    }

    #[test]
    fn missing_fields_use_heuristic() {
        let config = Config::default();
        let f = frame("我刚到家");
        let plan = ReplyPlan::from_value(&json!({}), &config, &f);
        assert_eq!(plan.bubble_target, f.bubbles.target);
        assert!(!plan.tone_tags.is_empty());
    }
}
