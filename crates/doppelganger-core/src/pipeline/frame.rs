//! Short-term context frame: the per-request signals derived from the user
//! message and the recent conversation tail that steer planning, flow
//! scoring, and drift detection.

use crate::retrieval::text;
use crate::store::OnlineMessage;

const MAX_FOCUS_TERMS: usize = 14;

#[derive(Debug, Clone)]
pub struct BubbleBand {
    pub min: usize,
    pub target: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct ContextFrame {
    pub user_text: String,
    pub anchor_excerpt: String,
    pub focus_terms: Vec<String>,
    pub question_like: bool,
    pub status_update: bool,
    /// Consecutive assistant messages at the tail of the recent window.
    pub assistant_run: usize,
    pub bubbles: BubbleBand,
}

impl ContextFrame {
    pub fn build(user_text: &str, recent: &[OnlineMessage], anchor_chars: usize) -> Self {
        let mut focus_terms = text::keyword_tokens(user_text);
        focus_terms.truncate(MAX_FOCUS_TERMS);

        let question_like = text::is_question_like(user_text);
        let status_update = text::is_status_update(user_text);

        // The current user message is already logged and sits at the tail
        // of the recent window; step over it before counting our own run.
        let mut tail = recent.iter().rev().peekable();
        if tail.peek().is_some_and(|m| m.role == "user") {
            tail.next();
        }
        let assistant_run = tail.take_while(|m| m.role == "assistant").count();

        let mut bubbles = if status_update {
            BubbleBand { min: 2, target: 3, max: 6 }
        } else if question_like {
            BubbleBand { min: 1, target: 2, max: 4 }
        } else {
            BubbleBand { min: 1, target: 2, max: 5 }
        };
        // When we were already sending a burst, allow one more bubble.
        if assistant_run >= 2 {
            bubbles.target = (bubbles.target + 1).min(6);
            bubbles.max = (bubbles.max + 1).min(8);
        }

        let anchor_excerpt: String = user_text.chars().take(anchor_chars).collect();

        Self {
            user_text: user_text.to_string(),
            anchor_excerpt,
            focus_terms,
            question_like,
            status_update,
            assistant_run,
            bubbles,
        }
    }
}
