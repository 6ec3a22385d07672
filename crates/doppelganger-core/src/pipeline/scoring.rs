//! The nine candidate score dimensions and their weighted combination.
//!
//! Every dimension is a pure function of the candidate text and the
//! request context, each clamped to [0,1]; penalties are additive and the
//! final total is clamped back into [0,1]. Tune with care: these constants
//! were fitted against real conversations.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::Config;
use crate::retrieval::text::{char_len, keyword_tokens};

use super::frame::ContextFrame;
use super::persona::{PersonaProfile, ScoreWeights};

pub const RELEVANCE_FLOOR: f64 = 0.05;
pub const FLOW_BONUS_WEIGHT: f64 = 0.24;
const FLOW_SHORTFALL_WEIGHT: f64 = 0.12;
const FLOW_SHORTFALL_PIVOT: f64 = 0.46;
const PERSONA_GUARD_PIVOT: f64 = 0.55;

const COPY_PENALTY_STEP: f64 = 0.08;
const COPY_PENALTY_CAP: f64 = 0.22;
const COPY_MIN_CHARS: usize = 10;

const ECHO_HEAVY_OVERLAP: f64 = 0.78;
const ECHO_LOW_NOVELTY: f64 = 0.22;
const ECHO_HEAVY_PENALTY: f64 = 0.18;
const ECHO_SHORT_PENALTY: f64 = 0.10;
const ECHO_LOOP_PENALTY: f64 = 0.22;
const ECHO_DUPLICATE_PENALTY: f64 = 0.08;
const ECHO_LAUGH_CAP: f64 = 0.35;

const SHORT_BUBBLE_CHARS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSet {
    pub relevance: f64,
    pub style: f64,
    pub flow: f64,
    pub segment: f64,
    pub context: f64,
    pub persona: f64,
    pub offtopic: f64,
    pub copy_penalty: f64,
    pub echo_penalty: f64,
    pub total: f64,
}

/// Request-scoped inputs shared by all dimensions.
pub struct ScoreInput<'a> {
    pub config: &'a Config,
    pub frame: &'a ContextFrame,
    pub persona: &'a PersonaProfile,
    pub weights: &'a ScoreWeights,
    /// Assistant reply lines from the top retrieved segment.
    pub reference_lines: &'a [String],
    /// Reply lines from the top two segments (copy-penalty scope).
    pub copy_reference_lines: &'a [String],
    /// Older related lines of the live conversation.
    pub online_memory: &'a [String],
}

fn laugh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"哈哈|h{2,}|呵呵|嘿嘿").unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn laugh_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"哈哈|笑死|hhh").unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)json|schema|markdown|作为ai|我作为|提示词|system prompt")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn joined(bubbles: &[String]) -> String {
    bubbles.join(" ")
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

// ===== Relevance fallback =====

/// Keyword-overlap stand-in for relevance when the embedding call fails:
/// fraction of query tokens present in the candidate.
pub fn keyword_relevance(user_text: &str, bubbles: &[String]) -> f64 {
    let query: Vec<String> = keyword_tokens(user_text);
    if query.is_empty() {
        return 0.5;
    }
    let cand = joined(bubbles);
    let hits = query.iter().filter(|t| cand.contains(t.as_str())).count();
    clamp01(hits as f64 / query.len() as f64)
}

// ===== Style =====

pub fn style_score(bubbles: &[String], persona: &PersonaProfile, frame: &ContextFrame) -> f64 {
    let lens: Vec<usize> = bubbles.iter().map(|b| char_len(b)).collect();
    let avg = lens.iter().sum::<usize>() as f64 / lens.len().max(1) as f64;
    let target = persona.speech_style.avg_len.max(1.0);
    let len_align = 1.0 - ((avg - target).abs() / target).min(1.0);

    let short_frac =
        lens.iter().filter(|&&l| l <= SHORT_BUBBLE_CHARS).count() as f64 / lens.len().max(1) as f64;
    let short_align = clamp01(1.0 - (short_frac - persona.speech_style.short_ratio).abs());

    let count = bubbles.len();
    let band = &frame.bubbles;
    let bubble_align = if count >= band.min && count <= band.max {
        (1.0 - 0.15 * (count as f64 - band.target as f64).abs()).max(0.4)
    } else {
        let over = if count < band.min {
            band.min - count
        } else {
            count - band.max
        };
        (0.3 - 0.1 * over as f64).max(0.0)
    };

    let has_laugh = laugh_target_re().is_match(&joined(bubbles));
    let laugh_align = 1.0 - ((has_laugh as u8 as f64) - persona.speech_style.laugh_ratio).abs();

    clamp01(0.42 * len_align + 0.26 * short_align + 0.22 * bubble_align + 0.10 * laugh_align)
}

// ===== Flow =====

const ACK_WORDS: &[&str] = &[
    "嗯", "好", "行", "可以", "没", "有", "去", "看", "对", "真的",
    "哈哈", "辛苦", "早点", "慢点", "注意",
];

pub fn flow_score(bubbles: &[String], frame: &ContextFrame) -> f64 {
    let text = joined(bubbles);
    let mut score = 0.5;

    if frame.question_like {
        let answers = ACK_WORDS.iter().any(|w| text.contains(w))
            || frame.focus_terms.iter().any(|t| text.contains(t.as_str()));
        if answers {
            score += 0.3;
        }
        // Re-asking the same question back is not an answer.
        if text.ends_with('？') && keyword_relevance(&frame.user_text, bubbles) > 0.8 {
            score -= 0.1;
        }
    } else if frame.status_update {
        if ACK_WORDS.iter().any(|w| text.contains(w)) {
            score += 0.3;
        }
        if text.contains('？') || text.contains('吗') {
            score += 0.1;
        }
    } else if char_len(text.trim()) >= 4 {
        score += 0.15;
    }

    if bubbles.len() >= 3 {
        score += 0.1;
    }
    if bubbles.len() == 1 && char_len(bubbles[0].trim()) <= 2 {
        score -= 0.2;
    }
    if has_adjacent_repetition(&text) && !laugh_re().is_match(&text) {
        score -= 0.3;
    }

    clamp01(score)
}

// ===== Segment alignment =====

const ALIGN_OVERLAP_W: f64 = 0.55;
const ALIGN_LEN_W: f64 = 0.35;
const ALIGN_PUNCT_W: f64 = 0.10;

pub fn segment_alignment(bubbles: &[String], reference_lines: &[String]) -> f64 {
    if reference_lines.is_empty() {
        return 0.3;
    }
    let cand = joined(bubbles);
    let cand_tokens: HashSet<String> = keyword_tokens(&cand).into_iter().collect();
    let ref_text = reference_lines.join(" ");
    let ref_tokens: HashSet<String> = keyword_tokens(&ref_text).into_iter().collect();

    let overlap = if cand_tokens.is_empty() {
        0.0
    } else {
        cand_tokens.intersection(&ref_tokens).count() as f64 / cand_tokens.len() as f64
    };

    let cand_avg = bubbles.iter().map(|b| char_len(b)).sum::<usize>() as f64
        / bubbles.len().max(1) as f64;
    let ref_avg = reference_lines.iter().map(|l| char_len(l)).sum::<usize>() as f64
        / reference_lines.len() as f64;
    let len_parity = 1.0 - ((cand_avg - ref_avg).abs() / ref_avg.max(1.0)).min(1.0);

    let punct_parity = 1.0 - (punct_density(&cand) - punct_density(&ref_text)).abs().min(1.0);

    clamp01(ALIGN_OVERLAP_W * overlap + ALIGN_LEN_W * len_parity + ALIGN_PUNCT_W * punct_parity)
}

fn punct_density(text: &str) -> f64 {
    let total = char_len(text).max(1);
    let punct = text
        .chars()
        .filter(|c| c.is_ascii_punctuation() || "！？。，～…".contains(*c))
        .count();
    punct as f64 / total as f64
}

// ===== Context =====

const CONTEXT_NEUTRAL: f64 = 0.55;
const CONTEXT_BASE: f64 = 0.30;
const CONTEXT_PREFIX_BONUS: f64 = 0.12;
const CONTEXT_PREFIX_CHARS: usize = 3;
const CONTEXT_MAX_HITS: usize = 5;

pub fn context_score(bubbles: &[String], online_memory: &[String]) -> f64 {
    if online_memory.is_empty() {
        return CONTEXT_NEUTRAL;
    }
    let cand = joined(bubbles);
    let hits = online_memory
        .iter()
        .filter(|line| {
            let prefix: String = line.chars().take(CONTEXT_PREFIX_CHARS).collect();
            char_len(&prefix) >= 2 && cand.contains(&prefix)
        })
        .take(CONTEXT_MAX_HITS)
        .count();
    clamp01(CONTEXT_BASE + CONTEXT_PREFIX_BONUS * hits as f64)
}

// ===== Persona =====

pub fn persona_score(
    bubbles: &[String],
    persona: &PersonaProfile,
    config: &Config,
    guard_enabled: bool,
) -> f64 {
    let text = joined(bubbles);
    if persona
        .forbidden(config)
        .iter()
        .any(|n| !n.is_empty() && text.contains(n))
    {
        return 0.0;
    }
    if !guard_enabled {
        return 0.7;
    }

    let avg = bubbles.iter().map(|b| char_len(b)).sum::<usize>() as f64
        / bubbles.len().max(1) as f64;
    let target = persona.speech_style.avg_len.max(1.0);
    let len_align = 1.0 - ((avg - target).abs() / target).min(1.0);

    let hits = persona
        .top_phrases
        .iter()
        .filter(|p| !p.is_empty() && text.contains(p.as_str()))
        .count();
    let phrase_align = (hits as f64 / 4.0).min(1.0);

    let mut score = 0.65 + 0.2 * len_align + 0.15 * phrase_align;
    if text.contains(persona.nickname(config)) {
        score += 0.08;
    }
    clamp01(score)
}

// ===== Offtopic drift =====

const DRIFT_BASE_WEIGHT: f64 = 0.75;
const DRIFT_UNANSWERED_QUESTION: f64 = 0.15;
const DRIFT_RELEVANCE_RELIEF: f64 = 0.30;
const DRIFT_ACTIVITY_RELIEF: f64 = 0.20;
const DRIFT_TOPIC_CHANGE: f64 = 0.25;
const DRIFT_META: f64 = 0.30;
const DRIFT_EXCESS_VOCAB: f64 = 0.10;

const TOPIC_CHANGE_HINTS: &[&str] = &["先不聊", "换个话题", "说点别的", "突然想"];
const ACTIVITY_QUERY_HINTS: &[&str] = &["在干嘛", "干什么", "在做什么", "干嘛呢"];
const STATUS_REPLY_HINTS: &[&str] = &["我在", "刚", "正在", "准备", "在家", "在忙"];

pub fn offtopic_score(bubbles: &[String], frame: &ContextFrame, relevance: f64) -> f64 {
    let text = joined(bubbles);
    let coverage = if frame.focus_terms.is_empty() {
        1.0
    } else {
        let hits = frame
            .focus_terms
            .iter()
            .filter(|t| text.contains(t.as_str()))
            .count();
        hits as f64 / frame.focus_terms.len() as f64
    };

    let mut drift = (1.0 - coverage) * DRIFT_BASE_WEIGHT;

    if frame.question_like && coverage == 0.0 && !ACK_WORDS.iter().any(|w| text.contains(w)) {
        drift += DRIFT_UNANSWERED_QUESTION;
    }

    drift -= DRIFT_RELEVANCE_RELIEF * clamp01(relevance);

    let activity_query = ACTIVITY_QUERY_HINTS.iter().any(|h| frame.user_text.contains(h));
    if activity_query && STATUS_REPLY_HINTS.iter().any(|h| text.contains(h)) {
        drift -= DRIFT_ACTIVITY_RELIEF;
    }

    if TOPIC_CHANGE_HINTS.iter().any(|h| text.contains(h)) {
        drift += DRIFT_TOPIC_CHANGE;
    }
    if meta_re().is_match(&text) {
        drift += DRIFT_META;
    }

    if coverage < 0.3 {
        let cand_tokens = keyword_tokens(&text);
        let anchor: HashSet<&str> = frame.focus_terms.iter().map(|s| s.as_str()).collect();
        let novel = cand_tokens
            .iter()
            .filter(|t| !anchor.contains(t.as_str()))
            .count();
        if novel > 6 {
            drift += DRIFT_EXCESS_VOCAB;
        }
    }

    clamp01(drift)
}

// ===== Copy and echo penalties =====

pub fn copy_penalty(bubbles: &[String], copy_reference_lines: &[String]) -> f64 {
    let mut penalty = 0.0;
    for bubble in bubbles {
        let b = bubble.trim();
        if char_len(b) < COPY_MIN_CHARS {
            continue;
        }
        if copy_reference_lines.iter().any(|l| l.contains(b)) {
            penalty += COPY_PENALTY_STEP;
        }
    }
    penalty.min(COPY_PENALTY_CAP)
}

pub fn echo_penalty(bubbles: &[String], user_text: &str) -> f64 {
    let text = joined(bubbles);
    let user_tokens: HashSet<String> = keyword_tokens(user_text).into_iter().collect();
    let cand_tokens: Vec<String> = keyword_tokens(&text);
    let laugh = laugh_re().is_match(&text);

    let mut penalty = 0.0;

    if !user_tokens.is_empty() && !cand_tokens.is_empty() {
        let shared = cand_tokens.iter().filter(|t| user_tokens.contains(*t)).count();
        let overlap = shared as f64 / user_tokens.len() as f64;
        let novelty = (cand_tokens.len() - shared) as f64 / cand_tokens.len() as f64;
        if overlap >= ECHO_HEAVY_OVERLAP && novelty <= ECHO_LOW_NOVELTY {
            penalty += ECHO_HEAVY_PENALTY;
        }
    }

    let trimmed = text.trim();
    if char_len(trimmed) <= 6 && !trimmed.is_empty() && user_text.contains(trimmed) {
        penalty += ECHO_SHORT_PENALTY;
    }

    if has_adjacent_repetition(&text) {
        penalty += ECHO_LOOP_PENALTY;
    }

    if laugh {
        // Expressive repetition is normal chat behavior, not a loop.
        return penalty.min(ECHO_LAUGH_CAP);
    }

    let mut seen = HashSet::new();
    if bubbles.iter().any(|b| !seen.insert(b.trim())) {
        penalty += ECHO_DUPLICATE_PENALTY;
    }
    penalty
}

/// An adjacent repeated substring of 2 to 8 chars ("去不去不去不",
/// "好的好的好的"). Works on chars, not bytes.
pub fn has_adjacent_repetition(text: &str) -> bool {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    for n in 2..=8usize {
        if chars.len() < 2 * n {
            continue;
        }
        for i in 0..=chars.len() - 2 * n {
            if chars[i..i + n] == chars[i + n..i + 2 * n] {
                return true;
            }
        }
    }
    false
}

// ===== Total =====

pub fn weighted_total(
    scores: &ScoreSet,
    weights: &ScoreWeights,
    config: &Config,
    guard_enabled: bool,
) -> f64 {
    let offtopic_weight = if config.enable_offtopic_penalty {
        config.offtopic_penalty_weight
    } else {
        0.0
    };
    let mut total = weights.semantic * scores.relevance
        + weights.style * scores.style
        + weights.relation * scores.persona
        + weights.recency * scores.segment
        + weights.online_memory * scores.context
        + FLOW_BONUS_WEIGHT * scores.flow
        - scores.copy_penalty
        - scores.echo_penalty
        - offtopic_weight * scores.offtopic
        - FLOW_SHORTFALL_WEIGHT * (FLOW_SHORTFALL_PIVOT - scores.flow).max(0.0);
    if guard_enabled {
        total -= config.persona_guard_penalty_weight * (PERSONA_GUARD_PIVOT - scores.persona).max(0.0);
    }
    clamp01(total)
}

/// Compute every dimension for one candidate given its relevance score.
pub fn score_candidate(bubbles: &[String], relevance: f64, input: &ScoreInput<'_>) -> ScoreSet {
    let guard = input.config.enable_persona_guard;
    let mut scores = ScoreSet {
        relevance: clamp01(relevance),
        style: style_score(bubbles, input.persona, input.frame),
        flow: flow_score(bubbles, input.frame),
        segment: segment_alignment(bubbles, input.reference_lines),
        context: context_score(bubbles, input.online_memory),
        persona: persona_score(bubbles, input.persona, input.config, guard),
        offtopic: offtopic_score(bubbles, input.frame, relevance),
        copy_penalty: copy_penalty(bubbles, input.copy_reference_lines),
        echo_penalty: echo_penalty(bubbles, &input.frame.user_text),
        total: 0.0,
    };
    scores.total = weighted_total(&scores, input.weights, input.config, guard);
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::ContextFrame;

    fn frame(user: &str) -> ContextFrame {
        ContextFrame::build(user, &[], 180)
    }

    fn bubbles(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn input<'a>(
        config: &'a Config,
        frame: &'a ContextFrame,
        persona: &'a PersonaProfile,
        weights: &'a ScoreWeights,
    ) -> ScoreInput<'a> {
        ScoreInput {
            config,
            frame,
            persona,
            weights,
            reference_lines: &[],
            copy_reference_lines: &[],
            online_memory: &[],
        }
    }

    // ===== Bounds =====

    #[test]
    fn all_scores_stay_in_unit_interval() {
        let config = Config::default();
        let persona = PersonaProfile::default();
        let weights = ScoreWeights::default();
        let cases = [
            vec!["好呀".to_string()],
            bubbles(&["今天就看电影", "走起", "几点？"]),
            vec!["啊".repeat(44)],
            bubbles(&["哈哈哈哈哈哈哈哈"]),
        ];
        for (i, cand) in cases.iter().enumerate() {
            let f = frame("今天要不要看电影？");
            let inp = input(&config, &f, &persona, &weights);
            for rel in [0.0, 0.5, 1.0] {
                let s = score_candidate(cand, rel, &inp);
                for (name, v) in [
                    ("relevance", s.relevance),
                    ("style", s.style),
                    ("flow", s.flow),
                    ("segment", s.segment),
                    ("context", s.context),
                    ("persona", s.persona),
                    ("offtopic", s.offtopic),
                    ("total", s.total),
                ] {
                    assert!((0.0..=1.0).contains(&v), "case {i} {name}={v}");
                }
            }
        }
    }

    // ===== Persona guard =====

    #[test]
    fn forbidden_nickname_zeroes_persona() {
        let config = Config::default();
        let persona = PersonaProfile::default();
        let s = persona_score(&bubbles(&["宝宝你在哪"]), &persona, &config, true);
        assert_eq!(s, 0.0);
        // Even with guard disabled.
        let s = persona_score(&bubbles(&["老婆早"]), &persona, &config, false);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn guard_disabled_gives_neutral_persona() {
        let config = Config::default();
        let persona = PersonaProfile::default();
        assert_eq!(persona_score(&bubbles(&["好呀"]), &persona, &config, false), 0.7);
    }

    #[test]
    fn strict_nickname_earns_bonus() {
        let config = Config::default();
        let persona = PersonaProfile::default();
        let plain = persona_score(&bubbles(&["到家啦，今天好累"]), &persona, &config, true);
        let with_nick = persona_score(&bubbles(&["宝贝到家啦，今天好累"]), &persona, &config, true);
        assert!(with_nick > plain);
    }

    // ===== Offtopic drift =====

    #[test]
    fn on_topic_scores_below_off_topic() {
        let f = frame("今天要不要看电影？");
        let on = offtopic_score(&bubbles(&["可以呀，今天就看电影。"]), &f, 0.0);
        let off = offtopic_score(&bubbles(&["我突然想吃火锅，先不聊这个。"]), &f, 0.0);
        assert!(on < off, "on={on} off={off}");
    }

    #[test]
    fn relevance_relieves_drift() {
        let f = frame("今天要不要看电影？");
        let cand = bubbles(&["随便聊聊别的"]);
        let low = offtopic_score(&cand, &f, 0.0);
        let high = offtopic_score(&cand, &f, 1.0);
        assert!(high < low);
    }

    #[test]
    fn activity_query_with_status_reply_is_relieved() {
        let f = frame("在干嘛呢");
        let status = offtopic_score(&bubbles(&["我在家刚吃完饭"]), &f, 0.0);
        let vague = offtopic_score(&bubbles(&["那部剧真好看"]), &f, 0.0);
        assert!(status < vague);
    }

    #[test]
    fn meta_leak_raises_drift() {
        let f = frame("今天要不要看电影？");
        let plain = offtopic_score(&bubbles(&["想去走走"]), &f, 0.0);
        let meta = offtopic_score(&bubbles(&["想去走走，以下是markdown"]), &f, 0.0);
        assert!(meta > plain);
    }

    // ===== Echo penalty =====

    #[test]
    fn laughter_repetition_never_outscores_mechanical_repetition() {
        let user = "今天好好笑";
        let laugh = echo_penalty(&bubbles(&["哈哈哈哈哈哈哈哈"]), user);
        let mechanical = echo_penalty(&bubbles(&["去不去不去不去不"]), user);
        assert!(laugh <= mechanical, "laugh={laugh} mech={mechanical}");
        assert!(laugh <= ECHO_LAUGH_CAP);
    }

    #[test]
    fn verbatim_echo_is_penalized() {
        let p = echo_penalty(&bubbles(&["看电影"]), "今天要不要看电影");
        assert!(p >= ECHO_SHORT_PENALTY);
        let fresh = echo_penalty(&bubbles(&["可以呀，我正好想出门"]), "今天要不要看电影");
        assert!(fresh < p);
    }

    #[test]
    fn duplicate_bubbles_add_penalty() {
        let p = echo_penalty(&bubbles(&["明天见", "明天见"]), "好");
        assert!(p >= ECHO_DUPLICATE_PENALTY);
    }

    #[test]
    fn adjacent_repetition_detector() {
        assert!(has_adjacent_repetition("好的好的"));
        assert!(has_adjacent_repetition("去不去不去不"));
        assert!(!has_adjacent_repetition("今天去看电影吧"));
        assert!(!has_adjacent_repetition("嗯"));
    }

    // ===== Copy penalty =====

    #[test]
    fn verbatim_segment_copy_is_capped() {
        let refs = vec![
            "那天我们看完电影去吃了宵夜真的很开心".to_string(),
            "下次还想再去一次那家店".to_string(),
        ];
        let cand = bubbles(&[
            "那天我们看完电影去吃了宵夜真的很开心",
            "下次还想再去一次那家店",
            "下次还想再去一次那家店",
        ]);
        let p = copy_penalty(&cand, &refs);
        assert!(p <= COPY_PENALTY_CAP + 1e-9);
        assert!(p > 0.0);
    }

    #[test]
    fn short_bubbles_do_not_trigger_copy_penalty() {
        let refs = vec!["好呀走".to_string()];
        assert_eq!(copy_penalty(&bubbles(&["好呀走"]), &refs), 0.0);
    }

    // ===== Flow and style =====

    #[test]
    fn answering_a_question_beats_ignoring_it() {
        let f = frame("今天要不要看电影？");
        let answer = flow_score(&bubbles(&["可以呀，看几点的"]), &f);
        let ignore = flow_score(&bubbles(&["。"]), &f);
        assert!(answer > ignore);
    }

    #[test]
    fn burst_rewarded_single_tiny_bubble_penalized() {
        let f = frame("我刚到家");
        let burst = flow_score(&bubbles(&["辛苦啦", "路上累不累", "先歇会"]), &f);
        let tiny = flow_score(&bubbles(&["嗯"]), &f);
        assert!(burst > tiny);
    }

    #[test]
    fn style_prefers_target_length() {
        let mut persona = PersonaProfile::default();
        persona.speech_style.avg_len = 6.0;
        persona.speech_style.laugh_ratio = 0.0;
        let f = frame("在吗");
        let close = style_score(&bubbles(&["在的呀在的", "怎么啦"]), &persona, &f);
        let far = style_score(&bubbles(&["啊".repeat(40).as_str()]), &persona, &f);
        assert!(close > far);
    }

    // ===== Total =====

    #[test]
    fn weighted_total_orders_good_above_bad() {
        let config = Config::default();
        let persona = PersonaProfile::default();
        let weights = ScoreWeights::default();
        let f = frame("今天要不要看电影？");
        let inp = input(&config, &f, &persona, &weights);

        let good = score_candidate(&bubbles(&["可以呀，今天就看电影。"]), 0.85, &inp);
        let bad = score_candidate(&bubbles(&["我突然想吃火锅，先不聊这个。"]), 0.2, &inp);
        assert!(good.total > bad.total);
    }
}
