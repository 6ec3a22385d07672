//! Tokenization and query-shape helpers shared by retrieval and scoring.
//!
//! Chinese chat text has no word boundaries, so the lexical channel works
//! on character n-grams (2-grams, plus 3-grams for longer runs) next to
//! plain ASCII word runs. All lengths here are Unicode scalar counts.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "的", "了", "吗", "呢", "吧", "啊", "哦", "嗯", "呀", "哈",
    "是", "我", "你", "他", "她", "它", "在", "有", "和", "与",
    "就", "都", "也", "还", "很", "不", "没", "这", "那", "个",
    "一个", "什么", "怎么", "就是", "没有", "我们", "你们", "现在",
    "the", "a", "an", "is", "are", "to", "of", "and", "or", "in",
];

const QUESTION_HINTS: &[&str] = &["吗", "么", "怎么", "为什么", "咋", "是否", "要不要", "?", "？"];

const STATUS_HINTS: &[&str] = &[
    "在忙", "刚", "正在", "准备", "去了", "回来", "到家", "吃饭",
    "上班", "下班", "开会", "睡了", "睡觉", "起床", "出门", "路上",
];

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

pub fn cjk_ngrams(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().filter(|c| is_cjk(*c)).collect();
    if chars.len() < n {
        return Vec::new();
    }
    (0..=chars.len() - n)
        .map(|i| chars[i..i + n].iter().collect())
        .collect()
}

/// Query tokens for the lexical channel and the scoring overlap heuristics:
/// ASCII word runs (lowercased, length ≥ 2) plus CJK 2-grams and, for runs
/// of three or more characters, 3-grams. Stopwords out, order-preserving
/// dedup.
pub fn keyword_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut ascii_run = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let mut flush_ascii = |run: &mut String, out: &mut Vec<String>| {
        if run.chars().count() >= 2 {
            out.push(run.to_lowercase());
        }
        run.clear();
    };
    let mut flush_cjk = |run: &mut Vec<char>, out: &mut Vec<String>| {
        let s: String = run.iter().collect();
        out.extend(cjk_ngrams(&s, 2));
        if run.len() >= 3 {
            out.extend(cjk_ngrams(&s, 3));
        }
        run.clear();
    };

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            ascii_run.push(c);
        } else if is_cjk(c) {
            flush_ascii(&mut ascii_run, &mut tokens);
            cjk_run.push(c);
        } else {
            flush_ascii(&mut ascii_run, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_ascii(&mut ascii_run, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);

    let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut seen = HashSet::new();
    tokens
        .into_iter()
        .filter(|t| !stop.contains(t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// OR-joined quoted match expression over at most 12 tokens. Empty when the
/// query yields no usable tokens.
pub fn fts_match_expr(tokens: &[String]) -> String {
    tokens
        .iter()
        .take(12)
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Substring patterns for the LIKE fallback: the query's CJK 2-grams (or
/// the lowercased ASCII words when there are none), capped at 8.
pub fn like_patterns(text: &str) -> Vec<String> {
    let mut grams = cjk_ngrams(text, 2);
    if grams.is_empty() {
        grams = keyword_tokens(text)
            .into_iter()
            .filter(|t| t.is_ascii())
            .collect();
    }
    let mut seen = HashSet::new();
    grams.retain(|g| seen.insert(g.clone()));
    grams.truncate(8);
    grams
}

/// Positional lexical score: rank 0 maps to 1.0.
pub fn lexical_score(rank: usize) -> f64 {
    1.0 / (1.0 + rank as f64)
}

/// Extra window lines for long or token-rich queries:
/// `clamp(max(chars/20, tokens/8), 0, max_extra)`.
pub fn dynamic_extra(query: &str, enabled: bool, max_extra: i64) -> i64 {
    if !enabled || max_extra <= 0 {
        return 0;
    }
    let by_len = (char_len(query) / 20) as i64;
    let by_tokens = (keyword_tokens(query).len() / 8) as i64;
    by_len.max(by_tokens).clamp(0, max_extra)
}

pub fn is_question_like(text: &str) -> bool {
    QUESTION_HINTS.iter().any(|h| text.contains(h))
}

pub fn is_status_update(text: &str) -> bool {
    !is_question_like(text) && STATUS_HINTS.iter().any(|h| text.contains(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Tokenization =====

    #[test]
    fn mixed_text_yields_ascii_words_and_cjk_grams() {
        let tokens = keyword_tokens("今天要不要看电影 movie night");
        assert!(tokens.contains(&"看电".to_string()));
        assert!(tokens.contains(&"电影".to_string()));
        assert!(tokens.contains(&"movie".to_string()));
        assert!(tokens.contains(&"night".to_string()));
    }

    #[test]
    fn stopwords_and_short_runs_are_dropped() {
        let tokens = keyword_tokens("我 的 a b");
        assert!(tokens.is_empty());
    }

    #[test]
    fn tokens_are_deduplicated_in_order() {
        let tokens = keyword_tokens("电影电影");
        let first = tokens.iter().position(|t| t == "电影");
        let last = tokens.iter().rposition(|t| t == "电影");
        assert_eq!(first, last);
    }

    #[test]
    fn long_cjk_runs_emit_trigrams() {
        let tokens = keyword_tokens("看电影院");
        assert!(tokens.contains(&"看电影".to_string()));
    }

    // ===== Match expressions =====

    #[test]
    fn match_expr_caps_at_twelve_and_quotes() {
        let tokens: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        let expr = fts_match_expr(&tokens);
        assert_eq!(expr.matches(" OR ").count(), 11);
        assert!(expr.starts_with("\"t0\""));
    }

    #[test]
    fn like_patterns_prefer_cjk_grams() {
        let p = like_patterns("看电影");
        assert_eq!(p, vec!["看电".to_string(), "电影".to_string()]);
    }

    // ===== Window and shape =====

    #[test]
    fn dynamic_extra_clamps_to_max() {
        let long: String = "今天想去看一场特别长的电影".repeat(20);
        assert_eq!(dynamic_extra(&long, true, 4), 4);
        assert_eq!(dynamic_extra(&long, false, 4), 0);
        assert_eq!(dynamic_extra("嗯", true, 4), 0);
    }

    #[test]
    fn question_and_status_detection() {
        assert!(is_question_like("今天要不要看电影？"));
        assert!(is_question_like("吃了吗"));
        assert!(!is_question_like("我刚到家"));
        assert!(is_status_update("我刚到家"));
        assert!(!is_status_update("在忙吗"));
    }

    #[test]
    fn lexical_score_decays_from_one() {
        assert_eq!(lexical_score(0), 1.0);
        assert!(lexical_score(1) < 1.0);
    }
}
