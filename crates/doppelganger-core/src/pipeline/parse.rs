//! Defense-in-depth parsing of model output into candidate bubble lists,
//! plus bubble sanitation and the hard filter.
//!
//! All length limits are Unicode scalar counts, never byte counts.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::retrieval::text::{char_len, is_cjk};

/// Soft cap applied during sanitation; longer bubbles are cut with an
/// ellipsis.
pub const BUBBLE_TRUNCATE_CHARS: usize = 44;
/// Hard cap: a bubble still longer than this after sanitation is rejected.
pub const BUBBLE_MAX_CHARS: usize = 50;
const COERCED_MAX_BUBBLES: usize = 3;

/// Strings the IM client renders as interactive controls; a model emitting
/// one verbatim has leaked UI context.
const UI_ARTIFACTS: &[&str] = &["选中", "不错", "提交", "发送", "标记"];

fn meta_artifact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)json|schema|markdown|作为ai|我作为|提示词|system prompt")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

// ===== JSON extraction =====

/// Strict parse first, then the first well-formed JSON value starting at
/// any `{` or `[` offset (models love to wrap JSON in prose or fences).
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = strip_fences(raw);
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    for (i, c) in trimmed.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&trimmed[i..]).into_iter::<Value>();
        if let Some(Ok(v)) = stream.next() {
            return Some(v);
        }
    }
    None
}

fn strip_fences(raw: &str) -> &str {
    let t = raw.trim();
    let t = t.strip_prefix("```json").or_else(|| t.strip_prefix("```")).unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

/// Candidate lists out of a parsed value. Accepted shapes:
/// `{"candidates": [{"bubbles": [...]}, ...]}`, `[{"bubbles": [...]}]`,
/// `[["b1","b2"], ...]`, or a flat `["b1","b2"]` (one candidate).
pub fn candidates_from_value(value: &Value) -> Vec<Vec<String>> {
    let list = match value {
        Value::Object(map) => match map.get("candidates") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return bubbles_of(value).map(|b| vec![b]).unwrap_or_default(),
        },
        Value::Array(items) => {
            if items.iter().all(|i| i.is_string()) {
                return bubbles_of(value).map(|b| vec![b]).unwrap_or_default();
            }
            items.as_slice()
        }
        _ => return Vec::new(),
    };
    list.iter().filter_map(bubbles_of).collect()
}

fn bubbles_of(item: &Value) -> Option<Vec<String>> {
    let arr = match item {
        Value::Object(map) => map.get("bubbles").and_then(|b| b.as_array())?,
        Value::Array(arr) => arr,
        Value::String(s) => return Some(vec![s.clone()]),
        _ => return None,
    };
    let bubbles: Vec<String> = arr
        .iter()
        .filter_map(|b| b.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .collect();
    if bubbles.is_empty() {
        None
    } else {
        Some(bubbles)
    }
}

/// Last-resort coercion: split raw text into lines, strip list markers,
/// and treat the first few non-empty lines as one candidate.
pub fn coerce_candidates_from_text(raw: &str) -> Vec<Vec<String>> {
    let mut bubbles = Vec::new();
    for line in raw.lines() {
        let line = strip_list_marker(line.trim());
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        let bubble: String = if char_len(line) > BUBBLE_TRUNCATE_CHARS {
            let head: String = line.chars().take(BUBBLE_TRUNCATE_CHARS).collect();
            format!("{head}…")
        } else {
            line.to_string()
        };
        bubbles.push(bubble);
        if bubbles.len() >= COERCED_MAX_BUBBLES {
            break;
        }
    }
    if bubbles.is_empty() {
        Vec::new()
    } else {
        vec![bubbles]
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line
        .trim_start_matches(['-', '*', '•'])
        .trim_start();
    // "1. " / "2、" / "3) " style prefixes
    let mut chars = line.char_indices();
    let mut cut = 0;
    for (i, c) in chars.by_ref() {
        if c.is_ascii_digit() {
            cut = i + c.len_utf8();
        } else {
            if cut > 0 && (c == '.' || c == '、' || c == ')' || c == '）') {
                cut = i + c.len_utf8();
            } else if cut == 0 {
                return line;
            }
            break;
        }
    }
    line[cut..].trim_start()
}

// ===== Sanitation =====

/// Clean one bubble: nbsp to space, forbidden nicknames stripped, runs of
/// whitespace collapsed, runs of the same punctuation capped at two, then
/// the soft length cut.
pub fn sanitize_bubble(raw: &str, forbidden: &[&str]) -> String {
    let mut s = raw.replace('\u{a0}', " ");
    for nick in forbidden {
        if !nick.is_empty() {
            s = s.replace(nick, "");
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut prev: Option<char> = None;
    let mut run = 0usize;
    for c in s.chars() {
        if c.is_whitespace() {
            if prev.map(|p| p.is_whitespace()).unwrap_or(true) {
                prev = Some(' ');
                continue;
            }
            out.push(' ');
            prev = Some(' ');
            run = 0;
            continue;
        }
        let is_punct = c.is_ascii_punctuation() || "！？。，～…、；：".contains(c);
        if is_punct && prev == Some(c) {
            run += 1;
            if run >= 2 {
                continue;
            }
        } else {
            run = 0;
        }
        out.push(c);
        prev = Some(c);
    }
    let out = out.trim().to_string();

    if char_len(&out) > BUBBLE_TRUNCATE_CHARS {
        let head: String = out.chars().take(BUBBLE_TRUNCATE_CHARS).collect();
        format!("{head}…")
    } else {
        out
    }
}

// ===== Hard filter =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Blank,
    UiArtifact,
    MetaLeak,
    ForbiddenNickname,
    TooLong,
    NoContent,
}

/// Hard rejection check over a whole candidate. `None` means it survives.
pub fn reject_candidate(bubbles: &[String], forbidden: &[&str]) -> Option<RejectReason> {
    if bubbles.is_empty() {
        return Some(RejectReason::Blank);
    }
    let mut any_content = false;
    for bubble in bubbles {
        let b = bubble.trim();
        if b.is_empty() {
            return Some(RejectReason::Blank);
        }
        if UI_ARTIFACTS.contains(&b) {
            return Some(RejectReason::UiArtifact);
        }
        if meta_artifact_re().is_match(b) {
            return Some(RejectReason::MetaLeak);
        }
        if forbidden.iter().any(|n| !n.is_empty() && b.contains(n)) {
            return Some(RejectReason::ForbiddenNickname);
        }
        if char_len(b) > BUBBLE_MAX_CHARS {
            return Some(RejectReason::TooLong);
        }
        if b.chars().any(|c| c.is_alphanumeric() || is_cjk(c)) {
            any_content = true;
        }
    }
    if !any_content {
        return Some(RejectReason::NoContent);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ===== JSON extraction =====

    #[test]
    fn strict_json_parses() {
        let v = extract_json(r#"{"candidates": []}"#).unwrap();
        assert!(v.get("candidates").is_some());
    }

    #[test]
    fn fenced_json_parses() {
        let v = extract_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn embedded_json_found_at_offset() {
        let v = extract_json("好的，这是结果：{\"candidates\": [[\"嗯\"]]} 希望有帮助").unwrap();
        let c = candidates_from_value(&v);
        assert_eq!(c, vec![vec!["嗯".to_string()]]);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("完全不是 JSON 的内容").is_none());
    }

    #[test]
    fn candidates_shapes() {
        let obj = json!({"candidates": [{"bubbles": ["a", "b"]}, {"bubbles": ["c"]}]});
        assert_eq!(candidates_from_value(&obj).len(), 2);

        let arrs = json!([["a"], ["b", "c"]]);
        assert_eq!(candidates_from_value(&arrs).len(), 2);

        let flat = json!(["只有一条"]);
        assert_eq!(candidates_from_value(&flat), vec![vec!["只有一条".to_string()]]);
    }

    // ===== Coercion =====

    #[test]
    fn coercion_strips_markers_and_caps() {
        let raw = "1. 今天不想出门\n- 在家躺着呢\n* 你呢\n第四行不要";
        let c = coerce_candidates_from_text(raw);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0], vec!["今天不想出门", "在家躺着呢", "你呢"]);
    }

    #[test]
    fn coercion_truncates_long_lines_by_chars() {
        let raw = "好".repeat(60);
        let c = coerce_candidates_from_text(&raw);
        assert_eq!(char_len(&c[0][0]), BUBBLE_TRUNCATE_CHARS + 1);
        assert!(c[0][0].ends_with('…'));
    }

    #[test]
    fn coercion_of_empty_text_is_empty() {
        assert!(coerce_candidates_from_text("\n\n").is_empty());
    }

    // ===== Sanitation =====

    #[test]
    fn sanitize_strips_nickname_and_collapses() {
        let out = sanitize_bubble("宝宝  在吗！！！！", &["宝宝"]);
        assert_eq!(out, "在吗！！");
    }

    #[test]
    fn sanitize_handles_nbsp() {
        assert_eq!(sanitize_bubble("你\u{a0}好", &[]), "你 好");
    }

    #[test]
    fn sanitize_truncates_at_44_chars() {
        let long = "啊".repeat(60);
        let out = sanitize_bubble(&long, &[]);
        assert_eq!(char_len(&out), BUBBLE_TRUNCATE_CHARS + 1);
    }

    // ===== Hard filter =====

    #[test]
    fn filter_rejects_each_reason() {
        let f: &[&str] = &["宝宝"];
        assert_eq!(reject_candidate(&[], f), Some(RejectReason::Blank));
        assert_eq!(
            reject_candidate(&["  ".to_string()], f),
            Some(RejectReason::Blank)
        );
        assert_eq!(
            reject_candidate(&["提交".to_string()], f),
            Some(RejectReason::UiArtifact)
        );
        assert_eq!(
            reject_candidate(&["我作为助手不能回答".to_string()], f),
            Some(RejectReason::MetaLeak)
        );
        assert_eq!(
            reject_candidate(&["宝宝早".to_string()], f),
            Some(RejectReason::ForbiddenNickname)
        );
        assert_eq!(
            reject_candidate(&["啊".repeat(51)], f),
            Some(RejectReason::TooLong)
        );
        assert_eq!(
            reject_candidate(&["！！？".to_string()], f),
            Some(RejectReason::NoContent)
        );
        assert_eq!(reject_candidate(&["今晚可以".to_string()], f), None);
    }

    #[test]
    fn meta_leak_is_case_insensitive() {
        assert_eq!(
            reject_candidate(&["这是 JSON 格式".to_string()], &[]),
            Some(RejectReason::MetaLeak)
        );
    }
}
