//! Persona profile payloads and the TTL read cache.
//!
//! Profiles are written by the feedback/evolution side of the service; this
//! core only reads them. A payload may carry a `core`/`adaptive` split where
//! adaptive fields (learned from recent feedback) override the stable core.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::store::{ChatStore, PersonaKey};

fn default_avg_len() -> f64 {
    12.0
}
fn default_short_ratio() -> f64 {
    0.6
}
fn default_laugh_ratio() -> f64 {
    0.3
}
fn default_tone() -> String {
    "随意".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechStyle {
    #[serde(default = "default_avg_len")]
    pub avg_len: f64,
    #[serde(default = "default_short_ratio")]
    pub short_ratio: f64,
    #[serde(default = "default_laugh_ratio")]
    pub laugh_ratio: f64,
    #[serde(default = "default_tone")]
    pub tone: String,
}

impl Default for SpeechStyle {
    fn default() -> Self {
        Self {
            avg_len: default_avg_len(),
            short_ratio: default_short_ratio(),
            laugh_ratio: default_laugh_ratio(),
            tone: default_tone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub forbidden_nicknames: Vec<String>,
}

/// Normalized persona profile as the pipeline consumes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaProfile {
    #[serde(default)]
    pub speech_style: SpeechStyle,
    #[serde(default)]
    pub relationship: Relationship,
    #[serde(default)]
    pub top_phrases: Vec<String>,
}

impl PersonaProfile {
    /// Flatten a stored payload: start from `core`, overlay `adaptive`,
    /// else take the payload as-is.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let merged = match (payload.get("core"), payload.get("adaptive")) {
            (Some(core), adaptive) => {
                let mut base = core.clone();
                if let (Some(serde_json::Value::Object(over)), serde_json::Value::Object(b)) =
                    (adaptive, &mut base)
                {
                    for (k, v) in over {
                        b.insert(k.clone(), v.clone());
                    }
                }
                base
            }
            _ => payload.clone(),
        };
        match serde_json::from_value(merged) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(error = %err, "malformed persona payload, using defaults");
                Self::default()
            }
        }
    }

    /// Effective nickname, falling back to the configured strict nickname.
    pub fn nickname<'a>(&'a self, config: &'a Config) -> &'a str {
        if self.relationship.nickname.trim().is_empty() {
            &config.strict_nickname
        } else {
            self.relationship.nickname.trim()
        }
    }

    /// Forbidden nicknames: configured list plus profile additions.
    pub fn forbidden<'a>(&'a self, config: &'a Config) -> Vec<&'a str> {
        let mut out: Vec<&str> = config.forbidden_nicknames.iter().map(|s| s.as_str()).collect();
        for n in &self.relationship.forbidden_nicknames {
            let n = n.trim();
            if !n.is_empty() && !out.contains(&n) {
                out.push(n);
            }
        }
        out
    }

    /// One-paragraph Chinese brief injected into prompts.
    pub fn brief(&self, config: &Config) -> String {
        let mut parts = vec![format!(
            "语气{}，平均每条{}字左右，短句占比约{}成",
            self.speech_style.tone,
            self.speech_style.avg_len.round() as i64,
            (self.speech_style.short_ratio * 10.0).round() as i64,
        )];
        if self.speech_style.laugh_ratio >= 0.25 {
            parts.push("经常用哈哈等笑的表达".to_string());
        }
        if !self.top_phrases.is_empty() {
            let sample: Vec<&str> = self.top_phrases.iter().take(5).map(|s| s.as_str()).collect();
            parts.push(format!("常用口头禅：{}", sample.join("、")));
        }
        parts.push(format!("对对方的称呼只用「{}」", self.nickname(config)));
        parts.join("；")
    }
}

/// Preference-profile scoring weights. This is the single knob surface
/// through which per-persona configuration shifts the pipeline trade-offs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "ScoreWeights::d_semantic")]
    pub semantic: f64,
    #[serde(default = "ScoreWeights::d_style")]
    pub style: f64,
    #[serde(default = "ScoreWeights::d_relation")]
    pub relation: f64,
    #[serde(default = "ScoreWeights::d_recency")]
    pub recency: f64,
    #[serde(default = "ScoreWeights::d_online_memory")]
    pub online_memory: f64,
}

impl ScoreWeights {
    fn d_semantic() -> f64 {
        0.30
    }
    fn d_style() -> f64 {
        0.20
    }
    fn d_relation() -> f64 {
        0.20
    }
    fn d_recency() -> f64 {
        0.15
    }
    fn d_online_memory() -> f64 {
        0.15
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: Self::d_semantic(),
            style: Self::d_style(),
            relation: Self::d_relation(),
            recency: Self::d_recency(),
            online_memory: Self::d_online_memory(),
        }
    }
}

/// TTL cache over persona profiles and preference weights. Serves stale
/// entries until expiry to keep profile reads off the request path.
pub struct PersonaCache {
    profiles: Cache<String, Arc<PersonaProfile>>,
    weights: Cache<String, Arc<ScoreWeights>>,
}

impl PersonaCache {
    pub fn new(ttl_sec: u64) -> Self {
        let ttl = Duration::from_secs(ttl_sec.max(1));
        Self {
            profiles: Cache::builder().max_capacity(256).time_to_live(ttl).build(),
            weights: Cache::builder().max_capacity(256).time_to_live(ttl).build(),
        }
    }

    pub fn profile(&self, store: &ChatStore, persona: &PersonaKey) -> Result<Arc<PersonaProfile>> {
        if let Some(hit) = self.profiles.get(persona.as_str()) {
            return Ok(hit);
        }
        let profile = match store.profiles.get_persona_profile(persona.as_str())? {
            Some(row) => PersonaProfile::from_payload(&row.payload),
            None => {
                debug!(persona = %persona, "no persona profile, using defaults");
                PersonaProfile::default()
            }
        };
        let profile = Arc::new(profile);
        self.profiles.insert(persona.as_str().to_string(), Arc::clone(&profile));
        Ok(profile)
    }

    pub fn weights(&self, store: &ChatStore, persona: &PersonaKey) -> Result<Arc<ScoreWeights>> {
        if let Some(hit) = self.weights.get(persona.as_str()) {
            return Ok(hit);
        }
        let weights = match store.profiles.get_profile("preference")? {
            Some(row) => {
                let scoped = row
                    .payload
                    .get(persona.as_str())
                    .or_else(|| row.payload.get("weights"))
                    .cloned()
                    .unwrap_or(row.payload);
                serde_json::from_value(scoped).unwrap_or_default()
            }
            None => ScoreWeights::default(),
        };
        let weights = Arc::new(weights);
        self.weights.insert(persona.as_str().to_string(), Arc::clone(&weights));
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adaptive_overlays_core() {
        let payload = json!({
            "core": {
                "speech_style": {"avg_len": 10.0, "tone": "冷淡"},
                "top_phrases": ["好呀"],
            },
            "adaptive": {
                "speech_style": {"avg_len": 16.0, "tone": "热情"},
            },
        });
        let p = PersonaProfile::from_payload(&payload);
        assert_eq!(p.speech_style.avg_len, 16.0);
        assert_eq!(p.speech_style.tone, "热情");
        // Adaptive replaced the whole object, core-only keys elsewhere stay.
        assert_eq!(p.top_phrases, vec!["好呀".to_string()]);
    }

    #[test]
    fn flat_payload_parses_directly() {
        let payload = json!({"speech_style": {"short_ratio": 0.8}});
        let p = PersonaProfile::from_payload(&payload);
        assert_eq!(p.speech_style.short_ratio, 0.8);
        assert_eq!(p.speech_style.avg_len, 12.0);
    }

    #[test]
    fn malformed_payload_falls_back_to_defaults() {
        let p = PersonaProfile::from_payload(&json!({"speech_style": "not an object"}));
        assert_eq!(p.speech_style.avg_len, 12.0);
    }

    #[test]
    fn nickname_falls_back_to_config() {
        let config = Config::default();
        let p = PersonaProfile::default();
        assert_eq!(p.nickname(&config), "宝贝");

        let mut q = PersonaProfile::default();
        q.relationship.nickname = "小明".to_string();
        assert_eq!(q.nickname(&config), "小明");
    }

    #[test]
    fn brief_mentions_nickname_and_phrases() {
        let config = Config::default();
        let mut p = PersonaProfile::default();
        p.top_phrases = vec!["好家伙".to_string()];
        let brief = p.brief(&config);
        assert!(brief.contains("宝贝"));
        assert!(brief.contains("好家伙"));
    }

    #[test]
    fn cache_serves_inserted_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::open(dir.path().join("t.db")).unwrap();
        let persona = PersonaKey::new("dxa");
        store
            .profiles
            .upsert_persona_profile("dxa", &json!({"speech_style": {"avg_len": 9.0}}))
            .unwrap();

        let cache = PersonaCache::new(600);
        let p1 = cache.profile(&store, &persona).unwrap();
        assert_eq!(p1.speech_style.avg_len, 9.0);

        // A write inside the TTL is not observed.
        store
            .profiles
            .upsert_persona_profile("dxa", &json!({"speech_style": {"avg_len": 20.0}}))
            .unwrap();
        let p2 = cache.profile(&store, &persona).unwrap();
        assert_eq!(p2.speech_style.avg_len, 9.0);
    }
}
