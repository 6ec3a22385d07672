//! Row types and SQL schema for the segment/message/profile store.

use serde::{Deserialize, Serialize};

/// Identifier partitioning all data and scoring by which individual's style
/// is being reproduced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonaKey(String);

impl PersonaKey {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into().trim().to_string();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PersonaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonaKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// An immutable window of conversation lines anchored on one historical
/// user message. Created during ingestion, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub persona_key: PersonaKey,
    pub anchor_id: i64,
    pub anchor_text: String,
    pub segment_text: String,
    pub start_msg_id: i64,
    pub end_msg_id: i64,
    pub anchor_timestamp_unix: Option<i64>,
    pub line_count: i64,
}

/// One historical conversation line inside a segment window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentLine {
    pub id: i64,
    pub role: String,
    pub sender: String,
    pub content: String,
    pub timestamp_raw: String,
}

/// One line of the live (online) conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// A versioned profile payload row (style / preference / persona).
#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub payload: serde_json::Value,
    pub version: i64,
    pub updated_at: String,
}

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS baseline_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id INTEGER,
    sender TEXT NOT NULL,
    msg_type TEXT,
    timestamp_raw TEXT,
    timestamp_unix INTEGER,
    persona_key TEXT NOT NULL DEFAULT 'dxa',
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    is_garbled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_baseline_persona ON baseline_messages(persona_key);
CREATE INDEX IF NOT EXISTS idx_baseline_ts ON baseline_messages(timestamp_unix);

CREATE TABLE IF NOT EXISTS baseline_segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    anchor_user_id INTEGER NOT NULL UNIQUE,
    persona_key TEXT NOT NULL DEFAULT 'dxa',
    anchor_text TEXT NOT NULL,
    segment_text TEXT NOT NULL,
    start_msg_id INTEGER NOT NULL,
    end_msg_id INTEGER NOT NULL,
    anchor_timestamp_unix INTEGER,
    line_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY(anchor_user_id) REFERENCES baseline_messages(id)
);

CREATE INDEX IF NOT EXISTS idx_segments_persona ON baseline_segments(persona_key);
CREATE INDEX IF NOT EXISTS idx_segments_anchor_ts ON baseline_segments(anchor_timestamp_unix);

CREATE TABLE IF NOT EXISTS segment_embeddings (
    segment_id INTEGER PRIMARY KEY,
    persona_key TEXT NOT NULL DEFAULT 'dxa',
    model TEXT NOT NULL,
    dim INTEGER NOT NULL,
    text_source TEXT NOT NULL DEFAULT 'anchor_text',
    vector_blob BLOB NOT NULL,
    norm REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(segment_id) REFERENCES baseline_segments(id)
);

CREATE INDEX IF NOT EXISTS idx_segment_embeddings_model_dim ON segment_embeddings(model, dim);
CREATE INDEX IF NOT EXISTS idx_segment_embeddings_persona ON segment_embeddings(persona_key);

CREATE TABLE IF NOT EXISTS online_conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    feedback_score INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_online_conv ON online_conversations(conversation_id, id);
CREATE INDEX IF NOT EXISTS idx_online_created ON online_conversations(created_at);

CREATE TABLE IF NOT EXISTS profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_type TEXT NOT NULL UNIQUE,
    payload_json TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS persona_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_key TEXT NOT NULL UNIQUE,
    payload_json TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS baseline_segments_fts
USING fts5(anchor_text, segment_text, content='baseline_segments', content_rowid='id');

CREATE VIRTUAL TABLE IF NOT EXISTS online_conversations_fts
USING fts5(content, role, conversation_id, content='online_conversations', content_rowid='id');

CREATE TRIGGER IF NOT EXISTS seg_ai AFTER INSERT ON baseline_segments BEGIN
  INSERT INTO baseline_segments_fts(rowid, anchor_text, segment_text)
  VALUES (new.id, new.anchor_text, new.segment_text);
END;
CREATE TRIGGER IF NOT EXISTS seg_ad AFTER DELETE ON baseline_segments BEGIN
  INSERT INTO baseline_segments_fts(baseline_segments_fts, rowid, anchor_text, segment_text)
  VALUES('delete', old.id, old.anchor_text, old.segment_text);
END;

CREATE TRIGGER IF NOT EXISTS online_ai AFTER INSERT ON online_conversations BEGIN
  INSERT INTO online_conversations_fts(rowid, content, role, conversation_id)
  VALUES (new.id, new.content, new.role, new.conversation_id);
END;
CREATE TRIGGER IF NOT EXISTS online_ad AFTER DELETE ON online_conversations BEGIN
  INSERT INTO online_conversations_fts(online_conversations_fts, rowid, content, role, conversation_id)
  VALUES('delete', old.id, old.content, old.role, old.conversation_id);
END;
"#;
