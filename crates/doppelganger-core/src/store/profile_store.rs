//! Versioned JSON profile payloads (global style/preference profiles plus
//! per-persona profiles).

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::schema::ProfileRow;
use super::{now_rfc3339, SqlitePool};

#[derive(Clone)]
pub struct ProfileStore {
    pool: SqlitePool,
}

impl ProfileStore {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn get_profile(&self, profile_type: &str) -> Result<Option<ProfileRow>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT payload_json, version, updated_at FROM profiles WHERE profile_type = ?1",
                params![profile_type],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        decode_row(row)
    }

    pub fn upsert_profile(&self, profile_type: &str, payload: &serde_json::Value) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO profiles (profile_type, payload_json, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(profile_type) DO UPDATE SET
               payload_json = excluded.payload_json,
               version = profiles.version + 1,
               updated_at = excluded.updated_at",
            params![profile_type, payload.to_string(), now_rfc3339()],
        )?;
        let version: i64 = conn.query_row(
            "SELECT version FROM profiles WHERE profile_type = ?1",
            params![profile_type],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn get_persona_profile(&self, profile_key: &str) -> Result<Option<ProfileRow>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT payload_json, version, updated_at FROM persona_profiles WHERE profile_key = ?1",
                params![profile_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        decode_row(row)
    }

    pub fn upsert_persona_profile(
        &self,
        profile_key: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO persona_profiles (profile_key, payload_json, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(profile_key) DO UPDATE SET
               payload_json = excluded.payload_json,
               version = persona_profiles.version + 1,
               updated_at = excluded.updated_at",
            params![profile_key, payload.to_string(), now_rfc3339()],
        )?;
        let version: i64 = conn.query_row(
            "SELECT version FROM persona_profiles WHERE profile_key = ?1",
            params![profile_key],
            |row| row.get(0),
        )?;
        Ok(version)
    }
}

fn decode_row(row: Option<(String, i64, String)>) -> Result<Option<ProfileRow>> {
    match row {
        Some((payload_json, version, updated_at)) => {
            let payload =
                serde_json::from_str(&payload_json).context("decoding profile payload")?;
            Ok(Some(ProfileRow {
                payload,
                version,
                updated_at,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChatStore;
    use serde_json::json;

    #[test]
    fn upsert_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::open(dir.path().join("t.db")).unwrap();
        let p = &store.profiles;

        let v1 = p.upsert_persona_profile("dxa", &json!({"speech_style": {"tone": "casual"}})).unwrap();
        let v2 = p.upsert_persona_profile("dxa", &json!({"speech_style": {"tone": "dry"}})).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let row = p.get_persona_profile("dxa").unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.payload["speech_style"]["tone"], "dry");
        assert!(p.get_persona_profile("missing").unwrap().is_none());
    }
}
