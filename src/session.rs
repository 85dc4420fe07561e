//! Durable log of generation runs: one session row plus one ordered response
//! row per output. Append-only; failures are the caller's to log, never to
//! surface.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Types
// =============================================================================

/// One recorded generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub response_count: i64,
    pub scenario_summary: String,
    pub algorithm_used: String,
    pub group_id: Option<String>,
    pub created_at: i64,
}

/// One response row, ordered by final display position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub session_id: Uuid,
    pub display_order: i64,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub content: String,
}

/// Input for [`SessionRecorder::record`]: a pre-minted session id and the
/// responses in display order.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub scenario_summary: String,
    pub algorithm_used: String,
    pub group_id: Option<String>,
    pub responses: Vec<NewResponse>,
}

#[derive(Debug, Clone)]
pub struct NewResponse {
    /// `"{provider}/{model}"` output identity.
    pub identity: String,
    pub system_prompt: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("recorder lock poisoned")]
    Poisoned,
    #[error("malformed output identity: {0:?}")]
    MalformedIdentity(String),
    #[error("corrupt session row: {0}")]
    Corrupt(String),
}

/// Split an output identity into (provider, model) at the first `/`.
///
/// Routed model ids keep their own slashes: `"openrouter/anthropic/claude-x"`
/// splits into `("openrouter", "anthropic/claude-x")`.
fn split_identity(identity: &str) -> Result<(&str, &str), RecordError> {
    match identity.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(RecordError::MalformedIdentity(identity.to_string())),
    }
}

// =============================================================================
// Recorder
// =============================================================================

#[derive(Clone)]
pub struct SessionRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl SessionRecorder {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, RecordError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RecordError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS sessions (\
               id TEXT PRIMARY KEY,\
               response_count INTEGER NOT NULL,\
               scenario_summary TEXT NOT NULL,\
               algorithm_used TEXT NOT NULL,\
               group_id TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS responses (\
               session_id TEXT NOT NULL REFERENCES sessions(id),\
               display_order INTEGER NOT NULL,\
               provider TEXT NOT NULL,\
               model TEXT NOT NULL,\
               system_prompt TEXT NOT NULL,\
               content TEXT NOT NULL,\
               PRIMARY KEY (session_id, display_order)\
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Write one session and its responses in a single transaction.
    ///
    /// A malformed identity aborts the whole write; nothing partial is left
    /// behind.
    pub async fn record(&self, session: NewSession) -> Result<(), RecordError> {
        // Validate identities before touching the database.
        let mut rows = Vec::with_capacity(session.responses.len());
        for (order, response) in session.responses.iter().enumerate() {
            let (provider, model) = split_identity(&response.identity)?;
            rows.push((
                order as i64,
                provider.to_string(),
                model.to_string(),
                response.system_prompt.clone(),
                response.content.clone(),
            ));
        }

        let conn = self.conn.lock().map_err(|_| RecordError::Poisoned)?;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        let result = (|| -> Result<(), rusqlite::Error> {
            conn.execute(
                "INSERT INTO sessions \
                 (id, response_count, scenario_summary, algorithm_used, group_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id.to_string(),
                    session.responses.len() as i64,
                    session.scenario_summary,
                    session.algorithm_used,
                    session.group_id,
                    now_epoch(),
                ],
            )?;
            for (order, provider, model, system_prompt, content) in &rows {
                conn.execute(
                    "INSERT INTO responses \
                     (session_id, display_order, provider, model, system_prompt, content) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        session.id.to_string(),
                        order,
                        provider,
                        model,
                        system_prompt,
                        content
                    ],
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT;")?;
                Ok(())
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK;").ok();
                Err(e.into())
            }
        }
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>, RecordError> {
        let conn = self.conn.lock().map_err(|_| RecordError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, response_count, scenario_summary, algorithm_used, group_id, created_at \
             FROM sessions ORDER BY created_at DESC LIMIT ?1",
        )?;
        let sessions = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        sessions
            .into_iter()
            .map(|(id, response_count, scenario_summary, algorithm_used, group_id, created_at)| {
                let id = Uuid::parse_str(&id).map_err(|_| RecordError::Corrupt(id.clone()))?;
                Ok(Session {
                    id,
                    response_count,
                    scenario_summary,
                    algorithm_used,
                    group_id,
                    created_at,
                })
            })
            .collect()
    }

    pub async fn session_responses(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ResponseRecord>, RecordError> {
        let conn = self.conn.lock().map_err(|_| RecordError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT display_order, provider, model, system_prompt, content \
             FROM responses WHERE session_id = ?1 ORDER BY display_order",
        )?;
        let rows = stmt
            .query_map(params![session_id.to_string()], |row| {
                Ok(ResponseRecord {
                    session_id,
                    display_order: row.get(0)?,
                    provider: row.get(1)?,
                    model: row.get(2)?,
                    system_prompt: row.get(3)?,
                    content: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(responses: Vec<NewResponse>) -> NewSession {
        NewSession {
            id: Uuid::new_v4(),
            scenario_summary: "draft a reply".into(),
            algorithm_used: "unique_model".into(),
            group_id: Some("batch-1".into()),
            responses,
        }
    }

    fn response(identity: &str) -> NewResponse {
        NewResponse {
            identity: identity.into(),
            system_prompt: "be helpful".into(),
            content: "hello".into(),
        }
    }

    #[tokio::test]
    async fn record_round_trips_session_and_responses() {
        let recorder = SessionRecorder::in_memory().unwrap();
        let session = new_session(vec![
            response("openai/gpt-4o"),
            response("openrouter/anthropic/claude-3-5-haiku"),
        ]);
        let id = session.id;
        recorder.record(session).await.unwrap();

        let sessions = recorder.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].response_count, 2);
        assert_eq!(sessions[0].group_id.as_deref(), Some("batch-1"));

        let rows = recorder.session_responses(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].display_order, 0);
        assert_eq!(rows[0].provider, "openai");
        assert_eq!(rows[0].model, "gpt-4o");
        // Routed ids keep their own slashes in the model column.
        assert_eq!(rows[1].provider, "openrouter");
        assert_eq!(rows[1].model, "anthropic/claude-3-5-haiku");
    }

    #[tokio::test]
    async fn malformed_identity_aborts_whole_write() {
        let recorder = SessionRecorder::in_memory().unwrap();
        let session = new_session(vec![response("openai/gpt-4o"), response("no-slash-here")]);
        let err = recorder.record(session).await.unwrap_err();
        assert!(matches!(err, RecordError::MalformedIdentity(_)));

        assert!(recorder.list_sessions(10).await.unwrap().is_empty());
    }

    #[test]
    fn split_identity_rejects_empty_parts() {
        assert!(split_identity("/gpt-4o").is_err());
        assert!(split_identity("openai/").is_err());
        assert!(split_identity("").is_err());
    }
}
