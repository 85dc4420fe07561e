//! SQLite-backed registry of assistants, system prompts, and runtime settings.
//!
//! The orchestrator reads an immutable [`RegistrySnapshot`] per request and
//! never writes back; writes happen through admin/bootstrap paths only.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::ModelBinding;
use crate::selector::SelectionAlgorithm;

// =============================================================================
// Types
// =============================================================================

/// What an assistant is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantRole {
    OutputGeneration,
    Evaluation,
}

impl AssistantRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::OutputGeneration => "output_generation",
            Self::Evaluation => "evaluation",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "evaluation" => Self::Evaluation,
            _ => Self::OutputGeneration,
        }
    }
}

/// A configured assistant: a role, candidate model bindings, a system prompt,
/// and an active flag.
///
/// `active` means "required to show" for generation assistants, and "the one
/// usable judge" for evaluation assistants. At most one evaluation assistant
/// is active system-wide; [`AssistantStore::upsert_assistant`] enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: Uuid,
    pub name: String,
    pub role: AssistantRole,
    pub candidate_models: Vec<ModelBinding>,
    pub system_prompt_id: Uuid,
    pub active: bool,
    pub updated_at: i64,
}

/// Immutable prompt text, referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: Uuid,
    pub text: String,
}

/// The three stored run-time settings, defaulted when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub num_outputs: usize,
    pub num_outputs_to_show: usize,
    pub selection_algorithm: SelectionAlgorithm,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            num_outputs: 3,
            num_outputs_to_show: 3,
            selection_algorithm: SelectionAlgorithm::RandomSelection,
        }
    }
}

pub const SETTING_NUM_OUTPUTS: &str = "desired_output_count";
pub const SETTING_NUM_OUTPUTS_TO_SHOW: &str = "shown_output_count";
pub const SETTING_SELECTION_ALGORITHM: &str = "selection_algorithm";

/// Read-only view of the registry for the duration of one request.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub assistants: Vec<Assistant>,
    prompts: HashMap<Uuid, String>,
}

impl RegistrySnapshot {
    /// Assemble a snapshot directly; tests and one-shot tools use this to
    /// avoid a backing store.
    pub fn new(assistants: Vec<Assistant>, prompts: Vec<SystemPrompt>) -> Self {
        Self {
            assistants,
            prompts: prompts.into_iter().map(|p| (p.id, p.text)).collect(),
        }
    }

    pub fn generation_assistants(&self) -> impl Iterator<Item = &Assistant> {
        self.assistants
            .iter()
            .filter(|a| a.role == AssistantRole::OutputGeneration)
    }

    /// The single active evaluation assistant, if one is configured.
    pub fn active_evaluator(&self) -> Option<&Assistant> {
        self.assistants
            .iter()
            .find(|a| a.role == AssistantRole::Evaluation && a.active)
    }

    pub fn prompt_text(&self, id: Uuid) -> Option<&str> {
        self.prompts.get(&id).map(|s| s.as_str())
    }
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct AssistantStore {
    conn: Arc<Mutex<Connection>>,
}

impl AssistantStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS assistants (\
               id TEXT PRIMARY KEY,\
               name TEXT NOT NULL,\
               role TEXT NOT NULL,\
               candidate_models TEXT NOT NULL,\
               system_prompt_id TEXT NOT NULL,\
               active INTEGER NOT NULL DEFAULT 0,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS system_prompts (\
               id TEXT PRIMARY KEY,\
               text TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS settings (\
               key TEXT PRIMARY KEY,\
               value TEXT NOT NULL\
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace an assistant.
    ///
    /// Activating an evaluation assistant deactivates any other active
    /// evaluation assistant in the same transaction.
    pub async fn upsert_assistant(&self, assistant: &Assistant) -> Result<(), StoreError> {
        let models = serde_json::to_string(&assistant.candidate_models)
            .map_err(|e| StoreError::Serde(e.to_string()))?;

        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx_now = now_epoch();

        conn.execute_batch("BEGIN IMMEDIATE;")?;
        let result = (|| -> Result<(), rusqlite::Error> {
            if assistant.role == AssistantRole::Evaluation && assistant.active {
                conn.execute(
                    "UPDATE assistants SET active = 0, updated_at = ?1 \
                     WHERE role = 'evaluation' AND active = 1 AND id != ?2",
                    params![tx_now, assistant.id.to_string()],
                )?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO assistants \
                 (id, name, role, candidate_models, system_prompt_id, active, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    assistant.id.to_string(),
                    assistant.name,
                    assistant.role.as_str(),
                    models,
                    assistant.system_prompt_id.to_string(),
                    assistant.active as i64,
                    assistant.updated_at,
                ],
            )?;
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

    pub async fn upsert_system_prompt(&self, prompt: &SystemPrompt) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO system_prompts (id, text) VALUES (?1, ?2)",
            params![prompt.id.to_string(), prompt.text],
        )?;
        Ok(())
    }

    /// Read the full registry as an immutable per-request view.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        let mut stmt = conn.prepare(
            "SELECT id, name, role, candidate_models, system_prompt_id, active, updated_at \
             FROM assistants ORDER BY name",
        )?;
        let assistants = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let role: String = row.get(2)?;
                let models: String = row.get(3)?;
                let prompt_id: String = row.get(4)?;
                Ok((
                    id,
                    row.get::<_, String>(1)?,
                    role,
                    models,
                    prompt_id,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut parsed = Vec::with_capacity(assistants.len());
        for (id, name, role, models, prompt_id, active, updated_at) in assistants {
            let id = Uuid::parse_str(&id).map_err(|e| StoreError::Serde(e.to_string()))?;
            let system_prompt_id =
                Uuid::parse_str(&prompt_id).map_err(|e| StoreError::Serde(e.to_string()))?;
            let candidate_models: Vec<ModelBinding> =
                serde_json::from_str(&models).map_err(|e| StoreError::Serde(e.to_string()))?;
            parsed.push(Assistant {
                id,
                name,
                role: AssistantRole::from_str(&role),
                candidate_models,
                system_prompt_id,
                active: active != 0,
                updated_at,
            });
        }

        let mut stmt = conn.prepare("SELECT id, text FROM system_prompts")?;
        let prompts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut prompt_map = HashMap::with_capacity(prompts.len());
        for (id, text) in prompts {
            let id = Uuid::parse_str(&id).map_err(|e| StoreError::Serde(e.to_string()))?;
            prompt_map.insert(id, text);
        }

        Ok(RegistrySnapshot {
            assistants: parsed,
            prompts: prompt_map,
        })
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read the runtime settings, falling back to defaults for absent or
    /// unparseable values.
    pub async fn settings(&self) -> Result<RuntimeSettings, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let defaults = RuntimeSettings::default();

        let get = |key: &str| -> Result<Option<String>, rusqlite::Error> {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        };

        let num_outputs = get(SETTING_NUM_OUTPUTS)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.num_outputs);
        let num_outputs_to_show = get(SETTING_NUM_OUTPUTS_TO_SHOW)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.num_outputs_to_show);
        let selection_algorithm = get(SETTING_SELECTION_ALGORITHM)?
            .and_then(|v| SelectionAlgorithm::parse(&v))
            .unwrap_or(defaults.selection_algorithm);

        Ok(RuntimeSettings {
            num_outputs,
            num_outputs_to_show,
            selection_algorithm,
        })
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convenience constructor used by the seeding CLI and tests.
pub fn new_assistant(
    name: impl Into<String>,
    role: AssistantRole,
    candidate_models: Vec<ModelBinding>,
    system_prompt_id: Uuid,
    active: bool,
) -> Assistant {
    Assistant {
        id: Uuid::new_v4(),
        name: name.into(),
        role,
        candidate_models,
        system_prompt_id,
        active,
        updated_at: now_epoch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Provider;

    fn prompt() -> SystemPrompt {
        SystemPrompt {
            id: Uuid::new_v4(),
            text: "You are helpful.".into(),
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_assistants() {
        let store = AssistantStore::in_memory().unwrap();
        let p = prompt();
        store.upsert_system_prompt(&p).await.unwrap();

        let a = new_assistant(
            "writer",
            AssistantRole::OutputGeneration,
            vec![ModelBinding::new(Provider::OpenAi, "gpt-4o")],
            p.id,
            true,
        );
        store.upsert_assistant(&a).await.unwrap();

        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.assistants.len(), 1);
        assert_eq!(snap.assistants[0].name, "writer");
        assert_eq!(snap.assistants[0].candidate_models[0].model_id, "gpt-4o");
        assert_eq!(snap.prompt_text(p.id), Some("You are helpful."));
    }

    #[tokio::test]
    async fn activating_second_evaluator_deactivates_first() {
        let store = AssistantStore::in_memory().unwrap();
        let p = prompt();
        store.upsert_system_prompt(&p).await.unwrap();

        let judge_a = new_assistant(
            "judge-a",
            AssistantRole::Evaluation,
            vec![ModelBinding::new(Provider::Anthropic, "claude-3-5-sonnet-20241022")],
            p.id,
            true,
        );
        let judge_b = new_assistant(
            "judge-b",
            AssistantRole::Evaluation,
            vec![ModelBinding::new(Provider::OpenAi, "gpt-4o")],
            p.id,
            true,
        );
        store.upsert_assistant(&judge_a).await.unwrap();
        store.upsert_assistant(&judge_b).await.unwrap();

        let snap = store.snapshot().await.unwrap();
        let active: Vec<_> = snap
            .assistants
            .iter()
            .filter(|a| a.role == AssistantRole::Evaluation && a.active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "judge-b");
        assert_eq!(snap.active_evaluator().unwrap().name, "judge-b");
    }

    #[tokio::test]
    async fn settings_default_when_absent() {
        let store = AssistantStore::in_memory().unwrap();
        let settings = store.settings().await.unwrap();
        assert_eq!(settings, RuntimeSettings::default());
    }

    #[tokio::test]
    async fn settings_read_back_after_set() {
        let store = AssistantStore::in_memory().unwrap();
        store.set_setting(SETTING_NUM_OUTPUTS, "5").await.unwrap();
        store
            .set_setting(SETTING_SELECTION_ALGORITHM, "unique_model")
            .await
            .unwrap();

        let settings = store.settings().await.unwrap();
        assert_eq!(settings.num_outputs, 5);
        assert_eq!(
            settings.selection_algorithm,
            SelectionAlgorithm::UniqueModel
        );
        // Untouched key keeps its default.
        assert_eq!(settings.num_outputs_to_show, 3);
    }
}
