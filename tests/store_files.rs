use tempfile::TempDir;
use uuid::Uuid;

use panel_harness::registry::{
    new_assistant, AssistantRole, AssistantStore, SystemPrompt, SETTING_SELECTION_ALGORITHM,
};
use panel_harness::selector::SelectionAlgorithm;
use panel_harness::session::{NewResponse, NewSession};
use panel_harness::{ModelBinding, Provider, SessionRecorder};

#[tokio::test]
async fn assistant_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("panel.db");

    {
        let store = AssistantStore::new(&db).unwrap();
        let prompt = SystemPrompt {
            id: Uuid::new_v4(),
            text: "persisted prompt".into(),
        };
        store.upsert_system_prompt(&prompt).await.unwrap();
        store
            .upsert_assistant(&new_assistant(
                "writer",
                AssistantRole::OutputGeneration,
                vec![ModelBinding::new(Provider::OpenAi, "gpt-4o")],
                prompt.id,
                true,
            ))
            .await
            .unwrap();
        store
            .set_setting(SETTING_SELECTION_ALGORITHM, "unique_model")
            .await
            .unwrap();
    }

    let reopened = AssistantStore::new(&db).unwrap();
    let snapshot = reopened.snapshot().await.unwrap();
    assert_eq!(snapshot.assistants.len(), 1);
    assert_eq!(snapshot.assistants[0].name, "writer");

    let settings = reopened.settings().await.unwrap();
    assert_eq!(
        settings.selection_algorithm,
        SelectionAlgorithm::UniqueModel
    );
}

#[tokio::test]
async fn session_recorder_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("panel.db");
    let session_id = Uuid::new_v4();

    {
        let recorder = SessionRecorder::new(&db).unwrap();
        recorder
            .record(NewSession {
                id: session_id,
                scenario_summary: "a scenario".into(),
                algorithm_used: "random_selection".into(),
                group_id: None,
                responses: vec![NewResponse {
                    identity: "openai/gpt-4o".into(),
                    system_prompt: "sp".into(),
                    content: "output".into(),
                }],
            })
            .await
            .unwrap();
    }

    let reopened = SessionRecorder::new(&db).unwrap();
    let sessions = reopened.list_sessions(5).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session_id);

    let rows = reopened.session_responses(session_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].model, "gpt-4o");
}
