use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use panel_harness::gateway::anthropic::AnthropicClient;
use panel_harness::gateway::openai::OpenAiClient;
use panel_harness::generate::generate;
use panel_harness::registry::{Assistant, AssistantRole, RegistrySnapshot, SystemPrompt};
use panel_harness::selector::{SelectedAssistant, SelectionAlgorithm};
use panel_harness::{
    ClientRegistry, ErrorCategory, ModelBinding, Provider, Scenario, SessionRecorder,
};

fn openai_ok(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
    }))
}

fn anthropic_ok(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "content": [{ "type": "text", "text": content }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 5, "output_tokens": 9 }
    }))
}

struct Fixture {
    snapshot: RegistrySnapshot,
    selected: Vec<SelectedAssistant>,
}

fn fixture(bindings: &[(&str, Provider, &str)]) -> Fixture {
    let prompt = SystemPrompt {
        id: Uuid::new_v4(),
        text: "You are a careful writer.".into(),
    };
    let prompt_id = prompt.id;

    let assistants: Vec<Assistant> = bindings
        .iter()
        .map(|(name, provider, model)| Assistant {
            id: Uuid::new_v4(),
            name: (*name).into(),
            role: AssistantRole::OutputGeneration,
            candidate_models: vec![ModelBinding::new(*provider, *model)],
            system_prompt_id: prompt_id,
            active: true,
            updated_at: 0,
        })
        .collect();

    let selected = assistants
        .iter()
        .map(|a| SelectedAssistant {
            assistant_id: a.id,
            name: a.name.clone(),
            binding: a.candidate_models[0].clone(),
            system_prompt_id: a.system_prompt_id,
        })
        .collect();

    Fixture {
        snapshot: RegistrySnapshot::new(assistants, vec![prompt]),
        selected,
    }
}

fn scenario() -> Scenario {
    Scenario {
        id: "tc-1".into(),
        input: "Write a refund reply".into(),
        context: "Customer bought a kettle".into(),
        use_case: "freeform_chat".into(),
    }
}

#[tokio::test]
async fn one_failure_does_not_block_the_others() {
    let openai = MockServer::start().await;
    let anthropic = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(openai_ok("from openai"))
        .mount(&openai)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        })))
        .mount(&anthropic)
        .await;

    let clients = ClientRegistry::new()
        .with_client(
            Provider::OpenAi,
            Arc::new(
                OpenAiClient::with_config("sk-test", openai.uri(), Duration::from_secs(5))
                    .unwrap(),
            ),
        )
        .with_client(
            Provider::Anthropic,
            Arc::new(
                AnthropicClient::with_config("sk-test", anthropic.uri(), Duration::from_secs(5))
                    .unwrap(),
            ),
        );

    let fx = fixture(&[
        ("writer-a", Provider::OpenAi, "gpt-4o"),
        ("writer-b", Provider::Anthropic, "claude-3-5-haiku-20241022"),
    ]);

    let outcome = generate(
        &clients,
        &fx.snapshot,
        &fx.selected,
        &scenario(),
        SelectionAlgorithm::RandomSelection,
        None,
        None,
    )
    .await;

    assert_eq!(outcome.outputs.len() + outcome.errors.len(), fx.selected.len());
    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(outcome.outputs[0].identity(), "openai/gpt-4o");
    assert_eq!(outcome.outputs[0].text, "from openai");

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].assistant_name, "writer-b");
    assert_eq!(outcome.errors[0].category, ErrorCategory::ServerError);
}

#[tokio::test]
async fn missing_credential_is_an_isolated_configuration_failure() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(openai_ok("still works"))
        .mount(&openai)
        .await;

    // Only OpenAI is registered; the Google assistant has no credential.
    let clients = ClientRegistry::new().with_client(
        Provider::OpenAi,
        Arc::new(OpenAiClient::with_config("sk-test", openai.uri(), Duration::from_secs(5)).unwrap()),
    );

    let fx = fixture(&[
        ("writer-a", Provider::OpenAi, "gpt-4o"),
        ("writer-b", Provider::Google, "gemini-2.0-flash"),
    ]);

    let outcome = generate(
        &clients,
        &fx.snapshot,
        &fx.selected,
        &scenario(),
        SelectionAlgorithm::RandomSelection,
        None,
        None,
    )
    .await;

    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].category, ErrorCategory::Configuration);
    assert!(outcome.errors[0].message.contains("GOOGLE_API_KEY"));
}

#[tokio::test]
async fn declared_provider_is_corrected_before_dispatch() {
    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(anthropic_ok("routed correctly"))
        .mount(&anthropic)
        .await;

    let clients = ClientRegistry::new().with_client(
        Provider::Anthropic,
        Arc::new(
            AnthropicClient::with_config("sk-test", anthropic.uri(), Duration::from_secs(5))
                .unwrap(),
        ),
    );

    // Declared openai, but the model id is unmistakably Anthropic's.
    let fx = fixture(&[("writer", Provider::OpenAi, "claude-3-5-sonnet-20241022")]);

    let outcome = generate(
        &clients,
        &fx.snapshot,
        &fx.selected,
        &scenario(),
        SelectionAlgorithm::RandomSelection,
        None,
        None,
    )
    .await;

    assert_eq!(outcome.errors.len(), 0, "errors: {:?}", outcome.errors);
    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(outcome.outputs[0].provider, Provider::Anthropic);
    assert_eq!(
        outcome.outputs[0].identity(),
        "anthropic/claude-3-5-sonnet-20241022"
    );
}

#[tokio::test]
async fn system_prompt_reaches_the_provider() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "messages": [{ "role": "system", "content": "You are a careful writer." }]
        })))
        .respond_with(openai_ok("prompted"))
        .expect(1)
        .mount(&openai)
        .await;

    let clients = ClientRegistry::new().with_client(
        Provider::OpenAi,
        Arc::new(OpenAiClient::with_config("sk-test", openai.uri(), Duration::from_secs(5)).unwrap()),
    );

    let fx = fixture(&[("writer", Provider::OpenAi, "gpt-4o")]);
    let outcome = generate(
        &clients,
        &fx.snapshot,
        &fx.selected,
        &scenario(),
        SelectionAlgorithm::RandomSelection,
        None,
        None,
    )
    .await;

    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(outcome.outputs[0].text, "prompted");
}

#[tokio::test]
async fn sessions_are_recorded_best_effort() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(openai_ok("recorded output"))
        .mount(&openai)
        .await;

    let clients = ClientRegistry::new().with_client(
        Provider::OpenAi,
        Arc::new(OpenAiClient::with_config("sk-test", openai.uri(), Duration::from_secs(5)).unwrap()),
    );

    let fx = fixture(&[("writer", Provider::OpenAi, "gpt-4o")]);
    let recorder = SessionRecorder::in_memory().unwrap();

    let outcome = generate(
        &clients,
        &fx.snapshot,
        &fx.selected,
        &scenario(),
        SelectionAlgorithm::UniqueModel,
        Some(recorder.clone()),
        Some("group-7".into()),
    )
    .await;

    assert_eq!(outcome.outputs.len(), 1);

    // The write is detached; give it a moment to land.
    let mut sessions = Vec::new();
    for _ in 0..50 {
        sessions = recorder.list_sessions(10).await.unwrap();
        if !sessions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, outcome.session_id);
    assert_eq!(sessions[0].algorithm_used, "unique_model");
    assert_eq!(sessions[0].group_id.as_deref(), Some("group-7"));
    assert_eq!(sessions[0].response_count, 1);

    let rows = recorder.session_responses(outcome.session_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].display_order, 0);
    assert_eq!(rows[0].provider, "openai");
    assert_eq!(rows[0].model, "gpt-4o");
    assert_eq!(rows[0].system_prompt, "You are a careful writer.");
    assert_eq!(rows[0].content, "recorded output");
}
