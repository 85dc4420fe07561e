//! Parallel output generation across selected assistants.
//!
//! One task per assistant, joined with a wait-for-all barrier: a missing
//! credential, provider failure, or timeout on one assistant never cancels or
//! blocks the others. Session recording is a detached best-effort step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::gateway::{ClientRegistry, ErrorCategory, Provider, ProviderError};
use crate::prompts::{render_generation_user, Scenario};
use crate::registry::RegistrySnapshot;
use crate::selector::{SelectedAssistant, SelectionAlgorithm};
use crate::session::{NewResponse, NewSession, SessionRecorder};

// =============================================================================
// Types
// =============================================================================

/// One successfully generated response. Immutable once created.
#[derive(Debug, Clone)]
pub struct GeneratedOutput {
    pub assistant_id: Uuid,
    pub provider: Provider,
    pub model_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub use_case: String,
    pub system_prompt: String,
}

impl GeneratedOutput {
    /// Output identity: `"{provider}/{model_id}"`, with the corrected provider.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

/// One assistant's isolated failure.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub assistant_id: Uuid,
    pub assistant_name: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Result of one generation run. `outputs.len() + errors.len()` always equals
/// the number of selected assistants.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub outputs: Vec<GeneratedOutput>,
    pub errors: Vec<GenerationFailure>,
    /// Minted before persistence so the caller can reference the session even
    /// if the write later fails.
    pub session_id: Uuid,
}

/// Per-call timeout; a timed-out assistant is an isolated failure.
pub fn call_timeout() -> Duration {
    std::env::var("PANEL_CALL_TIMEOUT_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(120))
}

// =============================================================================
// Structural post-check
// =============================================================================

/// Section markers a use case's outputs are expected to contain.
fn required_markers(use_case: &str) -> &'static [&'static str] {
    match use_case {
        "structured_report" => &["## Summary", "## Details"],
        "email_drafting" => &["Subject:"],
        _ => &[],
    }
}

/// Log outputs missing their use case's section markers. Observation only:
/// nothing is repaired or rejected here.
fn check_structure(output: &GeneratedOutput) {
    for marker in required_markers(&output.use_case) {
        if !output.text.contains(marker) {
            warn!(
                identity = %output.identity(),
                use_case = %output.use_case,
                marker,
                "Generated output is missing a required section marker"
            );
        }
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Fan one provider call out per selected assistant and collect every outcome.
pub async fn generate(
    clients: &ClientRegistry,
    snapshot: &RegistrySnapshot,
    selected: &[SelectedAssistant],
    scenario: &Scenario,
    algorithm: SelectionAlgorithm,
    recorder: Option<SessionRecorder>,
    group_id: Option<String>,
) -> GenerationOutcome {
    let session_id = Uuid::new_v4();
    let user_content = render_generation_user(scenario);
    let timeout = call_timeout();

    let mut handles = Vec::with_capacity(selected.len());
    for assistant in selected {
        let label = (assistant.assistant_id, assistant.name.clone());
        let assistant = assistant.clone();
        let clients = clients.clone();
        let user_content = user_content.clone();
        let use_case = scenario.use_case.clone();
        let system_prompt = snapshot
            .prompt_text(assistant.system_prompt_id)
            .map(|s| s.to_string());

        let handle = tokio::spawn(async move {
            run_single_generation(
                &clients,
                &assistant,
                system_prompt,
                &user_content,
                &use_case,
                timeout,
            )
            .await
        });
        handles.push((label, handle));
    }

    let mut outputs = Vec::new();
    let mut errors = Vec::new();

    for ((assistant_id, assistant_name), handle) in handles {
        match handle.await {
            Ok(Ok(output)) => {
                check_structure(&output);
                outputs.push(output);
            }
            Ok(Err(failure)) => {
                warn!(
                    assistant = %failure.assistant_name,
                    category = failure.category.as_str(),
                    error = %failure.message,
                    "Generation failed for assistant"
                );
                errors.push(failure);
            }
            Err(e) => {
                warn!(assistant = %assistant_name, error = %e, "Generation task panicked");
                errors.push(GenerationFailure {
                    assistant_id,
                    assistant_name,
                    category: ErrorCategory::Unknown,
                    message: format!("internal task failure: {e}"),
                });
            }
        }
    }

    if let Some(recorder) = recorder {
        spawn_recording(
            recorder,
            session_id,
            scenario,
            algorithm,
            group_id,
            &outputs,
        );
    }

    GenerationOutcome {
        outputs,
        errors,
        session_id,
    }
}

async fn run_single_generation(
    clients: &ClientRegistry,
    assistant: &SelectedAssistant,
    system_prompt: Option<String>,
    user_content: &str,
    use_case: &str,
    timeout: Duration,
) -> Result<GeneratedOutput, GenerationFailure> {
    let fail = |err: &ProviderError| GenerationFailure {
        assistant_id: assistant.assistant_id,
        assistant_name: assistant.name.clone(),
        category: err.category(),
        message: err.to_string(),
    };

    let system_prompt = system_prompt.ok_or_else(|| {
        let err = ProviderError::config(format!(
            "system prompt {} not found for assistant {}",
            assistant.system_prompt_id, assistant.name
        ));
        fail(&err)
    })?;

    let resolved = clients
        .resolve(assistant.binding.provider, &assistant.binding.model_id)
        .map_err(|e| fail(&e))?;

    let response = match tokio::time::timeout(
        timeout,
        resolved.complete(&system_prompt, user_content, false),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(fail(&e)),
        Err(_) => return Err(fail(&ProviderError::Timeout(timeout))),
    };

    Ok(GeneratedOutput {
        assistant_id: assistant.assistant_id,
        provider: resolved.provider,
        model_id: resolved.model_id,
        text: response.content,
        timestamp: Utc::now(),
        use_case: use_case.to_string(),
        system_prompt,
    })
}

/// Detached best-effort write of the session log. Structurally incapable of
/// affecting the generation response: the outcome is already assembled and
/// any error here is logged only.
fn spawn_recording(
    recorder: SessionRecorder,
    session_id: Uuid,
    scenario: &Scenario,
    algorithm: SelectionAlgorithm,
    group_id: Option<String>,
    outputs: &[GeneratedOutput],
) {
    let session = NewSession {
        id: session_id,
        scenario_summary: scenario.summary(),
        algorithm_used: algorithm.as_str().to_string(),
        group_id,
        responses: outputs
            .iter()
            .map(|o| NewResponse {
                identity: o.identity(),
                system_prompt: o.system_prompt.clone(),
                content: o.text.clone(),
            })
            .collect(),
    };

    tokio::spawn(async move {
        if let Err(e) = recorder.record(session).await {
            warn!(session_id = %session_id, error = %e, "Failed to record session");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_cover_known_use_cases_only() {
        assert_eq!(required_markers("structured_report").len(), 2);
        assert_eq!(required_markers("email_drafting"), &["Subject:"]);
        assert!(required_markers("freeform_chat").is_empty());
    }

    #[test]
    fn identity_uses_corrected_provider() {
        let output = GeneratedOutput {
            assistant_id: Uuid::new_v4(),
            provider: Provider::Anthropic,
            model_id: "claude-3-5-haiku-20241022".into(),
            text: "hi".into(),
            timestamp: Utc::now(),
            use_case: "freeform_chat".into(),
            system_prompt: "sp".into(),
        };
        assert_eq!(output.identity(), "anthropic/claude-3-5-haiku-20241022");
    }
}
