//! Single HTTP endpoint, dispatched on the request's `phase` field.
//!
//! Input validation happens here, before any provider call; provider failures
//! themselves are per-assistant data in the response, not HTTP errors.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::decode::{EvaluationCriterion, ScoreRange};
use crate::evaluate::{evaluate, CandidateOutput, EvaluationResult};
use crate::gateway::ClientRegistry;
use crate::generate::generate;
use crate::prompts::Scenario;
use crate::registry::AssistantStore;
use crate::selector::{select, SelectError};
use crate::session::SessionRecorder;

// =============================================================================
// State / router
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub store: AssistantStore,
    pub recorder: SessionRecorder,
    pub clients: ClientRegistry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/panel", post(panel_handler))
        .with_state(state)
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseDto {
    pub input: String,
    #[serde(default)]
    pub context: String,
    pub use_case: String,
    #[serde(default)]
    pub num_outputs: Option<i64>,
}

impl TestCaseDto {
    fn into_scenario(self) -> Scenario {
        Scenario {
            id: String::new(),
            input: self.input,
            context: self.context,
            use_case: self.use_case,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestDto {
    pub test_case: TestCaseDto,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score_range: Option<ScoreRange>,
}

impl From<CriterionDto> for EvaluationCriterion {
    fn from(dto: CriterionDto) -> Self {
        EvaluationCriterion {
            id: dto.id,
            name: dto.name,
            description: dto.description,
            score_range: dto.score_range.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDto {
    pub model_id: String,
    pub output: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequestDto {
    pub test_case: TestCaseDto,
    pub criteria: Vec<CriterionDto>,
    pub outputs: Vec<OutputDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputView {
    pub model_id: String,
    pub output: String,
    pub timestamp: String,
    pub use_case_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    pub assistant_id: String,
    pub error: String,
    pub category: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponseDto {
    pub success: bool,
    pub outputs: Vec<OutputView>,
    pub errors: Vec<ErrorView>,
    pub selected_assistants_models: Vec<String>,
    pub num_outputs_to_show: usize,
    pub algorithm_used: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponseDto {
    pub success: bool,
    pub evaluations: Vec<EvaluationResult>,
    pub evaluation_model: String,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = json!({ "success": false, "error": message });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Handler
// =============================================================================

async fn panel_handler(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(&state, body).await.map(Json)
}

/// Phase dispatch, separated from the axum plumbing so it can be exercised
/// directly in tests.
pub async fn dispatch(
    state: &AppState,
    body: serde_json::Value,
) -> Result<serde_json::Value, ApiError> {
    let phase = body
        .get("phase")
        .and_then(|p| p.as_str())
        .ok_or_else(|| ApiError::BadRequest("missing 'phase' field".into()))?
        .to_string();

    match phase.as_str() {
        "generate" => {
            let request: GenerateRequestDto = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid generate request: {e}")))?;
            let response = handle_generate(state, request).await?;
            serde_json::to_value(response)
                .map_err(|e| ApiError::Internal(format!("response serialization: {e}")))
        }
        "evaluate" => {
            let request: EvaluateRequestDto = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid evaluate request: {e}")))?;
            let response = handle_evaluate(state, request).await?;
            serde_json::to_value(response)
                .map_err(|e| ApiError::Internal(format!("response serialization: {e}")))
        }
        other => Err(ApiError::BadRequest(format!("unknown phase: {other}"))),
    }
}

async fn handle_generate(
    state: &AppState,
    request: GenerateRequestDto,
) -> Result<GenerateResponseDto, ApiError> {
    if let Some(n) = request.test_case.num_outputs {
        if n < 0 {
            return Err(ApiError::BadRequest(format!(
                "numOutputs must be non-negative, got {n}"
            )));
        }
    }

    let settings = state
        .store
        .settings()
        .await
        .map_err(|e| ApiError::Internal(format!("settings read: {e}")))?;
    let snapshot = state
        .store
        .snapshot()
        .await
        .map_err(|e| ApiError::Internal(format!("registry read: {e}")))?;

    let n = request
        .test_case
        .num_outputs
        .map(|n| n as usize)
        .unwrap_or(settings.num_outputs);
    let algorithm = settings.selection_algorithm;
    let group_id = request.group_id;
    let scenario = request.test_case.into_scenario();

    let selected = {
        let mut rng = StdRng::from_entropy();
        match select(&snapshot.assistants, n, algorithm, &mut rng) {
            Ok(selected) => selected,
            Err(SelectError::NoAssistants) => {
                return Err(ApiError::BadRequest("no assistants selected".into()))
            }
        }
    };

    let selected_assistants_models: Vec<String> = selected
        .iter()
        .map(|s| s.binding.identity())
        .collect();

    let outcome = generate(
        &state.clients,
        &snapshot,
        &selected,
        &scenario,
        algorithm,
        Some(state.recorder.clone()),
        group_id,
    )
    .await;

    Ok(GenerateResponseDto {
        success: true,
        outputs: outcome
            .outputs
            .iter()
            .map(|o| OutputView {
                model_id: o.identity(),
                output: o.text.clone(),
                timestamp: o.timestamp.to_rfc3339(),
                use_case_type: o.use_case.clone(),
            })
            .collect(),
        errors: outcome
            .errors
            .iter()
            .map(|e| ErrorView {
                assistant_id: e.assistant_id.to_string(),
                error: e.message.clone(),
                category: e.category.as_str().to_string(),
            })
            .collect(),
        selected_assistants_models,
        num_outputs_to_show: settings.num_outputs_to_show,
        algorithm_used: algorithm.as_str().to_string(),
        session_id: outcome.session_id.to_string(),
    })
}

async fn handle_evaluate(
    state: &AppState,
    request: EvaluateRequestDto,
) -> Result<EvaluateResponseDto, ApiError> {
    if request.criteria.is_empty() {
        return Err(ApiError::BadRequest("criteria must not be empty".into()));
    }
    if request.outputs.is_empty() {
        return Err(ApiError::BadRequest("outputs must not be empty".into()));
    }

    let snapshot = state
        .store
        .snapshot()
        .await
        .map_err(|e| ApiError::Internal(format!("registry read: {e}")))?;

    let scenario = request.test_case.into_scenario();
    let criteria: Vec<EvaluationCriterion> =
        request.criteria.into_iter().map(Into::into).collect();
    let outputs: Vec<CandidateOutput> = request
        .outputs
        .into_iter()
        .map(|o| CandidateOutput {
            model_id: o.model_id,
            text: o.output,
        })
        .collect();

    let mut rng = StdRng::from_entropy();
    let run = evaluate(
        &state.clients,
        &snapshot,
        &outputs,
        &scenario,
        &criteria,
        &mut rng,
    )
    .await;

    Ok(EvaluateResponseDto {
        success: true,
        evaluations: run.results,
        evaluation_model: run.evaluation_model,
    })
}
