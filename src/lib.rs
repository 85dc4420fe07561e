#![forbid(unsafe_code)]

//! # panel-harness
//!
//! Run one scenario against a panel of configured assistants in parallel,
//! normalize what comes back, and score each response against a rubric with a
//! judge model that must return machine-parseable scores.
//!
//! The pipeline: registry snapshot → assistant selection → parallel provider
//! fan-out → best-effort session recording, and for the scoring phase a
//! sequential judge loop with validation, repair, and typed fallbacks.

pub mod api;
pub mod decode;
pub mod evaluate;
pub mod gateway;
pub mod generate;
pub mod prompts;
pub mod registry;
pub mod selector;
pub mod session;

pub use api::{router, AppState};
pub use decode::{decode_scores, EvaluationCriterion, ScoreEntry, ScoreRange};
pub use evaluate::{evaluate, CandidateOutput, EvaluationResult};
pub use gateway::{
    infer_provider, ChatClient, ClientRegistry, ErrorCategory, ModelBinding, Provider,
    ProviderError,
};
pub use generate::{generate, GeneratedOutput, GenerationFailure, GenerationOutcome};
pub use prompts::Scenario;
pub use registry::{Assistant, AssistantRole, AssistantStore, RegistrySnapshot, SystemPrompt};
pub use selector::{select, SelectedAssistant, SelectionAlgorithm};
pub use session::{NewResponse, NewSession, SessionRecorder};
