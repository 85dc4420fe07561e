//! Rubric evaluation: one judge call per generated output, sequential, with
//! per-output failure isolation.
//!
//! Without a configured judge the evaluator stays usable by returning clearly
//! flagged mock results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::decode::{decode_scores, fallback_document, EvaluationCriterion, ScoreEntry};
use crate::gateway::ClientRegistry;
use crate::generate::call_timeout;
use crate::prompts::{render_evaluation_user, Scenario};
use crate::registry::RegistrySnapshot;

// =============================================================================
// Types
// =============================================================================

/// One output to score, identified the same way it was displayed.
#[derive(Debug, Clone)]
pub struct CandidateOutput {
    pub model_id: String,
    pub text: String,
}

/// Scores for one output against the full rubric. Created once per run,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub model_id: String,
    pub overall_score: f64,
    pub criteria_scores: BTreeMap<String, ScoreEntry>,
    pub feedback: String,
    pub timestamp: DateTime<Utc>,
}

/// The results plus which judge produced them.
#[derive(Debug)]
pub struct EvaluationRun {
    pub results: Vec<EvaluationResult>,
    pub evaluation_model: String,
}

/// Feedback marker on results produced without a configured judge.
pub const MOCK_FEEDBACK: &str = "Mock evaluation: no evaluation assistant is configured.";

/// Model label reported when mock results are returned.
pub const MOCK_MODEL: &str = "mock";

// =============================================================================
// Evaluation
// =============================================================================

/// Score every output against the rubric.
///
/// Sequential by design: each call reuses one judge handle. One output's
/// failure (provider error, timeout, undecodable response) yields a fallback
/// result for that output and leaves the rest untouched.
pub async fn evaluate(
    clients: &ClientRegistry,
    snapshot: &RegistrySnapshot,
    outputs: &[CandidateOutput],
    scenario: &Scenario,
    criteria: &[EvaluationCriterion],
    rng: &mut impl Rng,
) -> EvaluationRun {
    let Some(evaluator) = snapshot.active_evaluator() else {
        return mock_run(outputs, criteria, rng);
    };

    let Some(binding) = evaluator.candidate_models.first() else {
        warn!(assistant = %evaluator.name, "Evaluation assistant has no model bindings");
        return mock_run(outputs, criteria, rng);
    };

    let system_prompt = match snapshot.prompt_text(evaluator.system_prompt_id) {
        Some(text) => text.to_string(),
        None => {
            warn!(
                assistant = %evaluator.name,
                prompt_id = %evaluator.system_prompt_id,
                "Evaluation assistant's system prompt is missing"
            );
            return mock_run(outputs, criteria, rng);
        }
    };

    let resolved = match clients.resolve(binding.provider, &binding.model_id) {
        Ok(resolved) => resolved,
        Err(e) => {
            // A configured judge that cannot be called is not the same as no
            // judge: report honest failures instead of mock scores.
            warn!(error = %e, "Cannot resolve evaluation model; returning fallback results");
            let results = outputs
                .iter()
                .map(|o| result_from_fallback(o, criteria))
                .collect();
            return EvaluationRun {
                results,
                evaluation_model: binding.identity(),
            };
        }
    };

    let timeout = call_timeout();
    let mut results = Vec::with_capacity(outputs.len());

    for output in outputs {
        let user = render_evaluation_user(scenario, &output.text, criteria);

        let document = match tokio::time::timeout(
            timeout,
            resolved.complete(&system_prompt, &user, true),
        )
        .await
        {
            Ok(Ok(response)) => decode_scores(&response.content, criteria),
            Ok(Err(e)) => {
                warn!(
                    model_id = %output.model_id,
                    error = %e,
                    "Judge call failed; substituting fallback result"
                );
                fallback_document(criteria)
            }
            Err(_) => {
                warn!(
                    model_id = %output.model_id,
                    "Judge call timed out; substituting fallback result"
                );
                fallback_document(criteria)
            }
        };

        results.push(EvaluationResult {
            model_id: output.model_id.clone(),
            overall_score: document.overall_score,
            criteria_scores: document.criteria_scores,
            feedback: document.feedback,
            timestamp: Utc::now(),
        });
    }

    EvaluationRun {
        results,
        evaluation_model: resolved.identity(),
    }
}

fn result_from_fallback(
    output: &CandidateOutput,
    criteria: &[EvaluationCriterion],
) -> EvaluationResult {
    let document = fallback_document(criteria);
    EvaluationResult {
        model_id: output.model_id.clone(),
        overall_score: document.overall_score,
        criteria_scores: document.criteria_scores,
        feedback: document.feedback,
        timestamp: Utc::now(),
    }
}

fn mock_run(
    outputs: &[CandidateOutput],
    criteria: &[EvaluationCriterion],
    rng: &mut impl Rng,
) -> EvaluationRun {
    let results = outputs
        .iter()
        .map(|output| {
            let criteria_scores: BTreeMap<String, ScoreEntry> = criteria
                .iter()
                .map(|c| {
                    let score = rng.gen_range(c.score_range.min..=c.score_range.max);
                    (
                        c.id.clone(),
                        ScoreEntry {
                            score,
                            reasoning: MOCK_FEEDBACK.to_string(),
                        },
                    )
                })
                .collect();

            let overall_score = if criteria_scores.is_empty() {
                0.0
            } else {
                criteria_scores.values().map(|e| e.score).sum::<f64>()
                    / criteria_scores.len() as f64
            };

            EvaluationResult {
                model_id: output.model_id.clone(),
                overall_score,
                criteria_scores,
                feedback: MOCK_FEEDBACK.to_string(),
                timestamp: Utc::now(),
            }
        })
        .collect();

    EvaluationRun {
        results,
        evaluation_model: MOCK_MODEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{ScoreRange, FALLBACK_FEEDBACK};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn criteria() -> Vec<EvaluationCriterion> {
        (1..=3)
            .map(|i| EvaluationCriterion {
                id: format!("c{i}"),
                name: format!("Criterion {i}"),
                description: "desc".into(),
                score_range: ScoreRange::default(),
            })
            .collect()
    }

    fn outputs() -> Vec<CandidateOutput> {
        vec![
            CandidateOutput {
                model_id: "openai/gpt-4o".into(),
                text: "first answer".into(),
            },
            CandidateOutput {
                model_id: "anthropic/claude-3-5-haiku-20241022".into(),
                text: "second answer".into(),
            },
        ]
    }

    #[tokio::test]
    async fn no_evaluator_yields_mock_results_in_range() {
        let clients = ClientRegistry::new();
        let snapshot = RegistrySnapshot::default();
        let mut rng = StdRng::seed_from_u64(9);

        let run = evaluate(
            &clients,
            &snapshot,
            &outputs(),
            &scenario(),
            &criteria(),
            &mut rng,
        )
        .await;

        assert_eq!(run.evaluation_model, MOCK_MODEL);
        assert_eq!(run.results.len(), 2);
        for result in &run.results {
            assert_eq!(result.feedback, MOCK_FEEDBACK);
            assert_eq!(result.criteria_scores.len(), 3);
            for entry in result.criteria_scores.values() {
                assert!((0.0..=2.0).contains(&entry.score));
            }
        }
    }

    #[tokio::test]
    async fn mock_results_have_stable_shape_across_runs() {
        let clients = ClientRegistry::new();
        let snapshot = RegistrySnapshot::default();

        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let run_a = evaluate(&clients, &snapshot, &outputs(), &scenario(), &criteria(), &mut rng_a).await;
        let run_b = evaluate(&clients, &snapshot, &outputs(), &scenario(), &criteria(), &mut rng_b).await;

        for (a, b) in run_a.results.iter().zip(run_b.results.iter()) {
            assert_eq!(a.model_id, b.model_id);
            let keys_a: Vec<_> = a.criteria_scores.keys().collect();
            let keys_b: Vec<_> = b.criteria_scores.keys().collect();
            assert_eq!(keys_a, keys_b);
        }
    }

    #[tokio::test]
    async fn unresolvable_judge_yields_honest_fallbacks() {
        use crate::gateway::{ModelBinding, Provider};
        use crate::registry::{Assistant, AssistantRole, SystemPrompt};
        use uuid::Uuid;

        // Judge fully configured, but no credential registered for its provider.
        let prompt = SystemPrompt {
            id: Uuid::new_v4(),
            text: "You are a strict grader.".into(),
        };
        let judge = Assistant {
            id: Uuid::new_v4(),
            name: "judge".into(),
            role: AssistantRole::Evaluation,
            candidate_models: vec![ModelBinding::new(Provider::OpenAi, "gpt-4o")],
            system_prompt_id: prompt.id,
            active: true,
            updated_at: 0,
        };
        let snapshot = RegistrySnapshot::new(vec![judge], vec![prompt]);

        let clients = ClientRegistry::new();
        let mut rng = StdRng::seed_from_u64(4);
        let run = evaluate(
            &clients,
            &snapshot,
            &outputs(),
            &scenario(),
            &criteria(),
            &mut rng,
        )
        .await;

        assert_eq!(run.evaluation_model, "openai/gpt-4o");
        assert_eq!(run.results.len(), 2);
        for result in &run.results {
            assert_eq!(result.feedback, FALLBACK_FEEDBACK);
            assert!(result.criteria_scores.values().all(|e| e.score == 0.0));
        }
    }

    fn scenario() -> Scenario {
        Scenario {
            id: "tc".into(),
            input: "write a reply".into(),
            context: String::new(),
            use_case: "freeform_chat".into(),
        }
    }
}
