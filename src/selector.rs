//! Assistant selection: which assistants run, and on which model.
//!
//! Selection is a pure function of an immutable registry snapshot plus a
//! caller-supplied RNG; the "taken models" set lives only for the duration of
//! one call.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::ModelBinding;
use crate::registry::{Assistant, AssistantRole};

// =============================================================================
// Types
// =============================================================================

/// How assistants and their models are chosen for a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    /// Each assistant independently picks a uniform-random model from its own
    /// candidate set.
    RandomSelection,
    /// Models are assigned so that selected assistants end up on distinct
    /// models where the pool allows it. Best-effort, never failing.
    UniqueModel,
}

impl SelectionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RandomSelection => "random_selection",
            Self::UniqueModel => "unique_model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "random_selection" => Some(Self::RandomSelection),
            "unique_model" => Some(Self::UniqueModel),
            _ => None,
        }
    }
}

/// One assistant chosen to run, with its assigned model.
#[derive(Debug, Clone)]
pub struct SelectedAssistant {
    pub assistant_id: Uuid,
    pub name: String,
    pub binding: ModelBinding,
    pub system_prompt_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no assistants selected")]
    NoAssistants,
}

// =============================================================================
// Selection
// =============================================================================

/// Pick up to `n` generation assistants and assign each a model.
///
/// Active assistants are taken before inactive ones; within each tier the
/// order is randomized. After model assignment the final list is shuffled so
/// display position carries no information about the pick order.
///
/// `n = 0` is a valid request and returns an empty selection.
pub fn select(
    assistants: &[Assistant],
    n: usize,
    algorithm: SelectionAlgorithm,
    rng: &mut impl Rng,
) -> Result<Vec<SelectedAssistant>, SelectError> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let eligible: Vec<&Assistant> = assistants
        .iter()
        .filter(|a| a.role == AssistantRole::OutputGeneration)
        .filter(|a| !a.candidate_models.is_empty())
        .collect();

    let mut required: Vec<&Assistant> = eligible.iter().filter(|a| a.active).copied().collect();
    let mut optional: Vec<&Assistant> = eligible.iter().filter(|a| !a.active).copied().collect();
    required.shuffle(rng);
    optional.shuffle(rng);

    let chosen: Vec<&Assistant> = required
        .into_iter()
        .chain(optional)
        .take(n)
        .collect();

    if chosen.is_empty() {
        return Err(SelectError::NoAssistants);
    }

    let mut selected = match algorithm {
        SelectionAlgorithm::RandomSelection => assign_random(&chosen, rng),
        SelectionAlgorithm::UniqueModel => assign_unique(&chosen),
    };

    selected.shuffle(rng);
    Ok(selected)
}

fn assign_random(chosen: &[&Assistant], rng: &mut impl Rng) -> Vec<SelectedAssistant> {
    chosen
        .iter()
        .map(|a| {
            let binding = a
                .candidate_models
                .choose(rng)
                .expect("eligible assistants have candidates")
                .clone();
            to_selected(a, binding)
        })
        .collect()
}

/// Assign models greedily, removing each taken model from availability.
///
/// Assignment order is deterministic and most-constrained-first (smallest
/// candidate set first), so an assistant with one option claims it before a
/// more flexible assistant can. The randomized pick order never feeds this
/// step; display order is shuffled afterwards instead.
///
/// An assistant whose candidates are all taken falls back to its first
/// candidate; a duplicate beats a failure.
fn assign_unique(chosen: &[&Assistant]) -> Vec<SelectedAssistant> {
    let mut order: Vec<usize> = (0..chosen.len()).collect();
    order.sort_by_key(|&i| chosen[i].candidate_models.len());

    let mut taken: HashSet<&str> = HashSet::new();
    let mut selected = Vec::with_capacity(chosen.len());

    for i in order {
        let a = chosen[i];
        let binding = a
            .candidate_models
            .iter()
            .find(|b| !taken.contains(b.model_id.as_str()))
            .unwrap_or(&a.candidate_models[0]);
        taken.insert(binding.model_id.as_str());
        selected.push(to_selected(a, binding.clone()));
    }

    selected
}

fn to_selected(a: &Assistant, binding: ModelBinding) -> SelectedAssistant {
    SelectedAssistant {
        assistant_id: a.id,
        name: a.name.clone(),
        binding,
        system_prompt_id: a.system_prompt_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Provider;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assistant(
        name: &str,
        models: &[&str],
        active: bool,
        role: AssistantRole,
    ) -> Assistant {
        Assistant {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            candidate_models: models
                .iter()
                .map(|m| ModelBinding::new(Provider::OpenAi, *m))
                .collect(),
            system_prompt_id: Uuid::new_v4(),
            active,
            updated_at: 0,
        }
    }

    fn gen_assistant(name: &str, models: &[&str], active: bool) -> Assistant {
        assistant(name, models, active, AssistantRole::OutputGeneration)
    }

    #[test]
    fn zero_requested_is_empty_not_error() {
        let pool = vec![gen_assistant("a", &["m1"], true)];
        let mut rng = StdRng::seed_from_u64(1);
        let got = select(&pool, 0, SelectionAlgorithm::RandomSelection, &mut rng).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn returns_min_of_n_and_eligible() {
        let pool = vec![
            gen_assistant("a", &["m1"], false),
            gen_assistant("b", &["m2"], false),
        ];
        let mut rng = StdRng::seed_from_u64(2);
        for n in 1..=5 {
            let got =
                select(&pool, n, SelectionAlgorithm::RandomSelection, &mut rng).unwrap();
            assert_eq!(got.len(), n.min(2));
        }
    }

    #[test]
    fn no_eligible_assistants_is_an_error() {
        let pool = vec![assistant("judge", &["m1"], true, AssistantRole::Evaluation)];
        let mut rng = StdRng::seed_from_u64(3);
        let err = select(&pool, 2, SelectionAlgorithm::RandomSelection, &mut rng);
        assert!(matches!(err, Err(SelectError::NoAssistants)));
    }

    #[test]
    fn required_assistants_fill_first() {
        let pool = vec![
            gen_assistant("opt-1", &["m1"], false),
            gen_assistant("req", &["m2"], true),
            gen_assistant("opt-2", &["m3"], false),
        ];
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let got =
                select(&pool, 1, SelectionAlgorithm::RandomSelection, &mut rng).unwrap();
            assert_eq!(got[0].name, "req", "seed {seed}");
        }
    }

    #[test]
    fn random_selection_picks_from_own_candidates() {
        let pool = vec![gen_assistant("a", &["m1", "m2"], true)];
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let got =
                select(&pool, 1, SelectionAlgorithm::RandomSelection, &mut rng).unwrap();
            assert!(["m1", "m2"].contains(&got[0].binding.model_id.as_str()));
        }
    }

    #[test]
    fn unique_model_avoids_collisions_when_pool_allows() {
        // Candidates {A} / {A,B} / {C}: the single-option assistants claim A
        // and C first, so the flexible one must land on B. Holds for every
        // pick order.
        let pool = vec![
            gen_assistant("first", &["model-a"], true),
            gen_assistant("second", &["model-a", "model-b"], true),
            gen_assistant("third", &["model-c"], true),
        ];

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let got = select(&pool, 3, SelectionAlgorithm::UniqueModel, &mut rng).unwrap();
            assert_eq!(got.len(), 3);

            let by_name = |n: &str| {
                got.iter()
                    .find(|s| s.name == n)
                    .map(|s| s.binding.model_id.as_str())
                    .unwrap()
            };
            // "first" only has model-a, so "second" must take model-b.
            assert_eq!(by_name("first"), "model-a", "seed {seed}");
            assert_eq!(by_name("second"), "model-b", "seed {seed}");
            assert_eq!(by_name("third"), "model-c", "seed {seed}");

            let distinct: HashSet<&str> =
                got.iter().map(|s| s.binding.model_id.as_str()).collect();
            assert_eq!(distinct.len(), 3, "seed {seed}");
        }
    }

    #[test]
    fn unique_model_falls_back_to_duplicate_when_exhausted() {
        let pool = vec![
            gen_assistant("a", &["m1"], true),
            gen_assistant("b", &["m1"], true),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let got = select(&pool, 2, SelectionAlgorithm::UniqueModel, &mut rng).unwrap();
        assert_eq!(got.len(), 2);
        for s in &got {
            assert_eq!(s.binding.model_id, "m1");
        }
    }

    #[test]
    fn final_order_is_shuffled_across_seeds() {
        let pool = vec![
            gen_assistant("a", &["m1"], true),
            gen_assistant("b", &["m2"], true),
            gen_assistant("c", &["m3"], true),
        ];
        let mut orders = HashSet::new();
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let got = select(&pool, 3, SelectionAlgorithm::UniqueModel, &mut rng).unwrap();
            let order: Vec<String> = got.iter().map(|s| s.name.clone()).collect();
            orders.insert(order);
        }
        assert!(orders.len() > 1, "selection order never varied");
    }

    #[test]
    fn assistants_without_candidates_are_skipped() {
        let pool = vec![
            gen_assistant("empty", &[], true),
            gen_assistant("full", &["m1"], false),
        ];
        let mut rng = StdRng::seed_from_u64(11);
        let got = select(&pool, 2, SelectionAlgorithm::RandomSelection, &mut rng).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "full");
    }
}
