//! Structured-output decoding: free-form judge text into a validated score
//! document.
//!
//! Policy pipeline: strict JSON parse, then lenient repair (fence stripping
//! and brace slicing), then a typed all-zero fallback. The policy is pure so
//! it can be tested without any network call.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Types
// =============================================================================

/// Inclusive score bounds for one criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ScoreRange {
    fn default() -> Self {
        Self { min: 0.0, max: 2.0 }
    }
}

impl ScoreRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// One rubric criterion an output is scored against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCriterion {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub score_range: ScoreRange,
}

/// A validated per-criterion score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub score: f64,
    pub reasoning: String,
}

/// The validated result of decoding one judge response.
#[derive(Debug, Clone)]
pub struct ScoreDocument {
    /// One entry per requested criterion, keyed by criterion id.
    pub criteria_scores: BTreeMap<String, ScoreEntry>,
    pub overall_score: f64,
    pub feedback: String,
}

/// Feedback string used when a response cannot be decoded at all.
pub const FALLBACK_FEEDBACK: &str = "evaluation failed";

// =============================================================================
// Raw wire shape
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default, alias = "criteriaScores")]
    criteria_scores: HashMap<String, RawEntry>,
    #[serde(default, alias = "overallScore")]
    overall_score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    score: Option<serde_json::Value>,
    #[serde(default)]
    reasoning: Option<String>,
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a judge response into a score document, never failing.
///
/// An entirely unparseable response yields the all-zero fallback document; a
/// parseable one has every entry coerced and clamped into its criterion's
/// declared range.
pub fn decode_scores(raw: &str, criteria: &[EvaluationCriterion]) -> ScoreDocument {
    match parse_document(raw) {
        Some(doc) => repair_document(doc, criteria),
        None => fallback_document(criteria),
    }
}

/// All-zero document used when nothing could be parsed.
pub fn fallback_document(criteria: &[EvaluationCriterion]) -> ScoreDocument {
    let criteria_scores = criteria
        .iter()
        .map(|c| {
            (
                c.id.clone(),
                ScoreEntry {
                    score: 0.0,
                    reasoning: FALLBACK_FEEDBACK.to_string(),
                },
            )
        })
        .collect();
    ScoreDocument {
        criteria_scores,
        overall_score: 0.0,
        feedback: FALLBACK_FEEDBACK.to_string(),
    }
}

fn parse_document(raw: &str) -> Option<RawDocument> {
    // Strict attempt first: well-behaved judges return bare JSON.
    if let Ok(doc) = serde_json::from_str::<RawDocument>(raw) {
        return Some(doc);
    }

    // Lenient attempt: strip code fences, slice to the first balanced object.
    let stripped = strip_code_fences(raw);
    let sliced = extract_json(stripped);
    serde_json::from_str::<RawDocument>(sliced).ok()
}

fn repair_document(doc: RawDocument, criteria: &[EvaluationCriterion]) -> ScoreDocument {
    let mut criteria_scores = BTreeMap::new();

    for criterion in criteria {
        let entry = match doc.criteria_scores.get(&criterion.id) {
            Some(raw) => repair_entry(raw, criterion),
            None => ScoreEntry {
                score: 0.0,
                reasoning: format!("no score returned for criterion '{}'", criterion.id),
            },
        };
        criteria_scores.insert(criterion.id.clone(), entry);
    }

    let overall_score = match doc.overall_score {
        Some(v) if v.is_finite() => v,
        _ => mean_score(&criteria_scores),
    };

    ScoreDocument {
        criteria_scores,
        overall_score,
        feedback: doc.feedback.unwrap_or_default(),
    }
}

fn repair_entry(raw: &RawEntry, criterion: &EvaluationCriterion) -> ScoreEntry {
    let reasoning = raw.reasoning.clone().unwrap_or_default();

    let numeric = match &raw.score {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        // Judges occasionally quote the number.
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match numeric {
        Some(score) if score.is_finite() => {
            let clamped = criterion.score_range.clamp(score);
            if clamped != score {
                warn!(
                    criterion = %criterion.id,
                    original = score,
                    clamped,
                    "Score outside declared range; clamped"
                );
            }
            ScoreEntry {
                score: clamped,
                reasoning,
            }
        }
        _ => ScoreEntry {
            score: 0.0,
            reasoning: if reasoning.is_empty() {
                format!("score missing or non-numeric for criterion '{}'", criterion.id)
            } else {
                format!("{reasoning} (score missing or non-numeric; recorded as 0)")
            },
        },
    }
}

fn mean_score(scores: &BTreeMap<String, ScoreEntry>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().map(|e| e.score).sum::<f64>() / scores.len() as f64
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Drop a leading/trailing markdown code fence if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Extract a JSON object from potentially noisy LLM output.
///
/// Handles pure JSON, JSON embedded in prose, and braces inside string
/// values.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Find the byte offset past the matching closing brace, respecting JSON
/// strings so braces within `"..."` are not counted.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
