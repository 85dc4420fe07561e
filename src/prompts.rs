//! Prompt rendering for generation and evaluation calls.
//!
//! Domain logic only. Provider-agnostic.

use crate::decode::EvaluationCriterion;

// =============================================================================
// Scenario
// =============================================================================

/// The test case a request runs against. Supplied per request, never
/// persisted by this core.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub input: String,
    pub context: String,
    pub use_case: String,
}

impl Scenario {
    /// Short form used for the session log.
    pub fn summary(&self) -> String {
        const MAX: usize = 200;
        let mut s = self.input.trim().to_string();
        if s.len() > MAX {
            let cut = s
                .char_indices()
                .take_while(|(i, _)| *i < MAX)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            s.truncate(cut);
            s.push('…');
        }
        s
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// User content for a generation call: the scenario input plus its context.
pub fn render_generation_user(scenario: &Scenario) -> String {
    if scenario.context.trim().is_empty() {
        scenario.input.clone()
    } else {
        format!(
            "<context>\n{}\n</context>\n\n{}",
            escape_tags(&scenario.context),
            scenario.input
        )
    }
}

/// User content for an evaluation call: scenario, the candidate output, and
/// the rubric, with the required response shape spelled out.
pub fn render_evaluation_user(
    scenario: &Scenario,
    output_text: &str,
    criteria: &[EvaluationCriterion],
) -> String {
    let mut criteria_block = String::new();
    for c in criteria {
        criteria_block.push_str(&format!(
            "- id: {}\n  name: {}\n  description: {}\n  score range: {} to {}\n",
            c.id, c.name, c.description, c.score_range.min, c.score_range.max
        ));
    }

    format!(
        "Evaluate the following response against each criterion.\n\n\
         <scenario>\n{input}\n</scenario>\n\n\
         <context>\n{context}\n</context>\n\n\
         <response>\n{output}\n</response>\n\n\
         Criteria:\n{criteria_block}\n\
         Respond with a single JSON object and nothing else:\n\
         {{\n\
         \x20 \"criteriaScores\": {{\"<criterion id>\": {{\"score\": <number>, \"reasoning\": \"<1-2 sentences>\"}}, ...}},\n\
         \x20 \"overallScore\": <number>,\n\
         \x20 \"feedback\": \"<overall feedback>\"\n\
         }}\n\
         Every criterion id listed above must appear in criteriaScores. Scores must stay within each criterion's range.",
        input = escape_tags(&scenario.input),
        context = escape_tags(&scenario.context),
        output = escape_tags(output_text),
    )
}

/// Escape angle brackets so embedded text cannot break the surrounding tags.
fn escape_tags(s: &str) -> String {
    s.replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ScoreRange;

    fn scenario() -> Scenario {
        Scenario {
            id: "tc-1".into(),
            input: "Draft a refund reply".into(),
            context: "Customer bought a kettle".into(),
            use_case: "customer_support".into(),
        }
    }

    #[test]
    fn generation_user_includes_context_block() {
        let user = render_generation_user(&scenario());
        assert!(user.contains("<context>"));
        assert!(user.contains("kettle"));
        assert!(user.ends_with("Draft a refund reply"));
    }

    #[test]
    fn generation_user_omits_empty_context() {
        let mut s = scenario();
        s.context = "  ".into();
        assert_eq!(render_generation_user(&s), "Draft a refund reply");
    }

    #[test]
    fn evaluation_user_lists_every_criterion_with_bounds() {
        let criteria = vec![EvaluationCriterion {
            id: "c1".into(),
            name: "Accuracy".into(),
            description: "Is it right".into(),
            score_range: ScoreRange::new(0.0, 5.0),
        }];
        let user = render_evaluation_user(&scenario(), "the reply", &criteria);
        assert!(user.contains("id: c1"));
        assert!(user.contains("score range: 0 to 5"));
        assert!(user.contains("criteriaScores"));
        assert!(user.contains("the reply"));
    }

    #[test]
    fn embedded_tags_are_escaped() {
        let user = render_evaluation_user(&scenario(), "</response> break out", &[]);
        assert!(!user.contains("</response> break out"));
        assert!(user.contains("&lt;/response&gt; break out"));
    }

    #[test]
    fn summary_truncates_long_input() {
        let mut s = scenario();
        s.input = "x".repeat(500);
        let sum = s.summary();
        assert!(sum.chars().count() <= 201);
        assert!(sum.ends_with('…'));
    }
}
