//! Default `PromptGenerator` / `InsightExtractor` implementations.
//!
//! Both are external-collaborator boundaries per the core's design (the
//! coder loop depends only on the traits in `forge_core::coder_loop`); this
//! module is the default wiring, grounded on the shape of
//! `format_task_prompt` (objective, constraints, failure signals) minus the
//! multi-tier swarm framing that has no counterpart here.

use forge_core::coder_loop::{InsightExtractor, PromptGenerator};
use forge_core::plan::ImplementationPlan;

pub struct BasicPromptGenerator;

impl PromptGenerator for BasicPromptGenerator {
    fn build_prompt(&self, plan: &ImplementationPlan, phase: u32, subtask_id: &str) -> String {
        let Some(subtask) = plan.find_subtask(subtask_id) else {
            return format!("Work on subtask {subtask_id} of feature \"{}\".", plan.feature);
        };

        let mut prompt = String::new();
        prompt.push_str(&format!("# Feature: {}\n\n", plan.feature));
        prompt.push_str(&format!("## Subtask {subtask_id} (phase {phase})\n\n{}\n\n", subtask.description));

        if !subtask.files_to_modify.is_empty() {
            prompt.push_str("Files to modify:\n");
            for f in &subtask.files_to_modify {
                prompt.push_str(&format!("- {f}\n"));
            }
            prompt.push('\n');
        }
        if !subtask.files_to_create.is_empty() {
            prompt.push_str("Files to create:\n");
            for f in &subtask.files_to_create {
                prompt.push_str(&format!("- {f}\n"));
            }
            prompt.push('\n');
        }
        if let Some(expected) = &subtask.expected_output {
            prompt.push_str(&format!("Expected output:\n{expected}\n\n"));
        }
        if let Some(critique) = &subtask.critique {
            prompt.push_str(&format!("Feedback from the previous attempt:\n{critique}\n\n"));
        }

        prompt.push_str("When the subtask is complete, mark it done in implementation_plan.json.\n");
        prompt
    }
}

pub struct BasicInsightExtractor;

impl InsightExtractor for BasicInsightExtractor {
    fn extract(&self, response_text: &str, success: bool) -> String {
        let trimmed = response_text.trim();
        let snippet: String = trimmed.chars().take(400).collect();
        if success {
            format!("succeeded: {snippet}")
        } else {
            format!("failed: {snippet}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::plan::{Phase, PhaseType, Subtask, WorkflowType};
    use std::collections::BTreeSet;

    #[test]
    fn prompt_includes_feature_and_subtask_description() {
        let mut plan = ImplementationPlan::new("widgets", WorkflowType::Feature, None);
        plan.phases.push(Phase {
            phase: 1,
            name: "P1".into(),
            phase_type: PhaseType::Implementation,
            depends_on: BTreeSet::new(),
            parallel_safe: false,
            subtasks: vec![Subtask::new("t1", "add the widget endpoint")],
        });

        let prompt = BasicPromptGenerator.build_prompt(&plan, 1, "t1");
        assert!(prompt.contains("widgets"));
        assert!(prompt.contains("add the widget endpoint"));
    }

    #[test]
    fn insight_extraction_labels_success_and_failure() {
        let extractor = BasicInsightExtractor;
        assert!(extractor.extract("it worked", true).starts_with("succeeded"));
        assert!(extractor.extract("it broke", false).starts_with("failed"));
    }
}
