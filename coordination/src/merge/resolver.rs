//! Conflict Resolver: auto-merger for dedup-style conflicts, AI resolver
//! for everything else severity-eligible.
//!
//! `build_resolution_prompt` follows the same markdown-section-building
//! idiom as `ensemble::arbitration::generate_arbitration_prompt` —
//! `## Conflict`, `## Baseline`, `## Task Snippets` sections built with
//! `push_str`, retargeted from model-vote arbitration to merge-conflict
//! resolution.

use async_trait::async_trait;

use super::types::{ConflictRegion, ConflictSeverity};

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub resolved: bool,
    pub merged_snippet: Option<String>,
    pub used_ai: bool,
    pub tokens_used: u64,
}

/// Implemented by the caller's LLM adapter (the core never talks to a
/// model SDK directly — same boundary as `AgentClient`).
#[async_trait]
pub trait AiConflictResolver: Send + Sync {
    async fn resolve(&self, prompt: &str) -> Result<(String, u64), String>;
}

/// Deterministic dedup resolver: only conflicts explicitly marked
/// `can_auto_merge` with a known strategy are handled here.
pub fn try_auto_merge(conflict: &ConflictRegion) -> Option<ResolutionOutcome> {
    if !conflict.can_auto_merge {
        return None;
    }
    match conflict.merge_strategy.as_deref() {
        Some("dedup_removal") => Some(ResolutionOutcome {
            resolved: true,
            merged_snippet: None,
            used_ai: false,
            tokens_used: 0,
        }),
        _ => None,
    }
}

/// §4.8 step 4: try auto-merge first; if AI is enabled and severity is
/// medium/high, fall back to the AI resolver; otherwise leave unresolved.
pub async fn resolve_conflict(
    conflict: &ConflictRegion,
    baseline_slice: &str,
    task_snippets: &[(String, String)],
    task_intents: &[(String, Option<String>)],
    ai: Option<&dyn AiConflictResolver>,
) -> ResolutionOutcome {
    if let Some(outcome) = try_auto_merge(conflict) {
        return outcome;
    }

    let ai_eligible = matches!(conflict.severity, ConflictSeverity::Medium | ConflictSeverity::High);
    if ai_eligible {
        if let Some(resolver) = ai {
            let prompt = build_resolution_prompt(conflict, baseline_slice, task_snippets, task_intents);
            if let Ok((merged, tokens)) = resolver.resolve(&prompt).await {
                return ResolutionOutcome {
                    resolved: true,
                    merged_snippet: Some(merged),
                    used_ai: true,
                    tokens_used: tokens,
                };
            }
        }
    }

    ResolutionOutcome {
        resolved: false,
        merged_snippet: None,
        used_ai: false,
        tokens_used: 0,
    }
}

pub fn build_resolution_prompt(
    conflict: &ConflictRegion,
    baseline_slice: &str,
    task_snippets: &[(String, String)],
    task_intents: &[(String, Option<String>)],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("# Merge Conflict Resolution Required\n\n");
    prompt.push_str(&format!("**File:** {}\n", conflict.file_path.display()));
    prompt.push_str(&format!("**Location:** {}\n\n", conflict.logical_location));

    prompt.push_str("## Reason\n\n");
    prompt.push_str(&conflict.reason);
    prompt.push_str("\n\n");

    prompt.push_str("## Baseline\n\n```\n");
    prompt.push_str(baseline_slice);
    prompt.push_str("\n```\n\n");

    prompt.push_str("## Task Snippets\n\n");
    for (task_id, snippet) in task_snippets {
        prompt.push_str(&format!("### Task {task_id}\n\n```\n{snippet}\n```\n\n"));
        if let Some((_, Some(intent))) = task_intents.iter().find(|(id, _)| id == task_id) {
            prompt.push_str(&format!("Intent: {intent}\n\n"));
        }
    }

    prompt.push_str("## Instructions\n\n");
    prompt.push_str("Produce a single merged version that preserves the intent of every task snippet above. Respond with only the merged code.\n");

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn region(can_auto_merge: bool, strategy: Option<&str>, severity: ConflictSeverity) -> ConflictRegion {
        ConflictRegion {
            file_path: PathBuf::from("src/lib.rs"),
            logical_location: "helper".to_string(),
            task_ids: vec!["t1".to_string(), "t2".to_string()],
            severity,
            can_auto_merge,
            merge_strategy: strategy.map(|s| s.to_string()),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn dedup_removal_resolves_without_ai() {
        let conflict = region(true, Some("dedup_removal"), ConflictSeverity::Low);
        let outcome = try_auto_merge(&conflict).unwrap();
        assert!(outcome.resolved);
        assert!(!outcome.used_ai);
    }

    #[test]
    fn unknown_strategy_does_not_auto_merge() {
        let conflict = region(true, Some("unknown_strategy"), ConflictSeverity::Low);
        assert!(try_auto_merge(&conflict).is_none());
    }

    #[tokio::test]
    async fn falls_back_to_ai_for_medium_severity_without_auto_merge() {
        struct StubResolver;
        #[async_trait]
        impl AiConflictResolver for StubResolver {
            async fn resolve(&self, _prompt: &str) -> Result<(String, u64), String> {
                Ok(("merged code".to_string(), 42))
            }
        }
        let conflict = region(false, None, ConflictSeverity::Medium);
        let outcome = resolve_conflict(&conflict, "baseline", &[], &[], Some(&StubResolver)).await;
        assert!(outcome.resolved);
        assert!(outcome.used_ai);
        assert_eq!(outcome.tokens_used, 42);
    }

    #[tokio::test]
    async fn leaves_unresolved_without_ai_resolver() {
        let conflict = region(false, None, ConflictSeverity::High);
        let outcome = resolve_conflict(&conflict, "baseline", &[], &[], None).await;
        assert!(!outcome.resolved);
    }

    #[test]
    fn prompt_includes_all_task_snippets() {
        let conflict = region(false, None, ConflictSeverity::Medium);
        let prompt = build_resolution_prompt(
            &conflict,
            "fn helper() {}",
            &[("t1".to_string(), "fn helper() { 1 }".to_string())],
            &[("t1".to_string(), Some("add logging".to_string()))],
        );
        assert!(prompt.contains("Task t1"));
        assert!(prompt.contains("add logging"));
    }
}
