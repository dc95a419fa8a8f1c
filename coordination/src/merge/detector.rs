//! Conflict Detector: pairwise comparison of per-task `FileAnalysis`
//! summaries for files touched by more than one task.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{ConflictRegion, ConflictSeverity, FileAnalysis};
use crate::semantic::SemanticChangeKind;

/// Two tasks adding the same function name with byte-identical bodies are
/// **not** a conflict — open-question decision #2 (see DESIGN.md): identity
/// is the tie-break this heuristic uses when two tasks land the same name.
/// Identity is judged by `SemanticChange::body_hash`; a change with no hash
/// (the analyzer couldn't attach one) is conservatively treated as
/// conflicting with anything else of the same name.
pub fn detect_conflicts(analyses: &[FileAnalysis]) -> Vec<ConflictRegion> {
    let mut conflicts = Vec::new();
    if analyses.len() < 2 {
        return conflicts;
    }
    let file_path = analyses[0].file_path.clone();

    // same target name added by >1 task
    let mut add_bodies: BTreeMap<&str, Vec<(&str, Option<u64>)>> = BTreeMap::new();
    for analysis in analyses {
        for change in &analysis.raw_changes {
            if matches!(
                change.kind,
                SemanticChangeKind::AddFunction | SemanticChangeKind::AddClass
            ) {
                add_bodies
                    .entry(change.target.as_str())
                    .or_default()
                    .push((analysis.task_id.as_str(), change.body_hash));
            }
        }
    }
    for (target, bodies) in &add_bodies {
        if bodies.len() < 2 {
            continue;
        }
        let first_hash = bodies[0].1;
        let all_identical = first_hash.is_some() && bodies.iter().all(|(_, h)| *h == first_hash);
        if all_identical {
            continue;
        }
        let task_ids: Vec<String> = bodies.iter().map(|(t, _)| t.to_string()).collect();
        conflicts.push(ConflictRegion {
            file_path: file_path.clone(),
            logical_location: target.to_string(),
            task_ids,
            severity: ConflictSeverity::High,
            can_auto_merge: false,
            merge_strategy: None,
            reason: format!("multiple tasks add function/class `{target}`"),
        });
    }

    // same symbol removed by >1 task — one deduped conflict, auto-mergeable
    let mut remove_tasks: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for analysis in analyses {
        for target in &analysis.removes {
            remove_tasks
                .entry(target.as_str())
                .or_default()
                .insert(analysis.task_id.as_str());
        }
    }
    for (target, tasks) in &remove_tasks {
        if tasks.len() < 2 {
            continue;
        }
        conflicts.push(ConflictRegion {
            file_path: file_path.clone(),
            logical_location: target.to_string(),
            task_ids: tasks.iter().map(|t| t.to_string()).collect(),
            severity: ConflictSeverity::Low,
            can_auto_merge: true,
            merge_strategy: Some("dedup_removal".to_string()),
            reason: format!("multiple tasks remove `{target}`, deduplicated"),
        });
    }

    // same function modified by >1 task — medium severity, AI-eligible
    let mut modify_tasks: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for analysis in analyses {
        for target in &analysis.modifies {
            modify_tasks
                .entry(target.as_str())
                .or_default()
                .insert(analysis.task_id.as_str());
        }
    }
    for (target, tasks) in &modify_tasks {
        if tasks.len() < 2 {
            continue;
        }
        conflicts.push(ConflictRegion {
            file_path: file_path.clone(),
            logical_location: target.to_string(),
            task_ids: tasks.iter().map(|t| t.to_string()).collect(),
            severity: ConflictSeverity::Medium,
            can_auto_merge: false,
            merge_strategy: None,
            reason: format!("multiple tasks modify function `{target}`"),
        });
    }

    // Different imports added by different tasks are never a conflict —
    // intentionally no detection code for that case.

    conflicts
}

/// Changes with no overlapping target across tasks can be combined
/// directly without going through the resolver. Each change keeps the id
/// of the task it came from, since grafting its content back into the
/// merged file needs to know whose snippet to pull the body from.
pub fn combine_non_conflicting_changes<'a>(
    analyses: &'a [FileAnalysis],
    conflicts: &[ConflictRegion],
) -> Vec<(&'a str, &'a crate::semantic::SemanticChange)> {
    let conflicted_targets: BTreeSet<&str> = conflicts
        .iter()
        .map(|c| c.logical_location.as_str())
        .collect();
    analyses
        .iter()
        .flat_map(|a| a.raw_changes.iter().map(move |c| (a.task_id.as_str(), c)))
        .filter(|(_, c)| !conflicted_targets.contains(c.target.as_str()))
        .collect()
}
