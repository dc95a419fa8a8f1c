//! Merge orchestrator: single- and multi-task entry points, progress
//! emission, and report persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::detector::{combine_non_conflicting_changes, detect_conflicts};
use super::resolver::{resolve_conflict, AiConflictResolver, ResolutionOutcome};
use super::types::{
    ConflictRegion, ConflictSeverity, FileAnalysis, MergeDecision, MergeReport, MergeResult, MergeStats,
    ProgressEvent, ProgressStage, TaskSnapshot,
};
use crate::error::ForgeResult;
use crate::semantic::{SemanticChange, SemanticChangeKind};

pub trait ProgressSink {
    fn emit(&mut self, event: ProgressEvent);
}

/// Writes each event as one JSON line, the newline-delimited progress
/// stream format consumers tail on stdout.
pub struct JsonLinesSink<W: std::io::Write> {
    writer: W,
}

impl<W: std::io::Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: std::io::Write> ProgressSink for JsonLinesSink<W> {
    fn emit(&mut self, event: ProgressEvent) {
        let _ = writeln!(self.writer, "{}", event.to_json_line());
    }
}

/// Single-task merge (§4.8): deterministic apply of semantic changes, or
/// direct copy when the analyzer could not express the edit, or a no-op.
pub fn merge_single_task(baseline: &str, snapshot: &TaskSnapshot, worktree_content: Option<&str>) -> MergeResult {
    if !snapshot.semantic_changes.is_empty() {
        return MergeResult {
            file_path: snapshot.file_path.clone(),
            decision: MergeDecision::AutoMerged,
            merged_content: Some(apply_semantic_changes(baseline, snapshot, worktree_content)),
            resolved_conflicts: Vec::new(),
            remaining_conflicts: Vec::new(),
            ai_calls: 0,
            tokens_used: 0,
            explanation: format!("applied {} semantic change(s) from task {}", snapshot.semantic_changes.len(), snapshot.task_id),
        };
    }

    if snapshot.has_modifications {
        return MergeResult {
            file_path: snapshot.file_path.clone(),
            decision: MergeDecision::DirectCopy,
            merged_content: worktree_content.map(|s| s.to_string()),
            resolved_conflicts: Vec::new(),
            remaining_conflicts: Vec::new(),
            ai_calls: 0,
            tokens_used: 0,
            explanation: "analyzer could not express the edit; copying worktree content verbatim".to_string(),
        };
    }

    MergeResult {
        file_path: snapshot.file_path.clone(),
        decision: MergeDecision::AutoMerged,
        merged_content: Some(baseline.to_string()),
        resolved_conflicts: Vec::new(),
        remaining_conflicts: Vec::new(),
        ai_calls: 0,
        tokens_used: 0,
        explanation: "no modifications; baseline unchanged".to_string(),
    }
}

/// Deterministic application of a single task's semantic changes: each
/// change's own `line_start`/`line_end` is read out of that task's worktree
/// content and grafted into the baseline (appended for additions, spliced
/// in place for modifications, deleted for removals). Without the task's
/// content there is nothing to graft, so the baseline passes through
/// unchanged.
fn apply_semantic_changes(baseline: &str, snapshot: &TaskSnapshot, worktree_content: Option<&str>) -> String {
    let Some(content) = worktree_content else {
        return baseline.to_string();
    };
    let snippets = [(snapshot.task_id.clone(), content.to_string())];
    let changes: Vec<(&str, &SemanticChange)> = snapshot
        .semantic_changes
        .iter()
        .map(|c| (snapshot.task_id.as_str(), c))
        .collect();
    graft_changes(baseline, &changes, &snippets)
}

/// Looks up the line range `[line_start, line_end]` (1-indexed, inclusive)
/// inside a task's own file text.
fn extract_snippet(content: &str, line_start: u32, line_end: u32) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }
    let start = line_start.saturating_sub(1) as usize;
    let end = (line_end as usize).min(lines.len());
    if start >= end || start >= lines.len() {
        return None;
    }
    Some(lines[start..end].join("\n"))
}

fn find_task_snippet<'a>(task_snippets: &'a [(String, String)], task_id: &str) -> Option<&'a str> {
    task_snippets.iter().find(|(id, _)| id == task_id).map(|(_, s)| s.as_str())
}

/// Replaces `[line_start, line_end]` (1-indexed, inclusive) in `content`
/// with `replacement`.
fn splice_lines(content: &str, line_start: u32, line_end: u32, replacement: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = (line_start.saturating_sub(1) as usize).min(lines.len());
    let end = (line_end as usize).min(lines.len()).max(start);
    let mut result: Vec<&str> = Vec::with_capacity(lines.len());
    result.extend_from_slice(&lines[..start]);
    result.extend(replacement.lines());
    result.extend_from_slice(&lines[end..]);
    result.join("\n")
}

/// Removes `[line_start, line_end]` (1-indexed, inclusive) from `content`.
fn remove_lines(content: &str, line_start: u32, line_end: u32) -> String {
    splice_lines(content, line_start, line_end, "")
}

fn append_snippet(mut merged: String, snippet: &str) -> String {
    if merged.contains(snippet) {
        return merged;
    }
    if !merged.is_empty() && !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged.push('\n');
    merged.push_str(snippet);
    merged.push('\n');
    merged
}

/// Applies one task's change to the merged text so far: additions are
/// appended (skipped if already present verbatim), modifications are
/// spliced in at the change's own line range, removals delete that range.
/// The line range comes from the task's post-edit file, so splicing
/// assumes the target function still sits at roughly the same lines in
/// the merged text — true when it's the only edit touching that region,
/// which is what "non-conflicting" means here.
fn graft_change(merged: String, task_id: &str, change: &SemanticChange, task_snippets: &[(String, String)]) -> String {
    match change.kind {
        SemanticChangeKind::RemoveFunction | SemanticChangeKind::RemoveImport => {
            remove_lines(&merged, change.line_start, change.line_end)
        }
        SemanticChangeKind::AddFunction | SemanticChangeKind::AddClass | SemanticChangeKind::AddImport => {
            let Some(source) = find_task_snippet(task_snippets, task_id) else { return merged };
            let Some(snippet) = extract_snippet(source, change.line_start, change.line_end) else { return merged };
            append_snippet(merged, &snippet)
        }
        SemanticChangeKind::ModifyFunction | SemanticChangeKind::ModifyClass => {
            let Some(source) = find_task_snippet(task_snippets, task_id) else { return merged };
            let Some(snippet) = extract_snippet(source, change.line_start, change.line_end) else { return merged };
            splice_lines(&merged, change.line_start, change.line_end, &snippet)
        }
    }
}

/// Grafts a sequence of (task_id, change) pairs into `baseline` in order.
fn graft_changes(baseline: &str, changes: &[(&str, &SemanticChange)], task_snippets: &[(String, String)]) -> String {
    let mut merged = baseline.to_string();
    for (task_id, change) in changes {
        merged = graft_change(merged, task_id, change, task_snippets);
    }
    merged
}

/// The line range a resolved conflict's region occupies: any involved
/// task's own semantic change for that target carries `[line_start,
/// line_end]`, and since it's a conflict over an existing symbol (a
/// modify/modify or remove/remove, never a fresh add), that range is where
/// the symbol sits in the baseline too.
fn conflict_line_range(conflict: &ConflictRegion, analyses: &[FileAnalysis]) -> Option<(u32, u32)> {
    analyses
        .iter()
        .flat_map(|a| a.raw_changes.iter())
        .find(|c| c.target == conflict.logical_location)
        .map(|c| (c.line_start, c.line_end))
}

/// §4.8 step 4 result applied to the merged text: the AI resolver's
/// `merged_snippet` is substituted at the conflict's own line range when
/// one is known (falls back to appending it), and an auto-merge with no
/// snippet (the `dedup_removal` strategy) deletes the conflicting range.
fn apply_resolved_conflict(
    merged: String,
    conflict: &ConflictRegion,
    outcome: &ResolutionOutcome,
    analyses: &[FileAnalysis],
) -> String {
    let range = conflict_line_range(conflict, analyses);
    match (&outcome.merged_snippet, range) {
        (Some(snippet), Some((start, end))) => splice_lines(&merged, start, end, snippet),
        (Some(snippet), None) => append_snippet(merged, snippet),
        (None, Some((start, end))) => remove_lines(&merged, start, end),
        (None, None) => merged,
    }
}

/// Multi-task merge (§4.8 steps 1-5).
pub async fn merge_multi_task(
    file_path: &Path,
    snapshots: &[TaskSnapshot],
    baseline: &str,
    task_snippets: &[(String, String)],
    ai: Option<&dyn AiConflictResolver>,
    sink: &mut dyn ProgressSink,
) -> MergeResult {
    sink.emit(ProgressEvent::new(ProgressStage::Analyzing, 0.0, "analyzing file evolution").with_file(file_path.to_path_buf()));
    let analyses: Vec<FileAnalysis> = snapshots.iter().map(FileAnalysis::from_snapshot).collect();
    sink.emit(ProgressEvent::new(ProgressStage::Analyzing, 1.0, "analysis complete"));

    // Two tasks both modifying the file without an extractable semantic
    // change (each would `direct_copy` alone) can't be reconciled without
    // the text the analyzer failed to parse; neither copy is preferable to
    // the other, so this is open-question decision #3 (see DESIGN.md):
    // escalate rather than silently picking one.
    let direct_copy_tasks: Vec<String> = snapshots
        .iter()
        .filter(|s| s.has_modifications && s.semantic_changes.is_empty())
        .map(|s| s.task_id.clone())
        .collect();
    if direct_copy_tasks.len() > 1 {
        let conflict = ConflictRegion {
            file_path: file_path.to_path_buf(),
            logical_location: "whole file (unparseable edits)".to_string(),
            task_ids: direct_copy_tasks,
            severity: ConflictSeverity::High,
            can_auto_merge: false,
            merge_strategy: None,
            reason: "multiple tasks modified this file with no extractable semantic changes".to_string(),
        };
        sink.emit(
            ProgressEvent::new(ProgressStage::Complete, 1.0, "direct-copy collision needs human review")
                .with_conflicts(1, 0),
        );
        return MergeResult {
            file_path: file_path.to_path_buf(),
            decision: MergeDecision::NeedsHumanReview,
            merged_content: None,
            resolved_conflicts: Vec::new(),
            remaining_conflicts: vec![conflict],
            ai_calls: 0,
            tokens_used: 0,
            explanation: "multiple unparseable edits to the same file; cannot auto-resolve".to_string(),
        };
    }

    sink.emit(ProgressEvent::new(ProgressStage::DetectingConflicts, 0.0, "detecting conflicts"));
    let conflicts = detect_conflicts(&analyses);
    sink.emit(
        ProgressEvent::new(ProgressStage::DetectingConflicts, 1.0, "conflict detection complete")
            .with_conflicts(conflicts.len() as u32, 0),
    );

    if conflicts.is_empty() {
        let combined = combine_non_conflicting_changes(&analyses, &conflicts);
        let merged = graft_changes(baseline, &combined, task_snippets);
        sink.emit(ProgressEvent::new(ProgressStage::Validating, 1.0, "no conflicts; combined cleanly"));
        return MergeResult {
            file_path: file_path.to_path_buf(),
            decision: MergeDecision::AutoMerged,
            merged_content: Some(merged),
            resolved_conflicts: Vec::new(),
            remaining_conflicts: Vec::new(),
            ai_calls: 0,
            tokens_used: 0,
            explanation: format!("{} non-conflicting change(s) combined", combined.len()),
        };
    }

    sink.emit(ProgressEvent::new(ProgressStage::Resolving, 0.0, "resolving conflicts"));
    let mut resolved = Vec::new();
    let mut remaining = Vec::new();
    let mut ai_calls = 0u32;
    let mut tokens_used = 0u64;
    let mut any_ai = false;
    // No in-process resolver crash path exists in this implementation; a
    // future out-of-process AI resolver would set this on IPC failure.
    let resolver_died = false;

    let intents: Vec<(String, Option<String>)> = snapshots
        .iter()
        .map(|s| (s.task_id.clone(), s.task_intent.clone()))
        .collect();

    let mut merged = baseline.to_string();
    let total = conflicts.len();
    for (idx, conflict) in conflicts.iter().enumerate() {
        let fraction = (idx + 1) as f64 / total as f64;
        let outcome = resolve_conflict(conflict, baseline, task_snippets, &intents, ai).await;
        if outcome.used_ai {
            ai_calls += 1;
            tokens_used += outcome.tokens_used;
            any_ai = true;
        }
        if outcome.resolved {
            merged = apply_resolved_conflict(merged, conflict, &outcome, &analyses);
            resolved.push(conflict.clone());
        } else {
            remaining.push(conflict.clone());
        }
        sink.emit(
            ProgressEvent::new(ProgressStage::Resolving, fraction, format!("resolved {}/{}", idx + 1, total))
                .with_conflicts(total as u32, resolved.len() as u32),
        );
    }

    sink.emit(ProgressEvent::new(ProgressStage::Validating, 1.0, "validating merged result"));

    let decision = if resolver_died {
        MergeDecision::Failed
    } else if !remaining.is_empty() {
        MergeDecision::NeedsHumanReview
    } else if any_ai {
        MergeDecision::AiMerged
    } else {
        MergeDecision::AutoMerged
    };

    sink.emit(ProgressEvent::new(ProgressStage::Complete, 1.0, format!("{decision:?}")));

    MergeResult {
        file_path: file_path.to_path_buf(),
        decision,
        merged_content: if decision == MergeDecision::Failed { None } else { Some(merged) },
        resolved_conflicts: resolved,
        remaining_conflicts: remaining,
        ai_calls,
        tokens_used,
        explanation: format!("{} conflict(s) detected, {} resolved", total, ai_calls),
    }
}

/// Wraps an inner sink to scope a run of events to one file within a larger
/// multi-file merge: stamps `current_file` on every event that doesn't
/// already carry one, and rescales this file's own 0-100 percent into the
/// `[lo, hi)` slice of the overall run, so the combined stream's `percent`
/// stays monotonically non-decreasing across every file.
struct ScopedSink<'a> {
    inner: &'a mut dyn ProgressSink,
    file_path: PathBuf,
    lo: f64,
    hi: f64,
}

impl ProgressSink for ScopedSink<'_> {
    fn emit(&mut self, mut event: ProgressEvent) {
        if event.current_file.is_none() {
            event.current_file = Some(self.file_path.clone());
        }
        let local = event.percent as f64 / 100.0;
        let scaled = self.lo + local * (self.hi - self.lo);
        event.percent = scaled.round().clamp(0.0, 100.0) as u8;
        self.inner.emit(event);
    }
}

/// Runs `merge_multi_task` across many files in sequence, one file at a
/// time, rescaling each file's progress into its slice of the overall run.
pub async fn merge_many_files(
    files: &[(PathBuf, Vec<TaskSnapshot>, String)],
    task_snippets: &[(String, String)],
    ai: Option<&dyn AiConflictResolver>,
    sink: &mut dyn ProgressSink,
) -> BTreeMap<PathBuf, MergeResult> {
    let total = files.len().max(1);
    let mut results = BTreeMap::new();
    for (idx, (file_path, snapshots, baseline)) in files.iter().enumerate() {
        let lo = idx as f64 / total as f64 * 100.0;
        let hi = (idx + 1) as f64 / total as f64 * 100.0;
        let mut scoped = ScopedSink {
            inner: &mut *sink,
            file_path: file_path.clone(),
            lo,
            hi,
        };
        let result = merge_multi_task(file_path, snapshots, baseline, task_snippets, ai, &mut scoped).await;
        results.insert(file_path.clone(), result);
    }
    results
}

/// Runs a full merge across many files and persists the report. Writes
/// merged output under `merge_output_dir` unless `apply_to_project` is set,
/// in which case `project_root` is written to directly.
pub struct MergeOrchestrator {
    pub apply_to_project: bool,
    pub merge_output_dir: PathBuf,
    pub project_root: PathBuf,
}

impl MergeOrchestrator {
    pub fn write_target(&self, file_path: &Path) -> PathBuf {
        if self.apply_to_project {
            self.project_root.join(file_path)
        } else {
            self.merge_output_dir.join(file_path)
        }
    }

    pub fn write_result(&self, result: &MergeResult) -> ForgeResult<()> {
        if let Some(content) = &result.merged_content {
            let dest = self.write_target(&result.file_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, content)?;
        }
        Ok(())
    }

    pub fn build_report(
        started_at: chrono::DateTime<chrono::Utc>,
        results: BTreeMap<PathBuf, MergeResult>,
    ) -> MergeReport {
        let mut stats = MergeStats::default();
        for result in results.values() {
            stats.files_processed += 1;
            match result.decision {
                MergeDecision::AutoMerged | MergeDecision::DirectCopy => stats.files_auto_merged += 1,
                MergeDecision::AiMerged => stats.files_ai_merged += 1,
                MergeDecision::NeedsHumanReview => stats.files_need_review += 1,
                MergeDecision::Failed => stats.files_failed += 1,
            }
            stats.conflicts_detected += (result.resolved_conflicts.len() + result.remaining_conflicts.len()) as u32;
            // Every AI-resolved conflict costs exactly one AI call (see
            // `merge_multi_task`), so `resolved_conflicts.len() - ai_calls`
            // is the count this file resolved without AI. Deriving
            // auto-resolved from `conflicts_detected - ai_resolved` instead
            // would also count this file's *unresolved* conflicts as
            // auto-resolved.
            stats.conflicts_auto_resolved += (result.resolved_conflicts.len() as u32).saturating_sub(result.ai_calls);
            stats.conflicts_ai_resolved += result.ai_calls;
            stats.ai_calls_made += result.ai_calls;
            stats.estimated_tokens_used += result.tokens_used;
        }

        MergeReport {
            started_at,
            ended_at: chrono::Utc::now(),
            success: stats.files_failed == 0,
            file_results: results,
            stats,
        }
    }
}

pub fn persist_report(report: &MergeReport, dir: &Path, run_id: &str) -> ForgeResult<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{run_id}.json"));
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[derive(Default)]
struct NullSink;
impl ProgressSink for NullSink {
    fn emit(&mut self, _event: ProgressEvent) {}
}

pub fn null_sink() -> impl ProgressSink {
    NullSink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::{SemanticChange, SemanticChangeKind};
    use tempfile::tempdir;

    fn snapshot(task_id: &str, has_modifications: bool, changes: Vec<SemanticChange>) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.to_string(),
            file_path: "src/lib.rs".into(),
            has_modifications,
            semantic_changes: changes,
            task_intent: None,
        }
    }

    #[test]
    fn single_task_direct_copy_when_unparseable() {
        let snap = snapshot("t1", true, Vec::new());
        let result = merge_single_task("old", &snap, Some("new content"));
        assert_eq!(result.decision, MergeDecision::DirectCopy);
        assert_eq!(result.merged_content.as_deref(), Some("new content"));
    }

    #[test]
    fn single_task_noop_without_modifications() {
        let snap = snapshot("t1", false, Vec::new());
        let result = merge_single_task("baseline", &snap, None);
        assert_eq!(result.decision, MergeDecision::AutoMerged);
        assert_eq!(result.merged_content.as_deref(), Some("baseline"));
    }

    #[test]
    fn single_task_grafts_added_function_from_worktree_content() {
        let snap = snapshot(
            "t1",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "one".into(), line_start: 3, line_end: 5, body_hash: None }],
        );
        let task_content = "fn existing() {}\n\nfn one() {\n    1\n}\n";
        let result = merge_single_task("fn existing() {}\n", &snap, Some(task_content));
        assert_eq!(result.decision, MergeDecision::AutoMerged);
        let merged = result.merged_content.unwrap();
        assert!(merged.contains("fn existing() {}"));
        assert!(merged.contains("fn one() {"));
    }

    /// S5: two tasks each add a distinct function to the same file with no
    /// conflict; the combine path must produce content containing both new
    /// functions in their original source order, not the untouched baseline.
    #[tokio::test]
    async fn multi_task_no_conflicts_auto_merges() {
        let baseline = "fn existing() {}\n";
        let t1_content = "fn existing() {}\n\nfn one() {\n    1\n}\n";
        let t2_content = "fn existing() {}\n\nfn two() {\n    2\n}\n";
        let a = snapshot(
            "t1",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "one".into(), line_start: 3, line_end: 5, body_hash: None }],
        );
        let b = snapshot(
            "t2",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "two".into(), line_start: 3, line_end: 5, body_hash: None }],
        );
        let task_snippets = [("t1".to_string(), t1_content.to_string()), ("t2".to_string(), t2_content.to_string())];
        let mut sink = null_sink();
        let result = merge_multi_task(Path::new("src/lib.rs"), &[a, b], baseline, &task_snippets, None, &mut sink).await;
        assert_eq!(result.decision, MergeDecision::AutoMerged);
        let merged = result.merged_content.expect("auto-merged result must carry merged content");
        assert!(merged.contains("fn one() {"));
        assert!(merged.contains("fn two() {"));
        assert!(merged.find("fn one").unwrap() < merged.find("fn two").unwrap());
    }

    /// S6: two tasks both modify `shared`; with AI enabled and a stub
    /// resolver, the conflict must resolve to `ai_merged` with the AI
    /// output substituted at the conflict's line range in the merged text.
    #[tokio::test]
    async fn multi_task_conflicting_modify_substitutes_ai_output_at_line_range() {
        use async_trait::async_trait;

        struct StubResolver;
        #[async_trait]
        impl AiConflictResolver for StubResolver {
            async fn resolve(&self, _prompt: &str) -> Result<(String, u64), String> {
                Ok(("fn shared() {\n    resolved();\n}".to_string(), 7))
            }
        }

        let baseline = "fn shared() {\n    old();\n}\n";
        let a = snapshot(
            "t1",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "shared".into(), line_start: 1, line_end: 3, body_hash: None }],
        );
        let b = snapshot(
            "t2",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "shared".into(), line_start: 1, line_end: 3, body_hash: None }],
        );
        let mut sink = null_sink();
        let result = merge_multi_task(Path::new("src/lib.rs"), &[a, b], baseline, &[], Some(&StubResolver), &mut sink).await;
        assert_eq!(result.decision, MergeDecision::AiMerged);
        let merged = result.merged_content.expect("ai-merged result must carry merged content");
        assert!(merged.contains("resolved()"));
        assert!(!merged.contains("old()"));
    }

    #[tokio::test]
    async fn multi_task_unresolved_conflict_needs_human_review() {
        let a = snapshot(
            "t1",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "shared".into(), line_start: 1, line_end: 2, body_hash: None }],
        );
        let b = snapshot(
            "t2",
            true,
            vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "shared".into(), line_start: 1, line_end: 2, body_hash: None }],
        );
        let mut sink = null_sink();
        let result = merge_multi_task(Path::new("src/lib.rs"), &[a, b], "baseline", &[], None, &mut sink).await;
        assert_eq!(result.decision, MergeDecision::NeedsHumanReview);
    }

    #[tokio::test]
    async fn multi_task_direct_copy_collision_needs_human_review() {
        let a = snapshot("t1", true, Vec::new());
        let b = snapshot("t2", true, Vec::new());
        let mut sink = null_sink();
        let result = merge_multi_task(Path::new("src/lib.rs"), &[a, b], "baseline", &[], None, &mut sink).await;
        assert_eq!(result.decision, MergeDecision::NeedsHumanReview);
        assert!(result.merged_content.is_none());
        assert_eq!(result.remaining_conflicts.len(), 1);
        assert_eq!(result.remaining_conflicts[0].task_ids, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Vec<ProgressEvent>,
    }
    impl ProgressSink for CollectingSink {
        fn emit(&mut self, event: ProgressEvent) {
            self.events.push(event);
        }
    }

    #[tokio::test]
    async fn four_file_merge_emits_ordered_monotonic_progress_stream() {
        let clean_a = (
            PathBuf::from("a.rs"),
            vec![
                snapshot("t1", true, vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "one".into(), line_start: 1, line_end: 2, body_hash: None }]),
                snapshot("t2", true, vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "two".into(), line_start: 1, line_end: 2, body_hash: None }]),
            ],
            "baseline a".to_string(),
        );
        let clean_b = (
            PathBuf::from("b.rs"),
            vec![
                snapshot("t1", true, vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "three".into(), line_start: 1, line_end: 2, body_hash: None }]),
                snapshot("t2", true, vec![SemanticChange { kind: SemanticChangeKind::AddFunction, target: "four".into(), line_start: 1, line_end: 2, body_hash: None }]),
            ],
            "baseline b".to_string(),
        );
        let conflict_c = (
            PathBuf::from("c.rs"),
            vec![
                snapshot("t1", true, vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "shared".into(), line_start: 1, line_end: 2, body_hash: None }]),
                snapshot("t2", true, vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "shared".into(), line_start: 1, line_end: 2, body_hash: None }]),
            ],
            "baseline c".to_string(),
        );
        let conflict_d = (
            PathBuf::from("d.rs"),
            vec![
                snapshot("t1", true, vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "other".into(), line_start: 1, line_end: 2, body_hash: None }]),
                snapshot("t2", true, vec![SemanticChange { kind: SemanticChangeKind::ModifyFunction, target: "other".into(), line_start: 1, line_end: 2, body_hash: None }]),
            ],
            "baseline d".to_string(),
        );

        let files = vec![clean_a, clean_b, conflict_c, conflict_d];
        let mut sink = CollectingSink::default();
        let results = merge_many_files(&files, &[], None, &mut sink).await;

        assert_eq!(results.len(), 4);
        let review_count = results.values().filter(|r| r.decision == MergeDecision::NeedsHumanReview).count();
        assert_eq!(review_count, 2);

        let resolving_events: Vec<_> = sink.events.iter().filter(|e| e.stage == ProgressStage::Resolving).collect();
        assert!(resolving_events.len() >= 4);
        assert!(resolving_events.iter().all(|e| e.current_file.is_some()));

        assert!(sink.events.iter().all(|e| e.current_file.is_some()));

        let mut last_percent = 0u8;
        for event in &sink.events {
            assert!(event.percent <= 100);
            assert!(event.percent >= last_percent, "percent regressed: {} < {}", event.percent, last_percent);
            last_percent = event.percent;
        }
        assert_eq!(sink.events.last().unwrap().percent, 100);

        let first_stage = sink.events.first().unwrap().stage;
        assert_eq!(first_stage, ProgressStage::Analyzing);
        let last_stage = sink.events.last().unwrap().stage;
        assert_eq!(last_stage, ProgressStage::Complete);
    }

    #[test]
    fn report_success_iff_no_failed_files() {
        let mut results = BTreeMap::new();
        results.insert(
            PathBuf::from("a.rs"),
            MergeResult {
                file_path: "a.rs".into(),
                decision: MergeDecision::AutoMerged,
                merged_content: Some("x".into()),
                resolved_conflicts: Vec::new(),
                remaining_conflicts: Vec::new(),
                ai_calls: 0,
                tokens_used: 0,
                explanation: String::new(),
            },
        );
        let report = MergeOrchestrator::build_report(chrono::Utc::now(), results);
        assert!(report.success);
        assert_eq!(report.stats.files_processed, 1);
    }

    #[test]
    fn auto_resolved_stat_excludes_conflicts_left_for_human_review() {
        let conflict = |id: &str| ConflictRegion {
            file_path: "a.rs".into(),
            logical_location: id.to_string(),
            task_ids: vec![id.to_string()],
            severity: ConflictSeverity::Low,
            can_auto_merge: true,
            merge_strategy: Some("dedup_removal".to_string()),
            reason: "duplicate import".to_string(),
        };
        let mut results = BTreeMap::new();
        results.insert(
            PathBuf::from("a.rs"),
            MergeResult {
                file_path: "a.rs".into(),
                decision: MergeDecision::NeedsHumanReview,
                merged_content: Some("x".into()),
                // One conflict resolved without AI, one left unresolved.
                resolved_conflicts: vec![conflict("auto")],
                remaining_conflicts: vec![conflict("needs-review")],
                ai_calls: 0,
                tokens_used: 0,
                explanation: String::new(),
            },
        );
        let report = MergeOrchestrator::build_report(chrono::Utc::now(), results);
        assert_eq!(report.stats.conflicts_detected, 2);
        assert_eq!(report.stats.conflicts_auto_resolved, 1);
        assert_eq!(report.stats.conflicts_ai_resolved, 0);
        assert_eq!(report.stats.files_need_review, 1);
    }

    #[test]
    fn persists_report_atomically() {
        let dir = tempdir().unwrap();
        let report = MergeOrchestrator::build_report(chrono::Utc::now(), BTreeMap::new());
        persist_report(&report, dir.path(), "run-1").unwrap();
        assert!(dir.path().join("run-1.json").exists());
    }
}
