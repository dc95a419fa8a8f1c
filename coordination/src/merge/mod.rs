//! Intent-Aware Merge Pipeline (§4.8): file-evolution tracking, conflict
//! detection, deterministic + AI-assisted resolution, progress events, and
//! the merge report.

pub mod detector;
pub mod lock;
pub mod pipeline;
pub mod resolver;
pub mod types;

pub use detector::{combine_non_conflicting_changes, detect_conflicts};
pub use lock::MergeLock;
pub use pipeline::{
    merge_many_files, merge_multi_task, merge_single_task, null_sink, persist_report, JsonLinesSink, MergeOrchestrator,
    ProgressSink,
};
pub use resolver::{build_resolution_prompt, resolve_conflict, try_auto_merge, AiConflictResolver, ResolutionOutcome};
pub use types::{
    ConflictRegion, ConflictSeverity, FileAnalysis, MergeDecision, MergeReport, MergeResult, MergeStats,
    ProgressEvent, ProgressStage, TaskSnapshot,
};
