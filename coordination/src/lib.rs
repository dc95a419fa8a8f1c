//! Core library for the autonomous build runner: turns a feature
//! description into a dependency-ordered implementation plan, runs it to
//! completion in an isolated git worktree one subtask at a time, and merges
//! the result back with conflict-aware, intent-preserving diff resolution.
//!
//! # Modules
//!
//! - [`plan`]: the implementation plan — phases, subtasks, verification,
//!   and the on-disk JSON schema with legacy-field tolerance.
//! - [`git_driver`]: the single seam through which every git invocation in
//!   this crate runs, with retry on transient failures.
//! - [`worktree`]: creates, shares dependencies into, and merges back
//!   isolated git worktrees.
//! - [`session`]: drives one agent turn over a typed event stream
//!   ([`session::AgentClient`]) and classifies the outcome.
//! - [`coder_loop`]: drives subtasks through agent sessions end to end,
//!   with concurrency-error retry, pause-file cooperation, and insight
//!   capture.
//! - [`recovery`]: the deterministic policy tree that decides whether a
//!   failed subtask is rolled back, retried, skipped, or escalated.
//! - [`semantic`]: lightweight tree-sitter-based change classification used
//!   by the merge pipeline to tell intent-preserving edits from accidental
//!   ones.
//! - [`merge`]: the intent-aware merge pipeline — conflict detection,
//!   resolution strategies, and structured progress events.
//! - [`error`]: the crate's error taxonomy, string-based classification,
//!   and log/message sanitization.
//! - [`resilience`]: the [`resilience::MemoryStore`] boundary to the
//!   external insight store, with a file-based fallback.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod coder_loop;
pub mod error;
pub mod git_driver;
pub mod merge;
pub mod plan;
pub mod recovery;
pub mod resilience;
pub mod semantic;
pub mod session;
pub mod worktree;

pub use coder_loop::{BuildOutcome, Clock, CoderLoop, InsightExtractor, PromptGenerator, TokioClock};
pub use error::{classify_error_text, sanitize_error_string, ErrorKind, ForgeError, ForgeResult, StructuredError};
pub use git_driver::{CommandOutput, Executable, GitDriver};
pub use merge::{
    merge_many_files, merge_multi_task, merge_single_task, ConflictRegion, ConflictSeverity, FileAnalysis,
    MergeDecision, MergeLock, MergeOrchestrator, MergeReport, MergeResult, ProgressEvent, ProgressStage, TaskSnapshot,
};
pub use plan::{ImplementationPlan, Phase, PlanStatus, Subtask, SubtaskStatus, Verification, WorkflowType};
pub use recovery::{RecoveryAction, RecoveryManager, MAX_SUBTASK_RETRIES};
pub use resilience::{FileMemoryStore, Insight, MemoryStore};
pub use semantic::{analyze as analyze_semantic_changes, detect_language, AnalysisResult, SemanticChange, SemanticChangeKind, SourceLanguage};
pub use session::{AgentClient, AgentEvent, PauseSignal, SessionError, SessionOutcome, SessionStatus};
pub use worktree::{DependencyShareConfig, ForgeProvider, ShareStrategy, WorktreeInfo, WorktreeManager};
