//! Shared data model for the merge pipeline (§3, §4.8).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::semantic::{SemanticChange, SemanticChangeKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub file_path: PathBuf,
    pub has_modifications: bool,
    #[serde(default)]
    pub semantic_changes: Vec<SemanticChange>,
    #[serde(default)]
    pub task_intent: Option<String>,
}

/// Per-file, per-task summary built before conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub file_path: PathBuf,
    pub task_id: String,
    pub adds: Vec<String>,
    pub modifies: Vec<String>,
    pub removes: Vec<String>,
    pub raw_changes: Vec<SemanticChange>,
}

impl FileAnalysis {
    pub fn from_snapshot(snapshot: &TaskSnapshot) -> Self {
        let mut adds = Vec::new();
        let mut modifies = Vec::new();
        let mut removes = Vec::new();
        for change in &snapshot.semantic_changes {
            match change.kind {
                SemanticChangeKind::AddFunction | SemanticChangeKind::AddImport | SemanticChangeKind::AddClass => {
                    adds.push(change.target.clone())
                }
                SemanticChangeKind::ModifyFunction | SemanticChangeKind::ModifyClass => {
                    modifies.push(change.target.clone())
                }
                SemanticChangeKind::RemoveFunction | SemanticChangeKind::RemoveImport => {
                    removes.push(change.target.clone())
                }
            }
        }
        Self {
            file_path: snapshot.file_path.clone(),
            task_id: snapshot.task_id.clone(),
            adds,
            modifies,
            removes,
            raw_changes: snapshot.semantic_changes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRegion {
    pub file_path: PathBuf,
    /// function name, import list identifier, or a `line:start-end` tag.
    pub logical_location: String,
    pub task_ids: Vec<String>,
    pub severity: ConflictSeverity,
    pub can_auto_merge: bool,
    #[serde(default)]
    pub merge_strategy: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    AutoMerged,
    AiMerged,
    DirectCopy,
    NeedsHumanReview,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub file_path: PathBuf,
    pub decision: MergeDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
    pub resolved_conflicts: Vec<ConflictRegion>,
    pub remaining_conflicts: Vec<ConflictRegion>,
    pub ai_calls: u32,
    pub tokens_used: u64,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Analyzing,
    DetectingConflicts,
    Resolving,
    Validating,
    Complete,
    Error,
}

impl ProgressStage {
    /// Stage-to-percent ranges from §4.8: each stage owns a quarter of the
    /// 0-100 scale, with per-item progress interpolated linearly inside it.
    pub fn range(self) -> (u8, u8) {
        match self {
            ProgressStage::Analyzing => (0, 25),
            ProgressStage::DetectingConflicts => (25, 50),
            ProgressStage::Resolving => (50, 75),
            ProgressStage::Validating => (75, 100),
            ProgressStage::Complete => (100, 100),
            ProgressStage::Error => (0, 0),
        }
    }

    pub fn interpolate(self, fraction: f64) -> u8 {
        let (lo, hi) = self.range();
        let clamped = fraction.clamp(0.0, 1.0);
        let value = lo as f64 + (hi as f64 - lo as f64) * clamped;
        value.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub stage: ProgressStage,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts_found: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts_resolved: Option<u32>,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, fraction: f64, message: impl Into<String>) -> Self {
        Self {
            event_type: "progress",
            percent: stage.interpolate(fraction),
            stage,
            message: message.into(),
            current_file: None,
            conflicts_found: None,
            conflicts_resolved: None,
        }
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.current_file = Some(path);
        self
    }

    pub fn with_conflicts(mut self, found: u32, resolved: u32) -> Self {
        self.conflicts_found = Some(found);
        self.conflicts_resolved = Some(resolved);
        self
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub files_processed: u32,
    pub files_auto_merged: u32,
    pub files_ai_merged: u32,
    pub files_need_review: u32,
    pub files_failed: u32,
    pub conflicts_detected: u32,
    pub conflicts_auto_resolved: u32,
    pub conflicts_ai_resolved: u32,
    pub ai_calls_made: u32,
    pub estimated_tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub file_results: BTreeMap<PathBuf, MergeResult>,
    pub stats: MergeStats,
    pub success: bool,
}

impl MergeReport {
    pub fn duration_seconds(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
