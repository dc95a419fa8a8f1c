//! Implementation Plan Engine: typed phases/subtasks, status transitions,
//! progress accounting, dependency resolution, and atomic persistence.
//!
//! Persistence follows `FeatureRegistry::load_with_recovery`/`save`'s
//! pattern: write to a `.tmp` sibling, `fs::rename` over the primary,
//! and keep a best-effort `.backup` copy so a corrupted primary can be
//! recovered from the last good write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{ForgeError, ForgeResult};

// ---------------------------------------------------------------------------
// Subtask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    Command,
    Api,
    Browser,
    Component,
    Manual,
    None,
}

/// How to check a subtask. Fields are deliberately optional per-kind — the
/// spec treats a `command` verification with no shell, or a `browser`
/// verification with no scenario, as accepted input rather than a load
/// error (see DESIGN.md Open Question 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    pub kind: Option<VerificationKind>,
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub expected_substring: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default = "default_pending")]
    pub status: SubtaskStatus,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub all_services: bool,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub patterns_from: Vec<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub critique: Option<serde_json::Value>,
}

fn default_pending() -> SubtaskStatus {
    SubtaskStatus::Pending
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: SubtaskStatus::Pending,
            service: None,
            all_services: false,
            files_to_modify: Vec::new(),
            files_to_create: Vec::new(),
            patterns_from: Vec::new(),
            verification: None,
            expected_output: None,
            actual_output: None,
            started_at: None,
            completed_at: None,
            session_id: None,
            critique: None,
        }
    }

    /// Enforces the invariant: `completed_at` set iff status is completed;
    /// `started_at` set once the subtask has ever entered `in_progress`;
    /// resetting to pending clears both.
    pub fn set_status(&mut self, status: SubtaskStatus, now: DateTime<Utc>) {
        match status {
            SubtaskStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
            }
            SubtaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = None;
            }
            SubtaskStatus::Completed => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = Some(now);
            }
            SubtaskStatus::Blocked | SubtaskStatus::Failed => {
                self.completed_at = None;
            }
        }
        self.status = status;
    }

    pub fn is_terminal_done(&self) -> bool {
        self.status == SubtaskStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Setup,
    Implementation,
    Investigation,
    Integration,
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub phase: u32,
    pub name: String,
    #[serde(default = "default_phase_type")]
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(alias = "chunks")]
    pub subtasks: Vec<Subtask>,
}

fn default_phase_type() -> PhaseType {
    PhaseType::Implementation
}

impl Phase {
    /// An empty phase is considered complete (skipped).
    pub fn is_complete(&self) -> bool {
        self.subtasks.iter().all(|s| s.is_terminal_done())
    }

    pub fn dependencies_satisfied(&self, completed_phase_numbers: &HashSet<u32>) -> bool {
        self.depends_on
            .iter()
            .all(|p| completed_phase_numbers.contains(p))
    }
}

// ---------------------------------------------------------------------------
// ImplementationPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Feature,
    Refactor,
    Investigation,
    Migration,
    Simple,
    Development,
    Enhancement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceStatus {
    Backlog,
    InProgress,
    AiReview,
    HumanReview,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Review,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub spec_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub total_phases: usize,
    pub completed_phases: usize,
    pub total_subtasks: usize,
    pub completed_subtasks: usize,
    pub failed_subtasks: usize,
    pub percent_complete: f64,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    #[serde(alias = "title")]
    pub feature: String,
    #[serde(default = "default_workflow_type")]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub final_acceptance: Vec<String>,
    pub metadata: PlanMetadata,
    #[serde(default = "default_surface_status")]
    pub status: SurfaceStatus,
    #[serde(default = "default_plan_status")]
    pub plan_status: PlanStatus,
    #[serde(default)]
    pub recovery_note: Option<String>,
    #[serde(default)]
    pub qa_signoff: Option<serde_json::Value>,
}

fn default_workflow_type() -> WorkflowType {
    WorkflowType::Feature
}
fn default_surface_status() -> SurfaceStatus {
    SurfaceStatus::Backlog
}
fn default_plan_status() -> PlanStatus {
    PlanStatus::Pending
}

impl ImplementationPlan {
    pub fn new(feature: impl Into<String>, workflow_type: WorkflowType, spec_file: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            feature: feature.into(),
            workflow_type,
            services: Vec::new(),
            phases: Vec::new(),
            final_acceptance: Vec::new(),
            metadata: PlanMetadata {
                created_at: now,
                updated_at: now,
                spec_file,
            },
            status: SurfaceStatus::Backlog,
            plan_status: PlanStatus::Pending,
            recovery_note: None,
            qa_signoff: None,
        }
    }

    /// Parses a JSON document per §4.1's loader tolerance rules: unknown
    /// workflow types fall back to `feature` with a warning, missing
    /// `feature`/`workflow_type`/`phases` are defaulted, phase numbers
    /// default positionally, `chunks` is read as an alias for `subtasks`.
    /// Unknown phase types or subtask statuses are hard errors (they are
    /// not defaulted — see serde's strict enum matching below).
    pub fn load(path: &Path) -> ForgeResult<Self> {
        let raw = std::fs::read(path)?;
        let mut value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
            ForgeError::MalformedPlan {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        if let Some(obj) = value.as_object_mut() {
            obj.entry("feature").or_insert_with(|| "untitled".into());
            let unknown_workflow = obj
                .get("workflow_type")
                .and_then(|v| v.as_str())
                .map(|s| {
                    !matches!(
                        s,
                        "feature" | "refactor" | "investigation" | "migration" | "simple"
                            | "development" | "enhancement"
                    )
                })
                .unwrap_or(false);
            if unknown_workflow || !obj.contains_key("workflow_type") {
                obj.insert("workflow_type".into(), "feature".into());
            }
            obj.entry("phases").or_insert_with(|| serde_json::json!([]));
            if let Some(phases) = obj.get_mut("phases").and_then(|p| p.as_array_mut()) {
                for (idx, phase) in phases.iter_mut().enumerate() {
                    if let Some(phase_obj) = phase.as_object_mut() {
                        phase_obj
                            .entry("phase")
                            .or_insert_with(|| (idx as u64 + 1).into());
                    }
                }
            }
            obj.entry("metadata").or_insert_with(|| {
                let now = Utc::now().to_rfc3339();
                serde_json::json!({"created_at": now, "updated_at": now})
            });
        }

        serde_json::from_value(value).map_err(|e| ForgeError::MalformedPlan {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Recovers from a `.backup` sibling when the primary is missing or
    /// corrupt (mirrors `FeatureRegistry::load_with_recovery`).
    pub fn load_with_recovery(path: &Path) -> ForgeResult<Self> {
        match Self::load(path) {
            Ok(plan) => Ok(plan),
            Err(primary_err) => {
                let backup = path.with_extension("json.backup");
                if backup.exists() {
                    if let Ok(plan) = Self::load(&backup) {
                        tracing::warn!(
                            path = %path.display(),
                            "recovered implementation plan from .backup after load failure"
                        );
                        plan.save(path)?;
                        return Ok(plan);
                    }
                }
                Err(primary_err)
            }
        }
    }

    /// Atomically writes the plan (write-temp-then-rename), re-deriving
    /// surface status, and updating `updated_at`.
    pub fn save(&self, path: &Path) -> ForgeResult<()> {
        let mut to_write = self.clone();
        to_write.metadata.updated_at = Utc::now();
        to_write.apply_derived_status();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let backup = path.with_extension("json.backup");
            let _ = std::fs::copy(path, backup);
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&to_write)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Derived status rule, applied on every save (§3).
    fn apply_derived_status(&mut self) {
        let total: usize = self.phases.iter().map(|p| p.subtasks.len()).sum();
        if total == 0 {
            self.status = SurfaceStatus::Backlog;
            self.plan_status = PlanStatus::Pending;
            return;
        }
        let all_subtasks: Vec<&Subtask> = self.phases.iter().flat_map(|p| &p.subtasks).collect();
        let any_failed = all_subtasks.iter().any(|s| s.status == SubtaskStatus::Failed);
        let any_in_progress = all_subtasks
            .iter()
            .any(|s| s.status == SubtaskStatus::InProgress);
        let some_completed = all_subtasks
            .iter()
            .any(|s| s.status == SubtaskStatus::Completed);
        let all_completed = all_subtasks.iter().all(|s| s.status == SubtaskStatus::Completed);

        if all_completed && self.qa_signoff.is_some() {
            self.status = SurfaceStatus::HumanReview;
            self.plan_status = PlanStatus::Review;
        } else if all_completed {
            self.status = SurfaceStatus::AiReview;
            self.plan_status = PlanStatus::Review;
        } else if any_failed || any_in_progress || some_completed {
            self.status = SurfaceStatus::InProgress;
            self.plan_status = PlanStatus::InProgress;
        } else {
            self.status = SurfaceStatus::Backlog;
            self.plan_status = PlanStatus::Pending;
        }
    }

    fn completed_phase_numbers(&self) -> HashSet<u32> {
        self.phases
            .iter()
            .filter(|p| p.is_complete())
            .map(|p| p.phase)
            .collect()
    }

    /// First eligible phase in declaration order, first pending subtask in
    /// declaration order. Blocked subtasks are never offered.
    pub fn next_subtask(&self) -> Option<(u32, &Subtask)> {
        let completed = self.completed_phase_numbers();
        for phase in &self.phases {
            if !phase.dependencies_satisfied(&completed) {
                continue;
            }
            if let Some(subtask) = phase
                .subtasks
                .iter()
                .find(|s| s.status == SubtaskStatus::Pending)
            {
                return Some((phase.phase, subtask));
            }
        }
        None
    }

    /// Mutable lookup by subtask id, used by the coder loop and recovery
    /// manager to apply status transitions without re-scanning phases by
    /// hand at every call site.
    pub fn find_subtask_mut(&mut self, subtask_id: &str) -> Option<&mut Subtask> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.subtasks.iter_mut())
            .find(|s| s.id == subtask_id)
    }

    pub fn find_subtask(&self, subtask_id: &str) -> Option<&Subtask> {
        self.phases
            .iter()
            .flat_map(|p| &p.subtasks)
            .find(|s| s.id == subtask_id)
    }

    pub fn available_phases(&self) -> Vec<&Phase> {
        let completed = self.completed_phase_numbers();
        self.phases
            .iter()
            .filter(|p| p.dependencies_satisfied(&completed) && !p.is_complete())
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let total_phases = self.phases.len();
        let completed_phases = self.phases.iter().filter(|p| p.is_complete()).count();
        let all_subtasks: Vec<&Subtask> = self.phases.iter().flat_map(|p| &p.subtasks).collect();
        let total_subtasks = all_subtasks.len();
        let completed_subtasks = all_subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count();
        let failed_subtasks = all_subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Failed)
            .count();
        let percent_complete = if total_subtasks == 0 {
            100.0
        } else {
            (completed_subtasks as f64 / total_subtasks as f64) * 100.0
        };
        let is_complete = completed_subtasks == total_subtasks && failed_subtasks == 0;
        Progress {
            total_phases,
            completed_phases,
            total_subtasks,
            completed_subtasks,
            failed_subtasks,
            percent_complete,
            is_complete,
        }
    }

    /// Appends a new phase numbered max+1; `depends_on` is the set of all
    /// existing phase numbers; surface status transitions to in_progress;
    /// QA sign-off is cleared.
    pub fn add_followup_phase(
        &mut self,
        name: impl Into<String>,
        subtasks: Vec<Subtask>,
        phase_type: PhaseType,
        parallel_safe: bool,
    ) -> u32 {
        let existing: BTreeSet<u32> = self.phases.iter().map(|p| p.phase).collect();
        let next_number = existing.iter().max().copied().unwrap_or(0) + 1;
        self.phases.push(Phase {
            phase: next_number,
            name: name.into(),
            phase_type,
            depends_on: existing,
            parallel_safe,
            subtasks,
        });
        self.qa_signoff = None;
        self.status = SurfaceStatus::InProgress;
        self.plan_status = PlanStatus::InProgress;
        next_number
    }

    /// If the plan is in done/ai_review/human_review or all subtasks are
    /// completed, clears QA sign-off and recovery note and resets status to
    /// in_progress; returns whether it fired.
    pub fn reset_for_followup(&mut self) -> bool {
        let in_review_like = matches!(
            self.status,
            SurfaceStatus::Done | SurfaceStatus::AiReview | SurfaceStatus::HumanReview
        );
        let all_completed = self.progress().is_complete;
        if in_review_like || all_completed {
            self.qa_signoff = None;
            self.recovery_note = None;
            self.status = SurfaceStatus::InProgress;
            self.plan_status = PlanStatus::InProgress;
            true
        } else {
            false
        }
    }
}

pub fn default_plan_path(build_dir: &Path, spec_name: &str) -> PathBuf {
    build_dir
        .join("specs")
        .join(spec_name)
        .join("implementation_plan.json")
}
