//! Recovery Manager: attempt ledger, good-commit ledger, stuck registry,
//! and the deterministic `check_and_recover` policy.
//!
//! The policy tree is adapted from `EscalationEngine::decide`
//! (`escalation/engine.rs`): a pure function over state plus one signal,
//! returning a typed decision with no LLM call inside it. Rollback itself
//! is grounded in `git_manager.rs`'s `hard_rollback` existence check before
//! resetting.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{looks_transient, sanitize_error_string, ForgeError, ForgeResult};
use crate::git_driver::{Executable, GitDriver};

pub const MAX_SUBTASK_RETRIES: u32 = 5;
const APPROACH_MAX_LEN: usize = 100;
const ERROR_MAX_LEN: usize = 500;
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub session: String,
    pub success: bool,
    pub approach: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodCommitEntry {
    pub sha: String,
    pub subtask_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckEntry {
    pub subtask_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryLedgers {
    #[serde(default)]
    pub attempts: std::collections::BTreeMap<String, Vec<AttemptEntry>>,
    #[serde(default)]
    pub good_commits: Vec<GoodCommitEntry>,
    #[serde(default)]
    pub stuck: Vec<StuckEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Rollback { target_sha: String },
    Retry,
    Skip { reason: String },
    Escalate,
}

pub struct RecoveryManager {
    ledgers_dir: PathBuf,
    project_root: PathBuf,
    driver: GitDriver,
    ledgers: RecoveryLedgers,
}

impl RecoveryManager {
    pub fn new(project_root: PathBuf, ledgers_dir: PathBuf) -> Self {
        let ledgers = load_ledgers(&ledgers_dir).unwrap_or_default();
        Self {
            ledgers_dir,
            project_root,
            driver: GitDriver::new(),
            ledgers,
        }
    }

    fn persist(&self) -> ForgeResult<()> {
        std::fs::create_dir_all(&self.ledgers_dir)?;
        atomic_write_json(&self.ledgers_dir.join("attempts.json"), &self.ledgers.attempts)?;
        atomic_write_json(&self.ledgers_dir.join("good_commits.json"), &self.ledgers.good_commits)?;
        atomic_write_json(&self.ledgers_dir.join("stuck.json"), &self.ledgers.stuck)?;
        Ok(())
    }

    pub fn record_attempt(
        &mut self,
        subtask_id: &str,
        session: &str,
        success: bool,
        approach: &str,
        error: Option<&str>,
    ) -> ForgeResult<()> {
        let entry = AttemptEntry {
            session: session.to_string(),
            success,
            approach: truncate_chars(approach, APPROACH_MAX_LEN),
            error: error.map(|e| truncate_chars(&sanitize_error_string(e), ERROR_MAX_LEN)),
            timestamp: chrono::Utc::now(),
        };
        self.ledgers
            .attempts
            .entry(subtask_id.to_string())
            .or_default()
            .push(entry);
        self.persist()
    }

    /// Good-commit ledger is newest-first: each call prepends.
    pub fn record_good_commit(&mut self, sha: &str, subtask_id: &str) -> ForgeResult<()> {
        self.ledgers.good_commits.insert(
            0,
            GoodCommitEntry {
                sha: sha.to_string(),
                subtask_id: subtask_id.to_string(),
                timestamp: chrono::Utc::now(),
            },
        );
        self.persist()
    }

    pub fn mark_subtask_stuck(&mut self, subtask_id: &str, reason: &str) -> ForgeResult<()> {
        if let Some(existing) = self.ledgers.stuck.iter_mut().find(|s| s.subtask_id == subtask_id) {
            existing.reason = reason.to_string();
        } else {
            self.ledgers.stuck.push(StuckEntry {
                subtask_id: subtask_id.to_string(),
                reason: reason.to_string(),
            });
        }
        self.persist()
    }

    pub fn is_stuck(&self, subtask_id: &str) -> bool {
        self.ledgers.stuck.iter().any(|s| s.subtask_id == subtask_id)
    }

    pub fn attempt_count(&self, subtask_id: &str) -> usize {
        self.ledgers
            .attempts
            .get(subtask_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Oldest-first attempt history for a subtask.
    pub fn attempts_for(&self, subtask_id: &str) -> &[AttemptEntry] {
        self.ledgers
            .attempts
            .get(subtask_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Newest-first snapshot of the good-commit ledger.
    pub fn good_commits(&self) -> &[GoodCommitEntry] {
        &self.ledgers.good_commits
    }

    fn last_good_commit_for(&self, subtask_id: &str) -> Option<&GoodCommitEntry> {
        self.ledgers
            .good_commits
            .iter()
            .find(|g| g.subtask_id == subtask_id)
    }

    fn any_good_commit(&self) -> Option<&GoodCommitEntry> {
        self.ledgers.good_commits.first()
    }

    fn head_sha(&self) -> Option<String> {
        self.driver
            .run(Executable::Git, &["rev-parse", "HEAD"], &self.project_root, GIT_TIMEOUT)
            .ok()
            .map(|o| o.stdout.trim().to_string())
    }

    fn commit_exists(&self, sha: &str) -> bool {
        self.driver
            .run(Executable::Git, &["cat-file", "-t", sha], &self.project_root, GIT_TIMEOUT)
            .map(|o| o.success() && o.stdout.trim() == "commit")
            .unwrap_or(false)
    }

    /// `rollback_to_commit(sha) -> bool`: `git reset --hard <sha>` after
    /// verifying the commit exists.
    pub fn rollback_to_commit(&self, sha: &str) -> bool {
        if !self.commit_exists(sha) {
            return false;
        }
        self.driver
            .run(Executable::Git, &["reset", "--hard", sha], &self.project_root, GIT_TIMEOUT)
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Deterministic policy (§4.4). `error` is the sanitized or raw error
    /// text from the most recent failed attempt.
    pub fn check_and_recover(&self, subtask_id: &str, error: &str) -> RecoveryAction {
        let attempts = self.attempt_count(subtask_id) as u32;
        let good_commit = self
            .last_good_commit_for(subtask_id)
            .or_else(|| self.any_good_commit());

        if attempts > MAX_SUBTASK_RETRIES && good_commit.is_none() {
            return RecoveryAction::Escalate;
        }

        if let Some(good) = good_commit {
            let head = self.head_sha();
            let suggests_broken = looks_broken_state(error);
            if head.as_deref() != Some(good.sha.as_str()) && suggests_broken {
                return RecoveryAction::Rollback {
                    target_sha: good.sha.clone(),
                };
            }
        }

        if looks_transient(error) {
            return RecoveryAction::Retry;
        }

        RecoveryAction::Skip {
            reason: sanitize_error_string(error),
        }
    }

    /// Execute a `RecoveryAction` against the project + plan. Returns
    /// whether a rollback or reset actually happened (caller still invokes
    /// `mark_subtask_stuck` itself on `Skip`/`Escalate` for subtask text).
    pub fn execute(
        &mut self,
        action: &RecoveryAction,
        subtask_id: &str,
        plan: &mut crate::plan::ImplementationPlan,
    ) -> ForgeResult<()> {
        match action {
            RecoveryAction::Rollback { target_sha } => {
                let prefix: String = target_sha.chars().take(8).collect();
                tracing::warn!(subtask_id, target = %prefix, "rolling back to last good commit");
                if !self.rollback_to_commit(target_sha) {
                    return Err(ForgeError::Git {
                        operation: "reset --hard".into(),
                        message: format!("commit {target_sha} not found or reset failed"),
                    });
                }
                reset_subtask(plan, subtask_id)?;
            }
            RecoveryAction::Retry => {
                reset_subtask(plan, subtask_id)?;
            }
            RecoveryAction::Skip { reason } => {
                self.mark_subtask_stuck(subtask_id, reason)?;
            }
            RecoveryAction::Escalate => {
                self.mark_subtask_stuck(subtask_id, "max subtask retries exceeded with no good commit")?;
            }
        }
        Ok(())
    }
}

/// Resets a subtask to pending and clears its started/completed timestamps.
fn reset_subtask(plan: &mut crate::plan::ImplementationPlan, subtask_id: &str) -> ForgeResult<()> {
    for phase in plan.phases.iter_mut() {
        for subtask in phase.subtasks.iter_mut() {
            if subtask.id == subtask_id {
                subtask.set_status(crate::plan::SubtaskStatus::Pending, chrono::Utc::now());
                return Ok(());
            }
        }
    }
    Err(ForgeError::SubtaskNotFound {
        subtask_id: subtask_id.to_string(),
    })
}

fn looks_broken_state(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("compile")
        || lower.contains("build failed")
        || lower.contains("panic")
        || lower.contains("syntax error")
        || lower.contains("cannot find")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn load_ledgers(dir: &Path) -> Option<RecoveryLedgers> {
    let attempts = std::fs::read_to_string(dir.join("attempts.json"))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let good_commits = std::fs::read_to_string(dir.join("good_commits.json"))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let stuck = std::fs::read_to_string(dir.join("stuck.json"))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    Some(RecoveryLedgers {
        attempts,
        good_commits,
        stuck,
    })
}

/// Atomic write mirroring `plan.rs`'s `.tmp` + rename pattern.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> ForgeResult<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_driver::{Executable as Exe, GitDriver as Driver};
    use tempfile::tempdir;

    fn init_repo_with_commit(dir: &Path) -> String {
        let driver = Driver::new();
        let run = |args: &[&str]| driver.run(Exe::Git, args, dir, GIT_TIMEOUT).unwrap();
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("a.txt"), "one").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "first"]);
        run(&["rev-parse", "HEAD"]).stdout.trim().to_string()
    }

    #[test]
    fn attempt_count_and_good_commit_ledger() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        init_repo_with_commit(project.path());
        let mut mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        mgr.record_attempt("t1", "s1", false, "tried x", Some("it broke")).unwrap();
        mgr.record_attempt("t1", "s2", true, "tried y", None).unwrap();
        assert_eq!(mgr.attempt_count("t1"), 2);
        mgr.record_good_commit("abc123", "t1").unwrap();
        assert_eq!(mgr.ledgers.good_commits[0].sha, "abc123");
    }

    #[test]
    fn escalates_after_max_retries_with_no_good_commit() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        init_repo_with_commit(project.path());
        let mut mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        for _ in 0..=MAX_SUBTASK_RETRIES {
            mgr.record_attempt("t1", "s", false, "attempt", Some("fail")).unwrap();
        }
        assert_eq!(mgr.check_and_recover("t1", "generic failure"), RecoveryAction::Escalate);
    }

    #[test]
    fn rolls_back_when_broken_state_and_good_commit_diverge_from_head() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        let first_sha = init_repo_with_commit(project.path());
        let driver = Driver::new();
        std::fs::write(project.path().join("b.txt"), "two").unwrap();
        driver.run(Exe::Git, &["add", "."], project.path(), GIT_TIMEOUT).unwrap();
        driver
            .run(Exe::Git, &["commit", "-m", "second"], project.path(), GIT_TIMEOUT)
            .unwrap();

        let mut mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        mgr.record_good_commit(&first_sha, "t1").unwrap();

        let action = mgr.check_and_recover("t1", "cargo build failed: cannot find type");
        assert_eq!(action, RecoveryAction::Rollback { target_sha: first_sha });
    }

    #[test]
    fn retries_on_transient_error_without_good_commit() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        init_repo_with_commit(project.path());
        let mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        assert_eq!(mgr.check_and_recover("t1", "connection reset, network flake"), RecoveryAction::Retry);
    }

    #[test]
    fn skips_with_reason_for_non_transient_non_broken_error() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        init_repo_with_commit(project.path());
        let mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        match mgr.check_and_recover("t1", "assertion failed: expected 3 got 4") {
            RecoveryAction::Skip { reason } => assert!(reason.contains("assertion failed")),
            other => panic!("expected Skip, got {other:?}"),
        }
    }

    #[test]
    fn rollback_to_commit_rejects_unknown_sha() {
        let project = tempdir().unwrap();
        let ledgers = tempdir().unwrap();
        init_repo_with_commit(project.path());
        let mgr = RecoveryManager::new(project.path().to_path_buf(), ledgers.path().to_path_buf());
        assert!(!mgr.rollback_to_commit("0000000000000000000000000000000000000000"));
    }
}
