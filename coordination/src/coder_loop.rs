//! Coder Loop (§4.6): drives subtasks through agent sessions with retry,
//! pause-file cooperation, and memory hooks.
//!
//! Grounded on `crates/forge-agents/src/orchestrator.rs`'s overall loop
//! shape (select work → run → route outcome → repeat) and its
//! never-propagate-collaborator-failure idiom for insight extraction,
//! retargeted from multi-specialist routing onto the single
//! `AgentClient` session contract in [`crate::session`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorKind, ForgeResult};
use crate::git_driver::{Executable, GitDriver};
use crate::plan::{ImplementationPlan, SubtaskStatus};
use crate::recovery::RecoveryManager;
use crate::resilience::{FileMemoryStore, Insight, MemoryStore};
use crate::session::{self, AgentClient};

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub const MAX_CONCURRENCY_RETRIES: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_LOOP_DELAY: Duration = Duration::from_secs(3);

const PAUSE_FILE: &str = "PAUSE";
const RATE_LIMIT_PAUSE_FILE: &str = "RATE_LIMIT_PAUSE";
const AUTH_PAUSE_FILE: &str = "AUTH_PAUSE";
const RESUME_FILE: &str = "RESUME";

/// Builds the prompt for one subtask. The prompt generator itself is an
/// external collaborator; the loop depends only on this trait.
pub trait PromptGenerator: Send + Sync {
    fn build_prompt(&self, plan: &ImplementationPlan, phase: u32, subtask_id: &str) -> String;
}

/// Extracts a short insight summary from a finished session. An external
/// collaborator boundary: failures here must never abort the build.
pub trait InsightExtractor: Send + Sync {
    fn extract(&self, response_text: &str, success: bool) -> String;
}

/// Cooperative sleep hook, seamed out so tests can run the loop without
/// real wall-clock delays.
pub trait Clock: Send + Sync {
    fn sleep(&self, d: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, d: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(d))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Complete,
    AllRemainingStuck,
    Paused,
}

pub struct CoderLoop<'a> {
    pub client: &'a dyn AgentClient,
    pub prompts: &'a dyn PromptGenerator,
    pub insights: &'a dyn InsightExtractor,
    pub memory: &'a dyn MemoryStore,
    pub clock: &'a dyn Clock,
    pub project_root: PathBuf,
    pub spec_dir: PathBuf,
    pub plan_path: PathBuf,
    pub session_id: String,
    pub loop_delay: Duration,
    git: GitDriver,
}

impl<'a> CoderLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a dyn AgentClient,
        prompts: &'a dyn PromptGenerator,
        insights: &'a dyn InsightExtractor,
        memory: &'a dyn MemoryStore,
        clock: &'a dyn Clock,
        project_root: PathBuf,
        spec_dir: PathBuf,
        session_id: impl Into<String>,
    ) -> Self {
        let plan_path = spec_dir.join("implementation_plan.json");
        Self {
            client,
            prompts,
            insights,
            memory,
            clock,
            project_root,
            spec_dir,
            plan_path,
            session_id: session_id.into(),
            loop_delay: DEFAULT_LOOP_DELAY,
            git: GitDriver::new(),
        }
    }

    /// Current `HEAD` sha, or `None` if it can't be read (e.g. an empty
    /// repository) — good-commit recording is best-effort, never fatal.
    fn read_head(&self) -> Option<String> {
        self.git
            .run(Executable::Git, &["rev-parse", "HEAD"], &self.project_root, HEAD_READ_TIMEOUT)
            .ok()
            .filter(|out| out.success())
            .map(|out| out.stdout.trim().to_string())
    }

    fn pause_path(&self, name: &str) -> PathBuf {
        self.spec_dir.join(name)
    }

    /// Drives the plan to completion, one subtask per turn, honoring
    /// pause files between turns (§6.3).
    pub async fn run(&self, recovery: &mut RecoveryManager) -> ForgeResult<BuildOutcome> {
        loop {
            if self.pause_path(PAUSE_FILE).exists() {
                return Ok(BuildOutcome::Paused);
            }

            let mut plan = ImplementationPlan::load_with_recovery(&self.plan_path)?;
            let Some((phase, subtask_id)) = select_next_unstuck(&plan, recovery) else {
                let progress = plan.progress();
                if progress.is_complete {
                    tracing::info!("build complete: all subtasks done");
                    return Ok(BuildOutcome::Complete);
                }
                return Ok(BuildOutcome::AllRemainingStuck);
            };

            self.run_subtask(&mut plan, phase, &subtask_id, recovery).await?;

            self.clock.sleep(self.loop_delay).await;
        }
    }

    async fn run_subtask(
        &self,
        plan: &mut ImplementationPlan,
        phase: u32,
        subtask_id: &str,
        recovery: &mut RecoveryManager,
    ) -> ForgeResult<()> {
        if let Some(s) = plan.find_subtask_mut(subtask_id) {
            s.set_status(SubtaskStatus::InProgress, chrono::Utc::now());
            s.session_id = Some(self.session_id.clone());
        }
        plan.save(&self.plan_path)?;

        let head_before = self.read_head();

        let prompt = self.prompts.build_prompt(plan, phase, subtask_id);
        let outcome = self.run_with_concurrency_retry(&prompt).await;

        // Read HEAD again before any recovery rollback runs inside
        // `post_session`, so a rolled-back commit never gets recorded as
        // a good one.
        let head_after = self.read_head();

        // The agent edits the plan file directly as part of doing the work
        // (marking the subtask done, adding follow-up phases, etc); reload
        // before deciding how to route the outcome.
        *plan = ImplementationPlan::load_with_recovery(&self.plan_path)?;

        self.post_session(plan, subtask_id, outcome, recovery, head_before.as_deref(), head_after.as_deref())?;
        plan.save(&self.plan_path)?;
        Ok(())
    }

    /// Step 5 (§4.6): concurrency-error retry loop with exponential
    /// backoff (2, 4, 8, 16, 32s across 5 attempts, then terminal).
    /// Rate-limit and auth classes pause independently of this budget
    /// (§4.5/§6.3) — they're handled inside `submit_with_pauses` on every
    /// submission, including retries.
    async fn run_with_concurrency_retry(&self, prompt: &str) -> session::SessionOutcome {
        let mut outcome = self.submit_with_pauses(prompt).await;
        for attempt in 1..=MAX_CONCURRENCY_RETRIES {
            let is_tool_concurrency = outcome
                .error_info
                .as_ref()
                .map(|e| e.kind == ErrorKind::ToolConcurrency)
                .unwrap_or(false);
            if !is_tool_concurrency {
                return outcome;
            }
            let delay = std::cmp::min(INITIAL_RETRY_DELAY * 2u32.pow(attempt - 1), MAX_RETRY_DELAY);
            tracing::warn!(attempt, delay_secs = delay.as_secs(), "tool concurrency error, retrying");
            self.clock.sleep(delay).await;
            outcome = self.submit_with_pauses(prompt).await;
        }
        outcome
    }

    /// Submits once, transparently pausing for rate-limit / auth errors
    /// via the pause-file protocol (§6.3) and resubmitting on resume.
    /// Returns the first outcome that is not one of those two classes.
    async fn submit_with_pauses(&self, prompt: &str) -> session::SessionOutcome {
        loop {
            let outcome = session::run_turn(self.client, prompt, &self.spec_dir).await;
            let Some(err) = &outcome.error_info else {
                return outcome;
            };
            match err.kind {
                ErrorKind::RateLimit => {
                    if self
                        .wait_for_resume(RATE_LIMIT_PAUSE_FILE, session::MAX_RATE_LIMIT_WAIT, session::RATE_LIMIT_POLL_SECS)
                        .await
                    {
                        continue;
                    }
                    return outcome;
                }
                ErrorKind::Authentication => {
                    if self
                        .wait_for_resume(AUTH_PAUSE_FILE, session::MAX_AUTH_WAIT, session::AUTH_POLL_SECS)
                        .await
                    {
                        continue;
                    }
                    return outcome;
                }
                _ => return outcome,
            }
        }
    }

    /// Creates the pause marker, polls for `RESUME` up to `max_wait`,
    /// deletes both files on resume. Returns whether resume happened
    /// before the deadline.
    async fn wait_for_resume(&self, pause_file: &str, max_wait: Duration, poll_secs: u64) -> bool {
        let pause_path = self.pause_path(pause_file);
        let _ = std::fs::write(&pause_path, b"");
        let resume_path = self.pause_path(RESUME_FILE);

        let poll = Duration::from_secs(poll_secs);
        let mut waited = Duration::ZERO;
        while waited < max_wait {
            if resume_path.exists() {
                let _ = std::fs::remove_file(&pause_path);
                let _ = std::fs::remove_file(&resume_path);
                return true;
            }
            self.clock.sleep(poll).await;
            waited += poll;
        }
        let _ = std::fs::remove_file(&pause_path);
        false
    }

    /// Step 6 (§4.6): inspects the reloaded subtask status and routes to
    /// the recovery manager or records success, then extracts insights
    /// regardless of outcome.
    fn post_session(
        &self,
        plan: &mut ImplementationPlan,
        subtask_id: &str,
        outcome: session::SessionOutcome,
        recovery: &mut RecoveryManager,
        head_before: Option<&str>,
        head_after: Option<&str>,
    ) -> ForgeResult<()> {
        let status = plan.find_subtask(subtask_id).map(|s| s.status);
        let success = status == Some(SubtaskStatus::Completed);
        let error_text = outcome.error_info.as_ref().map(|e| e.message.clone());
        let new_commit = match (head_before, head_after) {
            (Some(before), Some(after)) if before != after => Some(after),
            _ => None,
        };

        match status {
            Some(SubtaskStatus::Completed) => {
                recovery.record_attempt(subtask_id, &self.session_id, true, &summarize(&outcome.response_text), None)?;
                if let Some(sha) = new_commit {
                    recovery.record_good_commit(sha, subtask_id)?;
                }
            }
            Some(SubtaskStatus::InProgress) => {
                let approach = summarize(&outcome.response_text);
                recovery.record_attempt(subtask_id, &self.session_id, false, &approach, error_text.as_deref())?;

                let is_tool_concurrency = outcome
                    .error_info
                    .as_ref()
                    .map(|e| e.kind == ErrorKind::ToolConcurrency)
                    .unwrap_or(false);

                if is_tool_concurrency {
                    if let Some(s) = plan.find_subtask_mut(subtask_id) {
                        s.set_status(SubtaskStatus::Pending, chrono::Utc::now());
                    }
                } else {
                    let error_for_policy = error_signal(&error_text, &outcome.response_text, "agent left subtask in_progress without completing");
                    let action = recovery.check_and_recover(subtask_id, &error_for_policy);
                    recovery.execute(&action, subtask_id, plan)?;
                    if let Some(sha) = new_commit {
                        recovery.record_good_commit(sha, subtask_id)?;
                    }
                }
            }
            _ => {
                // Failed, or any other non-terminal status the agent set.
                let approach = summarize(&outcome.response_text);
                recovery.record_attempt(subtask_id, &self.session_id, false, &approach, error_text.as_deref())?;
                let error_for_policy = error_signal(&error_text, &outcome.response_text, "subtask ended in a non-terminal, non-in_progress state");
                let action = recovery.check_and_recover(subtask_id, &error_for_policy);
                recovery.execute(&action, subtask_id, plan)?;
            }
        }

        self.save_insight(subtask_id, &outcome.response_text, success);
        Ok(())
    }

    /// Insight extraction never aborts the build on failure — mirrors the
    /// teacher's `query_kb_with_failsafe` never-propagate idiom.
    fn save_insight(&self, subtask_id: &str, response_text: &str, success: bool) {
        let summary = self.insights.extract(response_text, success);
        let insight = Insight {
            subtask_id: subtask_id.to_string(),
            session_id: self.session_id.clone(),
            summary,
            success,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.memory.save_insight(&insight) {
            tracing::warn!(subtask_id, error = %e, "insight extraction/storage failed, continuing");
        }
    }
}

/// Picks the text to feed the recovery manager's `check_and_recover`:
/// the classified error message if one exists, else the agent's raw
/// response text (still informative for "broken state" pattern matching),
/// else a generic placeholder.
fn error_signal(classified: &Option<String>, response_text: &str, placeholder: &str) -> String {
    if let Some(e) = classified {
        return e.clone();
    }
    let trimmed = response_text.trim();
    if trimmed.is_empty() {
        placeholder.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Same eligibility rule as `ImplementationPlan::next_subtask` (first
/// eligible phase in declaration order, first pending subtask in
/// declaration order) with one extra filter: a subtask already in the
/// recovery manager's stuck registry is skipped, per §4.6 step 2 ("If the
/// subtask was previously marked stuck, skip to next").
fn select_next_unstuck(plan: &ImplementationPlan, recovery: &RecoveryManager) -> Option<(u32, String)> {
    let completed: std::collections::HashSet<u32> = plan
        .phases
        .iter()
        .filter(|p| p.is_complete())
        .map(|p| p.phase)
        .collect();
    for phase in &plan.phases {
        if !phase.dependencies_satisfied(&completed) {
            continue;
        }
        if let Some(subtask) = phase
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Pending && !recovery.is_stuck(&s.id))
        {
            return Some((phase.phase, subtask.id.clone()));
        }
    }
    None
}

fn summarize(response_text: &str) -> String {
    let trimmed = response_text.trim();
    if trimmed.is_empty() {
        "(no response text)".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Default file-based memory store rooted at the build directory's
/// `memory/` subdirectory.
pub fn default_memory_store(spec_dir: &Path) -> FileMemoryStore {
    FileMemoryStore::new(spec_dir.join("memory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_driver::{Executable as Exe, GitDriver as Driver};
    use crate::plan::{Phase, PhaseType, Subtask, WorkflowType};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct ImmediateClock;
    impl Clock for ImmediateClock {
        fn sleep(&self, _d: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    struct StaticPrompt;
    impl PromptGenerator for StaticPrompt {
        fn build_prompt(&self, _plan: &ImplementationPlan, _phase: u32, subtask_id: &str) -> String {
            format!("work on {subtask_id}")
        }
    }

    struct NoopInsights;
    impl InsightExtractor for NoopInsights {
        fn extract(&self, _response_text: &str, success: bool) -> String {
            if success { "done".into() } else { "failed".into() }
        }
    }

    /// Scripted agent client: each call to `submit` pops the next
    /// scripted behavior and drives the plan file itself (as a real
    /// agent would, by editing files the worktree-synced plan reads
    /// from) before finishing the event stream.
    struct ScriptedClient {
        plan_path: PathBuf,
        project_root: Option<PathBuf>,
        calls: AtomicUsize,
        behaviors: Mutex<Vec<Behavior>>,
    }

    #[derive(Clone)]
    enum Behavior {
        CompleteSubtask(String),
        CompleteSubtaskWithCommit(String),
        ToolConcurrencyThenNothing,
        LeaveInProgressWithError(String),
    }

    #[async_trait]
    impl AgentClient for ScriptedClient {
        async fn submit(&self, _prompt: &str, _spec_dir: &Path) -> mpsc::Receiver<session::AgentEvent> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behaviors.lock().unwrap()[idx].clone();
            let (tx, rx) = mpsc::channel(8);
            match behavior {
                Behavior::CompleteSubtask(id) => {
                    let mut plan = ImplementationPlan::load(&self.plan_path).unwrap();
                    if let Some(s) = plan.find_subtask_mut(&id) {
                        s.set_status(SubtaskStatus::Completed, chrono::Utc::now());
                    }
                    plan.save(&self.plan_path).unwrap();
                    tx.send(session::AgentEvent::Text { body: "done".into() }).await.unwrap();
                    tx.send(session::AgentEvent::Result { subtype: "success".into() }).await.unwrap();
                }
                Behavior::CompleteSubtaskWithCommit(id) => {
                    let root = self.project_root.as_ref().unwrap();
                    std::fs::write(root.join("a.txt"), "two").unwrap();
                    let driver = Driver::new();
                    driver.run(Exe::Git, &["add", "."], root, Duration::from_secs(30)).unwrap();
                    driver
                        .run(Exe::Git, &["commit", "-m", "subtask work"], root, Duration::from_secs(30))
                        .unwrap();

                    let mut plan = ImplementationPlan::load(&self.plan_path).unwrap();
                    if let Some(s) = plan.find_subtask_mut(&id) {
                        s.set_status(SubtaskStatus::Completed, chrono::Utc::now());
                    }
                    plan.save(&self.plan_path).unwrap();
                    tx.send(session::AgentEvent::Text { body: "done".into() }).await.unwrap();
                    tx.send(session::AgentEvent::Result { subtype: "success".into() }).await.unwrap();
                }
                Behavior::ToolConcurrencyThenNothing => {
                    tx.send(session::AgentEvent::Text {
                        body: "Error 400: tool use already in progress, concurrent".into(),
                    })
                    .await
                    .unwrap();
                    tx.send(session::AgentEvent::Result { subtype: "error".into() }).await.unwrap();
                }
                Behavior::LeaveInProgressWithError(msg) => {
                    tx.send(session::AgentEvent::Text { body: msg }).await.unwrap();
                    tx.send(session::AgentEvent::Result { subtype: "success".into() }).await.unwrap();
                }
            }
            rx
        }
    }

    fn init_repo(dir: &Path) {
        let driver = Driver::new();
        let run = |args: &[&str]| driver.run(Exe::Git, args, dir, Duration::from_secs(30)).unwrap();
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "T"]);
        std::fs::write(dir.join("a.txt"), "one").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "first"]);
    }

    fn one_subtask_plan() -> ImplementationPlan {
        let mut plan = ImplementationPlan::new("feature", WorkflowType::Feature, None);
        plan.phases.push(Phase {
            phase: 1,
            name: "P1".into(),
            phase_type: PhaseType::Implementation,
            depends_on: BTreeSet::new(),
            parallel_safe: false,
            subtasks: vec![Subtask::new("t1", "do the thing")],
        });
        plan
    }

    #[tokio::test]
    async fn happy_path_completes_single_subtask() {
        let project = tempdir().unwrap();
        init_repo(project.path());
        let spec_dir = project.path().join(".auto-claude/specs/s1");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan_path = spec_dir.join("implementation_plan.json");
        one_subtask_plan().save(&plan_path).unwrap();

        let client = ScriptedClient {
            plan_path: plan_path.clone(),
            project_root: None,
            calls: AtomicUsize::new(0),
            behaviors: Mutex::new(vec![Behavior::CompleteSubtask("t1".into())]),
        };
        let prompts = StaticPrompt;
        let insights = NoopInsights;
        let memory = default_memory_store(&spec_dir);
        let clock = ImmediateClock;
        let mut recovery = RecoveryManager::new(project.path().to_path_buf(), spec_dir.join("recovery"));

        let loop_runner = CoderLoop::new(&client, &prompts, &insights, &memory, &clock, project.path().to_path_buf(), spec_dir.clone(), "sess-1");
        let outcome = loop_runner.run(&mut recovery).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);

        let plan = ImplementationPlan::load(&plan_path).unwrap();
        assert!(plan.progress().is_complete);
        assert_eq!(recovery.attempt_count("t1"), 1);
    }

    #[tokio::test]
    async fn completed_subtask_with_new_commit_records_good_commit() {
        let project = tempdir().unwrap();
        init_repo(project.path());
        let spec_dir = project.path().join(".auto-claude/specs/s1");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan_path = spec_dir.join("implementation_plan.json");
        one_subtask_plan().save(&plan_path).unwrap();

        let client = ScriptedClient {
            plan_path: plan_path.clone(),
            project_root: Some(project.path().to_path_buf()),
            calls: AtomicUsize::new(0),
            behaviors: Mutex::new(vec![Behavior::CompleteSubtaskWithCommit("t1".into())]),
        };
        let prompts = StaticPrompt;
        let insights = NoopInsights;
        let memory = default_memory_store(&spec_dir);
        let clock = ImmediateClock;
        let mut recovery = RecoveryManager::new(project.path().to_path_buf(), spec_dir.join("recovery"));

        let loop_runner = CoderLoop::new(&client, &prompts, &insights, &memory, &clock, project.path().to_path_buf(), spec_dir.clone(), "sess-1");
        let outcome = loop_runner.run(&mut recovery).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);

        let head = Driver::new()
            .run(Exe::Git, &["rev-parse", "HEAD"], project.path(), Duration::from_secs(30))
            .unwrap()
            .stdout
            .trim()
            .to_string();
        let good_commits = recovery.good_commits().to_vec();
        assert_eq!(good_commits.len(), 1);
        assert_eq!(good_commits[0].sha, head);
        assert_eq!(good_commits[0].subtask_id, "t1");
    }

    #[tokio::test]
    async fn tool_concurrency_retries_then_succeeds() {
        let project = tempdir().unwrap();
        init_repo(project.path());
        let spec_dir = project.path().join(".auto-claude/specs/s1");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan_path = spec_dir.join("implementation_plan.json");
        one_subtask_plan().save(&plan_path).unwrap();

        let client = ScriptedClient {
            plan_path: plan_path.clone(),
            project_root: None,
            calls: AtomicUsize::new(0),
            behaviors: Mutex::new(vec![
                Behavior::ToolConcurrencyThenNothing,
                Behavior::CompleteSubtask("t1".into()),
            ]),
        };
        let prompts = StaticPrompt;
        let insights = NoopInsights;
        let memory = default_memory_store(&spec_dir);
        let clock = ImmediateClock;
        let mut recovery = RecoveryManager::new(project.path().to_path_buf(), spec_dir.join("recovery"));

        let loop_runner = CoderLoop::new(&client, &prompts, &insights, &memory, &clock, project.path().to_path_buf(), spec_dir.clone(), "sess-1");
        loop_runner.run_subtask(&mut ImplementationPlan::load(&plan_path).unwrap(), 1, "t1", &mut recovery).await.unwrap();
        // run_subtask above saved its own plan snapshot; reload before
        // driving the full loop to pick up the scripted retry outcome.
        let outcome = loop_runner.run(&mut recovery).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Complete);

        let attempts = recovery.attempts_for("t1");
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert!(attempts[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .contains("concurren"));
        assert!(attempts[1].success);
    }

    #[tokio::test]
    async fn broken_workspace_rolls_back_to_good_commit() {
        let project = tempdir().unwrap();
        init_repo(project.path());
        let first_sha = {
            let driver = Driver::new();
            driver
                .run(Exe::Git, &["rev-parse", "HEAD"], project.path(), Duration::from_secs(30))
                .unwrap()
                .stdout
                .trim()
                .to_string()
        };
        let spec_dir = project.path().join(".auto-claude/specs/s1");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan_path = spec_dir.join("implementation_plan.json");
        one_subtask_plan().save(&plan_path).unwrap();

        let client = ScriptedClient {
            plan_path: plan_path.clone(),
            project_root: None,
            calls: AtomicUsize::new(0),
            behaviors: Mutex::new(vec![Behavior::LeaveInProgressWithError(
                "cargo build failed: cannot find type Foo".into(),
            )]),
        };
        let prompts = StaticPrompt;
        let insights = NoopInsights;
        let memory = default_memory_store(&spec_dir);
        let clock = ImmediateClock;
        let mut recovery = RecoveryManager::new(project.path().to_path_buf(), spec_dir.join("recovery"));
        recovery.record_good_commit(&first_sha, "t1").unwrap();

        let loop_runner = CoderLoop::new(&client, &prompts, &insights, &memory, &clock, project.path().to_path_buf(), spec_dir.clone(), "sess-1");
        let mut plan = ImplementationPlan::load(&plan_path).unwrap();
        loop_runner.run_subtask(&mut plan, 1, "t1", &mut recovery).await.unwrap();

        let reloaded = ImplementationPlan::load(&plan_path).unwrap();
        assert_eq!(reloaded.find_subtask("t1").unwrap().status, SubtaskStatus::Pending);
    }
}
