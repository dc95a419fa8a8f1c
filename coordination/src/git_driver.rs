//! Git Driver: a thin process-level wrapper with one responsibility — invoke
//! `git` (and mirror `gh`/`glab`) with an isolated environment so output
//! parsing is stable across machines.
//!
//! Adapted from `GitManager` in `harness/git_manager.rs`: the same
//! `Command::new` + explicit-env idiom, the same exponential-backoff
//! retry helper.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{classify_error_text, ErrorKind};

const RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executable {
    Git,
    Gh,
    Glab,
    /// `python3`/`python -m venv` and `-m pip install`, the seam
    /// `WorktreeManager::recreate_venv` spawns through (§4.3.4).
    Python,
}

impl Executable {
    fn program_name(self) -> &'static str {
        match self {
            Executable::Git => "git",
            Executable::Gh => "gh",
            Executable::Glab => "glab",
            Executable::Python => "python3",
        }
    }
}

/// Discovers and caches the resolved path of each external executable once
/// per process; invalidated on `ENOENT` so a later call re-discovers (e.g.
/// after the user installs `gh` mid-session).
pub struct GitDriver {
    cache: Mutex<[Option<String>; 4]>,
    max_retries: u32,
}

impl Default for GitDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GitDriver {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new([None, None, None, None]),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            cache: Mutex::new([None, None, None, None]),
            max_retries,
        }
    }

    fn slot(exe: Executable) -> usize {
        match exe {
            Executable::Git => 0,
            Executable::Gh => 1,
            Executable::Glab => 2,
            Executable::Python => 3,
        }
    }

    fn resolved_program(&self, exe: Executable) -> String {
        let mut cache = self.cache.lock().unwrap();
        let slot = Self::slot(exe);
        if let Some(cached) = &cache[slot] {
            return cached.clone();
        }
        let resolved = exe.program_name().to_string();
        cache[slot] = Some(resolved.clone());
        resolved
    }

    fn invalidate(&self, exe: Executable) {
        let mut cache = self.cache.lock().unwrap();
        cache[Self::slot(exe)] = None;
    }

    /// Invoke `git`/`gh`/`glab` with an isolated environment: no terminal
    /// prompts, no pager, English locale, so stdout/stderr parsing is
    /// stable regardless of the host's configuration.
    pub fn run(
        &self,
        exe: Executable,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> std::io::Result<CommandOutput> {
        let program = self.resolved_program(exe);
        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(cwd)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_PAGER", "cat")
            .env("PAGER", "cat")
            .env("LC_ALL", "C")
            .env("LANG", "C");

        let result = run_with_timeout(&mut cmd, timeout);
        if let Err(e) = &result {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.invalidate(exe);
            }
        }
        result
    }

    /// Retries on transient classes (lock contention, timeouts, network)
    /// with exponential backoff `RETRY_BASE_DELAY_MS * 2^attempt`.
    pub fn run_with_retry(
        &self,
        exe: Executable,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> std::io::Result<CommandOutput> {
        let mut last_err = None;
        for attempt in 0..self.max_retries {
            match self.run(exe, args, cwd, timeout) {
                Ok(output) if output.success() => return Ok(output),
                Ok(output) => {
                    let kind = classify_error_text(&output.stderr);
                    if kind == ErrorKind::GitTransient && attempt + 1 < self.max_retries {
                        std::thread::sleep(Duration::from_millis(
                            RETRY_BASE_DELAY_MS * (1 << attempt),
                        ));
                        last_err = None;
                        continue;
                    }
                    return Ok(output);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < self.max_retries {
                        std::thread::sleep(Duration::from_millis(
                            RETRY_BASE_DELAY_MS * (1 << attempt),
                        ));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "retries exhausted")
        }))
    }
}

fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> std::io::Result<CommandOutput> {
    use std::io::Read;
    use std::process::Stdio;

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let start = std::time::Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout);
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            return Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "command timed out",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Parse a GitHub PR URL out of `gh` output.
pub fn extract_github_pr_url(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"https://[^\s]+/pull/\d+").unwrap();
    re.find(text).map(|m| m.as_str().to_string())
}

/// Parse a GitLab MR URL out of `glab` output.
pub fn extract_gitlab_mr_url(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"https://[^\s]+(?:/merge_requests/|/-/merge_requests/)\d+").unwrap();
    re.find(text).map(|m| m.as_str().to_string())
}

pub fn already_exists(stderr: &str) -> bool {
    stderr.to_lowercase().contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        let driver = GitDriver::new();
        driver
            .run(Executable::Git, &["init"], dir, Duration::from_secs(5))
            .unwrap();
        driver
            .run(
                Executable::Git,
                &["config", "user.email", "test@example.com"],
                dir,
                Duration::from_secs(5),
            )
            .unwrap();
        driver
            .run(
                Executable::Git,
                &["config", "user.name", "Test"],
                dir,
                Duration::from_secs(5),
            )
            .unwrap();
    }

    #[test]
    fn runs_git_and_captures_output() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let driver = GitDriver::new();
        let out = driver
            .run(Executable::Git, &["status"], dir.path(), Duration::from_secs(5))
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("No commits yet") || out.stdout.contains("nothing to commit"));
    }

    #[test]
    fn extracts_github_pr_url() {
        let text = "Creating PR...\nhttps://github.com/acme/repo/pull/42\ndone";
        assert_eq!(
            extract_github_pr_url(text),
            Some("https://github.com/acme/repo/pull/42".to_string())
        );
    }

    #[test]
    fn extracts_gitlab_mr_url() {
        let text = "https://gitlab.com/acme/repo/-/merge_requests/7";
        assert!(extract_gitlab_mr_url(text).is_some());
    }

    #[test]
    fn detects_already_exists_in_stderr() {
        assert!(already_exists("a pull request already exists for branch foo"));
        assert!(!already_exists("some other error"));
    }
}
