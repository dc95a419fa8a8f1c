//! Workspace & Worktree Manager: per-spec git worktrees with dependency
//! sharing, branch lifecycle, idempotent creation, stale-directory
//! recovery, push-and-PR pipeline with retry, age-based cleanup.
//!
//! Generalized from `WorktreeBridge`
//! (`crates/forge-agents/src/worktree_bridge.rs`): the `git worktree add -b
//! <branch> <path>` / `git worktree remove` / `git worktree list
//! --porcelain` idiom is kept; the additional lifecycle steps below are new
//! code in the same style, grounded secondarily in `git_driver.rs`'s retry
//! helper for push/PR.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{classify_error_text, ErrorKind, ForgeError, ForgeResult};
use crate::git_driver::{already_exists, Executable, GitDriver};

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const FORGE_MUTATION_TIMEOUT: Duration = Duration::from_secs(60);
const FORGE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const VENV_TIMEOUT: Duration = Duration::from_secs(120);
const OLD_WORKTREE_DAYS: i64 = 30;
const WARN_WORKTREE_COUNT: usize = 10;
const CRITICAL_WORKTREE_COUNT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeStats {
    pub commits_ahead_of_base: u32,
    pub files_changed: u32,
    pub additions: u32,
    pub deletions: u32,
    pub last_commit_date: Option<chrono::DateTime<chrono::Utc>>,
    pub days_since_last_commit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub spec_name: String,
    pub base_branch: String,
    pub is_active: bool,
    pub stats: Option<WorktreeStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStrategy {
    Symlink,
    Recreate,
    Copy,
    Skip,
}

#[derive(Debug, Clone)]
pub struct DependencyShareConfig {
    pub type_id: &'static str,
    pub strategy: ShareStrategy,
    /// project-relative source path
    pub source_path: &'static str,
    pub requirements_file: Option<&'static str>,
}

/// Data-driven strategy map keyed by dependency-type id (§4.3.4).
pub fn dependency_share_table() -> &'static [DependencyShareConfig] {
    &[
        DependencyShareConfig {
            type_id: "node_modules",
            strategy: ShareStrategy::Symlink,
            source_path: "node_modules",
            requirements_file: None,
        },
        DependencyShareConfig {
            type_id: ".venv",
            strategy: ShareStrategy::Recreate,
            source_path: ".venv",
            requirements_file: Some("requirements.txt"),
        },
        DependencyShareConfig {
            type_id: "vendor_php",
            strategy: ShareStrategy::Symlink,
            source_path: "vendor",
            requirements_file: None,
        },
        DependencyShareConfig {
            type_id: "vendor_bundle",
            strategy: ShareStrategy::Symlink,
            source_path: "vendor/bundle",
            requirements_file: None,
        },
        DependencyShareConfig {
            type_id: "cargo_target",
            strategy: ShareStrategy::Skip,
            source_path: "target",
            requirements_file: None,
        },
        DependencyShareConfig {
            type_id: "go_modules",
            strategy: ShareStrategy::Skip,
            source_path: "",
            requirements_file: None,
        },
    ]
}

/// Rejects absolute or parent-traversing paths, and verifies the resolved
/// path stays within the project root.
pub fn validate_project_relative_path(project_root: &Path, relative: &Path) -> ForgeResult<PathBuf> {
    if relative.is_absolute() || relative.components().any(|c| c.as_os_str() == "..") {
        return Err(ForgeError::Git {
            operation: "dependency_share".into(),
            message: format!("path {} escapes the project root", relative.display()),
        });
    }
    let resolved = project_root.join(relative);
    let canonical_root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let canonical_resolved = resolved.canonicalize().unwrap_or(resolved.clone());
    if !canonical_resolved.starts_with(&canonical_root) {
        return Err(ForgeError::Git {
            operation: "dependency_share".into(),
            message: format!("resolved path {} escapes the project root", resolved.display()),
        });
    }
    Ok(resolved)
}

pub struct WorktreeManager {
    driver: GitDriver,
    project_root: PathBuf,
    worktrees_root: PathBuf,
    base_branch: Option<String>,
}

impl WorktreeManager {
    pub fn new(project_root: PathBuf, build_dir_name: &str) -> Self {
        let worktrees_root = project_root.join(build_dir_name).join("worktrees").join("tasks");
        Self {
            driver: GitDriver::new(),
            project_root,
            worktrees_root,
            base_branch: None,
        }
    }

    /// Override the default `<project_root>/<build_dir>/worktrees/tasks`
    /// location, e.g. from a configured `worktree_base`.
    pub fn with_worktree_base(mut self, base: PathBuf) -> Self {
        self.worktrees_root = base;
        self
    }

    fn branch_name(spec_name: &str) -> String {
        format!("auto-claude/{spec_name}")
    }

    fn worktree_path(&self, spec_name: &str) -> PathBuf {
        self.worktrees_root.join(spec_name)
    }

    fn ref_exists(&self, branch: &str) -> bool {
        self.driver
            .run(
                Executable::Git,
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.success())
            .unwrap_or(false)
    }

    fn remote_ref_exists(&self, branch: &str) -> bool {
        self.driver
            .run(
                Executable::Git,
                &[
                    "show-ref",
                    "--verify",
                    "--quiet",
                    &format!("refs/remotes/origin/{branch}"),
                ],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Priority order: `DEFAULT_BRANCH` env var (if the ref exists) → `main`
    /// → `master` → current branch (with warning). Resolved once.
    pub fn resolve_base_branch(&mut self) -> String {
        if let Some(existing) = &self.base_branch {
            return existing.clone();
        }
        let resolved = if let Ok(env_branch) = std::env::var("DEFAULT_BRANCH") {
            if self.ref_exists(&env_branch) || self.remote_ref_exists(&env_branch) {
                env_branch
            } else {
                self.fallback_base_branch()
            }
        } else {
            self.fallback_base_branch()
        };
        self.base_branch = Some(resolved.clone());
        resolved
    }

    fn fallback_base_branch(&self) -> String {
        if self.ref_exists("main") || self.remote_ref_exists("main") {
            "main".to_string()
        } else if self.ref_exists("master") || self.remote_ref_exists("master") {
            "master".to_string()
        } else {
            let current = self
                .driver
                .run(
                    Executable::Git,
                    &["rev-parse", "--abbrev-ref", "HEAD"],
                    &self.project_root,
                    DEFAULT_GIT_TIMEOUT,
                )
                .map(|o| o.stdout.trim().to_string())
                .unwrap_or_else(|_| "HEAD".to_string());
            tracing::warn!(branch = %current, "no main/master found, using current branch as base");
            current
        }
    }

    fn prune_worktrees(&self) {
        let _ = self.driver.run(
            Executable::Git,
            &["worktree", "prune"],
            &self.project_root,
            DEFAULT_GIT_TIMEOUT,
        );
    }

    fn branch_namespace_conflict(&self) -> bool {
        // A branch literally named `auto-claude` blocks the `auto-claude/`
        // ref namespace: git stores refs as files, and this file conflicts
        // with the directory used by every spec-scoped branch.
        self.ref_exists("auto-claude")
    }

    fn git_tracks_path(&self, path: &Path) -> bool {
        self.driver
            .run(
                Executable::Git,
                &["worktree", "list", "--porcelain"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.stdout.contains(&path.display().to_string()))
            .unwrap_or(false)
    }

    fn head_readable(&self, worktree_path: &Path) -> bool {
        self.driver
            .run(
                Executable::Git,
                &["rev-parse", "HEAD"],
                worktree_path,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Idempotent worktree creation (§4.3.2). NOT safe under concurrent
    /// calls with the same spec name; callers must lock.
    pub fn create(&mut self, spec_name: &str, use_local_branch: bool) -> ForgeResult<WorktreeInfo> {
        self.prune_worktrees();

        if self.branch_namespace_conflict() {
            return Err(ForgeError::BranchNamespaceConflict);
        }

        let path = self.worktree_path(spec_name);
        let branch = Self::branch_name(spec_name);
        let base = self.resolve_base_branch();

        if path.exists() {
            if self.git_tracks_path(&path) {
                if self.head_readable(&path) {
                    return Ok(self.describe(&path, &branch, spec_name, &base));
                }
                tracing::warn!(path = %path.display(), "HEAD unreadable, force-removing worktree registration");
                let _ = self.driver.run(
                    Executable::Git,
                    &["worktree", "remove", "--force", &path.display().to_string()],
                    &self.project_root,
                    DEFAULT_GIT_TIMEOUT,
                );
            } else {
                tracing::warn!(path = %path.display(), "stale worktree directory, deleting");
                std::fs::remove_dir_all(&path)?;
            }
        }

        let _ = self.driver.run(
            Executable::Git,
            &["fetch", "origin", &base],
            &self.project_root,
            PUSH_TIMEOUT,
        );

        if self.ref_exists(&branch) {
            self.driver
                .run(
                    Executable::Git,
                    &["worktree", "add", &path.display().to_string(), &branch],
                    &self.project_root,
                    DEFAULT_GIT_TIMEOUT,
                )
                .map_err(|e| ForgeError::Git {
                    operation: "worktree add (attach)".into(),
                    message: e.to_string(),
                })?;
        } else {
            let start_point = if !use_local_branch && self.remote_ref_exists(&base) {
                format!("origin/{base}")
            } else {
                base.clone()
            };
            self.driver
                .run(
                    Executable::Git,
                    &[
                        "worktree",
                        "add",
                        "-b",
                        &branch,
                        &path.display().to_string(),
                        &start_point,
                    ],
                    &self.project_root,
                    DEFAULT_GIT_TIMEOUT,
                )
                .map_err(|e| ForgeError::Git {
                    operation: "worktree add (new branch)".into(),
                    message: e.to_string(),
                })?;
        }

        self.propagate_security_and_config(&path)?;
        self.recover_detached_head(&path, &branch)?;

        Ok(self.describe(&path, &branch, spec_name, &base))
    }

    fn describe(&self, path: &Path, branch: &str, spec_name: &str, base: &str) -> WorktreeInfo {
        WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            spec_name: spec_name.to_string(),
            base_branch: base.to_string(),
            is_active: true,
            stats: None,
        }
    }

    /// After any operation, `abbrev-ref HEAD` returning the literal string
    /// "HEAD" means detached. Recovery walks `worktree list --porcelain` to
    /// find the registered branch, falling back to the expected name.
    fn recover_detached_head(&self, worktree_path: &Path, expected_branch: &str) -> ForgeResult<()> {
        let current = self
            .driver
            .run(
                Executable::Git,
                &["rev-parse", "--abbrev-ref", "HEAD"],
                worktree_path,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();
        if current != "HEAD" {
            return Ok(());
        }

        let listing = self
            .driver
            .run(
                Executable::Git,
                &["worktree", "list", "--porcelain"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.stdout)
            .unwrap_or_default();
        let branch = find_branch_for_worktree(&listing, worktree_path).unwrap_or_else(|| expected_branch.to_string());

        // Re-attach by moving the branch ref to the current commit and
        // checking it out.
        self.driver
            .run(
                Executable::Git,
                &["branch", "-f", &branch, "HEAD"],
                worktree_path,
                DEFAULT_GIT_TIMEOUT,
            )
            .map_err(|e| ForgeError::Git {
                operation: "branch -f (detached-HEAD recovery)".into(),
                message: e.to_string(),
            })?;
        self.driver
            .run(Executable::Git, &["checkout", &branch], worktree_path, DEFAULT_GIT_TIMEOUT)
            .map_err(|e| ForgeError::Git {
                operation: "checkout (detached-HEAD recovery)".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Security & config propagation (§4.3.5): copy `.env*` files if absent
    /// (never overwrite), overwrite security-profile/allowlist files,
    /// ensure build-dir is gitignored, symlink `.claude/`.
    fn propagate_security_and_config(&self, worktree_path: &Path) -> ForgeResult<()> {
        for entry in std::fs::read_dir(&self.project_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str.starts_with(".env") {
                let dest = worktree_path.join(&name);
                if !dest.exists() {
                    let _ = std::fs::copy(entry.path(), dest);
                }
            }
        }

        for security_file in [".claude/settings.json", ".claude/allowlist.json"] {
            let src = self.project_root.join(security_file);
            if src.exists() {
                let dest = worktree_path.join(security_file);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src, &dest)?;
                mark_inherited(&dest)?;
            }
        }

        let gitignore = worktree_path.join(".gitignore");
        let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
        if !existing.lines().any(|l| l.trim() == ".auto-claude/") {
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(".auto-claude/\n");
            std::fs::write(&gitignore, content)?;
        }

        let claude_src = self.project_root.join(".claude");
        let claude_dest = worktree_path.join(".claude");
        if claude_src.exists() && !claude_dest.exists() {
            #[cfg(unix)]
            {
                let _ = std::os::unix::fs::symlink(&claude_src, &claude_dest);
            }
            #[cfg(windows)]
            {
                let _ = std::os::windows::fs::symlink_dir(&claude_src, &claude_dest);
            }
        }
        Ok(())
    }

    /// Share a discovered dependency location into `worktree_path` per the
    /// strategy table. On Windows, symlinking uses directory junctions.
    pub fn share_dependency(
        &self,
        worktree_path: &Path,
        config: &DependencyShareConfig,
    ) -> ForgeResult<()> {
        let source = validate_project_relative_path(&self.project_root, Path::new(config.source_path))?;
        if !source.exists() {
            return Ok(());
        }
        let dest = worktree_path.join(config.source_path);

        match config.strategy {
            ShareStrategy::Skip => Ok(()),
            ShareStrategy::Symlink => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&source, &dest)?;
                }
                #[cfg(windows)]
                {
                    // Directory junctions don't require admin on Windows.
                    std::os::windows::fs::symlink_dir(&source, &dest)?;
                }
                Ok(())
            }
            ShareStrategy::Copy => {
                copy_dir_recursive(&source, &dest)?;
                Ok(())
            }
            ShareStrategy::Recreate => self.recreate_venv(&dest, config.requirements_file),
        }
    }

    /// Python's pyvenv.cfg discovery does not resolve symlinks, so a venv
    /// must be recreated rather than shared: `python -m venv <dest>`, then
    /// `python -m pip install -r <requirements>` when a requirements file is
    /// present alongside it. On any failure (including timeouts) the
    /// partial venv is deleted so the next run can retry.
    fn recreate_venv(&self, dest: &Path, requirements_file: Option<&str>) -> ForgeResult<()> {
        let result = (|| -> ForgeResult<()> {
            let cwd = dest.parent().unwrap_or(dest);
            std::fs::create_dir_all(cwd)?;

            let dest_str = dest.to_string_lossy().into_owned();
            let venv = self
                .driver
                .run(Executable::Python, &["-m", "venv", &dest_str], cwd, VENV_TIMEOUT)
                .map_err(|e| ForgeError::Git {
                    operation: "python -m venv".into(),
                    message: e.to_string(),
                })?;
            if !venv.success() {
                return Err(ForgeError::Git {
                    operation: "python -m venv".into(),
                    message: venv.stderr,
                });
            }

            if let Some(req) = requirements_file {
                let req_path = cwd.join(req);
                if req_path.exists() {
                    let req_str = req_path.to_string_lossy().into_owned();
                    let pip = self
                        .driver
                        .run(
                            Executable::Python,
                            &["-m", "pip", "install", "-r", &req_str],
                            cwd,
                            VENV_TIMEOUT,
                        )
                        .map_err(|e| ForgeError::Git {
                            operation: "pip install".into(),
                            message: e.to_string(),
                        })?;
                    if !pip.success() {
                        return Err(ForgeError::Git {
                            operation: "pip install".into(),
                            message: pip.stderr,
                        });
                    }
                }
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_dir_all(dest);
        }
        result
    }

    /// `merge_worktree(spec, delete_after, no_commit)` (§4.3.6).
    pub fn merge_worktree(
        &mut self,
        spec_name: &str,
        delete_after: bool,
        no_commit: bool,
    ) -> ForgeResult<()> {
        let branch = Self::branch_name(spec_name);
        let base = self.resolve_base_branch();

        let current = self
            .driver
            .run(
                Executable::Git,
                &["rev-parse", "--abbrev-ref", "HEAD"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();
        if current != base {
            self.driver
                .run(Executable::Git, &["checkout", &base], &self.project_root, DEFAULT_GIT_TIMEOUT)
                .map_err(|e| ForgeError::Git {
                    operation: "checkout base".into(),
                    message: e.to_string(),
                })?;
        }

        let mut args: Vec<&str> = vec!["merge", "--no-ff"];
        let message = format!("auto-claude: Merge {branch}");
        if no_commit {
            args.push("--no-commit");
        } else {
            args.push("-m");
            args.push(&message);
        }
        args.push(&branch);

        let output = self
            .driver
            .run(Executable::Git, &args, &self.project_root, DEFAULT_GIT_TIMEOUT)
            .map_err(|e| ForgeError::Git {
                operation: "merge".into(),
                message: e.to_string(),
            })?;

        if output.stdout.contains("Already up to date") {
            if delete_after {
                self.remove_worktree_and_branch(spec_name)?;
            }
            return Ok(());
        }
        if !output.success() || output.stdout.to_lowercase().contains("conflict") {
            let _ = self.driver.run(
                Executable::Git,
                &["merge", "--abort"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            );
            return Err(ForgeError::MergeConflict {
                branch: branch.clone(),
                base,
            });
        }

        if no_commit {
            // Never merge the build directory or spec bookkeeping from a
            // worktree branch.
            for path in [".auto-claude/", "auto-claude/specs/"] {
                let _ = self.driver.run(
                    Executable::Git,
                    &["reset", "HEAD", "--", path],
                    &self.project_root,
                    DEFAULT_GIT_TIMEOUT,
                );
            }
            self.unstage_gitignored_on_base()?;
        }

        if delete_after {
            self.remove_worktree_and_branch(spec_name)?;
        }
        Ok(())
    }

    /// §4.3.6 step 5: unstage anything gitignored on base, on top of the
    /// always-unstaged build-directory paths. We're already checked out on
    /// base by the time this runs, so `.gitignore` here reflects base's
    /// rules rather than the worktree branch's.
    fn unstage_gitignored_on_base(&self) -> ForgeResult<()> {
        let staged = self
            .driver
            .run(
                Executable::Git,
                &["diff", "--cached", "--name-only"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map_err(|e| ForgeError::Git {
                operation: "diff --cached".into(),
                message: e.to_string(),
            })?;
        let files: Vec<&str> = staged.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if files.is_empty() {
            return Ok(());
        }

        let mut check_args: Vec<&str> = vec!["check-ignore", "--no-index"];
        check_args.extend(files.iter().copied());
        // `check-ignore` exits non-zero when nothing matched; that's not a
        // command failure here, only its stdout (the matched paths) matters.
        let Ok(ignored) = self.driver.run(Executable::Git, &check_args, &self.project_root, DEFAULT_GIT_TIMEOUT) else {
            return Ok(());
        };
        let ignored_files: Vec<&str> = ignored.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ignored_files.is_empty() {
            return Ok(());
        }

        let mut reset_args: Vec<&str> = vec!["reset", "HEAD", "--"];
        reset_args.extend(ignored_files.iter().copied());
        let _ = self.driver.run(Executable::Git, &reset_args, &self.project_root, DEFAULT_GIT_TIMEOUT);
        Ok(())
    }

    fn remove_worktree_and_branch(&mut self, spec_name: &str) -> ForgeResult<()> {
        let path = self.worktree_path(spec_name);
        let branch = Self::branch_name(spec_name);
        if let Err(e) = self.driver.run(
            Executable::Git,
            &["worktree", "remove", "--force", &path.display().to_string()],
            &self.project_root,
            DEFAULT_GIT_TIMEOUT,
        ) {
            tracing::warn!(error = %e, "failed to remove worktree, continuing");
        }
        if let Err(e) = self.driver.run(
            Executable::Git,
            &["branch", "-d", &branch],
            &self.project_root,
            DEFAULT_GIT_TIMEOUT,
        ) {
            tracing::warn!(error = %e, "failed to delete branch, continuing");
        }
        Ok(())
    }

    /// `git worktree list --porcelain` parsed into `WorktreeInfo` entries.
    pub fn list(&self) -> ForgeResult<Vec<WorktreeInfo>> {
        let listing = self
            .driver
            .run(
                Executable::Git,
                &["worktree", "list", "--porcelain"],
                &self.project_root,
                DEFAULT_GIT_TIMEOUT,
            )
            .map_err(|e| ForgeError::Git {
                operation: "worktree list".into(),
                message: e.to_string(),
            })?
            .stdout;

        let mut infos = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        for line in listing.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    if path.starts_with(&self.worktrees_root) {
                        let spec_name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        infos.push(WorktreeInfo {
                            path,
                            branch: branch_ref.to_string(),
                            spec_name,
                            base_branch: self.base_branch.clone().unwrap_or_default(),
                            is_active: true,
                            stats: None,
                        });
                    }
                }
            }
        }
        Ok(infos)
    }

    /// Age-based cleanup: `cleanup_old_worktrees(days, dry_run)` returns
    /// `(removed, failed)`. Warnings at ≥10 worktrees, critical at ≥20.
    pub fn cleanup_old_worktrees(
        &mut self,
        days: Option<i64>,
        dry_run: bool,
    ) -> ForgeResult<(Vec<String>, Vec<String>)> {
        let threshold = days.unwrap_or(OLD_WORKTREE_DAYS);
        let worktrees = self.list()?;

        if worktrees.len() >= CRITICAL_WORKTREE_COUNT {
            tracing::error!(count = worktrees.len(), "critical number of worktrees");
        } else if worktrees.len() >= WARN_WORKTREE_COUNT {
            tracing::warn!(count = worktrees.len(), "high number of worktrees");
        }

        let mut removed = Vec::new();
        let mut failed = Vec::new();

        for info in worktrees {
            let days_since = self.days_since_last_commit(&info.path).unwrap_or(0);
            if days_since < threshold {
                continue;
            }
            if dry_run {
                removed.push(info.spec_name);
                continue;
            }
            match self.remove_worktree_and_branch(&info.spec_name) {
                Ok(()) => removed.push(info.spec_name),
                Err(_) => failed.push(info.spec_name),
            }
        }
        Ok((removed, failed))
    }

    fn days_since_last_commit(&self, worktree_path: &Path) -> Option<i64> {
        let output = self
            .driver
            .run(
                Executable::Git,
                &["log", "-1", "--format=%ct"],
                worktree_path,
                DEFAULT_GIT_TIMEOUT,
            )
            .ok()?;
        let epoch: i64 = output.stdout.trim().parse().ok()?;
        let last_commit = chrono::DateTime::from_timestamp(epoch, 0)?;
        Some((chrono::Utc::now() - last_commit).num_days())
    }

    /// Push with retry (§4.3.7): exponential backoff on classifiable
    /// network errors, capped at `max_retries` (default 3); not retried:
    /// auth (401/403) or client errors (404/422).
    pub fn push_with_retry(&self, branch: &str, worktree_path: &Path, max_retries: u32) -> ForgeResult<()> {
        let mut attempt = 0;
        loop {
            let result = self.driver.run(
                Executable::Git,
                &["push", "-u", "origin", branch],
                worktree_path,
                PUSH_TIMEOUT,
            );
            match result {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    let retryable = classify_error_text(&output.stderr) == ErrorKind::GitTransient;
                    if !retryable || attempt + 1 >= max_retries {
                        return Err(ForgeError::Git {
                            operation: "push".into(),
                            message: output.stderr,
                        });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if attempt + 1 >= max_retries {
                        return Err(ForgeError::Git {
                            operation: "push".into(),
                            message: "timed out".into(),
                        });
                    }
                }
                Err(e) => {
                    return Err(ForgeError::Git {
                        operation: "push".into(),
                        message: e.to_string(),
                    });
                }
            }
            let delay = Duration::from_secs(2u64.pow(attempt));
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// PR creation: choose `gh` or `glab` by remote provider. "Already
    /// exists" is not a failure — the existing URL is fetched.
    pub fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str, provider: ForgeProvider) -> ForgeResult<(String, bool)> {
        let (exe, subcommand) = match provider {
            ForgeProvider::GitHub => (Executable::Gh, "pr"),
            ForgeProvider::GitLab => (Executable::Glab, "mr"),
        };
        let output = self
            .driver
            .run_with_retry(
                exe,
                &[subcommand, "create", "--base", base, "--head", branch, "--title", title, "--body", body],
                &self.project_root,
                FORGE_MUTATION_TIMEOUT,
            )
            .map_err(|e| ForgeError::Git {
                operation: "pr create".into(),
                message: e.to_string(),
            })?;

        if output.success() {
            let url = match provider {
                ForgeProvider::GitHub => crate::git_driver::extract_github_pr_url(&output.stdout),
                ForgeProvider::GitLab => crate::git_driver::extract_gitlab_mr_url(&output.stdout),
            };
            return Ok((url.unwrap_or_default(), false));
        }

        if already_exists(&output.stderr) {
            // §6.5: `gh pr view --json url` vs `glab mr view --output
            // json` — glab has no `--json` flag, and the two CLIs shape
            // their JSON differently (`url` vs `web_url`).
            let view_args: &[&str] = match provider {
                ForgeProvider::GitHub => &[subcommand, "view", "--json", "url"],
                ForgeProvider::GitLab => &[subcommand, "view", "--output", "json"],
            };
            let view = self
                .driver
                .run(exe, view_args, &self.project_root, FORGE_QUERY_TIMEOUT)
                .map_err(|e| ForgeError::Git {
                    operation: "pr view".into(),
                    message: e.to_string(),
                })?;
            let parsed: serde_json::Value = serde_json::from_str(&view.stdout).unwrap_or_default();
            let url_str = match provider {
                ForgeProvider::GitHub => parsed.get("url").and_then(|v| v.as_str()),
                ForgeProvider::GitLab => parsed.get("web_url").and_then(|v| v.as_str()),
            }
            .unwrap_or("")
            .to_string();
            return Ok((url_str, true));
        }

        Err(ForgeError::Git {
            operation: "pr create".into(),
            message: output.stderr,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ForgeProvider {
    GitHub,
    GitLab,
}

fn find_branch_for_worktree(porcelain: &str, worktree_path: &Path) -> Option<String> {
    let target = worktree_path.display().to_string();
    let mut in_block = false;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            in_block = path == target;
        } else if in_block {
            if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                return Some(branch.to_string());
            }
        }
    }
    None
}

fn mark_inherited(path: &Path) -> ForgeResult<()> {
    let content = std::fs::read_to_string(path)?;
    let mut value: serde_json::Value = serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("inherited_from".into(), serde_json::json!("parent_project"));
    }
    std::fs::write(path, serde_json::to_vec_pretty(&value)?)?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_driver::{Executable as Exe, GitDriver as Driver};
    use tempfile::tempdir;

    fn init_repo_with_main(dir: &Path) {
        let driver = Driver::new();
        let run = |args: &[&str]| {
            driver.run(Exe::Git, args, dir, DEFAULT_GIT_TIMEOUT).unwrap()
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    #[test]
    fn create_is_idempotent_for_same_spec_name() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        let first = mgr.create("my-spec", false).unwrap();
        let second = mgr.create("my-spec", false).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
    }

    #[test]
    fn base_branch_resolves_to_main() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        assert_eq!(mgr.resolve_base_branch(), "main");
    }

    #[test]
    fn branch_namespace_conflict_rejected() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let driver = Driver::new();
        driver
            .run(Exe::Git, &["branch", "auto-claude"], dir.path(), DEFAULT_GIT_TIMEOUT)
            .unwrap();
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        let result = mgr.create("spec-a", false);
        assert!(matches!(result, Err(ForgeError::BranchNamespaceConflict)));
    }

    #[test]
    fn stale_directory_is_recreated() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        let info = mgr.create("spec-b", false).unwrap();
        // simulate a stale directory: git no longer tracks it, but the dir
        // still exists on disk (e.g. after an unclean shutdown).
        let driver = Driver::new();
        driver
            .run(
                Exe::Git,
                &["worktree", "remove", "--force", &info.path.display().to_string()],
                dir.path(),
                DEFAULT_GIT_TIMEOUT,
            )
            .unwrap();
        std::fs::create_dir_all(&info.path).unwrap();
        std::fs::write(info.path.join("leftover.txt"), "stale").unwrap();

        let recreated = mgr.create("spec-b", false).unwrap();
        assert_eq!(recreated.path, info.path);
        assert!(!recreated.path.join("leftover.txt").exists());
    }

    #[test]
    fn validates_project_relative_dependency_path() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        assert!(validate_project_relative_path(dir.path(), Path::new("node_modules")).is_ok());
        assert!(validate_project_relative_path(dir.path(), Path::new("../etc/passwd")).is_err());
        assert!(validate_project_relative_path(dir.path(), Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn merge_worktree_combines_branch_back_into_base() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        let info = mgr.create("spec-c", false).unwrap();
        std::fs::write(info.path.join("feature.txt"), "new feature").unwrap();
        let driver = Driver::new();
        driver
            .run(Exe::Git, &["add", "."], &info.path, DEFAULT_GIT_TIMEOUT)
            .unwrap();
        driver
            .run(Exe::Git, &["commit", "-m", "feature work"], &info.path, DEFAULT_GIT_TIMEOUT)
            .unwrap();

        mgr.merge_worktree("spec-c", false, false).unwrap();
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn list_only_returns_managed_worktrees() {
        let dir = tempdir().unwrap();
        init_repo_with_main(dir.path());
        let mut mgr = WorktreeManager::new(dir.path().to_path_buf(), ".auto-claude");
        mgr.create("spec-d", false).unwrap();
        let worktrees = mgr.list().unwrap();
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].spec_name, "spec-d");
    }
}
