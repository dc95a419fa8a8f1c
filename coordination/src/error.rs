//! Error taxonomy and sanitization for the build runner.
//!
//! `ForgeError` carries an `ErrorKind` so callers can branch on
//! classification without string matching: result values carry a typed
//! kind instead of exceptions used for control flow. `StructuredError` is
//! the machine-readable surface handed back across the `AgentClient`
//! boundary.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

pub type ForgeResult<T> = Result<T, ForgeError>;

/// Error taxonomy from the error-handling design: kinds, not types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolConcurrency,
    RateLimit,
    Authentication,
    StructuredOutputValidation,
    RepeatedResponseLoop,
    CircuitBreaker,
    MergeConflict,
    BranchNamespaceConflict,
    WorktreeStale,
    GitTransient,
    ForgeHttp5xx,
    NotFoundExec,
    MemoryProviderUnavailable,
    Other,
}

impl ErrorKind {
    /// Policy per §7: does this kind retry on its own, or does it pause /
    /// terminate / hand off to the recovery manager?
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ToolConcurrency | ErrorKind::GitTransient | ErrorKind::ForgeHttp5xx
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::RepeatedResponseLoop | ErrorKind::CircuitBreaker | ErrorKind::MergeConflict
        )
    }
}

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("plan malformed at {path}: {message}")]
    MalformedPlan { path: PathBuf, message: String },

    #[error("subtask not found: {subtask_id}")]
    SubtaskNotFound { subtask_id: String },

    #[error("git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    #[error("branch namespace conflict: a branch literally named 'auto-claude' exists and blocks the worktree directory")]
    BranchNamespaceConflict,

    #[error("worktree stale at {path}, self-healing by recreation")]
    WorktreeStale { path: PathBuf },

    #[error("merge conflict while merging {branch} into {base}")]
    MergeConflict { branch: String, base: String },

    #[error("executable not found: {name}")]
    NotFoundExec { name: String },

    #[error("max subtask retries ({max}) exceeded with no good commit for {subtask_id}")]
    MaxRetriesExceeded { max: u32, subtask_id: String },

    #[error("session error: {message}")]
    Session { message: String },

    #[error("memory provider unavailable: {message}")]
    MemoryProviderUnavailable { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForgeError {
    /// Classify this error into the taxonomy's `ErrorKind`, for callers that
    /// need to branch on kind rather than match on the enum variant directly
    /// (e.g. the recovery manager, which receives the *text* of an error and
    /// must pattern-match it — see [`classify_error_text`]).
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForgeError::BranchNamespaceConflict => ErrorKind::BranchNamespaceConflict,
            ForgeError::WorktreeStale { .. } => ErrorKind::WorktreeStale,
            ForgeError::MergeConflict { .. } => ErrorKind::MergeConflict,
            ForgeError::NotFoundExec { .. } => ErrorKind::NotFoundExec,
            ForgeError::MemoryProviderUnavailable { .. } => ErrorKind::MemoryProviderUnavailable,
            ForgeError::Git { message, .. } => classify_error_text(message),
            ForgeError::Session { message } => classify_error_text(message),
            _ => ErrorKind::Other,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ForgeError::MalformedPlan { .. } => {
                "restore implementation_plan.json from its .backup file"
            }
            ForgeError::SubtaskNotFound { .. } => "reload the plan; the id may be stale",
            ForgeError::Git { .. } => "retry with backoff if transient, else inspect repo state",
            ForgeError::BranchNamespaceConflict => {
                "rename or delete the local branch literally named 'auto-claude'"
            }
            ForgeError::WorktreeStale { .. } => "directory will be recreated automatically",
            ForgeError::MergeConflict { .. } => "resolve manually; merge has been aborted",
            ForgeError::NotFoundExec { .. } => "install the missing executable and retry",
            ForgeError::MaxRetriesExceeded { .. } => "escalate to a human; no further auto-retry",
            ForgeError::Session { .. } => "see the classified ErrorKind for policy",
            ForgeError::MemoryProviderUnavailable { .. } => {
                "degrade to the file-based memory fallback"
            }
            ForgeError::Io(_) | ForgeError::Json(_) => "check filesystem permissions and disk state",
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        let kind = self.kind();
        StructuredError {
            code: structured_code(self),
            message: sanitize_error_string(&self.to_string()),
            recovery_action: self.recovery_suggestion().to_string(),
            context: HashMap::new(),
            retryable: kind.is_retryable(),
        }
    }
}

fn structured_code(err: &ForgeError) -> String {
    match err {
        ForgeError::MalformedPlan { .. } => "MALFORMED_PLAN",
        ForgeError::SubtaskNotFound { .. } => "SUBTASK_NOT_FOUND",
        ForgeError::Git { .. } => "GIT_ERROR",
        ForgeError::BranchNamespaceConflict => "BRANCH_NAMESPACE_CONFLICT",
        ForgeError::WorktreeStale { .. } => "WORKTREE_STALE",
        ForgeError::MergeConflict { .. } => "MERGE_CONFLICT",
        ForgeError::NotFoundExec { .. } => "EXEC_NOT_FOUND",
        ForgeError::MaxRetriesExceeded { .. } => "MAX_SUBTASK_RETRIES_EXCEEDED",
        ForgeError::Session { .. } => "SESSION_ERROR",
        ForgeError::MemoryProviderUnavailable { .. } => "MEMORY_PROVIDER_UNAVAILABLE",
        ForgeError::Io(_) => "IO_ERROR",
        ForgeError::Json(_) => "JSON_ERROR",
    }
    .to_string()
}

/// Machine-readable error surface handed back across the `AgentClient`
/// boundary and stored in the attempt ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retryable: bool,
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Classify raw error text by substring match, keeping the matching
/// isolated in one classification function with named predicates rather
/// than scattered at each call site. Used both by the session runner
/// (reading agent-stream text) and the recovery manager (reading stored
/// error text).
pub fn classify_error_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();

    let has_tool_concurrency = lower.contains("400")
        && lower.contains("tool")
        && (lower.contains("concurren") || lower.contains("in progress"));
    if has_tool_concurrency {
        return ErrorKind::ToolConcurrency;
    }
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
        return ErrorKind::RateLimit;
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("invalid api key")
    {
        return ErrorKind::Authentication;
    }
    if lower.contains("structured output") || lower.contains("max_structured_output_retries") {
        return ErrorKind::StructuredOutputValidation;
    }
    if lower.contains("lock")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("another git process")
    {
        return ErrorKind::GitTransient;
    }
    if lower.contains("could not lock") {
        return ErrorKind::GitTransient;
    }
    if lower.contains("500") || lower.contains("502") || lower.contains("503") || lower.contains("504")
    {
        return ErrorKind::ForgeHttp5xx;
    }
    if lower.contains("no such file or directory") && (lower.contains("gh") || lower.contains("glab"))
    {
        return ErrorKind::NotFoundExec;
    }
    ErrorKind::Other
}

/// Transient-error heuristic used by the recovery manager's
/// `check_and_recover` policy: test flakes and network blips retry, other
/// failures do not.
pub fn looks_transient(text: &str) -> bool {
    let kind = classify_error_text(text);
    if kind.is_retryable() {
        return true;
    }
    let lower = text.to_lowercase();
    lower.contains("flak") || lower.contains("econnreset") || lower.contains("temporarily unavailable")
}

fn sanitizer_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?:sk|key)-[A-Za-z0-9._-]{20,}").unwrap(),
                "[REDACTED_API_KEY]",
            ),
            (
                Regex::new(r"Bearer [A-Za-z0-9._-]{20,}").unwrap(),
                "Bearer [REDACTED_TOKEN]",
            ),
            (
                Regex::new(r"(?i)token[=:]\s*[A-Za-z0-9._-]{20,}").unwrap(),
                "token=[REDACTED_TOKEN]",
            ),
            (
                Regex::new(r"(?i)secret[=:]\s*[A-Za-z0-9._-]{20,}").unwrap(),
                "secret=[REDACTED_SECRET]",
            ),
        ]
    })
}

/// Sanitize an error string before it is logged, stored, or emitted.
/// Idempotent: running it twice on an already-sanitized string is a no-op
/// beyond re-truncation (the replacement tokens never match the patterns).
pub fn sanitize_error_string(input: &str) -> String {
    let mut out = input.to_string();
    for (re, replacement) in sanitizer_patterns() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    if out.chars().count() > 500 {
        let truncated: String = out.chars().take(500).collect();
        format!("{truncated}...")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_api_keys_and_tokens() {
        let input = "auth failed with key-abcdefghijklmnopqrstuvwxyz123456 and Bearer zzzzzzzzzzzzzzzzzzzzzzzzz";
        let out = sanitize_error_string(input);
        assert!(out.contains("[REDACTED_API_KEY]"));
        assert!(out.contains("Bearer [REDACTED_TOKEN]"));
        assert!(!out.contains("abcdefghijklmnopqrstuvwxyz123456"));
    }

    #[test]
    fn sanitizes_token_and_secret_kv_pairs() {
        let input = "request failed: token=abcdefghijklmnopqrstuvwxyz0123 secret: zzzzzzzzzzzzzzzzzzzzzzzz01";
        let out = sanitize_error_string(input);
        assert!(out.contains("token=[REDACTED_TOKEN]"));
        assert!(out.contains("secret=[REDACTED_SECRET]"));
    }

    #[test]
    fn truncates_to_500_chars_with_ellipsis() {
        let input = "x".repeat(600);
        let out = sanitize_error_string(&input);
        assert_eq!(out.chars().count(), 503);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn sanitization_is_idempotent() {
        let input = "key-abcdefghijklmnopqrstuvwxyz123456";
        let once = sanitize_error_string(input);
        let twice = sanitize_error_string(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn classifies_tool_concurrency() {
        let kind = classify_error_text("Error 400: tool use already in progress, concurrent calls not allowed");
        assert_eq!(kind, ErrorKind::ToolConcurrency);
    }

    #[test]
    fn classifies_rate_limit_and_auth() {
        assert_eq!(classify_error_text("429 rate limit exceeded"), ErrorKind::RateLimit);
        assert_eq!(
            classify_error_text("401 unauthorized: invalid api key"),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn classifies_git_transient() {
        assert_eq!(
            classify_error_text("fatal: Unable to create '.git/index.lock': File exists"),
            ErrorKind::GitTransient
        );
    }

    #[test]
    fn error_kind_retry_policy() {
        assert!(ErrorKind::ToolConcurrency.is_retryable());
        assert!(ErrorKind::GitTransient.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(ErrorKind::CircuitBreaker.is_terminal());
    }

    #[test]
    fn forge_error_to_structured_redacts_and_sets_retryable() {
        let err = ForgeError::Git {
            operation: "push".into(),
            message: "connection reset by peer".into(),
        };
        let structured = err.to_structured();
        assert_eq!(structured.code, "GIT_ERROR");
        assert!(structured.retryable);
    }
}
