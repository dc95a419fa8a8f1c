//! Session Runner: drives one agent turn over a typed event stream and
//! classifies the outcome.
//!
//! The `AgentClient` trait is the contract boundary: the core depends on
//! "submit a prompt, stream back typed events", never on a concrete model
//! SDK. The agent stream is modeled as a channel of typed events rather
//! than callbacks, matching `crates/forge-agents/src/contracts.rs`'s
//! fail-closed classification of the response that comes out the other
//! end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{classify_error_text, sanitize_error_string, ErrorKind};

pub const MAX_MESSAGES_PER_TURN: usize = 500;
pub const REPEATED_RESPONSE_THRESHOLD: usize = 1;
pub const AUTH_ERROR_PREVIEW_LEN: usize = 300;
pub const RATE_LIMIT_POLL_SECS: u64 = 30;
pub const AUTH_POLL_SECS: u64 = 10;
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(2 * 60 * 60);
pub const MAX_AUTH_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    Thinking { chars: usize, preview: Option<String> },
    Text { body: String },
    ToolUse { id: String, name: String, detail: String },
    ToolResult { tool_id: String, success: bool, preview: String, blocked: bool },
    StructuredOutput { payload: serde_json::Value },
    Result { subtype: String },
}

/// Submit a prompt, stream back typed events. Implementations own the
/// concrete model SDK (e.g. a `rig-core` adapter in `forge-agents`); this
/// crate depends only on the trait.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn submit(&self, prompt: &str, spec_dir: &std::path::Path) -> mpsc::Receiver<AgentEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Continue,
    Complete,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub response_text: String,
    pub error_info: Option<SessionError>,
    pub structured_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

/// Runs one submission to completion, consuming the event stream and
/// applying the classification table from the session-runner design.
pub async fn run_turn(client: &dyn AgentClient, prompt: &str, spec_dir: &std::path::Path) -> SessionOutcome {
    let mut receiver = client.submit(prompt, spec_dir).await;

    let mut response_text = String::new();
    let mut last_text_block: Option<String> = None;
    let mut repeat_count = 0usize;
    let mut structured_output: Option<serde_json::Value> = None;
    let mut message_count = 0usize;
    let mut pending_error: Option<SessionError> = None;
    let mut saw_terminal_result = false;

    loop {
        let event = match receiver.recv().await {
            Some(e) => e,
            None => break,
        };

        message_count += 1;
        if message_count > MAX_MESSAGES_PER_TURN {
            return SessionOutcome {
                status: SessionStatus::Error,
                response_text,
                error_info: Some(SessionError {
                    kind: ErrorKind::CircuitBreaker,
                    message: "exceeded max messages per turn, possible retry loop".to_string(),
                    recoverable: false,
                }),
                structured_output,
            };
        }

        match event {
            AgentEvent::Thinking { chars, .. } => {
                tracing::debug!(chars, "agent thinking");
            }
            AgentEvent::Text { body } => {
                response_text.push_str(&body);
                tracing::info!(len = body.len(), "agent text");

                if body.len() <= AUTH_ERROR_PREVIEW_LEN && looks_like_auth_error(&body) {
                    return SessionOutcome {
                        status: SessionStatus::Error,
                        response_text,
                        error_info: Some(SessionError {
                            kind: ErrorKind::Authentication,
                            message: sanitize_error_string(&body),
                            recoverable: false,
                        }),
                        structured_output,
                    };
                }

                if last_text_block.as_deref() == Some(body.as_str()) {
                    repeat_count += 1;
                    if repeat_count > REPEATED_RESPONSE_THRESHOLD {
                        return SessionOutcome {
                            status: SessionStatus::Error,
                            response_text,
                            error_info: Some(SessionError {
                                kind: ErrorKind::RepeatedResponseLoop,
                                message: "agent repeated the same response block".to_string(),
                                recoverable: false,
                            }),
                            structured_output,
                        };
                    }
                } else {
                    repeat_count = 0;
                }
                last_text_block = Some(body.clone());

                if classify_error_text(&body) == ErrorKind::ToolConcurrency {
                    pending_error = Some(SessionError {
                        kind: ErrorKind::ToolConcurrency,
                        message: sanitize_error_string(&body),
                        recoverable: true,
                    });
                }
            }
            AgentEvent::ToolUse { id, name, detail } => {
                tracing::info!(tool_id = %id, tool = %name, detail = %detail, "tool use");
            }
            AgentEvent::ToolResult { tool_id, success, preview, blocked } => {
                if blocked {
                    tracing::warn!(tool_id = %tool_id, content = %preview, "BLOCKED by security hook");
                } else {
                    tracing::info!(tool_id = %tool_id, success, preview = %truncate(&preview, 200), "tool result");
                }
            }
            AgentEvent::StructuredOutput { payload } => {
                if structured_output.is_none() {
                    structured_output = Some(payload);
                }
            }
            AgentEvent::Result { subtype } => {
                saw_terminal_result = true;
                if subtype == "error_max_structured_output_retries" {
                    return SessionOutcome {
                        status: SessionStatus::Error,
                        response_text,
                        error_info: Some(SessionError {
                            kind: ErrorKind::StructuredOutputValidation,
                            message: "structured output validation retries exhausted".to_string(),
                            recoverable: true,
                        }),
                        structured_output,
                    };
                } else if subtype != "success" {
                    // Any other non-success subtype is a terminal failure,
                    // not just the one hardcoded above. Prefer a
                    // classification already derived from the stream's text
                    // (e.g. tool concurrency flagged mid-turn) over a fresh
                    // classification of the accumulated response text.
                    let err = pending_error.take().unwrap_or_else(|| {
                        let kind = classify_error_text(&response_text);
                        SessionError {
                            kind,
                            message: sanitize_error_string(&format!(
                                "agent turn ended with non-success result (subtype={subtype})"
                            )),
                            recoverable: kind.is_retryable(),
                        }
                    });
                    return SessionOutcome {
                        status: SessionStatus::Error,
                        response_text,
                        error_info: Some(err),
                        structured_output,
                    };
                }
            }
        }
    }

    if !saw_terminal_result {
        return SessionOutcome {
            status: SessionStatus::Error,
            response_text,
            error_info: Some(SessionError {
                kind: ErrorKind::CircuitBreaker,
                message: "agent event stream closed before a terminal Result event (pipe closed)".to_string(),
                recoverable: false,
            }),
            structured_output,
        };
    }

    if let Some(err) = pending_error {
        return SessionOutcome {
            status: SessionStatus::Continue,
            response_text,
            error_info: Some(err),
            structured_output,
        };
    }

    SessionOutcome {
        status: SessionStatus::Complete,
        response_text,
        error_info: None,
        structured_output,
    }
}

fn looks_like_auth_error(text: &str) -> bool {
    classify_error_text(text) == ErrorKind::Authentication
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}

/// Cooperative pause-file protocol (§5, §6.4): a rate-limit or auth pause
/// is signalled by creating a file; the loop polls for its companion
/// RESUME file at a fixed interval up to a bound, then gives up.
pub struct PauseSignal {
    pub pause_path: std::path::PathBuf,
    pub resume_path: std::path::PathBuf,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl PauseSignal {
    pub fn rate_limit(build_dir: &std::path::Path) -> Self {
        Self {
            pause_path: build_dir.join("RATE_LIMIT_PAUSE"),
            resume_path: build_dir.join("RESUME"),
            poll_interval: Duration::from_secs(RATE_LIMIT_POLL_SECS),
            max_wait: MAX_RATE_LIMIT_WAIT,
        }
    }

    pub fn authentication(build_dir: &std::path::Path) -> Self {
        Self {
            pause_path: build_dir.join("AUTH_PAUSE"),
            resume_path: build_dir.join("RESUME"),
            poll_interval: Duration::from_secs(AUTH_POLL_SECS),
            max_wait: MAX_AUTH_WAIT,
        }
    }

    pub fn signal(&self) -> std::io::Result<()> {
        std::fs::write(&self.pause_path, b"")
    }

    /// Polls for the resume file; on success removes both files. Returns
    /// `false` if `max_wait` elapses first (caller should fail the
    /// subtask).
    pub async fn wait_for_resume(&self) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.resume_path.exists() {
                let _ = std::fs::remove_file(&self.pause_path);
                let _ = std::fs::remove_file(&self.resume_path);
                return true;
            }
            if start.elapsed() > self.max_wait {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    struct ScriptedClient {
        events: Arc<Vec<AgentEvent>>,
    }

    #[async_trait]
    impl AgentClient for ScriptedClient {
        async fn submit(&self, _prompt: &str, _spec_dir: &Path) -> mpsc::Receiver<AgentEvent> {
            let (tx, rx) = mpsc::channel(32);
            let events = self.events.clone();
            tokio::spawn(async move {
                for event in events.iter() {
                    let _ = tx.send(event.clone()).await;
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn completes_normally_with_no_errors() {
        let client = ScriptedClient {
            events: Arc::new(vec![
                AgentEvent::Thinking { chars: 10, preview: None },
                AgentEvent::Text { body: "working on it".into() },
                AgentEvent::Result { subtype: "success".into() },
            ]),
        };
        let outcome = run_turn(&client, "do the thing", Path::new("/tmp")).await;
        assert_eq!(outcome.status, SessionStatus::Complete);
        assert!(outcome.error_info.is_none());
    }

    #[tokio::test]
    async fn detects_auth_error_in_short_text_block() {
        let client = ScriptedClient {
            events: Arc::new(vec![AgentEvent::Text {
                body: "401 unauthorized: invalid api key".into(),
            }]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(outcome.status, SessionStatus::Error);
        assert_eq!(outcome.error_info.unwrap().kind, ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn detects_repeated_response_loop() {
        let client = ScriptedClient {
            events: Arc::new(vec![
                AgentEvent::Text { body: "same thing".into() },
                AgentEvent::Text { body: "same thing".into() },
                AgentEvent::Text { body: "same thing".into() },
            ]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(outcome.status, SessionStatus::Error);
        assert_eq!(outcome.error_info.unwrap().kind, ErrorKind::RepeatedResponseLoop);
    }

    #[tokio::test]
    async fn flags_structured_output_retry_exhaustion() {
        let client = ScriptedClient {
            events: Arc::new(vec![AgentEvent::Result {
                subtype: "error_max_structured_output_retries".into(),
            }]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(
            outcome.error_info.unwrap().kind,
            ErrorKind::StructuredOutputValidation
        );
    }

    #[tokio::test]
    async fn captures_structured_output_once() {
        let client = ScriptedClient {
            events: Arc::new(vec![
                AgentEvent::StructuredOutput { payload: serde_json::json!({"a": 1}) },
                AgentEvent::StructuredOutput { payload: serde_json::json!({"a": 2}) },
            ]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(outcome.structured_output, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn channel_close_without_terminal_result_is_pipe_closed_error() {
        let client = ScriptedClient {
            events: Arc::new(vec![AgentEvent::Text {
                body: "partial work, then the stream just stops".into(),
            }]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(outcome.status, SessionStatus::Error);
        let err = outcome.error_info.unwrap();
        assert_eq!(err.kind, ErrorKind::CircuitBreaker);
        assert!(err.message.contains("pipe closed"));
    }

    #[tokio::test]
    async fn non_success_result_subtype_other_than_the_known_one_is_still_an_error() {
        let client = ScriptedClient {
            events: Arc::new(vec![
                AgentEvent::Text { body: "something went wrong upstream".into() },
                AgentEvent::Result { subtype: "error".into() },
            ]),
        };
        let outcome = run_turn(&client, "prompt", Path::new("/tmp")).await;
        assert_eq!(outcome.status, SessionStatus::Error);
        assert!(outcome.error_info.is_some());
    }

    #[tokio::test]
    async fn pause_signal_resumes_when_resume_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let signal = PauseSignal {
            pause_path: dir.path().join("RATE_LIMIT_PAUSE"),
            resume_path: dir.path().join("RESUME"),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(1),
        };
        signal.signal().unwrap();
        std::fs::write(dir.path().join("RESUME"), b"").unwrap();
        assert!(signal.wait_for_resume().await);
        assert!(!signal.pause_path.exists());
    }
}
