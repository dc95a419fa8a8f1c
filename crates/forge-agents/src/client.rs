//! `RigAgentClient`: the concrete `coordination::AgentClient` that talks to
//! a real model endpoint via `rig-core`.
//!
//! Grounded on `orchestrator.rs`'s `prompt_with_retry` (same transient-error
//! substring list, same 2s/4s/8s/... backoff) and on `forge_core::session`'s
//! expectation of a typed event stream rather than a single `String`
//! response — `rig-core`'s `Prompt` trait here only returns a final string,
//! so this adapter synthesizes the stream the session runner expects
//! around that one call.

use async_trait::async_trait;
use forge_core::session::{AgentClient, AgentEvent};
use rig::completion::Prompt;
use rig::providers::openai;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::AgentConfig;

pub struct RigAgentClient {
    client: openai::CompletionsClient,
    model: String,
    max_retries: u32,
}

impl RigAgentClient {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Same retry policy as `orchestrator.rs`'s `prompt_with_retry`: retry on
    /// connection errors, 502, 503, 429, timeouts, and the proxy's
    /// intermittent empty-payload/schema-mismatch errors, with 2s/4s/8s/...
    /// backoff; anything else fails immediately.
    async fn prompt_with_retry(&self, prompt: &str) -> Result<String, rig::completion::PromptError> {
        let agent = self.client.agent(&self.model).build();
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match agent.prompt(prompt).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err_str = format!("{e}");
                    let err_lower = err_str.to_ascii_lowercase();
                    let is_transient = err_str.contains("502")
                        || err_str.contains("503")
                        || err_str.contains("429")
                        || err_lower.contains("connection")
                        || err_lower.contains("timed out")
                        || err_lower.contains("timeout")
                        || err_lower.contains("no message or tool call (empty)")
                        || err_lower.contains("response contained no message or tool call")
                        || err_lower.contains("jsonerror");

                    if !is_transient || attempt == self.max_retries {
                        return Err(e);
                    }

                    let backoff = Duration::from_secs(2u64.pow(attempt + 1));
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        backoff_secs = backoff.as_secs(),
                        error = %err_str,
                        "transient error from inference endpoint, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(last_err.unwrap())
    }
}

#[async_trait]
impl AgentClient for RigAgentClient {
    async fn submit(&self, prompt: &str, _spec_dir: &Path) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(8);

        // rig's `Prompt` trait only returns a final string, not a typed
        // event stream, so there's nothing to interleave — run the whole
        // turn to completion, then replay it as the event sequence
        // `forge_core::session::run_turn` expects.
        match self.prompt_with_retry(prompt).await {
            Ok(body) => {
                if let Ok(payload) = serde_json::from_str::<serde_json::Value>(body.trim()) {
                    let _ = tx.send(AgentEvent::StructuredOutput { payload }).await;
                }
                let _ = tx.send(AgentEvent::Text { body }).await;
                let _ = tx.send(AgentEvent::Result { subtype: "success".into() }).await;
            }
            Err(e) => {
                let _ = tx.send(AgentEvent::Text { body: e.to_string() }).await;
                let _ = tx.send(AgentEvent::Result { subtype: "error".into() }).await;
            }
        }

        rx
    }
}
