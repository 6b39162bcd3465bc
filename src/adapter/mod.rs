//! Agent adapter contract: one capability set over disparate CLI agents.
//!
//! An adapter spawns its child, normalizes whatever transport the child
//! speaks into a single stream of [`AdapterEvent`]s, and translates
//! failure into typed outcomes. It never touches the audit journal;
//! outcomes flow back to the orchestrator as values.

mod cancel;
mod line_json;
mod process;
mod rollout;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use cancel::CancelToken;
pub use line_json::LineJsonAdapter;
pub use rollout::RolloutJournalAdapter;

use crate::error::AdapterFailure;
use crate::session::ContextMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Child writes one JSON object per line to stdout.
    LineJsonStdout,
    /// Child appends a JSONL rollout journal under a well-known root.
    RolloutJournal,
}

/// Static description of one external agent CLI.
///
/// `kind` is free-form metadata and never drives dispatch; lookups go by
/// `agent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub agent_id: String,
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// The child inherits exactly these variables, nothing else.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub transport: Transport,
    pub timeout_secs: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub policy_id: String,
    /// Compatible alternate tried once when this adapter fails a turn.
    #[serde(default)]
    pub failover: Option<String>,
    /// Rollout transport only: where the child drops its journals.
    /// Falls back to `$JOURNAL_ROOT` when unset.
    #[serde(default)]
    pub journal_root: Option<PathBuf>,
    /// Rollout transport only: rates for deriving cost from token counts.
    #[serde(default)]
    pub usd_per_1k_input: Option<f64>,
    #[serde(default)]
    pub usd_per_1k_output: Option<f64>,
}

impl AdapterDescriptor {
    pub fn new(
        agent_id: impl Into<String>,
        kind: impl Into<String>,
        command: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: kind.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            transport,
            timeout_secs: match transport {
                Transport::LineJsonStdout => 120,
                Transport::RolloutJournal => 180,
            },
            capabilities: Vec::new(),
            policy_id: "default".to_string(),
            failover: None,
            journal_root: None,
            usd_per_1k_input: None,
            usd_per_1k_output: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = policy_id.into();
        self
    }

    pub fn with_failover(mut self, agent_id: impl Into<String>) -> Self {
        self.failover = Some(agent_id.into());
        self
    }

    pub fn with_journal_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.journal_root = Some(root.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_token_rates(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.usd_per_1k_input = Some(per_1k_input);
        self.usd_per_1k_output = Some(per_1k_output);
        self
    }
}

/// Per-turn resource limits handed to the adapter.
#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub deadline: Duration,
    pub max_cost: f64,
}

/// One submission to an agent.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Bridge-side session this turn belongs to.
    pub session_id: String,
    pub prompt: String,
    /// Prior turns, newest first, pre-filtered by the session model.
    pub context: Vec<ContextMessage>,
    pub limits: TurnLimits,
    pub working_dir: PathBuf,
    pub cancel: CancelToken,
}

/// Terminal success payload of one adapter call.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub content: String,
    pub cost: f64,
    /// False when the transport could not report a cost and zero was
    /// substituted.
    pub cost_reported: bool,
    pub duration_ms: u64,
    /// Session id in the adapter's own space, when the child announced one.
    pub adapter_session_id: Option<String>,
}

/// Normalized event stream element. Exactly one terminal variant
/// (`Completed` or `Failed`) ends every stream.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    SessionAnnounced { adapter_session_id: String },
    Chunk { text: String },
    Completed(TurnOutcome),
    Failed(AdapterFailure),
}

impl AdapterEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Receiver half of one adapter call.
pub struct EventStream {
    rx: mpsc::Receiver<AdapterEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<AdapterEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<AdapterEvent> {
        self.rx.recv().await
    }

    /// Drain the stream to its terminal event, discarding chunks.
    /// A stream that ends without a terminal event counts as transient.
    pub async fn terminal(mut self) -> Result<TurnOutcome, AdapterFailure> {
        while let Some(event) = self.next().await {
            match event {
                AdapterEvent::Completed(outcome) => return Ok(outcome),
                AdapterEvent::Failed(failure) => return Err(failure),
                _ => {}
            }
        }
        Err(AdapterFailure::transient("stream closed without a terminal event"))
    }
}

/// Readiness probe result.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub version: Option<String>,
    pub detail: String,
}

impl AdapterHealth {
    pub fn healthy(version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            healthy: true,
            detail: format!("ready ({})", version),
            version: Some(version),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            version: None,
            detail: detail.into(),
        }
    }
}

/// The single capability set every adapter implements. Dispatch is by
/// registered id; nothing here branches on `kind`.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn descriptor(&self) -> &AdapterDescriptor;

    /// Non-destructive readiness probe.
    async fn health_check(&self) -> AdapterHealth;

    /// Submit one turn. All failures arrive through the stream as
    /// `Failed` events; this call itself does not block on the child.
    async fn submit(&self, request: TurnRequest) -> EventStream;

    async fn shutdown(&self) -> crate::error::Result<()>;
}

/// Condense prior turns into prompt text for transports whose child keeps
/// no state between invocations.
pub(crate) fn compose_prompt(context: &[ContextMessage], prompt: &str) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }

    let mut text = String::from("Previous conversation (most recent last):\n");
    // Context arrives newest first; replay oldest first.
    for message in context.iter().rev() {
        text.push_str(&format!("[{}] {}\n", message.from_agent, message.content));
    }
    text.push('\n');
    text.push_str(prompt);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageRole;
    use chrono::Utc;

    #[test]
    fn test_compose_prompt_replays_oldest_first() {
        let context = vec![
            ContextMessage {
                role: MessageRole::Assistant,
                content: "newest".to_string(),
                from_agent: "beta".to_string(),
                timestamp: Utc::now(),
                attachments: None,
            },
            ContextMessage {
                role: MessageRole::Assistant,
                content: "oldest".to_string(),
                from_agent: "alpha".to_string(),
                timestamp: Utc::now(),
                attachments: None,
            },
        ];

        let prompt = compose_prompt(&context, "next question");
        let oldest = prompt.find("oldest").unwrap();
        let newest = prompt.find("newest").unwrap();
        assert!(oldest < newest);
        assert!(prompt.ends_with("next question"));
    }

    #[test]
    fn test_compose_prompt_without_context() {
        assert_eq!(compose_prompt(&[], "just ask"), "just ask");
    }

    #[test]
    fn test_descriptor_defaults_per_transport() {
        let line = AdapterDescriptor::new("a", "claude_code", "claude", Transport::LineJsonStdout);
        let rollout = AdapterDescriptor::new("b", "codex_cli", "codex", Transport::RolloutJournal);
        assert_eq!(line.timeout_secs, 120);
        assert_eq!(rollout.timeout_secs, 180);
    }
}
