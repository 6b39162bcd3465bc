//! Conversation orchestrator: the per-session turn loop with scheduling,
//! retry, failover and termination.

mod breaker;
mod engine;

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use breaker::CircuitBreaker;
pub use engine::ConversationOrchestrator;

use crate::error::{Result, TabError};
use crate::session::{ContextMessage, SessionStatus};

/// Ingress request for a new conversation. Validation failures surface to
/// the caller without mutating any state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub topic: String,
    pub participants: Vec<String>,
    pub policy_id: String,
    pub max_turns: u32,
    pub budget: f64,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub initial_speaker: Option<String>,
    /// Include the normalized turn history in the response.
    #[serde(default)]
    pub include_history: bool,
}

impl ConversationRequest {
    pub fn validate(&self) -> Result<()> {
        if let Some(speaker) = &self.initial_speaker
            && !self.participants.contains(speaker)
        {
            return Err(TabError::Validation(format!(
                "initial_speaker {} is not a participant",
                speaker
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    ExplicitCompletion,
    ConvergedRepetition,
    BudgetExceeded,
    TurnLimitReached,
    QualityDegradation,
    Cancelled,
    AdapterFailure,
    PolicyDenied,
    Timeout,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExplicitCompletion => "EXPLICIT_COMPLETION",
            Self::ConvergedRepetition => "CONVERGED_REPETITION",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::TurnLimitReached => "TURN_LIMIT_REACHED",
            Self::QualityDegradation => "QUALITY_DEGRADATION",
            Self::Cancelled => "CANCELLED",
            Self::AdapterFailure => "ADAPTER_FAILURE",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Egress summary of a finished conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub turn_count: usize,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub termination_reason: TerminationReason,
    pub summary: String,
    /// Index of the last successfully appended turn, zero when none.
    pub last_successful_turn: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ContextMessage>>,
}

/// Where a session currently is in its turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Awaiting,
    Streaming,
    Evaluating,
    Converging,
}

/// Transient per-session loop state. Never persisted; the session and the
/// audit journal are the durable record.
#[derive(Debug)]
pub struct OrchestrationState {
    pub active_agent: String,
    pub phase: Phase,
    pub started: Instant,
    pub consecutive_failures: u32,
    pub consecutive_denials: u32,
    pub retry_count_for_current_turn: u32,
}

impl OrchestrationState {
    pub fn new(active_agent: impl Into<String>) -> Self {
        Self {
            active_agent: active_agent.into(),
            phase: Phase::Idle,
            started: Instant::now(),
            consecutive_failures: 0,
            consecutive_denials: 0,
            retry_count_for_current_turn: 0,
        }
    }
}
