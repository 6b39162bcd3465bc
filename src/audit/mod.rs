//! Append-only audit chain: every orchestration decision and boundary
//! event, canonically encoded and hash-linked for tamper evidence.

mod journal;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use journal::{AuditJournal, VerifyFailure, read_records, verify_chain};

/// Fixed value in the first record's `prev_hash`.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SessionStarted,
    TurnAdmitted,
    TurnEmitted,
    TurnRejected,
    BudgetExceeded,
    Converged,
    AdapterFailure,
    PolicyViolation,
    SessionTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Blocked,
}

/// One chained record. `prev_hash` is assigned by the journal writer at
/// append time; everything else is set by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_kind: AuditEventKind,
    pub session_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub reason: String,
    #[serde(default)]
    pub resource_usage: BTreeMap<String, f64>,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub prev_hash: String,
}

impl AuditRecord {
    pub fn new(
        event_kind: AuditEventKind,
        session_id: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_kind,
            session_id: session_id.into(),
            agent_id: None,
            action: action.into(),
            outcome,
            reason: String::new(),
            resource_usage: BTreeMap::new(),
            trace_id: None,
            prev_hash: String::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_usage(mut self, key: impl Into<String>, value: f64) -> Self {
        self.resource_usage.insert(key.into(), value);
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Canonical encoding: compact JSON with lexicographically sorted
    /// keys. Stable under parse/re-encode.
    pub fn canonical(&self) -> String {
        // serde_json's Value object is a BTreeMap, which sorts keys.
        let value = serde_json::to_value(self).expect("audit record serializes");
        serde_json::to_string(&value).expect("canonical value serializes")
    }

    /// Hex SHA-256 of the canonical encoding.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
