use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TabError};
use crate::policy::PermissionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// File payload carried alongside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the content when the producer computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size_bytes,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

/// The allow/deny state that was in effect when a turn was produced.
///
/// A value, not a reference: the policy may be reconfigured later, the
/// snapshot stays what it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy_id: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
}

/// One speaker-to-listener exchange. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub turn_id: String,
    pub session_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    /// Cost reported by the producing adapter, opaque scalar.
    pub cost: f64,
    pub duration_ms: u64,
    pub policy: PolicySnapshot,
}

impl TurnMessage {
    pub fn new(
        session_id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        policy: PolicySnapshot,
    ) -> Result<Self> {
        let from_agent = from_agent.into();
        let to_agent = to_agent.into();
        let content = content.into();

        if content.is_empty() {
            return Err(TabError::Validation("turn content must not be empty".into()));
        }
        if from_agent == to_agent {
            return Err(TabError::Validation(format!(
                "turn cannot address its own sender: {}",
                from_agent
            )));
        }

        Ok(Self {
            turn_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            from_agent,
            to_agent,
            role,
            content,
            attachments: Vec::new(),
            timestamp: Utc::now(),
            cost: 0.0,
            duration_ms: 0,
            policy,
        })
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot {
            policy_id: "default".to_string(),
            allowed_tools: vec!["Read".to_string()],
            disallowed_tools: vec![],
            permission_mode: PermissionMode::Auto,
        }
    }

    #[test]
    fn test_turn_rejects_empty_content() {
        let result = TurnMessage::new(
            "s-1",
            "alpha",
            "beta",
            MessageRole::Assistant,
            "",
            snapshot(),
        );
        assert!(matches!(result, Err(TabError::Validation(_))));
    }

    #[test]
    fn test_turn_rejects_self_addressing() {
        let result = TurnMessage::new(
            "s-1",
            "alpha",
            "alpha",
            MessageRole::Assistant,
            "hello",
            snapshot(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_turn_builder() {
        let turn = TurnMessage::new(
            "s-1",
            "alpha",
            "beta",
            MessageRole::Assistant,
            "analysis",
            snapshot(),
        )
        .unwrap()
        .with_cost(0.12)
        .with_duration_ms(900)
        .with_attachments(vec![Attachment::new("diff.patch", "text/x-diff", 240)]);

        assert!((turn.cost - 0.12).abs() < f64::EPSILON);
        assert_eq!(turn.duration_ms, 900);
        assert_eq!(turn.attachments.len(), 1);
    }
}
