use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::turn::{Attachment, MessageRole, TurnMessage};
use crate::config::ConvergenceConfig;
use crate::convergence::ConvergenceReport;
use crate::error::{Result, TabError};

pub const MIN_PARTICIPANTS: usize = 2;
pub const MAX_TOPIC_CHARS: usize = 1000;
pub const MAX_TURNS_CEILING: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Turn projected into the chat shape adapters consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
    pub from_agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryStats {
    pub total_turns: usize,
    pub total_cost: f64,
    pub avg_content_length: f64,
    pub per_agent_turn_counts: HashMap<String, usize>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TurnProgress {
    pub current: usize,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetProgress {
    pub used: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub turn_progress: TurnProgress,
    pub budget_progress: BudgetProgress,
    pub indicators: Vec<String>,
    pub next_actions: Vec<String>,
}

/// A bounded, monotonic sequence of turns between a fixed participant set.
///
/// Mutated only by the orchestrator: `append` is the sole way turns enter
/// the history, and terminal status freezes the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    session_id: String,
    participants: Vec<String>,
    topic: String,
    status: SessionStatus,
    current_turn: usize,
    max_turns: u32,
    total_cost: f64,
    budget: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    policy_id: String,
    turn_history: Vec<TurnMessage>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl ConversationSession {
    pub fn new(
        participants: Vec<String>,
        topic: impl Into<String>,
        policy_id: impl Into<String>,
        max_turns: u32,
        budget: f64,
    ) -> Result<Self> {
        let topic = topic.into();

        if participants.len() < MIN_PARTICIPANTS {
            return Err(TabError::Validation(format!(
                "at least {} participants required, got {}",
                MIN_PARTICIPANTS,
                participants.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &participants {
            if !seen.insert(agent.as_str()) {
                return Err(TabError::Validation(format!(
                    "duplicate participant: {}",
                    agent
                )));
            }
        }
        if topic.is_empty() || topic.chars().count() > MAX_TOPIC_CHARS {
            return Err(TabError::Validation(format!(
                "topic must be 1..={} characters",
                MAX_TOPIC_CHARS
            )));
        }
        if max_turns == 0 || max_turns > MAX_TURNS_CEILING {
            return Err(TabError::Validation(format!(
                "max_turns must be 1..={}, got {}",
                MAX_TURNS_CEILING, max_turns
            )));
        }
        if budget <= 0.0 || !budget.is_finite() {
            return Err(TabError::Validation(format!(
                "budget must be positive, got {}",
                budget
            )));
        }

        let now = Utc::now();
        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            participants,
            topic,
            status: SessionStatus::Active,
            current_turn: 0,
            max_turns,
            total_cost: 0.0,
            budget,
            created_at: now,
            updated_at: now,
            policy_id: policy_id.into(),
            turn_history: Vec::new(),
            metadata: HashMap::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_turn(&self) -> usize {
        self.current_turn
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    pub fn policy_id(&self) -> &str {
        &self.policy_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn turn_history(&self) -> &[TurnMessage] {
        &self.turn_history
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn cost_remaining(&self) -> f64 {
        (self.budget - self.total_cost).max(0.0)
    }

    pub fn turns_remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.current_turn as u32)
    }

    /// True while pre-admission could still let another turn through.
    pub fn can_accept_turn(&self) -> bool {
        self.status == SessionStatus::Active
            && self.current_turn < self.max_turns as usize
            && self.total_cost < self.budget
    }

    /// Append a produced turn. The only mutator of `turn_history`.
    ///
    /// Budget is deliberately not checked here: admission uses the
    /// pre-turn snapshot, so the turn that first overshoots is still
    /// recorded and the overshoot is handled by the controller.
    pub fn append(&mut self, turn: TurnMessage) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TabError::Invariant(format!(
                "cannot append to {} session {}",
                self.status, self.session_id
            )));
        }
        if turn.session_id != self.session_id {
            return Err(TabError::Invariant(format!(
                "turn belongs to session {}, not {}",
                turn.session_id, self.session_id
            )));
        }
        if !self.participants.iter().any(|p| p == &turn.from_agent) {
            return Err(TabError::Invariant(format!(
                "speaker {} is not a participant",
                turn.from_agent
            )));
        }
        if let Some(last) = self.turn_history.last()
            && turn.timestamp <= last.timestamp
        {
            return Err(TabError::Invariant(
                "turn timestamps must be strictly monotonic".into(),
            ));
        }

        self.total_cost += turn.cost;
        self.current_turn += 1;
        self.updated_at = Utc::now();

        debug!(
            session_id = %self.session_id,
            turn = self.current_turn,
            from = %turn.from_agent,
            cost = turn.cost,
            "Turn appended"
        );

        self.turn_history.push(turn);
        Ok(())
    }

    /// Recent turns, newest first, normalized into chat shape.
    pub fn recent(&self, limit: usize, agent_filter: Option<&str>) -> Vec<ContextMessage> {
        self.turn_history
            .iter()
            .rev()
            .filter(|t| agent_filter.is_none_or(|a| t.from_agent == a))
            .take(limit)
            .map(|t| ContextMessage {
                role: t.role,
                content: t.content.clone(),
                from_agent: t.from_agent.clone(),
                timestamp: t.timestamp,
                attachments: if t.attachments.is_empty() {
                    None
                } else {
                    Some(t.attachments.clone())
                },
            })
            .collect()
    }

    pub fn summary_stats(&self) -> SummaryStats {
        let total_turns = self.turn_history.len();
        let total_chars: usize = self.turn_history.iter().map(|t| t.content.len()).sum();
        let mut per_agent_turn_counts: HashMap<String, usize> = HashMap::new();
        for turn in &self.turn_history {
            *per_agent_turn_counts
                .entry(turn.from_agent.clone())
                .or_insert(0) += 1;
        }

        SummaryStats {
            total_turns,
            total_cost: self.total_cost,
            avg_content_length: if total_turns > 0 {
                total_chars as f64 / total_turns as f64
            } else {
                0.0
            },
            per_agent_turn_counts,
            duration_ms: (self.updated_at - self.created_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let mut indicators = Vec::new();
        let mut next_actions = Vec::new();

        let turn_ratio = self.current_turn as f64 / self.max_turns as f64;
        let cost_ratio = self.total_cost / self.budget;

        if turn_ratio >= 0.75 {
            indicators.push(format!(
                "turn budget {}% consumed",
                (turn_ratio * 100.0).round() as u32
            ));
        }
        if cost_ratio >= 0.75 {
            indicators.push(format!(
                "cost budget {}% consumed",
                (cost_ratio * 100.0).round() as u32
            ));
        }

        match self.status {
            SessionStatus::Active => {
                if turn_ratio >= 0.9 || cost_ratio >= 0.9 {
                    next_actions.push("wrap up: resources nearly exhausted".to_string());
                } else {
                    next_actions.push("continue conversation".to_string());
                }
            }
            _ => next_actions.push("inspect audit journal for the termination record".to_string()),
        }

        StatusReport {
            status: self.status,
            turn_progress: TurnProgress {
                current: self.current_turn,
                max: self.max_turns,
            },
            budget_progress: BudgetProgress {
                used: self.total_cost,
                total: self.budget,
            },
            indicators,
            next_actions,
        }
    }

    /// Decide whether the session should terminate on its own, given an
    /// already-computed convergence report. Pure over the inputs.
    pub fn should_auto_complete(
        &self,
        report: &ConvergenceReport,
        config: &ConvergenceConfig,
    ) -> bool {
        // Weighted sums like 0.5 + 0.3 land just under their nominal
        // value in f64; tolerate that at the floor.
        const EPS: f64 = 1e-9;

        let turn_ratio = self.current_turn as f64 / self.max_turns as f64;
        let cost_ratio = self.total_cost / self.budget;
        let nearly_exhausted = turn_ratio >= config.exhaustion_progress_floor - EPS
            || cost_ratio >= config.exhaustion_progress_floor - EPS;

        (report.signals.explicit_completion
            && report.confidence >= config.explicit_confidence_floor - EPS)
            || (report.signals.resource_exhaustion
                && nearly_exhausted
                && report.confidence >= config.exhaustion_confidence_floor - EPS)
            || (report.signals.repetitive_content
                && report.confidence >= config.repetitive_confidence_floor - EPS)
    }

    /// One-way transition out of `Active`. The reason is kept in session
    /// metadata for after-the-fact inspection.
    pub fn transition_to(&mut self, new_status: SessionStatus, reason: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TabError::Invariant(format!(
                "session {} already terminal ({})",
                self.session_id, self.status
            )));
        }
        if new_status == SessionStatus::Active {
            return Err(TabError::Invariant(
                "cannot transition back to active".into(),
            ));
        }

        let from = self.status;
        self.status = new_status;
        self.updated_at = Utc::now();

        let transition = json!({
            "from": from.to_string(),
            "to": new_status.to_string(),
            "reason": reason,
            "timestamp": self.updated_at.to_rfc3339(),
        });
        if let Some(transitions) = self
            .metadata
            .entry("status_transitions".to_string())
            .or_insert_with(|| json!([]))
            .as_array_mut()
        {
            transitions.push(transition);
        }

        debug!(
            session_id = %self.session_id,
            from = %from,
            to = %new_status,
            reason,
            "Session status transition"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PermissionMode;
    use crate::session::PolicySnapshot;

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot {
            policy_id: "default".to_string(),
            allowed_tools: vec![],
            disallowed_tools: vec![],
            permission_mode: PermissionMode::Auto,
        }
    }

    fn session() -> ConversationSession {
        ConversationSession::new(
            vec!["alpha".to_string(), "beta".to_string()],
            "cross-verify the parser bug",
            "default",
            4,
            1.0,
        )
        .unwrap()
    }

    fn turn(session: &ConversationSession, from: &str, to: &str, content: &str) -> TurnMessage {
        TurnMessage::new(
            session.session_id(),
            from,
            to,
            MessageRole::Assistant,
            content,
            snapshot(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_session_validation() {
        assert!(ConversationSession::new(vec!["a".into()], "t", "p", 4, 1.0).is_err());
        assert!(
            ConversationSession::new(vec!["a".into(), "a".into()], "t", "p", 4, 1.0).is_err()
        );
        assert!(
            ConversationSession::new(vec!["a".into(), "b".into()], "", "p", 4, 1.0).is_err()
        );
        assert!(
            ConversationSession::new(vec!["a".into(), "b".into()], "t", "p", 21, 1.0).is_err()
        );
        assert!(
            ConversationSession::new(vec!["a".into(), "b".into()], "t", "p", 4, 0.0).is_err()
        );
    }

    #[test]
    fn test_append_tracks_turn_count_and_cost() {
        let mut s = session();
        let t = turn(&s, "alpha", "beta", "proposal").with_cost(0.10);
        s.append(t).unwrap();

        assert_eq!(s.current_turn(), 1);
        assert_eq!(s.turn_history().len(), s.current_turn());
        assert!((s.total_cost() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_append_rejects_foreign_session() {
        let mut s = session();
        let other = session();
        let t = turn(&other, "alpha", "beta", "hello");
        assert!(matches!(s.append(t), Err(TabError::Invariant(_))));
    }

    #[test]
    fn test_append_rejects_non_participant() {
        let mut s = session();
        let t = TurnMessage::new(
            s.session_id(),
            "gamma",
            "alpha",
            MessageRole::Assistant,
            "intruding",
            snapshot(),
        )
        .unwrap();
        assert!(s.append(t).is_err());
    }

    #[test]
    fn test_append_forbidden_on_terminal_session() {
        let mut s = session();
        s.transition_to(SessionStatus::Completed, "done").unwrap();
        let t = turn(&s, "alpha", "beta", "late");
        assert!(s.append(t).is_err());
    }

    #[test]
    fn test_append_allows_budget_overshoot_once() {
        let mut s = ConversationSession::new(
            vec!["alpha".to_string(), "beta".to_string()],
            "t",
            "p",
            4,
            0.20,
        )
        .unwrap();
        s.append(turn(&s, "alpha", "beta", "first").with_cost(0.15))
            .unwrap();
        s.append(turn(&s, "beta", "alpha", "second").with_cost(0.10))
            .unwrap();

        assert!((s.total_cost() - 0.25).abs() < 1e-9);
        assert!(!s.can_accept_turn());
    }

    #[test]
    fn test_transitions_are_one_way() {
        let mut s = session();
        s.transition_to(SessionStatus::Failed, "adapter gave up")
            .unwrap();
        assert!(s.transition_to(SessionStatus::Completed, "nope").is_err());
        assert!(s.metadata().contains_key("status_transitions"));
    }

    #[test]
    fn test_recent_is_newest_first_and_filterable() {
        let mut s = session();
        s.append(turn(&s, "alpha", "beta", "one")).unwrap();
        s.append(turn(&s, "beta", "alpha", "two")).unwrap();
        s.append(turn(&s, "alpha", "beta", "three")).unwrap();

        let all = s.recent(2, None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "three");
        assert_eq!(all[1].content, "two");

        let only_alpha = s.recent(5, Some("alpha"));
        assert_eq!(only_alpha.len(), 2);
        assert!(only_alpha.iter().all(|m| m.from_agent == "alpha"));
    }

    #[test]
    fn test_summary_stats() {
        let mut s = session();
        s.append(turn(&s, "alpha", "beta", "abcd").with_cost(0.1))
            .unwrap();
        s.append(turn(&s, "beta", "alpha", "abcdefgh").with_cost(0.2))
            .unwrap();

        let stats = s.summary_stats();
        assert_eq!(stats.total_turns, 2);
        assert!((stats.avg_content_length - 6.0).abs() < f64::EPSILON);
        assert_eq!(stats.per_agent_turn_counts["alpha"], 1);
        assert_eq!(stats.per_agent_turn_counts["beta"], 1);
    }

    #[test]
    fn test_status_report_flags_exhaustion() {
        let mut s = ConversationSession::new(
            vec!["alpha".to_string(), "beta".to_string()],
            "t",
            "p",
            2,
            1.0,
        )
        .unwrap();
        s.append(turn(&s, "alpha", "beta", "one")).unwrap();
        s.append(turn(&s, "beta", "alpha", "two")).unwrap();

        let report = s.status_report();
        assert_eq!(report.turn_progress.current, 2);
        assert!(!report.indicators.is_empty());
    }
}
