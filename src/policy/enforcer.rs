use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::model::{FileAccess, PermissionMode, Policy};
use crate::session::{ConversationSession, TurnMessage};

/// Admission decision for a planned or produced turn.
///
/// `Block` carries a stable reason code followed by detail, e.g.
/// `"DISALLOWED_TOOL: shell.rm"`.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Block { reason: String },
    RequireApproval,
}

impl Verdict {
    fn block(code: &str, detail: impl std::fmt::Display) -> Self {
        Self::Block {
            reason: format!("{}: {}", code, detail),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// What an external approver sees when PROMPT mode defers a decision.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub agent_id: String,
    pub policy_id: String,
    pub action: String,
}

/// External approval channel for PROMPT-mode policies. The enforcer
/// bounds the wait; implementations just answer.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, request: ApprovalRequest) -> bool;
}

/// Gate between the scheduler and every side-effecting action: admits a
/// planned turn before the adapter runs and validates the produced turn
/// after it returns.
pub struct PolicyEnforcer {
    policies: RwLock<HashMap<String, Policy>>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    approval_wait: Duration,
}

impl PolicyEnforcer {
    pub fn new(approval_wait: Duration) -> Self {
        let mut policies = HashMap::new();
        for policy in [
            Policy::default_policy(),
            Policy::read_only_strict(),
            Policy::development_safe(),
        ] {
            policies.insert(policy.policy_id.clone(), policy);
        }

        Self {
            policies: RwLock::new(policies),
            approval: None,
            approval_wait,
        }
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn register_policy(&self, policy: Policy) -> crate::error::Result<()> {
        policy.validate()?;
        self.policies.write().insert(policy.policy_id.clone(), policy);
        Ok(())
    }

    pub fn policy(&self, policy_id: &str) -> Option<Policy> {
        self.policies.read().get(policy_id).cloned()
    }

    /// Pre-admission: may this turn be scheduled at all?
    pub fn validate_turn_request(
        &self,
        session: &ConversationSession,
        planned_from: &str,
        planned_to: &str,
        tools_hint: &[String],
    ) -> Verdict {
        let Some(policy) = self.policy(session.policy_id()) else {
            return Verdict::block("POLICY_NOT_FOUND", session.policy_id());
        };

        if session.status().is_terminal() {
            return Verdict::block("SESSION_NOT_ACTIVE", session.status());
        }
        if session.current_turn() >= session.max_turns() as usize {
            return Verdict::block("TURN_LIMIT", session.max_turns());
        }
        if session.total_cost() >= session.budget() {
            return Verdict::block(
                "BUDGET_EXHAUSTED",
                format!("{:.4}/{:.4}", session.total_cost(), session.budget()),
            );
        }
        if !session.participants().iter().any(|p| p == planned_from) {
            return Verdict::block("UNKNOWN_SPEAKER", planned_from);
        }
        if planned_from == planned_to {
            return Verdict::block("SELF_ADDRESSED", planned_from);
        }
        let mut needs_approval = false;
        for tool in tools_hint {
            if policy.disallowed_tools.contains(tool) {
                return Verdict::block("DISALLOWED_TOOL", tool);
            }
            if !policy.is_tool_allowed(tool) {
                return Verdict::block("TOOL_NOT_ALLOWED", tool);
            }
            if policy.approval_required.contains(tool) {
                needs_approval = true;
            }
        }

        match policy.permission_mode {
            PermissionMode::Deny => Verdict::block("PERMISSION_DENIED", "policy mode is deny"),
            PermissionMode::Prompt => Verdict::RequireApproval,
            PermissionMode::Auto if needs_approval => Verdict::RequireApproval,
            PermissionMode::Auto => Verdict::Allow,
        }
    }

    /// Post-validation: may this produced turn enter the history?
    ///
    /// Cost tolerates one overshooting turn: admission ran against the
    /// pre-turn snapshot, so a turn is only blocked on cost when the
    /// budget was already spent before it started.
    pub fn validate_turn_result(
        &self,
        session: &ConversationSession,
        turn: &TurnMessage,
    ) -> Verdict {
        let Some(policy) = self.policy(session.policy_id()) else {
            return Verdict::block("POLICY_NOT_FOUND", session.policy_id());
        };

        for tool in &policy.disallowed_tools {
            if turn.content.contains(tool.as_str()) {
                return Verdict::block("DISALLOWED_TOOL", tool);
            }
        }

        let max_attachment_bytes = policy.resource_limits.max_file_size_mb * 1024 * 1024;
        for attachment in &turn.attachments {
            if attachment.size_bytes > max_attachment_bytes {
                return Verdict::block(
                    "ATTACHMENT_TOO_LARGE",
                    format!("{} ({} bytes)", attachment.name, attachment.size_bytes),
                );
            }
            let path = Path::new(&attachment.name);
            if path.is_absolute() && policy.file_access(path) == FileAccess::Deny {
                return Verdict::block("PATH_DENIED", attachment.name.clone());
            }
        }

        if session.total_cost() >= session.budget() {
            return Verdict::block(
                "BUDGET_EXHAUSTED",
                format!("{:.4}/{:.4}", session.total_cost(), session.budget()),
            );
        }

        if turn.duration_ms > policy.resource_limits.max_execution_ms {
            return Verdict::block(
                "DURATION_EXCEEDED",
                format!(
                    "{}ms > {}ms",
                    turn.duration_ms, policy.resource_limits.max_execution_ms
                ),
            );
        }

        Verdict::Allow
    }

    /// Resolve a `RequireApproval` verdict through the approval channel
    /// with a bounded wait. Timeout and absence both map to block.
    pub async fn resolve_approval(&self, request: ApprovalRequest) -> Verdict {
        let Some(handler) = &self.approval else {
            warn!(
                session_id = %request.session_id,
                "Approval required but no handler configured"
            );
            return Verdict::block("APPROVAL_UNAVAILABLE", "no approval handler configured");
        };

        match tokio::time::timeout(self.approval_wait, handler.approve(request.clone())).await {
            Ok(true) => {
                debug!(session_id = %request.session_id, action = %request.action, "Approval granted");
                Verdict::Allow
            }
            Ok(false) => Verdict::block("APPROVAL_REJECTED", request.action),
            Err(_) => Verdict::block(
                "APPROVAL_TIMEOUT",
                format!("no answer within {:?}", self.approval_wait),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Attachment, MessageRole};

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new(Duration::from_millis(50))
    }

    fn session(policy_id: &str) -> ConversationSession {
        ConversationSession::new(
            vec!["alpha".to_string(), "beta".to_string()],
            "topic",
            policy_id,
            4,
            1.0,
        )
        .unwrap()
    }

    fn turn(session: &ConversationSession, content: &str) -> TurnMessage {
        let policy = Policy::default_policy();
        TurnMessage::new(
            session.session_id(),
            "alpha",
            "beta",
            MessageRole::Assistant,
            content,
            policy.snapshot(),
        )
        .unwrap()
    }

    #[test]
    fn test_pre_admission_happy_path() {
        let enforcer = enforcer();
        let session = session("default");
        let verdict =
            enforcer.validate_turn_request(&session, "alpha", "beta", &["Read".to_string()]);
        assert!(verdict.is_allow());
    }

    #[test]
    fn test_pre_admission_blocks_unknown_policy() {
        let enforcer = enforcer();
        let session = session("no-such-policy");
        let verdict = enforcer.validate_turn_request(&session, "alpha", "beta", &[]);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("POLICY_NOT_FOUND")
        ));
    }

    #[test]
    fn test_pre_admission_blocks_disallowed_tool_hint() {
        let enforcer = enforcer();
        let session = session("read_only_strict");
        let verdict =
            enforcer.validate_turn_request(&session, "alpha", "beta", &["Bash".to_string()]);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("DISALLOWED_TOOL")
        ));
    }

    #[test]
    fn test_pre_admission_blocks_exhausted_budget() {
        let enforcer = enforcer();
        let mut session = session("default");
        let expensive = turn(&session, "pricey").with_cost(2.0);
        session.append(expensive).unwrap();

        let verdict = enforcer.validate_turn_request(&session, "beta", "alpha", &[]);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("BUDGET_EXHAUSTED")
        ));
    }

    #[test]
    fn test_prompt_mode_requires_approval() {
        let enforcer = enforcer();
        let session = session("development_safe");
        let verdict = enforcer.validate_turn_request(&session, "alpha", "beta", &[]);
        assert_eq!(verdict, Verdict::RequireApproval);
    }

    #[test]
    fn test_approval_required_tool_in_auto_mode() {
        let enforcer = enforcer();
        let mut policy = Policy::default_policy();
        policy.policy_id = "auto-with-gate".to_string();
        policy.approval_required.insert("Bash".to_string());
        enforcer.register_policy(policy).unwrap();

        let session = session("auto-with-gate");
        let plain =
            enforcer.validate_turn_request(&session, "alpha", "beta", &["Read".to_string()]);
        assert!(plain.is_allow());

        let gated =
            enforcer.validate_turn_request(&session, "alpha", "beta", &["Bash".to_string()]);
        assert_eq!(gated, Verdict::RequireApproval);
    }

    #[test]
    fn test_post_validation_catches_disallowed_tool_reference() {
        let enforcer = enforcer();
        let mut policy = Policy::default_policy();
        policy.disallowed_tools.insert("shell.rm".to_string());
        policy.allowed_tools.remove("Bash");
        policy.policy_id = "no-rm".to_string();
        enforcer.register_policy(policy).unwrap();

        let session = session("no-rm");
        let bad_turn = turn(&session, "I will call shell.rm to clean up");
        let verdict = enforcer.validate_turn_result(&session, &bad_turn);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("DISALLOWED_TOOL")
        ));
    }

    #[test]
    fn test_post_validation_tolerates_single_overshoot() {
        let enforcer = enforcer();
        let session = session("default");
        // Pre-turn cost is 0 < budget, so a turn costing more than the
        // whole budget still validates.
        let overshooting = turn(&session, "result").with_cost(5.0);
        assert!(enforcer.validate_turn_result(&session, &overshooting).is_allow());
    }

    #[test]
    fn test_post_validation_rejects_oversized_attachment() {
        let enforcer = enforcer();
        let session = session("default");
        let turn = turn(&session, "patch attached").with_attachments(vec![Attachment::new(
            "huge.bin",
            "application/octet-stream",
            11 * 1024 * 1024,
        )]);
        let verdict = enforcer.validate_turn_result(&session, &turn);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("ATTACHMENT_TOO_LARGE")
        ));
    }

    #[test]
    fn test_post_validation_rejects_denied_path() {
        let enforcer = enforcer();
        let session = session("default");
        let turn = turn(&session, "report").with_attachments(vec![Attachment::new(
            "/proc/self/environ",
            "text/plain",
            64,
        )]);
        let verdict = enforcer.validate_turn_result(&session, &turn);
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("PATH_DENIED")
        ));
    }

    struct ScriptedApprover(bool);

    #[async_trait]
    impl ApprovalHandler for ScriptedApprover {
        async fn approve(&self, _request: ApprovalRequest) -> bool {
            self.0
        }
    }

    struct StalledApprover;

    #[async_trait]
    impl ApprovalHandler for StalledApprover {
        async fn approve(&self, _request: ApprovalRequest) -> bool {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            session_id: "s-1".to_string(),
            agent_id: "alpha".to_string(),
            policy_id: "development_safe".to_string(),
            action: "turn".to_string(),
        }
    }

    #[tokio::test]
    async fn test_approval_granted() {
        let enforcer =
            enforcer().with_approval_handler(Arc::new(ScriptedApprover(true)));
        assert!(enforcer.resolve_approval(request()).await.is_allow());
    }

    #[tokio::test]
    async fn test_approval_rejected() {
        let enforcer =
            enforcer().with_approval_handler(Arc::new(ScriptedApprover(false)));
        let verdict = enforcer.resolve_approval(request()).await;
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("APPROVAL_REJECTED")
        ));
    }

    #[tokio::test]
    async fn test_approval_timeout_blocks() {
        let enforcer = enforcer().with_approval_handler(Arc::new(StalledApprover));
        let verdict = enforcer.resolve_approval(request()).await;
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("APPROVAL_TIMEOUT")
        ));
    }

    #[tokio::test]
    async fn test_missing_handler_blocks() {
        let enforcer = enforcer();
        let verdict = enforcer.resolve_approval(request()).await;
        assert!(matches!(
            verdict,
            Verdict::Block { reason } if reason.starts_with("APPROVAL_UNAVAILABLE")
        ));
    }
}
