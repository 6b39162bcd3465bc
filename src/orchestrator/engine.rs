use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::breaker::CircuitBreaker;
use super::{
    ConversationRequest, ConversationResponse, OrchestrationState, Phase, TerminationReason,
};
use crate::adapter::{
    AdapterEvent, AgentAdapter, CancelToken, TurnLimits, TurnOutcome, TurnRequest,
};
use crate::audit::{AuditEventKind, AuditJournal, AuditOutcome, AuditRecord};
use crate::config::TabConfig;
use crate::convergence::{ConvergenceAnalyzer, ConvergenceReport};
use crate::error::{AdapterFailure, Result, TabError};
use crate::observe::{ObservabilitySink, SpanHandle, SpanStatus};
use crate::policy::{ApprovalRequest, PolicyEnforcer, Verdict};
use crate::registry::AgentRegistry;
use crate::session::{ConversationSession, MessageRole, SessionStatus, TurnMessage};
use crate::utils::truncate_chars;

/// Single-session turn loop, safe to run for many sessions concurrently.
/// Shared state is limited to the registry (read-mostly), the breaker
/// and the serialized journal writer.
pub struct ConversationOrchestrator {
    config: TabConfig,
    registry: Arc<AgentRegistry>,
    enforcer: Arc<PolicyEnforcer>,
    analyzer: ConvergenceAnalyzer,
    journal: AuditJournal,
    sink: Arc<dyn ObservabilitySink>,
    breaker: CircuitBreaker,
}

impl ConversationOrchestrator {
    pub fn new(
        config: TabConfig,
        registry: Arc<AgentRegistry>,
        enforcer: Arc<PolicyEnforcer>,
        journal: AuditJournal,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<Self> {
        config.validate()?;
        let analyzer = ConvergenceAnalyzer::new(config.convergence.clone());
        let breaker = CircuitBreaker::new(
            config.orchestrator.circuit_breaker_threshold,
            Duration::from_secs(config.orchestrator.circuit_breaker_cooldown_secs),
        );

        Ok(Self {
            config,
            registry,
            enforcer,
            analyzer,
            journal,
            sink,
            breaker,
        })
    }

    pub fn journal(&self) -> &AuditJournal {
        &self.journal
    }

    pub async fn run(&self, request: ConversationRequest) -> Result<ConversationResponse> {
        self.run_with_cancel(request, CancelToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        request: ConversationRequest,
        cancel: CancelToken,
    ) -> Result<ConversationResponse> {
        request.validate()?;
        for participant in &request.participants {
            if !self.registry.contains(participant) {
                return Err(TabError::Validation(format!(
                    "participant {} has no registered adapter",
                    participant
                )));
            }
        }
        if self.enforcer.policy(&request.policy_id).is_none() {
            return Err(TabError::Validation(format!(
                "unknown policy {}",
                request.policy_id
            )));
        }

        let mut session = ConversationSession::new(
            request.participants.clone(),
            request.topic.clone(),
            request.policy_id.clone(),
            request.max_turns,
            request.budget,
        )?;

        let root_span = self.sink.start_span(
            "conversation",
            None,
            &[
                ("session_id", session.session_id().to_string()),
                ("topic", truncate_chars(session.topic(), 120)),
            ],
        );

        let start_idx = request
            .initial_speaker
            .as_deref()
            .and_then(|speaker| request.participants.iter().position(|p| p == speaker))
            .unwrap_or(0);
        let mut state = OrchestrationState::new(request.participants[start_idx].clone());

        info!(
            session_id = %session.session_id(),
            participants = ?request.participants,
            max_turns = request.max_turns,
            budget = request.budget,
            "Conversation started"
        );
        self.record(
            AuditRecord::new(
                AuditEventKind::SessionStarted,
                session.session_id(),
                "conversation",
                AuditOutcome::Success,
            )
            .with_reason(truncate_chars(session.topic(), 200)),
        )
        .await?;

        let reason = self
            .turn_loop(
                &mut session,
                &mut state,
                &request.working_directory,
                &cancel,
                root_span,
                start_idx,
            )
            .await?;

        self.record(
            AuditRecord::new(
                AuditEventKind::SessionTerminated,
                session.session_id(),
                "conversation",
                match session.status() {
                    SessionStatus::Completed => AuditOutcome::Success,
                    _ => AuditOutcome::Failure,
                },
            )
            .with_reason(reason.to_string())
            .with_usage("total_cost", session.total_cost())
            .with_usage("turns", session.current_turn() as f64),
        )
        .await?;

        let status = session.status();
        self.sink.end_span(
            root_span,
            if status == SessionStatus::Completed {
                SpanStatus::Ok
            } else {
                SpanStatus::Error
            },
        );

        let stats = session.summary_stats();
        let last_content = session
            .turn_history()
            .last()
            .map(|t| t.content.as_str())
            .unwrap_or("no turns completed");

        Ok(ConversationResponse {
            session_id: session.session_id().to_string(),
            status,
            turn_count: session.current_turn(),
            total_cost: session.total_cost(),
            duration_ms: stats.duration_ms,
            termination_reason: reason,
            summary: format!(
                "{} turns, cost {:.4} ({}): {}",
                stats.total_turns,
                stats.total_cost,
                reason,
                truncate_chars(last_content, 200)
            ),
            last_successful_turn: session.current_turn(),
            history: request.include_history.then(|| {
                let mut history = session.recent(usize::MAX, None);
                history.reverse();
                history
            }),
        })
    }

    /// The turn state machine. Returns the termination reason after moving
    /// the session to a terminal status.
    async fn turn_loop(
        &self,
        session: &mut ConversationSession,
        state: &mut OrchestrationState,
        working_dir: &Path,
        cancel: &CancelToken,
        root_span: SpanHandle,
        start_idx: usize,
    ) -> Result<TerminationReason> {
        let participants = session.participants().to_vec();
        let n = participants.len();

        loop {
            if cancel.is_cancelled() {
                session.transition_to(SessionStatus::Failed, "cancelled by caller")?;
                return Ok(TerminationReason::Cancelled);
            }

            let turn_index = session.current_turn();
            let speaker_idx = (start_idx + turn_index) % n;
            let speaker = participants[speaker_idx].clone();
            let listener = participants[(speaker_idx + 1) % n].clone();
            state.active_agent = speaker.clone();
            state.phase = Phase::Awaiting;

            let turn_span = self.sink.start_span(
                "turn",
                Some(root_span),
                &[
                    ("turn", turn_index.to_string()),
                    ("speaker", speaker.clone()),
                ],
            );

            // Pre-admission.
            let mut verdict = self
                .enforcer
                .validate_turn_request(session, &speaker, &listener, &[]);
            if verdict == Verdict::RequireApproval {
                verdict = self
                    .enforcer
                    .resolve_approval(ApprovalRequest {
                        session_id: session.session_id().to_string(),
                        agent_id: speaker.clone(),
                        policy_id: session.policy_id().to_string(),
                        action: format!("turn {}", turn_index),
                    })
                    .await;
            }
            self.sink.add_event(
                turn_span,
                "policy_pre_admission",
                &[("verdict", format!("{:?}", verdict))],
            );

            if let Verdict::Block { reason } = verdict {
                self.sink.end_span(turn_span, SpanStatus::Error);
                if let Some(terminal) = self
                    .handle_pre_admission_block(session, state, &speaker, &reason)
                    .await?
                {
                    return Ok(terminal);
                }
                continue;
            }

            self.record(
                AuditRecord::new(
                    AuditEventKind::TurnAdmitted,
                    session.session_id(),
                    format!("turn {}", turn_index),
                    AuditOutcome::Success,
                )
                .with_agent(&speaker),
            )
            .await?;

            // Adapter call with retry and failover.
            state.phase = Phase::Streaming;
            let prompt = Self::compose_turn_prompt(session);
            let outcome = self
                .execute_with_recovery(
                    session, state, &speaker, &prompt, working_dir, cancel, turn_span,
                )
                .await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(failure) if failure.is_cancelled() => {
                    self.sink.end_span(turn_span, SpanStatus::Error);
                    session.transition_to(SessionStatus::Failed, "cancelled mid-turn")?;
                    return Ok(TerminationReason::Cancelled);
                }
                Err(failure) => {
                    self.sink.end_span(turn_span, SpanStatus::Error);
                    session.transition_to(
                        SessionStatus::Failed,
                        &format!("adapter gave up: {}", failure),
                    )?;
                    return Ok(TerminationReason::AdapterFailure);
                }
            };

            if outcome.content.trim().is_empty() {
                self.record_adapter_failure(
                    session,
                    &speaker,
                    &AdapterFailure::malformed("terminal event carried no content"),
                )
                .await;
                self.sink.end_span(turn_span, SpanStatus::Error);
                session.transition_to(SessionStatus::Failed, "adapter returned empty content")?;
                return Ok(TerminationReason::AdapterFailure);
            }

            // Post-validation and append.
            state.phase = Phase::Evaluating;
            let policy = self
                .enforcer
                .policy(session.policy_id())
                .ok_or_else(|| TabError::Invariant("policy vanished mid-session".into()))?;
            let turn = TurnMessage::new(
                session.session_id(),
                &speaker,
                &listener,
                MessageRole::Assistant,
                outcome.content.clone(),
                policy.snapshot(),
            )
            .map_err(|e| TabError::Invariant(format!("adapter produced invalid turn: {}", e)))?
            .with_cost(outcome.cost)
            .with_duration_ms(outcome.duration_ms);

            let verdict = self.enforcer.validate_turn_result(session, &turn);
            self.sink.add_event(
                turn_span,
                "policy_post_validation",
                &[("verdict", format!("{:?}", verdict))],
            );
            if let Verdict::Block { reason } = verdict {
                self.sink.end_span(turn_span, SpanStatus::Error);
                warn!(
                    session_id = %session.session_id(),
                    speaker = %speaker,
                    reason = %reason,
                    "Produced turn rejected by policy"
                );
                self.record(
                    AuditRecord::new(
                        AuditEventKind::PolicyViolation,
                        session.session_id(),
                        format!("turn {}", turn_index),
                        AuditOutcome::Blocked,
                    )
                    .with_agent(&speaker)
                    .with_reason(&reason),
                )
                .await?;
                self.record(
                    AuditRecord::new(
                        AuditEventKind::TurnRejected,
                        session.session_id(),
                        format!("turn {}", turn_index),
                        AuditOutcome::Blocked,
                    )
                    .with_agent(&speaker)
                    .with_reason(&reason),
                )
                .await?;

                state.consecutive_denials += 1;
                if state.consecutive_denials >= session.max_turns() {
                    session.transition_to(SessionStatus::Failed, "repeated policy denials")?;
                    return Ok(TerminationReason::PolicyDenied);
                }
                // Resource counters are untouched; convergence still runs.
                if let Some(terminal) = self.evaluate_convergence(session, state).await? {
                    return Ok(terminal);
                }
                continue;
            }

            if let Err(err) = session.append(turn) {
                // Programmer error; record and re-raise to the host.
                self.record(
                    AuditRecord::new(
                        AuditEventKind::PolicyViolation,
                        session.session_id(),
                        format!("turn {}", turn_index),
                        AuditOutcome::Failure,
                    )
                    .with_agent(&speaker)
                    .with_reason(err.to_string()),
                )
                .await?;
                session.transition_to(SessionStatus::Failed, "invariant violated")?;
                return Err(err);
            }
            state.consecutive_denials = 0;
            state.retry_count_for_current_turn = 0;

            self.record(
                AuditRecord::new(
                    AuditEventKind::TurnEmitted,
                    session.session_id(),
                    format!("turn {}", turn_index),
                    AuditOutcome::Success,
                )
                .with_agent(&speaker)
                .with_usage("cost", outcome.cost)
                .with_usage("duration_ms", outcome.duration_ms as f64),
            )
            .await?;
            self.sink
                .record_metric("tab.turn.cost", outcome.cost, &[("agent", speaker.clone())]);
            self.sink.end_span(turn_span, SpanStatus::Ok);

            // The overshooting turn is recorded; the session stops here.
            if session.total_cost() >= session.budget() {
                self.record(
                    AuditRecord::new(
                        AuditEventKind::BudgetExceeded,
                        session.session_id(),
                        format!("turn {}", turn_index),
                        AuditOutcome::Failure,
                    )
                    .with_reason(format!(
                        "spent {:.4} of {:.4}",
                        session.total_cost(),
                        session.budget()
                    )),
                )
                .await?;
                session.transition_to(SessionStatus::Completed, "budget exceeded")?;
                return Ok(TerminationReason::BudgetExceeded);
            }

            if let Some(terminal) = self.evaluate_convergence(session, state).await? {
                return Ok(terminal);
            }
        }
    }

    /// Pre-admission block handling. Exhaustion codes terminate; policy
    /// denials leave the session active and fall through to convergence.
    async fn handle_pre_admission_block(
        &self,
        session: &mut ConversationSession,
        state: &mut OrchestrationState,
        speaker: &str,
        reason: &str,
    ) -> Result<Option<TerminationReason>> {
        if reason.starts_with("BUDGET_EXHAUSTED") || reason.starts_with("TURN_LIMIT") {
            let terminal = if reason.starts_with("BUDGET_EXHAUSTED") {
                TerminationReason::BudgetExceeded
            } else {
                TerminationReason::TurnLimitReached
            };
            // COMPLETED when something was produced, TIMEOUT otherwise.
            let status = if session.current_turn() > 0 {
                SessionStatus::Completed
            } else {
                SessionStatus::Timeout
            };
            session.transition_to(status, reason)?;
            return Ok(Some(terminal));
        }

        self.record(
            AuditRecord::new(
                AuditEventKind::PolicyViolation,
                session.session_id(),
                format!("turn {}", session.current_turn()),
                AuditOutcome::Blocked,
            )
            .with_agent(speaker)
            .with_reason(reason),
        )
        .await?;

        state.consecutive_denials += 1;
        if state.consecutive_denials >= session.max_turns() {
            session.transition_to(SessionStatus::Failed, "repeated policy denials")?;
            return Ok(Some(TerminationReason::PolicyDenied));
        }
        Ok(self.evaluate_convergence(session, state).await?)
    }

    async fn evaluate_convergence(
        &self,
        session: &mut ConversationSession,
        state: &mut OrchestrationState,
    ) -> Result<Option<TerminationReason>> {
        state.phase = Phase::Converging;
        let report = self.analyzer.analyze(session);
        debug!(
            session_id = %session.session_id(),
            should_continue = report.should_continue,
            confidence = report.confidence,
            signals = ?report.signals,
            "Convergence evaluated"
        );

        if report.should_continue
            && !session.should_auto_complete(&report, self.analyzer.config())
        {
            state.phase = Phase::Idle;
            return Ok(None);
        }

        let reason = Self::termination_reason(&report, session);
        session.transition_to(SessionStatus::Completed, &reason.to_string())?;
        Ok(Some(reason))
    }

    fn termination_reason(
        report: &ConvergenceReport,
        session: &ConversationSession,
    ) -> TerminationReason {
        if report.signals.explicit_completion {
            TerminationReason::ExplicitCompletion
        } else if report.signals.repetitive_content {
            TerminationReason::ConvergedRepetition
        } else if report.signals.resource_exhaustion {
            if session.turns_remaining() <= 1 {
                TerminationReason::TurnLimitReached
            } else {
                TerminationReason::BudgetExceeded
            }
        } else {
            TerminationReason::QualityDegradation
        }
    }

    /// First turn asks the topic; later turns answer the previous speaker.
    fn compose_turn_prompt(session: &ConversationSession) -> String {
        match session.turn_history().last() {
            None => session.topic().to_string(),
            Some(last) => format!(
                "Respond to {}'s latest message in the conversation about: {}",
                last.from_agent,
                truncate_chars(session.topic(), 200)
            ),
        }
    }

    /// Submit one turn with retries and at most one failover attempt.
    async fn execute_with_recovery(
        &self,
        session: &ConversationSession,
        state: &mut OrchestrationState,
        speaker: &str,
        prompt: &str,
        working_dir: &Path,
        cancel: &CancelToken,
        turn_span: SpanHandle,
    ) -> std::result::Result<TurnOutcome, AdapterFailure> {
        let adapter = match self.registry.get(speaker) {
            Some(adapter) => adapter,
            None => return Err(AdapterFailure::permanent("adapter unregistered mid-session")),
        };
        state.retry_count_for_current_turn = 0;
        let max_retries = self.config.orchestrator.max_retries_per_turn;
        let backoff = Duration::from_millis(self.config.orchestrator.retry_backoff_ms);

        loop {
            if !self.breaker.allows(speaker) {
                let failure = AdapterFailure::transient("circuit breaker open");
                return match self
                    .attempt_failover(session, &adapter, prompt, working_dir, cancel, turn_span)
                    .await
                {
                    Some(result) => result,
                    None => Err(failure),
                };
            }

            let result = self
                .invoke(session, adapter.as_ref(), prompt, working_dir, cancel, turn_span)
                .await;

            let failure = match result {
                Ok(outcome) => {
                    self.breaker.record_success(speaker);
                    state.consecutive_failures = 0;
                    return Ok(outcome);
                }
                Err(failure) if failure.is_cancelled() => return Err(failure),
                Err(failure) => failure,
            };

            self.breaker.record_failure(speaker);
            state.consecutive_failures += 1;
            self.record_adapter_failure(session, speaker, &failure).await;

            if !failure.is_transient() {
                // Permanent failures are neither retried nor failed over.
                return Err(failure);
            }

            if state.retry_count_for_current_turn < max_retries && !cancel.is_cancelled() {
                state.retry_count_for_current_turn += 1;
                debug!(
                    session_id = %session.session_id(),
                    speaker,
                    retry = state.retry_count_for_current_turn,
                    "Retrying turn after transient failure"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            return match self
                .attempt_failover(session, &adapter, prompt, working_dir, cancel, turn_span)
                .await
            {
                Some(result) => result,
                None => Err(failure),
            };
        }
    }

    /// One attempt with the descriptor's declared alternate, if any. The
    /// original adapter becomes eligible again on the next turn.
    async fn attempt_failover(
        &self,
        session: &ConversationSession,
        primary: &Arc<dyn AgentAdapter>,
        prompt: &str,
        working_dir: &Path,
        cancel: &CancelToken,
        turn_span: SpanHandle,
    ) -> Option<std::result::Result<TurnOutcome, AdapterFailure>> {
        let alternate_id = primary.descriptor().failover.clone()?;
        let alternate = self.registry.get(&alternate_id)?;
        if !self.breaker.allows(&alternate_id) {
            return None;
        }

        info!(
            session_id = %session.session_id(),
            primary = %primary.descriptor().agent_id,
            alternate = %alternate_id,
            "Failing over to alternate adapter"
        );

        match self
            .invoke(session, alternate.as_ref(), prompt, working_dir, cancel, turn_span)
            .await
        {
            Ok(outcome) => {
                self.breaker.record_success(&alternate_id);
                Some(Ok(outcome))
            }
            Err(failure) => {
                self.breaker.record_failure(&alternate_id);
                self.record_adapter_failure(session, &alternate_id, &failure)
                    .await;
                Some(Err(failure))
            }
        }
    }

    /// One adapter submission: stream folding under the turn deadline.
    async fn invoke(
        &self,
        session: &ConversationSession,
        adapter: &dyn AgentAdapter,
        prompt: &str,
        working_dir: &Path,
        cancel: &CancelToken,
        turn_span: SpanHandle,
    ) -> std::result::Result<TurnOutcome, AdapterFailure> {
        let descriptor = adapter.descriptor();
        let policy = self.enforcer.policy(session.policy_id());
        let deadline_ms = policy
            .as_ref()
            .map(|p| p.resource_limits.max_execution_ms)
            .unwrap_or(u64::MAX)
            .min(descriptor.timeout_secs.saturating_mul(1000));
        let max_cost = policy
            .map(|p| p.resource_limits.max_cost)
            .unwrap_or(f64::MAX)
            .min(session.cost_remaining());

        let call_span = self.sink.start_span(
            "adapter_call",
            Some(turn_span),
            &[("agent_id", descriptor.agent_id.clone())],
        );

        let request = TurnRequest {
            session_id: session.session_id().to_string(),
            prompt: prompt.to_string(),
            context: session.recent(self.config.orchestrator.context_limit, None),
            limits: TurnLimits {
                deadline: Duration::from_millis(deadline_ms),
                max_cost,
            },
            working_dir: working_dir.to_path_buf(),
            cancel: cancel.clone(),
        };

        let mut stream = adapter.submit(request).await;
        let mut chunks = 0u64;
        let outcome = loop {
            match stream.next().await {
                Some(AdapterEvent::Chunk { .. }) => chunks += 1,
                Some(AdapterEvent::SessionAnnounced { adapter_session_id }) => {
                    self.sink.add_event(
                        call_span,
                        "session_announced",
                        &[("adapter_session_id", adapter_session_id)],
                    );
                }
                Some(AdapterEvent::Completed(outcome)) => break Ok(outcome),
                Some(AdapterEvent::Failed(failure)) => break Err(failure),
                None => {
                    break Err(AdapterFailure::transient(
                        "stream closed without a terminal event",
                    ));
                }
            }
        };

        self.sink
            .record_metric("tab.adapter.chunks", chunks as f64, &[]);
        self.sink.end_span(
            call_span,
            if outcome.is_ok() {
                SpanStatus::Ok
            } else {
                SpanStatus::Error
            },
        );
        outcome
    }

    async fn record_adapter_failure(
        &self,
        session: &ConversationSession,
        agent_id: &str,
        failure: &AdapterFailure,
    ) {
        let record = AuditRecord::new(
            AuditEventKind::AdapterFailure,
            session.session_id(),
            format!("turn {}", session.current_turn()),
            AuditOutcome::Failure,
        )
        .with_agent(agent_id)
        .with_reason(failure.to_string());

        // Failure records are best-effort; journal trouble surfaces on
        // the next acknowledged append.
        if let Err(err) = self.journal.append(record).await {
            warn!(error = %err, "Failed to record adapter failure");
        }
    }

    async fn record(&self, record: AuditRecord) -> Result<AuditRecord> {
        self.journal.append(record).await
    }
}
