use serde::{Deserialize, Serialize};

use crate::error::{Result, TabError};

/// Top-level configuration for the bridge core.
///
/// An external loader owns file parsing; the core only receives the
/// assembled value and validates it once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabConfig {
    pub orchestrator: OrchestratorConfig,
    pub convergence: ConvergenceConfig,
    pub adapter: AdapterDefaults,
}

impl TabConfig {
    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.orchestrator.context_limit == 0 {
            errors.push("orchestrator.context_limit must be greater than 0");
        }
        if self.orchestrator.circuit_breaker_threshold == 0 {
            errors.push("orchestrator.circuit_breaker_threshold must be greater than 0");
        }
        if self.orchestrator.approval_wait_secs == 0 {
            errors.push("orchestrator.approval_wait_secs must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.convergence.similarity_threshold) {
            errors.push("convergence.similarity_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.convergence.exhaustion_budget_fraction) {
            errors.push("convergence.exhaustion_budget_fraction must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.convergence.degradation_ratio) {
            errors.push("convergence.degradation_ratio must be between 0.0 and 1.0");
        }
        if self.convergence.completion_phrases.is_empty() {
            errors.push("convergence.completion_phrases must not be empty");
        }
        if self.convergence.shingle_size == 0 {
            errors.push("convergence.shingle_size must be greater than 0");
        }
        let w = &self.convergence.weights;
        if w.explicit + w.exhaustion + w.repetitive + w.degradation <= 0.0 {
            errors.push("convergence.weights must sum to a positive value");
        }

        if self.adapter.max_line_bytes == 0 {
            errors.push("adapter.max_line_bytes must be greater than 0");
        }
        if self.adapter.line_json_timeout_secs == 0 {
            errors.push("adapter.line_json_timeout_secs must be greater than 0");
        }
        if self.adapter.rollout_timeout_secs == 0 {
            errors.push("adapter.rollout_timeout_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TabError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum re-submissions of the same turn after a transient failure.
    pub max_retries_per_turn: u32,
    /// Delay between retry attempts.
    pub retry_backoff_ms: u64,
    /// Consecutive adapter failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker short-circuits submissions.
    pub circuit_breaker_cooldown_secs: u64,
    /// How many recent turns are injected as prompt context.
    pub context_limit: usize,
    /// Budget for a pre-admission decision.
    pub pre_admission_budget_ms: u64,
    /// Bounded wait on the approval channel in PROMPT mode.
    pub approval_wait_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_turn: 2,
            retry_backoff_ms: 500,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
            context_limit: 5,
            pre_admission_budget_ms: 100,
            approval_wait_secs: 30,
        }
    }
}

/// Fixed weights for folding convergence signals into one confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub explicit: f64,
    pub exhaustion: f64,
    pub repetitive: f64,
    pub degradation: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            explicit: 0.5,
            exhaustion: 0.3,
            repetitive: 0.15,
            degradation: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Jaccard similarity over token shingles above which content counts
    /// as repetitive.
    pub similarity_threshold: f64,
    /// Shingle width in tokens.
    pub shingle_size: usize,
    /// Case-insensitive substrings that signal explicit completion.
    /// Tuned per deployment.
    pub completion_phrases: Vec<String>,
    /// Remaining cost budget fraction at or below which the session
    /// counts as exhausted.
    pub exhaustion_budget_fraction: f64,
    /// Recent-to-overall content length ratio below which quality counts
    /// as degraded.
    pub degradation_ratio: f64,
    pub weights: SignalWeights,
    /// Confidence floor for auto-completing on an explicit signal.
    pub explicit_confidence_floor: f64,
    /// Confidence floor for auto-completing on resource exhaustion.
    pub exhaustion_confidence_floor: f64,
    /// Confidence floor for auto-completing on repetition.
    pub repetitive_confidence_floor: f64,
    /// Share of turn or cost budget consumed before exhaustion may
    /// auto-complete.
    pub exhaustion_progress_floor: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            shingle_size: 3,
            completion_phrases: vec![
                "task complete".to_string(),
                "task is complete".to_string(),
                "resolved".to_string(),
                "합의".to_string(),
                "final answer".to_string(),
                "no further changes".to_string(),
            ],
            exhaustion_budget_fraction: 0.05,
            degradation_ratio: 0.2,
            weights: SignalWeights::default(),
            explicit_confidence_floor: 0.8,
            exhaustion_confidence_floor: 0.6,
            repetitive_confidence_floor: 0.7,
            exhaustion_progress_floor: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterDefaults {
    /// Per-turn deadline for line-JSON children.
    pub line_json_timeout_secs: u64,
    /// Per-turn deadline for rollout-journal children.
    pub rollout_timeout_secs: u64,
    /// Reject stdout lines larger than this many bytes.
    pub max_line_bytes: usize,
    /// Readiness probe deadline.
    pub health_check_timeout_secs: u64,
    /// Grace between SIGTERM and SIGKILL when tearing a child down.
    pub term_grace_secs: u64,
    /// Poll interval while tailing a rollout journal.
    pub rollout_poll_ms: u64,
}

impl Default for AdapterDefaults {
    fn default() -> Self {
        Self {
            line_json_timeout_secs: 120,
            rollout_timeout_secs: 180,
            max_line_bytes: 1024 * 1024,
            health_check_timeout_secs: 5,
            term_grace_secs: 5,
            rollout_poll_ms: 200,
        }
    }
}
