use thiserror::Error;

/// Classification of an adapter failure, decided by the adapter that
/// observed it. Transient failures are eligible for retry and failover;
/// permanent ones are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Transient,
    Permanent,
    Cancelled,
}

/// Failure reported by an agent adapter as a value, not a panic.
///
/// Adapters translate child-process trouble (timeouts, bad exits,
/// malformed terminal events) into one of these; the orchestrator decides
/// what to do with it.
#[derive(Debug, Clone)]
pub struct AdapterFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl AdapterFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            reason: "cancelled before a terminal event".to_string(),
        }
    }

    /// Deadline elapsed without any terminal event from the child.
    pub fn timeout(secs: u64) -> Self {
        Self::transient(format!("no terminal event within {}s", secs))
    }

    /// The child could not be spawned at all.
    pub fn spawn(err: &std::io::Error) -> Self {
        Self::permanent(format!("spawn failed: {}", err))
    }

    /// The child emitted a terminal event we could not make sense of.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::permanent(format!("malformed terminal event: {}", detail.into()))
    }

    /// Non-zero exit classified by signature: exits that look like
    /// resource pressure or interruption are retryable, the rest are not.
    pub fn from_exit(code: i32, stderr_tail: &str) -> Self {
        let transient_markers = ["429", "rate limit", "timed out", "connection", "temporar"];
        let lower = stderr_tail.to_lowercase();
        if transient_markers.iter().any(|m| lower.contains(m)) {
            Self::transient(format!("exit {}: {}", code, stderr_tail.trim()))
        } else {
            Self::permanent(format!("exit {}: {}", code, stderr_tail.trim()))
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl std::fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::Transient => write!(f, "transient adapter failure: {}", self.reason),
            FailureKind::Permanent => write!(f, "permanent adapter failure: {}", self.reason),
            FailureKind::Cancelled => write!(f, "adapter call cancelled: {}", self.reason),
        }
    }
}

impl std::error::Error for AdapterFailure {}

#[derive(Error, Debug)]
pub enum TabError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("Adapter failed: {0}")]
    Adapter(AdapterFailure),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Budget exceeded: spent {spent:.4} of {budget:.4}")]
    BudgetExceeded { spent: f64, budget: f64 },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Journal write failed: {0}")]
    Journal(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Approval handler unavailable: {0}")]
    Approval(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TabError {
    /// Process exit code a host should use when surfacing this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Config(_) => 64,
            Self::Registry(_) => 69,
            Self::Invariant(_) => 70,
            _ => 1,
        }
    }
}

impl From<AdapterFailure> for TabError {
    fn from(failure: AdapterFailure) -> Self {
        match failure.kind {
            FailureKind::Cancelled => TabError::Cancelled,
            _ => TabError::Adapter(failure),
        }
    }
}

pub type Result<T> = std::result::Result<T, TabError>;
