pub mod adapter;
pub mod audit;
pub mod config;
pub mod convergence;
pub mod error;
pub mod observe;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod session;
pub mod utils;

pub use adapter::{
    AdapterDescriptor, AdapterEvent, AdapterHealth, AgentAdapter, CancelToken, EventStream,
    LineJsonAdapter, RolloutJournalAdapter, Transport, TurnLimits, TurnOutcome, TurnRequest,
};
pub use audit::{
    AuditEventKind, AuditJournal, AuditOutcome, AuditRecord, GENESIS_HASH, read_records,
    verify_chain,
};
pub use config::TabConfig;
pub use convergence::{ConvergenceAnalyzer, ConvergenceReport, ConvergenceSignals};
pub use error::{AdapterFailure, FailureKind, Result, TabError};
pub use observe::{NoopSink, ObservabilitySink, SpanHandle, SpanStatus};
pub use orchestrator::{
    CircuitBreaker, ConversationOrchestrator, ConversationRequest, ConversationResponse,
    TerminationReason,
};
pub use policy::{ApprovalHandler, Policy, PolicyEnforcer, Verdict};
pub use registry::{AgentRegistry, LoadStrategy};
pub use session::{ConversationSession, SessionStatus, TurnMessage};
