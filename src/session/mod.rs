//! Session and turn model: the typed records every other subsystem
//! operates on, with their invariants enforced at construction and append.

mod model;
mod turn;

pub use model::{
    BudgetProgress, ContextMessage, ConversationSession, SessionStatus, StatusReport, SummaryStats,
    TurnProgress,
};
pub use turn::{Attachment, MessageRole, PolicySnapshot, TurnMessage};
