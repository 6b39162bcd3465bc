//! Policy model and the enforcement gate between the scheduler and every
//! side-effecting action.

mod enforcer;
mod model;

pub use enforcer::{ApprovalHandler, ApprovalRequest, PolicyEnforcer, Verdict};
pub use model::{
    FileAccess, FileRule, NetworkRules, PermissionMode, Policy, ResourceLimits, SandboxConfig,
};
