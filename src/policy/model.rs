use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TabError};
use crate::session::PolicySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Admit without asking.
    Auto,
    /// Defer to the approval channel with a bounded wait.
    Prompt,
    /// Block outright.
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_execution_ms: u64,
    pub max_cost: f64,
    pub max_memory_mb: u64,
    pub max_file_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_ms: 120_000,
            max_cost: 1.0,
            max_memory_mb: 512,
            max_file_size_mb: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAccess {
    Allow,
    ReadOnly,
    Deny,
}

/// One prefix rule. Rules are ordered; the first matching prefix decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRule {
    pub prefix: PathBuf,
    pub access: FileAccess,
}

impl FileRule {
    pub fn new(prefix: impl Into<PathBuf>, access: FileAccess) -> Self {
        Self {
            prefix: prefix.into(),
            access,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRules {
    pub allowed: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_ports: Vec<u16>,
}

/// Isolation knobs applied to a child before execution begins. The core
/// passes these to whoever constructs the sandbox; it does not build one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub drop_capabilities: Vec<String>,
    pub read_only_paths: Vec<PathBuf>,
    pub max_pids: Option<u32>,
    pub max_open_files: Option<u32>,
}

/// A named bundle of admission, resource, and isolation rules applied
/// uniformly within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub name: String,
    pub description: String,
    pub allowed_tools: BTreeSet<String>,
    pub disallowed_tools: BTreeSet<String>,
    pub permission_mode: PermissionMode,
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub file_rules: Vec<FileRule>,
    #[serde(default)]
    pub network: NetworkRules,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub approval_required: BTreeSet<String>,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        if self.policy_id.is_empty() {
            return Err(TabError::Validation("policy_id must not be empty".into()));
        }
        if let Some(tool) = self.allowed_tools.intersection(&self.disallowed_tools).next() {
            return Err(TabError::Validation(format!(
                "tool '{}' is both allowed and disallowed in policy {}",
                tool, self.policy_id
            )));
        }
        Ok(())
    }

    /// First matching prefix rule decides; no match means deny.
    pub fn file_access(&self, path: &std::path::Path) -> FileAccess {
        for rule in &self.file_rules {
            if path.starts_with(&rule.prefix) {
                return rule.access;
            }
        }
        FileAccess::Deny
    }

    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        if self.disallowed_tools.contains(tool) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.contains(tool)
    }

    /// Freeze the allow/deny state into the value carried by a turn.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            policy_id: self.policy_id.clone(),
            allowed_tools: self.allowed_tools.iter().cloned().collect(),
            disallowed_tools: self.disallowed_tools.iter().cloned().collect(),
            permission_mode: self.permission_mode,
        }
    }

    fn base(policy_id: &str, name: &str, description: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            allowed_tools: BTreeSet::new(),
            disallowed_tools: BTreeSet::new(),
            permission_mode: PermissionMode::Auto,
            resource_limits: ResourceLimits::default(),
            file_rules: Vec::new(),
            network: NetworkRules::default(),
            sandbox: SandboxConfig::default(),
            approval_required: BTreeSet::new(),
        }
    }

    /// Standard policy for development sessions.
    pub fn default_policy() -> Self {
        let mut policy = Self::base(
            "default",
            "Default Development Policy",
            "Standard policy for development sessions",
        );
        policy.allowed_tools = ["Read", "Write", "Edit", "Bash", "Grep", "Glob"]
            .into_iter()
            .map(String::from)
            .collect();
        policy.permission_mode = PermissionMode::Auto;
        policy.file_rules = vec![
            FileRule::new("/workspace", FileAccess::Allow),
            FileRule::new("/tmp", FileAccess::Allow),
            FileRule::new("/usr", FileAccess::ReadOnly),
            FileRule::new("/etc", FileAccess::ReadOnly),
            FileRule::new("/proc", FileAccess::Deny),
            FileRule::new("/sys", FileAccess::Deny),
        ];
        policy
    }

    /// Strict read-only access with minimal permissions.
    pub fn read_only_strict() -> Self {
        let mut policy = Self::base(
            "read_only_strict",
            "Read-Only Strict Policy",
            "Strict read-only access with minimal permissions",
        );
        policy.allowed_tools = ["Read", "Grep", "Glob"].into_iter().map(String::from).collect();
        policy.disallowed_tools = ["Write", "Edit", "Bash", "MultiEdit"]
            .into_iter()
            .map(String::from)
            .collect();
        policy.permission_mode = PermissionMode::Deny;
        policy.resource_limits = ResourceLimits {
            max_execution_ms: 60_000,
            max_cost: 0.1,
            max_memory_mb: 256,
            max_file_size_mb: 5,
        };
        policy.file_rules = vec![
            FileRule::new("/workspace", FileAccess::ReadOnly),
            FileRule::new("/usr", FileAccess::ReadOnly),
        ];
        policy
    }

    /// Controlled write access, shell disabled, approvals on edits.
    pub fn development_safe() -> Self {
        let mut policy = Self::base(
            "development_safe",
            "Development Safe Policy",
            "Safe development policy with controlled access",
        );
        policy.allowed_tools = ["Read", "Write", "Edit", "Grep", "Glob", "MultiEdit"]
            .into_iter()
            .map(String::from)
            .collect();
        policy.disallowed_tools = ["Bash"].into_iter().map(String::from).collect();
        policy.permission_mode = PermissionMode::Prompt;
        policy.resource_limits = ResourceLimits {
            max_execution_ms: 180_000,
            max_cost: 0.5,
            max_memory_mb: 1024,
            max_file_size_mb: 20,
        };
        policy.approval_required = ["Write", "Edit", "MultiEdit"]
            .into_iter()
            .map(String::from)
            .collect();
        policy.file_rules = vec![
            FileRule::new("/workspace", FileAccess::Allow),
            FileRule::new("/tmp", FileAccess::Allow),
            FileRule::new("/usr", FileAccess::ReadOnly),
            FileRule::new("/proc", FileAccess::Deny),
        ];
        policy
    }
}
