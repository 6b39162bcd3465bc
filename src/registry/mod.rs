//! Registry of loadable adapters. Lookups are by agent id; `kind` is
//! free-form metadata and never gates admission.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::{
    AdapterDescriptor, AgentAdapter, LineJsonAdapter, RolloutJournalAdapter, Transport,
};
use crate::config::AdapterDefaults;
use crate::error::{Result, TabError};

/// How a descriptor's implementation is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// In-process factory keyed off the descriptor's transport.
    Builtin,
    /// Named plugin registered at startup.
    PluginEntryPoint(String),
    /// Qualified symbol registered at startup.
    ModuleClass(String),
}

pub type AdapterFactory =
    Arc<dyn Fn(&AdapterDescriptor, &AdapterDefaults) -> Result<Arc<dyn AgentAdapter>> + Send + Sync>;

/// Read-mostly store of live adapter instances. Mutated only during
/// startup and reload.
pub struct AgentRegistry {
    defaults: AdapterDefaults,
    factories: RwLock<HashMap<String, AdapterFactory>>,
    adapters: RwLock<HashMap<String, Arc<dyn AgentAdapter>>>,
}

impl AgentRegistry {
    pub fn new(defaults: AdapterDefaults) -> Self {
        Self {
            defaults,
            factories: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Make a named factory available to `PluginEntryPoint` and
    /// `ModuleClass` descriptors.
    pub fn register_factory(&self, name: impl Into<String>, factory: AdapterFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    /// Resolve a descriptor through its load strategy and admit the
    /// resulting adapter.
    pub fn register(&self, descriptor: AdapterDescriptor, strategy: LoadStrategy) -> Result<()> {
        if descriptor.agent_id.is_empty() {
            return Err(TabError::Validation("agent_id must not be empty".into()));
        }

        let adapter: Arc<dyn AgentAdapter> = match &strategy {
            LoadStrategy::Builtin => match descriptor.transport {
                Transport::LineJsonStdout => {
                    Arc::new(LineJsonAdapter::new(descriptor, self.defaults.clone()))
                }
                Transport::RolloutJournal => {
                    Arc::new(RolloutJournalAdapter::new(descriptor, self.defaults.clone()))
                }
            },
            LoadStrategy::PluginEntryPoint(name) | LoadStrategy::ModuleClass(name) => {
                let factory = self.factories.read().get(name).cloned().ok_or_else(|| {
                    TabError::Registry(format!("no factory registered for '{}'", name))
                })?;
                factory(&descriptor, &self.defaults)?
            }
        };

        self.admit(adapter);
        Ok(())
    }

    /// Admit a pre-built adapter instance. The trait object itself is the
    /// capability proof; ids are replaced on re-registration (reload).
    pub fn admit(&self, adapter: Arc<dyn AgentAdapter>) {
        let agent_id = adapter.descriptor().agent_id.clone();
        let kind = adapter.descriptor().kind.clone();
        if self.adapters.write().insert(agent_id.clone(), adapter).is_some() {
            info!(agent_id, "Replaced registered adapter");
        } else {
            info!(agent_id, kind, "Registered adapter");
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.adapters.read().contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown_all(&self) {
        let adapters: Vec<Arc<dyn AgentAdapter>> =
            self.adapters.read().values().cloned().collect();
        for adapter in adapters {
            if let Err(err) = adapter.shutdown().await {
                warn!(
                    agent_id = %adapter.descriptor().agent_id,
                    error = %err,
                    "Adapter shutdown failed"
                );
            }
        }
        self.adapters.write().clear();
    }
}
