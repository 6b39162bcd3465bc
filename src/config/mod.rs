mod settings;

pub use settings::{
    AdapterDefaults, ConvergenceConfig, OrchestratorConfig, SignalWeights, TabConfig,
};
