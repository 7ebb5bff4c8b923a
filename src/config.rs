use std::collections::HashMap;

use serde_json::Value;

use crate::env::PerNodeEnv;

/// Construction-time knobs for an `Environment`. Grounded on
/// `dozer-core/src/executor.rs::ExecutorOptions`: that struct bundles
/// commit/channel sizing for the executor; this one bundles the
/// equivalents that matter for an actor-per-thread DAG runtime — the
/// per-node standard-handle overrides and generic config blob actors
/// read back through fd 3 (§4.6a/§13), plus the scheduler's internal
/// event-channel capacity.
#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub for_env_pipe: HashMap<String, PerNodeEnv>,
    pub env_config: Value,
    pub channel_buffer_sz: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            for_env_pipe: HashMap::new(),
            env_config: serde_json::json!({}),
            channel_buffer_sz: 20_000,
        }
    }
}
