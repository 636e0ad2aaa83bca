//! Engine configuration.
//!
//! Configuration is plain data. It can be built in code, starting from
//! [`EngineConfig::default`], or parsed from JSON:
//!
//! ```rust
//! use trellis_core::{EngineConfig, SafetyNet};
//!
//! let config = EngineConfig::from_json(r#"{ "safety_net": "tokio" }"#).unwrap();
//! assert_eq!(config.safety_net, SafetyNet::Tokio);
//! assert_eq!(config.max_rerun_depth, EngineConfig::default().max_rerun_depth);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// How a batch that was opened but never closed gets flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyNet {
    /// The host calls [`Engine::tick`](crate::Engine::tick) once per turn of
    /// its event loop.
    #[default]
    Manual,
    /// Opening a batch spawns a local tokio task that yields once and then
    /// ticks the engine. Requires a running `tokio::task::LocalSet`; outside
    /// a tokio runtime the engine falls back to manual ticks.
    /// [`Engine::try_with_config`](crate::Engine::try_with_config) rejects
    /// this mode up front when no runtime is present.
    Tokio,
}

/// Settings for one [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub safety_net: SafetyNet,

    /// How many times in a row an effect may be re-triggered by its own run
    /// before the loop is cut.
    pub max_rerun_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safety_net: SafetyNet::Manual,
            max_rerun_depth: 100,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn with_safety_net(mut self, safety_net: SafetyNet) -> Self {
        self.safety_net = safety_net;
        self
    }

    pub fn with_max_rerun_depth(mut self, depth: usize) -> Self {
        self.max_rerun_depth = depth;
        self
    }
}
