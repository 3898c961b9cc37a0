//! Service configuration storage
//!
//! Stored as `flow-service.json` in the host's data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{FlowServiceError, Result};

const CONFIG_FILE: &str = "flow-service.json";

/// Default ceiling on node executions per turn
pub const DEFAULT_MAX_STEPS: u32 = 50;

/// Configuration for a [`FlowService`](crate::FlowService)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Maximum number of nodes a single turn may execute after Start
    pub max_steps: u32,
    /// Directory for persisted flow documents; in-memory only when absent
    pub storage_dir: Option<PathBuf>,
    /// Whether connectivity results are memoized per flow
    pub cache_traversal: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            storage_dir: None,
            cache_traversal: true,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `dir`. Missing file yields the defaults.
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path).await?;
        let config: Self = serde_json::from_str(&contents).map_err(FlowServiceError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to the defaults on any error
    pub async fn load_or_default(dir: &Path) -> Self {
        match Self::load(dir).await {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Using default flow service configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to `dir`
    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await?;

        let config_path = dir.join(CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self).map_err(FlowServiceError::Serialize)?;
        fs::write(&config_path, contents).await?;

        log::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(FlowServiceError::Config("maxSteps must be at least 1".into()));
        }
        Ok(())
    }
}
