//! Engine configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//! - `WADDLE_PUBSUB_DATABASE` - path of the libSQL database
//! - `WADDLE_PUBSUB_REGISTER_NODES` - comma separated node names created on
//!   registration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::node::DEFAULT_NODE_TYPE;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// PubSub engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// libSQL database file (`:memory:` for a transient store)
    pub database_path: Option<PathBuf>,
    /// Nodes created under `/user/<id>/` by `register/register`
    pub register_nodes: Vec<String>,
    /// Payload type written into default node configurations
    pub node_type: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            register_nodes: [
                "channel",
                "mood",
                "subscriptions",
                "geo/current",
                "geo/future",
                "geo/previous",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            node_type: DEFAULT_NODE_TYPE.to_string(),
        }
    }
}

impl PubSubConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(
            std::env::var("WADDLE_PUBSUB_DATABASE").ok(),
            std::env::var("WADDLE_PUBSUB_REGISTER_NODES").ok(),
        )
    }

    fn apply_overrides(mut self, database: Option<String>, register_nodes: Option<String>) -> Self {
        if let Some(database) = database.filter(|d| !d.is_empty()) {
            self.database_path = Some(PathBuf::from(database));
        }
        if let Some(nodes) = register_nodes {
            self.register_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }
        self
    }
}
