//! agent.toml configuration parser.
//!
//! The agent config carries everything a controller node needs to join
//! the clustered database: where its data lives, which ports it serves,
//! the API addresses of every controller, and the PEM trust material.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Public API port served by every controller node.
pub const DEFAULT_API_PORT: u16 = 17070;

/// Port used for database replication traffic between controller nodes.
pub const DEFAULT_CLUSTER_PORT: u16 = 17666;

/// Subdirectory of the agent data dir holding the database files.
pub const DQLITE_SUBDIR: &str = "dqlite";

/// Reserved namespace for controller-level infrastructure.
pub const CONTROLLER_NAMESPACE: &str = "controller";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,
    #[serde(default)]
    pub api_addresses: Vec<String>,
    #[serde(default)]
    pub ca_cert: String,
    pub ca_cert_file: Option<PathBuf>,
    pub bind_address: Option<IpAddr>,
    pub controller_id: Option<String>,
    pub serving: Option<ServingInfo>,
}

/// Server-serving credentials held only by cluster-capable nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingInfo {
    #[serde(default)]
    pub cert: String,
    #[serde(default, skip_serializing)]
    pub private_key: String,
    pub cert_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_cluster_port() -> u16 {
    DEFAULT_CLUSTER_PORT
}

impl AgentConfig {
    /// Read, parse and resolve an agent config from disk.
    ///
    /// Relative `*_file` paths are resolved against the config file's
    /// directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = read(path)?;
        let mut config = Self::from_toml_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_files(base)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load PEM material referenced by `*_file` fields into the inline
    /// fields. Inline values win when both are set.
    pub fn resolve_files(&mut self, base: &Path) -> Result<(), ConfigError> {
        if self.ca_cert.is_empty()
            && let Some(file) = &self.ca_cert_file
        {
            self.ca_cert = read(&base.join(file))?;
        }

        if let Some(serving) = self.serving.as_mut() {
            if serving.cert.is_empty()
                && let Some(file) = &serving.cert_file
            {
                serving.cert = read(&base.join(file))?;
            }
            if serving.private_key.is_empty()
                && let Some(file) = &serving.private_key_file
            {
                serving.private_key = read(&base.join(file))?;
            }
        }
        Ok(())
    }

    /// Reject configs the cluster layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must be set".into()));
        }
        if self.ca_cert.trim().is_empty() {
            return Err(ConfigError::Invalid("ca_cert must be set".into()));
        }
        if self.api_port == 0 || self.cluster_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".into()));
        }
        if self.api_port == self.cluster_port {
            return Err(ConfigError::Invalid(format!(
                "cluster_port {} must differ from api_port",
                self.cluster_port
            )));
        }
        if let Some(serving) = &self.serving
            && (serving.cert.trim().is_empty() || serving.private_key.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "serving requires both cert and private_key".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the clustered database files.
    pub fn dqlite_dir(&self) -> PathBuf {
        self.data_dir.join(DQLITE_SUBDIR)
    }

    /// Whether this node holds server-serving credentials.
    pub fn is_cluster_capable(&self) -> bool {
        self.serving.is_some()
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
