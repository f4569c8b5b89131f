//! Configuration schema definitions.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Default log level.
fn default_log_level() -> String {
    "info".to_string()
}

/// Default proxy listen address.
fn default_listen() -> String {
    "127.0.0.1:3128".to_string()
}

/// Default cluster domain.
fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Proxy listener settings.
    #[serde(default)]
    pub proxy: ListenerConfig,

    /// Cluster access settings.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Config {
    /// Merge another config into this one. Scalars are overridden when the
    /// other value differs from the default.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.cluster.merge(other.cluster);
    }

    /// The listen address parsed as a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.proxy
            .listen
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                field: "proxy.listen".to_string(),
                message: format!("'{}': {e}", self.proxy.listen),
            })
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if other.log_level != default_log_level() {
            self.log_level = other.log_level;
        }
    }
}

/// Proxy listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ListenerConfig {
    fn merge(&mut self, other: ListenerConfig) {
        if other.listen != default_listen() {
            self.listen = other.listen;
        }
    }
}

/// Cluster access configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// DNS suffix identifying in-cluster hosts.
    #[serde(default = "default_cluster_domain")]
    pub domain: String,

    /// Path to the kubeconfig file. Standard discovery applies when unset.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: default_cluster_domain(),
            kubeconfig: None,
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: ClusterConfig) {
        if other.domain != default_cluster_domain() {
            self.domain = other.domain;
        }
        if other.kubeconfig.is_some() {
            self.kubeconfig = other.kubeconfig;
        }
    }
}
