//! Configuration system for kubegate.
//!
//! Configuration is loaded from TOML files and merged in order:
//!
//! 1. Built-in defaults (compiled into the binary)
//! 2. System config: `/etc/kubegate/config.toml`
//! 3. User config: `~/.config/kubegate/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Missing files are skipped; invalid TOML fails fast. Scalars are
//! overridden by later sources.
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [proxy]
//! listen = "127.0.0.1:3128"
//!
//! [cluster]
//! domain = "cluster.local"
//! kubeconfig = "/home/user/.kube/config"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{ClusterConfig, Config, GeneralConfig, ListenerConfig};
