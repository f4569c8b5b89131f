//! Configuration loading with hierarchy merging.
//!
//! Sources are merged in order: built-in defaults, the system config, the
//! user config, an optional `--config` file, then CLI flags. Missing files
//! are skipped silently; invalid TOML fails fast with the offending path.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/kubegate/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "kubegate";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader with the default search paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a loader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources, CLI flags last.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(system) = self.load_file(&self.system_path)? {
            config.merge(system);
            debug!("loaded system config from {:?}", self.system_path);
        }
        if let Some(user) = self.load_file(&self.user_path)? {
            config.merge(user);
            debug!("loaded user config from {:?}", self.user_path);
        }
        if let Some(path) = &cli.config {
            match self.load_file(path)? {
                Some(extra) => {
                    config.merge(extra);
                    debug!("loaded config from {path:?}");
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "config file not found",
                        ),
                    });
                }
            }
        }

        // CLI flags win over every file.
        if let Some(listen) = &cli.listen {
            config.proxy.listen = listen.clone();
        }
        if let Some(domain) = &cli.cluster_domain {
            config.cluster.domain = domain.clone();
        }
        if let Some(kubeconfig) = &cli.kubeconfig {
            config.cluster.kubeconfig = Some(kubeconfig.clone());
        }

        Ok(config)
    }

    /// Read and parse one file; `Ok(None)` when it does not exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["kubegate"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn test_load_with_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("missing-system.toml"),
            dir.path().join("missing-user.toml"),
        );

        let config = loader.load(&cli(&[])).unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:3128");
        assert_eq!(config.cluster.domain, "cluster.local");
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        fs::write(&system, "[cluster]\ndomain = \"system.domain\"\n").unwrap();
        fs::write(&user, "[cluster]\ndomain = \"user.domain\"\n").unwrap();

        let loader = ConfigLoader::with_paths(system, user);
        let config = loader.load(&cli(&[])).unwrap();
        assert_eq!(config.cluster.domain, "user.domain");
    }

    #[test]
    fn test_cli_flags_win() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        fs::write(&user, "[proxy]\nlisten = \"0.0.0.0:9999\"\n").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("system.toml"), user);
        let config = loader
            .load(&cli(&["--listen", "127.0.0.1:3129", "--cluster-domain", "k8s.local"]))
            .unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:3129");
        assert_eq!(config.cluster.domain, "k8s.local");
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("user.toml"),
        );

        let missing = dir.path().join("nope.toml");
        let result = loader.load(&cli(&["--config", missing.to_str().unwrap()]));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        fs::write(&user, "not valid toml [").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("system.toml"), user);
        assert!(matches!(
            loader.load(&cli(&[])),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
