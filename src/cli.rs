//! Command-line interface definitions for kubegate.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// An HTTP proxy for accessing Kubernetes resources.
///
/// kubegate lets you reach pods and services as if you were inside the
/// cluster: point your HTTP proxy at it and request
/// `<name>.<namespace>.<kind>.<cluster-domain>[:<port>]` hosts directly.
#[derive(Parser, Debug)]
#[command(name = "kubegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    ///
    /// Overrides the `proxy.listen` config value (default 127.0.0.1:3128).
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Kubernetes configuration file.
    ///
    /// Overrides the `cluster.kubeconfig` config value. When neither is set,
    /// the standard discovery applies ($KUBECONFIG, then ~/.kube/config).
    #[arg(long = "kubeconfig", value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Cluster domain used to identify in-cluster requests.
    ///
    /// Overrides the `cluster.domain` config value (default cluster.local).
    #[arg(long = "cluster-domain", value_name = "DOMAIN")]
    pub cluster_domain: Option<String>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
