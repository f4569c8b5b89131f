//! kubegate: transparent access to in-cluster workloads
//!
//! This crate implements an HTTP/HTTPS forward proxy that intercepts hosts of
//! the form `<name>.<namespace>.<kind>.<cluster-domain>[:<port>]` (for example
//! `redis-master.app.svc.cluster.local:6379`), resolves them to a concrete pod
//! through the Kubernetes API, and bridges the client's bytes over the
//! cluster's port-forward sub-protocol. Hosts outside the cluster domain pass
//! through untouched.
//!
//! # Architecture
//!
//! - **Host parsing**: classify intercepted host strings ([`host`])
//! - **Cluster client**: pod/service resolution and tunnel dialing ([`cluster`])
//! - **Stream multiplexer**: the SPDY/3.1 subset spoken by the port-forward
//!   endpoint ([`spdy`])
//! - **Proxy**: listener, request routing, and the port-forward stream bridge
//!   ([`proxy`])
//! - **Config**: hierarchical TOML configuration with CLI overrides ([`config`])

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod host;
pub mod proxy;
pub mod spdy;
pub mod tunnel;
