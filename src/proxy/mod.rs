//! The forward proxy: listener, request routing, and the stream bridge.
//!
//! The server accepts proxy clients on a TCP listener. CONNECT requests are
//! hijacked off the raw socket before hyper sees them and answered with
//! literal wire frames; everything else is served through hyper's HTTP/1.1
//! stack. Requests whose host matches the cluster domain are routed through
//! the port-forward pipeline: host parsing, pod/service resolution, SPDY
//! tunnel dial, and the three-stream bridge. Everything else passes through
//! to the public internet untouched.

pub mod bridge;
pub mod error;
pub mod router;
pub mod server;

pub use bridge::Bridge;
pub use error::ProxyError;
pub use router::Router;
pub use server::{ProxyConfig, ProxyServer};
