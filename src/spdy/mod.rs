//! Minimal SPDY/3.1 client, just enough for the port-forward endpoint.
//!
//! The Kubernetes API server upgrades the port-forward connection to the
//! SPDY/3.1 framing the kubelet's `spdystream` library speaks. There is no
//! maintained SPDY crate, so this module carries the required subset:
//! SYN_STREAM / SYN_REPLY stream setup with zlib-compressed header blocks,
//! DATA frames with half-close, RST_STREAM, PING echo, and per-stream flow
//! control windows.
//!
//! Two deliberate simplifications, safe against `spdystream` peers:
//!
//! - Incoming header blocks are skipped, never decompressed. Port-forward
//!   replies carry no header this client consumes, and skipping them avoids
//!   shipping the SPDY compression dictionary.
//! - Outgoing header blocks are compressed without a preset dictionary; zlib
//!   readers only consult a dictionary when the stream requests one.

mod connection;
mod frame;

pub use connection::{SpdyConnection, SpdyStream};

use thiserror::Error;

/// Errors from the SPDY connection layer.
#[derive(Debug, Error)]
pub enum SpdyError {
    /// Underlying transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote refused the stream with RST_STREAM.
    #[error("stream refused by remote (status {status})")]
    StreamRefused {
        /// RST_STREAM status code.
        status: u32,
    },

    /// The connection is closed; no new streams can be opened.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote violated the framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),
}
