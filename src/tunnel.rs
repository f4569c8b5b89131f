//! The tunnel seam between the stream bridge and the multiplexer.
//!
//! A [`Tunnel`] is a handle to one multiplexed connection to a pod's kubelet.
//! It can open any number of logical byte streams, each identified by a small
//! header set (`Streamtype`, `Port`, `Requestid`), and must be closed when the
//! bridging session is over. The production implementation is
//! [`crate::spdy::SpdyConnection`]; tests drive the bridge with fakes.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

/// Sub-protocol negotiated during the port-forward upgrade handshake.
pub const PORT_FORWARD_PROTOCOL_V1: &str = "portforward.k8s.io";

/// Stream header naming the stream's role. The capitalization is what the Go
/// HTTP header map puts on the wire; the kubelet matches case-insensitively.
pub const HEADER_STREAM_TYPE: &str = "Streamtype";

/// Stream header carrying the target port on the pod.
pub const HEADER_PORT: &str = "Port";

/// Stream header pairing the error and data streams of one session.
pub const HEADER_REQUEST_ID: &str = "Requestid";

/// Value of [`HEADER_STREAM_TYPE`] for the error side-channel.
pub const STREAM_TYPE_ERROR: &str = "error";

/// Value of [`HEADER_STREAM_TYPE`] for the payload stream.
pub const STREAM_TYPE_DATA: &str = "data";

/// Role of a logical stream within a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Side-channel for kubelet-reported forwarding errors.
    Error,
    /// Payload bytes in both directions.
    Data,
}

impl StreamKind {
    /// Wire value for the `Streamtype` header.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Error => STREAM_TYPE_ERROR,
            StreamKind::Data => STREAM_TYPE_DATA,
        }
    }
}

/// Header set identifying one logical stream.
#[derive(Debug, Clone)]
pub struct StreamHeaders {
    /// Role of the stream.
    pub kind: StreamKind,
    /// Target port on the pod, numeric or symbolic.
    pub port: String,
    /// Session request id; the same id must be used for the error and data
    /// streams of one session.
    pub request_id: u32,
}

impl StreamHeaders {
    /// Headers for the error stream of a session.
    pub fn error(port: &str, request_id: u32) -> Self {
        Self {
            kind: StreamKind::Error,
            port: port.to_string(),
            request_id,
        }
    }

    /// Headers for the data stream of a session.
    pub fn data(port: &str, request_id: u32) -> Self {
        Self {
            kind: StreamKind::Data,
            port: port.to_string(),
            request_id,
        }
    }

    /// Render to wire name/value pairs.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        vec![
            (HEADER_STREAM_TYPE.to_string(), self.kind.as_str().to_string()),
            (HEADER_PORT.to_string(), self.port.clone()),
            (HEADER_REQUEST_ID.to_string(), self.request_id.to_string()),
        ]
    }
}

/// A multiplexed stream connection to one backend instance.
///
/// Implementations must allow concurrent `create_stream` calls and must fail
/// stream creation (rather than block forever) once the tunnel is closed.
pub trait Tunnel: Send + Sync + 'static {
    /// The logical stream type; half-closes its write side on `shutdown`.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a new logical stream tagged with `headers`.
    fn create_stream(
        &self,
        headers: StreamHeaders,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Tear the whole tunnel down. No new streams can be opened afterwards;
    /// existing streams observe an error or end-of-stream.
    fn close(&self);
}
