//! Error types for proxy operations.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::host::HostError;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, stream copies).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The intercepted host could not be parsed.
    #[error("could not parse host: {0}")]
    Host(#[from] HostError),

    /// Resolution or dialing against the cluster API failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The request is missing pieces the proxy needs (host, authority).
    #[error("invalid proxy request: {0}")]
    InvalidRequest(String),

    /// Opening the error stream failed.
    #[error("error creating error stream for pod {target}: {source}")]
    ErrorStream {
        /// Backend the session was for.
        target: String,
        /// Underlying stream-creation failure.
        #[source]
        source: std::io::Error,
    },

    /// Opening the data stream failed.
    #[error("error creating forwarding stream for pod {target}: {source}")]
    DataStream {
        /// Backend the session was for.
        target: String,
        /// Underlying stream-creation failure.
        #[source]
        source: std::io::Error,
    },

    /// The kubelet reported a forwarding error on the error stream.
    #[error("{0}")]
    Kubelet(String),

    /// The local-to-remote copy failed.
    #[error("error copying from local connection to remote stream: {0}")]
    LocalCopy(String),

    /// Failed to reach an upstream (passthrough path).
    #[error("failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubelet_error_display() {
        let err = ProxyError::Kubelet("an error occurred forwarding to pod app/redis-0".into());
        assert!(err.to_string().contains("forwarding to pod"));
    }

    #[test]
    fn test_stream_error_display() {
        let err = ProxyError::DataStream {
            target: "app/redis-0 -> 6379".to_string(),
            source: std::io::Error::other("refused"),
        };
        assert!(err.to_string().contains("app/redis-0"));
        assert!(err.to_string().contains("forwarding stream"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }
}
