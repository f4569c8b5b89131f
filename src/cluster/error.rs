//! Error types for cluster operations.

use thiserror::Error;

/// Errors from resolution and tunnel dialing.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubeconfig could not be read or interpreted.
    #[error("could not load kubeconfig: {0}")]
    Kubeconfig(String),

    /// The Kubernetes client could not be constructed.
    #[error("could not create cluster client: {0}")]
    ClientSetup(#[source] kube::Error),

    /// A pod lookup failed.
    #[error("could not find pod {namespace}/{name}: {source}")]
    PodLookup {
        /// Namespace searched.
        namespace: String,
        /// Pod name requested.
        name: String,
        /// Underlying API error.
        #[source]
        source: kube::Error,
    },

    /// A service lookup failed.
    #[error("could not find service {namespace}/{name}: {source}")]
    ServiceLookup {
        /// Namespace searched.
        namespace: String,
        /// Service name requested.
        name: String,
        /// Underlying API error.
        #[source]
        source: kube::Error,
    },

    /// The service has no port matching the request.
    #[error("service {namespace}/{name} has no port matching '{port}'")]
    NoMatchingPort {
        /// Namespace of the service.
        namespace: String,
        /// Service name.
        name: String,
        /// Requested port, numeric or symbolic.
        port: String,
    },

    /// Listing pods by label selector failed.
    #[error("could not list pods: {0}")]
    PodList(#[source] kube::Error),

    /// The service's selector matched no pods.
    #[error("no pods found for service {namespace}/{name}")]
    NoPodsFound {
        /// Namespace of the service.
        namespace: String,
        /// Service name.
        name: String,
    },

    /// TLS client configuration could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// Connecting or upgrading to the port-forward endpoint failed.
    #[error("could not dial port-forward endpoint: {0}")]
    Dial(String),

    /// The API server refused the SPDY upgrade.
    #[error("port-forward upgrade refused (status {status})")]
    UpgradeRefused {
        /// HTTP status returned instead of 101.
        status: u16,
    },

    /// I/O failure while dialing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
