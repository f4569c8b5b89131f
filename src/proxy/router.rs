//! Request routing: cluster interception and passthrough.
//!
//! Every request entering the proxy is classified by its host. Hosts matching
//! `^.*\.<cluster-domain>(:\d*)?$` are intercepted and bridged over a
//! port-forward tunnel; anything else is forwarded to the public internet
//! unmodified (plain HTTP via an upstream client, CONNECT via a blind TCP
//! tunnel — no TLS termination anywhere).
//!
//! Plain HTTP requests arrive through hyper; any pipeline failure becomes a
//! synthetic `502 Bad Gateway`. CONNECT requests never reach hyper: the
//! server hands [`Router::handle_connect`] the raw client socket after
//! consuming the CONNECT head, and the router answers on the wire directly —
//! `HTTP/1.1 200 Connection Established` followed by the bridge, or the
//! literal failure frame `HTTP/1.1 500 Cannot reach destination\r\n\r\n`
//! followed by socket close.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::bridge::{Bridge, ProxyBody};
use super::error::ProxyError;
use crate::cluster::{BackendTarget, ClusterClient};
use crate::host::HostParser;
use crate::spdy::SpdyConnection;

/// Synthetic CONNECT failure frame: these literal bytes, then socket close.
pub const CONNECT_FAILURE_FRAME: &[u8] = b"HTTP/1.1 500 Cannot reach destination\r\n\r\n";

/// Answer to a CONNECT once the tunnel is up.
pub const CONNECT_ESTABLISHED_FRAME: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Routes intercepted requests into the port-forward pipeline.
pub struct Router {
    cluster: Arc<ClusterClient>,
    parser: HostParser,
    pattern: Regex,
    bridge: Bridge,
}

impl Router {
    /// Create a router intercepting hosts under the given cluster domain.
    pub fn new(cluster: Arc<ClusterClient>, cluster_domain: &str) -> Self {
        let escaped = regex::escape(cluster_domain);
        let pattern = Regex::new(&format!(r"^.*\.{escaped}(:\d*)?$"))
            .expect("cluster domain pattern is statically valid");
        Self {
            cluster,
            parser: HostParser::new(cluster_domain),
            pattern,
            bridge: Bridge::new(),
        }
    }

    /// Whether a host falls under the cluster domain.
    pub fn matches(&self, host: &str) -> bool {
        self.pattern.is_match(host)
    }

    /// Entry point for requests served through hyper (everything but the
    /// hijacked CONNECT).
    pub async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if req.method() == Method::CONNECT {
            // CONNECT is hijacked off the first request line before hyper;
            // one arriving mid-connection is a pipelining client we don't
            // support. Refuse and end the connection.
            info!("refusing CONNECT on an already-established proxy connection");
            return Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("Connection", "close")
                .body(empty_body())
                .unwrap());
        }
        self.handle_http(req).await
    }

    /// Plain HTTP request, intercepted or passed through.
    async fn handle_http(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let host = match request_host(&req) {
            Ok(host) => host,
            Err(e) => {
                info!("could not determine request host: {e}");
                return Ok(bad_gateway(&e.to_string()));
            }
        };
        if !self.matches(&host) {
            return self.passthrough_http(req).await;
        }

        let is_tls = req.uri().scheme_str() == Some("https");
        match self.bridge_http_request(&host, is_tls, req).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Ok(bad_gateway("upstream response could not be parsed")),
            Err(e) => {
                match &e {
                    ProxyError::Host(_) | ProxyError::Cluster(_) => {
                        info!("could not get pod: {e}")
                    }
                    other => warn!("could not bridge request for {host}: {other}"),
                }
                Ok(bad_gateway(&e.to_string()))
            }
        }
    }

    /// Resolve, dial, and bridge one plain HTTP request.
    async fn bridge_http_request(
        &self,
        host: &str,
        is_tls: bool,
        req: Request<Incoming>,
    ) -> Result<Option<Response<ProxyBody>>, ProxyError> {
        let target = self.resolve(host, is_tls).await?;
        let tunnel = self.dial(&target).await?;
        let (parts, body) = req.into_parts();
        self.bridge.bridge_http(&parts, body, &target, tunnel).await
    }

    /// Hijacked CONNECT: the server has consumed the CONNECT head and hands
    /// over the raw client socket together with the request target.
    ///
    /// The router owns the wire from here. Resolution and dialing happen
    /// before anything is written back, so a pre-bridge failure is answered
    /// with the literal failure frame and the socket is closed.
    pub async fn handle_connect<C>(&self, client: C, target: &str)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.matches(target) {
            return self.passthrough_connect(client, target).await;
        }

        let session = async {
            let backend = self.resolve(target, true).await?;
            let tunnel = self.dial(&backend).await?;
            Ok::<_, ProxyError>((backend, tunnel))
        }
        .await;

        let (backend, tunnel) = match session {
            Ok(session) => session,
            Err(e) => {
                match &e {
                    ProxyError::Host(_) | ProxyError::Cluster(_) => {
                        info!("could not get pod: {e}")
                    }
                    other => warn!("could not open tunnel for {target}: {other}"),
                }
                return reject_connect(client).await;
            }
        };

        let mut client = client;
        if let Err(e) = client.write_all(CONNECT_ESTABLISHED_FRAME).await {
            warn!("could not write to client: {e}");
            return;
        }
        if let Err(e) = self.bridge.bridge_raw(client, &backend, tunnel).await {
            debug!("tunnel for {backend} ended: {e}");
        }
    }

    /// Parse the host and resolve it to a backend pod.
    async fn resolve(&self, host: &str, is_tls: bool) -> Result<BackendTarget, ProxyError> {
        let parsed = self.parser.parse(host, is_tls)?;
        if !parsed.is_cluster_host {
            return Err(ProxyError::InvalidRequest(format!(
                "host '{host}' is not under the cluster domain"
            )));
        }
        let target = if parsed.kind == "pod" {
            self.cluster
                .resolve_pod(&parsed.namespace, &parsed.name, &parsed.port)
                .await?
        } else {
            // `svc` and any other kind resolve service-style. The selection
            // RNG must be Send to cross the await points of this task.
            let mut rng = StdRng::from_os_rng();
            self.cluster
                .resolve_service(&parsed.namespace, &parsed.name, &parsed.port, &mut rng)
                .await?
        };
        debug!(%target, host, "resolved backend");
        Ok(target)
    }

    async fn dial(&self, target: &BackendTarget) -> Result<SpdyConnection, ProxyError> {
        let dialer = self.cluster.dialer(target)?;
        Ok(dialer.dial().await?)
    }

    /// Forward a plain HTTP request to its upstream unchanged.
    async fn passthrough_http(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let addr = req.uri().authority().map(|a| a.to_string());
        let client: Client<_, Incoming> = Client::builder(TokioExecutor::new()).build_http();
        match client.request(req).await {
            Ok(response) => Ok(response.map(|body| body.map_err(io::Error::other).boxed_unsync())),
            Err(e) => {
                let addr = addr.unwrap_or_else(|| "upstream".to_string());
                warn!("passthrough request to {addr} failed: {e}");
                Ok(bad_gateway(&format!("failed to reach {addr}: {e}")))
            }
        }
    }

    /// Blind TCP tunnel for CONNECT to non-cluster hosts.
    async fn passthrough_connect<C>(&self, client: C, target: &str)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let addr = match target.parse::<http::uri::Authority>() {
            Ok(authority) => format!(
                "{}:{}",
                authority.host(),
                authority.port_u16().unwrap_or(443)
            ),
            Err(e) => {
                info!("invalid CONNECT target '{target}': {e}");
                return reject_connect(client).await;
            }
        };

        // Connect upstream first to fail fast.
        let mut upstream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not reach upstream {addr}: {e}");
                return reject_connect(client).await;
            }
        };

        let mut client = client;
        if let Err(e) = client.write_all(CONNECT_ESTABLISHED_FRAME).await {
            warn!("could not write to client: {e}");
            return;
        }
        if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            debug!("passthrough tunnel to {addr} ended: {e}");
        }
    }
}

/// Write the literal failure frame and close the socket.
async fn reject_connect<C>(mut client: C)
where
    C: AsyncWrite + Unpin,
{
    if let Err(e) = client.write_all(CONNECT_FAILURE_FRAME).await {
        warn!("could not write to client: {e}");
    }
    let _ = client.shutdown().await;
}

/// Host the request targets: URI authority for proxy-form requests,
/// otherwise the `Host` header.
fn request_host(req: &Request<Incoming>) -> Result<String, ProxyError> {
    if let Some(authority) = req.uri().authority() {
        return Ok(authority.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::InvalidRequest("request has no host".to_string()))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(io::Error::other).boxed_unsync()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content)).map_err(io::Error::other).boxed_unsync()
}

/// Synthetic `502 Bad Gateway` for failed plain-HTTP interceptions.
fn bad_gateway(message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(full_body(message.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn pattern(domain: &str) -> Regex {
        let escaped = regex::escape(domain);
        Regex::new(&format!(r"^.*\.{escaped}(:\d*)?$")).unwrap()
    }

    #[test]
    fn test_cluster_pattern_matches() {
        let pattern = pattern("cluster.local");
        assert!(pattern.is_match("redis.app.svc.cluster.local"));
        assert!(pattern.is_match("redis.app.svc.cluster.local:6379"));
        assert!(pattern.is_match("a.b.c.app.pod.cluster.local:80"));
    }

    #[test]
    fn test_cluster_pattern_rejects() {
        let pattern = pattern("cluster.local");
        assert!(!pattern.is_match("example.com"));
        assert!(!pattern.is_match("redis.app.svc.clusterXlocal"));
        assert!(!pattern.is_match("cluster.local.example.com"));
    }

    #[test]
    fn test_pattern_escapes_dots() {
        // An unescaped dot would let `clusterzlocal` match.
        let pattern = pattern("cluster.local");
        assert!(!pattern.is_match("svc.ns.svc.clusterzlocal"));
    }

    #[test]
    fn test_failure_frame_is_bare_status_line() {
        assert_eq!(
            CONNECT_FAILURE_FRAME,
            b"HTTP/1.1 500 Cannot reach destination\r\n\r\n"
        );
        // No headers between the status line and the blank line.
        let text = std::str::from_utf8(CONNECT_FAILURE_FRAME).unwrap();
        assert_eq!(text.matches("\r\n").count(), 2);
    }

    #[tokio::test]
    async fn test_reject_connect_writes_frame_and_closes() {
        let (client, mut peer) = tokio::io::duplex(256);
        reject_connect(client).await;

        // read_to_end only returns once the router side is closed.
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, CONNECT_FAILURE_FRAME);
    }

    #[test]
    fn test_bad_gateway_response() {
        let response = bad_gateway("no pods found");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
