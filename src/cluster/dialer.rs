//! Dialing the port-forward endpoint.
//!
//! A [`PortForwardDialer`] owns everything needed to reach one pod's
//! `portforward` sub-resource: the API server address, the TLS client
//! configuration derived from the kubeconfig, and the bearer token when the
//! cluster uses token auth. `dial` performs the HTTP/1.1 POST upgrade to
//! `SPDY/3.1` and hands the upgraded byte stream to the SPDY driver.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::error::ClusterError;
use crate::spdy::SpdyConnection;
use crate::tunnel::PORT_FORWARD_PROTOCOL_V1;

/// Upgrade protocol named in the `Upgrade` header.
const SPDY_PROTOCOL: &str = "SPDY/3.1";

/// Header negotiating the port-forward sub-protocol version.
const STREAM_PROTOCOL_HEADER: &str = "X-Stream-Protocol-Version";

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Dialer for one pod's port-forward endpoint.
pub struct PortForwardDialer {
    host: String,
    port: u16,
    authority: String,
    path_and_query: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    bearer: Option<String>,
}

impl PortForwardDialer {
    /// Build a dialer from the loaded cluster configuration.
    pub fn from_config(
        config: &kube::Config,
        namespace: &str,
        pod: &str,
    ) -> Result<Self, ClusterError> {
        let uri = &config.cluster_url;
        let host = uri
            .host()
            .ok_or_else(|| ClusterError::Dial("cluster URL has no host".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() != Some("http");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let base = uri.path().trim_end_matches('/');
        let path_and_query =
            format!("{base}/api/v1/namespaces/{namespace}/pods/{pod}/portforward");

        let tls = if is_https {
            let tls_config = build_tls_config(config)?;
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| ClusterError::Tls(format!("invalid server name '{host}': {e}")))?;
            Some((TlsConnector::from(Arc::new(tls_config)), server_name))
        } else {
            None
        };

        Ok(Self {
            host,
            port,
            authority: match uri.port_u16() {
                Some(p) => format!("{}:{p}", uri.host().unwrap_or_default()),
                None => uri.host().unwrap_or_default().to_string(),
            },
            path_and_query,
            tls,
            bearer: bearer_token(&config.auth_info)?,
        })
    }

    /// Open the tunnel: connect, upgrade, and start the SPDY driver.
    pub async fn dial(&self) -> Result<SpdyConnection, ClusterError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;

        let io: Box<dyn IoStream> = match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| ClusterError::Dial(format!("TLS handshake failed: {e}")))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io))
                .await
                .map_err(|e| ClusterError::Dial(format!("HTTP handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("port-forward connection ended: {e}");
            }
        });

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(self.path_and_query.as_str())
            .header(HOST, self.authority.as_str())
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, SPDY_PROTOCOL)
            .header(STREAM_PROTOCOL_HEADER, PORT_FORWARD_PROTOCOL_V1);
        if let Some(token) = &self.bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request
            .body(Empty::new())
            .map_err(|e| ClusterError::Dial(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClusterError::Dial(format!("upgrade request failed: {e}")))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ClusterError::UpgradeRefused {
                status: response.status().as_u16(),
            });
        }
        let negotiated = response
            .headers()
            .get(STREAM_PROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok());
        if negotiated != Some(PORT_FORWARD_PROTOCOL_V1) {
            warn!(
                negotiated = negotiated.unwrap_or(""),
                "unexpected port-forward protocol version"
            );
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| ClusterError::Dial(format!("upgrade failed: {e}")))?;

        debug!(path = %self.path_and_query, "port-forward tunnel established");
        Ok(SpdyConnection::new(TokioIo::new(upgraded)))
    }
}

/// Build the rustls client configuration from the kubeconfig-derived state:
/// cluster CA as the trust anchor plus the optional client identity.
fn build_tls_config(config: &kube::Config) -> Result<ClientConfig, ClusterError> {
    let mut roots = RootCertStore::empty();
    if let Some(cert_chain) = &config.root_cert {
        for der in cert_chain {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| ClusterError::Tls(format!("invalid cluster CA: {e}")))?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match client_identity(&config.auth_info)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClusterError::Tls(format!("invalid client identity: {e}"))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Load the client certificate chain and key, from inline kubeconfig data or
/// from the referenced files.
fn client_identity(
    auth: &kube::config::AuthInfo,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, ClusterError> {
    let cert_pem = match (&auth.client_certificate_data, &auth.client_certificate) {
        (Some(data), _) => Some(
            BASE64
                .decode(data.trim())
                .map_err(|e| ClusterError::Tls(format!("invalid client certificate data: {e}")))?,
        ),
        (None, Some(path)) => Some(
            std::fs::read(path)
                .map_err(|e| ClusterError::Tls(format!("could not read {path}: {e}")))?,
        ),
        (None, None) => None,
    };
    let Some(cert_pem) = cert_pem else {
        return Ok(None);
    };

    let key_pem = match (&auth.client_key_data, &auth.client_key) {
        (Some(data), _) => BASE64
            .decode(data.expose_secret().trim())
            .map_err(|e| ClusterError::Tls(format!("invalid client key data: {e}")))?,
        (None, Some(path)) => std::fs::read(path)
            .map_err(|e| ClusterError::Tls(format!("could not read {path}: {e}")))?,
        (None, None) => {
            return Err(ClusterError::Tls(
                "client certificate configured without a key".to_string(),
            ))
        }
    };

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Tls(format!("invalid client certificate PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ClusterError::Tls(format!("invalid client key PEM: {e}")))?
        .ok_or_else(|| ClusterError::Tls("no private key found in client key PEM".to_string()))?;

    Ok(Some((certs, key)))
}

/// Extract the bearer token, inline or from a token file.
fn bearer_token(auth: &kube::config::AuthInfo) -> Result<Option<String>, ClusterError> {
    if let Some(token) = &auth.token {
        return Ok(Some(token.expose_secret().to_string()));
    }
    if let Some(path) = &auth.token_file {
        let token = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Tls(format!("could not read token file {path}: {e}")))?;
        return Ok(Some(token.trim().to_string()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialer_for(url: &str) -> PortForwardDialer {
        let mut config = kube::Config::new(url.parse().unwrap());
        config.auth_info = Default::default();
        PortForwardDialer::from_config(&config, "app", "redis-0").unwrap()
    }

    #[test]
    fn test_portforward_path() {
        let dialer = dialer_for("https://kube.example:6443/");
        assert_eq!(
            dialer.path_and_query,
            "/api/v1/namespaces/app/pods/redis-0/portforward"
        );
        assert_eq!(dialer.host, "kube.example");
        assert_eq!(dialer.port, 6443);
        assert_eq!(dialer.authority, "kube.example:6443");
    }

    #[test]
    fn test_plain_http_api_server() {
        let dialer = dialer_for("http://127.0.0.1:8001/");
        assert!(dialer.tls.is_none());
        assert_eq!(dialer.port, 8001);
    }

    #[test]
    fn test_default_https_port() {
        let dialer = dialer_for("https://kube.example/");
        assert_eq!(dialer.port, 443);
        assert_eq!(dialer.authority, "kube.example");
    }
}
