//! Host string parsing and classification.
//!
//! Intercepted hosts follow the in-cluster DNS grammar
//! `<name>.<namespace>.<kind>.<cluster-domain>[:<port>]`, where `<kind>` is
//! `svc`, `pod`, or another resource shorthand and `<port>` is either a
//! decimal integer or a symbolic port name. Anything that does not end in the
//! cluster domain is classified as an external host and left alone by the
//! proxy.

use thiserror::Error;

/// Errors produced while parsing a host string.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host string was empty.
    #[error("host is empty")]
    Empty,

    /// The host did not split into host and port.
    #[error("malformed host '{0}'")]
    Malformed(String),
}

/// A classified host, either in-cluster or external.
///
/// For external hosts only `domain` and `port` are meaningful; the
/// cluster-specific fields are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHost {
    /// Resource name (may itself contain dots).
    pub name: String,
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Resource kind label, e.g. `svc` or `pod`.
    pub kind: String,
    /// The cluster domain for cluster hosts, the full host otherwise.
    pub domain: String,
    /// Port, numeric or symbolic; never empty after parsing.
    pub port: String,
    /// Whether the host resolves inside the cluster.
    pub is_cluster_host: bool,
}

/// Parses host strings against a configured cluster domain.
#[derive(Debug, Clone)]
pub struct HostParser {
    cluster_domain: String,
}

impl HostParser {
    /// Create a parser for the given cluster domain (e.g. `cluster.local`).
    pub fn new(cluster_domain: impl Into<String>) -> Self {
        Self {
            cluster_domain: cluster_domain.into(),
        }
    }

    /// The cluster domain this parser matches against.
    pub fn cluster_domain(&self) -> &str {
        &self.cluster_domain
    }

    /// Parse a host string, defaulting the port by scheme when absent.
    ///
    /// The port suffix is split on the rightmost colon and may be numeric or a
    /// symbolic name (letters, digits, `-`). A missing port defaults to `443`
    /// when `is_tls` is set and `80` otherwise.
    pub fn parse(&self, h: &str, is_tls: bool) -> Result<ParsedHost, HostError> {
        if h.is_empty() {
            return Err(HostError::Empty);
        }

        let (host, port) = split_host_port(h)?;
        let port = match port {
            Some(p) => p.to_string(),
            None if is_tls => "443".to_string(),
            None => "80".to_string(),
        };

        let suffix = format!(".{}", self.cluster_domain);
        let Some(rest) = host.strip_suffix(&suffix) else {
            return Ok(ParsedHost {
                name: String::new(),
                namespace: String::new(),
                kind: String::new(),
                domain: host.to_string(),
                port,
                is_cluster_host: false,
            });
        };

        // Peel the kind and namespace off the right; whatever is left is the
        // name, dots and all.
        let (rest, kind) = split_last_label(rest);
        let (name, namespace) = split_last_label(rest);

        Ok(ParsedHost {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            domain: self.cluster_domain.clone(),
            port,
            is_cluster_host: true,
        })
    }
}

/// Split `h` into host and optional port on the rightmost colon.
///
/// A colon with an empty remainder (`"host:"`) is malformed; a host without
/// any colon has no port.
fn split_host_port(h: &str) -> Result<(&str, Option<&str>), HostError> {
    match h.rsplit_once(':') {
        None => Ok((h, None)),
        Some((host, port)) => {
            if host.is_empty() || port.is_empty() || port.contains(':') {
                return Err(HostError::Malformed(h.to_string()));
            }
            let symbolic = port
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !symbolic {
                return Err(HostError::Malformed(h.to_string()));
            }
            Ok((host, Some(port)))
        }
    }
}

/// Split off the last dot-separated label, returning `(rest, label)`.
fn split_last_label(s: &str) -> (&str, &str) {
    match s.rfind('.') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => ("", s),
    }
}
