//! Pod and service resolution against the cluster API.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use rand::Rng;
use tracing::debug;

use super::dialer::PortForwardDialer;
use super::error::ClusterError;

/// A concrete backend instance selected for one request.
///
/// The port is the pod-side port, numeric or symbolic; symbolic container
/// port names are resolved by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Target port on the pod.
    pub port: String,
}

impl std::fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} -> {}", self.namespace, self.name, self.port)
    }
}

/// Client for the Kubernetes API, shared read-only across sessions.
pub struct ClusterClient {
    client: Client,
    config: Config,
}

impl ClusterClient {
    /// Build a client from a kubeconfig file.
    ///
    /// When `kubeconfig` is `None` the standard discovery applies
    /// (`$KUBECONFIG`, then `~/.kube/config`).
    pub async fn new(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let kubeconfig = match kubeconfig {
            Some(path) => Kubeconfig::read_from(path)
                .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?,
            None => Kubeconfig::read().map_err(|e| ClusterError::Kubeconfig(e.to_string()))?,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config.clone()).map_err(ClusterError::ClientSetup)?;
        Ok(Self { client, config })
    }

    /// Resolve a pod host directly.
    ///
    /// The port is passed through unchanged; symbolic container-port names
    /// are resolved by the kubelet.
    pub async fn resolve_pod(
        &self,
        namespace: &str,
        name: &str,
        port: &str,
    ) -> Result<BackendTarget, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(name).await.map_err(|e| ClusterError::PodLookup {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source: e,
        })?;

        Ok(BackendTarget {
            namespace: pod.metadata.namespace.unwrap_or_else(|| namespace.to_string()),
            name: pod.metadata.name.unwrap_or_else(|| name.to_string()),
            port: port.to_string(),
        })
    }

    /// Resolve a service host to one of its backing pods, picked uniformly
    /// at random from the caller-supplied randomness source.
    ///
    /// The RNG is injected so selection stays deterministic under test; the
    /// router seeds a fresh one per request.
    pub async fn resolve_service<R: Rng>(
        &self,
        namespace: &str,
        name: &str,
        port: &str,
        rng: &mut R,
    ) -> Result<BackendTarget, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services
            .get(name)
            .await
            .map_err(|e| ClusterError::ServiceLookup {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: e,
            })?;

        let spec = service.spec.unwrap_or_default();
        let target_port = resolve_target_port(spec.ports.as_deref().unwrap_or(&[]), port)
            .ok_or_else(|| ClusterError::NoMatchingPort {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port: port.to_string(),
            })?;

        let selector = selector_string(spec.selector.as_ref().unwrap_or(&BTreeMap::new()));
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let matching = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(ClusterError::PodList)?;
        if matching.items.is_empty() {
            return Err(ClusterError::NoPodsFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let idx = rng.random_range(0..matching.items.len());
        let pod = &matching.items[idx];
        debug!(
            service = name,
            pod = pod.metadata.name.as_deref().unwrap_or(""),
            candidates = matching.items.len(),
            "selected backend pod"
        );

        Ok(BackendTarget {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
            port: target_port,
        })
    }

    /// Construct a dialer for the pod's `portforward` sub-resource.
    pub fn dialer(&self, target: &BackendTarget) -> Result<PortForwardDialer, ClusterError> {
        PortForwardDialer::from_config(&self.config, &target.namespace, &target.name)
    }
}

/// Find the target port for a requested service port.
///
/// The first service port whose numeric port or name equals the request wins,
/// in the service's declared order. A missing `target_port` falls back to the
/// port number, matching the API server's defaulting.
fn resolve_target_port(ports: &[ServicePort], requested: &str) -> Option<String> {
    for p in ports {
        let matches_number = p.port.to_string() == requested;
        let matches_name = p.name.as_deref() == Some(requested);
        if matches_number || matches_name {
            return Some(match &p.target_port {
                Some(IntOrString::Int(i)) => i.to_string(),
                Some(IntOrString::String(s)) => s.clone(),
                None => p.port.to_string(),
            });
        }
    }
    None
}

/// Join a selector map as `k1=v1,k2=v2`.
///
/// An empty map yields an empty selector, which the API treats as matching
/// all pods in the namespace.
fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn port(name: Option<&str>, number: i32, target: Option<IntOrString>) -> ServicePort {
        ServicePort {
            name: name.map(str::to_string),
            port: number,
            target_port: target,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_port_by_number() {
        let ports = [port(Some("web"), 8080, Some(IntOrString::Int(80)))];
        assert_eq!(resolve_target_port(&ports, "8080"), Some("80".to_string()));
    }

    #[test]
    fn test_target_port_by_name() {
        let ports = [port(
            Some("tcp-redis"),
            6379,
            Some(IntOrString::String("redis".to_string())),
        )];
        assert_eq!(
            resolve_target_port(&ports, "tcp-redis"),
            Some("redis".to_string())
        );
    }

    #[test]
    fn test_target_port_first_match_wins() {
        let ports = [
            port(Some("a"), 8080, Some(IntOrString::Int(1000))),
            port(Some("8080"), 9090, Some(IntOrString::Int(2000))),
        ];
        assert_eq!(resolve_target_port(&ports, "8080"), Some("1000".to_string()));
    }

    #[test]
    fn test_target_port_defaults_to_port_number() {
        let ports = [port(None, 5432, None)];
        assert_eq!(resolve_target_port(&ports, "5432"), Some("5432".to_string()));
    }

    #[test]
    fn test_target_port_no_match() {
        let ports = [port(Some("web"), 8080, Some(IntOrString::Int(80)))];
        assert_eq!(resolve_target_port(&ports, "9999"), None);
    }

    #[test]
    fn test_selector_string() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "redis".to_string());
        selector.insert("tier".to_string(), "cache".to_string());
        assert_eq!(selector_string(&selector), "app=redis,tier=cache");
    }

    #[test]
    fn test_selector_string_empty() {
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }

    const SERVICE_JSON: &str = r#"{
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "redis", "namespace": "app"},
        "spec": {
            "selector": {"app": "redis"},
            "ports": [{"port": 6379, "targetPort": 6379}]
        }
    }"#;

    const POD_LIST_JSON: &str = r#"{
        "apiVersion": "v1",
        "kind": "PodList",
        "metadata": {},
        "items": [
            {"metadata": {"name": "redis-0", "namespace": "app"}},
            {"metadata": {"name": "redis-1", "namespace": "app"}}
        ]
    }"#;

    /// A ClusterClient backed by a canned API: one service with two pods.
    fn mock_cluster_client() -> ClusterClient {
        let service = tower::service_fn(|req: http::Request<kube::client::Body>| async move {
            let path = req.uri().path().to_string();
            let body = if path.ends_with("/services/redis") {
                SERVICE_JSON
            } else if path.ends_with("/pods") {
                POD_LIST_JSON
            } else {
                panic!("unexpected API path: {path}");
            };
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(kube::client::Body::from(body.as_bytes().to_vec()))
                    .unwrap(),
            )
        });

        ClusterClient {
            client: Client::new(service, "app"),
            config: Config::new("http://127.0.0.1:8080/".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_resolve_service_picks_random_pod() {
        let client = mock_cluster_client();
        let mut rng = StdRng::seed_from_u64(42);

        let target = client
            .resolve_service("app", "redis", "6379", &mut rng)
            .await
            .unwrap();
        assert_eq!(target.namespace, "app");
        assert_eq!(target.port, "6379");
        assert!(target.name == "redis-0" || target.name == "redis-1");
    }

    #[tokio::test]
    async fn test_resolve_service_selection_is_uniform() {
        // Two backing pods, 1000 resolutions with a deterministically seeded
        // RNG: each pod must land within 5% of half.
        let client = mock_cluster_client();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 2];
        let n = 1000;
        for _ in 0..n {
            let target = client
                .resolve_service("app", "redis", "6379", &mut rng)
                .await
                .unwrap();
            match target.name.as_str() {
                "redis-0" => counts[0] += 1,
                "redis-1" => counts[1] += 1,
                other => panic!("unexpected pod: {other}"),
            }
        }
        let tolerance = n / 20;
        let expected = n / 2;
        for count in counts {
            assert!(
                (count as i64 - expected as i64).unsigned_abs() <= tolerance as u64,
                "selection skewed: {counts:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_service_unknown_port() {
        let client = mock_cluster_client();
        let mut rng = StdRng::seed_from_u64(1);

        let err = client
            .resolve_service("app", "redis", "9999", &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoMatchingPort { .. }));
    }
}
