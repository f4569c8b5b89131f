//! Bridge behavior against fake multiplexers.
//!
//! These tests drive the three-stream bridge with an in-memory tunnel whose
//! kubelet side is scripted: echo the data stream, report an error on the
//! error stream, or refuse the data stream outright.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use kubegate::cluster::BackendTarget;
use kubegate::proxy::{Bridge, ProxyError};
use kubegate::tunnel::{StreamHeaders, StreamKind, Tunnel};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// What the scripted kubelet side should do with the data stream.
#[derive(Clone, Copy, PartialEq)]
enum DataBehavior {
    /// Echo every byte back until the client half-closes.
    Echo,
    /// Consume the request, answer with a canned HTTP response, close.
    HttpResponder,
    /// Refuse stream creation.
    Refuse,
}

#[derive(Default)]
struct FakeState {
    /// `(kind, port, request_id)` in creation order.
    opened: Vec<(StreamKind, String, u32)>,
    /// Set once the bridge half-closes its error stream write side.
    error_write_closed: bool,
    /// Set by `Tunnel::close`.
    closed: bool,
}

struct FakeTunnel {
    state: Arc<Mutex<FakeState>>,
    data: DataBehavior,
    /// Bytes the kubelet reports on the error stream before closing it.
    error_payload: Option<Vec<u8>>,
}

impl FakeTunnel {
    fn new(data: DataBehavior, error_payload: Option<Vec<u8>>) -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                state: state.clone(),
                data,
                error_payload,
            },
            state,
        )
    }
}

impl Tunnel for FakeTunnel {
    type Stream = DuplexStream;

    async fn create_stream(&self, headers: StreamHeaders) -> io::Result<DuplexStream> {
        self.state.lock().unwrap().opened.push((
            headers.kind,
            headers.port.clone(),
            headers.request_id,
        ));

        match headers.kind {
            StreamKind::Error => {
                let (local, remote) = tokio::io::duplex(1024);
                let state = self.state.clone();
                let payload = self.error_payload.clone();
                tokio::spawn(async move {
                    let (mut read, mut write) = tokio::io::split(remote);
                    // The bridge never writes here; EOF means its write side
                    // is closed.
                    let mut sink = Vec::new();
                    let _ = read.read_to_end(&mut sink).await;
                    state.lock().unwrap().error_write_closed = true;
                    if let Some(payload) = payload {
                        let _ = write.write_all(&payload).await;
                    }
                    // Dropping the halves closes the stream from the kubelet
                    // side, the collector's end-of-stream.
                });
                Ok(local)
            }
            StreamKind::Data => match self.data {
                DataBehavior::Refuse => Err(io::Error::other("data stream refused")),
                DataBehavior::Echo => {
                    let (local, remote) = tokio::io::duplex(64 * 1024);
                    tokio::spawn(async move {
                        let (mut read, mut write) = tokio::io::split(remote);
                        let _ = tokio::io::copy(&mut read, &mut write).await;
                        let _ = write.shutdown().await;
                    });
                    Ok(local)
                }
                DataBehavior::HttpResponder => {
                    let (local, remote) = tokio::io::duplex(64 * 1024);
                    tokio::spawn(async move {
                        let (mut read, mut write) = tokio::io::split(remote);
                        let mut request = Vec::new();
                        let _ = read.read_to_end(&mut request).await;
                        assert!(request.starts_with(b"GET /info HTTP/1.1\r\n"));
                        let _ = write
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                            .await;
                        let _ = write.shutdown().await;
                    });
                    Ok(local)
                }
            },
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

fn target() -> BackendTarget {
    BackendTarget {
        name: "redis-0".to_string(),
        namespace: "app".to_string(),
        port: "6379".to_string(),
    }
}

fn request_parts(uri: &str) -> http::request::Parts {
    let (parts, _) = http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(())
        .unwrap()
        .into_parts();
    parts
}

#[tokio::test]
async fn raw_bridge_echoes_one_mebibyte_both_ways() {
    let (tunnel, state) = FakeTunnel::new(DataBehavior::Echo, None);
    let bridge = Bridge::new();
    let (client_io, test_end) = tokio::io::duplex(64 * 1024);

    let mut payload = vec![0u8; 1024 * 1024];
    StdRng::seed_from_u64(7).fill_bytes(&mut payload);

    let session = tokio::spawn({
        let target = target();
        async move { bridge.bridge_raw(client_io, &target, tunnel).await }
    });

    let (mut read_end, mut write_end) = tokio::io::split(test_end);
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        write_end.write_all(&sent).await.unwrap();
        write_end.shutdown().await.unwrap();
    });

    let mut echoed = vec![0u8; payload.len()];
    read_end.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload, "echoed payload must match");

    writer.await.unwrap();
    session.await.unwrap().expect("clean echo session");

    let state = state.lock().unwrap();
    assert_eq!(state.opened.len(), 2, "exactly two streams per session");
    assert_eq!(state.opened[0].0, StreamKind::Error, "error stream first");
    assert_eq!(state.opened[1].0, StreamKind::Data);
    assert_eq!(state.opened[0].2, state.opened[1].2, "shared request id");
    assert_eq!(state.opened[0].1, "6379");
}

#[tokio::test]
async fn raw_bridge_surfaces_kubelet_error_and_closes_tunnel() {
    let (tunnel, state) = FakeTunnel::new(DataBehavior::Echo, Some(b"x".to_vec()));
    let bridge = Bridge::new();
    let (client_io, test_end) = tokio::io::duplex(1024);

    // Client immediately hangs up; the session ends via remote-done and the
    // error verdict decides the outcome.
    drop(test_end);

    let err = bridge
        .bridge_raw(client_io, &target(), tunnel)
        .await
        .expect_err("kubelet error must surface");
    match err {
        ProxyError::Kubelet(message) => {
            assert!(message.contains("app/redis-0"), "message: {message}")
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert!(state.lock().unwrap().closed, "tunnel must be closed");
}

#[tokio::test]
async fn http_bridge_fails_fast_when_data_stream_refused() {
    let (tunnel, state) = FakeTunnel::new(DataBehavior::Refuse, None);
    let bridge = Bridge::new();
    let parts = request_parts("http://redis.app.svc.cluster.local:6379/info");

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        bridge.bridge_http(&parts, Empty::<Bytes>::new(), &target(), tunnel),
    )
    .await
    .expect("must not hang")
    .expect_err("refused data stream must error");
    assert!(matches!(err, ProxyError::DataStream { .. }), "got: {err}");

    // The error stream's write half was closed before the data stream was
    // attempted.
    for _ in 0..50 {
        if state.lock().unwrap().error_write_closed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let state = state.lock().unwrap();
    assert!(state.error_write_closed, "error stream must be write-closed");
    assert_eq!(state.opened[0].0, StreamKind::Error);
    assert!(state.closed, "tunnel closed on session failure");
}

#[tokio::test]
async fn http_bridge_returns_parsed_response() {
    let (tunnel, state) = FakeTunnel::new(DataBehavior::HttpResponder, None);
    let bridge = Bridge::new();
    let parts = request_parts("http://redis.app.svc.cluster.local:6379/info");

    let response = bridge
        .bridge_http(
            &parts,
            Full::new(Bytes::from_static(b"")),
            &target(),
            tunnel,
        )
        .await
        .expect("session must succeed")
        .expect("response must parse");

    assert_eq!(response.status(), http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello");

    let state = state.lock().unwrap();
    assert_eq!(state.opened[0].0, StreamKind::Error);
    assert_eq!(state.opened[1].0, StreamKind::Data);
    assert_eq!(state.opened[0].2, state.opened[1].2);
}

#[tokio::test]
async fn concurrent_sessions_get_distinct_request_ids() {
    let bridge = Arc::new(Bridge::new());
    let (tunnel_a, state_a) = FakeTunnel::new(DataBehavior::Echo, None);
    let (tunnel_b, state_b) = FakeTunnel::new(DataBehavior::Echo, None);

    let (client_a, end_a) = tokio::io::duplex(1024);
    let (client_b, end_b) = tokio::io::duplex(1024);
    drop(end_a);
    drop(end_b);

    let bridge_a = bridge.clone();
    let a = tokio::spawn(async move { bridge_a.bridge_raw(client_a, &target(), tunnel_a).await });
    let bridge_b = bridge.clone();
    let b = tokio::spawn(async move { bridge_b.bridge_raw(client_b, &target(), tunnel_b).await });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let id_a = state_a.lock().unwrap().opened[0].2;
    let id_b = state_b.lock().unwrap().opened[0].2;
    assert_ne!(id_a, id_b, "request ids must differ across sessions");
}
