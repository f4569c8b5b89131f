//! The port-forward stream bridge.
//!
//! Each bridging session speaks the three-stream handshake the kubelet
//! expects: allocate a request id, open the *error* stream (a read-only
//! side-channel for kubelet-reported forwarding errors), then open the *data*
//! stream under the same id. Payload bytes flow on the data stream; the error
//! stream is read to end-of-stream by a collector task and yields at most one
//! verdict per session.
//!
//! Two payload framings share that handshake:
//!
//! - [`Bridge::bridge_http`]: one serialized HTTP request out, one parsed
//!   HTTP response back.
//! - [`Bridge::bridge_raw`]: opaque bytes in both directions for the lifetime
//!   of the hijacked client connection.
//!
//! The session ends when the remote-to-local direction finishes or the
//! local-to-remote direction fails, whichever comes first; the error-stream
//! verdict is then consumed exactly once and decides the outcome.

use std::any::Any;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, PROXY_AUTHORIZATION};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::ProxyError;
use crate::cluster::BackendTarget;
use crate::tunnel::{StreamHeaders, Tunnel};

/// Response body type produced by the bridge (and the passthrough paths).
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Upper bound on a response header section read from the data stream.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Bridges client bytes over port-forward tunnels.
///
/// Holds the process-wide request-id counter; ids are unique for the process
/// lifetime, never reused, and shared by the error and data streams of one
/// session.
pub struct Bridge {
    next_request_id: AtomicU32,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Create a bridge with a fresh request-id counter.
    pub fn new() -> Self {
        Self {
            next_request_id: AtomicU32::new(0),
        }
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Bridge a single HTTP request/response pair over the tunnel.
    ///
    /// Serializes the request head and body to the data stream, half-closes
    /// it, and parses one HTTP response back. On success the response body
    /// streams lazily from the tunnel, which stays alive until the body is
    /// drained. `Ok(None)` means the response could not be parsed; the caller
    /// answers the client with a synthetic 5xx.
    pub async fn bridge_http<T, B>(
        &self,
        parts: &Parts,
        body: B,
        target: &BackendTarget,
        tunnel: T,
    ) -> Result<Option<Response<ProxyBody>>, ProxyError>
    where
        T: Tunnel,
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let (error_rx, data_stream) = match self.open_session(target, &tunnel).await {
            Ok(session) => session,
            Err(e) => {
                tunnel.close();
                return Err(e);
            }
        };
        let (mut data_read, mut data_write) = tokio::io::split(data_stream);

        // Local-to-remote: request head, then the body.
        let (local_tx, local_rx) = oneshot::channel::<String>();
        let head = serialize_request_head(parts);
        tokio::spawn(async move {
            let result: io::Result<()> = async {
                data_write.write_all(&head).await?;
                let mut body = body;
                while let Some(frame) = body.frame().await {
                    let frame = frame.map_err(io::Error::other)?;
                    if let Ok(mut data) = frame.into_data() {
                        data_write.write_all_buf(&mut data).await?;
                    }
                }
                Ok(())
            }
            .await;
            if let Err(e) = result {
                if !is_closed_conn_error(&e) {
                    warn!("error copying request to remote stream: {e}");
                    let _ = local_tx.send(e.to_string());
                }
            }
            // Half-close tells the remote the request is complete.
            if let Err(e) = data_write.shutdown().await {
                debug!("error closing data stream: {e}");
            }
        });

        // Remote-to-local: parse one response head, hand the reader back for
        // lazy body streaming.
        type RemoteOutcome<R> = Option<(ResponseHead, R)>;
        let (remote_tx, remote_rx) = oneshot::channel::<RemoteOutcome<_>>();
        tokio::spawn(async move {
            let outcome = match read_response_head(&mut data_read).await {
                Ok(head) => Some((head, data_read)),
                Err(e) => {
                    warn!("error reading response from remote stream: {e}");
                    None
                }
            };
            let _ = remote_tx.send(outcome);
        });

        let mut remote_outcome = None;
        let mut local_error = None;
        let local_failed = only_if_sent(local_rx);
        tokio::pin!(local_failed);
        tokio::select! {
            r = remote_rx => remote_outcome = r.ok(),
            msg = &mut local_failed => local_error = Some(msg),
        }

        // The collector delivers at most one verdict, then the channel closes.
        let kubelet_error = error_rx.await.unwrap_or(None);
        if let Some(message) = kubelet_error {
            warn!("{message}");
            tunnel.close();
            return Err(ProxyError::Kubelet(message));
        }
        if let Some(message) = local_error {
            tunnel.close();
            return Err(ProxyError::LocalCopy(message));
        }

        let Some(Some((head, reader))) = remote_outcome else {
            tunnel.close();
            return Ok(None);
        };

        let content_length = head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let base = std::io::Cursor::new(head.leftover).chain(reader);
        let reader: Box<dyn AsyncRead + Send + Unpin> = match content_length {
            Some(n) => Box::new(base.take(n)),
            None => Box::new(base),
        };

        let mut response = Response::builder().status(head.status);
        if let Some(headers) = response.headers_mut() {
            *headers = head.headers;
        }
        let response = response
            .body(UnsyncBoxBody::new(StreamedBody::new(reader, tunnel)))
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        Ok(Some(response))
    }

    /// Bridge opaque bytes between the hijacked client connection and the
    /// tunnel until either direction quiesces.
    pub async fn bridge_raw<T, C>(
        &self,
        client: C,
        target: &BackendTarget,
        tunnel: T,
    ) -> Result<(), ProxyError>
    where
        T: Tunnel,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (error_rx, data_stream) = match self.open_session(target, &tunnel).await {
            Ok(session) => session,
            Err(e) => {
                tunnel.close();
                return Err(e);
            }
        };
        let (mut data_read, mut data_write) = tokio::io::split(data_stream);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let (remote_tx, remote_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut data_read, &mut client_write).await {
                if !is_closed_conn_error(&e) {
                    warn!("error copying from remote stream to local connection: {e}");
                }
            }
            let _ = remote_tx.send(());
        });

        let (local_tx, local_rx) = oneshot::channel::<String>();
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut client_read, &mut data_write).await {
                if !is_closed_conn_error(&e) {
                    warn!("error copying from local connection to remote stream: {e}");
                    let _ = local_tx.send(e.to_string());
                }
            }
            if let Err(e) = data_write.shutdown().await {
                debug!("error closing data stream: {e}");
            }
        });

        let mut local_error = None;
        let local_failed = only_if_sent(local_rx);
        tokio::pin!(local_failed);
        tokio::select! {
            _ = remote_rx => {}
            msg = &mut local_failed => local_error = Some(msg),
        }

        let kubelet_error = error_rx.await.unwrap_or(None);
        if let Some(message) = kubelet_error {
            warn!("{message}");
            tunnel.close();
            return Err(ProxyError::Kubelet(message));
        }
        if let Some(message) = local_error {
            tunnel.close();
            return Err(ProxyError::LocalCopy(message));
        }
        Ok(())
    }

    /// The three-stream handshake shared by both bridging modes.
    ///
    /// Opens the error stream, closes its write half, starts the collector,
    /// then opens the data stream under the same request id. The error stream
    /// is always opened first; the kubelet pairs the two by request id.
    async fn open_session<T: Tunnel>(
        &self,
        target: &BackendTarget,
        tunnel: &T,
    ) -> Result<(oneshot::Receiver<Option<String>>, T::Stream), ProxyError> {
        let request_id = self.next_request_id();

        let error_stream = tunnel
            .create_stream(StreamHeaders::error(&target.port, request_id))
            .await
            .map_err(|e| ProxyError::ErrorStream {
                target: target.to_string(),
                source: e,
            })?;

        let (err_read, mut err_write) = tokio::io::split(error_stream);
        // The core never writes to the error stream.
        if let Err(e) = err_write.shutdown().await {
            debug!("error closing error stream for pod {target}: {e}");
        }
        drop(err_write);

        let (verdict_tx, verdict_rx) = oneshot::channel();
        let label = target.to_string();
        tokio::spawn(async move {
            let mut err_read = err_read;
            let mut message = Vec::new();
            let verdict = match err_read.read_to_end(&mut message).await {
                Err(e) => Some(format!(
                    "error reading from error stream for pod {label}: {e}"
                )),
                Ok(_) if !message.is_empty() => Some(format!(
                    "an error occurred forwarding to pod {label}: {}",
                    String::from_utf8_lossy(&message)
                )),
                Ok(_) => None,
            };
            let _ = verdict_tx.send(verdict);
        });

        let data_stream = tunnel
            .create_stream(StreamHeaders::data(&target.port, request_id))
            .await
            .map_err(|e| ProxyError::DataStream {
                target: target.to_string(),
                source: e,
            })?;

        Ok((verdict_rx, data_stream))
    }
}

/// Resolve to the sent value, or pend forever when the sender was dropped
/// without sending (the no-error case).
async fn only_if_sent<V>(rx: oneshot::Receiver<V>) -> V {
    match rx.await {
        Ok(value) => value,
        Err(_) => std::future::pending().await,
    }
}

/// Copy-termination conditions treated as normal peer teardown.
fn is_closed_conn_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    ) || e.to_string().contains("use of closed network connection")
}

/// A parsed response head plus whatever body bytes arrived with it.
struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    leftover: Bytes,
}

/// Serialize the request line and headers in origin-form HTTP/1.1.
fn serialize_request_head(parts: &Parts) -> Vec<u8> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", parts.method, path).into_bytes();

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            head.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
        }
    }
    for (name, value) in &parts.headers {
        if name == PROXY_AUTHORIZATION || name.as_str() == "proxy-connection" {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read from the stream until one full response head is buffered.
async fn read_response_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ResponseHead> {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        if let Some((len, status, headers)) = parse_response_head(&buf)? {
            let leftover = buf.split_off(len).freeze();
            return Ok(ResponseHead {
                status,
                headers,
                leftover,
            });
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header section too large",
            ));
        }
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed before response head",
            ));
        }
    }
}

/// Parse a response head from a buffer; `None` when more bytes are needed.
fn parse_response_head(buf: &[u8]) -> io::Result<Option<(usize, StatusCode, HeaderMap)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response
        .parse(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
    {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => {
            let code = response.code.unwrap_or(0);
            let status = StatusCode::from_u16(code)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut map = HeaderMap::new();
            for h in response.headers.iter() {
                let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(h.name.as_bytes()),
                    HeaderValue::from_bytes(h.value),
                ) else {
                    continue;
                };
                map.append(name, value);
            }
            Ok(Some((len, status, map)))
        }
    }
}

/// Body that streams from the tunnel's data stream and keeps the tunnel
/// alive until drained.
struct StreamedBody {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    _tunnel: Box<dyn Any + Send>,
    done: bool,
}

impl StreamedBody {
    fn new(reader: Box<dyn AsyncRead + Send + Unpin>, tunnel: impl Any + Send) -> Self {
        Self {
            reader,
            _tunnel: Box::new(tunnel),
            done: false,
        }
    }
}

impl Body for StreamedBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let mut chunk = [0u8; 8192];
        let mut read_buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    this.done = true;
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Frame::data(Bytes::copy_from_slice(filled)))))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_increasing() {
        let bridge = Bridge::new();
        let a = bridge.next_request_id();
        let b = bridge.next_request_id();
        let c = bridge.next_request_id();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_serialize_request_head_origin_form() {
        let request = http::Request::builder()
            .method("GET")
            .uri("http://redis.app.svc.cluster.local:8080/info?full=1")
            .header("accept", "application/json")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let head = String::from_utf8(serialize_request_head(&parts)).unwrap();
        assert!(head.starts_with("GET /info?full=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: redis.app.svc.cluster.local:8080\r\n"));
        assert!(head.contains("accept: application/json\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_request_head_strips_proxy_headers() {
        let request = http::Request::builder()
            .uri("http://api.app.svc.cluster.local/")
            .header("proxy-connection", "keep-alive")
            .header("proxy-authorization", "Basic Zm9v")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let head = String::from_utf8(serialize_request_head(&parts)).unwrap();
        assert!(!head.to_lowercase().contains("proxy-connection"));
        assert!(!head.to_lowercase().contains("proxy-authorization"));
    }

    #[test]
    fn test_parse_response_head_complete() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";
        let (len, status, headers) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(&raw[len..], b"hello");
    }

    #[test]
    fn test_parse_response_head_partial() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\ncontent-")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_closed_conn_errors_tolerated() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(is_closed_conn_error(&io::Error::new(kind, "x")));
        }
        assert!(is_closed_conn_error(&io::Error::other(
            "use of closed network connection"
        )));
        assert!(!is_closed_conn_error(&io::Error::other("boom")));
    }

    #[tokio::test]
    async fn test_read_response_head_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 404 Not").await.unwrap();
            server.write_all(b" Found\r\n\r\nrest").await.unwrap();
        });

        let head = read_response_head(&mut client).await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(&head.leftover[..], b"rest");
        task.await.unwrap();
    }
}
