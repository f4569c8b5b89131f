//! The proxy listener.
//!
//! Accepts proxy clients on a TCP socket. The first request head on each
//! connection is read off the raw socket before hyper sees it: CONNECT
//! requests are hijacked there and handed to the router with the socket (so
//! the router can answer with literal wire frames and close on failure),
//! while everything else is replayed into hyper's HTTP/1.1 stack. Each
//! connection runs in its own task; shutdown is signalled through a watch
//! channel and does not interrupt active bridges.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{ProxyError, ProxyResult};
use super::router::Router;

/// Upper bound on a request header section read during sniffing.
const MAX_HEADER_SECTION: usize = 16 * 1024;

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
}

/// The main proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    router: Arc<Router>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a new proxy server.
    pub fn new(config: ProxyConfig, router: Arc<Router>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            router,
            shutdown_rx,
        }
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(self) -> ProxyResult<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        info!("proxy listening on {}", self.config.listen);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted proxy connection");
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve a single client connection in its own task.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let router = self.router.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, router).await {
                // Connection resets are routine for a proxy; keep them quiet.
                let message = e.to_string();
                if message.contains("connection reset") || message.contains("broken pipe") {
                    debug!("connection ended: {message}");
                } else {
                    warn!("connection error: {message}");
                }
            }
        });
    }
}

/// First request head on a connection, classified before hyper.
enum Sniffed {
    /// A CONNECT request; the head has been consumed, `leftover` holds any
    /// bytes that followed it.
    Connect {
        /// The authority-form request target (`host:port`).
        target: String,
        /// Bytes read past the header section.
        leftover: Bytes,
    },
    /// Anything else (including malformed input hyper should answer);
    /// `buffered` holds everything read so far, to be replayed.
    Other {
        /// Bytes to replay before the socket.
        buffered: Bytes,
    },
}

/// Handle one client connection: sniff the first request, then either hand
/// the raw socket to the router (CONNECT) or serve it with hyper.
async fn handle_connection(mut stream: TcpStream, router: Arc<Router>) -> Result<(), ProxyError> {
    let sniffed = sniff_request(&mut stream).await?;

    match sniffed {
        Sniffed::Connect { target, leftover } => {
            debug!(target, "hijacked CONNECT");
            router
                .handle_connect(Prebuffered::new(leftover, stream), &target)
                .await;
            Ok(())
        }
        Sniffed::Other { buffered } => {
            let io = TokioIo::new(Prebuffered::new(buffered, stream));
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { router.handle(req).await }
            });

            http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .await
                .map_err(ProxyError::from)
        }
    }
}

/// Read until the first request head is complete and classify it.
///
/// Malformed or oversized heads are not rejected here; they are handed to
/// hyper, which answers them with its usual errors.
async fn sniff_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Sniffed, ProxyError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let connect = request.method == Some("CONNECT");
                    Some((connect, request.path.unwrap_or("").to_string(), len))
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => Some((false, String::new(), 0)),
            }
        };

        if let Some((connect, target, header_len)) = parsed {
            if connect {
                let leftover = buf.split_off(header_len).freeze();
                return Ok(Sniffed::Connect { target, leftover });
            }
            return Ok(Sniffed::Other {
                buffered: buf.freeze(),
            });
        }
        if buf.len() > MAX_HEADER_SECTION {
            return Ok(Sniffed::Other {
                buffered: buf.freeze(),
            });
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            )));
        }
    }
}

/// Replays sniffed bytes before delegating to the inner stream.
///
/// Writes go straight through; only reads are prefixed.
struct Prebuffered<T> {
    buffer: Bytes,
    inner: T,
}

impl<T> Prebuffered<T> {
    fn new(buffer: Bytes, inner: T) -> Self {
        Self { buffer, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Prebuffered<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Prebuffered<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
