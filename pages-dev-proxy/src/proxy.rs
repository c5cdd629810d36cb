//! HTTPS reverse proxy in front of a local dev server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Time in-flight connections get to finish after the proxy is closed.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Forwards HTTPS traffic on a listen address to `http://localhost:<target_port>`.
///
/// Every response, including proxy-generated errors and upgrade responses,
/// carries `Access-Control-Allow-Origin: *`.
pub struct ReverseProxy {
    target_port: u16,
    client: Client<HttpConnector, Incoming>,
    shutdown: CancellationToken,
}

impl ReverseProxy {
    /// Bind `listen_addr` and start serving.
    ///
    /// Requests are accepted immediately; while the target is not listening
    /// yet each request fails on its own with `502 Bad Gateway`.
    pub async fn start(
        target_port: u16,
        listen_addr: SocketAddr,
        tls: Arc<ServerConfig>,
    ) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: listen_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                addr: listen_addr,
                source,
            })?;

        let shutdown = CancellationToken::new();
        let proxy = Arc::new(ReverseProxy {
            target_port,
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown: shutdown.clone(),
        });

        tracing::info!(%local_addr, target_port, "dev proxy listening");
        let task = tokio::spawn(accept_loop(listener, TlsAcceptor::from(tls), proxy));

        Ok(ProxyHandle {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let mut response = if is_upgrade_request(&req) {
            self.forward_upgrade(req).await
        } else {
            self.forward(req).await
        };
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let uri = match self.target_uri(req.uri()) {
            Ok(uri) => uri,
            Err(e) => return bad_gateway(e),
        };
        *req.uri_mut() = uri;

        match self.client.request(req).await {
            Ok(resp) => resp.map(|body| body.boxed()),
            Err(e) => {
                tracing::debug!(
                    target_port = self.target_port,
                    error = %e,
                    "upstream request failed"
                );
                bad_gateway(format!("dev server on port {} is not reachable", self.target_port))
            }
        }
    }

    async fn forward_upgrade(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let stream = match TcpStream::connect(("localhost", self.target_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(
                    target_port = self.target_port,
                    error = %e,
                    "upstream connect failed"
                );
                return bad_gateway(format!(
                    "dev server on port {} is not reachable",
                    self.target_port
                ));
            }
        };
        let handshake = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await;
        let (mut sender, conn) = match handshake {
            Ok(parts) => parts,
            Err(e) => return bad_gateway(e),
        };
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "upstream upgrade connection ended with error");
            }
        });

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match path.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => return bad_gateway(e),
        }

        let mut upstream = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => return bad_gateway(e),
        };
        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            return upstream.map(|body| body.boxed());
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let (client, server) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!(error = %e, "upgrade handshake failed");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut server = TokioIo::new(server);
            tokio::select! {
                res = tokio::io::copy_bidirectional(&mut client, &mut server) => {
                    if let Err(e) = res {
                        tracing::debug!(error = %e, "upgraded connection closed with error");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });

        let (parts, _) = upstream.into_parts();
        Response::from_parts(parts, empty())
    }

    fn target_uri(&self, uri: &Uri) -> std::result::Result<Uri, String> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("http://localhost:{}{}", self.target_port, path)
            .parse()
            .map_err(|e| format!("invalid request target: {e}"))
    }
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, proxy: Arc<ReverseProxy>) {
    let shutdown = proxy.shutdown.clone();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "dev proxy accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        tokio::spawn(serve_connection(stream, peer, acceptor.clone(), proxy.clone()));
    }
    tracing::debug!("dev proxy listener closed");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    proxy: Arc<ReverseProxy>,
) {
    let shutdown = proxy.shutdown.clone();
    let tls = tokio::select! {
        _ = shutdown.cancelled() => return,
        res = acceptor.accept(stream) => match res {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "TLS handshake failed");
                return;
            }
        },
    };

    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req).await) }
    });
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                tracing::debug!(%peer, error = %e, "proxy connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, conn.as_mut()).await;
        }
    }
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(UPGRADE)
        && req
            .headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn bad_gateway(reason: impl std::fmt::Display) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("Bad Gateway: {reason}\n")))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// A running proxy. Dropping the handle closes the proxy.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and shut down open ones.
    ///
    /// Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(local_addr = %self.local_addr, "closing dev proxy");
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close and wait until the listener socket has been released.
    pub async fn closed(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::debug!(error = %e, "dev proxy task ended abnormally");
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/ws");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn detects_websocket_upgrade() {
        assert!(is_upgrade_request(&request(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        assert!(!is_upgrade_request(&request(&[("connection", "keep-alive")])));
        assert!(!is_upgrade_request(&request(&[("upgrade", "websocket")])));
    }

    #[test]
    fn bad_gateway_is_plain_text_502() {
        let resp = bad_gateway("nope");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
