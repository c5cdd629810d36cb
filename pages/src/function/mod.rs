//! Local request-handler server for function projects.
//!
//! Plain HTTP; every request is served by a fresh handler process
//! (see [`handler::invoke`]).

mod handler;

pub use handler::{DEFAULT_HANDLER_COMMAND, HandlerConfig, LogSink};
use handler::invoke;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pages_core::{FunctionRequest, FunctionResponse, LogItem};
use pages_spawn::Supervisor;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Time open connections get after close. Covers the supervisor's
/// terminate grace so cancelled handlers are reaped before close returns.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerState {
    supervisor: Supervisor,
    handler: HandlerConfig,
    logs: LogSink,
    shutdown: CancellationToken,
}

pub struct FunctionServer;

impl FunctionServer {
    /// Bind `listen_addr` and serve until the returned handle is closed.
    pub async fn start(
        listen_addr: SocketAddr,
        handler: HandlerConfig,
        supervisor: Supervisor,
        logs: LogSink,
    ) -> std::io::Result<FunctionServerHandle> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let state = Arc::new(ServerState {
            supervisor,
            handler,
            logs,
            shutdown: shutdown.clone(),
        });

        tracing::info!(%local_addr, "function server listening");
        let task = tokio::spawn(accept_loop(listener, state, tracker.clone()));

        Ok(FunctionServerHandle {
            local_addr,
            shutdown,
            tracker,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, tracker: TaskTracker) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "function server accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        tracker.spawn(serve_connection(stream, peer, state.clone()));
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let shutdown = state.shutdown.clone();
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle(&state, req).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                tracing::debug!(%peer, error = %e, "function server connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, conn.as_mut()).await;
        }
    }
}

async fn handle(state: &ServerState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let request = match function_request(req, state.handler.max_body_bytes).await {
        Ok(request) => request,
        Err(rejected) => return http_response(rejected),
    };

    let response = match invoke(
        &state.supervisor,
        &state.handler,
        &request,
        &state.shutdown,
        &state.logs,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            (state.logs)(LogItem::stderr(e.to_string()).tagged("fn"));
            FunctionResponse::text(e.status(), e.to_string())
        }
    };

    (state.logs)(
        LogItem::stdout(format!(
            "{} {} {}",
            request.method, request.path, response.status
        ))
        .tagged("fn"),
    );
    http_response(response)
}

async fn function_request(
    req: Request<Incoming>,
    max_body_bytes: usize,
) -> Result<FunctionRequest, FunctionResponse> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(FunctionResponse::text(
                413,
                format!("request body exceeds {max_body_bytes} bytes"),
            ));
        }
        Err(e) => {
            return Err(FunctionResponse::text(
                400,
                format!("failed to read request body: {e}"),
            ));
        }
    };

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    Ok(FunctionRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parse_query(parts.uri.query().unwrap_or_default()),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Split a raw query string into pairs. Values are passed through as sent.
fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn http_response(resp: FunctionResponse) -> Response<Full<Bytes>> {
    let mut out = Response::new(Full::new(Bytes::from(resp.body)));
    *out.status_mut() = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = out.headers_mut();
    for (name, value) in &resp.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "dropping invalid response header"),
        }
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    out
}

/// A running function server. Dropping the handle closes it.
pub struct FunctionServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FunctionServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and cancel in-flight handlers. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close and wait for the listener and every connection to finish.
    pub async fn closed(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::debug!(error = %e, "function server task ended abnormally");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for FunctionServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for FunctionServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionServerHandle")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
