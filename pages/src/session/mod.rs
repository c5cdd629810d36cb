//! Dev session lifecycle controller.
//!
//! One session composes the compiler process, an optional local front
//! (HTTPS proxy or function server), the public tunnel and the remote
//! registration heartbeat. Every resource is torn down on the same path,
//! whatever ended the session.

mod heartbeat;
mod probe;
mod state;

use heartbeat::{Registration, schedule};
use probe::wait_for_http;
pub use state::SessionState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pages_core::{DevSessionStart, LogItem, ProjectType};
use pages_dev_proxy::{ProxyError, ProxyHandle, ReverseProxy};
use pages_spawn::{CommandSpec, ProcessError, ProcessExit, Supervisor};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, DevSessionApi};
use crate::config::DevConfig;
use crate::function::{FunctionServer, FunctionServerHandle, HandlerConfig, LogSink};
use crate::tunnel::{TunnelError, TunnelExit, TunnelManager, TunnelSession, TunnelTarget};

/// Errors that end (or, for `Registration`, are surfaced by) a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start process: {0}")]
    Spawn(#[source] ProcessError),

    #[error("Public tunnels are not supported on this platform ({0})")]
    UnsupportedPlatform(String),

    #[error("Dev session registration failed: {0}")]
    Registration(#[source] ApiError),

    #[error("{0}")]
    ChildProcess(#[source] ProcessError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Failed to start function server: {0}")]
    FunctionServer(#[source] std::io::Error),

    #[error(transparent)]
    Tunnel(TunnelError),

    #[error("Session task aborted: {0}")]
    Aborted(String),

    #[error("Public dev sessions need a session API client")]
    ApiNotConfigured,
}

impl From<TunnelError> for SessionError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::UnsupportedPlatform(os) => SessionError::UnsupportedPlatform(os),
            TunnelError::Process(e) if e.is_spawn_failure() => SessionError::Spawn(e),
            other => SessionError::Tunnel(other),
        }
    }
}

/// What the session reports while it runs.
#[derive(Debug)]
pub enum SessionEvent {
    /// A tagged log line (`dev:`, `fn:`, `tunnel:`, `pages:`, `err:`)
    Log(LogItem),
    /// A non-fatal error, e.g. a failed heartbeat. The session keeps running.
    Error(SessionError),
}

/// Who the session registers as.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub name: String,
    pub project_type: ProjectType,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// Wait after spawning the compiler before anything else happens
    pub grace_delay: Duration,
    /// Probe the dev server before fronting it with the proxy
    pub probe: bool,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::from(&DevConfig::default())
    }
}

impl From<&DevConfig> for SessionTimings {
    fn from(dev: &DevConfig) -> Self {
        Self {
            grace_delay: dev.grace_delay(),
            probe: dev.probe,
            probe_attempts: dev.probe_attempts,
            probe_interval: dev.probe_interval(),
            heartbeat_interval: dev.heartbeat_interval(),
        }
    }
}

/// How the compiler is exposed.
#[derive(Clone)]
pub enum SessionFlavor {
    /// Page projects: HTTPS proxy on `listen_port` in front of the dev
    /// server, tunnel to the proxy.
    Proxy {
        listen_port: u16,
        tls: Arc<ServerConfig>,
    },
    /// Function projects: request-handler server on `listen_port`, tunnel
    /// to the server.
    Function {
        listen_port: u16,
        handler: HandlerConfig,
    },
    /// Compiler only: no tunnel, no registration.
    CompilerOnly,
}

impl SessionFlavor {
    /// Tunneled and registered with the remote session API.
    pub fn is_public(&self) -> bool {
        !matches!(self, SessionFlavor::CompilerOnly)
    }
}

impl std::fmt::Debug for SessionFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFlavor::Proxy { listen_port, .. } => f
                .debug_struct("Proxy")
                .field("listen_port", listen_port)
                .finish_non_exhaustive(),
            SessionFlavor::Function {
                listen_port,
                handler,
            } => f
                .debug_struct("Function")
                .field("listen_port", listen_port)
                .field("handler", handler)
                .finish(),
            SessionFlavor::CompilerOnly => f.write_str("CompilerOnly"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DevSessionConfig {
    /// Watch-mode build command
    pub compiler: CommandSpec,
    /// Port the compiler's dev server listens on
    pub port: u16,
    pub identity: SessionIdentity,
    pub flavor: SessionFlavor,
    pub timings: SessionTimings,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub supervisor: Supervisor,
    /// Required for public flavors; compiler-only sessions never register.
    pub api: Option<Arc<dyn DevSessionApi>>,
    pub tunnels: TunnelManager,
}

/// Start a session in the background.
///
/// Must be called within a tokio runtime.
pub fn start_dev_session(config: DevSessionConfig, deps: SessionDeps) -> SessionHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let (url_tx, url_rx) = watch::channel(None);
    let cancel = CancellationToken::new();

    let controller = Controller {
        config,
        deps,
        events: events_tx,
        state: state_tx,
        public_url: url_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(controller.run());

    SessionHandle {
        events: events_rx,
        state: state_rx,
        public_url: url_rx,
        cancel,
        task: Some(task),
    }
}

/// A running session.
///
/// Events end once the session has stopped and cleaned up. Dropping the
/// handle cancels the session.
pub struct SessionHandle {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Receiver<SessionState>,
    public_url: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), SessionError>>>,
}

impl SessionHandle {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Request cancellation. Cleanup runs in the background; use
    /// [`SessionHandle::finish`] to wait for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn public_url(&self) -> Option<String> {
        self.public_url.borrow().clone()
    }

    /// Resolves with the URL once the tunnel is up (never changes after).
    pub fn public_url_watch(&self) -> watch::Receiver<Option<String>> {
        self.public_url.clone()
    }

    /// Wait for the session to end and every resource to be released.
    pub async fn finish(mut self) -> Result<(), SessionError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| SessionError::Aborted(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Cancel, then [`finish`](SessionHandle::finish).
    #[cfg(test)]
    pub async fn stop(self) -> Result<(), SessionError> {
        self.cancel();
        self.finish().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("public_url", &self.public_url())
            .finish()
    }
}

/// Resources a session has acquired so far. Filled in as the session
/// progresses so cleanup sees them even when interrupted mid-transition.
#[derive(Default)]
struct Resources {
    proxy: Option<ProxyHandle>,
    functions: Option<FunctionServerHandle>,
    tunnel: Option<TunnelSession>,
    registered: Option<Registration>,
}

struct Compiler {
    cancel: CancellationToken,
    relay: JoinHandle<()>,
}

type CompilerExit = pages_spawn::Result<ProcessExit>;

struct Controller {
    config: DevSessionConfig,
    deps: SessionDeps,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SessionState>,
    public_url: watch::Sender<Option<String>>,
    cancel: CancellationToken,
}

impl Controller {
    async fn run(self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            self.set_state(SessionState::Stopped);
            return Ok(());
        }
        if self.config.flavor.is_public() && self.deps.api.is_none() {
            let e = SessionError::ApiNotConfigured;
            self.fail(&e);
            self.set_state(SessionState::Stopped);
            return Err(e);
        }

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let compiler = match self.spawn_compiler(exit_tx) {
            Ok(compiler) => compiler,
            Err(e) => {
                self.fail(&e);
                self.set_state(SessionState::Stopped);
                return Err(e);
            }
        };

        let mut res = Resources::default();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(name = %self.config.identity.name, "session cancelled");
                Ok(())
            }
            exit = &mut exit_rx => self.compiler_ended(exit),
            result = self.drive(&mut res) => result,
        };

        self.cleanup(res, compiler).await;
        if let Err(e) = &result {
            self.fail(e);
        }
        self.set_state(SessionState::Stopped);
        result
    }

    fn spawn_compiler(
        &self,
        exit_tx: oneshot::Sender<CompilerExit>,
    ) -> Result<Compiler, SessionError> {
        let mut stream = self
            .deps
            .supervisor
            .run_with_cancel(self.config.compiler.clone(), &self.cancel)
            .map_err(SessionError::Spawn)?;
        self.set_state(SessionState::CompilerStarting);

        let cancel = stream.cancellation_token();
        let events = self.events.clone();
        let relay = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let _ = events.send(SessionEvent::Log(item.tagged("dev")));
            }
            let _ = exit_tx.send(stream.wait().await);
        });
        Ok(Compiler { cancel, relay })
    }

    fn compiler_ended(
        &self,
        exit: Result<CompilerExit, oneshot::error::RecvError>,
    ) -> Result<(), SessionError> {
        match exit {
            Ok(Ok(ProcessExit::Exited(_))) => {
                self.notice("compiler exited, stopping dev session");
                Ok(())
            }
            Ok(Ok(ProcessExit::Cancelled(_))) => Ok(()),
            Ok(Err(e)) => Err(SessionError::ChildProcess(e)),
            Err(_) => Err(SessionError::Aborted("compiler relay ended".to_string())),
        }
    }

    /// Forward progress through the lifecycle. Only returns on failure;
    /// a healthy session stays here until interrupted.
    async fn drive(&self, res: &mut Resources) -> Result<(), SessionError> {
        tokio::time::sleep(self.config.timings.grace_delay).await;

        let target = match &self.config.flavor {
            SessionFlavor::CompilerOnly => {
                self.set_state(SessionState::CompilerReady);
                return std::future::pending().await;
            }
            SessionFlavor::Proxy { listen_port, tls } => {
                if !self.probe_dev_server().await {
                    return std::future::pending().await;
                }
                self.set_state(SessionState::CompilerReady);
                let proxy = ReverseProxy::start(
                    self.config.port,
                    SocketAddr::from(([127, 0, 0, 1], *listen_port)),
                    tls.clone(),
                )
                .await?;
                let port = proxy.local_addr().port();
                res.proxy = Some(proxy);
                self.notice(format!(
                    "proxying https://localhost:{port} to localhost:{}",
                    self.config.port
                ));
                TunnelTarget::Https(port)
            }
            SessionFlavor::Function {
                listen_port,
                handler,
            } => {
                self.set_state(SessionState::CompilerReady);
                let server = FunctionServer::start(
                    SocketAddr::from(([127, 0, 0, 1], *listen_port)),
                    handler.clone(),
                    self.deps.supervisor.clone(),
                    self.log_sink(),
                )
                .await
                .map_err(SessionError::FunctionServer)?;
                let port = server.local_addr().port();
                res.functions = Some(server);
                self.notice(format!("serving functions on http://localhost:{port}"));
                TunnelTarget::Http(port)
            }
        };

        self.set_state(SessionState::TunnelConnecting);
        let tunnel = res.tunnel.insert(self.deps.tunnels.connect(target)?);
        let Some(url) = tunnel.next().await else {
            let exit = tunnel.closed().await;
            return Err(tunnel_closed(&exit, false));
        };
        self.public_url.send_replace(Some(url.clone()));
        self.set_state(SessionState::TunnelReady);
        self.log(LogItem::stdout(format!("public url {url}")).tagged("tunnel"));

        let api = self.deps.api.clone().ok_or(SessionError::ApiNotConfigured)?;
        let registration = Registration::new(
            api,
            DevSessionStart {
                url,
                name: self.config.identity.name.clone(),
                project_type: self.config.identity.project_type,
                metadata: self.config.identity.metadata.clone(),
            },
        );
        let mut ticker = schedule(self.config.timings.heartbeat_interval);

        // Initial registration, retried on the heartbeat schedule.
        loop {
            tokio::select! {
                _ = ticker.tick() => match registration.register().await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "dev session registration failed, will retry");
                        self.surface(SessionError::Registration(e));
                    }
                },
                exit = tunnel.closed() => {
                    return Err(tunnel_closed(&exit, true));
                }
            }
        }
        res.registered = Some(registration.clone());
        self.set_state(SessionState::Registered);
        self.notice(format!("dev session registered for {}", registration.url()));

        loop {
            tokio::select! {
                _ = ticker.tick() => match registration.register().await {
                    Ok(()) => tracing::debug!(url = registration.url(), "heartbeat sent"),
                    Err(e) => {
                        tracing::warn!(error = %e, "heartbeat failed");
                        self.surface(SessionError::Registration(e));
                    }
                },
                exit = tunnel.closed() => {
                    return Err(tunnel_closed(&exit, true));
                }
            }
        }
    }

    /// True once the dev server answers. On failure the session keeps
    /// relaying compiler output without fronting it.
    async fn probe_dev_server(&self) -> bool {
        let timings = &self.config.timings;
        if !timings.probe {
            return true;
        }
        let probed = wait_for_http(
            self.config.port,
            timings.probe_attempts,
            timings.probe_interval,
        )
        .await;
        match probed {
            Ok(()) => true,
            Err(e) => {
                tracing::info!(port = self.config.port, error = %e, "dev server probe gave up");
                self.warn(format!(
                    "dev server on port {} did not respond after {} attempts; not proxied",
                    self.config.port, timings.probe_attempts
                ));
                false
            }
        }
    }

    async fn cleanup(&self, res: Resources, compiler: Compiler) {
        if let Some(tunnel) = &res.tunnel {
            tunnel.cancel();
        }
        if let Some(proxy) = &res.proxy {
            proxy.close();
        }
        if let Some(functions) = &res.functions {
            functions.close();
        }
        compiler.cancel.cancel();

        if let Some(tunnel) = &res.tunnel {
            let exit = tunnel.stop().await;
            tracing::debug!(?exit, "tunnel stopped");
        }
        if let Some(proxy) = &res.proxy {
            proxy.closed().await;
        }
        if let Some(functions) = &res.functions {
            functions.closed().await;
        }
        if let Err(e) = compiler.relay.await {
            tracing::debug!(error = %e, "compiler relay task ended abnormally");
        }

        if let Some(registration) = &res.registered {
            registration.deregister().await;
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(
                name = %self.config.identity.name,
                from = %previous,
                to = %state,
                "session state"
            );
        }
    }

    fn log(&self, item: LogItem) {
        let _ = self.events.send(SessionEvent::Log(item));
    }

    fn log_sink(&self) -> LogSink {
        let events = self.events.clone();
        Arc::new(move |item| {
            let _ = events.send(SessionEvent::Log(item));
        })
    }

    fn notice(&self, text: impl Into<String>) {
        self.log(LogItem::stdout(text).tagged("pages"));
    }

    fn warn(&self, text: impl Into<String>) {
        self.log(LogItem::stderr(text).tagged("pages"));
    }

    fn surface(&self, err: SessionError) {
        let _ = self.events.send(SessionEvent::Error(err));
    }

    fn fail(&self, err: &SessionError) {
        tracing::error!(name = %self.config.identity.name, error = %err, "dev session failed");
        self.log(LogItem::stderr(err.to_string()).tagged("err"));
    }
}

fn tunnel_closed(exit: &TunnelExit, url_reported: bool) -> SessionError {
    let reason = match exit {
        Ok(ProcessExit::Exited(status)) if url_reported => format!("exited with {status}"),
        Ok(ProcessExit::Exited(status)) => {
            format!("exited with {status} before reporting a public url")
        }
        Ok(ProcessExit::Cancelled(_)) => "terminated".to_string(),
        Err(e) => e.clone(),
    };
    SessionError::Tunnel(TunnelError::Closed(reason))
}
