//! Public tunnel manager.
//!
//! Runs the bundled tunnel binary under the process supervisor and turns its
//! logfmt output into a single public URL.

mod binary;
mod logfmt;

pub use binary::TunnelBinary;
use logfmt::UrlDetector;

use std::fmt;
use std::path::PathBuf;

use pages_spawn::{CommandSpec, ManagedProcess, ProcessError, ProcessExit, Supervisor};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors from the tunnel manager
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Public tunnels are not supported on this platform ({0})")]
    UnsupportedPlatform(String),

    #[error("Tunnel binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Tunnel process ended: {0}")]
    Closed(String),
}

/// Local endpoint the tunnel forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelTarget {
    /// Plain HTTP on `localhost:<port>`
    Http(u16),
    /// HTTPS on `localhost:<port>`, e.g. the dev proxy
    Https(u16),
}

impl From<u16> for TunnelTarget {
    fn from(port: u16) -> Self {
        TunnelTarget::Http(port)
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelTarget::Http(port) => write!(f, "{port}"),
            TunnelTarget::Https(port) => write!(f, "https://localhost:{port}"),
        }
    }
}

/// Fixed flags: HTTP tunnel, TLS at the provider, logfmt on stdout.
pub fn tunnel_args(target: TunnelTarget) -> Vec<String> {
    vec![
        "http".to_string(),
        "-bind-tls=true".to_string(),
        "-log=stdout".to_string(),
        "-log-format=logfmt".to_string(),
        target.to_string(),
    ]
}

/// Starts tunnel processes.
#[derive(Debug, Clone)]
pub struct TunnelManager {
    supervisor: Supervisor,
    binary: TunnelBinary,
}

impl TunnelManager {
    pub fn new(supervisor: Supervisor, binary: TunnelBinary) -> Self {
        Self { supervisor, binary }
    }

    /// Spawn a tunnel to `target`.
    ///
    /// Platform and binary checks happen before anything is spawned.
    pub fn connect(&self, target: impl Into<TunnelTarget>) -> Result<TunnelSession, TunnelError> {
        let target = target.into();
        let program = self.binary.resolve()?;
        let spec = CommandSpec::program(program, tunnel_args(target));
        let stream = self.supervisor.run(spec)?;

        let process = stream.process().clone();
        let cancel = stream.cancellation_token();
        let (url_tx, url_rx) = watch::channel(None);
        let (exit_tx, exit_rx) = watch::channel(None);
        tracing::info!(pid = process.pid, %target, "tunnel process started");
        tokio::spawn(watch_output(stream, url_tx, exit_tx));

        Ok(TunnelSession {
            target,
            process,
            url: url_rx,
            exit: exit_rx,
            cancel,
            emitted: false,
        })
    }
}

/// How the tunnel process ended; the error is the supervisor's message.
pub type TunnelExit = Result<ProcessExit, String>;

async fn watch_output(
    mut stream: pages_spawn::ProcessStream,
    url_tx: watch::Sender<Option<String>>,
    exit_tx: watch::Sender<Option<TunnelExit>>,
) {
    let mut detector = UrlDetector::new();
    while let Some(item) = stream.next().await {
        match detector.feed(&item.text) {
            Some(url) => {
                tracing::info!(%url, "tunnel established");
                url_tx.send_replace(Some(url));
            }
            None => tracing::trace!(line = %item.text, "tunnel output"),
        }
    }
    let exit = stream.wait().await.map_err(|e| e.to_string());
    tracing::debug!(pid = stream.pid(), ?exit, "tunnel process gone");
    exit_tx.send_replace(Some(exit));
}

/// A live tunnel.
///
/// Behaves as a stream of public URLs that yields at most one value and then
/// stays open until the tunnel process ends. Dropping the session terminates
/// the process.
pub struct TunnelSession {
    target: TunnelTarget,
    process: ManagedProcess,
    url: watch::Receiver<Option<String>>,
    exit: watch::Receiver<Option<TunnelExit>>,
    cancel: CancellationToken,
    emitted: bool,
}

impl TunnelSession {
    /// The public URL, once known. Never changes afterwards.
    pub fn public_url(&self) -> Option<String> {
        self.url.borrow().clone()
    }

    /// Next public URL.
    ///
    /// The first call resolves with the URL once the tunnel reports it.
    /// Later calls resolve with `None` only when the tunnel process is gone.
    pub async fn next(&mut self) -> Option<String> {
        if !self.emitted {
            let mut rx = self.url.clone();
            let url = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|url| (*url).clone());
            if url.is_some() {
                self.emitted = true;
            }
            return url;
        }
        let _ = self.closed().await;
        None
    }

    /// Resolves when the tunnel process has exited and been reaped.
    pub async fn closed(&self) -> TunnelExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit)
                .clone()
                .unwrap_or_else(|| Err("tunnel exit unknown".to_string())),
            Err(_) => Err("tunnel output task ended".to_string()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Terminate the tunnel process and wait until it is gone.
    pub async fn stop(&self) -> TunnelExit {
        self.cancel();
        self.closed().await
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("target", &self.target)
            .field("pid", &self.process.pid)
            .field("public_url", &self.public_url())
            .finish()
    }
}
