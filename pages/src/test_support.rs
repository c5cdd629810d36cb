//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pages_core::{DevSessionStart, DevSessionStop};
use parking_lot::Mutex;

use crate::api::{ApiError, DevSessionApi};

/// Write an executable stand-in for the tunnel binary that prints `lines`
/// and then either sleeps (`keep_alive`) or exits 0.
///
/// The arguments it was started with are written next to it, see
/// [`fake_tunnel_args`].
#[cfg(unix)]
pub fn fake_tunnel_binary(dir: &Path, lines: &[&str], keep_alive: bool) -> PathBuf {
    let tail = if keep_alive { "exec sleep 100\n" } else { "" };
    write_fake_tunnel(dir, lines, tail)
}

/// Like [`fake_tunnel_binary`], but stays up until `marker` exists and then
/// exits 0.
#[cfg(unix)]
pub fn fake_tunnel_binary_until(dir: &Path, lines: &[&str], marker: &Path) -> PathBuf {
    let tail = format!(
        "while [ ! -f {} ]; do sleep 0.05; done\n",
        quote(&marker.to_string_lossy())
    );
    write_fake_tunnel(dir, lines, &tail)
}

/// Arguments the last fake tunnel in `dir` was started with.
#[cfg(unix)]
pub fn fake_tunnel_args(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("fake-ngrok.args"))
        .unwrap()
        .trim()
        .to_string()
}

#[cfg(unix)]
fn write_fake_tunnel(dir: &Path, lines: &[&str], tail: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let args = dir.join("fake-ngrok.args");
    let mut script = format!(
        "#!/bin/sh\nprintf '%s\\n' \"$*\" > {}\n",
        quote(&args.to_string_lossy())
    );
    for line in lines {
        script.push_str(&format!("printf '%s\\n' {}\n", quote(line)));
    }
    script.push_str(tail);
    let path = dir.join("fake-ngrok");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// In-memory [`DevSessionApi`] that records calls and replays scripted
/// outcomes for `start_session` (success once the script runs out).
#[derive(Clone, Default)]
pub struct MockApi {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    start_outcomes: VecDeque<bool>,
    starts: Vec<DevSessionStart>,
    stops: Vec<DevSessionStop>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` = success, `false` = failure, consumed one per start call.
    pub fn with_start_outcomes(outcomes: &[bool]) -> Self {
        let api = Self::default();
        api.inner.lock().start_outcomes = outcomes.iter().copied().collect();
        api
    }

    pub fn start_calls(&self) -> usize {
        self.inner.lock().starts.len()
    }

    pub fn starts(&self) -> Vec<DevSessionStart> {
        self.inner.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<DevSessionStop> {
        self.inner.lock().stops.clone()
    }
}

#[async_trait]
impl DevSessionApi for MockApi {
    async fn start_session(&self, session: &DevSessionStart) -> Result<(), ApiError> {
        let mut state = self.inner.lock();
        state.starts.push(session.clone());
        match state.start_outcomes.pop_front() {
            Some(false) => Err(ApiError::Status {
                path: "/pkgr/dev/start-session",
                status: 503,
                body: "unavailable".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn stop_session(&self, session: &DevSessionStop) -> Result<(), ApiError> {
        self.inner.lock().stops.push(session.clone());
        Ok(())
    }
}
