//! Registry of live supervised processes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A running OS process under supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub pid: u32,
    /// Command line (or program and arguments) as it was requested
    pub command: String,
    pub working_directory: PathBuf,
    /// Variables set on top of the inherited environment
    pub environment: HashMap<String, String>,
}

struct Entry {
    process: ManagedProcess,
    cancel: CancellationToken,
}

/// Tracks every live managed process by pid.
///
/// Cloning yields another handle to the same registry. Inserting an already
/// present pid and removing an absent pid are both no-ops, so spawn, natural
/// exit and cancellation can race without double bookkeeping.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<u32, Entry>>>,
    /// Woken whenever the last entry is removed.
    drained: Arc<Notify>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process. Returns `false` if the pid was already present.
    pub fn insert(&self, process: ManagedProcess, cancel: CancellationToken) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&process.pid) {
            return false;
        }
        entries.insert(process.pid, Entry { process, cancel });
        true
    }

    /// Forget a process. Returns `false` if the pid was not registered.
    pub fn remove(&self, pid: u32) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries.remove(&pid).is_some();
        if removed && entries.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.lock().contains_key(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<ManagedProcess> {
        self.entries.lock().get(&pid).map(|e| e.process.clone())
    }

    /// Registered pids in ascending order.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.entries.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn processes(&self) -> Vec<ManagedProcess> {
        let mut out: Vec<ManagedProcess> = self
            .entries
            .lock()
            .values()
            .map(|e| e.process.clone())
            .collect();
        out.sort_by_key(|p| p.pid);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Ask every registered process to terminate.
    ///
    /// Entries are removed by their supervisors once the process is gone;
    /// use [`ProcessRegistry::shutdown`] to wait for that.
    pub fn terminate_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = self
            .entries
            .lock()
            .values()
            .map(|e| e.cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Wait until no process is registered, or `timeout` elapses.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a removal in between is not missed.
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Terminate everything and wait for the registry to drain.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let count = self.terminate_all();
        if count > 0 {
            tracing::info!(count, "terminating managed processes");
        }
        let drained = self.wait_until_empty(timeout).await;
        if !drained {
            tracing::warn!(
                remaining = ?self.pids(),
                "managed processes still registered after shutdown timeout"
            );
        }
        drained
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("pids", &self.pids())
            .finish()
    }
}
