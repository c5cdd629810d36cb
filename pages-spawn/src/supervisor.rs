//! Process supervisor - spawns and monitors child processes

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use pages_core::{LogItem, LogKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessError, Result};
use crate::registry::{ManagedProcess, ProcessRegistry};
use crate::shell::{self, Invocation, STRIPPED_ENV_VAR};
use crate::signal;

const LOG_CHANNEL_CAPACITY: usize = 1024;
/// Time a cancelled process gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Time output readers get to flush after a natural exit. Background
/// grandchildren can keep the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
/// Longest line relayed as one item. Longer lines arrive in pieces.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// What to run, where, and with which extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub invocation: Invocation,
    /// Defaults to the caller's current directory
    pub working_directory: Option<PathBuf>,
    /// Merged over the inherited environment
    pub environment: HashMap<String, String>,
    /// Written to the child's stdin, which is then closed. Without it the
    /// child gets a null stdin.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// A shell command line such as `npm run dev`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            invocation: Invocation::Shell(command.into()),
            working_directory: None,
            environment: HashMap::new(),
            stdin: None,
        }
    }

    /// A program spawned directly, without a shell.
    pub fn program<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            invocation: Invocation::Program {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            working_directory: None,
            environment: HashMap::new(),
            stdin: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.environment.insert(k.into(), v.into());
        }
        self
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own
    Exited(ExitStatus),
    /// The process was terminated because its stream was cancelled.
    /// `None` when the status could not be collected.
    Cancelled(Option<ExitStatus>),
}

#[derive(Debug, Clone)]
enum ExitState {
    Running,
    Done(ProcessExit),
    WaitFailed,
}

/// Spawns supervised processes and records them in a [`ProcessRegistry`].
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    registry: ProcessRegistry,
}

impl Supervisor {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Spawn a process and return its log stream.
    pub fn run(&self, spec: CommandSpec) -> Result<ProcessStream> {
        self.run_with_cancel(spec, &CancellationToken::new())
    }

    /// Spawn a process whose lifetime is also bounded by `parent`.
    ///
    /// Cancelling `parent` terminates the process. Cancelling the returned
    /// stream (or the registry terminating it) does not cancel `parent`.
    pub fn run_with_cancel(
        &self,
        spec: CommandSpec,
        parent: &CancellationToken,
    ) -> Result<ProcessStream> {
        let command = spec.invocation.display();
        let working_directory = match spec.working_directory {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(ProcessError::WorkingDirectory)?,
        };

        let mut cmd = shell::build_command(&spec.invocation)?;
        cmd.current_dir(&working_directory)
            .env_remove(STRIPPED_ENV_VAR)
            .envs(&spec.environment)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(ProcessError::Wait(command));
        };
        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(pid, error = %e, "failed to write process stdin");
                }
            });
        }

        let process = ManagedProcess {
            pid,
            command,
            working_directory,
            environment: spec.environment,
        };
        let cancel = parent.child_token();
        self.registry.insert(process.clone(), cancel.clone());
        tracing::info!(pid, command = %process.command, "spawned process");

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stop_reading = cancel.child_token();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(relay_lines(
                stdout,
                LogKind::Stdout,
                tx.clone(),
                stop_reading.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(relay_lines(
                stderr,
                LogKind::Stderr,
                tx.clone(),
                stop_reading.clone(),
            )));
        }
        drop(tx);

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        tokio::spawn(supervise(
            child,
            process.clone(),
            self.registry.clone(),
            cancel.clone(),
            stop_reading,
            readers,
            exit_tx,
        ));

        Ok(ProcessStream {
            process,
            lines: rx,
            exit: exit_rx,
            cancel,
        })
    }

    /// Run a process to completion, handing every line to `on_line`.
    ///
    /// Non-zero exit is returned as [`ProcessError::Exited`].
    pub async fn run_to_completion<F>(
        &self,
        spec: CommandSpec,
        mut on_line: F,
    ) -> Result<ExitStatus>
    where
        F: FnMut(LogItem),
    {
        let mut stream = self.run(spec)?;
        while let Some(item) = stream.next().await {
            on_line(item);
        }
        match stream.wait().await? {
            ProcessExit::Exited(status) => Ok(status),
            ProcessExit::Cancelled(_) => Err(ProcessError::Wait(stream.process.command.clone())),
        }
    }
}

/// Live output of one supervised process.
///
/// Dropping the stream cancels it, which terminates the process if it is
/// still running.
pub struct ProcessStream {
    process: ManagedProcess,
    lines: mpsc::Receiver<LogItem>,
    exit: watch::Receiver<ExitState>,
    cancel: CancellationToken,
}

impl ProcessStream {
    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    /// Next output line, in emission order per stream.
    ///
    /// Returns `None` once both output pipes are closed or the stream has
    /// been cancelled; no line is delivered after cancellation.
    pub async fn next(&mut self) -> Option<LogItem> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.lines.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Exit of the process, if it has already been observed.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        match &*self.exit.borrow() {
            ExitState::Done(exit) => Some(*exit),
            _ => None,
        }
    }

    /// Wait for the process to be gone and removed from the registry.
    pub async fn wait(&self) -> Result<ProcessExit> {
        let mut rx = self.exit.clone();
        let state = rx
            .wait_for(|s| !matches!(s, ExitState::Running))
            .await
            .map(|s| (*s).clone());
        match state {
            Ok(ExitState::Done(ProcessExit::Exited(status))) if !status.success() => {
                Err(ProcessError::Exited {
                    command: self.process.command.clone(),
                    status,
                })
            }
            Ok(ExitState::Done(exit)) => Ok(exit),
            _ => Err(ProcessError::Wait(self.process.command.clone())),
        }
    }

    /// Cancel and wait for termination.
    pub async fn stop(&self) -> Result<ProcessExit> {
        self.cancel();
        self.wait().await
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ProcessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStream")
            .field("process", &self.process)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn supervise(
    mut child: Child,
    process: ManagedProcess,
    registry: ProcessRegistry,
    cancel: CancellationToken,
    stop_reading: CancellationToken,
    mut readers: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<ExitState>,
) {
    let pid = process.pid;
    let state = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                tracing::debug!(pid, %status, "process exited");
                ExitState::Done(ProcessExit::Exited(status))
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to wait for process");
                ExitState::WaitFailed
            }
        },
        _ = cancel.cancelled() => ExitState::Done(terminate(&mut child, pid).await),
    };

    let drain = async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    };
    if timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!(pid, "output still open after exit; detaching readers");
        stop_reading.cancel();
    }

    registry.remove(pid);
    exit_tx.send_replace(state);
}

/// Terminate a cancelled child.
///
/// A child that already exited is never signalled: its pid may have been
/// reaped and reused.
async fn terminate(child: &mut Child, pid: u32) -> ProcessExit {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(pid, %status, "process already exited before cancellation");
            return ProcessExit::Cancelled(Some(status));
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(pid, error = %e, "try_wait failed"),
    }

    tracing::info!(pid, "terminating process");
    if let Err(e) = signal::terminate_tree(pid).await {
        tracing::debug!(pid, error = %e, "terminate signal failed");
    }

    if let Ok(Ok(status)) = timeout(KILL_GRACE, child.wait()).await {
        return ProcessExit::Cancelled(Some(status));
    }

    tracing::warn!(pid, "process ignored terminate signal; killing");
    if let Ok(None) = child.try_wait()
        && let Err(e) = signal::kill_tree(pid).await
    {
        tracing::debug!(pid, error = %e, "kill signal failed");
    }
    let _ = child.start_kill();
    ProcessExit::Cancelled(child.wait().await.ok())
}

async fn relay_lines<R>(
    reader: R,
    kind: LogKind,
    tx: mpsc::Sender<LogItem>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut line = (&mut reader).take(MAX_LINE_BYTES);
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = line.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
                let sent = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = tx.send(LogItem { kind, text }) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, stream = %kind, "failed to read process output");
                break;
            }
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_line_ending_strips_lf_and_crlf() {
        assert_eq!(trim_line_ending(b"ready\n"), b"ready");
        assert_eq!(trim_line_ending(b"ready\r\n"), b"ready");
        assert_eq!(trim_line_ending(b"partial"), b"partial");
    }

    #[test]
    fn command_spec_builder_merges_env() {
        let spec = CommandSpec::shell("npm run dev")
            .current_dir("/work")
            .env("PORT", "3000")
            .envs([("A", "1"), ("PORT", "4000")]);
        assert_eq!(spec.working_directory, Some(PathBuf::from("/work")));
        assert_eq!(spec.environment.get("PORT").map(String::as_str), Some("4000"));
        assert_eq!(spec.environment.get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_immediately() {
        let supervisor = Supervisor::default();
        let err = supervisor
            .run(CommandSpec::program(
                "/definitely/not/a/real/binary",
                Vec::<String>::new(),
            ))
            .unwrap_err();
        assert!(err.is_spawn_failure(), "unexpected error: {err}");
        assert!(supervisor.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relays_stdout_and_stderr_with_kinds() {
        let supervisor = Supervisor::default();
        let mut stream = supervisor
            .run(CommandSpec::program(
                "sh",
                ["-c", "echo one; echo two 1>&2; echo three"],
            ))
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(item) = stream.next().await {
            match item.kind {
                LogKind::Stdout => stdout.push(item.text),
                LogKind::Stderr => stderr.push(item.text),
            }
        }
        assert_eq!(stdout, vec!["one", "three"]);
        assert_eq!(stderr, vec!["two"]);

        let exit = stream.wait().await.unwrap();
        assert!(matches!(exit, ProcessExit::Exited(s) if s.success()));
        assert!(supervisor.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let supervisor = Supervisor::default();
        let stream = supervisor
            .run(CommandSpec::program("sh", ["-c", "exit 3"]))
            .unwrap();
        let err = stream.wait().await.unwrap_err();
        assert!(matches!(err, ProcessError::Exited { status, .. } if status.code() == Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn strips_prefix_and_merges_environment() {
        // SAFETY: test-only env mutation; no other test reads PREFIX.
        unsafe { std::env::set_var("PREFIX", "/should/not/leak") };
        let supervisor = Supervisor::default();
        let mut stream = supervisor
            .run(
                CommandSpec::program("sh", ["-c", "echo \"${PREFIX:-none}:$PAGES_TEST_VAR\""])
                    .env("PAGES_TEST_VAR", "merged"),
            )
            .unwrap();
        let item = stream.next().await.unwrap();
        unsafe { std::env::remove_var("PREFIX") };
        assert_eq!(item.text, "none:merged");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_requested_working_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let supervisor = Supervisor::default();
        let mut lines = Vec::new();
        supervisor
            .run_to_completion(
                CommandSpec::program("pwd", Vec::<String>::new()).current_dir(dir.path()),
                |item| lines.push(item.text),
            )
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(&lines[0]).canonicalize().unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelling_parent_token_terminates_process() {
        let supervisor = Supervisor::default();
        let parent = CancellationToken::new();
        let stream = supervisor
            .run_with_cancel(CommandSpec::program("sleep", ["100"]), &parent)
            .unwrap();
        assert_eq!(supervisor.registry().len(), 1);

        parent.cancel();
        let exit = stream.wait().await.unwrap();
        assert!(matches!(exit, ProcessExit::Cancelled(_)));
        assert!(supervisor.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn registry_termination_does_not_cancel_parent() {
        let supervisor = Supervisor::default();
        let parent = CancellationToken::new();
        let stream = supervisor
            .run_with_cancel(CommandSpec::program("sleep", ["100"]), &parent)
            .unwrap();

        supervisor.registry().terminate_all();
        stream.wait().await.unwrap();
        assert!(!parent.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overlong_lines_are_split() {
        let supervisor = Supervisor::default();
        let mut lines = Vec::new();
        supervisor
            .run_to_completion(
                CommandSpec::program("sh", ["-c", "head -c 100000 /dev/zero | tr '\\0' a; echo"]),
                |item| lines.push(item.text),
            )
            .await
            .unwrap();
        let lengths: Vec<usize> = lines.iter().map(String::len).collect();
        assert_eq!(lengths, vec![65536, 100000 - 65536]);
        assert!(lines.iter().all(|l| l.bytes().all(|b| b == b'a')));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_bytes_are_delivered_then_closed() {
        let supervisor = Supervisor::default();
        let mut lines = Vec::new();
        supervisor
            .run_to_completion(
                CommandSpec::program("cat", Vec::<String>::new()).stdin("first\nsecond\n"),
                |item| lines.push(item.text),
            )
            .await
            .unwrap();
        assert_eq!(lines, vec!["first", "second"]);
    }
}
