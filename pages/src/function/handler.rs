//! One sandboxed handler process per function request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pages_core::{FunctionRequest, FunctionResponse, LogItem};
use pages_spawn::{CommandSpec, ProcessError, ProcessStream, Supervisor};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HANDLER_COMMAND: &str = "node .sked/dev-handler.js";
/// Largest request body handed to a handler.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Receives log lines produced while serving requests.
pub type LogSink = Arc<dyn Fn(LogItem) + Send + Sync>;

/// Errors from a single handler invocation
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Function handler timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Failed to start function handler: {0}")]
    Spawn(#[source] ProcessError),

    #[error("Function handler returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to encode function request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> u16 {
        match self {
            HandlerError::Timeout(_) => 504,
            _ => 502,
        }
    }
}

/// How to run the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub command: String,
    pub working_directory: PathBuf,
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
    /// Larger request bodies are rejected with 413
    pub max_body_bytes: usize,
}

impl HandlerConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            command: DEFAULT_HANDLER_COMMAND.to_string(),
            working_directory: working_directory.into(),
            environment: HashMap::new(),
            timeout: Duration::from_secs(60),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Run the handler for one request.
///
/// The request goes to the child's stdin as one JSON line; the first stdout
/// line that looks like a JSON object is the response. Other output is
/// relayed to `logs` tagged `fn:`. On timeout the child is terminated and no
/// retry is made. Cancelling `parent` terminates the child as well.
pub async fn invoke(
    supervisor: &Supervisor,
    config: &HandlerConfig,
    request: &FunctionRequest,
    parent: &CancellationToken,
    logs: &LogSink,
) -> Result<FunctionResponse, HandlerError> {
    let mut input = serde_json::to_vec(request)?;
    input.push(b'\n');

    let spec = CommandSpec::shell(config.command.clone())
        .current_dir(&config.working_directory)
        .envs(config.environment.clone())
        .stdin(input);
    let mut stream = supervisor
        .run_with_cancel(spec, parent)
        .map_err(HandlerError::Spawn)?;

    match tokio::time::timeout(config.timeout, read_response(&mut stream, logs)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(pid = stream.pid(), path = %request.path, "function handler timed out");
            let _ = stream.stop().await;
            Err(HandlerError::Timeout(config.timeout))
        }
    }
}

async fn read_response(
    stream: &mut ProcessStream,
    logs: &LogSink,
) -> Result<FunctionResponse, HandlerError> {
    while let Some(item) = stream.next().await {
        let text = item.text.trim();
        if item.is_stderr() || !text.starts_with('{') {
            logs(item.tagged("fn"));
            continue;
        }
        return serde_json::from_str(text).map_err(|e| HandlerError::InvalidResponse(e.to_string()));
    }

    let reason = match stream.wait().await {
        Ok(_) => "handler exited without writing a response".to_string(),
        Err(e) => e.to_string(),
    };
    Err(HandlerError::InvalidResponse(reason))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn request(path: &str) -> FunctionRequest {
        FunctionRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<LogItem>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let sink: LogSink = Arc::new(move |item| sink_lines.lock().push(item));
        (sink, lines)
    }

    fn config(dir: &TempDir, command: &str, timeout: Duration) -> HandlerConfig {
        HandlerConfig {
            command: command.to_string(),
            timeout,
            ..HandlerConfig::new(dir.path())
        }
    }

    #[tokio::test]
    async fn request_line_in_response_line_out() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            concat!(
                r#"read -r line; case "$line" in "#,
                r#"*'"path":"/hello"'*) echo 'noise'; "#,
                r#"printf '%s\n' '{"status":201,"body":"created"}';; "#,
                r#"*) printf '%s\n' '{"status":500}';; esac"#,
            ),
            Duration::from_secs(10),
        );
        let (sink, lines) = collecting_sink();

        let resp = invoke(
            &Supervisor::default(),
            &config,
            &request("/hello"),
            &CancellationToken::new(),
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, "created");
        assert_eq!(lines.lock()[0].text, "fn: noise");
    }

    #[tokio::test]
    async fn timeout_kills_handler() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "sleep 100", Duration::from_millis(200));
        let supervisor = Supervisor::default();
        let (sink, _) = collecting_sink();

        let err = invoke(
            &supervisor,
            &config,
            &request("/slow"),
            &CancellationToken::new(),
            &sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, HandlerError::Timeout(_)));
        assert_eq!(err.status(), 504);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_response_relays_stderr_and_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "echo 'handler crashed' >&2", Duration::from_secs(10));
        let (sink, lines) = collecting_sink();

        let err = invoke(
            &Supervisor::default(),
            &config,
            &request("/"),
            &CancellationToken::new(),
            &sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, HandlerError::InvalidResponse(_)));
        assert_eq!(err.status(), 502);
        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "fn: handler crashed");
        assert!(lines[0].is_stderr());
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_response() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, r#"printf '%s\n' '{"status":"abc"}'"#, Duration::from_secs(10));
        let (sink, _) = collecting_sink();

        let err = invoke(
            &Supervisor::default(),
            &config,
            &request("/"),
            &CancellationToken::new(),
            &sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidResponse(_)));
    }
}
