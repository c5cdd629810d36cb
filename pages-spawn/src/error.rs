use std::process::ExitStatus;
use thiserror::Error;

/// Errors from spawning or supervising a child process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Exited { command: String, status: ExitStatus },

    #[error("Failed to wait for `{0}`")]
    Wait(String),

    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to parse `{command}`: {source}")]
    CommandLine {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("Failed to resolve working directory: {0}")]
    WorkingDirectory(std::io::Error),
}

impl ProcessError {
    /// True when the OS could not start the process at all.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            ProcessError::Spawn { .. }
                | ProcessError::EmptyCommand
                | ProcessError::CommandLine { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;
