//! Platform-specific command invocation.
//!
//! On POSIX a command line runs through the user's shell with `-c`, after
//! sourcing the shell's rc file when one exists, so version managers set up
//! in shell startup files are honored. On Windows the command line is split
//! into program and arguments and spawned directly.

use std::path::{Path, PathBuf};

use crate::error::{ProcessError, Result};

/// Parent variable that must not leak into spawned toolchains.
pub(crate) const STRIPPED_ENV_VAR: &str = "PREFIX";

#[cfg(unix)]
const FALLBACK_SHELL: &str = "/bin/sh";

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// A shell command line, possibly with arguments and operators
    Shell(String),
    /// A program spawned directly with the given arguments
    Program { program: PathBuf, args: Vec<String> },
}

impl Invocation {
    pub fn display(&self) -> String {
        match self {
            Invocation::Shell(cmd) => cmd.clone(),
            Invocation::Program { program, args } => {
                let mut s = program.display().to_string();
                for a in args {
                    s.push(' ');
                    s.push_str(a);
                }
                s
            }
        }
    }
}

/// Build the tokio command for an invocation on the current platform.
pub(crate) fn build_command(invocation: &Invocation) -> Result<tokio::process::Command> {
    let mut cmd = match invocation {
        Invocation::Shell(line) => {
            if line.trim().is_empty() {
                return Err(ProcessError::EmptyCommand);
            }
            shell_command(line)?
        }
        Invocation::Program { program, args } => {
            if program.as_os_str().is_empty() {
                return Err(ProcessError::EmptyCommand);
            }
            let mut c = tokio::process::Command::new(program);
            c.args(args);
            c
        }
    };

    // New process group so cancellation can signal the whole tree.
    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

#[cfg(unix)]
fn shell_command(line: &str) -> Result<tokio::process::Command> {
    let shell = login_shell();
    let rc = dirs::home_dir().and_then(|home| rc_file_for_shell(&shell, &home));
    let mut c = tokio::process::Command::new(&shell);
    c.arg("-c").arg(shell_script(line, rc.as_deref()));
    Ok(c)
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Result<tokio::process::Command> {
    let mut parts = split_command_line(line)?.into_iter();
    let program = parts.next().ok_or(ProcessError::EmptyCommand)?;
    let mut c = tokio::process::Command::new(program);
    c.args(parts);
    Ok(c)
}

#[cfg(unix)]
fn login_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL))
}

/// The rc file a non-interactive `-c` invocation should source, if present.
pub(crate) fn rc_file_for_shell(shell: &Path, home: &Path) -> Option<PathBuf> {
    let name = shell.file_name()?.to_str()?;
    let rc = match name {
        "zsh" => home.join(".zshrc"),
        "bash" => home.join(".bashrc"),
        _ => home.join(".profile"),
    };
    rc.is_file().then_some(rc)
}

/// Script passed to `<shell> -c`.
pub(crate) fn shell_script(command: &str, rc: Option<&Path>) -> String {
    match rc {
        Some(rc) => format!(". {} >/dev/null 2>&1; {}", quote(&rc.to_string_lossy()), command),
        None => command.to_string(),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Split a command line into program and arguments with POSIX shell
/// quoting rules.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    shell_words::split(line).map_err(|source| ProcessError::CommandLine {
        command: line.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn split_command_line_handles_plain_words() {
        assert_eq!(
            split_command_line("npm run dev -- --port 3000").unwrap(),
            vec!["npm", "run", "dev", "--", "--port", "3000"]
        );
    }

    #[test]
    fn split_command_line_groups_quoted_words() {
        let line = r#""C:\Program Files\node.exe" build.js "a \"b\"" 'c d'"#;
        assert_eq!(
            split_command_line(line).unwrap(),
            vec![r"C:\Program Files\node.exe", "build.js", r#"a "b""#, "c d"]
        );
    }

    #[test]
    fn split_command_line_keeps_empty_quoted_argument() {
        assert_eq!(split_command_line(r#"echo """#).unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn split_command_line_empty_input() {
        assert!(split_command_line("   ").unwrap().is_empty());
    }

    #[test]
    fn split_command_line_rejects_unterminated_quote() {
        let err = split_command_line(r#"node "server.js"#).unwrap_err();
        assert!(matches!(err, ProcessError::CommandLine { .. }));
        assert!(err.is_spawn_failure());
    }

    #[test]
    fn shell_script_without_rc_is_command() {
        assert_eq!(shell_script("npm run dev", None), "npm run dev");
    }

    #[test]
    fn shell_script_sources_rc_first() {
        let script = shell_script("npm run dev", Some(Path::new("/home/me/.zshrc")));
        assert_eq!(script, ". '/home/me/.zshrc' >/dev/null 2>&1; npm run dev");
    }

    #[test]
    fn rc_file_requires_existing_file() {
        let home = TempDir::new().unwrap();
        assert!(rc_file_for_shell(Path::new("/bin/zsh"), home.path()).is_none());

        std::fs::write(home.path().join(".zshrc"), "export A=1\n").unwrap();
        assert_eq!(
            rc_file_for_shell(Path::new("/bin/zsh"), home.path()),
            Some(home.path().join(".zshrc"))
        );
        assert!(rc_file_for_shell(Path::new("/bin/bash"), home.path()).is_none());
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn empty_shell_command_is_rejected() {
        let err = build_command(&Invocation::Shell("  ".to_string())).unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommand));
    }

    #[test]
    fn program_invocation_display_joins_args() {
        let inv = Invocation::Program {
            program: PathBuf::from("/opt/ngrok"),
            args: vec!["http".to_string(), "3000".to_string()],
        };
        assert_eq!(inv.display(), "/opt/ngrok http 3000");
    }
}
