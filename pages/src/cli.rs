use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

use crate::commands;

/// Pages - Connected Pages development tools
#[derive(Parser)]
#[command(name = "pages")]
#[command(version, disable_version_flag = true)]
#[command(about = "Pages - Connected Pages development tools")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Show version
    #[arg(long, global = true)]
    pub version: bool,

    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a dev session: watch-mode compiler, local proxy or function
    /// server, public tunnel and remote registration
    Dev {
        /// Project directory (defaults to current directory)
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Port the project's dev server (or function server) listens on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the project's `bootstrap` script
    Bootstrap {
        /// Project directory (defaults to current directory)
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Run the project's `compile` script
    Compile {
        /// Project directory (defaults to current directory)
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Generate the local TLS certificate used by the dev proxy
    Certs {
        /// Replace existing certificate files
        #[arg(long)]
        force: bool,
    },
}

fn project_dir(dir: Option<PathBuf>) -> std::io::Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir(),
    }
}

impl Cli {
    pub fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        if self.version {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let Some(command) = self.command else {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        };

        match command {
            Commands::Dev { dir, port } => {
                let dir = project_dir(dir)?;
                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(commands::dev::run(&dir, port))
            }
            Commands::Bootstrap { dir } => {
                let dir = project_dir(dir)?;
                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(commands::build::bootstrap(&dir))
            }
            Commands::Compile { dir } => {
                let dir = project_dir(dir)?;
                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(commands::build::compile(&dir))
            }
            Commands::Certs { force } => commands::certs::run(force),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_parses_dir_and_port() {
        let cli = Cli::try_parse_from(["pages", "dev", "./site", "--port", "5173"]).unwrap();
        let Some(Commands::Dev { dir, port }) = cli.command else {
            panic!("expected Dev");
        };
        assert_eq!(dir, Some(PathBuf::from("./site")));
        assert_eq!(port, Some(5173));
    }

    #[test]
    fn dev_defaults_to_current_directory() {
        let cli = Cli::try_parse_from(["pages", "dev"]).unwrap();
        let Some(Commands::Dev { dir, port }) = cli.command else {
            panic!("expected Dev");
        };
        assert!(dir.is_none());
        assert!(port.is_none());
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::try_parse_from(["pages", "compile", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Some(Commands::Compile { .. })));
    }

    #[test]
    fn certs_accepts_force() {
        let cli = Cli::try_parse_from(["pages", "certs", "--force"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Certs { force: true })));
    }

    #[test]
    fn port_must_be_a_valid_port() {
        assert!(Cli::try_parse_from(["pages", "dev", "--port", "70000"]).is_err());
    }

    #[test]
    fn version_flag_needs_no_command() {
        let cli = Cli::try_parse_from(["pages", "--version"]).unwrap();
        assert!(cli.version);
        assert!(cli.command.is_none());
    }
}
