//! Project services: one implementation, behaviour picked by project type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pages_core::{LogItem, ProjectType};
use pages_spawn::{CommandSpec, ProcessError, Supervisor};
use rustls::ServerConfig;
use thiserror::Error;

use crate::config::{ConfigError, DevConfig, PackageScripts, ProjectDescriptor};
use crate::function::{DEFAULT_HANDLER_COMMAND, HandlerConfig};
use crate::session::{
    DevSessionConfig, SessionDeps, SessionFlavor, SessionHandle, SessionIdentity, SessionTimings,
    start_dev_session,
};

pub const BOOTSTRAP_SCRIPT: &str = "bootstrap";
pub const COMPILE_SCRIPT: &str = "compile";
pub const DEV_SCRIPT: &str = "dev";

const DEFAULT_PACKAGE_MANAGER: &str = "npm";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("package.json has no `{0}` script")]
    MissingScript(&'static str),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} projects need TLS material for the dev proxy (run `pages certs`)")]
    MissingTls(ProjectType),
}

/// Everything a dev session needs beyond the project itself.
pub struct DevContext<'a> {
    pub deps: SessionDeps,
    pub dev: &'a DevConfig,
    /// Required for page projects
    pub tls: Option<Arc<ServerConfig>>,
}

/// What the CLI can do with a project.
#[async_trait]
pub trait ProjectService: Send + Sync {
    fn project_type(&self) -> ProjectType;

    /// Environment passed to every script.
    fn env(&self) -> HashMap<String, String>;

    /// Run the `bootstrap` script to completion.
    async fn bootstrap(
        &self,
        supervisor: &Supervisor,
        on_line: &mut (dyn FnMut(LogItem) + Send),
    ) -> Result<(), ProjectError>;

    /// Run the `compile` script to completion.
    async fn compile(
        &self,
        supervisor: &Supervisor,
        on_line: &mut (dyn FnMut(LogItem) + Send),
    ) -> Result<(), ProjectError>;

    /// Start a dev session around the `dev` script.
    fn start_dev(&self, ctx: DevContext<'_>) -> Result<SessionHandle, ProjectError>;
}

#[derive(Debug, Clone)]
pub struct Project {
    pub directory: PathBuf,
    pub descriptor: ProjectDescriptor,
    pub scripts: PackageScripts,
    /// Dev server port for pages, request-handler port for functions
    pub port: u16,
}

impl Project {
    pub fn load(directory: &Path, dev: &DevConfig) -> Result<Self, ProjectError> {
        let descriptor = ProjectDescriptor::load_from_dir(directory)?;
        let scripts = PackageScripts::load_from_dir(directory)?;
        let port = match descriptor.project_type {
            ProjectType::Function => dev.function_port,
            _ => dev.dev_server_port,
        };
        Ok(Self {
            directory: directory.to_path_buf(),
            descriptor,
            scripts,
            port,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn package_manager(&self) -> &str {
        self.descriptor
            .package_manager
            .as_deref()
            .filter(|pm| !pm.trim().is_empty())
            .unwrap_or(DEFAULT_PACKAGE_MANAGER)
    }

    /// `<package manager> run <script>` in the project directory.
    pub fn script_command(&self, script: &'static str) -> Result<CommandSpec, ProjectError> {
        if !self.scripts.has(script) {
            return Err(ProjectError::MissingScript(script));
        }
        Ok(
            CommandSpec::shell(format!("{} run {script}", self.package_manager()))
                .current_dir(&self.directory)
                .envs(self.env()),
        )
    }

    fn handler_config(&self, dev: &DevConfig) -> HandlerConfig {
        HandlerConfig {
            command: self
                .descriptor
                .handler
                .clone()
                .unwrap_or_else(|| DEFAULT_HANDLER_COMMAND.to_string()),
            environment: self.env(),
            timeout: dev.function_timeout(),
            ..HandlerConfig::new(&self.directory)
        }
    }

    async fn run_script(
        &self,
        script: &'static str,
        supervisor: &Supervisor,
        on_line: &mut (dyn FnMut(LogItem) + Send),
    ) -> Result<(), ProjectError> {
        let spec = self.script_command(script)?;
        tracing::info!(project = self.name(), script, "running script");
        supervisor.run_to_completion(spec, |item| on_line(item)).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectService for Project {
    fn project_type(&self) -> ProjectType {
        self.descriptor.project_type
    }

    fn env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("PORT".to_string(), self.port.to_string()),
            ("PAGES_PROJECT_NAME".to_string(), self.descriptor.name.clone()),
            (
                "PAGES_PROJECT_TYPE".to_string(),
                self.descriptor.project_type.as_str().to_string(),
            ),
        ])
    }

    async fn bootstrap(
        &self,
        supervisor: &Supervisor,
        on_line: &mut (dyn FnMut(LogItem) + Send),
    ) -> Result<(), ProjectError> {
        self.run_script(BOOTSTRAP_SCRIPT, supervisor, on_line).await
    }

    async fn compile(
        &self,
        supervisor: &Supervisor,
        on_line: &mut (dyn FnMut(LogItem) + Send),
    ) -> Result<(), ProjectError> {
        self.run_script(COMPILE_SCRIPT, supervisor, on_line).await
    }

    fn start_dev(&self, ctx: DevContext<'_>) -> Result<SessionHandle, ProjectError> {
        let compiler = self.script_command(DEV_SCRIPT)?;
        let project_type = self.project_type();
        let flavor = match project_type {
            ProjectType::WebPage | ProjectType::MobilePage => SessionFlavor::Proxy {
                listen_port: ctx.dev.proxy_port,
                tls: ctx.tls.ok_or(ProjectError::MissingTls(project_type))?,
            },
            ProjectType::Function => SessionFlavor::Function {
                listen_port: self.port,
                handler: self.handler_config(ctx.dev),
            },
            ProjectType::Library => SessionFlavor::CompilerOnly,
        };

        let config = DevSessionConfig {
            compiler,
            port: self.port,
            identity: SessionIdentity {
                name: self.descriptor.name.clone(),
                project_type,
                metadata: self.descriptor.metadata.clone(),
            },
            flavor,
            timings: SessionTimings::from(ctx.dev),
        };
        tracing::info!(
            project = self.name(),
            %project_type,
            port = self.port,
            "starting dev session"
        );
        Ok(start_dev_session(config, ctx.deps))
    }
}
