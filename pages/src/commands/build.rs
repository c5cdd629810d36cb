use std::path::Path;
use std::time::Duration;

use pages_core::LogItem;
use pages_spawn::Supervisor;

use crate::config::GlobalConfig;
use crate::output;
use crate::project::{BOOTSTRAP_SCRIPT, COMPILE_SCRIPT, Project, ProjectService};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn bootstrap(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    run_script(dir, BOOTSTRAP_SCRIPT).await
}

pub async fn compile(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    run_script(dir, COMPILE_SCRIPT).await
}

async fn run_script(dir: &Path, script: &'static str) -> Result<(), Box<dyn std::error::Error>> {
    let config = GlobalConfig::load()?;
    let project = Project::load(dir, &config.dev)?;
    let supervisor = Supervisor::default();

    output::step(&format!("Running `{script}` for {}", project.name()));

    let mut on_line = |item: LogItem| output::log_line(&item);
    let mut shutdown = super::shutdown_signal();
    let result = tokio::select! {
        result = async {
            if script == BOOTSTRAP_SCRIPT {
                project.bootstrap(&supervisor, &mut on_line).await
            } else {
                project.compile(&supervisor, &mut on_line).await
            }
        } => result,
        _ = super::requested(&mut shutdown) => {
            output::muted("Interrupted");
            supervisor.registry().shutdown(SHUTDOWN_TIMEOUT).await;
            return Err(format!("`{script}` was interrupted").into());
        }
    };

    result?;
    output::success(&format!("`{script}` finished"));
    Ok(())
}
