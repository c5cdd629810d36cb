use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pages_core::ProjectType;
use pages_dev_proxy::{TlsFiles, server_config};
use pages_spawn::Supervisor;
use rustls::ServerConfig;

use crate::api::{ApiClient, DevSessionApi};
use crate::config::GlobalConfig;
use crate::output;
use crate::paths;
use crate::project::{DevContext, Project, ProjectService};
use crate::session::{SessionDeps, SessionEvent};
use crate::tunnel::{TunnelBinary, TunnelManager};

/// Time left for stray children after the session itself has stopped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(dir: &Path, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let config = GlobalConfig::load()?;
    let mut project = Project::load(dir, &config.dev)?;
    if let Some(port) = port {
        project = project.with_port(port);
    }
    let project_type = project.project_type();

    // Preconditions, checked before anything is spawned.
    let tls = match project_type {
        ProjectType::WebPage | ProjectType::MobilePage => Some(load_tls()?),
        ProjectType::Function | ProjectType::Library => None,
    };
    let api: Option<Arc<dyn DevSessionApi>> = if project_type.is_tunneled() {
        Some(Arc::new(ApiClient::from_config(&config.api)?))
    } else {
        None
    };

    let supervisor = Supervisor::default();
    let tunnels = TunnelManager::new(
        supervisor.clone(),
        TunnelBinary {
            binary: config.tunnel.binary.clone(),
            assets_dir: config.tunnel.assets_dir.clone(),
        },
    );

    output::step(&format!(
        "Starting dev session for {} ({project_type}) on port {}",
        project.name(),
        project.port
    ));
    if output::is_verbose() {
        output::muted(&format!("Project directory: {}", project.directory.display()));
    }

    let mut session = project.start_dev(DevContext {
        deps: SessionDeps {
            supervisor: supervisor.clone(),
            api,
            tunnels,
        },
        dev: &config.dev,
        tls,
    })?;

    let mut public_url = session.public_url_watch();
    let mut announced = false;
    let mut shutdown = super::shutdown_signal();
    let mut stopping = false;

    loop {
        tokio::select! {
            event = session.next() => match event {
                Some(SessionEvent::Log(item)) => output::log_line(&item),
                Some(SessionEvent::Error(e)) => output::warning(&e.to_string()),
                None => break,
            },
            Ok(()) = public_url.changed(), if !announced => {
                let url = public_url.borrow_and_update().clone();
                if let Some(url) = url {
                    output::success(&format!("Available at {url}"));
                    announced = true;
                }
            }
            _ = super::requested(&mut shutdown), if !stopping => {
                stopping = true;
                output::muted("Stopping dev session...");
                session.cancel();
            }
        }
    }

    let result = session.finish().await;
    if !supervisor.registry().shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!(
            remaining = ?supervisor.registry().pids(),
            "processes still running after shutdown"
        );
    }

    match result {
        Ok(()) => {
            output::success("Dev session stopped");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(error = %e, "dev session failed");
            Err("dev session ended with an error".into())
        }
    }
}

fn load_tls() -> Result<Arc<ServerConfig>, Box<dyn std::error::Error>> {
    let files = TlsFiles::in_dir(&paths::certs_dir()?);
    let pair = files.load()?;
    Ok(server_config(&pair)?)
}
