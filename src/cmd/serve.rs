//! HTTP server command: `agencyhub serve`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use agencyhub::config::load_effective;
use agencyhub::hub::server::start_server;
use agencyhub::logging::init_logging;

use super::resolve_in_project;

/// CLI flags that win over file and environment values.
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(
    project_dir: &Path,
    explicit_config: Option<&Path>,
    verbose: bool,
    overrides: ServeOverrides,
) -> Result<()> {
    let mut config = load_effective(project_dir, explicit_config)?;
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    config.server.dev_mode |= overrides.dev;
    config.server.db_path = resolve_in_project(project_dir, &config.server.db_path);
    if let Some(dir) = &config.logging.directory {
        config.logging.directory = Some(resolve_in_project(project_dir, dir));
    }

    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }

    let _guard = init_logging(&config.logging, verbose)?;
    start_server(config).await
}
