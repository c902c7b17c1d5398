//! Hub server command: `taskhub serve`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use taskhub::config::TaskhubConfig;

/// Flags that win over the file and the environment.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(
    project_dir: &Path,
    config_path: Option<&Path>,
    overrides: ServeOverrides,
) -> Result<()> {
    let config = TaskhubConfig::load(project_dir, config_path)?;
    for warning in config.toml.validate() {
        tracing::warn!(event = "config.warning", warning = %warning);
    }

    let mut server = config.toml.server_config();
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= overrides.dev;
    // Relative database paths are anchored at the project directory.
    server.db_path = project_dir.join(&server.db_path);

    taskhub::hub::server::start_server(server).await
}
