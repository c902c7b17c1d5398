//! Project initialization: `taskhub init`.

use anyhow::{Context, Result};
use std::path::Path;

use taskhub::config::{TaskhubConfig, TaskhubToml};
use taskhub::hub::db::HubDb;

pub fn cmd_init(project_dir: &Path, config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| TaskhubConfig::default_path(project_dir));

    let created_config = if path.exists() {
        println!("Config already exists at {}", path.display());
        false
    } else {
        TaskhubToml::default().save(&path)?;
        println!("Created {}", path.display());
        true
    };

    let config = TaskhubConfig::load(project_dir, Some(&path))?;
    let db_path = project_dir.join(&config.toml.server.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    HubDb::new(&db_path)?;
    println!("Database ready at {}", db_path.display());

    if created_config {
        println!();
        println!("Next steps:");
        println!("  1. Edit {} (or set TASKHUB_* variables)", path.display());
        println!("  2. Run `taskhub serve` to start the hub");
        println!("  3. Run `taskhub watch` to follow activity live");
    }
    tracing::debug!(event = "init.done", config = %path.display(), db = %db_path.display());
    Ok(())
}
