//! Configuration view and validation commands: `taskhub config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    config_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    use taskhub::config::{TaskhubConfig, TaskhubToml};

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| TaskhubConfig::default_path(project_dir));

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = TaskhubConfig::load(project_dir, Some(&path))?;

            println!();
            println!("Taskhub Configuration");
            println!("=====================");
            println!();
            if config.file_exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No taskhub.toml found at {}", path.display());
                println!("Using defaults. Run 'taskhub config init' to create one.");
            }
            println!();

            let rendered = toml::to_string_pretty(&redacted(&config.toml))
                .context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
            println!("Resolved:");
            println!("  websocket_url = \"{}\"", config.toml.resolve_ws_url());
            println!("  api_origin = \"{}\"", config.toml.api_origin());
            let topics: Vec<String> = config.toml.topics().iter().map(|t| t.destination()).collect();
            println!("  topics = {:?}", topics);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !path.exists() {
                println!("No taskhub.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = TaskhubToml::load(&path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("taskhub.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            TaskhubToml::default().save(&path)?;

            println!("Created taskhub.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, auth_token");
            println!("  - [github] webhook_secret, client_id, client_secret");
            println!("  - [realtime] url, api_base_url, reconnect and heartbeat settings");
            println!("  - [dashboard] debounce_ms, debounce_mode, read_policy");
            println!();
        }
    }

    Ok(())
}

/// Copy of `toml` with secrets masked for display.
fn redacted(toml: &taskhub::config::TaskhubToml) -> taskhub::config::TaskhubToml {
    let mask = |value: &Option<String>| value.as_ref().map(|_| "********".to_string());
    let mut shown = toml.clone();
    shown.server.auth_token = mask(&toml.server.auth_token);
    shown.realtime.auth_token = mask(&toml.realtime.auth_token);
    shown.github.client_secret = mask(&toml.github.client_secret);
    shown.github.webhook_secret = mask(&toml.github.webhook_secret);
    shown
}
