//! Live dashboard in the terminal: `taskhub watch`.
//!
//! Shows the connection badge, one line per activity and the dashboard
//! stats each time the debounced invalidation refetches them. Type `r`
//! then Enter to force a reconnect, `m` to mark the feed read.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use taskhub::config::TaskhubConfig;
use taskhub::realtime::{
    ActivityEvent, ConnectionManager, ConnectionState, DashboardSession, HttpQueryCache, QueryKey,
    StatusIndicator, TungsteniteTransport,
};
use taskhub_common::{MessageType, Topic};

#[derive(Debug, Default)]
pub struct WatchOverrides {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub projects: Vec<i64>,
    pub token: Option<String>,
}

pub async fn cmd_watch(
    project_dir: &Path,
    config_path: Option<&Path>,
    overrides: WatchOverrides,
) -> Result<()> {
    let mut toml = TaskhubConfig::load(project_dir, config_path)?.toml;
    if overrides.url.is_some() {
        toml.realtime.url = overrides.url;
    }
    if overrides.api_url.is_some() {
        toml.realtime.api_base_url = overrides.api_url;
    }
    if overrides.token.is_some() {
        toml.realtime.auth_token = overrides.token;
    }
    for id in overrides.projects {
        if !toml.realtime.project_ids.contains(&id) {
            toml.realtime.project_ids.push(id);
        }
    }

    let realtime = toml.realtime_config();
    let topics = toml.topics();
    println!(
        "{} {} ({})",
        style("Watching").bold().cyan(),
        realtime.url,
        topics
            .iter()
            .map(Topic::destination)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let cache = Arc::new(HttpQueryCache::new(toml.api_origin()));
    let connection = ConnectionManager::spawn(realtime, topics, TungsteniteTransport);
    let mut transitions = connection.transitions();
    let mut events = connection.events();
    let mut refreshed = cache.subscribe();
    let session = DashboardSession::start(connection, cache.clone(), toml.session_options());

    let mut indicator = StatusIndicator::new();
    if let Some(label) = indicator.update(session.connection().state()) {
        println!("{}", render_status(session.connection().state(), label));
    }
    if cache.refresh(QueryKey::DashboardStats).await
        && let Some(stats) = cache.get(QueryKey::DashboardStats).await
    {
        println!("{}", render_stats(&stats.data));
    }

    session.connection().connect().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            transition = transitions.recv() => match transition {
                Ok(t) => {
                    if let Some(label) = indicator.update(t.to) {
                        println!("{}", render_status(t.to, label));
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => println!("{}", render_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    println!("{}", style(format!("... {} events skipped", skipped)).dim());
                }
                Err(RecvError::Closed) => break,
            },
            key = refreshed.recv() => {
                if let Ok(QueryKey::DashboardStats) = key
                    && let Some(stats) = cache.get(QueryKey::DashboardStats).await
                {
                    println!("{}", render_stats(&stats.data));
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "r" => session.connection().force_reconnect().await,
                    "m" => session.mark_as_read().await,
                    "" => {}
                    other => println!("{}", style(format!("unknown key '{}': r = reconnect, m = mark read", other)).dim()),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    session.shutdown().await;
    println!("{}", style("Stopped.").dim());
    Ok(())
}

fn render_status(state: ConnectionState, label: &str) -> String {
    let badge = match state {
        ConnectionState::Connected => style(format!("● {}", label)).green().bold(),
        ConnectionState::Connecting => style(format!("◌ {}", label)).yellow(),
        ConnectionState::Disconnected => style(format!("○ {}", label)).dim(),
        ConnectionState::Error => style(format!("✗ {}", label)).red().bold(),
    };
    badge.to_string()
}

fn render_event(event: &ActivityEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S");
    let kind = match event.message_type {
        MessageType::Notification => style("notice").magenta(),
        MessageType::TeamUpdate => style("team").blue(),
        _ => style("activity").cyan(),
    };
    let text = event
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| event.payload.to_string());
    format!("{} {} {}", style(time).dim(), kind, text)
}

fn render_stats(stats: &serde_json::Value) -> String {
    let field = |name: &str| stats.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    format!(
        "{} projects {} · tasks {} · overdue {} · members {} · pending invites {}",
        style("Dashboard").bold(),
        field("total_projects"),
        field("total_tasks"),
        field("overdue_tasks"),
        field("team_members"),
        field("pending_invitations"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_common::WireMessage;

    #[test]
    fn test_render_stats_tolerates_missing_fields() {
        console::set_colors_enabled(false);
        let line = render_stats(&serde_json::json!({"total_projects": 2, "total_tasks": 5}));
        assert!(line.contains("projects 2"));
        assert!(line.contains("tasks 5"));
        assert!(line.contains("overdue 0"));
    }

    #[test]
    fn test_render_event_prefers_message() {
        console::set_colors_enabled(false);
        let event = ActivityEvent::from_wire(
            "/topic/activities/global",
            WireMessage::new(
                MessageType::ActivityUpdate,
                serde_json::json!({"message": "Task 'Ship it' created"}),
            ),
        );
        let line = render_event(&event);
        assert!(line.contains("activity"));
        assert!(line.ends_with("Task 'Ship it' created"));
    }
}
