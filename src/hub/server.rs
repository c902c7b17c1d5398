use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, GitHubSettings, SharedState};
use super::db::{DbHandle, HubDb};
use super::ws::{ActivityHub, StompSettings};

/// Broadcast buffer for the activity hub. Slow sockets past this lag skip
/// messages instead of holding the channel.
const HUB_CAPACITY: usize = 256;

/// Configuration for the hub server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server.
    pub dev_mode: bool,
    pub stomp: StompSettings,
    pub github: GitHubSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from(".taskhub/taskhub.db"),
            dev_mode: false,
            stomp: StompSettings::default(),
            github: GitHubSettings::default(),
        }
    }
}

/// Build the full application router: REST API, `/ws` and request tracing.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database and assemble shared state, restoring a previously
/// stored GitHub token.
pub async fn build_state(config: &ServerConfig) -> Result<SharedState> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = HubDb::new(&config.db_path).context("Failed to initialize hub database")?;
    let state = AppState::new(
        DbHandle::new(db),
        ActivityHub::new(HUB_CAPACITY),
        config.stomp.clone(),
        config.github.clone(),
    );

    let stored = state.db.call(|db| db.get_setting("github_token")).await?;
    if stored.is_some() {
        tracing::info!(event = "github.token_restored");
    }
    if let Ok(mut token) = state.github_token.lock() {
        *token = stored;
    }
    Ok(Arc::new(state))
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Start the hub server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config).await?;
    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(
        event = "server.started",
        addr = %local_addr,
        db = %config.db_path.display(),
        auth = config.stomp.auth_token.is_some(),
        webhook = config.github.webhook_secret.is_some(),
    );
    println!("taskhub running at http://{}", local_addr);

    serve(listener, app, shutdown_signal()).await?;

    tracing::info!(event = "server.stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!(event = "server.shutdown_requested");
}
