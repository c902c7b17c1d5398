use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};

/// Cached dashboard queries that a new activity invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    DashboardStats,
    DashboardProjects,
    DashboardTasks,
}

impl QueryKey {
    pub const DASHBOARD: [QueryKey; 3] = [
        QueryKey::DashboardStats,
        QueryKey::DashboardProjects,
        QueryKey::DashboardTasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DashboardStats => "dashboard.stats",
            Self::DashboardProjects => "dashboard.projects",
            Self::DashboardTasks => "dashboard.tasks",
        }
    }

    /// REST path the query is served from.
    pub fn path(&self) -> &'static str {
        match self {
            Self::DashboardStats => "/api/dashboard/stats",
            Self::DashboardProjects => "/api/dashboard/projects",
            Self::DashboardTasks => "/api/dashboard/tasks",
        }
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The query-cache collaborator. Invalidation is fire-and-forget: refetch
/// failures stay inside the cache.
#[async_trait]
pub trait QueryCache: Send + Sync + 'static {
    async fn invalidate(&self, keys: &[QueryKey]);
}

#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub data: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    /// Set on invalidation, cleared by a successful refetch.
    pub stale: bool,
}

/// Per-request limit for dashboard fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Query cache backed by the hub's dashboard endpoints.
pub struct HttpQueryCache {
    client: reqwest::Client,
    base_url: String,
    entries: RwLock<HashMap<QueryKey, CachedQuery>>,
    refreshed: broadcast::Sender<QueryKey>,
}

impl HttpQueryCache {
    /// `base_url` is the server origin, e.g. `http://localhost:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, FETCH_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(event = "cache.client_fallback", error = %e);
                reqwest::Client::new()
            });
        let (refreshed, _rx) = broadcast::channel(16);
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            entries: RwLock::new(HashMap::new()),
            refreshed,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Keys whose data was refetched successfully, in completion order.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.refreshed.subscribe()
    }

    pub async fn get(&self, key: QueryKey) -> Option<CachedQuery> {
        self.entries.read().await.get(&key).cloned()
    }

    async fn fetch(&self, key: QueryKey) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, key.path());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", url, status);
        }
        resp.json()
            .await
            .with_context(|| format!("Failed to decode {}", key))
    }

    /// Fetch one key and store the result. Returns whether it succeeded.
    pub async fn refresh(&self, key: QueryKey) -> bool {
        match self.fetch(key).await {
            Ok(data) => {
                self.entries.write().await.insert(
                    key,
                    CachedQuery {
                        data,
                        fetched_at: Utc::now(),
                        stale: false,
                    },
                );
                tracing::debug!(event = "cache.refreshed", key = %key);
                let _ = self.refreshed.send(key);
                true
            }
            Err(e) => {
                tracing::warn!(event = "cache.refetch_failed", key = %key, error = %format!("{:#}", e));
                false
            }
        }
    }

    /// Fetch every dashboard query concurrently.
    pub async fn refresh_all(&self) -> usize {
        let results =
            futures_util::future::join_all(QueryKey::DASHBOARD.iter().map(|k| self.refresh(*k)))
                .await;
        results.into_iter().filter(|ok| *ok).count()
    }
}

#[async_trait]
impl QueryCache for HttpQueryCache {
    async fn invalidate(&self, keys: &[QueryKey]) {
        {
            let mut entries = self.entries.write().await;
            for key in keys {
                if let Some(entry) = entries.get_mut(key) {
                    entry.stale = true;
                }
            }
        }
        tracing::debug!(event = "cache.invalidated", keys = ?keys.iter().map(|k| k.as_str()).collect::<Vec<_>>());
        futures_util::future::join_all(keys.iter().map(|k| self.refresh(*k))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_keys() {
        let names: Vec<&str> = QueryKey::DASHBOARD.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["dashboard.stats", "dashboard.projects", "dashboard.tasks"]
        );
        assert_eq!(QueryKey::DashboardTasks.path(), "/api/dashboard/tasks");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let cache = HttpQueryCache::new("http://localhost:8080/");
        assert_eq!(cache.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale_and_swallows_refetch_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cache = HttpQueryCache::new(format!("http://127.0.0.1:{}", port));
        cache.entries.write().await.insert(
            QueryKey::DashboardStats,
            CachedQuery {
                data: serde_json::json!({"total_projects": 1}),
                fetched_at: Utc::now(),
                stale: false,
            },
        );

        cache.invalidate(&QueryKey::DASHBOARD).await;

        let entry = cache.get(QueryKey::DashboardStats).await.unwrap();
        assert!(entry.stale);
        assert_eq!(entry.data["total_projects"], 1);
        assert!(cache.get(QueryKey::DashboardTasks).await.is_none());
    }

    #[tokio::test]
    async fn test_hung_endpoint_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let cache = HttpQueryCache::with_timeout(format!("http://{}", addr), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let refreshed = tokio::time::timeout(Duration::from_secs(5), cache.refresh(QueryKey::DashboardStats))
            .await
            .expect("fetch was not bounded by the client timeout");
        assert!(!refreshed);
        assert!(started.elapsed() < Duration::from_secs(5));

        server.abort();
    }
}
