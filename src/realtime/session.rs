use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::cache::QueryCache;
use super::connection::ConnectionManager;
use super::feed::{ActivityEvent, ActivityFeed, ReadPolicy};
use super::invalidator::{
    DEFAULT_DEBOUNCE, DEFAULT_REFRESH_TIMEOUT, DashboardInvalidator, DebounceMode, InvalidatorSignal,
};

/// How many events a snapshot carries.
const SNAPSHOT_RECENT: usize = 20;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub read_policy: ReadPolicy,
    /// `None` or zero keeps every event.
    pub feed_capacity: Option<usize>,
    pub debounce: Duration,
    pub debounce_mode: DebounceMode,
    /// Mark the feed read when a debounce window closes, before the refetch
    /// starts, so the next event opens a fresh window.
    pub mark_read_on_refresh: bool,
    /// Give up on one dashboard invalidation after this long.
    pub refresh_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_policy: ReadPolicy::default(),
            feed_capacity: Some(200),
            debounce: DEFAULT_DEBOUNCE,
            debounce_mode: DebounceMode::default(),
            mark_read_on_refresh: true,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

/// Read-only view of the feed, republished after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedSnapshot {
    pub has_new_activity: bool,
    pub unread: usize,
    pub recent: Vec<ActivityEvent>,
    /// Completed dashboard invalidations since the session started.
    pub refreshes: u64,
}

enum SessionCommand {
    MarkAsRead,
    Shutdown(oneshot::Sender<()>),
}

/// Context object wiring one connection to a feed and an invalidator.
///
/// The session task owns the feed, so every mutation happens on one task;
/// callers observe it through [`FeedSnapshot`]s.
pub struct DashboardSession {
    connection: ConnectionManager,
    commands: mpsc::Sender<SessionCommand>,
    feed: watch::Receiver<FeedSnapshot>,
    task: JoinHandle<()>,
}

impl DashboardSession {
    /// Start routing `connection`'s events into a fresh feed. Does not
    /// connect; call `connection().connect()` once subscribed.
    pub fn start(
        connection: ConnectionManager,
        cache: Arc<dyn QueryCache>,
        options: SessionOptions,
    ) -> Self {
        let events = connection.events();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (feed_tx, feed_rx) = watch::channel(FeedSnapshot::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let invalidator = DashboardInvalidator::new(cache, options.debounce, options.debounce_mode)
            .with_refresh_timeout(options.refresh_timeout)
            .with_notifier(signal_tx);
        let feed = ActivityFeed::new(options.read_policy, options.feed_capacity);

        let task = tokio::spawn(run(
            feed,
            invalidator,
            options.mark_read_on_refresh,
            events,
            signal_rx,
            command_rx,
            feed_tx,
        ));

        Self {
            connection,
            commands: command_tx,
            feed: feed_rx,
            task,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn feed(&self) -> watch::Receiver<FeedSnapshot> {
        self.feed.clone()
    }

    pub async fn mark_as_read(&self) {
        let _ = self.commands.send(SessionCommand::MarkAsRead).await;
    }

    /// Stop routing, cancel a pending invalidation and shut the connection
    /// down.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(event = "session.task_panicked", error = %e);
        }
        self.connection.shutdown().await;
    }
}

async fn run(
    mut feed: ActivityFeed,
    mut invalidator: DashboardInvalidator,
    mark_read_on_refresh: bool,
    mut events: broadcast::Receiver<ActivityEvent>,
    mut signals: mpsc::UnboundedReceiver<InvalidatorSignal>,
    mut commands: mpsc::Receiver<SessionCommand>,
    snapshot: watch::Sender<FeedSnapshot>,
) {
    let mut refreshes: u64 = 0;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let rising = feed.on_event(event);
                    invalidator.on_activity(rising);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(event = "session.events_lagged", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(signal) = signals.recv() => match signal {
                // Events handled before the ack are covered by the refetch
                // that follows it; later ones raise a fresh rising edge.
                InvalidatorSignal::WindowClosed(ack) => {
                    if mark_read_on_refresh {
                        feed.mark_as_read();
                    }
                    let _ = ack.send(());
                }
                InvalidatorSignal::Refreshed => refreshes += 1,
            },
            command = commands.recv() => match command {
                Some(SessionCommand::MarkAsRead) => feed.mark_as_read(),
                Some(SessionCommand::Shutdown(done)) => {
                    invalidator.cancel();
                    let _ = done.send(());
                    break;
                }
                None => break,
            },
        }
        snapshot.send_replace(FeedSnapshot {
            has_new_activity: feed.has_new_activity(),
            unread: feed.unread_count(),
            recent: feed.recent(SNAPSHOT_RECENT),
            refreshes,
        });
    }
}
