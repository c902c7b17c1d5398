use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::cache::{QueryCache, QueryKey};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Upper bound on one invalidation, so a hung endpoint cannot pin a timer.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// How activity arriving inside an open debounce window is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceMode {
    /// The first rising edge opens the window; later activity rides along.
    #[default]
    Batch,
    /// Every activity inside the window restarts it.
    Trailing,
}

/// Progress reports sent to the invalidator's owner.
#[derive(Debug)]
pub enum InvalidatorSignal {
    /// The window elapsed. The invalidation starts once the sender is
    /// answered, so whatever the owner does before answering is covered by
    /// the refetch. Dropping the sender skips the invalidation.
    WindowClosed(oneshot::Sender<()>),
    /// The dashboard queries were invalidated within the timeout.
    Refreshed,
}

/// Debounces new-activity signals into one invalidation of the dashboard
/// queries.
///
/// At most one timer task exists at a time. Dropping the invalidator
/// cancels a window that has not fired yet.
pub struct DashboardInvalidator {
    cache: Arc<dyn QueryCache>,
    window: Duration,
    mode: DebounceMode,
    pending: Option<JoinHandle<()>>,
    window_open: Arc<AtomicBool>,
    refresh_timeout: Duration,
    notifier: Option<mpsc::UnboundedSender<InvalidatorSignal>>,
}

impl DashboardInvalidator {
    pub fn new(cache: Arc<dyn QueryCache>, window: Duration, mode: DebounceMode) -> Self {
        Self {
            cache,
            window,
            mode,
            pending: None,
            window_open: Arc::new(AtomicBool::new(false)),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            notifier: None,
        }
    }

    /// Report window closes and completed invalidations to `notifier`.
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<InvalidatorSignal>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn mode(&self) -> DebounceMode {
        self.mode
    }

    /// Whether a debounce window is currently counting down.
    pub fn is_pending(&self) -> bool {
        self.window_open.load(Ordering::SeqCst)
    }

    /// Feed one activity arrival. `rising` is true when it raised the
    /// feed's new-activity flag.
    pub fn on_activity(&mut self, rising: bool) {
        match self.mode {
            DebounceMode::Batch => {
                if rising && !self.is_pending() {
                    self.schedule();
                }
            }
            DebounceMode::Trailing => {
                if rising || self.is_pending() {
                    self.cancel();
                    self.schedule();
                }
            }
        }
    }

    /// Cancel a window that has not fired. An invalidation already in
    /// flight is left to finish.
    pub fn cancel(&mut self) {
        if self.is_pending()
            && let Some(handle) = self.pending.take()
        {
            handle.abort();
            self.window_open.store(false, Ordering::SeqCst);
            tracing::trace!(event = "invalidator.cancelled");
        }
    }

    fn schedule(&mut self) {
        let cache = self.cache.clone();
        let window = self.window;
        let window_open = self.window_open.clone();
        let refresh_timeout = self.refresh_timeout;
        let notifier = self.notifier.clone();
        window_open.store(true, Ordering::SeqCst);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            window_open.store(false, Ordering::SeqCst);
            tracing::debug!(event = "invalidator.fired", window_ms = window.as_millis() as u64);

            if let Some(tx) = &notifier {
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(InvalidatorSignal::WindowClosed(ack_tx)).is_err() || ack_rx.await.is_err() {
                    return;
                }
            }

            let invalidate = cache.invalidate(&QueryKey::DASHBOARD);
            match tokio::time::timeout(refresh_timeout, invalidate).await {
                Ok(()) => {
                    if let Some(tx) = notifier {
                        let _ = tx.send(InvalidatorSignal::Refreshed);
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        event = "invalidator.timed_out",
                        timeout_ms = refresh_timeout.as_millis() as u64,
                    );
                }
            }
        }));
    }
}

impl Drop for DashboardInvalidator {
    fn drop(&mut self) {
        self.cancel();
    }
}
