use serde::Serialize;

/// Lifecycle of the dashboard's real-time connection.
///
/// `Error` and `Disconnected` differ only in how they are presented; both
/// are followed by a scheduled reconnect unless the attempt budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed state change. Never emitted with `from == to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Connection badge shown by a dashboard.
///
/// `update` returns a label only when the state actually changed since the
/// last render, so each transition is reflected exactly once.
#[derive(Debug, Default)]
pub struct StatusIndicator {
    shown: Option<ConnectionState>,
}

impl StatusIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(state: ConnectionState) -> &'static str {
        match state {
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Live",
            ConnectionState::Disconnected => "Offline",
            ConnectionState::Error => "Connection error",
        }
    }

    pub fn update(&mut self, state: ConnectionState) -> Option<&'static str> {
        if self.shown == Some(state) {
            return None;
        }
        self.shown = Some(state);
        Some(Self::label(state))
    }

    pub fn current(&self) -> Option<ConnectionState> {
        self.shown
    }
}
