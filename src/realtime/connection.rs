//! Connection manager: one actor task owning the STOMP socket.
//!
//! Commands (`connect`, `force_reconnect`, `shutdown`) arrive over an mpsc
//! channel, so reconnect attempts are strictly sequential and a forced
//! reconnect cancels a pending backoff sleep before the next attempt.
//! State is published on a `watch` channel (current value) and a
//! `broadcast` channel (every transition); inbound messages fan out as
//! [`ActivityEvent`]s.

use std::time::Duration;

use taskhub_common::frame::{self, HEARTBEAT, STOMP_VERSION};
use taskhub_common::{Frame, Inbound, MessageType, StompCommand, Topic, WireMessage};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::feed::ActivityEvent;
use super::state::{ConnectionState, Transition};
use super::transport::{Socket, Transport};
use crate::errors::TransportError;

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 256;

/// Inbound silence tolerated, as a multiple of the negotiated interval.
const HEARTBEAT_GRACE: f64 = 1.5;

/// Connection settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    /// Presented as `Authorization: Bearer` and as a `token` header.
    pub auth_token: Option<String>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before giving up until a forced retry.
    pub max_reconnect_attempts: u32,
    /// Zero disables sending heart-beats.
    pub heartbeat_outgoing: Duration,
    /// Zero disables the inbound silence check.
    pub heartbeat_incoming: Duration,
    pub handshake_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            auth_token: None,
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            max_reconnect_attempts: 10,
            heartbeat_outgoing: Duration::from_millis(4000),
            heartbeat_incoming: Duration::from_millis(4000),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RealtimeConfig {
    /// Delay before retry number `attempt` (1-based):
    /// `reconnect_delay * multiplier^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let cap = self.max_reconnect_delay.max(self.reconnect_delay);
        let secs = self.reconnect_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn heart_beat_offer(&self) -> (u64, u64) {
        (
            self.heartbeat_outgoing.as_millis() as u64,
            self.heartbeat_incoming.as_millis() as u64,
        )
    }
}

/// Heart-beat intervals agreed with the server for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HeartBeat {
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
}

impl HeartBeat {
    fn negotiate(offer: (u64, u64), connected: &Frame) -> Self {
        let (client_send, client_want) = offer;
        let (server_send, server_want) = connected
            .header("heart-beat")
            .and_then(frame::parse_heart_beat)
            .unwrap_or((0, 0));
        Self {
            outgoing: millis(frame::negotiate_heart_beat(client_send, server_want)),
            incoming: millis(frame::negotiate_heart_beat(server_send, client_want)),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

enum Command {
    Connect,
    ForceReconnect,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the connection actor.
///
/// Dropping the handle stops the actor; `shutdown` does so gracefully.
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<Transition>,
    events: broadcast::Sender<ActivityEvent>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the actor in `disconnected`. Nothing is opened until `connect`.
    pub fn spawn<T: Transport>(config: RealtimeConfig, topics: Vec<Topic>, transport: T) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(EVENT_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let actor = Actor {
            config,
            topics,
            transport,
            commands: command_rx,
            state: state_tx,
            transitions: transitions.clone(),
            events: events.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            state: state_rx,
            transitions,
            events,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Messages from subscribed topics. Subscribe before `connect` to see
    /// everything; a lagging receiver skips ahead.
    pub fn events(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    /// Start connecting. No-op while connecting or connected.
    pub async fn connect(&self) {
        self.send(Command::Connect).await;
    }

    /// Drop any pending backoff (or live socket) and attempt right away
    /// with a fresh attempt budget.
    pub async fn force_reconnect(&self) {
        self.send(Command::ForceReconnect).await;
    }

    /// Send DISCONNECT if connected, close the socket and stop the actor.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(event = "realtime.actor_panicked", error = %e);
        }
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::debug!(event = "realtime.actor_stopped");
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────

enum Next {
    Idle,
    Attempt,
    Backoff(Instant),
    Stop,
}

enum AttemptOutcome {
    Connected(Box<dyn Socket>, HeartBeat),
    Failed(TransportError),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum SessionEnd {
    /// The server closed the socket cleanly.
    Closed,
    Failed(TransportError),
    ForceReconnect,
    Shutdown(Option<oneshot::Sender<()>>),
}

struct Actor<T> {
    config: RealtimeConfig,
    topics: Vec<Topic>,
    transport: T,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<Transition>,
    events: broadcast::Sender<ActivityEvent>,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self) {
        // Consecutive failed attempts since the last successful handshake.
        let mut failures: u32 = 0;
        // Backoff waits since the last live session; picks the delay.
        let mut step: u32 = 0;
        let mut next = Next::Idle;

        loop {
            next = match next {
                Next::Stop => break,
                Next::Idle => match self.commands.recv().await {
                    Some(Command::Connect | Command::ForceReconnect) => {
                        failures = 0;
                        step = 0;
                        Next::Attempt
                    }
                    Some(Command::Shutdown(done)) => self.stop(Some(done)),
                    None => self.stop(None),
                },
                Next::Backoff(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Next::Attempt,
                    command = self.commands.recv() => match command {
                        Some(Command::ForceReconnect) => {
                            tracing::info!(event = "realtime.backoff_cancelled");
                            failures = 0;
                            step = 0;
                            Next::Attempt
                        }
                        Some(Command::Connect) => Next::Backoff(deadline),
                        Some(Command::Shutdown(done)) => self.stop(Some(done)),
                        None => self.stop(None),
                    },
                },
                Next::Attempt => {
                    self.set_state(ConnectionState::Connecting);
                    match self.attempt().await {
                        AttemptOutcome::Connected(socket, heart_beat) => {
                            failures = 0;
                            step = 0;
                            self.set_state(ConnectionState::Connected);
                            tracing::info!(
                                event = "realtime.connected",
                                url = %self.config.url,
                                heartbeat_out_ms = heart_beat.outgoing.map(|d| d.as_millis() as u64),
                                heartbeat_in_ms = heart_beat.incoming.map(|d| d.as_millis() as u64),
                            );
                            match self.pump(socket, heart_beat).await {
                                SessionEnd::Shutdown(done) => self.stop(done),
                                SessionEnd::ForceReconnect => Next::Attempt,
                                SessionEnd::Closed => {
                                    tracing::info!(event = "realtime.closed_by_server");
                                    self.set_state(ConnectionState::Disconnected);
                                    step += 1;
                                    self.retry_in(self.config.backoff_delay(step))
                                }
                                SessionEnd::Failed(e) => {
                                    tracing::warn!(event = "realtime.connection_lost", error = %e);
                                    self.set_state(ConnectionState::Error);
                                    step += 1;
                                    self.retry_in(self.config.backoff_delay(step))
                                }
                            }
                        }
                        AttemptOutcome::Failed(e) => {
                            failures += 1;
                            self.set_state(ConnectionState::Error);
                            let budget = self.config.max_reconnect_attempts.max(1);
                            if failures >= budget {
                                tracing::error!(
                                    event = "realtime.gave_up",
                                    attempts = failures,
                                    error = %e,
                                    "Reconnect attempts exhausted; waiting for a forced reconnect"
                                );
                                Next::Idle
                            } else {
                                tracing::warn!(
                                    event = "realtime.attempt_failed",
                                    attempt = failures,
                                    max_attempts = budget,
                                    error = %e,
                                );
                                step += 1;
                                self.retry_in(self.config.backoff_delay(step))
                            }
                        }
                        AttemptOutcome::Shutdown(done) => self.stop(done),
                    }
                }
            };
        }
    }

    fn retry_in(&self, delay: Duration) -> Next {
        tracing::debug!(event = "realtime.reconnect_scheduled", delay_ms = delay.as_millis() as u64);
        Next::Backoff(Instant::now() + delay)
    }

    fn stop(&self, done: Option<oneshot::Sender<()>>) -> Next {
        self.set_state(ConnectionState::Disconnected);
        if let Some(done) = done {
            let _ = done.send(());
        }
        Next::Stop
    }

    /// Publish a state change. Repeats of the current state are swallowed.
    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                previous = *current;
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(event = "realtime.state", from = %previous, to = %next);
            let _ = self.transitions.send(Transition {
                from: previous,
                to: next,
            });
        }
    }

    /// Run one handshake while still answering shutdown requests.
    async fn attempt(&mut self) -> AttemptOutcome {
        let handshake = establish(&self.transport, &self.config, &self.topics);
        tokio::pin!(handshake);
        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok((socket, heart_beat)) => AttemptOutcome::Connected(socket, heart_beat),
                        Err(e) => AttemptOutcome::Failed(e),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => return AttemptOutcome::Shutdown(Some(done)),
                    None => return AttemptOutcome::Shutdown(None),
                    // One attempt at a time.
                    Some(Command::Connect | Command::ForceReconnect) => {
                        tracing::debug!(event = "realtime.attempt_in_flight");
                    }
                },
            }
        }
    }

    /// Drive a live session until it ends.
    async fn pump(&mut self, mut socket: Box<dyn Socket>, heart_beat: HeartBeat) -> SessionEnd {
        let mut send_tick = heart_beat.outgoing.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let silence_limit = heart_beat.incoming.map(|d| d.mul_f64(HEARTBEAT_GRACE));
        let mut last_seen = Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_seen + limit);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {}
                    Some(Command::ForceReconnect) => {
                        socket.close().await;
                        return SessionEnd::ForceReconnect;
                    }
                    Some(Command::Shutdown(done)) => {
                        disconnect(socket.as_mut()).await;
                        return SessionEnd::Shutdown(Some(done));
                    }
                    None => {
                        disconnect(socket.as_mut()).await;
                        return SessionEnd::Shutdown(None);
                    }
                },
                _ = tick(&mut send_tick) => {
                    if let Err(e) = socket.send_text(HEARTBEAT.to_string()).await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = sleep_until(deadline) => {
                    socket.close().await;
                    return SessionEnd::Failed(TransportError::Timeout(silence_limit.unwrap_or_default()));
                }
                incoming = socket.next_text() => match incoming {
                    None => return SessionEnd::Closed,
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        if let Some(end) = self.dispatch(&text) {
                            socket.close().await;
                            return end;
                        }
                    }
                },
            }
        }
    }

    /// Handle one inbound text message. Malformed input is dropped here.
    fn dispatch(&self, text: &str) -> Option<SessionEnd> {
        let frame = match Frame::decode(text) {
            Ok(Inbound::Heartbeat) => return None,
            Ok(Inbound::Frame(frame)) => frame,
            Err(e) => {
                tracing::debug!(event = "realtime.malformed_frame", error = %e);
                return None;
            }
        };
        match frame.command {
            StompCommand::Message => {
                self.deliver(&frame);
                None
            }
            StompCommand::Error => {
                let message = frame.header("message").unwrap_or(frame.body.as_str());
                Some(SessionEnd::Failed(TransportError::Rejected(message.to_string())))
            }
            StompCommand::Receipt => {
                tracing::debug!(event = "realtime.receipt", receipt = ?frame.header("receipt-id"));
                None
            }
            other => {
                tracing::debug!(event = "realtime.unexpected_frame", command = %other);
                None
            }
        }
    }

    fn deliver(&self, frame: &Frame) {
        let destination = frame.header("destination").unwrap_or_default();
        match serde_json::from_str::<WireMessage>(&frame.body) {
            Ok(message) if message.message_type == MessageType::Heartbeat => {}
            Ok(message) => {
                // No receivers is fine: delivery is best-effort.
                let _ = self
                    .events
                    .send(ActivityEvent::from_wire(destination, message));
            }
            Err(e) => {
                tracing::debug!(event = "realtime.malformed_message", destination, error = %e);
            }
        }
    }
}

/// Open the socket, perform CONNECT/CONNECTED and subscribe to `topics`.
async fn establish<T: Transport>(
    transport: &T,
    config: &RealtimeConfig,
    topics: &[Topic],
) -> Result<(Box<dyn Socket>, HeartBeat), TransportError> {
    let mut socket = transport.open(&config.url).await?;
    let offer = config.heart_beat_offer();
    socket.send_text(connect_frame(config, offer).encode()).await?;

    let connected = tokio::time::timeout(config.handshake_timeout, await_connected(socket.as_mut()))
        .await
        .map_err(|_| TransportError::Timeout(config.handshake_timeout))??;
    let heart_beat = HeartBeat::negotiate(offer, &connected);

    for (index, topic) in topics.iter().enumerate() {
        let subscribe = Frame::new(StompCommand::Subscribe)
            .with_header("id", format!("sub-{}", index))
            .with_header("destination", topic.destination())
            .with_header("ack", "auto");
        socket.send_text(subscribe.encode()).await?;
    }
    Ok((socket, heart_beat))
}

fn connect_frame(config: &RealtimeConfig, offer: (u64, u64)) -> Frame {
    let mut frame = Frame::new(StompCommand::Connect)
        .with_header("accept-version", STOMP_VERSION)
        .with_header("host", "taskhub")
        .with_header("heart-beat", format!("{},{}", offer.0, offer.1));
    if let Some(token) = &config.auth_token {
        frame = frame
            .with_header("Authorization", format!("Bearer {}", token))
            .with_header("token", token.as_str());
    }
    frame
}

async fn await_connected(socket: &mut dyn Socket) -> Result<Frame, TransportError> {
    loop {
        let text = match socket.next_text().await {
            None => return Err(TransportError::ClosedDuringHandshake),
            Some(result) => result?,
        };
        match Frame::decode(&text)? {
            Inbound::Heartbeat => continue,
            Inbound::Frame(frame) => {
                return match frame.command {
                    StompCommand::Connected => Ok(frame),
                    StompCommand::Error => Err(TransportError::Rejected(
                        frame
                            .header("message")
                            .unwrap_or(frame.body.as_str())
                            .to_string(),
                    )),
                    other => Err(TransportError::UnexpectedFrame(other.to_string())),
                };
            }
        }
    }
}

async fn disconnect(socket: &mut dyn Socket) {
    let frame = Frame::new(StompCommand::Disconnect).with_header("receipt", "disconnect");
    if let Err(e) = socket.send_text(frame.encode()).await {
        tracing::debug!(event = "realtime.disconnect_failed", error = %e);
    }
    socket.close().await;
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
