use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use taskhub_common::frame::{self, HEARTBEAT, STOMP_VERSION};
use taskhub_common::{Frame, Inbound, MessageType, StompCommand, Topic, WireMessage};
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval};

use super::api::SharedState;
use super::models::Activity;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// A client must send CONNECT within this window after the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server heart-beat offer: `(can send every, wants to receive every)` in ms.
pub const DEFAULT_HEART_BEAT: (u64, u64) = (10_000, 10_000);

// ── Activity hub ─────────────────────────────────────────────────────

/// A serialized message addressed to one topic destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub destination: String,
    pub body: String,
}

/// Fan-out point between mutations and connected STOMP sessions.
///
/// Every session holds a broadcast receiver and forwards only the
/// destinations it subscribed to. Slow sessions lag and skip messages.
#[derive(Clone)]
pub struct ActivityHub {
    tx: broadcast::Sender<Arc<Outbound>>,
}

impl ActivityHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.tx.subscribe()
    }

    /// Serialize and broadcast a message on one topic.
    /// Returns silently even if no clients are connected.
    pub fn publish(&self, topic: Topic, message: &WireMessage) {
        match serde_json::to_string(message) {
            Ok(body) => {
                let _ = self.tx.send(Arc::new(Outbound {
                    destination: topic.destination(),
                    body,
                }));
            }
            Err(e) => {
                tracing::warn!(event = "hub.serialize_failed", error = %e, "Failed to serialize wire message");
            }
        }
    }

    /// Publish a recorded activity on the global, project and task topics.
    /// Membership changes additionally go out as a `TEAM_UPDATE`.
    pub fn publish_activity(&self, activity: &Activity) {
        let payload = match serde_json::to_value(activity) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(event = "hub.serialize_failed", error = %e, "Failed to serialize activity");
                return;
            }
        };
        let message = WireMessage::new(MessageType::ActivityUpdate, payload.clone());

        self.publish(Topic::GlobalActivities, &message);
        if let Some(project_id) = activity.project_id {
            self.publish(Topic::ProjectActivities(project_id), &message);
            if activity.activity_type.is_team_change() {
                self.publish(
                    Topic::TeamUpdates(project_id),
                    &WireMessage::new(MessageType::TeamUpdate, payload),
                );
            }
        }
        if let Some(task_id) = activity.task_id {
            self.publish(Topic::TaskActivities(task_id), &message);
        }
        tracing::debug!(
            event = "hub.activity_published",
            activity_id = activity.id,
            activity_type = %activity.activity_type,
        );
    }

    pub fn notify_user(&self, user_id: i64, payload: serde_json::Value) {
        self.publish(
            Topic::UserNotifications(user_id),
            &WireMessage::new(MessageType::Notification, payload),
        );
    }
}

// ── STOMP session state ──────────────────────────────────────────────

/// Endpoint settings shared by every session.
#[derive(Debug, Clone)]
pub struct StompSettings {
    /// When set, CONNECT must present this bearer token.
    pub auth_token: Option<String>,
    pub heart_beat: (u64, u64),
}

impl Default for StompSettings {
    fn default() -> Self {
        Self {
            auth_token: None,
            heart_beat: DEFAULT_HEART_BEAT,
        }
    }
}

/// What the socket loop should do after a client frame.
#[derive(Debug, PartialEq)]
enum Reply {
    Nothing,
    Send(Frame),
    SendAndClose(Frame),
    Close,
}

#[derive(Debug)]
struct StompSession {
    /// Server → client heart-beat period; `None` when disabled.
    outgoing: Option<Duration>,
    /// Client → server heart-beat period; `None` when disabled.
    incoming: Option<Duration>,
    /// subscription id → destination
    subscriptions: HashMap<String, String>,
    next_message_id: u64,
}

fn error_frame(message: &str, detail: &str) -> Frame {
    Frame::new(StompCommand::Error)
        .with_header("message", message)
        .with_header("content-type", "text/plain")
        .with_body(detail)
}

fn receipt_for(frame: &Frame) -> Option<Frame> {
    frame
        .header("receipt")
        .map(|id| Frame::new(StompCommand::Receipt).with_header("receipt-id", id))
}

/// Token presented on CONNECT: `Authorization: Bearer <t>` first, then `token`.
fn presented_token(frame: &Frame) -> Option<&str> {
    frame
        .header("Authorization")
        .or_else(|| frame.header("authorization"))
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| frame.header("token"))
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl StompSession {
    /// Validate a CONNECT frame and build the CONNECTED reply.
    fn accept(connect: &Frame, settings: &StompSettings) -> Result<(Self, Frame), Frame> {
        if !matches!(connect.command, StompCommand::Connect | StompCommand::Stomp) {
            return Err(error_frame(
                "Expected CONNECT",
                &format!("First frame must be CONNECT, got {}", connect.command),
            ));
        }
        if let Some(accepted) = connect.header("accept-version")
            && !accepted.split(',').any(|v| v.trim() == STOMP_VERSION)
        {
            return Err(error_frame(
                "Unsupported protocol version",
                &format!("Supported version is {}", STOMP_VERSION),
            ));
        }
        if let Some(expected) = &settings.auth_token
            && presented_token(connect) != Some(expected.as_str())
        {
            return Err(error_frame("Unauthorized", "Missing or invalid token"));
        }

        let (client_send, client_want) = connect
            .header("heart-beat")
            .and_then(frame::parse_heart_beat)
            .unwrap_or((0, 0));
        let (server_send, server_want) = settings.heart_beat;

        let session = Self {
            outgoing: millis(frame::negotiate_heart_beat(server_send, client_want)),
            incoming: millis(frame::negotiate_heart_beat(client_send, server_want)),
            subscriptions: HashMap::new(),
            next_message_id: 0,
        };
        let connected = Frame::new(StompCommand::Connected)
            .with_header("version", STOMP_VERSION)
            .with_header("heart-beat", format!("{},{}", server_send, server_want))
            .with_header("server", concat!("taskhub/", env!("CARGO_PKG_VERSION")));
        Ok((session, connected))
    }

    fn handle(&mut self, frame: Frame) -> Reply {
        match frame.command {
            StompCommand::Subscribe => {
                let (Some(id), Some(destination)) = (frame.header("id"), frame.header("destination"))
                else {
                    return Reply::SendAndClose(error_frame(
                        "Malformed SUBSCRIBE",
                        "SUBSCRIBE requires id and destination headers",
                    ));
                };
                if let Err(e) = destination.parse::<Topic>() {
                    return Reply::SendAndClose(error_frame("Unknown destination", &e));
                }
                self.subscriptions
                    .insert(id.to_string(), destination.to_string());
                tracing::debug!(event = "ws.subscribed", subscription = id, destination);
                receipt_for(&frame).map_or(Reply::Nothing, Reply::Send)
            }
            StompCommand::Unsubscribe => {
                let Some(id) = frame.header("id") else {
                    return Reply::SendAndClose(error_frame(
                        "Malformed UNSUBSCRIBE",
                        "UNSUBSCRIBE requires an id header",
                    ));
                };
                self.subscriptions.remove(id);
                receipt_for(&frame).map_or(Reply::Nothing, Reply::Send)
            }
            StompCommand::Disconnect => receipt_for(&frame).map_or(Reply::Close, Reply::SendAndClose),
            StompCommand::Send => {
                // Clients only listen; publishing goes through the REST API.
                tracing::debug!(event = "ws.send_ignored", destination = ?frame.header("destination"));
                Reply::Nothing
            }
            other => Reply::SendAndClose(error_frame(
                "Unexpected frame",
                &format!("{} is not valid after CONNECT", other),
            )),
        }
    }

    /// MESSAGE frames for every subscription matching the destination.
    fn deliver(&mut self, out: &Outbound) -> Vec<Frame> {
        let mut frames = Vec::new();
        for (id, destination) in &self.subscriptions {
            if *destination != out.destination {
                continue;
            }
            self.next_message_id += 1;
            frames.push(
                Frame::new(StompCommand::Message)
                    .with_header("subscription", id.as_str())
                    .with_header("message-id", self.next_message_id.to_string())
                    .with_header("destination", destination.as_str())
                    .with_header("content-type", "application/json")
                    .with_body(out.body.as_str()),
            );
        }
        frames
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    let settings = state.stomp.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, settings))
}

async fn handle_socket(socket: WebSocket, hub: ActivityHub, settings: StompSettings) {
    let (mut sender, mut receiver) = socket.split();
    let session = match handshake(&mut receiver, &settings).await {
        Ok((session, connected)) => {
            if send_frame(&mut sender, &connected).await.is_err() {
                return;
            }
            session
        }
        Err(Some(error)) => {
            tracing::info!(
                event = "ws.handshake_rejected",
                reason = error.header("message").unwrap_or_default(),
            );
            let _ = send_frame(&mut sender, &error).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        Err(None) => {
            tracing::debug!(event = "ws.handshake_abandoned");
            return;
        }
    };
    tracing::debug!(
        event = "ws.connected",
        outgoing_ms = session.outgoing.map(|d| d.as_millis() as u64),
        incoming_ms = session.incoming.map(|d| d.as_millis() as u64),
    );
    let rx = hub.subscribe();
    run_socket_loop(sender, receiver, rx, session).await;
}

/// Wait for the CONNECT frame. `Err(Some(frame))` carries an ERROR to send
/// back; `Err(None)` means the socket went away or timed out.
async fn handshake(
    receiver: &mut SplitStream<WebSocket>,
    settings: &StompSettings,
) -> Result<(StompSession, Frame), Option<Frame>> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) | Err(_) => return Err(None),
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return Err(None),
            _ => continue,
        };
        match Frame::decode(text.as_str()) {
            Ok(Inbound::Heartbeat) => continue,
            Ok(Inbound::Frame(frame)) => return StompSession::accept(&frame, settings).map_err(Some),
            Err(e) => return Err(Some(error_frame("Malformed frame", &e.to_string()))),
        }
    }
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<(), axum::Error> {
    sender.send(Message::Text(frame.encode().into())).await
}

async fn tick_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Core session loop with ping/pong keepalive and STOMP heart-beating.
///
/// Forwards hub messages to matching subscriptions, answers client frames,
/// and closes the socket when either the Pong or the negotiated client
/// heart-beat goes silent for too long.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Arc<Outbound>>,
    mut session: StompSession,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut heartbeat = session.outgoing.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;
    let mut last_inbound = Instant::now();

    loop {
        // Allow twice the negotiated period before declaring the client gone.
        let silence_deadline = session.incoming.map(|period| last_inbound + period * 2);

        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(event = "ws.pong_timeout");
                    break;
                }
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── STOMP heart-beat ────────────────────────────────────
            _ = tick_heartbeat(&mut heartbeat) => {
                if sender.send(Message::Text(HEARTBEAT.into())).await.is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(silence_deadline.unwrap_or(last_inbound)), if silence_deadline.is_some() => {
                tracing::debug!(event = "ws.heartbeat_missed");
                break;
            }

            // ── Hub forwarding ──────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(out) => {
                        let mut failed = false;
                        for frame in session.deliver(&out) {
                            if send_frame(&mut sender, &frame).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(event = "ws.lagged", skipped);
                        continue;
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                last_inbound = Instant::now();
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let reply = match Frame::decode(text.as_str()) {
                    Ok(Inbound::Heartbeat) => Reply::Nothing,
                    Ok(Inbound::Frame(frame)) => session.handle(frame),
                    Err(e) => Reply::SendAndClose(error_frame("Malformed frame", &e.to_string())),
                };
                match reply {
                    Reply::Nothing => {}
                    Reply::Send(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Reply::SendAndClose(frame) => {
                        let _ = send_frame(&mut sender, &frame).await;
                        break;
                    }
                    Reply::Close => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::models::ActivityType;

    fn connect_frame() -> Frame {
        Frame::new(StompCommand::Connect)
            .with_header("accept-version", "1.2")
            .with_header("heart-beat", "5000,20000")
    }

    fn accepted() -> StompSession {
        StompSession::accept(&connect_frame(), &StompSettings::default())
            .unwrap()
            .0
    }

    fn sample_activity(activity_type: ActivityType, project_id: Option<i64>, task_id: Option<i64>) -> Activity {
        Activity {
            id: 1,
            activity_type,
            project_id,
            task_id,
            actor: None,
            message: "something happened".to_string(),
            metadata: None,
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<Outbound>>) -> Vec<Arc<Outbound>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_connect_negotiates_heart_beat() {
        let (session, connected) =
            StompSession::accept(&connect_frame(), &StompSettings::default()).unwrap();
        assert_eq!(connected.command, StompCommand::Connected);
        assert_eq!(connected.header("version"), Some("1.2"));
        assert_eq!(connected.header("heart-beat"), Some("10000,10000"));
        // Server sends at max(10000, client wants 20000).
        assert_eq!(session.outgoing, Some(Duration::from_millis(20_000)));
        // Client sends at max(5000, server wants 10000).
        assert_eq!(session.incoming, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn test_connect_without_heart_beat_disables_both_directions() {
        let frame = Frame::new(StompCommand::Connect).with_header("accept-version", "1.2");
        let (session, _) = StompSession::accept(&frame, &StompSettings::default()).unwrap();
        assert_eq!(session.outgoing, None);
        assert_eq!(session.incoming, None);
    }

    #[test]
    fn test_connect_requires_configured_token() {
        let settings = StompSettings {
            auth_token: Some("secret".to_string()),
            ..Default::default()
        };
        let err = StompSession::accept(&connect_frame(), &settings).unwrap_err();
        assert_eq!(err.command, StompCommand::Error);
        assert_eq!(err.header("message"), Some("Unauthorized"));

        let bearer = connect_frame().with_header("Authorization", "Bearer secret");
        assert!(StompSession::accept(&bearer, &settings).is_ok());

        let token = connect_frame().with_header("token", "secret");
        assert!(StompSession::accept(&token, &settings).is_ok());

        let wrong = connect_frame().with_header("Authorization", "Bearer nope");
        assert!(StompSession::accept(&wrong, &settings).is_err());
    }

    #[test]
    fn test_connect_rejects_other_first_frame_and_versions() {
        let subscribe = Frame::new(StompCommand::Subscribe);
        assert!(StompSession::accept(&subscribe, &StompSettings::default()).is_err());

        let old = Frame::new(StompCommand::Connect).with_header("accept-version", "1.0,1.1");
        let err = StompSession::accept(&old, &StompSettings::default()).unwrap_err();
        assert_eq!(err.header("message"), Some("Unsupported protocol version"));
    }

    #[test]
    fn test_subscribe_and_deliver_only_matching_destination() {
        let mut session = accepted();
        let reply = session.handle(
            Frame::new(StompCommand::Subscribe)
                .with_header("id", "sub-0")
                .with_header("destination", "/topic/activities/project/3"),
        );
        assert_eq!(reply, Reply::Nothing);

        let other = Outbound {
            destination: "/topic/activities/project/4".to_string(),
            body: "{}".to_string(),
        };
        assert!(session.deliver(&other).is_empty());

        let matching = Outbound {
            destination: "/topic/activities/project/3".to_string(),
            body: r#"{"type":"ACTIVITY_UPDATE"}"#.to_string(),
        };
        let frames = session.deliver(&matching);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, StompCommand::Message);
        assert_eq!(frames[0].header("subscription"), Some("sub-0"));
        assert_eq!(frames[0].header("message-id"), Some("1"));
        assert_eq!(frames[0].body, matching.body);

        assert_eq!(session.deliver(&matching)[0].header("message-id"), Some("2"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut session = accepted();
        session.handle(
            Frame::new(StompCommand::Subscribe)
                .with_header("id", "s")
                .with_header("destination", "/topic/activities/global"),
        );
        let reply = session.handle(
            Frame::new(StompCommand::Unsubscribe)
                .with_header("id", "s")
                .with_header("receipt", "r-1"),
        );
        match reply {
            Reply::Send(frame) => assert_eq!(frame.header("receipt-id"), Some("r-1")),
            other => panic!("expected RECEIPT, got {:?}", other),
        }
        let out = Outbound {
            destination: "/topic/activities/global".to_string(),
            body: "{}".to_string(),
        };
        assert!(session.deliver(&out).is_empty());
    }

    #[test]
    fn test_bad_subscribe_closes_with_error() {
        let mut session = accepted();
        let reply = session.handle(
            Frame::new(StompCommand::Subscribe)
                .with_header("id", "s")
                .with_header("destination", "/queue/elsewhere"),
        );
        assert!(matches!(reply, Reply::SendAndClose(ref f) if f.command == StompCommand::Error));

        let reply = session.handle(Frame::new(StompCommand::Subscribe).with_header("id", "s"));
        assert!(matches!(reply, Reply::SendAndClose(_)));
    }

    #[test]
    fn test_disconnect_with_receipt() {
        let mut session = accepted();
        assert_eq!(session.handle(Frame::new(StompCommand::Disconnect)), Reply::Close);
        let reply = session.handle(Frame::new(StompCommand::Disconnect).with_header("receipt", "77"));
        match reply {
            Reply::SendAndClose(frame) => {
                assert_eq!(frame.command, StompCommand::Receipt);
                assert_eq!(frame.header("receipt-id"), Some("77"));
            }
            other => panic!("expected RECEIPT then close, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_activity_fans_out_to_topics() {
        let hub = ActivityHub::new(16);
        let mut rx = hub.subscribe();
        hub.publish_activity(&sample_activity(ActivityType::TaskCreated, Some(3), Some(9)));

        let destinations: Vec<String> = drain(&mut rx).iter().map(|o| o.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![
                "/topic/activities/global",
                "/topic/activities/project/3",
                "/topic/activities/task/9",
            ]
        );
    }

    #[test]
    fn test_member_activity_also_goes_to_team_topic() {
        let hub = ActivityHub::new(16);
        let mut rx = hub.subscribe();
        hub.publish_activity(&sample_activity(ActivityType::MemberAdded, Some(5), None));

        let messages = drain(&mut rx);
        let team = messages
            .iter()
            .find(|o| o.destination == "/topic/teams/5/updates")
            .expect("team update published");
        let body: serde_json::Value = serde_json::from_str(&team.body).unwrap();
        assert_eq!(body["type"], "TEAM_UPDATE");
        assert_eq!(body["payload"]["activity_type"], "member_added");
    }

    #[test]
    fn test_global_only_activity() {
        let hub = ActivityHub::new(16);
        let mut rx = hub.subscribe();
        hub.publish_activity(&sample_activity(ActivityType::GithubPush, None, None));
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(body["type"], "ACTIVITY_UPDATE");
        assert_eq!(body["payload"]["message"], "something happened");
    }

    #[test]
    fn test_notify_user() {
        let hub = ActivityHub::new(4);
        let mut rx = hub.subscribe();
        hub.notify_user(12, serde_json::json!({"message": "hi"}));
        let messages = drain(&mut rx);
        assert_eq!(messages[0].destination, "/topic/notifications/user/12");
        assert!(messages[0].body.contains("NOTIFICATION"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let hub = ActivityHub::new(4);
        hub.notify_user(1, serde_json::Value::Null);
    }
}
