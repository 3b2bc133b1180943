//! Backend speaking the hosted realtime server's Phoenix channel protocol.
//!
//! One WebSocket is shared by every channel. The socket loop owns it:
//! joins issued while the socket is down are queued and sent once it is
//! up, a heartbeat goes out on the `phoenix` topic, and when the socket
//! drops every channel is reported `CLOSED` so the engine can run
//! its own retry policy. The loop then idles until the next join arrives.

use super::{ChangeBinding, ChannelHandle, ChannelRequest, ChannelSink, ChannelStatus, RealtimeBackend};
use crate::error::{RealtimeError, Result};
use crate::event::ChangeEvent;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

const PHOENIX_TOPIC: &str = "phoenix";
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq)]
pub struct PhoenixConfig {
    /// Socket endpoint, e.g. `wss://<project>/realtime/v1/websocket`.
    pub url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_intervals: Vec<Duration>,
}

impl PhoenixConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(25),
            reconnect_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.reconnect_intervals = intervals;
        self
    }

    /// Endpoint with the `apikey` and `vsn` query parameters attached.
    pub fn socket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }

    fn reconnect_delay(&self, attempt: usize) -> Duration {
        self.reconnect_intervals
            .get(attempt)
            .or_else(|| self.reconnect_intervals.last())
            .copied()
            .unwrap_or(Duration::from_secs(16))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

enum SocketCommand {
    Join {
        id: u64,
        topic: String,
        payload: Value,
        sink: ChannelSink,
    },
    Leave {
        id: u64,
        topic: String,
    },
    Shutdown,
}

/// Phoenix wire frame (JSON serializer, protocol 1.0.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

struct JoinedChannel {
    id: u64,
    payload: Value,
    sink: ChannelSink,
    /// Set once the `phx_join` frame has gone out on the current socket.
    join_ref: Option<String>,
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn join_payload(bindings: &[ChangeBinding], access_token: Option<&str>) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": bindings,
            "private": false,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

#[derive(Debug, PartialEq)]
enum Routed {
    Ignored,
    HeartbeatAck,
    Status(String, ChannelStatus),
    Change(String),
}

/// Apply one inbound frame to the joined channels.
fn route_message(
    msg: PhoenixMessage,
    channels: &HashMap<String, JoinedChannel>,
    pending_heartbeat: &mut Option<String>,
) -> Routed {
    if msg.topic == PHOENIX_TOPIC {
        if msg.event == "phx_reply" && msg.reference.is_some() && msg.reference == *pending_heartbeat {
            *pending_heartbeat = None;
            return Routed::HeartbeatAck;
        }
        return Routed::Ignored;
    }

    let Some(channel) = channels.get(&msg.topic) else {
        return Routed::Ignored;
    };
    let Some(current_ref) = channel.join_ref.as_ref() else {
        return Routed::Ignored;
    };

    match msg.event.as_str() {
        "phx_reply" => {
            if msg.reference.as_ref() != Some(current_ref) {
                return Routed::Ignored;
            }
            let status = match msg.payload.get("status").and_then(Value::as_str) {
                Some("ok") => ChannelStatus::Subscribed,
                _ => ChannelStatus::ChannelError(rejection_reason(&msg.payload)),
            };
            channel.sink.status(status.clone());
            Routed::Status(msg.topic, status)
        }
        "phx_close" | "phx_error" => {
            let stale = [msg.join_ref.as_ref(), msg.reference.as_ref()]
                .into_iter()
                .flatten()
                .any(|r| r != current_ref);
            if stale {
                return Routed::Ignored;
            }
            let status = if msg.event == "phx_close" {
                ChannelStatus::Closed
            } else {
                ChannelStatus::ChannelError(rejection_reason(&msg.payload))
            };
            channel.sink.status(status.clone());
            Routed::Status(msg.topic, status)
        }
        "system" => {
            if msg.payload.get("status").and_then(Value::as_str) == Some("error") {
                let status = ChannelStatus::ChannelError(rejection_reason(&msg.payload));
                channel.sink.status(status.clone());
                Routed::Status(msg.topic, status)
            } else {
                Routed::Ignored
            }
        }
        "postgres_changes" => {
            let Some(data) = msg.payload.get("data") else {
                return Routed::Ignored;
            };
            match serde_json::from_value::<ChangeEvent>(data.clone()) {
                Ok(event) => {
                    channel.sink.change(event);
                    Routed::Change(msg.topic)
                }
                Err(e) => {
                    warn!(topic = %msg.topic, error = %e, "undecodable change payload");
                    Routed::Ignored
                }
            }
        }
        _ => Routed::Ignored,
    }
}

fn rejection_reason(payload: &Value) -> String {
    let pick = |v: &Value| {
        ["reason", "message"]
            .iter()
            .find_map(|field| v.get(*field).and_then(Value::as_str).map(str::to_string))
    };
    payload
        .get("response")
        .and_then(pick)
        .or_else(|| pick(payload))
        .unwrap_or_else(|| payload.to_string())
}

/// Applies a command while no socket is up. Returns `false` on shutdown.
fn apply_offline(command: SocketCommand, channels: &mut HashMap<String, JoinedChannel>) -> bool {
    match command {
        SocketCommand::Join {
            id,
            topic,
            payload,
            sink,
        } => {
            channels.insert(
                topic,
                JoinedChannel {
                    id,
                    payload,
                    sink,
                    join_ref: None,
                },
            );
            true
        }
        SocketCommand::Leave { id, topic } => {
            if channels.get(&topic).is_some_and(|c| c.id == id) {
                channels.remove(&topic);
            }
            true
        }
        SocketCommand::Shutdown => false,
    }
}

#[derive(Clone)]
pub struct PhoenixBackend {
    command_tx: mpsc::Sender<SocketCommand>,
    state: watch::Receiver<SocketState>,
    access_token: Option<String>,
    next_id: std::sync::Arc<AtomicU64>,
}

impl PhoenixBackend {
    /// Start the socket loop. The socket itself opens lazily on the first join.
    pub fn connect(config: PhoenixConfig) -> Result<Self> {
        let url = config.socket_url()?;
        let (command_tx, command_rx) = mpsc::channel(256);
        let (state_tx, state) = watch::channel(SocketState::Idle);
        let access_token = config.access_token.clone();

        spawn_socket_loop(url, config, state_tx, command_rx);

        Ok(Self {
            command_tx,
            state,
            access_token,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SocketState> {
        self.state.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown).await;
    }
}

#[async_trait]
impl RealtimeBackend for PhoenixBackend {
    async fn subscribe(&self, request: ChannelRequest, sink: ChannelSink) -> Result<ChannelHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = format!("realtime:{}", request.name);
        let payload = join_payload(&request.bindings, self.access_token.as_deref());

        self.command_tx
            .send(SocketCommand::Join {
                id,
                topic: topic.clone(),
                payload,
                sink,
            })
            .await
            .map_err(|_| RealtimeError::ConnectionClosed)?;

        Ok(ChannelHandle::new(id, topic))
    }

    async fn remove_channel(&self, handle: &ChannelHandle) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Leave {
                id: handle.id(),
                topic: handle.topic().to_string(),
            })
            .await
            .map_err(|_| RealtimeError::ConnectionClosed)
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn open_socket(url: &Url) -> Result<WsStream> {
    let (ws, _) = connect_async(url.as_str()).await?;
    Ok(ws)
}

/// Send a `phx_join` for `topic`. The join ref is only recorded once the
/// frame is on the wire, so a failed send leaves the channel unjoined.
async fn send_join<S>(ws_tx: &mut S, refs: &mut RefCounter, topic: &str, channel: &mut JoinedChannel) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let reference = refs.next();
    let frame = PhoenixMessage::new(topic, "phx_join", channel.payload.clone(), reference.clone()).to_frame()?;
    ws_tx.send(frame).await?;
    channel.join_ref = Some(reference);
    Ok(())
}

fn spawn_socket_loop(
    url: Url,
    config: PhoenixConfig,
    state: watch::Sender<SocketState>,
    mut command_rx: mpsc::Receiver<SocketCommand>,
) {
    tokio::spawn(async move {
        let mut channels: HashMap<String, JoinedChannel> = HashMap::new();
        let mut refs = RefCounter::default();
        let mut reconnect_attempt: usize = 0;

        'run: loop {
            while channels.is_empty() {
                state.send_replace(SocketState::Idle);
                match command_rx.recv().await {
                    Some(cmd) => {
                        if !apply_offline(cmd, &mut channels) {
                            break 'run;
                        }
                    }
                    None => break 'run,
                }
            }

            state.send_replace(SocketState::Connecting);

            let ws = match open_socket(&url).await {
                Ok(ws) => ws,
                Err(e) => {
                    let delay = config.reconnect_delay(reconnect_attempt);
                    reconnect_attempt += 1;
                    error!(error = %e, attempt = reconnect_attempt, "realtime socket connect failed");
                    state.send_replace(SocketState::Reconnecting {
                        attempt: reconnect_attempt as u32,
                    });

                    let backoff = sleep(delay);
                    tokio::pin!(backoff);
                    loop {
                        tokio::select! {
                            _ = &mut backoff => break,
                            cmd = command_rx.recv() => match cmd {
                                Some(cmd) => {
                                    if !apply_offline(cmd, &mut channels) {
                                        break 'run;
                                    }
                                }
                                None => break 'run,
                            },
                        }
                    }
                    continue 'run;
                }
            };

            info!(channels = channels.len(), "realtime socket connected");
            state.send_replace(SocketState::Connected);
            reconnect_attempt = 0;

            let (mut ws_tx, mut ws_rx) = ws.split();

            let mut joined_all = true;
            for (topic, channel) in channels.iter_mut() {
                if let Err(e) = send_join(&mut ws_tx, &mut refs, topic, channel).await {
                    warn!(topic = %topic, error = %e, "failed to send join");
                    joined_all = false;
                    break;
                }
            }

            let heartbeat_every = config.heartbeat_interval;
            let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            let mut pending_heartbeat: Option<String> = None;
            let mut should_run = true;

            while joined_all {
                tokio::select! {
                    msg = ws_rx.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws_tx.send(Message::Pong(payload)).await;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!(error = %e, "realtime socket error");
                                break;
                            }
                            _ => continue,
                        };
                        match serde_json::from_str::<PhoenixMessage>(&text) {
                            Ok(msg) => {
                                if let Routed::Status(topic, status) = route_message(msg, &channels, &mut pending_heartbeat) {
                                    debug!(topic = %topic, status = %status, "channel status");
                                }
                            }
                            Err(e) => debug!(error = %e, "ignoring unparseable frame"),
                        }
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(SocketCommand::Join { id, topic, payload, sink }) => {
                                let mut channel = JoinedChannel { id, payload, sink, join_ref: None };
                                let sent = send_join(&mut ws_tx, &mut refs, &topic, &mut channel).await;
                                channels.insert(topic.clone(), channel);
                                if let Err(e) = sent {
                                    warn!(topic = %topic, error = %e, "failed to send join");
                                    break;
                                }
                            }
                            Some(SocketCommand::Leave { id, topic }) => {
                                if channels.get(&topic).is_some_and(|c| c.id == id) {
                                    channels.remove(&topic);
                                    let frame = PhoenixMessage::new(topic, "phx_leave", json!({}), refs.next());
                                    if let Ok(frame) = frame.to_frame() {
                                        let _ = ws_tx.send(frame).await;
                                    }
                                }
                            }
                            Some(SocketCommand::Shutdown) | None => {
                                let _ = ws_tx.close().await;
                                should_run = false;
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if pending_heartbeat.is_some() {
                            warn!("heartbeat not acknowledged, dropping socket");
                            break;
                        }
                        let reference = refs.next();
                        let frame = PhoenixMessage::new(PHOENIX_TOPIC, "heartbeat", json!({}), reference.clone());
                        if let Ok(frame) = frame.to_frame() {
                            if let Err(e) = ws_tx.send(frame).await {
                                warn!(error = %e, "failed to send heartbeat");
                                break;
                            }
                            pending_heartbeat = Some(reference);
                        }
                    }
                }
            }

            // Channels whose join never went out are reported too, otherwise
            // the engine would only notice them at its join timeout.
            for channel in channels.values() {
                channel.sink.status(ChannelStatus::Closed);
            }
            channels.clear();

            if !should_run {
                break;
            }
            warn!("realtime socket disconnected");
        }

        state.send_replace(SocketState::Closed);
        debug!("realtime socket loop stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{detached_sink, ChannelMessage, ChannelPayload};
    use crate::event::ChangeKind;
    use crate::key::{EventFilter, SubscriptionKey};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn joined(topic: &str, join_ref: &str) -> (HashMap<String, JoinedChannel>, mpsc::UnboundedReceiver<ChannelMessage>) {
        let key = SubscriptionKey::table("missions", EventFilter::All, None);
        let (sink, rx) = detached_sink(key, 3);
        let mut channels = HashMap::new();
        channels.insert(
            topic.to_string(),
            JoinedChannel {
                id: 1,
                payload: Value::Null,
                sink,
                join_ref: Some(join_ref.to_string()),
            },
        );
        (channels, rx)
    }

    fn parse(raw: &str) -> PhoenixMessage {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_socket_url_carries_key_and_version() {
        let config = PhoenixConfig::new("wss://project.example.co/realtime/v1/websocket", "anon");
        let url = config.socket_url().unwrap();
        assert_eq!(url.query(), Some("apikey=anon&vsn=1.0.0"));
    }

    #[test]
    fn test_reconnect_delay_sticks_to_last_interval() {
        let config = PhoenixConfig::new("wss://x", "k");
        assert_eq!(config.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(config.reconnect_delay(40), Duration::from_secs(16));
    }

    #[test]
    fn test_join_payload_shape() {
        let key = SubscriptionKey::table("missions", EventFilter::Update, None);
        let binding = ChangeBinding::for_key(&key, "public");
        let payload = join_payload(&[binding], Some("jwt"));

        assert_eq!(payload["access_token"], "jwt");
        let changes = &payload["config"]["postgres_changes"];
        assert_eq!(changes[0]["event"], "UPDATE");
        assert_eq!(changes[0]["table"], "missions");
        assert!(changes[0].get("filter").is_none());
    }

    #[test]
    fn test_outbound_frame_uses_ref_field() {
        let msg = PhoenixMessage::new("phoenix", "heartbeat", json!({}), "7".to_string());
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["ref"], "7");
        assert!(encoded.get("join_ref").is_none());
    }

    #[test]
    fn test_join_reply_reports_status() {
        let (channels, mut rx) = joined("realtime:missions", "4");
        let mut heartbeat = None;

        let ok = parse(r#"{"topic":"realtime:missions","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"4"}"#);
        assert_eq!(
            route_message(ok, &channels, &mut heartbeat),
            Routed::Status("realtime:missions".into(), ChannelStatus::Subscribed)
        );
        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg.payload, ChannelPayload::Status(ChannelStatus::Subscribed)));

        let stale = parse(r#"{"topic":"realtime:missions","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#);
        assert_eq!(route_message(stale, &channels, &mut heartbeat), Routed::Ignored);
    }

    #[test]
    fn test_join_rejection_carries_reason() {
        let (channels, mut rx) = joined("realtime:missions", "4");
        let mut heartbeat = None;
        let err = parse(
            r#"{"topic":"realtime:missions","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"4"}"#,
        );
        route_message(err, &channels, &mut heartbeat);
        match rx.try_recv().unwrap().payload {
            ChannelPayload::Status(ChannelStatus::ChannelError(reason)) => assert_eq!(reason, "unauthorized"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_postgres_change_is_forwarded() {
        let (channels, mut rx) = joined("realtime:missions", "4");
        let mut heartbeat = None;
        let change = parse(
            r#"{"topic":"realtime:missions","event":"postgres_changes","payload":{"data":{"schema":"public","table":"missions","type":"UPDATE","commit_timestamp":"2024-01-01T00:00:00Z","record":{"id":"m1","status":"open"},"old_record":{"id":"m1"},"columns":[],"errors":null},"ids":[1]},"ref":null}"#,
        );

        assert_eq!(
            route_message(change, &channels, &mut heartbeat),
            Routed::Change("realtime:missions".into())
        );
        match rx.try_recv().unwrap().payload {
            ChannelPayload::Change(event) => {
                assert_eq!(event.kind, ChangeKind::Update);
                assert_eq!(event.row_id().as_deref(), Some("m1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_from_previous_join_is_ignored() {
        let (channels, mut rx) = joined("realtime:missions", "9");
        let mut heartbeat = None;

        let stale = parse(r#"{"topic":"realtime:missions","event":"phx_close","payload":{},"ref":"4"}"#);
        assert_eq!(route_message(stale, &channels, &mut heartbeat), Routed::Ignored);
        assert!(rx.try_recv().is_err());

        let current = parse(r#"{"topic":"realtime:missions","event":"phx_close","payload":{},"ref":"9"}"#);
        assert_eq!(
            route_message(current, &channels, &mut heartbeat),
            Routed::Status("realtime:missions".into(), ChannelStatus::Closed)
        );
    }

    #[test]
    fn test_heartbeat_reply_clears_pending() {
        let (channels, _rx) = joined("realtime:missions", "1");
        let mut heartbeat = Some("12".to_string());
        let reply = parse(r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"12"}"#);
        assert_eq!(route_message(reply, &channels, &mut heartbeat), Routed::HeartbeatAck);
        assert!(heartbeat.is_none());
    }

    #[derive(Default)]
    struct WireSink {
        sent: Vec<Message>,
        closed: bool,
    }

    impl Sink<Message> for WireSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            if self.closed {
                Poll::Ready(Err(tungstenite::Error::ConnectionClosed))
            } else {
                Poll::Ready(Ok(()))
            }
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> std::result::Result<(), Self::Error> {
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pending_channel() -> JoinedChannel {
        let key = SubscriptionKey::table("missions", EventFilter::All, None);
        let (sink, _rx) = detached_sink(key, 1);
        JoinedChannel { id: 1, payload: json!({ "config": {} }), sink, join_ref: None }
    }

    #[tokio::test]
    async fn test_join_ref_only_recorded_after_send() {
        let mut refs = RefCounter::default();

        let mut dead = WireSink { closed: true, ..Default::default() };
        let mut channel = pending_channel();
        let err = send_join(&mut dead, &mut refs, "realtime:missions", &mut channel)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::WebSocket(_)));
        assert!(channel.join_ref.is_none());
        assert!(dead.sent.is_empty());

        let mut wire = WireSink::default();
        let mut channel = pending_channel();
        send_join(&mut wire, &mut refs, "realtime:missions", &mut channel).await.unwrap();
        assert_eq!(channel.join_ref.as_deref(), Some("2"));

        let sent: Value = match &wire.sent[0] {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sent["event"], "phx_join");
        assert_eq!(sent["ref"], "2");
    }

    #[test]
    fn test_offline_commands_queue_and_cancel_joins() {
        let key = SubscriptionKey::table("missions", EventFilter::All, None);
        let (sink, _rx) = detached_sink(key, 1);
        let mut channels = HashMap::new();

        assert!(apply_offline(
            SocketCommand::Join { id: 5, topic: "realtime:m".into(), payload: Value::Null, sink },
            &mut channels,
        ));
        assert!(apply_offline(SocketCommand::Leave { id: 4, topic: "realtime:m".into() }, &mut channels));
        assert_eq!(channels.len(), 1);
        assert!(apply_offline(SocketCommand::Leave { id: 5, topic: "realtime:m".into() }, &mut channels));
        assert!(channels.is_empty());
        assert!(!apply_offline(SocketCommand::Shutdown, &mut channels));
    }
}
