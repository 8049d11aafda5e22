//! Phoenix channel transport for Supabase Realtime.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use portico_core::{GatewayError, GatewayResult, ReconnectConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{SupabaseProvider, PROVIDER_NAME};
use crate::capability::RealtimeCapability;
use crate::realtime::{
    Backoff, ChannelName, RealtimeConnection, RealtimeEvent, EVENT_DELETE, EVENT_INSERT,
    EVENT_UPDATE,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<Value>,
}

/// Everything the transport task needs to (re)join one channel.
#[derive(Debug, Clone)]
struct JoinPlan {
    url: String,
    topic: String,
    join_payload: Value,
}

impl JoinPlan {
    fn new(base_url: &str, anon_key: &str, access_token: Option<String>, channel: &ChannelName) -> Self {
        let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base_url.to_string()
        };
        let url = format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base,
            urlencoding::encode(anon_key)
        );
        let postgres_changes = match channel.table() {
            Some(table) => json!([{ "event": "*", "schema": "public", "table": table }]),
            None => json!([]),
        };
        let mut join_payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
                "postgres_changes": postgres_changes,
            }
        });
        if let Some(token) = access_token {
            join_payload["access_token"] = Value::String(token);
        }
        Self {
            url,
            topic: format!("realtime:{}", channel),
            join_payload,
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// The owning connection was dropped; stop for good.
    Closed,
    /// The socket failed; reconnect.
    Disrupted(String),
}

struct ChannelSession {
    socket: Socket,
    next_ref: u64,
}

impl ChannelSession {
    async fn open(plan: &JoinPlan) -> GatewayResult<Self> {
        let (socket, _) = connect_async(plan.url.as_str())
            .await
            .map_err(|e| GatewayError::transport(PROVIDER_NAME, e.to_string()))?;
        let mut session = Self { socket, next_ref: 0 };
        session
            .push(&plan.topic, "phx_join", plan.join_payload.clone())
            .await
            .map_err(|e| GatewayError::transport(PROVIDER_NAME, e))?;
        Ok(session)
    }

    async fn push(&mut self, topic: &str, event: &str, payload: Value) -> Result<(), String> {
        self.next_ref += 1;
        let frame = PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(Value::String(self.next_ref.to_string())),
        };
        let text = serde_json::to_string(&frame).map_err(|e| e.to_string())?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| e.to_string())
    }

    async fn run(
        &mut self,
        plan: &JoinPlan,
        events: &mpsc::Sender<RealtimeEvent>,
        outbound: &mut mpsc::Receiver<RealtimeEvent>,
    ) -> SessionEnd {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.push("phoenix", "heartbeat", json!({})).await {
                        return SessionEnd::Disrupted(e);
                    }
                }
                outgoing = outbound.recv() => {
                    let Some(event) = outgoing else {
                        let _ = self.push(&plan.topic, "phx_leave", json!({})).await;
                        let _ = self.socket.close(None).await;
                        return SessionEnd::Closed;
                    };
                    let payload = json!({
                        "type": "broadcast",
                        "event": event.event,
                        "payload": event.payload,
                    });
                    if let Err(e) = self.push(&plan.topic, "broadcast", payload).await {
                        return SessionEnd::Disrupted(e);
                    }
                }
                incoming = self.socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = decode_frame(&text, &plan.topic) {
                            if events.send(event).await.is_err() {
                                return SessionEnd::Closed;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Disrupted(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Disrupted(e.to_string()),
                    None => return SessionEnd::Disrupted("socket ended".to_string()),
                },
            }
        }
    }
}

/// Translate one Phoenix frame into a channel event, if it carries one.
fn decode_frame(text: &str, topic: &str) -> Option<RealtimeEvent> {
    let message: PhoenixMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "ignoring undecodable realtime frame");
            return None;
        }
    };
    if message.topic != topic {
        return None;
    }
    match message.event.as_str() {
        "broadcast" => {
            let event = message.payload.get("event")?.as_str()?.to_string();
            let payload = message.payload.get("payload").cloned().unwrap_or(Value::Null);
            Some(RealtimeEvent::new(event, payload))
        }
        "postgres_changes" => {
            let data = message.payload.get("data")?;
            let (event, record_field) = match data.get("type")?.as_str()? {
                "INSERT" => (EVENT_INSERT, "record"),
                "UPDATE" => (EVENT_UPDATE, "record"),
                "DELETE" => (EVENT_DELETE, "old_record"),
                _ => return None,
            };
            let record = data.get(record_field).cloned().unwrap_or(Value::Null);
            Some(RealtimeEvent::new(event, record))
        }
        "phx_reply" => {
            let status = message.payload.get("status").and_then(Value::as_str);
            if status == Some("error") {
                warn!(topic, response = %message.payload, "realtime join rejected");
            }
            None
        }
        "phx_error" | "phx_close" => {
            debug!(topic, event = %message.event, "realtime channel closed by server");
            None
        }
        _ => None,
    }
}

async fn run_transport(
    plan: JoinPlan,
    mut session: ChannelSession,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<RealtimeEvent>,
    mut outbound: mpsc::Receiver<RealtimeEvent>,
) {
    let mut backoff = Backoff::new(reconnect);
    loop {
        match session.run(&plan, &events, &mut outbound).await {
            SessionEnd::Closed => return,
            SessionEnd::Disrupted(reason) => {
                warn!(provider = PROVIDER_NAME, topic = %plan.topic, reason = %reason, "realtime connection lost");
            }
        }
        session = loop {
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
            if events.is_closed() {
                return;
            }
            match ChannelSession::open(&plan).await {
                Ok(session) => {
                    backoff.reset();
                    info!(provider = PROVIDER_NAME, topic = %plan.topic, "realtime reconnected");
                    break session;
                }
                Err(e) => {
                    debug!(provider = PROVIDER_NAME, topic = %plan.topic, error = %e, delay_ms = delay.as_millis() as u64, "realtime reconnect failed");
                }
            }
        };
    }
}

#[async_trait]
impl RealtimeCapability for SupabaseProvider {
    async fn connect(&self, channel: &ChannelName) -> GatewayResult<RealtimeConnection> {
        let plan = JoinPlan::new(self.http.base_url(), &self.anon_key, self.access_token(), channel);
        let session = ChannelSession::open(&plan).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_transport(
            plan,
            session,
            self.reconnect.clone(),
            events_tx,
            outbound_rx,
        ));
        Ok(RealtimeConnection::new(
            PROVIDER_NAME,
            events_rx,
            Some(outbound_tx),
            task,
        ))
    }
}
