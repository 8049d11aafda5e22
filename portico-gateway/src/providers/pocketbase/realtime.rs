//! Server-sent-events transport for PocketBase realtime.
//!
//! The server opens with a `PB_CONNECT` event carrying a client id; the
//! subscription set is then POSTed for that id. Publishing from the client is
//! not part of the protocol.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use portico_core::{GatewayError, GatewayResult, ReconnectConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::sse::{SseEvent, SseParser};
use super::{PocketbaseProvider, PROVIDER_NAME};
use crate::capability::RealtimeCapability;
use crate::http::HttpClient;
use crate::realtime::{
    Backoff, ChannelName, RealtimeConnection, RealtimeEvent, EVENT_DELETE, EVENT_INSERT,
    EVENT_UPDATE,
};

const CONNECT_EVENT: &str = "PB_CONNECT";
const EVENT_BUFFER: usize = 256;

type ByteStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

#[derive(Debug, Deserialize)]
struct ConnectPayload {
    #[serde(rename = "clientId")]
    client_id: String,
}

/// Subscription topic for a channel: `<collection>/*` for row changes, the
/// channel name itself for custom topics.
fn topic_for(channel: &ChannelName) -> String {
    match channel.table() {
        Some(table) => format!("{}/*", table),
        None => channel.to_string(),
    }
}

/// Translate one SSE event into a channel event.
fn decode_event(event: &SseEvent, channel: &ChannelName, topic: &str) -> Option<RealtimeEvent> {
    if event.event != topic {
        return None;
    }
    let data: Value = match serde_json::from_str(&event.data) {
        Ok(data) => data,
        Err(e) => {
            debug!(topic, error = %e, "ignoring undecodable realtime event");
            return None;
        }
    };
    if channel.table().is_some() {
        let name = match data.get("action")?.as_str()? {
            "create" => EVENT_INSERT,
            "update" => EVENT_UPDATE,
            "delete" => EVENT_DELETE,
            _ => return None,
        };
        let record = data.get("record").cloned().unwrap_or(Value::Null);
        return Some(RealtimeEvent::new(name, record));
    }
    match (data.get("event").and_then(Value::as_str), data.get("payload")) {
        (Some(name), Some(payload)) => Some(RealtimeEvent::new(name, payload.clone())),
        _ => Some(RealtimeEvent::new(topic, data)),
    }
}

/// Everything needed to (re)open the stream for one channel.
#[derive(Clone)]
struct StreamPlan {
    http: HttpClient,
    token: Option<String>,
    channel: ChannelName,
    topic: String,
}

struct OpenStream {
    stream: ByteStream,
    parser: SseParser,
    /// Events that arrived in the same chunk as `PB_CONNECT`.
    pending: Vec<SseEvent>,
}

impl StreamPlan {
    async fn open(&self) -> GatewayResult<OpenStream> {
        let request = self
            .http
            .streaming()
            .get(self.http.url("/api/realtime"))
            .header("Accept", "text/event-stream");
        let response = self.http.send(request).await?;
        let response = self.http.check_status(response).await?;
        let mut stream: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        let mut parser = SseParser::new();

        let mut client_id = None;
        let mut pending = Vec::new();
        while client_id.is_none() {
            let chunk = match stream.next().await {
                Some(chunk) => chunk.map_err(|e| self.http.map_error(e))?,
                None => {
                    return Err(GatewayError::transport(
                        PROVIDER_NAME,
                        "realtime stream ended before PB_CONNECT",
                    ))
                }
            };
            for event in parser.push(&chunk) {
                if client_id.is_some() {
                    pending.push(event);
                } else if event.event == CONNECT_EVENT {
                    let payload: ConnectPayload = serde_json::from_str(&event.data)
                        .map_err(|e| GatewayError::invalid_response(PROVIDER_NAME, e.to_string()))?;
                    client_id = Some(payload.client_id);
                }
            }
        }

        let mut subscribe = self
            .http
            .client()
            .post(self.http.url("/api/realtime"))
            .json(&json!({ "clientId": client_id, "subscriptions": [self.topic] }));
        if let Some(token) = &self.token {
            subscribe = subscribe.header("Authorization", token);
        }
        self.http.send_empty(subscribe).await?;
        Ok(OpenStream {
            stream,
            parser,
            pending,
        })
    }
}

/// Pump one open stream until it ends or the receiver goes away.
///
/// Returns `false` when the owning connection is gone.
async fn pump(plan: &StreamPlan, open: &mut OpenStream, events: &mpsc::Sender<RealtimeEvent>) -> bool {
    for sse in std::mem::take(&mut open.pending) {
        if let Some(event) = decode_event(&sse, &plan.channel, &plan.topic) {
            if events.send(event).await.is_err() {
                return false;
            }
        }
    }
    loop {
        let chunk = tokio::select! {
            chunk = open.stream.next() => chunk,
            _ = events.closed() => return false,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for sse in open.parser.push(&bytes) {
                    if let Some(event) = decode_event(&sse, &plan.channel, &plan.topic) {
                        if events.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!(provider = PROVIDER_NAME, topic = %plan.topic, error = %e, "realtime stream failed");
                return true;
            }
            None => {
                warn!(provider = PROVIDER_NAME, topic = %plan.topic, "realtime stream ended");
                return true;
            }
        }
    }
}

async fn run_transport(
    plan: StreamPlan,
    mut open: OpenStream,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<RealtimeEvent>,
) {
    let mut backoff = Backoff::new(reconnect);
    loop {
        if !pump(&plan, &mut open, &events).await {
            return;
        }
        open = loop {
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
            if events.is_closed() {
                return;
            }
            match plan.open().await {
                Ok(open) => {
                    backoff.reset();
                    info!(provider = PROVIDER_NAME, topic = %plan.topic, "realtime reconnected");
                    break open;
                }
                Err(e) => {
                    debug!(provider = PROVIDER_NAME, topic = %plan.topic, error = %e, delay_ms = delay.as_millis() as u64, "realtime reconnect failed");
                }
            }
        };
    }
}

#[async_trait]
impl RealtimeCapability for PocketbaseProvider {
    async fn connect(&self, channel: &ChannelName) -> GatewayResult<RealtimeConnection> {
        let plan = StreamPlan {
            http: self.http.clone(),
            token: self.access_token(),
            channel: channel.clone(),
            topic: topic_for(channel),
        };
        let open = plan.open().await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_transport(plan, open, self.reconnect.clone(), events_tx));
        Ok(RealtimeConnection::new(PROVIDER_NAME, events_rx, None, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: Value) -> SseEvent {
        SseEvent {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn test_topics() {
        assert_eq!(topic_for(&ChannelName::for_table("todos").unwrap()), "todos/*");
        assert_eq!(topic_for(&ChannelName::new("room").unwrap()), "room");
    }

    #[test]
    fn test_decode_record_actions() {
        let channel = ChannelName::for_table("todos").unwrap();
        let event = decode_event(
            &sse("todos/*", json!({"action": "create", "record": {"id": "1"}})),
            &channel,
            "todos/*",
        )
        .unwrap();
        assert_eq!(event, RealtimeEvent::new(EVENT_INSERT, json!({"id": "1"})));

        let delete = decode_event(
            &sse("todos/*", json!({"action": "delete", "record": {"id": "1"}})),
            &channel,
            "todos/*",
        )
        .unwrap();
        assert_eq!(delete.event, EVENT_DELETE);
    }

    #[test]
    fn test_decode_custom_topic() {
        let channel = ChannelName::new("room").unwrap();
        let shaped = decode_event(
            &sse("room", json!({"event": "typing", "payload": {"u": 1}})),
            &channel,
            "room",
        )
        .unwrap();
        assert_eq!(shaped, RealtimeEvent::new("typing", json!({"u": 1})));

        let raw = decode_event(&sse("room", json!({"x": 1})), &channel, "room").unwrap();
        assert_eq!(raw, RealtimeEvent::new("room", json!({"x": 1})));

        assert!(decode_event(&sse("PB_CONNECT", json!({})), &channel, "room").is_none());
    }
}
