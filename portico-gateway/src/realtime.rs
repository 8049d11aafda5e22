//! Realtime transport plumbing shared by all providers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portico_core::{GatewayError, GatewayResult, ReconnectConfig, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Prefix of channels that carry row changes for a table, e.g. `db:todos`.
pub const DB_CHANNEL_PREFIX: &str = "db:";

/// Event names used for row changes on `db:` channels, on every provider.
pub const EVENT_INSERT: &str = "insert";
pub const EVENT_UPDATE: &str = "update";
pub const EVENT_DELETE: &str = "delete";

/// Validated channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::missing("channel"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ValidationError::invalid("channel", "must not contain whitespace"));
        }
        if name == DB_CHANNEL_PREFIX {
            return Err(ValidationError::invalid("channel", "missing table after 'db:'"));
        }
        Ok(Self(name))
    }

    /// A channel carrying row changes for `table`.
    pub fn for_table(table: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}{}", DB_CHANNEL_PREFIX, table))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The table name when this is a `db:<table>` channel.
    pub fn table(&self) -> Option<&str> {
        self.0.strip_prefix(DB_CHANNEL_PREFIX)
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One event on a channel, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub payload: Value,
}

impl RealtimeEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// A live transport connection bound to one channel.
///
/// Dropping it (or calling [`close`](Self::close)) stops the transport task,
/// which closes the underlying socket or stream.
#[derive(Debug)]
pub struct RealtimeConnection {
    provider: String,
    events: mpsc::Receiver<RealtimeEvent>,
    outbound: Option<mpsc::Sender<RealtimeEvent>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeConnection {
    /// `outbound` is `None` for transports that cannot publish.
    pub fn new(
        provider: impl Into<String>,
        events: mpsc::Receiver<RealtimeEvent>,
        outbound: Option<mpsc::Sender<RealtimeEvent>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            provider: provider.into(),
            events,
            outbound,
            task: Some(task),
        }
    }

    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }

    pub async fn send(&self, event: RealtimeEvent) -> GatewayResult<()> {
        send_on(&self.provider, self.outbound.as_ref(), event).await
    }

    /// Split into the inbound stream, a publisher, and the guard that owns the
    /// transport task.
    pub fn into_parts(
        mut self,
    ) -> (
        mpsc::Receiver<RealtimeEvent>,
        RealtimePublisher,
        TransportGuard,
    ) {
        let (placeholder_tx, placeholder_rx) = mpsc::channel(1);
        drop(placeholder_tx);
        let events = std::mem::replace(&mut self.events, placeholder_rx);
        let publisher = RealtimePublisher {
            provider: self.provider.clone(),
            outbound: self.outbound.take(),
        };
        let guard = TransportGuard {
            task: self.task.take(),
        };
        (events, publisher, guard)
    }

    pub fn close(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outbound half of a [`RealtimeConnection`].
#[derive(Debug, Clone)]
pub struct RealtimePublisher {
    provider: String,
    outbound: Option<mpsc::Sender<RealtimeEvent>>,
}

impl RealtimePublisher {
    pub async fn send(&self, event: RealtimeEvent) -> GatewayResult<()> {
        send_on(&self.provider, self.outbound.as_ref(), event).await
    }
}

/// Owns a transport task; aborts it on drop.
#[derive(Debug)]
pub struct TransportGuard {
    task: Option<JoinHandle<()>>,
}

impl TransportGuard {
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_on(
    provider: &str,
    outbound: Option<&mpsc::Sender<RealtimeEvent>>,
    event: RealtimeEvent,
) -> GatewayResult<()> {
    let outbound = outbound.ok_or_else(|| GatewayError::unsupported(provider, "realtime send"))?;
    outbound
        .send(event)
        .await
        .map_err(|_| GatewayError::transport(provider, "realtime connection closed"))
}

/// Exponential reconnect schedule with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current_ms: u64,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_ms = config.initial_ms;
        Self { config, current_ms }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_backoff(self.current_ms, self.config.jitter_ms);
        let next = (self.current_ms as f64 * self.config.multiplier) as u64;
        self.current_ms = next.min(self.config.max_ms).max(self.config.initial_ms);
        Duration::from_millis(delay)
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(ChannelName::new("room-1").is_ok());
        assert!(ChannelName::new("").is_err());
        assert!(ChannelName::new("two words").is_err());
        assert!(ChannelName::new("db:").is_err());
        assert_eq!(ChannelName::for_table("todos").unwrap().table(), Some("todos"));
        assert_eq!(ChannelName::new("room").unwrap().table(), None);
    }

    #[test]
    fn test_backoff_grows_to_max_and_resets() {
        let mut backoff = Backoff::new(ReconnectConfig {
            initial_ms: 100,
            max_ms: 350,
            multiplier: 2.0,
            jitter_ms: 0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..100 {
            let delay = jittered_backoff(100, 50);
            assert!((100..150).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_send_without_outbound_is_unsupported() {
        let (_tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(async {});
        let conn = RealtimeConnection::new("pocketbase", rx, None, task);
        let err = conn
            .send(RealtimeEvent::new("ping", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }
}
