//! Per-owner realtime channel handles.
//!
//! Every [`ChannelMultiplexer::channel`] call yields an independent
//! [`ChannelHandle`] with its own transport connection. Two handles on the same
//! name are never merged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use portico_core::{GatewayError, GatewayResult, ValidationError};
use portico_gateway::{
    BackendGateway, ChannelName, RealtimeEvent, RealtimePublisher, TransportGuard,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handlers registered under this name receive every event on the channel.
pub const ANY_EVENT: &str = "*";

type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Subscribing,
    Active,
    Unsubscribed,
}

/// Creates channel handles and keeps a weak registry of them for teardown.
#[derive(Debug, Clone)]
pub struct ChannelMultiplexer {
    gateway: BackendGateway,
    registry: Arc<Mutex<Vec<Weak<ChannelShared>>>>,
}

impl ChannelMultiplexer {
    pub fn new(gateway: BackendGateway) -> Self {
        Self {
            gateway,
            registry: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A fresh, unsubscribed handle for `name`.
    pub fn channel(&self, name: &str) -> Result<ChannelHandle, ValidationError> {
        let name = ChannelName::new(name)?;
        let shared = Arc::new(ChannelShared {
            name: name.clone(),
            handlers: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Idle,
                epoch: 0,
                link: None,
            }),
            gate: Mutex::new(()),
            dispatching: Mutex::new(None),
        });
        let mut registry = lock(&self.registry);
        registry.retain(|entry| entry.strong_count() > 0);
        registry.push(Arc::downgrade(&shared));
        Ok(ChannelHandle {
            gateway: self.gateway.clone(),
            shared,
        })
    }

    /// Names and states of handles that are still alive.
    pub fn channels(&self) -> Vec<(ChannelName, ChannelState)> {
        lock(&self.registry)
            .iter()
            .filter_map(Weak::upgrade)
            .map(|shared| (shared.name.clone(), shared.state()))
            .collect()
    }

    /// Unsubscribe every live handle.
    pub fn unsubscribe_all(&self) {
        let live: Vec<Arc<ChannelShared>> = {
            let mut registry = lock(&self.registry);
            registry.retain(|entry| entry.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for shared in live {
            shared.unsubscribe();
        }
    }
}

/// One owner's subscription to a named channel.
///
/// Dropping the handle tears the connection down.
pub struct ChannelHandle {
    gateway: BackendGateway,
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    name: ChannelName,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
    lifecycle: Mutex<Lifecycle>,
    /// Held while handlers run; `unsubscribe` takes it so it cannot return mid-dispatch.
    gate: Mutex<()>,
    /// Thread currently running handlers, if any.
    dispatching: Mutex<Option<ThreadId>>,
}

struct Lifecycle {
    state: ChannelState,
    /// Bumped by every subscribe and unsubscribe; stale connects and dispatchers compare against it.
    epoch: u64,
    link: Option<Link>,
}

struct Link {
    publisher: RealtimePublisher,
    dispatcher: JoinHandle<()>,
    guard: TransportGuard,
}

impl ChannelHandle {
    pub fn name(&self) -> &ChannelName {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Register `handler` for `event`, or for every event with [`ANY_EVENT`].
    ///
    /// Handlers run on the dispatch task in transport order. They may call
    /// [`unsubscribe`](Self::unsubscribe) on their own handle.
    pub fn on<F>(&self, event: &str, handler: F) -> &Self
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Open the transport connection. A no-op while subscribing or active.
    pub async fn subscribe(&self) -> GatewayResult<()> {
        let epoch = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if matches!(lifecycle.state, ChannelState::Subscribing | ChannelState::Active) {
                return Ok(());
            }
            lifecycle.state = ChannelState::Subscribing;
            lifecycle.epoch += 1;
            lifecycle.epoch
        };

        let connected = self.gateway.connect(&self.shared.name).await;

        let mut lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.epoch != epoch {
            debug!(channel = %self.shared.name, "unsubscribed while connecting; dropping connection");
            return Ok(());
        }
        match connected {
            Ok(connection) => {
                let (events, publisher, guard) = connection.into_parts();
                let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&self.shared), events, epoch));
                lifecycle.link = Some(Link {
                    publisher,
                    dispatcher,
                    guard,
                });
                lifecycle.state = ChannelState::Active;
                info!(channel = %self.shared.name, provider = self.gateway.provider(), "channel subscribed");
                Ok(())
            }
            Err(err) => {
                lifecycle.state = ChannelState::Idle;
                Err(err)
            }
        }
    }

    /// Close the connection and drop every handler.
    ///
    /// Safe to call repeatedly. Once it returns no handler of this handle runs
    /// again, including for events the transport already delivered.
    pub fn unsubscribe(&self) {
        self.shared.unsubscribe();
    }

    /// Publish on the channel. Fails unless the handle is active.
    pub async fn send(&self, event: &str, payload: Value) -> GatewayResult<()> {
        let publisher = {
            let lifecycle = lock(&self.shared.lifecycle);
            match (&lifecycle.state, &lifecycle.link) {
                (ChannelState::Active, Some(link)) => link.publisher.clone(),
                _ => {
                    return Err(GatewayError::transport(
                        self.gateway.provider(),
                        format!("channel {} is not subscribed", self.shared.name),
                    ))
                }
            }
        };
        publisher.send(RealtimeEvent::new(event, payload)).await
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shared.unsubscribe();
    }
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        lock(&self.lifecycle).state
    }

    fn is_current(&self, epoch: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.state == ChannelState::Active && lifecycle.epoch == epoch
    }

    fn unsubscribe(&self) {
        let inside_handler = *lock(&self.dispatching) == Some(thread::current().id());
        let gate = if inside_handler { None } else { Some(lock(&self.gate)) };
        let link = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == ChannelState::Unsubscribed {
                return;
            }
            lifecycle.state = ChannelState::Unsubscribed;
            lifecycle.epoch += 1;
            lock(&self.handlers).clear();
            lifecycle.link.take()
        };
        drop(gate);
        if let Some(mut link) = link {
            link.dispatcher.abort();
            link.guard.close();
            info!(channel = %self.name, "channel unsubscribed");
        }
    }

    fn deliver(&self, event: &RealtimeEvent, epoch: u64) {
        let _gate = lock(&self.gate);
        *lock(&self.dispatching) = Some(thread::current().id());
        let handlers: Vec<Handler> = {
            let handlers = lock(&self.handlers);
            handlers
                .get(&event.event)
                .into_iter()
                .chain(handlers.get(ANY_EVENT))
                .flatten()
                .cloned()
                .collect()
        };
        for handler in handlers {
            if !self.is_current(epoch) {
                break;
            }
            handler(event);
        }
        *lock(&self.dispatching) = None;
    }
}

async fn dispatch(shared: Weak<ChannelShared>, mut events: mpsc::Receiver<RealtimeEvent>, epoch: u64) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.is_current(epoch) {
            return;
        }
        shared.deliver(&event, epoch);
    }
    debug!("channel event stream closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_gateway::MemoryProvider;
    use serde_json::json;
    use std::time::Duration;

    fn multiplexer() -> (ChannelMultiplexer, MemoryProvider) {
        let memory = MemoryProvider::new();
        let gateway = BackendGateway::new(Arc::new(memory.clone()));
        (ChannelMultiplexer::new(gateway), memory)
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("sender alive")
    }

    #[tokio::test]
    async fn test_send_requires_active_state() {
        let (mux, _) = multiplexer();
        let handle = mux.channel("room").unwrap();
        assert_eq!(handle.state(), ChannelState::Idle);
        assert!(handle.send("typing", json!({})).await.is_err());

        handle.subscribe().await.unwrap();
        assert_eq!(handle.state(), ChannelState::Active);
        handle.send("typing", json!({})).await.unwrap();

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(handle.state(), ChannelState::Unsubscribed);
        assert!(handle.send("typing", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_independent_handles_exchange_events() {
        let (mux, _) = multiplexer();
        let sender = mux.channel("room").unwrap();
        let receiver = mux.channel("room").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on("typing", move |event| {
            let _ = tx.send(event.payload.clone());
        });
        sender.subscribe().await.unwrap();
        receiver.subscribe().await.unwrap();

        sender.send("typing", json!({"user": "a"})).await.unwrap();
        assert_eq!(recv(&mut rx).await, json!({"user": "a"}));
        assert_eq!(mux.channels().len(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_handler_sees_row_changes() {
        let (mux, memory) = multiplexer();
        let handle = mux.channel("db:todos").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on(ANY_EVENT, move |event| {
            let _ = tx.send(event.event.clone());
        });
        handle.subscribe().await.unwrap();
        memory.publish(
            &ChannelName::for_table("todos").unwrap(),
            RealtimeEvent::new("insert", json!({"id": "1"})),
        );
        assert_eq!(recv(&mut rx).await, "insert");
    }

    #[tokio::test]
    async fn test_no_handler_runs_after_unsubscribe() {
        let (mux, memory) = multiplexer();
        let handle = mux.channel("room").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on("ping", move |_| {
            let _ = tx.send(());
        });
        handle.subscribe().await.unwrap();
        handle.unsubscribe();

        let room = ChannelName::new("room").unwrap();
        for _ in 0..5 {
            memory.publish(&room, RealtimeEvent::new("ping", json!({})));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_may_unsubscribe_its_own_handle() {
        let (mux, memory) = multiplexer();
        let handle = Arc::new(mux.channel("room").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&handle);
        handle.on("bye", move |_| {
            if let Some(handle) = weak.upgrade() {
                handle.unsubscribe();
            }
            let _ = tx.send(());
        });
        handle.subscribe().await.unwrap();
        memory.publish(&ChannelName::new("room").unwrap(), RealtimeEvent::new("bye", json!({})));
        recv(&mut rx).await;
        assert_eq!(handle.state(), ChannelState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_failed_subscribe_returns_to_idle() {
        let (mux, memory) = multiplexer();
        memory.set_reachable(false);
        let handle = mux.channel("room").unwrap();
        assert!(handle.subscribe().await.is_err());
        assert_eq!(handle.state(), ChannelState::Idle);

        memory.set_reachable(true);
        handle.subscribe().await.unwrap();
        assert_eq!(handle.state(), ChannelState::Active);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_and_drop() {
        let (mux, _) = multiplexer();
        let a = mux.channel("a").unwrap();
        let b = mux.channel("b").unwrap();
        a.subscribe().await.unwrap();
        b.subscribe().await.unwrap();
        mux.unsubscribe_all();
        assert_eq!(a.state(), ChannelState::Unsubscribed);
        assert_eq!(b.state(), ChannelState::Unsubscribed);
        drop(a);
        assert_eq!(mux.channels().len(), 1);
    }

    #[test]
    fn test_invalid_channel_name() {
        let (mux, _) = multiplexer();
        assert!(mux.channel("").is_err());
        assert!(mux.channel("db:").is_err());
    }
}
