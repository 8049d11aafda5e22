//! Backend health monitoring.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use portico_core::{HealthConfig, HealthStatus, ProbeReport, ValidationError};
use portico_gateway::BackendGateway;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type Listener = Arc<dyn Fn(&HealthStatus) + Send + Sync>;

/// Periodic liveness probe against the gateway.
///
/// Each probe is bounded by the configured timeout. A probe that errors or
/// times out yields `down` without latency; a successful probe slower than the
/// degraded threshold, or one the adapter reports as degraded, yields
/// `degraded`. Failed probes never stop the polling loop.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    gateway: BackendGateway,
    timeout: Duration,
    degraded_latency: Duration,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener: AtomicU64,
    last: RwLock<Option<HealthStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by `stop`; a tick only notifies while its generation is current.
    generation: AtomicU64,
    /// Held while listeners run so `stop` can wait them out.
    gate: Mutex<()>,
    /// Thread currently running listeners, if any.
    notifying: Mutex<Option<ThreadId>>,
}

/// Returned by [`HealthMonitor::on_health_change`].
#[derive(Debug)]
pub struct HealthSubscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl HealthSubscription {
    /// Stop receiving status updates. Calling it more than once is harmless.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.monitor.upgrade() {
            lock(&inner.listeners).remove(&self.id);
        }
    }
}

impl HealthMonitor {
    pub fn new(gateway: BackendGateway, config: &HealthConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                gateway,
                timeout: config.timeout(),
                degraded_latency: config.degraded_latency(),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(0),
                last: RwLock::new(None),
                task: Mutex::new(None),
                generation: AtomicU64::new(0),
                gate: Mutex::new(()),
                notifying: Mutex::new(None),
            }),
        }
    }

    /// Probe once and return the result. Listeners are not notified.
    pub async fn check_backend_health(&self) -> HealthStatus {
        self.inner.probe().await
    }

    /// Start polling every `interval`, probing once immediately.
    ///
    /// Returns `Ok(false)` without doing anything when already running. A zero
    /// interval is rejected.
    pub fn start(&self, interval: Duration) -> Result<bool, ValidationError> {
        if interval.is_zero() {
            return Err(ValidationError::invalid("interval", "must be > 0"));
        }
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(poll(weak, interval, generation)));
        info!(interval_ms = interval.as_millis() as u64, provider = self.inner.gateway.provider(), "health monitor started");
        Ok(true)
    }

    /// Stop polling. No listener is invoked after this returns.
    ///
    /// A no-op when not running. May be called from a listener, in which case
    /// the listeners after it on that tick are skipped.
    pub fn stop(&self) {
        let handle = lock(&self.inner.task).take();
        let Some(handle) = handle else {
            return;
        };
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let inside_listener = *lock(&self.inner.notifying) == Some(thread::current().id());
        if !inside_listener {
            drop(lock(&self.inner.gate));
        }
        handle.abort();
        info!("health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Register `listener` for the status produced by every polling tick,
    /// whether or not it changed.
    ///
    /// Listeners run on the polling task.
    pub fn on_health_change<F>(&self, listener: F) -> HealthSubscription
    where
        F: Fn(&HealthStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, Arc::new(listener));
        HealthSubscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Result of the most recent completed probe.
    pub fn last_status(&self) -> Option<HealthStatus> {
        self.inner
            .last
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("provider", &self.inner.gateway.provider())
            .field("timeout", &self.inner.timeout)
            .field("degraded_latency", &self.inner.degraded_latency)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

impl MonitorInner {
    async fn probe(&self) -> HealthStatus {
        let provider = self.gateway.provider().to_string();
        let started = Instant::now();
        let status = match tokio::time::timeout(self.timeout, self.gateway.ping()).await {
            Ok(Ok(report)) => {
                let elapsed = started.elapsed();
                let latency_ms = elapsed.as_millis() as u64;
                if report == ProbeReport::Degraded || elapsed > self.degraded_latency {
                    HealthStatus::degraded(provider, latency_ms)
                } else {
                    HealthStatus::ok(provider, latency_ms)
                }
            }
            Ok(Err(err)) => {
                warn!(provider = %provider, error = %err, "health probe failed");
                HealthStatus::down(provider)
            }
            Err(_) => {
                warn!(provider = %provider, timeout_ms = self.timeout.as_millis() as u64, "health probe timed out");
                HealthStatus::down(provider)
            }
        };
        *self.last.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status.clone());
        status
    }

    fn notify(&self, status: &HealthStatus, generation: u64) {
        let _gate = lock(&self.gate);
        *lock(&self.notifying) = Some(thread::current().id());
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            listener(status);
        }
        *lock(&self.notifying) = None;
    }
}

async fn poll(monitor: Weak<MonitorInner>, interval: Duration, generation: u64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = monitor.upgrade() else {
            return;
        };
        let status = inner.probe().await;
        debug!(status = ?status.status, latency_ms = ?status.latency_ms, "health tick");
        inner.notify(&status, generation);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::HealthState;
    use portico_gateway::MemoryProvider;

    fn monitor(memory: &MemoryProvider) -> HealthMonitor {
        let gateway = BackendGateway::new(Arc::new(memory.clone()));
        HealthMonitor::new(
            gateway,
            &HealthConfig {
                interval_ms: 1000,
                timeout_ms: 500,
                degraded_latency_ms: 200,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_classification() {
        let memory = MemoryProvider::new();
        let monitor = monitor(&memory);

        let status = monitor.check_backend_health().await;
        assert_eq!(status.status, HealthState::Ok);
        assert!(status.latency_ms.is_some());
        assert_eq!(status.provider, "memory");

        memory.set_latency(Duration::from_millis(300));
        assert_eq!(monitor.check_backend_health().await.status, HealthState::Degraded);

        memory.set_latency(Duration::from_millis(900));
        let status = monitor.check_backend_health().await;
        assert_eq!(status.status, HealthState::Down);
        assert!(status.latency_ms.is_none());

        memory.set_latency(Duration::ZERO);
        memory.set_degraded(true);
        assert_eq!(monitor.check_backend_health().await.status, HealthState::Degraded);

        memory.set_reachable(false);
        assert_eq!(monitor.check_backend_health().await.status, HealthState::Down);
        assert_eq!(monitor.last_status().unwrap().status, HealthState::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_is_noop_when_idle() {
        let memory = MemoryProvider::new();
        let monitor = monitor(&memory);
        monitor.stop();
        assert_eq!(monitor.start(Duration::from_secs(1)), Ok(true));
        assert_eq!(monitor.start(Duration::from_secs(1)), Ok(false));
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(monitor.start(Duration::from_secs(1)), Ok(true));
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_rejected() {
        let memory = MemoryProvider::new();
        let monitor = monitor(&memory);
        assert!(monitor.start(Duration::ZERO).is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_may_stop_the_monitor() {
        use std::sync::atomic::AtomicUsize;

        let memory = MemoryProvider::new();
        let monitor = monitor(&memory);
        let calls = Arc::new(AtomicUsize::new(0));
        let later_calls = Arc::new(AtomicUsize::new(0));
        let _stopper = monitor.on_health_change({
            let monitor = monitor.clone();
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                monitor.stop();
            }
        });
        let _later = monitor.on_health_change({
            let later_calls = later_calls.clone();
            move |_| {
                later_calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(monitor.start(Duration::from_secs(1)), Ok(true));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }
}
