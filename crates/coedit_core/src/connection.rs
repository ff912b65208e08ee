//! Connection state machine with exponential-backoff reconnection.
//!
//! The [`ConnectionManager`] does not own a transport. It repeatedly runs an
//! injected async [`ConnectionTest`] and turns the outcomes into a
//! [`ConnectionState`]:
//!
//! ```text
//!               online + test registered
//! Disconnected ─────────────────────────▶ Connecting / Reconnecting
//!      ▲                                      │ ok          │ error / timeout
//!      │ health check fails                   ▼             ▼
//!      │ network offline                 Connected     retry_count < max ─▶ wait backoff ─▶ Reconnecting
//!      └──────────────────────────────────────┘         retry_count == max ─▶ Failed
//! ```
//!
//! `Failed` is terminal until [`ConnectionManager::reconnect`] or
//! [`ConnectionManager::reset`]. Every transition is published on a watch
//! channel.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use ts_rs::TS;

use crate::config::ConnectionConfig;
use crate::error::{CoeditError, Result};
use crate::network::NetworkMonitor;
use crate::remote::BoxFuture;
use crate::scheduler::ScheduledTask;

/// Async connectivity check. Resolves to `Ok(())` when the remote is reachable.
pub type ConnectionTest = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Connection state, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ConnectionState {
    /// No connection and no attempt in progress
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// The last connectivity test succeeded
    Connected,
    /// A retry is pending or in progress
    Reconnecting,
    /// Retries are exhausted; waiting for a manual reconnect
    Failed,
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// Failed attempts since the last success
    pub retry_count: u32,
    /// Most recent failure
    pub last_error: Option<String>,
    /// When the pending retry fires
    pub next_retry_at: Option<Instant>,
    /// Last time a connectivity test succeeded
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            last_connected_at: None,
        }
    }
}

/// Backoff delay before retry number `attempt` (1-based), without jitter.
///
/// `min(initial × multiplier^(attempt-1), max)`
pub fn compute_retry_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base = config.initial_retry_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = base.min(config.max_retry_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Random extra delay of at most 10% of `base`.
fn jitter(base: Duration) -> Duration {
    let max = base.as_millis() as u64 / 10;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Drives the connection state machine. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    network: NetworkMonitor,
    snapshot: watch::Sender<ConnectionSnapshot>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    test: Option<ConnectionTest>,
    attempt: Option<ScheduledTask>,
    retry_timer: Option<ScheduledTask>,
    health_timer: Option<ScheduledTask>,
    network_watcher: Option<ScheduledTask>,
    /// Bumped whenever in-flight work must be ignored
    generation: u64,
    has_attempted: bool,
}

impl Control {
    fn clear_timers(&mut self) {
        self.generation += 1;
        self.attempt = None;
        self.retry_timer = None;
        self.health_timer = None;
    }
}

impl ConnectionManager {
    /// Create a manager listening to `network`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ConnectionConfig, network: NetworkMonitor) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        let inner = Arc::new(Inner {
            config,
            network,
            snapshot,
            control: Mutex::new(Control::default()),
        });

        let mut online = inner.network.subscribe();
        let weak = Arc::downgrade(&inner);
        let watcher = ScheduledTask::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if is_online {
                    inner.on_online();
                } else {
                    inner.on_offline();
                }
            }
        });
        inner.control.lock().unwrap().network_watcher = Some(watcher);

        Self { inner }
    }

    /// Register the connectivity test and start connecting if idle.
    pub fn set_connection_test(&self, test: ConnectionTest) {
        self.inner.control.lock().unwrap().test = Some(test);
        if self.state() == ConnectionState::Disconnected {
            self.inner.start_attempt();
        }
    }

    /// Whether a connectivity test has been registered.
    pub fn has_connection_test(&self) -> bool {
        self.inner.control.lock().unwrap().test.is_some()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state
    }

    /// Whether the last connectivity test succeeded.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Full current snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Time left until the pending retry, if one is scheduled.
    pub fn retry_countdown(&self) -> Option<Duration> {
        self.inner
            .snapshot
            .borrow()
            .next_retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Clear timers and counters and start a fresh connection cycle if online.
    ///
    /// This is the only way out of [`ConnectionState::Failed`] besides
    /// [`reset`](Self::reset).
    pub fn reconnect(&self) {
        log::info!("[ConnectionManager] Manual reconnect requested");
        self.inner.control.lock().unwrap().clear_timers();
        self.inner.snapshot.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.retry_count = 0;
            s.last_error = None;
            s.next_retry_at = None;
        });
        self.inner.start_attempt();
    }

    /// Return to `Disconnected` with counters cleared, without attempting.
    pub fn reset(&self) {
        {
            let mut control = self.inner.control.lock().unwrap();
            control.clear_timers();
            control.has_attempted = false;
        }
        let last_connected_at = self.inner.snapshot.borrow().last_connected_at;
        self.inner.snapshot.send_replace(ConnectionSnapshot {
            last_connected_at,
            ..ConnectionSnapshot::default()
        });
    }
}

impl Inner {
    /// Run one connectivity test, racing it against the timeout.
    fn start_attempt(self: &Arc<Self>) {
        if !self.network.is_online() {
            log::debug!("[ConnectionManager] Offline, not attempting");
            return;
        }

        let mut control = self.control.lock().unwrap();
        let Some(test) = control.test.clone() else {
            log::debug!("[ConnectionManager] No connection test registered");
            return;
        };

        control.clear_timers();
        let generation = control.generation;
        let state = if control.has_attempted {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        control.has_attempted = true;

        self.snapshot.send_modify(|s| {
            s.state = state;
            s.next_retry_at = None;
        });

        let timeout = self.config.connection_timeout();
        let weak = Arc::downgrade(self);
        control.attempt = Some(ScheduledTask::spawn(async move {
            let result = match tokio::time::timeout(timeout, test()).await {
                Ok(result) => result,
                Err(_) => Err(CoeditError::Timeout(timeout)),
            };
            if let Some(inner) = weak.upgrade() {
                inner.finish_attempt(generation, result);
            }
        }));
    }

    fn finish_attempt(self: &Arc<Self>, generation: u64, result: Result<()>) {
        let mut control = self.control.lock().unwrap();
        if control.generation != generation {
            return;
        }

        match result {
            Ok(()) => {
                log::info!("[ConnectionManager] Connected");
                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.retry_count = 0;
                    s.last_error = None;
                    s.next_retry_at = None;
                    s.last_connected_at = Some(Utc::now());
                });
                control.health_timer = Some(self.schedule_health_check(generation));
            }
            Err(e) => {
                let retry_count = self.snapshot.borrow().retry_count;
                if retry_count >= self.config.max_retries {
                    log::error!(
                        "[ConnectionManager] Giving up after {} retries: {}",
                        retry_count,
                        e
                    );
                    self.snapshot.send_modify(|s| {
                        s.state = ConnectionState::Failed;
                        s.last_error = Some(e.to_string());
                        s.next_retry_at = None;
                    });
                    return;
                }

                let attempt = retry_count + 1;
                let base = compute_retry_delay(&self.config, attempt);
                let delay = base + jitter(base);
                log::warn!(
                    "[ConnectionManager] Attempt failed ({}), retry {}/{} in {:?}",
                    e,
                    attempt,
                    self.config.max_retries,
                    delay
                );

                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Reconnecting;
                    s.retry_count = attempt;
                    s.last_error = Some(e.to_string());
                    s.next_retry_at = Some(Instant::now() + delay);
                });

                let weak = Arc::downgrade(self);
                control.retry_timer = Some(ScheduledTask::after(delay, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.start_attempt();
                    }
                }));
            }
        }
    }

    fn schedule_health_check(self: &Arc<Self>, generation: u64) -> ScheduledTask {
        let interval = self.config.health_check_interval();
        let timeout = self.config.connection_timeout();
        let weak: Weak<Self> = Arc::downgrade(self);

        ScheduledTask::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let test = inner.control.lock().unwrap().test.clone();
                drop(inner);
                let Some(test) = test else {
                    return;
                };

                let result = match tokio::time::timeout(timeout, test()).await {
                    Ok(result) => result,
                    Err(_) => Err(CoeditError::Timeout(timeout)),
                };
                if let Err(e) = result {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_health_check_failed(generation, e);
                    }
                    return;
                }
                log::debug!("[ConnectionManager] Health check passed");
            }
        })
    }

    fn on_health_check_failed(self: &Arc<Self>, generation: u64, error: CoeditError) {
        {
            let control = self.control.lock().unwrap();
            if control.generation != generation {
                return;
            }
        }
        log::warn!("[ConnectionManager] Health check failed: {}", error);
        self.snapshot.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(error.to_string());
        });
        self.start_attempt();
    }

    fn on_offline(&self) {
        let mut control = self.control.lock().unwrap();
        if self.snapshot.borrow().state == ConnectionState::Failed {
            return;
        }
        control.clear_timers();
        self.snapshot.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.retry_count = 0;
            s.last_error = Some("network offline".to_string());
            s.next_retry_at = None;
        });
    }

    fn on_online(self: &Arc<Self>) {
        if self.snapshot.borrow().state == ConnectionState::Disconnected {
            self.start_attempt();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("snapshot", &*self.inner.snapshot.borrow())
            .finish_non_exhaustive()
    }
}
