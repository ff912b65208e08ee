//! Network status monitor.
//!
//! Tracks whether the device is online. Platform integrations feed
//! online/offline transitions through [`NetworkMonitor::set_online`]; an
//! optional liveness probe re-checks reachability periodically, since a
//! platform "online" signal only means a network interface is up.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::remote::BoxFuture;
use crate::scheduler::ScheduledTask;

/// Async reachability check. Resolves to `true` when the network is usable.
pub type LivenessProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Shared online/offline signal. Clones observe the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    online: watch::Sender<bool>,
    probe_task: Mutex<Option<ScheduledTask>>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial status.
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                online,
                probe_task: Mutex::new(None),
            }),
        }
    }

    /// Whether the network is currently considered online.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Record a platform online/offline transition.
    ///
    /// Returns `true` if the status changed. Subscribers are only notified
    /// on actual transitions.
    pub fn set_online(&self, online: bool) -> bool {
        self.inner.set_online(online)
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Run `probe` every `interval` and feed its result into the status.
    ///
    /// Replaces any probe already running.
    pub fn start_liveness_probe(&self, interval: Duration, probe: LivenessProbe) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = ScheduledTask::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reachable = probe().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.set_online(reachable);
            }
        });
        *self.inner.probe_task.lock().unwrap() = Some(task);
    }

    /// Stop the liveness probe, if running.
    pub fn stop_liveness_probe(&self) {
        self.inner.probe_task.lock().unwrap().take();
    }
}

impl Inner {
    fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!(
                "[NetworkMonitor] Network is now {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_transitions_notify_once() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(true));
        assert!(!rx.has_changed().unwrap());

        assert!(monitor.set_online(false));
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = NetworkMonitor::default();
        let other = monitor.clone();
        other.set_online(false);
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_probe_drives_status() {
        let monitor = NetworkMonitor::new(true);
        let reachable = Arc::new(AtomicBool::new(false));
        let reachable_clone = Arc::clone(&reachable);
        monitor.start_liveness_probe(
            Duration::from_secs(5),
            Arc::new(move || -> BoxFuture<'static, bool> {
                let value = reachable_clone.load(Ordering::SeqCst);
                Box::pin(async move { value })
            }),
        );

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(!monitor.is_online());

        reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(monitor.is_online());

        monitor.stop_liveness_probe();
        reachable.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.is_online());
    }
}
