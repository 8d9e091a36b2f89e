//! Reachability tracking for the remote store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::store::{ProbeOutcome, RemoteStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Testing,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Testing => "testing",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the process-wide [`ConnectionState`]. Everyone else only observes it.
pub struct ConnectionMonitor {
    store: Arc<dyn RemoteStore>,
    config: StoreConfig,
    probe_timeout: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(store: Arc<dyn RemoteStore>, config: StoreConfig, probe_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            store,
            config,
            probe_timeout,
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Probe the store and record the result.
    ///
    /// An unconfigured store resolves to `Disconnected` without touching the
    /// network. An authorization failure still counts as reachable.
    pub async fn test_connection(&self) -> ConnectionState {
        if !self.config.is_configured() {
            debug!("store not configured, skipping probe");
            self.transition(ConnectionState::Disconnected);
            return ConnectionState::Disconnected;
        }

        self.transition(ConnectionState::Testing);
        let guard = TestingGuard {
            state: &self.state,
            armed: true,
        };

        let next = match tokio::time::timeout(self.probe_timeout, self.store.probe()).await {
            Ok(ProbeOutcome::Ok) => ConnectionState::Connected,
            Ok(ProbeOutcome::AuthError(msg)) => {
                warn!(error = %msg, "store reachable but rejected credentials");
                ConnectionState::Connected
            }
            Ok(ProbeOutcome::NetworkError(msg)) => {
                warn!(error = %msg, "store unreachable");
                ConnectionState::Disconnected
            }
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "store probe timed out");
                ConnectionState::Disconnected
            }
        };

        guard.disarm();
        self.transition(next);
        next
    }

    /// A call failed with a network-class error while we believed we were connected.
    pub(crate) fn mark_unreachable(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            info!(state = %ConnectionState::Disconnected, "connection lost");
        }
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = %next, "connection state changed");
        }
    }
}

/// Resets `Testing` back to `Disconnected` if the probe future is dropped mid-flight.
struct TestingGuard<'a> {
    state: &'a watch::Sender<ConnectionState>,
    armed: bool,
}

impl TestingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TestingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Testing {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            info!("connection test aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockStore;

    fn configured() -> StoreConfig {
        StoreConfig::new("https://nibble.home.lan", Some("k3y".to_string()))
    }

    fn monitor(store: &Arc<MockStore>, config: StoreConfig) -> ConnectionMonitor {
        ConnectionMonitor::new(store.clone(), config, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_unconfigured_store_never_probes() {
        let store = Arc::new(MockStore::new());
        let monitor = monitor(&store, StoreConfig::default());
        assert_eq!(monitor.test_connection().await, ConnectionState::Disconnected);
        assert_eq!(MockStore::count(&store.calls.probe), 0);
        assert_eq!(store.calls.total(), 0);
    }

    #[tokio::test]
    async fn test_successful_probe_connects() {
        let store = Arc::new(MockStore::new());
        let monitor = monitor(&store, configured());
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert_eq!(monitor.test_connection().await, ConnectionState::Connected);
        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert_eq!(MockStore::count(&store.calls.probe), 1);
    }

    #[tokio::test]
    async fn test_auth_error_counts_as_reachable() {
        let store = Arc::new(MockStore::new());
        store.set_probe(ProbeOutcome::AuthError("invalid api key".to_string()));
        let monitor = monitor(&store, configured());
        assert_eq!(monitor.test_connection().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_network_error_disconnects() {
        let store = Arc::new(MockStore::new());
        let monitor = monitor(&store, configured());
        monitor.test_connection().await;
        store.set_probe(ProbeOutcome::NetworkError("connection refused".to_string()));
        assert_eq!(monitor.test_connection().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_disconnects() {
        let store = Arc::new(MockStore::new());
        store.set_probe_delay(Duration::from_secs(30));
        let monitor = monitor(&store, configured());
        assert_eq!(monitor.test_connection().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_testing_while_probe_runs() {
        let store = Arc::new(MockStore::new());
        store.set_probe_delay(Duration::from_secs(1));
        let monitor = Arc::new(monitor(&store, configured()));
        let mut rx = monitor.subscribe();

        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.test_connection().await })
        };

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Testing);
        assert_eq!(task.await.unwrap(), ConnectionState::Connected);
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_probe_resets_to_disconnected() {
        let store = Arc::new(MockStore::new());
        store.set_probe_delay(Duration::from_secs(5));
        let monitor = monitor(&store, configured());

        let probe = monitor.test_connection();
        let aborted = tokio::time::timeout(Duration::from_secs(1), probe).await;
        assert!(aborted.is_err());
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_mark_unreachable_only_from_connected() {
        let store = Arc::new(MockStore::new());
        let monitor = monitor(&store, configured());
        monitor.mark_unreachable();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);

        monitor.test_connection().await;
        monitor.mark_unreachable();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }
}
