use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::analytics::{self, Dashboard};
use crate::cache::{EntryCache, FailureListener, LoadOutcome};
use crate::config::{StoreConfig, SyncOptions};
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::SyncResult;
use crate::models::{EntryId, EntryPatch, GoalConfiguration, NewEntry, UserId};
use crate::reconciler::ChangeReconciler;
use crate::store::RemoteStore;

/// Wires the monitor, cache and reconciler together around one store.
///
/// This is the surface consumers use. Construct one per process (or per test)
/// and pass it around; nothing here is global.
pub struct SyncSession {
    monitor: Arc<ConnectionMonitor>,
    cache: EntryCache,
    reconciler: Arc<ChangeReconciler>,
    user: watch::Sender<Option<UserId>>,
    lookback_days: u32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new(store: Arc<dyn RemoteStore>, config: StoreConfig, options: SyncOptions) -> Self {
        let monitor = Arc::new(ConnectionMonitor::new(
            store.clone(),
            config,
            options.probe_timeout,
        ));
        let lookback_days = options.lookback_days;
        let cache = EntryCache::new(store, monitor.clone(), options);
        let reconciler = Arc::new(ChangeReconciler::new(cache.clone()));
        let (user, _) = watch::channel(None);
        Self {
            monitor,
            cache,
            reconciler,
            user,
            lookback_days,
            supervisor: Mutex::new(None),
        }
    }

    /// Start keeping the change feed in step with connection and user. Idempotent.
    pub fn start(&self) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *supervisor = Some(
            self.reconciler
                .supervise(self.monitor.subscribe(), self.user.subscribe()),
        );
    }

    pub async fn shutdown(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.reconciler.close().await;
        info!("sync session stopped");
    }

    pub fn sign_in(&self, user: UserId) {
        self.cache.set_user(Some(user.clone()));
        self.user.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        self.cache.set_user(None);
        self.user.send_replace(None);
    }

    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.user.borrow().clone()
    }

    pub async fn test_connection(&self) -> ConnectionState {
        self.monitor.test_connection().await
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.subscribe()
    }

    pub async fn load(&self, date: NaiveDate) -> SyncResult<LoadOutcome> {
        self.cache.load(date).await
    }

    /// Fetch the configured lookback ending at `anchor`.
    pub async fn load_history(&self, anchor: NaiveDate) -> SyncResult<LoadOutcome> {
        self.cache.load_history(anchor, self.lookback_days).await
    }

    pub async fn create(&self, entry: NewEntry) -> SyncResult<EntryId> {
        self.cache.create(entry).await
    }

    pub async fn update(&self, id: &EntryId, patch: EntryPatch) -> SyncResult<()> {
        self.cache.update(id, patch).await
    }

    pub async fn delete(&self, id: &EntryId) -> SyncResult<()> {
        self.cache.delete(id).await
    }

    pub fn set_failure_listener(&self, listener: Option<Arc<dyn FailureListener>>) {
        self.cache.set_failure_listener(listener);
    }

    #[must_use]
    pub fn cache(&self) -> &EntryCache {
        &self.cache
    }

    #[must_use]
    pub fn reconciler(&self) -> &ChangeReconciler {
        &self.reconciler
    }

    /// Analytics over everything currently cached.
    #[must_use]
    pub fn dashboard(
        &self,
        goal: Option<&GoalConfiguration>,
        anchor: NaiveDate,
        unlocked: &BTreeSet<String>,
    ) -> Dashboard {
        analytics::dashboard(&self.cache.history_entries(), goal, anchor, unlocked)
    }
}
