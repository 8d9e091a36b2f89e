//! In-memory view of the signed-in user's entries.
//!
//! The cache only changes in two ways: a load replaces whole date buckets
//! with what the store returned, and the reconciler applies change events.
//! Mutations go to the store and come back through the change feed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::{StoreResult, SyncError, SyncResult};
use crate::models::{
    ChangeEvent, Entry, EntryId, EntryPatch, NewEntry, UserId, sort_by_creation,
    validate_new_entry, validate_patch,
};
use crate::reconciler::{
    ApplyOutcome, PARKED_CAPACITY, Parked, Recent, TOMBSTONE_CAPACITY, reconcile,
};
use crate::store::{DateRange, EntryQuery, RemoteStore};

const PENDING_CAPACITY: usize = 512;
const MIN_LOOKBACK_DAYS: u32 = 7;
const MAX_LOOKBACK_DAYS: u32 = 30;

/// Which dates the cache currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheWindow {
    /// The materialized date, chosen by the last `load`.
    pub selected: Option<NaiveDate>,
    /// Range fetched by the last `load_history`.
    pub lookback: Option<DateRange>,
}

impl CacheWindow {
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.selected == Some(date) || self.lookback.is_some_and(|r| r.contains(date))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// A newer load or a window change made this result obsolete. Nothing was written.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Receives every failed mutation, e.g. to show a notification.
pub trait FailureListener: Send + Sync {
    fn mutation_failed(&self, kind: MutationKind, error: &SyncError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LoadKey {
    Day(NaiveDate),
    History(DateRange),
}

type SharedLoad = Shared<BoxFuture<'static, SyncResult<LoadOutcome>>>;

pub(crate) struct CacheState {
    pub(crate) user: Option<UserId>,
    pub(crate) window: CacheWindow,
    pub(crate) buckets: BTreeMap<NaiveDate, Vec<Entry>>,
    pub(crate) tombstones: Recent<()>,
    pub(crate) parked: Recent<Parked>,
    tokens: HashMap<LoadKey, u64>,
    in_flight: HashMap<LoadKey, SharedLoad>,
    /// Events seen while a load was in flight, replayed once it lands.
    pending: Vec<ChangeEvent>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            user: None,
            window: CacheWindow::default(),
            buckets: BTreeMap::new(),
            tombstones: Recent::with_capacity(TOMBSTONE_CAPACITY),
            parked: Recent::with_capacity(PARKED_CAPACITY),
            tokens: HashMap::new(),
            in_flight: HashMap::new(),
            pending: Vec::new(),
        }
    }
}

impl CacheState {
    /// Date bucket and index holding `id`.
    pub(crate) fn locate(&self, id: &EntryId) -> Option<(NaiveDate, usize)> {
        self.buckets.iter().find_map(|(date, bucket)| {
            bucket
                .iter()
                .position(|e| &e.id == id)
                .map(|idx| (*date, idx))
        })
    }

    fn select(&mut self, date: NaiveDate) {
        let Some(previous) = self.window.selected.replace(date) else {
            return;
        };
        if previous == date {
            return;
        }
        self.in_flight.remove(&LoadKey::Day(previous));
        self.tokens.remove(&LoadKey::Day(previous));
        if !self.window.lookback.is_some_and(|r| r.contains(previous)) {
            self.buckets.remove(&previous);
        }
    }

    fn set_lookback(&mut self, range: DateRange) {
        let Some(previous) = self.window.lookback.replace(range) else {
            return;
        };
        if previous == range {
            return;
        }
        self.in_flight.remove(&LoadKey::History(previous));
        self.tokens.remove(&LoadKey::History(previous));
        let selected = self.window.selected;
        self.buckets
            .retain(|date, _| range.contains(*date) || selected == Some(*date));
    }

    fn in_window(&self, key: LoadKey) -> bool {
        match key {
            LoadKey::Day(date) => self.window.selected == Some(date),
            LoadKey::History(range) => self.window.lookback == Some(range),
        }
    }

    fn is_current(&self, key: LoadKey, token: u64, user: &UserId) -> bool {
        self.user.as_ref() == Some(user)
            && self.tokens.get(&key) == Some(&token)
            && self.in_window(key)
    }

    fn replace(&mut self, key: LoadKey, entries: Vec<Entry>) {
        let mut grouped: BTreeMap<NaiveDate, Vec<Entry>> = BTreeMap::new();
        for entry in entries {
            if self.tombstones.contains(&entry.id) {
                continue;
            }
            self.parked.remove(&entry.id);
            grouped.entry(entry.date).or_default().push(entry);
        }

        let range = match key {
            LoadKey::Day(date) => DateRange::single(date),
            LoadKey::History(range) => range,
        };
        for date in range.start.iter_days().take_while(|d| *d <= range.end) {
            let mut bucket = grouped.remove(&date).unwrap_or_default();
            sort_by_creation(&mut bucket);
            self.buckets.insert(date, bucket);
        }

        let replay = std::mem::take(&mut self.pending);
        for event in &replay {
            reconcile(self, event);
        }
        if !self.in_flight.is_empty() {
            self.pending = replay;
        }
    }

    fn record_pending(&mut self, event: &ChangeEvent) {
        if self.pending.len() >= PENDING_CAPACITY {
            warn!("pending change buffer full, dropping oldest event");
            self.pending.remove(0);
        }
        self.pending.push(event.clone());
    }
}

struct CacheInner {
    store: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectionMonitor>,
    options: SyncOptions,
    state: Mutex<CacheState>,
    next_token: AtomicU64,
    revision: watch::Sender<u64>,
    listener: Mutex<Option<Arc<dyn FailureListener>>>,
}

/// Cheaply cloneable handle to the shared cache.
#[derive(Clone)]
pub struct EntryCache {
    inner: Arc<CacheInner>,
}

impl EntryCache {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectionMonitor>,
        options: SyncOptions,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(CacheInner {
                store,
                monitor,
                options,
                state: Mutex::new(CacheState::default()),
                next_token: AtomicU64::new(1),
                revision,
                listener: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    pub(crate) fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    /// Run a store call under the request timeout. Network-class failures
    /// flip the connection to `Disconnected`.
    pub(crate) async fn call<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> SyncResult<T> {
        let limit = self.inner.options.request_timeout;
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(limit)),
        };
        if let Err(err) = &result {
            if err.is_network() {
                self.mark_unreachable();
            }
        }
        result
    }

    pub(crate) fn mark_unreachable(&self) {
        self.inner.monitor.mark_unreachable();
    }

    pub fn set_failure_listener(&self, listener: Option<Arc<dyn FailureListener>>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Switch the active user. Everything cached for the previous user is dropped.
    pub fn set_user(&self, user: Option<UserId>) {
        let changed = {
            let mut state = self.lock();
            if state.user == user {
                false
            } else {
                *state = CacheState {
                    user: user.clone(),
                    ..CacheState::default()
                };
                true
            }
        };
        if changed {
            match &user {
                Some(user) => info!(user = %user, "cache switched user"),
                None => info!("cache cleared"),
            }
            self.bump();
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.lock().user.clone()
    }

    /// Make `date` the selected date and fetch its entries.
    ///
    /// Concurrent loads of the same date share a single request. A result
    /// that arrives after another date was selected is dropped.
    pub async fn load(&self, date: NaiveDate) -> SyncResult<LoadOutcome> {
        let key = LoadKey::Day(date);
        let shared = self.start_load(key, DateRange::single(date), |state| state.select(date))?;
        self.follow(key, shared).await
    }

    /// Fetch the `days` days ending at `anchor` for analytics. `days` is clamped to 7..=30.
    pub async fn load_history(&self, anchor: NaiveDate, days: u32) -> SyncResult<LoadOutcome> {
        let days = days.clamp(MIN_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS);
        let range = DateRange::lookback(anchor, days);
        let key = LoadKey::History(range);
        let shared = self.start_load(key, range, |state| state.set_lookback(range))?;
        self.follow(key, shared).await
    }

    /// Refetch the whole window: the selected date and the lookback range.
    ///
    /// The change feed only carries writes made while it is open, so this runs
    /// every time it is (re)opened. Loads already in flight are replaced, and
    /// their callers wait for the replacement.
    pub async fn resync(&self) -> SyncResult<()> {
        if !self.inner.monitor.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        let loads = {
            let mut state = self.lock();
            let Some(user) = state.user.clone() else {
                return Ok(());
            };
            let mut keys = Vec::new();
            if let Some(date) = state.window.selected {
                keys.push((LoadKey::Day(date), DateRange::single(date)));
            }
            if let Some(range) = state.window.lookback {
                keys.push((LoadKey::History(range), range));
            }
            keys.into_iter()
                .map(|(key, range)| (key, self.spawn_load(&mut state, key, user.clone(), range)))
                .collect::<Vec<_>>()
        };
        if loads.is_empty() {
            return Ok(());
        }
        debug!(count = loads.len(), "resyncing cached window");
        let results = join_all(loads.into_iter().map(|(key, shared)| self.follow(key, shared))).await;
        results.into_iter().try_for_each(|result| result.map(drop))
    }

    /// Await a load. If a refresh of the same key replaced it, wait for that instead.
    async fn follow(&self, key: LoadKey, mut shared: SharedLoad) -> SyncResult<LoadOutcome> {
        loop {
            let outcome = shared.await?;
            if outcome != LoadOutcome::Superseded {
                return Ok(outcome);
            }
            let next = {
                let state = self.lock();
                if !state.in_window(key) {
                    return Ok(outcome);
                }
                state.in_flight.get(&key).cloned()
            };
            match next {
                Some(next) => shared = next,
                None => return Ok(outcome),
            }
        }
    }

    fn start_load(
        &self,
        key: LoadKey,
        range: DateRange,
        widen: impl FnOnce(&mut CacheState),
    ) -> SyncResult<SharedLoad> {
        if !self.inner.monitor.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        let mut state = self.lock();
        let user = state.user.clone().ok_or(SyncError::NoActiveUser)?;
        widen(&mut state);

        if let Some(existing) = state.in_flight.get(&key) {
            debug!(?key, "joining in-flight load");
            return Ok(existing.clone());
        }
        Ok(self.spawn_load(&mut state, key, user, range))
    }

    fn spawn_load(
        &self,
        state: &mut CacheState,
        key: LoadKey,
        user: UserId,
        range: DateRange,
    ) -> SharedLoad {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        state.tokens.insert(key, token);
        let shared = self
            .clone()
            .run_load(key, token, user, range)
            .boxed()
            .shared();
        state.in_flight.insert(key, shared.clone());
        shared
    }

    async fn run_load(
        self,
        key: LoadKey,
        token: u64,
        user: UserId,
        range: DateRange,
    ) -> SyncResult<LoadOutcome> {
        let query = EntryQuery {
            user_id: user.clone(),
            range,
        };
        let fetched = self.call(self.inner.store.fetch(&query)).await;

        let outcome = {
            let mut state = self.lock();
            if state.tokens.get(&key) == Some(&token) {
                state.in_flight.remove(&key);
            }
            let outcome = match fetched {
                Ok(entries) if state.is_current(key, token, &user) => {
                    let count = entries.len();
                    state.replace(key, entries);
                    debug!(?key, count, "load applied");
                    Ok(LoadOutcome::Applied)
                }
                Ok(_) => {
                    debug!(?key, "discarding superseded load");
                    Ok(LoadOutcome::Superseded)
                }
                Err(err) => Err(err),
            };
            if state.in_flight.is_empty() {
                state.pending.clear();
            }
            outcome
        };

        if outcome == Ok(LoadOutcome::Applied) {
            self.bump();
        }
        outcome
    }

    pub async fn create(&self, entry: NewEntry) -> SyncResult<EntryId> {
        let result = async {
            let user = self.writable_user()?;
            validate_new_entry(&entry).map_err(|e| SyncError::Invalid(format!("{e:#}")))?;
            let created = self.call(self.inner.store.insert(&user, &entry)).await?;
            debug!(id = %created.id, date = %created.date, "entry created");
            Ok(created.id)
        }
        .await;
        self.report(MutationKind::Create, result)
    }

    pub async fn update(&self, id: &EntryId, patch: EntryPatch) -> SyncResult<()> {
        let result = async {
            let user = self.writable_user()?;
            validate_patch(&patch).map_err(|e| SyncError::Invalid(format!("{e:#}")))?;
            self.call(self.inner.store.update(&user, id, &patch)).await?;
            debug!(id = %id, "entry updated");
            Ok(())
        }
        .await;
        self.report(MutationKind::Update, result)
    }

    pub async fn delete(&self, id: &EntryId) -> SyncResult<()> {
        let result = async {
            let user = self.writable_user()?;
            self.call(self.inner.store.delete(&user, id)).await?;
            debug!(id = %id, "entry deleted");
            Ok(())
        }
        .await;
        self.report(MutationKind::Delete, result)
    }

    fn writable_user(&self) -> SyncResult<UserId> {
        if !self.inner.monitor.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        let state = self.inner.monitor.state();
        if state != ConnectionState::Connected {
            return Err(SyncError::NotConnected(state));
        }
        self.lock().user.clone().ok_or(SyncError::NoActiveUser)
    }

    fn report<T>(&self, kind: MutationKind, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(err) = &result {
            warn!(%kind, error = %err, "mutation failed");
            let listener = self
                .inner
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(listener) = listener {
                listener.mutation_failed(kind, err);
            }
        }
        result
    }

    /// Apply a change event. Called by the reconciler.
    pub(crate) fn apply_change(&self, event: &ChangeEvent) -> ApplyOutcome {
        let outcome = {
            let mut state = self.lock();
            let outcome = reconcile(&mut state, event);
            if !state.in_flight.is_empty() {
                state.record_pending(event);
            }
            outcome
        };
        if outcome.changed() {
            self.bump();
        }
        outcome
    }

    #[must_use]
    pub fn entries_for(&self, date: NaiveDate) -> Vec<Entry> {
        self.lock().buckets.get(&date).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn selected_entries(&self) -> Vec<Entry> {
        let state = self.lock();
        state
            .window
            .selected
            .and_then(|date| state.buckets.get(&date).cloned())
            .unwrap_or_default()
    }

    /// Every cached entry across the selected date and the lookback range, by date.
    #[must_use]
    pub fn history_entries(&self) -> Vec<Entry> {
        self.lock().buckets.values().flatten().cloned().collect()
    }

    #[must_use]
    pub fn dates_with_entries(&self) -> BTreeSet<NaiveDate> {
        self.lock()
            .buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(date, _)| *date)
            .collect()
    }

    #[must_use]
    pub fn window(&self) -> CacheWindow {
        self.lock().window.clone()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Receiver that wakes on every applied load or change.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::StoreError;
    use crate::models::EntryShadow;
    use crate::test_support::{MockStore, day, entry, new_entry, user};

    #[derive(Default)]
    struct RecordingListener {
        failures: Mutex<Vec<(MutationKind, SyncError)>>,
    }

    impl FailureListener for RecordingListener {
        fn mutation_failed(&self, kind: MutationKind, error: &SyncError) {
            self.failures.lock().unwrap().push((kind, error.clone()));
        }
    }

    fn configured() -> StoreConfig {
        StoreConfig::new("https://nibble.home.lan", Some("k3y".to_string()))
    }

    fn cache_with(store: &Arc<MockStore>, config: StoreConfig) -> (EntryCache, Arc<ConnectionMonitor>) {
        let options = SyncOptions::default();
        let monitor = Arc::new(ConnectionMonitor::new(
            store.clone(),
            config,
            options.probe_timeout,
        ));
        let cache = EntryCache::new(store.clone(), monitor.clone(), options);
        cache.set_user(Some(user()));
        (cache, monitor)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn ids(entries: &[Entry]) -> Vec<String> {
        entries.iter().map(|e| e.id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_load_fills_selected_date_in_creation_order() {
        let store = Arc::new(MockStore::with_rows(vec![
            entry("b", day(15), 30, 200.0),
            entry("a", day(15), 10, 100.0),
            entry("other-day", day(14), 0, 50.0),
        ]));
        let (cache, _) = cache_with(&store, configured());

        assert_eq!(cache.load(day(15)).await.unwrap(), LoadOutcome::Applied);
        assert_eq!(ids(&cache.selected_entries()), vec!["a", "b"]);
        assert!(cache.entries_for(day(14)).is_empty());
        assert_eq!(cache.window().selected, Some(day(15)));
    }

    #[tokio::test]
    async fn test_load_requires_configuration_and_user() {
        let store = Arc::new(MockStore::new());
        let (cache, _) = cache_with(&store, StoreConfig::default());
        assert_eq!(cache.load(day(15)).await, Err(SyncError::NotConfigured));

        let (cache, _) = cache_with(&store, configured());
        cache.set_user(None);
        assert_eq!(cache.load(day(15)).await, Err(SyncError::NoActiveUser));
        assert_eq!(MockStore::count(&store.calls.fetch), 0);
    }

    #[tokio::test]
    async fn test_stale_load_is_discarded() {
        let store = Arc::new(MockStore::with_rows(vec![
            entry("a1", day(10), 0, 100.0),
            entry("b1", day(11), 0, 200.0),
        ]));
        let (cache, _) = cache_with(&store, configured());
        store.hold(day(10));

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load(day(10)).await })
        };
        settle().await;

        assert_eq!(cache.load(day(11)).await.unwrap(), LoadOutcome::Applied);
        store.release(day(10));
        assert_eq!(slow.await.unwrap().unwrap(), LoadOutcome::Superseded);

        assert_eq!(cache.window().selected, Some(day(11)));
        assert_eq!(ids(&cache.history_entries()), vec!["b1"]);
        assert!(cache.entries_for(day(10)).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_request() {
        let store = Arc::new(MockStore::with_rows(vec![entry("a", day(15), 0, 100.0)]));
        let (cache, _) = cache_with(&store, configured());
        store.hold(day(15));

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load(day(15)).await })
        };
        let second = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load(day(15)).await })
        };
        settle().await;
        store.release(day(15));

        assert_eq!(first.await.unwrap().unwrap(), LoadOutcome::Applied);
        assert_eq!(second.await.unwrap().unwrap(), LoadOutcome::Applied);
        assert_eq!(MockStore::count(&store.calls.fetch), 1);
        assert_eq!(cache.selected_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_selecting_new_date_discards_previous_bucket() {
        let store = Arc::new(MockStore::with_rows(vec![
            entry("a", day(10), 0, 100.0),
            entry("b", day(11), 0, 100.0),
        ]));
        let (cache, _) = cache_with(&store, configured());
        cache.load(day(10)).await.unwrap();
        cache.load(day(11)).await.unwrap();
        assert!(cache.entries_for(day(10)).is_empty());
        assert_eq!(cache.dates_with_entries(), BTreeSet::from([day(11)]));
    }

    #[tokio::test]
    async fn test_selected_date_inside_lookback_survives_reselect() {
        let store = Arc::new(MockStore::with_rows(vec![
            entry("a", day(14), 0, 100.0),
            entry("b", day(15), 0, 100.0),
        ]));
        let (cache, _) = cache_with(&store, configured());
        cache.load_history(day(15), 7).await.unwrap();
        cache.load(day(14)).await.unwrap();
        cache.load(day(15)).await.unwrap();
        assert_eq!(ids(&cache.entries_for(day(14))), vec!["a"]);
    }

    #[tokio::test]
    async fn test_load_history_groups_and_clamps() {
        let store = Arc::new(MockStore::with_rows(vec![
            entry("old", day(1), 0, 100.0),
            entry("mid", day(9), 0, 100.0),
            entry("new", day(15), 0, 100.0),
        ]));
        let (cache, _) = cache_with(&store, configured());

        cache.load_history(day(15), 3).await.unwrap();
        let window = cache.window();
        assert_eq!(window.lookback, Some(DateRange::lookback(day(15), 7)));
        assert_eq!(cache.dates_with_entries(), BTreeSet::from([day(9), day(15)]));

        cache.load_history(day(15), 90).await.unwrap();
        assert_eq!(
            cache.window().lookback,
            Some(DateRange::lookback(day(15), 30))
        );
        assert_eq!(
            ids(&cache.history_entries()),
            vec!["old", "mid", "new"]
        );
    }

    #[tokio::test]
    async fn test_resync_refetches_selected_date_and_lookback() {
        let store = Arc::new(MockStore::with_rows(vec![entry("a", day(15), 0, 100.0)]));
        let (cache, _) = cache_with(&store, configured());
        assert_eq!(cache.resync().await, Ok(()));
        assert_eq!(MockStore::count(&store.calls.fetch), 0);

        cache.load_history(day(15), 7).await.unwrap();
        cache.load(day(15)).await.unwrap();
        store.push_row(entry("b", day(15), 5, 200.0));
        store.push_row(entry("c", day(11), 0, 300.0));

        cache.resync().await.unwrap();
        assert_eq!(MockStore::count(&store.calls.fetch), 4);
        assert_eq!(ids(&cache.selected_entries()), vec!["a", "b"]);
        assert_eq!(ids(&cache.entries_for(day(11))), vec!["c"]);
        assert_eq!(cache.window().selected, Some(day(15)));
    }

    #[tokio::test]
    async fn test_events_during_load_are_not_lost() {
        let store = Arc::new(MockStore::with_rows(vec![entry("a", day(15), 0, 100.0)]));
        let (cache, _) = cache_with(&store, configured());
        store.hold(day(15));

        let load = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load(day(15)).await })
        };
        settle().await;

        // arrives after the snapshot was taken
        let late = entry("b", day(15), 5, 150.0);
        cache.apply_change(&ChangeEvent::Insert(late));
        store.release(day(15));
        load.await.unwrap().unwrap();

        assert_eq!(ids(&cache.selected_entries()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_event_wins_over_loaded_row() {
        let row = entry("a", day(15), 0, 100.0);
        let store = Arc::new(MockStore::with_rows(vec![row.clone()]));
        let (cache, _) = cache_with(&store, configured());
        store.hold(day(15));

        let load = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load(day(15)).await })
        };
        settle().await;
        cache.apply_change(&ChangeEvent::Delete(EntryShadow::from(&row)));
        store.release(day(15));
        load.await.unwrap().unwrap();

        assert!(cache.selected_entries().is_empty());
    }

    #[tokio::test]
    async fn test_revision_bumps_on_load_and_change() {
        let store = Arc::new(MockStore::new());
        let (cache, _) = cache_with(&store, configured());
        let mut rx = cache.watch_revision();
        let before = cache.revision();

        cache.load(day(15)).await.unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let outcome = cache.apply_change(&ChangeEvent::Insert(entry("a", day(15), 0, 1.0)));
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert!(rx.has_changed().unwrap());
        assert_eq!(cache.revision(), before + 2);

        cache.apply_change(&ChangeEvent::Insert(entry("far", day(2), 0, 1.0)));
        assert_eq!(cache.revision(), before + 2);
    }

    #[tokio::test]
    async fn test_set_user_clears_cache() {
        let store = Arc::new(MockStore::with_rows(vec![entry("a", day(15), 0, 100.0)]));
        let (cache, _) = cache_with(&store, configured());
        cache.load(day(15)).await.unwrap();

        cache.set_user(Some(UserId::new("user-2")));
        assert!(cache.history_entries().is_empty());
        assert_eq!(cache.window(), CacheWindow::default());
        assert_eq!(cache.user(), Some(UserId::new("user-2")));
    }

    #[tokio::test]
    async fn test_mutations_fail_fast_when_disconnected() {
        let store = Arc::new(MockStore::new());
        let (cache, monitor) = cache_with(&store, configured());
        let listener = Arc::new(RecordingListener::default());
        cache.set_failure_listener(Some(listener.clone()));
        assert_eq!(monitor.state(), ConnectionState::Disconnected);

        let err = cache
            .create(new_entry(day(15), "Oats", 300.0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::NotConnected(ConnectionState::Disconnected)
        );
        assert!(cache.delete(&EntryId::new("x")).await.is_err());
        assert_eq!(store.calls.total(), 0);

        let failures = listener.failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, MutationKind::Create);
        assert_eq!(failures[1].0, MutationKind::Delete);
    }

    #[tokio::test]
    async fn test_mutations_require_user() {
        let store = Arc::new(MockStore::new());
        let (cache, monitor) = cache_with(&store, configured());
        monitor.test_connection().await;
        cache.set_user(None);

        let err = cache
            .create(new_entry(day(15), "Oats", 300.0))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::NoActiveUser);
        assert_eq!(MockStore::count(&store.calls.insert), 0);
    }

    #[tokio::test]
    async fn test_invalid_entry_never_reaches_store() {
        let store = Arc::new(MockStore::new());
        let (cache, monitor) = cache_with(&store, configured());
        monitor.test_connection().await;

        let err = cache.create(new_entry(day(15), "  ", 300.0)).await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
        let err = cache
            .update(&EntryId::new("x"), EntryPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
        assert_eq!(MockStore::count(&store.calls.insert), 0);
        assert_eq!(MockStore::count(&store.calls.update), 0);
    }

    #[tokio::test]
    async fn test_network_failure_disconnects_and_reports() {
        let store = Arc::new(MockStore::new());
        let (cache, monitor) = cache_with(&store, configured());
        let listener = Arc::new(RecordingListener::default());
        cache.set_failure_listener(Some(listener.clone()));
        monitor.test_connection().await;

        store.fail_next(StoreError::Network("connection reset".to_string()));
        let err = cache
            .create(new_entry(day(15), "Oats", 300.0))
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert_eq!(listener.failures.lock().unwrap().len(), 1);
        assert!(cache.selected_entries().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_connection() {
        let store = Arc::new(MockStore::new());
        let (cache, monitor) = cache_with(&store, configured());
        monitor.test_connection().await;

        store.fail_next(StoreError::Unauthorized("token expired".to_string()));
        let err = cache.delete(&EntryId::new("x")).await.unwrap_err();
        assert_eq!(err, SyncError::Unauthorized("token expired".to_string()));
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_cache_untouched() {
        let store = Arc::new(MockStore::with_rows(vec![entry("a", day(15), 0, 100.0)]));
        let (cache, _) = cache_with(&store, configured());
        cache.load(day(15)).await.unwrap();

        store.fail_next(StoreError::Network("timeout".to_string()));
        assert!(cache.load(day(15)).await.is_err());
        assert_eq!(ids(&cache.selected_entries()), vec!["a"]);
    }
}
