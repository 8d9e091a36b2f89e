//! Applies the store's change feed to the [`EntryCache`].
//!
//! The rules are written so that any delivery order of the same set of
//! events ends in the same cache contents:
//!
//! - inserts are insert-if-absent, and merge under last-write-wins when the
//!   id is already cached;
//! - updates replace an entry only when `updated_at` is not older, and move
//!   it between date buckets when its date changed;
//! - deletes remove by id and leave a tombstone so a late insert or update
//!   cannot bring the entry back.
//!
//! Updates for ids we have not seen yet are parked until the matching insert
//! arrives. Nothing is ever synthesized from an update alone.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::{CacheState, EntryCache};
use crate::connection::ConnectionState;
use crate::error::SyncResult;
use crate::models::{ChangeEvent, Entry, EntryId, EntryShadow, UserId, sort_by_creation};
use crate::store::{ChangeFilter, Subscription};

pub(crate) const TOMBSTONE_CAPACITY: usize = 1024;
pub(crate) const PARKED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NoActiveUser,
    ForeignUser,
    OutOfWindow,
    UnknownId,
    Deleted,
    Stale,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// The entry changed date: moved between buckets, or out of the window.
    Moved,
    Removed,
    /// Held back until the entry itself shows up.
    Deferred,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    /// Whether the visible cache contents changed.
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(
            self,
            Self::Inserted | Self::Updated | Self::Moved | Self::Removed
        )
    }
}

/// Insertion-ordered map that forgets its oldest keys past a fixed capacity.
#[derive(Debug, Clone)]
pub(crate) struct Recent<V> {
    order: VecDeque<EntryId>,
    items: HashMap<EntryId, V>,
    capacity: usize,
}

impl<V> Recent<V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            items: HashMap::new(),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, id: EntryId, value: V) {
        if self.items.insert(id.clone(), value).is_none() {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.items.remove(&oldest);
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &EntryId) -> Option<V> {
        let value = self.items.remove(id)?;
        self.order.retain(|k| k != id);
        Some(value)
    }

    pub(crate) fn get(&self, id: &EntryId) -> Option<&V> {
        self.items.get(id)
    }

    pub(crate) fn contains(&self, id: &EntryId) -> bool {
        self.items.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// A version of an entry we know about but are not showing.
#[derive(Debug, Clone)]
pub(crate) struct Parked {
    pub(crate) entry: Entry,
    /// True once the entry's insert (or a load) has been seen.
    pub(crate) confirmed: bool,
}

/// Apply one change event to the cache state.
pub(crate) fn reconcile(state: &mut CacheState, event: &ChangeEvent) -> ApplyOutcome {
    let Some(user) = &state.user else {
        return ApplyOutcome::Ignored(IgnoreReason::NoActiveUser);
    };
    if event.user_id() != user {
        return ApplyOutcome::Ignored(IgnoreReason::ForeignUser);
    }
    match event {
        ChangeEvent::Insert(entry) => apply_insert(state, entry),
        ChangeEvent::Update(entry) => apply_update(state, entry),
        ChangeEvent::Delete(shadow) => apply_delete(state, shadow),
    }
}

fn apply_insert(state: &mut CacheState, incoming: &Entry) -> ApplyOutcome {
    if state.tombstones.contains(&incoming.id) {
        return ApplyOutcome::Ignored(IgnoreReason::Deleted);
    }
    if state.locate(&incoming.id).is_some() {
        return merge(state, incoming);
    }

    let mut candidate = incoming.clone();
    if let Some(parked) = state.parked.remove(&incoming.id) {
        if parked.entry.updated_at >= candidate.updated_at {
            candidate = parked.entry;
        }
    }

    if state.window.contains(candidate.date) {
        place(state, candidate);
        ApplyOutcome::Inserted
    } else {
        let id = candidate.id.clone();
        state.parked.insert(
            id,
            Parked {
                entry: candidate,
                confirmed: true,
            },
        );
        ApplyOutcome::Ignored(IgnoreReason::OutOfWindow)
    }
}

fn apply_update(state: &mut CacheState, incoming: &Entry) -> ApplyOutcome {
    if state.tombstones.contains(&incoming.id) {
        return ApplyOutcome::Ignored(IgnoreReason::Deleted);
    }
    if state.locate(&incoming.id).is_some() {
        return merge(state, incoming);
    }

    let confirmed = match state.parked.get(&incoming.id) {
        Some(parked) if parked.entry.updated_at > incoming.updated_at => {
            return ApplyOutcome::Ignored(IgnoreReason::Stale);
        }
        Some(parked) => parked.confirmed,
        None => false,
    };

    if confirmed && state.window.contains(incoming.date) {
        // Known entry moving back into view.
        state.parked.remove(&incoming.id);
        place(state, incoming.clone());
        return ApplyOutcome::Moved;
    }

    state.parked.remove(&incoming.id);
    state.parked.insert(
        incoming.id.clone(),
        Parked {
            entry: incoming.clone(),
            confirmed,
        },
    );
    if confirmed {
        ApplyOutcome::Ignored(IgnoreReason::OutOfWindow)
    } else {
        ApplyOutcome::Deferred
    }
}

fn apply_delete(state: &mut CacheState, shadow: &EntryShadow) -> ApplyOutcome {
    state.parked.remove(&shadow.id);
    let already = state.tombstones.contains(&shadow.id);
    state.tombstones.insert(shadow.id.clone(), ());

    match state.locate(&shadow.id) {
        Some((date, idx)) => {
            if let Some(bucket) = state.buckets.get_mut(&date) {
                bucket.remove(idx);
            }
            ApplyOutcome::Removed
        }
        None if already => ApplyOutcome::Ignored(IgnoreReason::Duplicate),
        None => ApplyOutcome::Ignored(IgnoreReason::UnknownId),
    }
}

/// Last-write-wins merge of a cached entry.
fn merge(state: &mut CacheState, incoming: &Entry) -> ApplyOutcome {
    let Some((date, idx)) = state.locate(&incoming.id) else {
        return ApplyOutcome::Ignored(IgnoreReason::UnknownId);
    };
    let Some(bucket) = state.buckets.get_mut(&date) else {
        return ApplyOutcome::Ignored(IgnoreReason::UnknownId);
    };

    let existing = &bucket[idx];
    if existing == incoming {
        return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
    }
    if incoming.updated_at < existing.updated_at {
        return ApplyOutcome::Ignored(IgnoreReason::Stale);
    }

    if incoming.date == date {
        bucket[idx] = incoming.clone();
        sort_by_creation(bucket);
        return ApplyOutcome::Updated;
    }

    bucket.remove(idx);
    if state.window.contains(incoming.date) {
        place(state, incoming.clone());
    } else {
        state.parked.insert(
            incoming.id.clone(),
            Parked {
                entry: incoming.clone(),
                confirmed: true,
            },
        );
    }
    ApplyOutcome::Moved
}

fn place(state: &mut CacheState, entry: Entry) {
    let bucket = state.buckets.entry(entry.date).or_default();
    bucket.push(entry);
    sort_by_creation(bucket);
}

/// Counters for everything the reconciler has seen since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub received: u64,
    pub inserted: u64,
    pub updated: u64,
    pub moved: u64,
    pub removed: u64,
    pub deferred: u64,
    pub ignored: u64,
    pub out_of_window: u64,
}

impl ReconcileStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        self.received += 1;
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Moved => self.moved += 1,
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::Deferred => self.deferred += 1,
            ApplyOutcome::Ignored(reason) => {
                self.ignored += 1;
                if reason == IgnoreReason::OutOfWindow {
                    self.out_of_window += 1;
                }
            }
        }
    }
}

struct ActiveFeed {
    user: UserId,
    task: JoinHandle<()>,
}

impl ActiveFeed {
    async fn stop(self) {
        self.task.abort();
        // Wait for the task to drop its subscription before anyone opens a new one.
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!(user = %self.user, error = %err, "change feed task panicked");
            }
        }
        info!(user = %self.user, "change feed closed");
    }
}

/// Owns the single change-feed subscription for the signed-in user.
pub struct ChangeReconciler {
    cache: EntryCache,
    active: tokio::sync::Mutex<Option<ActiveFeed>>,
    stats: Arc<Mutex<ReconcileStats>>,
}

impl ChangeReconciler {
    pub fn new(cache: EntryCache) -> Self {
        Self {
            cache,
            active: tokio::sync::Mutex::new(None),
            stats: Arc::new(Mutex::new(ReconcileStats::default())),
        }
    }

    /// Apply a single event outside of any feed. Never fails.
    pub fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        apply_and_record(&self.cache, &self.stats, event)
    }

    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to `user`'s changes, replacing any existing subscription.
    pub async fn open(&self, user: UserId) -> SyncResult<()> {
        let mut active = self.active.lock().await;
        if let Some(feed) = active.take() {
            feed.stop().await;
        }

        let filter = ChangeFilter {
            user_id: user.clone(),
        };
        let subscription = self.cache.call(self.cache.store().subscribe(&filter)).await?;
        let task = tokio::spawn(pump(self.cache.clone(), subscription, self.stats.clone()));
        info!(user = %user, "change feed opened");
        *active = Some(ActiveFeed { user, task });
        Ok(())
    }

    /// Tear down the subscription if there is one. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(feed) = self.active.lock().await.take() {
            feed.stop().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.feed_user().await.is_some()
    }

    /// The user whose feed is currently live.
    pub async fn feed_user(&self) -> Option<UserId> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|feed| !feed.task.is_finished())
            .map(|feed| feed.user.clone())
    }

    /// Keep the subscription in step with connection state and the signed-in user.
    ///
    /// The feed is opened whenever the state is `Connected` and a user is
    /// known, and closed otherwise. Each time it opens, the cached window is
    /// refetched to pick up writes made while no feed was listening. The task
    /// ends when either sender is dropped.
    pub fn supervise(
        self: &Arc<Self>,
        mut connection: watch::Receiver<ConnectionState>,
        mut user: watch::Receiver<Option<UserId>>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let state = *connection.borrow_and_update();
                let wanted = user.borrow_and_update().clone();
                this.reconcile_feed(state, wanted).await;

                tokio::select! {
                    changed = connection.changed() => if changed.is_err() { break },
                    changed = user.changed() => if changed.is_err() { break },
                }
            }
            this.close().await;
            debug!("feed supervisor stopped");
        })
    }

    async fn reconcile_feed(&self, state: ConnectionState, wanted: Option<UserId>) {
        match (state, wanted) {
            (ConnectionState::Connected, Some(user)) => {
                if self.feed_user().await.as_ref() == Some(&user) {
                    return;
                }
                if let Err(err) = self.open(user).await {
                    warn!(error = %err, "failed to open change feed");
                    return;
                }
                if let Err(err) = self.cache.resync().await {
                    warn!(error = %err, "resync after opening change feed failed");
                }
            }
            _ => self.close().await,
        }
    }
}

impl Drop for ChangeReconciler {
    fn drop(&mut self) {
        if let Some(feed) = self.active.get_mut().take() {
            feed.task.abort();
        }
    }
}

fn apply_and_record(
    cache: &EntryCache,
    stats: &Mutex<ReconcileStats>,
    event: &ChangeEvent,
) -> ApplyOutcome {
    let outcome = cache.apply_change(event);
    trace!(kind = %event.kind(), id = %event.entry_id(), ?outcome, "change applied");
    stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(outcome);
    outcome
}

async fn pump(cache: EntryCache, mut subscription: Subscription, stats: Arc<Mutex<ReconcileStats>>) {
    while let Some(event) = subscription.next().await {
        apply_and_record(&cache, &stats, &event);
    }
    // A feed we still want only ends when the store stopped delivering.
    warn!("change feed ended unexpectedly");
    cache.mark_unreachable();
}
