//! The contract between the sync layer and whatever holds the entries.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::models::{ChangeEvent, Entry, EntryId, EntryPatch, NewEntry, UserId};

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// `days` days ending at (and including) `anchor`.
    #[must_use]
    pub fn lookback(anchor: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: anchor - Duration::days(span),
            end: anchor,
        }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryQuery {
    pub user_id: UserId,
    pub range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub user_id: UserId,
}

/// Result of a reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    /// The store answered but refused the credentials. Still proves reachability.
    AuthError(String),
    NetworkError(String),
}

/// A live change feed. Dropping it cancels the subscription.
pub struct Subscription {
    events: BoxStream<'static, ChangeEvent>,
}

impl Subscription {
    pub fn new(events: BoxStream<'static, ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn from_receiver(rx: mpsc::Receiver<ChangeEvent>) -> Self {
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Self::new(events.boxed())
    }

    pub fn from_unbounded(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Self::new(events.boxed())
    }

    /// Next event, or `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Backing store for entries. Implementations must be safe to share across tasks.
///
/// Writes never return cached state to the sync layer directly: a successful
/// `insert`, `update` or `delete` is expected to show up again as a
/// [`ChangeEvent`] on every matching [`Subscription`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Entries for one user within a date range, oldest `created_at` first.
    async fn fetch(&self, query: &EntryQuery) -> StoreResult<Vec<Entry>>;

    async fn insert(&self, user: &UserId, entry: &NewEntry) -> StoreResult<Entry>;

    async fn update(&self, user: &UserId, id: &EntryId, patch: &EntryPatch)
    -> StoreResult<Entry>;

    async fn delete(&self, user: &UserId, id: &EntryId) -> StoreResult<()>;

    async fn subscribe(&self, filter: &ChangeFilter) -> StoreResult<Subscription>;

    async fn probe(&self) -> ProbeOutcome;
}
