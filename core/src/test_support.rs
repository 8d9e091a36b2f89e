//! Scripted in-memory store for exercising the sync layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    ChangeEvent, Entry, EntryId, EntryPatch, EntryShadow, MealCategory, NewEntry, UserId,
    sort_by_creation,
};
use crate::store::{ChangeFilter, EntryQuery, ProbeOutcome, RemoteStore, Subscription};

pub(crate) fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

pub(crate) fn at(date: NaiveDate, minute: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(8, 0, 0).unwrap())
        + chrono::Duration::minutes(i64::from(minute))
}

pub(crate) fn user() -> UserId {
    UserId::new("user-1")
}

pub(crate) fn entry(id: &str, date: NaiveDate, minute: u32, calories: f64) -> Entry {
    Entry {
        id: EntryId::new(id),
        user_id: user(),
        category: MealCategory::Lunch,
        name: format!("food {id}"),
        quantity: "1 serving".to_string(),
        calories,
        protein: 10.0,
        carbs: 20.0,
        fat: 5.0,
        notes: None,
        date,
        created_at: at(date, minute),
        updated_at: at(date, minute),
    }
}

pub(crate) fn new_entry(date: NaiveDate, name: &str, calories: f64) -> NewEntry {
    NewEntry {
        category: MealCategory::Dinner,
        name: name.to_string(),
        quantity: "1 plate".to_string(),
        calories,
        protein: 30.0,
        carbs: 45.0,
        fat: 12.0,
        notes: Some("homemade".to_string()),
        date,
    }
}

#[derive(Default)]
pub(crate) struct Calls {
    pub fetch: AtomicUsize,
    pub insert: AtomicUsize,
    pub update: AtomicUsize,
    pub delete: AtomicUsize,
    pub subscribe: AtomicUsize,
    pub probe: AtomicUsize,
}

impl Calls {
    pub fn total(&self) -> usize {
        [
            &self.fetch,
            &self.insert,
            &self.update,
            &self.delete,
            &self.subscribe,
            &self.probe,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

struct MockState {
    rows: Vec<Entry>,
    probe: ProbeOutcome,
    probe_delay: Option<Duration>,
    fail_next: Option<StoreError>,
    gates: HashMap<NaiveDate, Arc<Notify>>,
    subscribers: Vec<(UserId, mpsc::UnboundedSender<ChangeEvent>)>,
    next_id: usize,
    clock: DateTime<Utc>,
}

/// In-memory store. Writes are echoed to subscribers like a real change feed.
pub(crate) struct MockStore {
    pub calls: Calls,
    state: Mutex<MockState>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            calls: Calls::default(),
            state: Mutex::new(MockState {
                rows: Vec::new(),
                probe: ProbeOutcome::Ok,
                probe_delay: None,
                fail_next: None,
                gates: HashMap::new(),
                subscribers: Vec::new(),
                next_id: 1,
                clock: at(day(1), 0),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_rows(rows: Vec<Entry>) -> Self {
        let store = Self::new();
        store.lock().rows = rows;
        store
    }

    pub fn set_probe(&self, outcome: ProbeOutcome) {
        self.lock().probe = outcome;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = Some(delay);
    }

    pub fn fail_next(&self, error: StoreError) {
        self.lock().fail_next = Some(error);
    }

    pub fn push_row(&self, entry: Entry) {
        self.lock().rows.push(entry);
    }

    /// Block fetches starting at `date` until [`MockStore::release`] is called.
    pub fn hold(&self, date: NaiveDate) {
        self.lock().gates.insert(date, Arc::new(Notify::new()));
    }

    pub fn release(&self, date: NaiveDate) {
        if let Some(gate) = self.lock().gates.remove(&date) {
            gate.notify_one();
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn open_subscriptions(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// End every live subscription, as a store that went away would.
    pub fn end_feeds(&self) {
        self.lock().subscribers.clear();
    }

    /// Push an event to every live subscriber of the event's user.
    pub fn emit(&self, event: &ChangeEvent) {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (user, tx) in &state.subscribers {
            if user == event.user_id() {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn take_failure(&self) -> StoreResult<()> {
        match self.lock().fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    async fn fetch(&self, query: &EntryQuery) -> StoreResult<Vec<Entry>> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        let gate = self.lock().gates.get(&query.range.start).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.take_failure()?;
        let mut rows: Vec<Entry> = self
            .lock()
            .rows
            .iter()
            .filter(|e| e.user_id == query.user_id && query.range.contains(e.date))
            .cloned()
            .collect();
        sort_by_creation(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, user: &UserId, entry: &NewEntry) -> StoreResult<Entry> {
        self.calls.insert.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let created = {
            let mut state = self.lock();
            let id = EntryId::new(format!("m-{}", state.next_id));
            state.next_id += 1;
            state.clock += chrono::Duration::seconds(1);
            let created = Entry {
                id,
                user_id: user.clone(),
                category: entry.category,
                name: entry.name.clone(),
                quantity: entry.quantity.clone(),
                calories: entry.calories,
                protein: entry.protein,
                carbs: entry.carbs,
                fat: entry.fat,
                notes: entry.notes.clone(),
                date: entry.date,
                created_at: state.clock,
                updated_at: state.clock,
            };
            state.rows.push(created.clone());
            created
        };
        self.emit(&ChangeEvent::Insert(created.clone()));
        Ok(created)
    }

    async fn update(&self, user: &UserId, id: &EntryId, patch: &EntryPatch) -> StoreResult<Entry> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let updated = {
            let mut state = self.lock();
            state.clock += chrono::Duration::seconds(1);
            let clock = state.clock;
            let row = state
                .rows
                .iter_mut()
                .find(|e| &e.id == id && &e.user_id == user)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            patch.apply_to(row);
            row.updated_at = clock;
            row.clone()
        };
        self.emit(&ChangeEvent::Update(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, user: &UserId, id: &EntryId) -> StoreResult<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let removed = {
            let mut state = self.lock();
            let pos = state
                .rows
                .iter()
                .position(|e| &e.id == id && &e.user_id == user)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            state.rows.remove(pos)
        };
        self.emit(&ChangeEvent::Delete(EntryShadow::from(&removed)));
        Ok(())
    }

    async fn subscribe(&self, filter: &ChangeFilter) -> StoreResult<Subscription> {
        self.calls.subscribe.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push((filter.user_id.clone(), tx));
        Ok(Subscription::from_unbounded(rx))
    }

    async fn probe(&self) -> ProbeOutcome {
        self.calls.probe.fetch_add(1, Ordering::SeqCst);
        let (delay, outcome) = {
            let state = self.lock();
            (state.probe_delay, state.probe.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
