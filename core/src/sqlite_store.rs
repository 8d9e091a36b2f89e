use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use futures::StreamExt;
use futures::stream;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    ChangeEvent, ChangeRecord, Entry, EntryId, EntryPatch, EntryShadow, MealCategory, NewEntry,
    UserId, validate_new_entry, validate_patch,
};
use crate::store::{ChangeFilter, EntryQuery, ProbeOutcome, RemoteStore, Subscription};

const FEED_CAPACITY: usize = 1024;

/// Embedded store on SQLite. Every write is appended to a change log and
/// broadcast to live subscribers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    feed: broadcast::Sender<ChangeRecord>,
    last_tick: Mutex<DateTime<Utc>>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn).context("Failed to migrate database")?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            feed,
            last_tick: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    /// Current time at microsecond precision, strictly increasing across calls.
    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.last_tick.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().trunc_subsecs(6);
        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Expects columns:
    // 0: id, 1: user_id, 2: category, 3: name, 4: quantity, 5: calories,
    // 6: protein, 7: carbs, 8: fat, 9: notes, 10: date, 11: created_at, 12: updated_at
    fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
        let category: String = row.get(2)?;
        let date: String = row.get(10)?;
        Ok(Entry {
            id: EntryId::new(row.get::<_, String>(0)?),
            user_id: UserId::new(row.get::<_, String>(1)?),
            category: category
                .parse::<MealCategory>()
                .map_err(|e| conversion_error(2, e))?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            calories: row.get(5)?,
            protein: row.get(6)?,
            carbs: row.get(7)?,
            fat: row.get(8)?,
            notes: row.get(9)?,
            date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| conversion_error(10, e))?,
            created_at: parse_ts(row, 11)?,
            updated_at: parse_ts(row, 12)?,
        })
    }

    fn get_entry(conn: &Connection, user: &UserId, id: &EntryId) -> StoreResult<Option<Entry>> {
        let entry = conn
            .query_row(
                "SELECT id, user_id, category, name, quantity, calories, protein, carbs, fat,
                        notes, date, created_at, updated_at
                 FROM entries WHERE id = ?1 AND user_id = ?2",
                params![id.as_str(), user.as_str()],
                Self::entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn fetch_entries(&self, query: &EntryQuery) -> StoreResult<Vec<Entry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, category, name, quantity, calories, protein, carbs, fat,
                    notes, date, created_at, updated_at
             FROM entries
             WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3
             ORDER BY created_at, id",
        )?;
        let entries = stmt
            .query_map(
                params![
                    query.user_id.as_str(),
                    format_date(query.range.start),
                    format_date(query.range.end)
                ],
                Self::entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn insert_entry(&self, user: &UserId, entry: &NewEntry) -> StoreResult<Entry> {
        validate_new_entry(entry).map_err(|e| StoreError::Rejected(format!("{e:#}")))?;
        let now = self.tick();
        let created = Entry {
            id: EntryId::new(Uuid::new_v4().to_string()),
            user_id: user.clone(),
            category: entry.category,
            name: entry.name.trim().to_string(),
            quantity: entry.quantity.clone(),
            calories: entry.calories,
            protein: entry.protein,
            carbs: entry.carbs,
            fat: entry.fat,
            notes: entry.notes.clone(),
            date: entry.date,
            created_at: now,
            updated_at: now,
        };

        let record = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO entries (id, user_id, category, name, quantity, calories, protein,
                                      carbs, fat, notes, date, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    created.id.as_str(),
                    created.user_id.as_str(),
                    created.category.as_str(),
                    created.name,
                    created.quantity,
                    created.calories,
                    created.protein,
                    created.carbs,
                    created.fat,
                    created.notes,
                    format_date(created.date),
                    format_ts(created.created_at),
                    format_ts(created.updated_at),
                ],
            )?;
            let record = record_change(&tx, ChangeEvent::Insert(created.clone()))?;
            tx.commit()?;
            record
        };
        self.publish(record);
        Ok(created)
    }

    /// Apply a partial update. The new `updated_at` is always later than the previous one.
    pub fn update_entry(&self, user: &UserId, id: &EntryId, patch: &EntryPatch) -> StoreResult<Entry> {
        validate_patch(patch).map_err(|e| StoreError::Rejected(format!("{e:#}")))?;
        let (updated, record) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let mut entry = Self::get_entry(&tx, user, id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let previous = entry.updated_at;
            patch.apply_to(&mut entry);
            entry.name = entry.name.trim().to_string();
            let now = self.tick();
            entry.updated_at = if now > previous {
                now
            } else {
                previous + chrono::Duration::microseconds(1)
            };

            tx.execute(
                "UPDATE entries SET category = ?1, name = ?2, quantity = ?3, calories = ?4,
                        protein = ?5, carbs = ?6, fat = ?7, notes = ?8, date = ?9, updated_at = ?10
                 WHERE id = ?11 AND user_id = ?12",
                params![
                    entry.category.as_str(),
                    entry.name,
                    entry.quantity,
                    entry.calories,
                    entry.protein,
                    entry.carbs,
                    entry.fat,
                    entry.notes,
                    format_date(entry.date),
                    format_ts(entry.updated_at),
                    id.as_str(),
                    user.as_str(),
                ],
            )?;
            let record = record_change(&tx, ChangeEvent::Update(entry.clone()))?;
            tx.commit()?;
            (entry, record)
        };
        self.publish(record);
        Ok(updated)
    }

    pub fn delete_entry(&self, user: &UserId, id: &EntryId) -> StoreResult<()> {
        let record = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let entry = Self::get_entry(&tx, user, id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            tx.execute(
                "DELETE FROM entries WHERE id = ?1 AND user_id = ?2",
                params![id.as_str(), user.as_str()],
            )?;
            let record = record_change(&tx, ChangeEvent::Delete(EntryShadow::from(&entry)))?;
            tx.commit()?;
            record
        };
        self.publish(record);
        Ok(())
    }

    /// Logged changes for `user` after `since`, oldest first.
    pub fn changes_since(&self, user: &UserId, since: i64, limit: u32) -> StoreResult<Vec<ChangeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM changes
             WHERE user_id = ?1 AND seq > ?2
             ORDER BY seq
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![user.as_str(), since, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (seq, payload) in rows {
            match serde_json::from_str::<ChangeEvent>(&payload) {
                Ok(event) => records.push(ChangeRecord { seq, event }),
                Err(e) => warn!(seq, error = %e, "skipping unreadable change log row"),
            }
        }
        Ok(records)
    }

    /// Highest sequence number in the change log, or 0 when empty.
    pub fn latest_seq(&self) -> StoreResult<i64> {
        let seq = self
            .lock()
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| {
                row.get(0)
            })?;
        Ok(seq)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    fn publish(&self, record: ChangeRecord) {
        debug!(seq = record.seq, kind = %record.event.kind(), id = %record.event.entry_id(), "change recorded");
        // No live subscribers is fine; the log still has it.
        let _ = self.feed.send(record);
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                name TEXT NOT NULL,
                quantity TEXT NOT NULL DEFAULT '',
                calories REAL NOT NULL DEFAULT 0,
                protein REAL NOT NULL DEFAULT 0,
                carbs REAL NOT NULL DEFAULT 0,
                fat REAL NOT NULL DEFAULT 0,
                notes TEXT,
                date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                entry_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_user_date ON entries(user_id, date);
            CREATE INDEX IF NOT EXISTS idx_changes_user_seq ON changes(user_id, seq);

            PRAGMA user_version = 1;",
        )?;
    }

    Ok(())
}

fn record_change(conn: &Connection, event: ChangeEvent) -> StoreResult<ChangeRecord> {
    let payload = serde_json::to_string(&event)?;
    conn.execute(
        "INSERT INTO changes (user_id, entry_id, kind, payload, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.user_id().as_str(),
            event.entry_id().as_str(),
            event.kind().as_str(),
            payload,
            format_ts(Utc::now()),
        ],
    )?;
    Ok(ChangeRecord {
        seq: conn.last_insert_rowid(),
        event,
    })
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn fetch(&self, query: &EntryQuery) -> StoreResult<Vec<Entry>> {
        self.fetch_entries(query)
    }

    async fn insert(&self, user: &UserId, entry: &NewEntry) -> StoreResult<Entry> {
        self.insert_entry(user, entry)
    }

    async fn update(&self, user: &UserId, id: &EntryId, patch: &EntryPatch) -> StoreResult<Entry> {
        self.update_entry(user, id, patch)
    }

    async fn delete(&self, user: &UserId, id: &EntryId) -> StoreResult<()> {
        self.delete_entry(user, id)
    }

    async fn subscribe(&self, filter: &ChangeFilter) -> StoreResult<Subscription> {
        let rx = self.feed.subscribe();
        let events = stream::unfold((rx, filter.user_id.clone()), |(mut rx, user)| async move {
            loop {
                match rx.recv().await {
                    Ok(record) if record.event.user_id() == &user => {
                        return Some((record.event, (rx, user)));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change subscriber fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Subscription::new(events.boxed()))
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.latest_seq() {
            Ok(_) => ProbeOutcome::Ok,
            Err(e) => ProbeOutcome::NetworkError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DateRange;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn sample(date: NaiveDate, name: &str) -> NewEntry {
        NewEntry {
            category: MealCategory::Breakfast,
            name: name.to_string(),
            quantity: "2 slices".to_string(),
            calories: 260.0,
            protein: 9.0,
            carbs: 44.0,
            fat: 4.5,
            notes: None,
            date,
        }
    }

    fn query(user: UserId, range: DateRange) -> EntryQuery {
        EntryQuery {
            user_id: user,
            range,
        }
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap();
        let second = store.insert_entry(&alice(), &sample(d(15), "Eggs")).unwrap();
        store.insert_entry(&alice(), &sample(d(14), "Porridge")).unwrap();
        store
            .insert_entry(&UserId::new("bob"), &sample(d(15), "Bagel"))
            .unwrap();

        let rows = store
            .fetch_entries(&query(alice(), DateRange::single(d(15))))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[1].id, second.id);
        assert_eq!(rows[0], first);

        let week = store
            .fetch_entries(&query(alice(), DateRange::lookback(d(15), 7)))
            .unwrap();
        assert_eq!(week.len(), 3);
    }

    #[test]
    fn test_insert_rejects_invalid_entry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut bad = sample(d(15), "Toast");
        bad.calories = -5.0;
        let err = store.insert_entry(&alice(), &bad).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.latest_seq().unwrap(), 0);
    }

    #[test]
    fn test_update_bumps_updated_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap();
        let patch = EntryPatch {
            calories: Some(300.0),
            notes: Some(Some("with butter".to_string())),
            date: Some(d(16)),
            ..EntryPatch::default()
        };
        let updated = store.update_entry(&alice(), &created.id, &patch).unwrap();
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.created_at, created.created_at);
        assert!((updated.calories - 300.0).abs() < f64::EPSILON);
        assert_eq!(updated.notes.as_deref(), Some("with butter"));
        assert_eq!(updated.date, d(16));

        let clear = EntryPatch {
            notes: Some(None),
            ..EntryPatch::default()
        };
        let cleared = store.update_entry(&alice(), &created.id, &clear).unwrap();
        assert_eq!(cleared.notes, None);
    }

    #[test]
    fn test_update_and_delete_missing_entry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let patch = EntryPatch {
            calories: Some(1.0),
            ..EntryPatch::default()
        };
        let missing = EntryId::new("nope");
        assert!(matches!(
            store.update_entry(&alice(), &missing, &patch),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_entry(&alice(), &missing),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_other_users_entries_are_not_writable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap();
        assert!(matches!(
            store.delete_entry(&UserId::new("bob"), &created.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_change_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap();
        store
            .insert_entry(&UserId::new("bob"), &sample(d(15), "Bagel"))
            .unwrap();
        store.delete_entry(&alice(), &created.id).unwrap();

        let changes = store.changes_since(&alice(), 0, 100).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0].event, ChangeEvent::Insert(_)));
        assert!(matches!(changes[1].event, ChangeEvent::Delete(_)));
        assert_eq!(changes[1].event.date(), Some(d(15)));

        let after = store.changes_since(&alice(), changes[0].seq, 100).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(store.latest_seq().unwrap(), 3);
        assert_eq!(store.changes_since(&alice(), 0, 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sub = store
            .subscribe(&ChangeFilter { user_id: alice() })
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);

        store
            .insert_entry(&UserId::new("bob"), &sample(d(15), "Bagel"))
            .unwrap();
        let created = store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event, ChangeEvent::Insert(created));

        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.probe().await, ProbeOutcome::Ok);
    }

    #[test]
    fn test_reopen_persists_and_migrates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nibble.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_entry(&alice(), &sample(d(15), "Toast")).unwrap().id
        };
        let store = SqliteStore::open(&path).unwrap();
        let rows = store
            .fetch_entries(&query(alice(), DateRange::single(d(15))))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(store.latest_seq().unwrap(), 1);
    }
}
