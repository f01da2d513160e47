//! Event store accessor and the user-metrics cache.
//!
//! The read side (`EventStore`) is what the feature extractors depend on. The
//! write side (`MetricsStore`) is only used by the prediction updater.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{Event, EventType, User};

const HIGH_PROBABILITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// Read-only access to users and their event history.
pub trait EventStore: Send + Sync {
    fn user(&self, user_id: i64) -> Result<Option<User>, StoreError>;

    /// Events with `timestamp <= until`, ordered by timestamp.
    fn user_events(&self, user_id: i64, until: DateTime<Utc>) -> Result<Vec<Event>, StoreError>;

    fn user_ids(&self, limit: Option<usize>) -> Result<Vec<i64>, StoreError>;

    /// Users with at least one event in `[start, end]`.
    fn active_user_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub user_id: i64,
    pub purchase_probability_30d: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionStats {
    pub total_predictions: u64,
    pub avg_probability: Option<f64>,
    pub high_probability_users: u64,
    pub last_update: Option<DateTime<Utc>>,
}

pub trait MetricsStore: Send + Sync {
    /// Users active since `active_since` whose cached prediction is missing or
    /// older than `stale_before`, oldest cache entries first.
    fn users_needing_prediction_update(
        &self,
        stale_before: DateTime<Utc>,
        active_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError>;

    fn upsert_purchase_probabilities(&self, rows: &[PredictionRecord]) -> Result<usize, StoreError>;

    fn prediction_stats(&self) -> Result<PredictionStats, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                telegram_id INTEGER NOT NULL,
                registration_ts_ms_utc INTEGER NULL,
                username TEXT NULL,
                last_name TEXT NULL,
                profile_data TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS events (
                event_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_ts_ms_utc INTEGER NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_events_user_ts
                ON events (user_id, event_ts_ms_utc);
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events (event_ts_ms_utc);
            CREATE TABLE IF NOT EXISTS user_metrics (
                user_id INTEGER PRIMARY KEY,
                purchase_probability_30d REAL NULL,
                churn_probability REAL NULL,
                last_updated_ms_utc INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO users (
                user_id, telegram_id, registration_ts_ms_utc, username, last_name, profile_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.user_id,
                user.telegram_id,
                user.registration_date.map(|d| d.timestamp_millis()),
                user.username,
                user.last_name,
                serde_json::to_string(&user.profile_data)?,
            ],
        )?;
        Ok(())
    }

    pub fn insert_events(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (user_id, event_type, event_ts_ms_utc, properties)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.user_id,
                    event.event_type.as_str(),
                    event.timestamp.timestamp_millis(),
                    serde_json::to_string(&event.properties)?,
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            component = "store",
            event = "store.events.inserted",
            rows = events.len()
        );
        Ok(events.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl EventStore for SqliteStore {
    fn user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT user_id, telegram_id, registration_ts_ms_utc, username, last_name, profile_data
                 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, telegram_id, registration_ms, username, last_name, profile)) = row
        else {
            return Ok(None);
        };

        Ok(Some(User {
            user_id,
            telegram_id,
            registration_date: registration_ms.map(from_millis).transpose()?,
            username,
            last_name,
            profile_data: serde_json::from_str(&profile)?,
        }))
    }

    fn user_events(&self, user_id: i64, until: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_ts_ms_utc, properties
             FROM events
             WHERE user_id = ?1 AND event_ts_ms_utc <= ?2
             ORDER BY event_ts_ms_utc ASC, event_id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, until.timestamp_millis()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_type, ts_ms, properties)| {
                Ok(Event {
                    user_id,
                    event_type: EventType::parse(&event_type),
                    timestamp: from_millis(ts_ms)?,
                    properties: serde_json::from_str(&properties)?,
                })
            })
            .collect()
    }

    fn user_ids(&self, limit: Option<usize>) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id ASC LIMIT ?1")?;
        let ids = stmt
            .query_map(params![sql_limit(limit)], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn active_user_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.user_id
             FROM events e
             JOIN users u ON u.user_id = e.user_id
             WHERE e.event_ts_ms_utc BETWEEN ?1 AND ?2
             ORDER BY e.user_id ASC
             LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(
                params![
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    sql_limit(limit)
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl MetricsStore for SqliteStore {
    fn users_needing_prediction_update(
        &self,
        stale_before: DateTime<Utc>,
        active_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.user_id
             FROM users u
             LEFT JOIN user_metrics m ON m.user_id = u.user_id
             WHERE (m.user_id IS NULL
                    OR m.purchase_probability_30d IS NULL
                    OR m.last_updated_ms_utc < ?1)
               AND EXISTS (
                    SELECT 1 FROM events e
                    WHERE e.user_id = u.user_id AND e.event_ts_ms_utc >= ?2
               )
             ORDER BY COALESCE(m.last_updated_ms_utc, 0) ASC, u.user_id ASC
             LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(
                params![
                    stale_before.timestamp_millis(),
                    active_since.timestamp_millis(),
                    sql_limit(Some(limit))
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn upsert_purchase_probabilities(&self, rows: &[PredictionRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_metrics (user_id, purchase_probability_30d, last_updated_ms_utc)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    purchase_probability_30d = excluded.purchase_probability_30d,
                    last_updated_ms_utc = excluded.last_updated_ms_utc",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.user_id,
                    row.purchase_probability_30d,
                    row.updated_at.timestamp_millis()
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn prediction_stats(&self) -> Result<PredictionStats, StoreError> {
        let conn = self.lock()?;
        let (total, avg, high, last) = conn.query_row(
            "SELECT COUNT(purchase_probability_30d),
                    AVG(purchase_probability_30d),
                    COALESCE(SUM(CASE WHEN purchase_probability_30d > ?1 THEN 1 ELSE 0 END), 0),
                    MAX(last_updated_ms_utc)
             FROM user_metrics",
            params![HIGH_PROBABILITY_THRESHOLD],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;

        Ok(PredictionStats {
            total_predictions: total.max(0) as u64,
            avg_probability: avg,
            high_probability_users: high.max(0) as u64,
            last_update: last.map(from_millis).transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(StoreError::InvalidTimestamp(ms))
}

// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit
        .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("in-memory store opens");
        store.init_schema().expect("schema initializes");
        for id in 1..=3 {
            store
                .insert_user(&User::new(id, 1000 + id, t0() - Duration::days(60)))
                .expect("user inserts");
        }
        store
            .insert_events(&[
                Event::new(1, EventType::View, t0() + Duration::minutes(10)),
                Event::new(1, EventType::Purchase, t0())
                    .with_properties(json!({"amount": 10.0})),
                Event::new(2, EventType::Message, t0() - Duration::days(40)),
            ])
            .expect("events insert");
        store
    }

    #[test]
    fn user_events_are_ordered_and_bounded() {
        let store = seeded();
        let events = store
            .user_events(1, t0() + Duration::hours(1))
            .expect("events load");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Purchase);
        assert_eq!(events[1].event_type, EventType::View);

        let bounded = store.user_events(1, t0()).expect("events load");
        assert_eq!(bounded.len(), 1);
    }

    #[test]
    fn missing_user_is_none() {
        let store = seeded();
        assert!(store.user(42).expect("query succeeds").is_none());
        let user = store.user(2).expect("query succeeds").expect("user exists");
        assert_eq!(user.telegram_id, 1002);
    }

    #[test]
    fn active_user_ids_respects_range_and_limit() {
        let store = seeded();
        let ids = store
            .active_user_ids(t0() - Duration::days(50), t0() + Duration::days(1), None)
            .expect("query succeeds");
        assert_eq!(ids, vec![1, 2]);
        let limited = store
            .active_user_ids(t0() - Duration::days(50), t0() + Duration::days(1), Some(1))
            .expect("query succeeds");
        assert_eq!(limited, vec![1]);
        assert_eq!(store.user_ids(None).expect("query succeeds"), vec![1, 2, 3]);
    }

    #[test]
    fn stale_selection_and_upsert_round_trip() {
        let store = seeded();
        let now = t0() + Duration::days(1);
        let stale = store
            .users_needing_prediction_update(now - Duration::days(1), now - Duration::days(30), 10)
            .expect("query succeeds");
        assert_eq!(stale, vec![1]);

        store
            .upsert_purchase_probabilities(&[PredictionRecord {
                user_id: 1,
                purchase_probability_30d: 0.9,
                updated_at: now,
            }])
            .expect("upsert succeeds");

        let stale = store
            .users_needing_prediction_update(now - Duration::days(1), now - Duration::days(30), 10)
            .expect("query succeeds");
        assert!(stale.is_empty());

        let stats = store.prediction_stats().expect("stats load");
        assert_eq!(stats.total_predictions, 1);
        assert_eq!(stats.high_probability_users, 1);
        assert_eq!(stats.last_update, Some(now));
    }
}
