//! Reconciled metric point storage.
//!
//! One row per (user, project, provider, scope, date, metric). Writes are
//! idempotent upserts: replaying a day updates the value and bumps
//! `last_synced_at` while `first_synced_at` records when the point was
//! first seen.

use super::MetricValue;
use crate::error::SyncError;
use crate::provider::Provider;
use chrono::{NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

// Values use SQLite's dynamic typing: counts land as INTEGER, measures as
// REAL, unparsed raws as TEXT. Reads recover the variant from the column
// affinity, so no separate kind column is needed.
impl ToSql for MetricValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            MetricValue::Count(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            MetricValue::Measure(f) => ToSqlOutput::Owned(Value::Real(*f)),
            MetricValue::Raw(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
        })
    }
}

impl FromSql for MetricValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(MetricValue::Count(i)),
            ValueRef::Real(f) => Ok(MetricValue::Measure(f)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| MetricValue::Raw(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A stored metric point, as read back from the database.
#[derive(Clone, Debug, serde::Serialize)]
pub struct MetricRecord {
    pub metric_name: String,
    pub description: String,
    pub date: NaiveDate,
    pub value: MetricValue,
    pub first_synced_at: String,
    pub last_synced_at: String,
}

/// Whether an upsert created a new point or refreshed an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// SQLite-backed store of reconciled metric points.
pub struct MetricStore {
    conn: Mutex<Connection>,
}

impl MetricStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, SyncError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS metric_points (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                date TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                value NOT NULL,
                first_synced_at TEXT NOT NULL,
                last_synced_at TEXT NOT NULL,
                UNIQUE(user_id, project_id, provider, scope_id, date, metric_name)
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metric_points_lookup
             ON metric_points(user_id, project_id, provider, scope_id, date)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upserts a single metric point.
    ///
    /// Keyed on the full (user, project, provider, scope, date, metric)
    /// tuple. A fresh row records `first_synced_at = last_synced_at = now`;
    /// a replay keeps `first_synced_at` and overwrites value, description
    /// and `last_synced_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        scope_id: &str,
        date: NaiveDate,
        metric_name: &str,
        description: &str,
        value: &MetricValue,
    ) -> Result<UpsertOutcome, SyncError> {
        let now = Utc::now().to_rfc3339();

        let first_synced_at: String = self.conn.lock().unwrap().query_row(
            r#"
            INSERT INTO metric_points (
                user_id, project_id, provider, scope_id, date,
                metric_name, description, value,
                first_synced_at, last_synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(user_id, project_id, provider, scope_id, date, metric_name)
            DO UPDATE SET
                description = excluded.description,
                value = excluded.value,
                last_synced_at = excluded.last_synced_at
            RETURNING first_synced_at
            "#,
            params![
                user_id,
                project_id,
                provider.as_str(),
                scope_id,
                date.format("%Y-%m-%d").to_string(),
                metric_name,
                description,
                value,
                now,
            ],
            |row| row.get(0),
        )?;

        if first_synced_at == now {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Updated)
        }
    }

    /// Reads back all points for one scope and date, ordered by metric name.
    pub fn points_for_date(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        scope_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<MetricRecord>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT metric_name, description, date, value,
                   first_synced_at, last_synced_at
            FROM metric_points
            WHERE user_id = ?1 AND project_id = ?2 AND provider = ?3
              AND scope_id = ?4 AND date = ?5
            ORDER BY metric_name
            "#,
        )?;

        let records = stmt
            .query_map(
                params![
                    user_id,
                    project_id,
                    provider.as_str(),
                    scope_id,
                    date.format("%Y-%m-%d").to_string(),
                ],
                |row| {
                    let date_str: String = row.get(2)?;
                    Ok(MetricRecord {
                        metric_name: row.get(0)?,
                        description: row.get(1)?,
                        date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                                2,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            ))?,
                        value: row.get(3)?,
                        first_synced_at: row.get(4)?,
                        last_synced_at: row.get(5)?,
                    })
                },
            )?
            .collect::<Result<Vec<MetricRecord>, _>>()?;

        Ok(records)
    }

    /// Deletes every point for a (user, project, provider). Returns the
    /// number of rows removed. Called on disconnect.
    pub fn delete_provider_points(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
    ) -> Result<usize, SyncError> {
        let removed = self.conn.lock().unwrap().execute(
            "DELETE FROM metric_points
             WHERE user_id = ?1 AND project_id = ?2 AND provider = ?3",
            params![user_id, project_id, provider.as_str()],
        )?;

        Ok(removed)
    }

    /// Total stored points for a (user, project, provider).
    pub fn count_points(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
    ) -> Result<i64, SyncError> {
        let count = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM metric_points
             WHERE user_id = ?1 AND project_id = ?2 AND provider = ?3",
            params![user_id, project_id, provider.as_str()],
            |row| row.get(0),
        )?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> MetricStore {
        MetricStore::new(":memory:").expect("Failed to create test store")
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_insert_then_update() {
        let store = create_test_store();
        let d = date("2024-03-08");

        let outcome = store
            .upsert(
                "user1",
                "proj1",
                Provider::GoogleAnalytics,
                "props/123",
                d,
                "sessions",
                "Number of sessions",
                &MetricValue::Count(42),
            )
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        std::thread::sleep(std::time::Duration::from_millis(5));

        let outcome = store
            .upsert(
                "user1",
                "proj1",
                Provider::GoogleAnalytics,
                "props/123",
                d,
                "sessions",
                "Number of sessions",
                &MetricValue::Count(45),
            )
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let points = store
            .points_for_date("user1", "proj1", Provider::GoogleAnalytics, "props/123", d)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, MetricValue::Count(45));
        assert!(points[0].last_synced_at > points[0].first_synced_at);
    }

    #[test]
    fn test_value_types_survive_roundtrip() {
        let store = create_test_store();
        let d = date("2024-03-08");

        for (name, value) in [
            ("sessions", MetricValue::Count(1234)),
            ("averageSessionDuration", MetricValue::Measure(12.35)),
            ("oddball", MetricValue::Raw("(not set)".to_string())),
        ] {
            store
                .upsert(
                    "user1",
                    "proj1",
                    Provider::GoogleAnalytics,
                    "props/123",
                    d,
                    name,
                    "",
                    &value,
                )
                .unwrap();
        }

        let points = store
            .points_for_date("user1", "proj1", Provider::GoogleAnalytics, "props/123", d)
            .unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].value, MetricValue::Measure(12.35));
        assert_eq!(points[1].value, MetricValue::Raw("(not set)".to_string()));
        assert_eq!(points[2].value, MetricValue::Count(1234));
    }

    #[test]
    fn test_dates_and_scopes_are_isolated() {
        let store = create_test_store();

        store
            .upsert(
                "user1",
                "proj1",
                Provider::Stripe,
                "acct_1",
                date("2024-03-08"),
                "daily_charges_count",
                "",
                &MetricValue::Count(10),
            )
            .unwrap();
        store
            .upsert(
                "user1",
                "proj1",
                Provider::Stripe,
                "acct_1",
                date("2024-03-09"),
                "daily_charges_count",
                "",
                &MetricValue::Count(12),
            )
            .unwrap();
        store
            .upsert(
                "user1",
                "proj1",
                Provider::Stripe,
                "acct_2",
                date("2024-03-08"),
                "daily_charges_count",
                "",
                &MetricValue::Count(7),
            )
            .unwrap();

        assert_eq!(store.count_points("user1", "proj1", Provider::Stripe).unwrap(), 3);

        let points = store
            .points_for_date("user1", "proj1", Provider::Stripe, "acct_1", date("2024-03-08"))
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, MetricValue::Count(10));
    }

    #[test]
    fn test_points_survive_reopen() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let d = date("2024-03-08");

        {
            let store = MetricStore::new(file.path()).unwrap();
            store
                .upsert(
                    "user1",
                    "proj1",
                    Provider::GoogleAnalytics,
                    "props/123",
                    d,
                    "sessions",
                    "",
                    &MetricValue::Count(42),
                )
                .unwrap();
        }

        let store = MetricStore::new(file.path()).unwrap();
        let points = store
            .points_for_date("user1", "proj1", Provider::GoogleAnalytics, "props/123", d)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, MetricValue::Count(42));
    }

    #[test]
    fn test_disconnect_removes_points() {
        let store = create_test_store();
        let d = date("2024-03-08");

        store
            .upsert(
                "user1",
                "proj1",
                Provider::Stripe,
                "acct_1",
                d,
                "total_customers",
                "",
                &MetricValue::Count(100),
            )
            .unwrap();
        store
            .upsert(
                "user1",
                "proj1",
                Provider::GoogleAnalytics,
                "props/123",
                d,
                "sessions",
                "",
                &MetricValue::Count(5),
            )
            .unwrap();

        let removed = store
            .delete_provider_points("user1", "proj1", Provider::Stripe)
            .unwrap();
        assert_eq!(removed, 1);

        // Other provider untouched
        assert_eq!(
            store
                .count_points("user1", "proj1", Provider::GoogleAnalytics)
                .unwrap(),
            1
        );
    }
}
