//! SQLite implementation of the persistence traits

use super::{
    ActorRiskProfile, BaselineStore, DailyRiskSummary, EventSink, PersistenceError, RiskQuery,
    ALL_EVENTS_TABLE,
};
use crate::detection::ActorBaseline;
use crate::models::{RiskEventRecord, RiskLevel};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, Row};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TABLE_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,63}$";

impl ToSql for RiskLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RiskLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// SQLite-backed event sink, query surface and baseline store
///
/// Every destination table shares the same five-column layout. Queries run
/// against one table, `risk_events` unless configured otherwise.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    query_table: String,
}

impl SqliteEventStore {
    /// Open (or create) a database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(SqliteEventStore {
            conn: Mutex::new(conn),
            query_table: ALL_EVENTS_TABLE.to_string(),
        })
    }

    /// Point the query interface at another table
    pub fn with_query_table(mut self, table: &str) -> Result<Self, PersistenceError> {
        validate_table_name(table)?;
        self.query_table = table.to_string();
        Ok(self)
    }

    pub fn query_table(&self) -> &str {
        &self.query_table
    }

    /// Number of rows in `table`, 0 when it does not exist yet
    pub fn count_rows(&self, table: &str) -> Result<u64, PersistenceError> {
        validate_table_name(table)?;
        let conn = self.conn.lock();
        if !table_exists(&conn, table)? {
            return Ok(0);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn validate_table_name(table: &str) -> Result<(), PersistenceError> {
    let pattern =
        Regex::new(TABLE_NAME_PATTERN).map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
    if pattern.is_match(table) && !table.to_lowercase().starts_with("sqlite_") {
        Ok(())
    } else {
        Err(PersistenceError::InvalidTableName(table.to_string()))
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, PersistenceError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Create the destination table and its indexes if absent
fn ensure_event_table(conn: &Connection, table: &str) -> Result<(), PersistenceError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            risk_score REAL NOT NULL,
            risk_level TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_actor_id ON {table}(actor_id);
        CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
        CREATE INDEX IF NOT EXISTS idx_{table}_risk_level ON {table}(risk_level);",
        table = table
    ))?;
    Ok(())
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RiskEventRecord> {
    let raw_timestamp: String = row.get(2)?;
    let timestamp = parse_timestamp(&raw_timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(RiskEventRecord {
        actor_id: row.get(0)?,
        event_type: row.get(1)?,
        timestamp,
        risk_score: row.get(3)?,
        risk_level: row.get(4)?,
    })
}

impl EventSink for SqliteEventStore {
    fn append(&self, table: &str, records: &[RiskEventRecord]) -> Result<usize, PersistenceError> {
        validate_table_name(table)?;
        let mut conn = self.conn.lock();
        ensure_event_table(&conn, table)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (actor_id, event_type, timestamp, risk_score, risk_level)
                 VALUES (?, ?, ?, ?, ?)",
                table
            ))?;
            for record in records {
                stmt.execute(params![
                    record.actor_id,
                    record.event_type,
                    format_timestamp(&record.timestamp),
                    record.risk_score,
                    record.risk_level,
                ])?;
            }
        }
        tx.commit()?;

        log::debug!("Appended {} row(s) to {}", records.len(), table);
        Ok(records.len())
    }
}

impl RiskQuery for SqliteEventStore {
    fn recent_events(
        &self,
        limit: usize,
        risk_level: Option<RiskLevel>,
    ) -> Result<Vec<RiskEventRecord>, PersistenceError> {
        let conn = self.conn.lock();
        ensure_event_table(&conn, &self.query_table)?;

        let columns = "actor_id, event_type, timestamp, risk_score, risk_level";
        let records = match risk_level {
            Some(level) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM {} WHERE risk_level = ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                    columns, self.query_table
                ))?;
                let rows = stmt.query_map(params![level, limit as i64], record_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM {} ORDER BY timestamp DESC, id DESC LIMIT ?",
                    columns, self.query_table
                ))?;
                let rows = stmt.query_map(params![limit as i64], record_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(records)
    }

    fn risk_summary_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DailyRiskSummary>, PersistenceError> {
        let conn = self.conn.lock();
        ensure_event_table(&conn, &self.query_table)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT date(timestamp) AS day, risk_level, COUNT(*), AVG(risk_score), MAX(risk_score)
             FROM {}
             WHERE timestamp >= ?
             GROUP BY day, risk_level
             ORDER BY day DESC, risk_level",
            self.query_table
        ))?;

        let summaries = stmt
            .query_map(params![format_timestamp(&cutoff)], |row| {
                let raw_date: String = row.get(0)?;
                let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                })?;
                let event_count: i64 = row.get(2)?;
                Ok(DailyRiskSummary {
                    date,
                    risk_level: row.get(1)?,
                    event_count: event_count as u64,
                    avg_risk_score: row.get(3)?,
                    max_risk_score: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    fn actor_risk_profile(
        &self,
        actor_id: &str,
    ) -> Result<Option<ActorRiskProfile>, PersistenceError> {
        let conn = self.conn.lock();
        ensure_event_table(&conn, &self.query_table)?;

        let (total, avg, max, high): (i64, Option<f64>, Option<f64>, Option<i64>) = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), AVG(risk_score), MAX(risk_score),
                            SUM(CASE WHEN risk_level = 'HIGH' THEN 1 ELSE 0 END)
                     FROM {} WHERE actor_id = ?",
                    self.query_table
                ),
                params![actor_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        if total == 0 {
            return Ok(None);
        }

        Ok(Some(ActorRiskProfile {
            actor_id: actor_id.to_string(),
            total_events: total as u64,
            avg_risk_score: avg.unwrap_or(0.0),
            max_risk_score: max.unwrap_or(0.0),
            high_risk_events: high.unwrap_or(0) as u64,
        }))
    }
}

impl BaselineStore for SqliteEventStore {
    fn save_baselines(
        &self,
        baselines: &HashMap<String, ActorBaseline>,
    ) -> Result<(), PersistenceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM actor_baselines", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO actor_baselines
                 (actor_id, mean_access_count, std_access_count,
                  mean_transfer_size, std_transfer_size, normal_hours)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for (actor_id, baseline) in baselines {
                stmt.execute(params![
                    actor_id,
                    baseline.mean_access_count,
                    baseline.std_access_count,
                    baseline.mean_transfer_size,
                    baseline.std_transfer_size,
                    serde_json::to_string(&baseline.normal_hours)?,
                ])?;
            }
        }
        tx.commit()?;

        log::info!("Persisted {} baseline(s)", baselines.len());
        Ok(())
    }

    fn load_baselines(&self) -> Result<HashMap<String, ActorBaseline>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT actor_id, mean_access_count, std_access_count,
                    mean_transfer_size, std_transfer_size, normal_hours
             FROM actor_baselines",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut baselines = HashMap::with_capacity(rows.len());
        for (actor_id, mean_access, std_access, mean_transfer, std_transfer, hours) in rows {
            let normal_hours: BTreeSet<i64> = serde_json::from_str(&hours).map_err(|e| {
                PersistenceError::InvalidData(format!("normal_hours for {}: {}", actor_id, e))
            })?;
            baselines.insert(
                actor_id,
                ActorBaseline {
                    mean_access_count: mean_access,
                    std_access_count: std_access,
                    mean_transfer_size: mean_transfer,
                    std_transfer_size: std_transfer,
                    normal_hours,
                },
            );
        }

        Ok(baselines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteEventStore {
        SqliteEventStore::in_memory().expect("Failed to create in-memory store")
    }

    fn record(actor: &str, event_type: &str, timestamp: DateTime<Utc>, score: f64) -> RiskEventRecord {
        RiskEventRecord {
            actor_id: actor.to_string(),
            event_type: event_type.to_string(),
            timestamp,
            risk_score: score,
            risk_level: RiskLevel::from_score(score as u8),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_append_creates_table() {
        let store = create_test_store();
        assert_eq!(store.count_rows("access_events").unwrap(), 0);

        let written = store
            .append("access_events", &[record("user001", "DATA_ACCESS", at(15, 10), 30.0)])
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.count_rows("access_events").unwrap(), 1);
    }

    #[test]
    fn test_append_never_overwrites() {
        let store = create_test_store();
        let row = record("user001", "DATA_ACCESS", at(15, 10), 30.0);

        store.append("access_events", &[row.clone()]).unwrap();
        store.append("access_events", &[row.clone(), row]).unwrap();
        store.append("access_events", &[]).unwrap();

        assert_eq!(store.count_rows("access_events").unwrap(), 3);
    }

    #[test]
    fn test_invalid_table_names() {
        let store = create_test_store();
        let rows = [record("u", "LOGIN", at(15, 10), 0.0)];

        for name in ["", "events; DROP TABLE x", "1events", "sqlite_master", "a-b"] {
            assert!(
                matches!(store.append(name, &rows), Err(PersistenceError::InvalidTableName(_))),
                "accepted {:?}",
                name
            );
        }
        assert!(SqliteEventStore::in_memory().unwrap().with_query_table("bad name").is_err());
    }

    #[test]
    fn test_recent_events_order_and_filter() {
        let store = create_test_store();
        store
            .append(
                ALL_EVENTS_TABLE,
                &[
                    record("user001", "DATA_ACCESS", at(15, 10), 30.0),
                    record("user002", "FILE_DOWNLOAD", at(15, 14), 70.0),
                    record("user003", "PRIVILEGED_ACTION", at(15, 22), 65.0),
                    record("user001", "DATA_EXPORT", at(16, 9), 85.0),
                    record("user004", "LOGIN", at(16, 11), 20.0),
                ],
            )
            .unwrap();

        let recent = store.recent_events(2, None).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].actor_id, "user004");
        assert_eq!(recent[0].timestamp, at(16, 11));
        assert_eq!(recent[1].event_type, "DATA_EXPORT");

        let high = store.recent_events(10, Some(RiskLevel::High)).unwrap();
        assert_eq!(high.len(), 2);
        assert!(high.iter().all(|r| r.risk_level == RiskLevel::High));
        assert_eq!(high[0].event_type, "DATA_EXPORT");
    }

    #[test]
    fn test_queries_on_empty_store() {
        let store = create_test_store();
        assert!(store.recent_events(10, None).unwrap().is_empty());
        assert!(store.risk_summary(30).unwrap().is_empty());
        assert!(store.actor_risk_profile("nobody").unwrap().is_none());
    }

    #[test]
    fn test_risk_summary_since() {
        let store = create_test_store();
        store
            .append(
                ALL_EVENTS_TABLE,
                &[
                    record("old", "LOGIN", at(1, 8), 10.0),
                    record("user001", "DATA_ACCESS", at(15, 10), 30.0),
                    record("user004", "LOGIN", at(15, 11), 20.0),
                    record("user002", "FILE_DOWNLOAD", at(15, 14), 70.0),
                    record("user001", "DATA_EXPORT", at(16, 9), 85.0),
                ],
            )
            .unwrap();

        let summary = store.risk_summary_since(at(10, 0)).unwrap();
        assert_eq!(summary.len(), 3);

        assert_eq!(summary[0].date, NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
        assert_eq!(summary[0].risk_level, RiskLevel::High);
        assert_eq!(summary[0].event_count, 1);

        let low = summary
            .iter()
            .find(|s| s.risk_level == RiskLevel::Low)
            .unwrap();
        assert_eq!(low.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(low.event_count, 2);
        assert!((low.avg_risk_score - 25.0).abs() < 1e-9);
        assert!((low.max_risk_score - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_actor_risk_profile() {
        let store = create_test_store();
        store
            .append(
                ALL_EVENTS_TABLE,
                &[
                    record("user001", "DATA_ACCESS", at(15, 10), 30.0),
                    record("user001", "DATA_EXPORT", at(16, 9), 85.0),
                    record("user001", "FILE_DOWNLOAD", at(16, 10), 70.0),
                    record("user002", "LOGIN", at(16, 11), 0.0),
                ],
            )
            .unwrap();

        let profile = store.actor_risk_profile("user001").unwrap().unwrap();
        assert_eq!(profile.total_events, 3);
        assert_eq!(profile.high_risk_events, 2);
        assert!((profile.avg_risk_score - 61.666_666).abs() < 1e-3);
        assert_eq!(profile.max_risk_score, 85.0);
    }

    #[test]
    fn test_custom_query_table() {
        let store = create_test_store().with_query_table("access_events").unwrap();
        store
            .append("access_events", &[record("user001", "DATA_ACCESS", at(15, 10), 30.0)])
            .unwrap();
        assert_eq!(store.query_table(), "access_events");
        assert_eq!(store.recent_events(5, None).unwrap().len(), 1);
    }

    #[test]
    fn test_baseline_roundtrip() {
        let store = create_test_store();
        let mut baselines = HashMap::new();
        baselines.insert(
            "user1".to_string(),
            ActorBaseline {
                mean_access_count: 10.0,
                std_access_count: 1.63,
                mean_transfer_size: 5.0,
                std_transfer_size: 1.63,
                normal_hours: BTreeSet::from([9, 10, 14]),
            },
        );

        store.save_baselines(&baselines).unwrap();
        assert_eq!(store.load_baselines().unwrap(), baselines);

        // Saving replaces the whole set
        store.save_baselines(&HashMap::new()).unwrap();
        assert!(store.load_baselines().unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("riskflow.db");

        {
            let store = SqliteEventStore::new(&path).unwrap();
            store
                .append("other_events", &[record("u", "PRINT_JOB", at(15, 10), 0.0)])
                .unwrap();
        }

        let reopened = SqliteEventStore::new(&path).unwrap();
        assert_eq!(reopened.count_rows("other_events").unwrap(), 1);
    }
}
