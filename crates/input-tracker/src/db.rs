use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub const ENABLE_TRACKING_SETTING: &str = "EnableInputEventTracking";
pub const HISTORY_DAYS_SETTING: &str = "InputEventHistory";
pub const DEFAULT_HISTORY_DAYS: u32 = 30;

/// One completed bucket, as handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub minute: DateTime<Utc>,
    pub active_seconds: u32,
    pub process_id: u32,
    pub action_id: i64,
    pub machine_name: String,
    pub user_name: String,
}

/// External destination for completed buckets. Calls are synchronous and may
/// fail; the tracker logs failures and carries on.
pub trait ActivityStore: Send + Sync {
    fn record_activity(&self, record: &ActivityRecord) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredActivity {
    pub id: i64,
    pub minute_ts: i64,
    pub active_seconds: u32,
    pub process_id: u32,
    pub action_id: i64,
    pub machine_name: String,
    pub user_name: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create SQLite directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        conn.execute_batch(
            "\
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;",
        )
        .context("failed to configure database")?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "\
            CREATE TABLE IF NOT EXISTS settings (
              name TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS input_events (
              id INTEGER PRIMARY KEY,
              minute_ts INTEGER NOT NULL,
              active_seconds INTEGER NOT NULL CHECK (active_seconds BETWEEN 0 AND 60),
              process_id INTEGER NOT NULL,
              action_id INTEGER NOT NULL,
              machine_name TEXT NOT NULL,
              user_name TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_input_events_minute ON input_events(minute_ts);
            CREATE INDEX IF NOT EXISTS idx_input_events_action_minute ON input_events(action_id, minute_ts);",
        )
        .context("failed to initialize schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&mut conn)
    }

    pub fn insert_activity(&self, record: &ActivityRecord) -> Result<i64> {
        if record.active_seconds > 60 {
            return Err(anyhow!(
                "active seconds out of range: {}",
                record.active_seconds
            ));
        }

        self.with_conn(|conn| {
            conn.execute(
                "\
                INSERT INTO input_events (
                  minute_ts,
                  active_seconds,
                  process_id,
                  action_id,
                  machine_name,
                  user_name
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.minute.timestamp(),
                    record.active_seconds,
                    record.process_id,
                    record.action_id,
                    record.machine_name,
                    record.user_name,
                ],
            )
            .context("failed to insert input event")?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Rows with `start_ts <= minute_ts < end_ts`, oldest first.
    pub fn load_activity(&self, start_ts: i64, end_ts: i64) -> Result<Vec<StoredActivity>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "\
                    SELECT id, minute_ts, active_seconds, process_id, action_id, machine_name, user_name
                    FROM input_events
                    WHERE minute_ts >= ?1 AND minute_ts < ?2
                    ORDER BY minute_ts ASC, id ASC",
                )
                .context("failed to prepare input event query")?;
            let rows = stmt
                .query_map(params![start_ts, end_ts], |row| {
                    Ok(StoredActivity {
                        id: row.get(0)?,
                        minute_ts: row.get(1)?,
                        active_seconds: row.get(2)?,
                        process_id: row.get(3)?,
                        action_id: row.get(4)?,
                        machine_name: row.get(5)?,
                        user_name: row.get(6)?,
                    })
                })
                .context("failed to query input events")?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to decode input event row")?);
            }
            Ok(out)
        })
    }

    pub fn total_active_seconds(&self, start_ts: i64, end_ts: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "\
                SELECT COALESCE(SUM(active_seconds), 0)
                FROM input_events
                WHERE minute_ts >= ?1 AND minute_ts < ?2",
                params![start_ts, end_ts],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to sum active seconds")
        })
    }

    /// Deletes rows older than `cutoff_ts`; returns how many went.
    pub fn prune_before(&self, cutoff_ts: i64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM input_events WHERE minute_ts < ?1",
                params![cutoff_ts],
            )
            .context("failed to prune input events")
        })
    }

    pub fn setting(&self, name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read setting {name}"))
        })
    }

    pub fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "\
                INSERT INTO settings (name, value)
                VALUES (?1, ?2)
                ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )
            .with_context(|| format!("failed to write setting {name}"))?;
            Ok(())
        })
    }

    pub fn tracking_enabled(&self) -> Result<bool> {
        match self.setting(ENABLE_TRACKING_SETTING)? {
            None => Ok(true),
            Some(value) => parse_bool_setting(&value)
                .with_context(|| format!("invalid {ENABLE_TRACKING_SETTING} value: {value}")),
        }
    }

    pub fn history_days(&self) -> Result<u32> {
        match self.setting(HISTORY_DAYS_SETTING)? {
            None => Ok(DEFAULT_HISTORY_DAYS),
            Some(value) => value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid {HISTORY_DAYS_SETTING} value: {value}")),
        }
    }
}

impl ActivityStore for Database {
    fn record_activity(&self, record: &ActivityRecord) -> Result<()> {
        self.insert_activity(record).map(|_| ())
    }
}

fn parse_bool_setting(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(minute: DateTime<Utc>, active_seconds: u32) -> ActivityRecord {
        ActivityRecord {
            minute,
            active_seconds,
            process_id: 4242,
            action_id: 3,
            machine_name: "WS-01".to_owned(),
            user_name: "operator".to_owned(),
        }
    }

    #[test]
    fn records_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("fam.db");
        let minute = Utc.with_ymd_and_hms(2024, 5, 2, 14, 7, 0).unwrap();

        {
            let db = Database::open(&path).unwrap();
            db.record_activity(&record(minute, 17)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        let rows = db
            .load_activity(minute.timestamp(), minute.timestamp() + 60)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].minute_ts, minute.timestamp());
        assert_eq!(rows[0].active_seconds, 17);
        assert_eq!(rows[0].process_id, 4242);
        assert_eq!(rows[0].action_id, 3);
        assert_eq!(rows[0].machine_name, "WS-01");
    }

    #[test]
    fn rejects_more_than_sixty_seconds() {
        let db = Database::open_in_memory().unwrap();
        let minute = Utc.with_ymd_and_hms(2024, 5, 2, 14, 7, 0).unwrap();
        assert!(db.record_activity(&record(minute, 61)).is_err());
        assert_eq!(db.total_active_seconds(0, i64::MAX).unwrap(), 0);
    }

    #[test]
    fn totals_and_pruning() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap();
        for (offset, secs) in [(0, 10), (60, 20), (120, 30)] {
            let minute = base + chrono::Duration::seconds(offset);
            db.record_activity(&record(minute, secs)).unwrap();
        }

        let start = base.timestamp();
        assert_eq!(db.total_active_seconds(start, start + 180).unwrap(), 60);
        assert_eq!(db.total_active_seconds(start + 60, start + 120).unwrap(), 20);

        assert_eq!(db.prune_before(start + 60).unwrap(), 1);
        let remaining = db.load_activity(start, start + 180).unwrap();
        assert_eq!(
            remaining.iter().map(|r| r.active_seconds).collect::<Vec<_>>(),
            vec![20, 30]
        );
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.tracking_enabled().unwrap());
        assert_eq!(db.history_days().unwrap(), DEFAULT_HISTORY_DAYS);

        db.set_setting(ENABLE_TRACKING_SETTING, "0").unwrap();
        db.set_setting(HISTORY_DAYS_SETTING, "7").unwrap();
        assert!(!db.tracking_enabled().unwrap());
        assert_eq!(db.history_days().unwrap(), 7);

        db.set_setting(ENABLE_TRACKING_SETTING, "maybe").unwrap();
        assert!(db.tracking_enabled().is_err());
    }
}
