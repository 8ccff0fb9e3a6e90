//! SQLite persistence for geowake-daemon.
//!
//! Two small tables: a flat key/value namespace holding the tracking session
//! fields, and a timer queue keyed by fixed slot ids. Every write is a single
//! statement on its own connection, so it is durable before returning and no
//! write spans more than one session field.

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRow {
    pub slot: i64,
    pub kind: String,
    pub trigger_at_ms: i64,
    pub precision: String,
    pub payload: Option<String>,
    pub armed_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM session_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| format!("Failed to read {}: {}", key, err))
        })
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<(), String> {
        let updated_at = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO session_kv (key, value, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET \
                    value = excluded.value, \
                    updated_at = excluded.updated_at",
                params![key, value, updated_at],
            )
            .map_err(|err| format!("Failed to write {}: {}", key, err))?;
            Ok(())
        })
    }

    pub fn remove_value(&self, key: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM session_kv WHERE key = ?1", params![key])
                .map_err(|err| format!("Failed to remove {}: {}", key, err))?;
            Ok(())
        })
    }

    pub fn upsert_timer(&self, timer: &TimerRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO timers (slot, kind, trigger_at_ms, precision, payload, armed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(slot) DO UPDATE SET \
                    kind = excluded.kind, \
                    trigger_at_ms = excluded.trigger_at_ms, \
                    precision = excluded.precision, \
                    payload = excluded.payload, \
                    armed_at = excluded.armed_at",
                params![
                    timer.slot,
                    timer.kind,
                    timer.trigger_at_ms,
                    timer.precision,
                    timer.payload,
                    timer.armed_at
                ],
            )
            .map_err(|err| format!("Failed to arm timer {}: {}", timer.slot, err))?;
            Ok(())
        })
    }

    pub fn get_timer(&self, slot: i64) -> Result<Option<TimerRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT slot, kind, trigger_at_ms, precision, payload, armed_at \
                 FROM timers WHERE slot = ?1",
                params![slot],
                timer_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query timer {}: {}", slot, err))
        })
    }

    pub fn list_timers(&self) -> Result<Vec<TimerRow>, String> {
        self.query_timers(
            "SELECT slot, kind, trigger_at_ms, precision, payload, armed_at \
             FROM timers ORDER BY trigger_at_ms ASC, slot ASC",
            None,
        )
    }

    pub fn due_timers(&self, now_ms: i64) -> Result<Vec<TimerRow>, String> {
        self.query_timers(
            "SELECT slot, kind, trigger_at_ms, precision, payload, armed_at \
             FROM timers WHERE trigger_at_ms <= ?1 ORDER BY trigger_at_ms ASC, slot ASC",
            Some(now_ms),
        )
    }

    pub fn delete_timer(&self, slot: i64) -> Result<bool, String> {
        self.with_connection(|conn| {
            let removed = conn
                .execute("DELETE FROM timers WHERE slot = ?1", params![slot])
                .map_err(|err| format!("Failed to cancel timer {}: {}", slot, err))?;
            Ok(removed > 0)
        })
    }

    /// Removes a delivered timer unless it was re-armed while firing.
    pub fn delete_fired_timer(&self, timer: &TimerRow) -> Result<bool, String> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM timers \
                     WHERE slot = ?1 AND trigger_at_ms = ?2 AND armed_at = ?3",
                    params![timer.slot, timer.trigger_at_ms, timer.armed_at],
                )
                .map_err(|err| format!("Failed to retire timer {}: {}", timer.slot, err))?;
            Ok(removed > 0)
        })
    }

    fn query_timers(&self, sql: &str, bound: Option<i64>) -> Result<Vec<TimerRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| format!("Failed to prepare timers query: {}", err))?;

            let rows = match bound {
                Some(value) => stmt.query_map(params![value], timer_from_row),
                None => stmt.query_map([], timer_from_row),
            }
            .map_err(|err| format!("Failed to query timers: {}", err))?;

            let mut timers = Vec::new();
            for row in rows {
                timers.push(row.map_err(|err| format!("Failed to decode timer row: {}", err))?);
            }
            Ok(timers)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS session_kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS timers (
                    slot INTEGER PRIMARY KEY,
                    kind TEXT NOT NULL,
                    trigger_at_ms INTEGER NOT NULL,
                    precision TEXT NOT NULL,
                    payload TEXT,
                    armed_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn timer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimerRow> {
    Ok(TimerRow {
        slot: row.get(0)?,
        kind: row.get(1)?,
        trigger_at_ms: row.get(2)?,
        precision: row.get(3)?,
        payload: row.get(4)?,
        armed_at: row.get(5)?,
    })
}
