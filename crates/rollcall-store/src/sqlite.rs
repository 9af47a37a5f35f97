//! SQLite-backed reference set and attendance records.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, NaiveDate};
use rollcall_core::{
    AttendanceRecord, AttendanceStore, BackendError, ReferenceEntry, ReferenceSource, SessionType,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::migrations::run_migrations;
use crate::StoreError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One attendance row joined with the student's name, for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub date: NaiveDate,
    pub session_type: SessionType,
    pub timestamp: DateTime<Local>,
}

/// Single-connection store; the connection is serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!(error = %e, "failed to enable WAL mode");
        }
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// All reference rows that carry an image, in stable enrollment order.
    pub fn reference_entries(&self) -> Result<Vec<ReferenceEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, image_url FROM students
             WHERE image_url IS NOT NULL AND image_url != ''
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReferenceEntry {
                id: row.get(0)?,
                name: row.get(1)?,
                image_uri: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn has_record(&self, student_id: &str, date: NaiveDate, session: SessionType) -> Result<bool, StoreError> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM attendance WHERE student_id = ?1 AND date = ?2 AND session_type = ?3 LIMIT 1",
                params![student_id, date.format(DATE_FORMAT).to_string(), session.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO attendance (id, student_id, session_type, date, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                record.identity_id,
                record.session_type.as_str(),
                record.date.format(DATE_FORMAT).to_string(),
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Attendance for one calendar date, oldest first.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.student_id, s.name, a.date, a.session_type, a.timestamp
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.date = ?1
             ORDER BY a.timestamp ASC",
        )?;
        let mut rows = stmt.query(params![date.format(DATE_FORMAT).to_string()])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }

    pub fn ping(&self) -> bool {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

fn row_to_entry(row: &Row) -> Result<AttendanceEntry, StoreError> {
    let date: String = row.get(3)?;
    let session: String = row.get(4)?;
    let timestamp: String = row.get(5)?;

    Ok(AttendanceEntry {
        id: row.get(0)?,
        student_id: row.get(1)?,
        student_name: row.get(2)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|e| StoreError::InvalidRow(format!("date '{date}': {e}")))?,
        session_type: session.parse().map_err(StoreError::InvalidRow)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| StoreError::InvalidRow(format!("timestamp '{timestamp}': {e}")))?
            .with_timezone(&Local),
    })
}

impl ReferenceSource for SqliteStore {
    fn fetch_identities(&self) -> Result<Vec<ReferenceEntry>, BackendError> {
        Ok(self.reference_entries()?)
    }

    fn is_connected(&self) -> bool {
        self.ping()
    }
}

impl AttendanceStore for SqliteStore {
    fn exists(&self, identity_id: &str, date: NaiveDate, session: SessionType) -> Result<bool, BackendError> {
        Ok(self.has_record(identity_id, date, session)?)
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
        Ok(self.insert_record(record)?)
    }

    fn is_connected(&self) -> bool {
        self.ping()
    }
}
