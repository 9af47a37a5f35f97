//! Session-scoped attendance ledger.
//!
//! One record per `(identity, calendar date, session type)`. Deduplication is
//! a read-before-write check against the store; the check and the insert are
//! not atomic, so the ledger assumes a single active writer.

use crate::BackendError;
use chrono::{DateTime, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Hour (local time) at which the morning session ends.
pub const SESSION_BREAK_HOUR: u32 = 12;

/// Coarse daily period an attendance record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    BeforeBreak,
    EndOfDay,
}

impl SessionType {
    /// Hours `0..12` are `before_break`; 12 onwards is `end_of_day`.
    pub fn for_hour(hour: u32) -> Self {
        if hour < SESSION_BREAK_HOUR {
            Self::BeforeBreak
        } else {
            Self::EndOfDay
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeBreak => "before_break",
            Self::EndOfDay => "end_of_day",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before_break" => Ok(Self::BeforeBreak),
            "end_of_day" => Ok(Self::EndOfDay),
            other => Err(format!("unknown session type '{other}'")),
        }
    }
}

/// A persisted attendance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub date: NaiveDate,
    pub session_type: SessionType,
    pub timestamp: DateTime<Local>,
}

/// Persistent boundary the ledger reads and writes through.
pub trait AttendanceStore: Send + Sync {
    /// Whether a record already exists for the triple.
    fn exists(&self, identity_id: &str, date: NaiveDate, session: SessionType) -> Result<bool, BackendError>;

    fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;
}

/// Result of one `mark` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
    /// The store read or write failed. Not retried.
    Failed(String),
}

impl MarkOutcome {
    /// Operator-facing status line.
    pub fn status_message(&self) -> &'static str {
        match self {
            Self::Marked => "Marked",
            Self::AlreadyMarked => "Already marked",
            Self::Failed(_) => "Mark failed",
        }
    }
}

pub struct AttendanceLedger {
    store: Arc<dyn AttendanceStore>,
}

impl AttendanceLedger {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self { store }
    }

    /// Record attendance for `identity_id` in the current local session.
    pub fn mark(&self, identity_id: &str) -> MarkOutcome {
        self.mark_at(identity_id, Local::now())
    }

    /// Record attendance as of `now`.
    pub fn mark_at(&self, identity_id: &str, now: DateTime<Local>) -> MarkOutcome {
        let date = now.date_naive();
        let session = SessionType::for_hour(now.hour());

        match self.store.exists(identity_id, date, session) {
            Ok(true) => {
                tracing::info!(identity = identity_id, %date, %session, "attendance already marked");
                return MarkOutcome::AlreadyMarked;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(identity = identity_id, error = %e, "attendance lookup failed");
                return MarkOutcome::Failed(e.to_string());
            }
        }

        let record = AttendanceRecord {
            identity_id: identity_id.to_string(),
            date,
            session_type: session,
            timestamp: now,
        };

        match self.store.insert(&record) {
            Ok(()) => {
                tracing::info!(identity = identity_id, %date, %session, "attendance marked");
                MarkOutcome::Marked
            }
            Err(e) => {
                tracing::error!(identity = identity_id, error = %e, "attendance write failed");
                MarkOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<AttendanceRecord>>,
        fail_writes: bool,
    }

    impl AttendanceStore for MemoryStore {
        fn exists(&self, identity_id: &str, date: NaiveDate, session: SessionType) -> Result<bool, BackendError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.identity_id == identity_id && r.date == date && r.session_type == session))
        }

        fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError> {
            if self.fail_writes {
                return Err(BackendError::Store("disk full".into()));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 14, hour, minute, 0).single().unwrap()
    }

    #[test]
    fn test_session_boundary() {
        assert_eq!(SessionType::for_hour(0), SessionType::BeforeBreak);
        assert_eq!(SessionType::for_hour(11), SessionType::BeforeBreak);
        assert_eq!(SessionType::for_hour(12), SessionType::EndOfDay);
        assert_eq!(SessionType::for_hour(23), SessionType::EndOfDay);
    }

    #[test]
    fn test_session_type_string_forms() {
        assert_eq!(SessionType::BeforeBreak.to_string(), "before_break");
        assert_eq!("end_of_day".parse::<SessionType>(), Ok(SessionType::EndOfDay));
        assert!("lunch".parse::<SessionType>().is_err());
    }

    #[test]
    fn test_mark_twice_same_session_writes_once() {
        let store = Arc::new(MemoryStore::default());
        let ledger = AttendanceLedger::new(store.clone());

        assert_eq!(ledger.mark_at("s1", at(9, 0)), MarkOutcome::Marked);
        assert_eq!(ledger.mark_at("s1", at(11, 59)), MarkOutcome::AlreadyMarked);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_in_each_session_writes_two_records() {
        let store = Arc::new(MemoryStore::default());
        let ledger = AttendanceLedger::new(store.clone());

        assert_eq!(ledger.mark_at("s1", at(11, 0)), MarkOutcome::Marked);
        assert_eq!(ledger.mark_at("s1", at(12, 0)), MarkOutcome::Marked);

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_type, SessionType::BeforeBreak);
        assert_eq!(records[1].session_type, SessionType::EndOfDay);
    }

    #[test]
    fn test_mark_distinct_identities_independent() {
        let store = Arc::new(MemoryStore::default());
        let ledger = AttendanceLedger::new(store.clone());

        assert_eq!(ledger.mark_at("s1", at(9, 0)), MarkOutcome::Marked);
        assert_eq!(ledger.mark_at("s2", at(9, 0)), MarkOutcome::Marked);
    }

    #[test]
    fn test_write_failure_reports_failed() {
        let store = Arc::new(MemoryStore { fail_writes: true, ..Default::default() });
        let ledger = AttendanceLedger::new(store.clone());

        let outcome = ledger.mark_at("s1", at(9, 0));
        assert!(matches!(outcome, MarkOutcome::Failed(_)));
        assert_eq!(outcome.status_message(), "Mark failed");
        assert!(store.records.lock().unwrap().is_empty());
    }
}
