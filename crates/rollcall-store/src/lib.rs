//! rollcall-store: Persistence for the reference set and attendance records.
//!
//! SQLite holds both the `students` reference rows and the `attendance`
//! ledger; reference images are fetched by URI.

pub mod fetch;
mod migrations;
pub mod sqlite;

pub use fetch::UriImageFetcher;
pub use sqlite::{AttendanceEntry, SqliteStore};

use rollcall_core::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schema: {0}")]
    Schema(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        BackendError::Store(err.to_string())
    }
}
