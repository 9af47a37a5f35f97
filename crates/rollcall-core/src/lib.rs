//! rollcall-core: Face matching, reference gallery and attendance ledger.
//!
//! Face detection and description run through ONNX Runtime behind the
//! [`FaceEncoder`] trait; everything else here is storage-agnostic and
//! talks to persistence through the [`ReferenceSource`], [`ImageFetcher`]
//! and [`AttendanceStore`] traits.

pub mod dedup;
pub mod detector;
pub mod embedder;
pub mod embedding_store;
pub mod encoder;
pub mod ledger;
pub mod types;

pub use dedup::LastSeen;
pub use embedding_store::{EmbeddingStore, ImageFetcher, LoadError, ReferenceEntry, ReferenceSource};
pub use encoder::{DetectedFace, EncodeError, FaceEncoder, OnnxFaceEncoder};
pub use ledger::{AttendanceLedger, AttendanceRecord, AttendanceStore, MarkOutcome, SessionType};
pub use types::{BoundingBox, Embedding, EuclideanMatcher, KnownIdentity, MatchResult, Matcher};

use thiserror::Error;

/// Failure reported by an external collaborator (store, image fetch).
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("store: {0}")]
    Store(String),
    #[error("fetch {uri}: {reason}")]
    Fetch { uri: String, reason: String },
}
