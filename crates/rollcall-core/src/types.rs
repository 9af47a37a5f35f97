use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the bundled encoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings. Lower = more similar.
    ///
    /// Embeddings of different dimension are never comparable and yield
    /// `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A reference identity with its precomputed embedding.
///
/// Immutable once loaded; the gallery replaces the whole collection on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub reference_image_uri: String,
}

/// Result of matching a candidate embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance of the nearest gallery entry (`None` for an empty gallery).
    pub distance: Option<f32>,
    /// Snapshot index of the matched identity (if any).
    pub index: Option<usize>,
    /// ID of the matched identity (if any).
    pub identity_id: Option<String>,
}

impl MatchResult {
    pub fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            index: None,
            identity_id: None,
        }
    }
}

/// Strategy for comparing a candidate embedding against a gallery of known identities.
pub trait Matcher {
    fn compare(&self, candidate: &Embedding, gallery: &[KnownIdentity], tolerance: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Scans every gallery entry and keeps the global minimum. Ties keep the
/// first entry in snapshot order. A match requires `distance < tolerance`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, candidate: &Embedding, gallery: &[KnownIdentity], tolerance: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let dist = candidate.euclidean_distance(&identity.embedding);
            // NaN never compares less, so malformed embeddings are skipped.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < tolerance => MatchResult {
                matched: true,
                distance: Some(best_dist),
                index: Some(idx),
                identity_id: Some(gallery[idx].id.clone()),
            },
            Some(_) => MatchResult::no_match(Some(best_dist)),
            None => MatchResult::no_match(None),
        }
    }
}
