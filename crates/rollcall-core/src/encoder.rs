//! Face detection + encoding boundary.
//!
//! The recognition loop and the gallery only see [`FaceEncoder`]; the ONNX
//! pipeline below is the production implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// Detector model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_500m.onnx";
/// Descriptor model file name inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "face_128d.onnx";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// One face found in an image, with its descriptor.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub location: BoundingBox,
    pub embedding: Embedding,
}

/// Detect every face in an image and compute one embedding per face.
///
/// Results are ordered by detection confidence, highest first. An image with
/// no faces yields an empty vector, not an error.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncodeError>;
}

/// SCRFD detection followed by the 128-d descriptor network.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxFaceEncoder {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, EncodeError> {
        let detector_path = model_dir.join(DETECTOR_MODEL_FILE);
        let embedder_path = model_dir.join(EMBEDDER_MODEL_FILE);

        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let embedder = FaceEmbedder::load(&embedder_path.to_string_lossy())?;

        Ok(Self { detector, embedder })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncodeError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for location in boxes {
            match self.embedder.extract(image, &location) {
                Ok(embedding) => faces.push(DetectedFace { location, embedding }),
                // Boxes hanging fully off-frame are dropped, not fatal.
                Err(EmbedderError::EmptyCrop) => {
                    tracing::debug!(?location, "skipping face with empty crop");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}
