//! 128-dimensional face descriptor network via ONNX Runtime.
//!
//! Crops the detected face (with a small margin), resizes it to the network
//! input, and returns the raw descriptor. Descriptors are compared by
//! Euclidean distance; they are not re-normalized here.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 150;
/// Extra context around the detector box, as a fraction of box size per side.
const CROP_MARGIN: f32 = 0.15;
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("embedding inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the image")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face descriptor extractor.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the descriptor ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded face descriptor model"
        );

        Ok(Self { session })
    }

    /// Compute the descriptor for one detected face.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedderError> {
        let crop = crop_face(image, face).ok_or(EmbedderError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("descriptor output: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

/// Cut the face box (plus margin) out of the image, clamped to its bounds.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let margin_x = face.width * CROP_MARGIN;
    let margin_y = face.height * CROP_MARGIN;

    let x0 = (face.x - margin_x).max(0.0).floor() as u32;
    let y0 = (face.y - margin_y).max(0.0).floor() as u32;
    let x1 = ((face.x + face.width + margin_x).ceil().max(0.0) as u32).min(image.width());
    let y1 = ((face.y + face.height + margin_y).ceil().max(0.0) as u32).min(image.height());

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Resize a face crop into a NCHW tensor scaled to [0, 1].
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = EMBEDDER_INPUT_SIZE;
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}
