//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional, L2-normalized face embeddings from 112×112
//! aligned RGB crops using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::FaceImage;
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download w600k_r50.onnx from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract a unit-length embedding for a detected face.
    pub fn extract(&mut self, image: &FaceImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, face);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        into_unit_embedding(raw.to_vec())
    }
}

/// Validate the raw output and L2-normalize it.
fn into_unit_embedding(raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed("embedding contains non-finite values".into()));
    }

    let embedding = Embedding::new(raw);
    if embedding.norm() == 0.0 {
        return Err(RecognizerError::InferenceFailed("embedding has zero norm".into()));
    }
    Ok(embedding.normalized())
}

/// Packed 112×112 RGB crop → normalized NCHW tensor.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (i, rgb) in aligned.chunks_exact(3).take(size * size).enumerate() {
        let (y, x) = (i / size, i % size);
        for c in 0..3 {
            tensor[[0, c, y, x]] = (rgb[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}
