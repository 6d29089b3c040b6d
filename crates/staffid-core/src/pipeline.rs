//! Capability seams between the matching core and the models.
//!
//! [`FaceLocator`] and [`Embedder`] are the two model capabilities;
//! [`FaceEncoder`] is what enrollment and recognition consume. Model handles
//! are not reentrant, so every method takes `&mut self`.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::{FaceImage, RawImage};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Locate the face to use in an image, or report none found.
pub trait FaceLocator {
    fn locate(&mut self, image: &FaceImage) -> Result<Option<BoundingBox>, PipelineError>;
}

/// Map a located face to a fixed-length unit vector.
pub trait Embedder {
    fn embed(&mut self, image: &FaceImage, face: &BoundingBox) -> Result<Embedding, PipelineError>;
}

/// Turn an uploaded image into a face embedding, `None` when no face is found.
pub trait FaceEncoder {
    fn encode(&mut self, image: &RawImage) -> Result<Option<Embedding>, PipelineError>;
}

impl FaceLocator for FaceDetector {
    fn locate(&mut self, image: &FaceImage) -> Result<Option<BoundingBox>, PipelineError> {
        // Sorted by confidence; only one face per image is considered.
        Ok(self.detect(image)?.into_iter().next())
    }
}

impl Embedder for FaceRecognizer {
    fn embed(&mut self, image: &FaceImage, face: &BoundingBox) -> Result<Embedding, PipelineError> {
        Ok(self.extract(image, face)?)
    }
}

/// Decode → locate → embed.
pub struct FacePipeline<L, E> {
    locator: L,
    embedder: E,
}

/// The production pipeline: SCRFD detection and ArcFace embedding.
pub type OnnxPipeline = FacePipeline<FaceDetector, FaceRecognizer>;

impl<L: FaceLocator, E: Embedder> FacePipeline<L, E> {
    pub fn new(locator: L, embedder: E) -> Self {
        Self { locator, embedder }
    }
}

impl OnnxPipeline {
    /// Load both ONNX models.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl<L: FaceLocator, E: Embedder> FaceEncoder for FacePipeline<L, E> {
    fn encode(&mut self, raw: &RawImage) -> Result<Option<Embedding>, PipelineError> {
        let image = FaceImage::decode(&raw.bytes)?;
        tracing::debug!(
            image = %raw.name,
            width = image.width,
            height = image.height,
            brightness = image.avg_brightness(),
            "decoded image"
        );

        let Some(face) = self.locator.locate(&image)? else {
            tracing::debug!(image = %raw.name, "no face located");
            return Ok(None);
        };
        tracing::debug!(image = %raw.name, confidence = face.confidence, "face located");

        let embedding = self.embedder.embed(&image, &face)?;
        Ok(Some(embedding))
    }
}

impl<T: FaceEncoder + ?Sized> FaceEncoder for Box<T> {
    fn encode(&mut self, image: &RawImage) -> Result<Option<Embedding>, PipelineError> {
        (**self).encode(image)
    }
}
