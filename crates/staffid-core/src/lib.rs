//! staffid-core: face enrollment and identification engine.
//!
//! SCRFD locates the face, ArcFace embeds it (both via ONNX Runtime), and a
//! small persisted gallery of reference embeddings is searched by cosine
//! similarity.

pub mod alignment;
pub mod detector;
pub mod enrollment;
pub mod frame;
pub mod gallery;
pub mod pipeline;
pub mod recognition;
pub mod recognizer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use enrollment::{AggregationPolicy, EnrollError, EnrollOutcome, EnrollmentService};
pub use frame::{FaceImage, RawImage};
pub use gallery::{Gallery, GalleryEntry, GalleryError, GalleryStore};
pub use pipeline::{Embedder, FaceEncoder, FaceLocator, FacePipeline, OnnxPipeline, PipelineError};
pub use recognition::{MatchPolicy, Recognition, RecognitionService, RecognizeError, EMPTY_GALLERY_SCORE};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, EmbeddingError};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Directory searched for the ONNX models when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

/// Gallery file location when none is configured:
/// `$XDG_DATA_HOME/staffid/embeddings.json`, falling back to `~/.local/share`.
pub fn default_gallery_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("staffid")
        .join("embeddings.json")
}
