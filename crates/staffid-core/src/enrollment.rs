//! Enrollment: many reference photos → one stored reference embedding.

use crate::frame::RawImage;
use crate::gallery::{GalleryError, GalleryStore};
use crate::pipeline::{FaceEncoder, PipelineError};
use crate::types::{Embedding, EmbeddingError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// How per-image embeddings are combined into the stored reference.
///
/// `Renormalize` rescales the mean to unit length so stored references
/// match probes and scores are true cosines. `RawMean` stores the mean
/// untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregationPolicy {
    #[default]
    Renormalize,
    RawMean,
}

impl AggregationPolicy {
    /// Combine embeddings under this policy.
    pub fn aggregate(self, embeddings: &[Embedding]) -> Result<Embedding, EmbeddingError> {
        let mean = Embedding::mean(embeddings)?;
        Ok(match self {
            AggregationPolicy::Renormalize => mean.normalized(),
            AggregationPolicy::RawMean => mean,
        })
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationPolicy::Renormalize => "renormalize",
            AggregationPolicy::RawMean => "raw-mean",
        })
    }
}

impl FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "renormalize" => Ok(AggregationPolicy::Renormalize),
            "raw-mean" | "raw_mean" | "mean" => Ok(AggregationPolicy::RawMean),
            other => Err(format!("unknown aggregation policy {other:?} (expected renormalize or raw-mean)")),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("staffId must not be empty")]
    EmptyIdentity,
    #[error("at least one image is required")]
    NoImages,
    #[error("No face detected in image: {image}")]
    NoFaceDetected { image: String },
    #[error("processing image {image} failed: {source}")]
    Encode {
        image: String,
        #[source]
        source: PipelineError,
    },
    #[error("embeddings could not be aggregated: {0}")]
    Aggregate(#[from] EmbeddingError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("enrollment cancelled before commit")]
    Cancelled,
}

impl EnrollError {
    /// True for rejections caused by the submitted images themselves.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EnrollError::EmptyIdentity | EnrollError::NoImages | EnrollError::NoFaceDetected { .. }
        )
    }
}

/// Result of a committed enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollOutcome {
    pub identity: String,
    pub images_used: usize,
    /// True when an earlier enrollment for the identity was overwritten.
    pub replaced: bool,
}

pub struct EnrollmentService {
    store: Arc<GalleryStore>,
    policy: AggregationPolicy,
}

impl EnrollmentService {
    pub fn new(store: Arc<GalleryStore>, policy: AggregationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Enroll `identity` from `images`, all or nothing.
    ///
    /// Every image must yield a face. The first image without one aborts the
    /// enrollment and the gallery is not touched.
    pub fn enroll<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
        identity: &str,
        images: &[RawImage],
    ) -> Result<EnrollOutcome, EnrollError> {
        self.enroll_unless(encoder, identity, images, || false)
    }

    /// [`enroll`](Self::enroll), abandoned with [`EnrollError::Cancelled`]
    /// once `cancelled` reports true.
    ///
    /// Polled before each image and once more before the gallery write, so a
    /// cancelled enrollment never reaches the store.
    pub fn enroll_unless<E, C>(
        &self,
        encoder: &mut E,
        identity: &str,
        images: &[RawImage],
        cancelled: C,
    ) -> Result<EnrollOutcome, EnrollError>
    where
        E: FaceEncoder + ?Sized,
        C: Fn() -> bool,
    {
        if identity.is_empty() {
            return Err(EnrollError::EmptyIdentity);
        }
        if images.is_empty() {
            return Err(EnrollError::NoImages);
        }

        let mut embeddings = Vec::with_capacity(images.len());
        for image in images {
            if cancelled() {
                return Err(EnrollError::Cancelled);
            }
            let embedding = encoder
                .encode(image)
                .map_err(|source| EnrollError::Encode {
                    image: image.name.clone(),
                    source,
                })?
                .ok_or_else(|| EnrollError::NoFaceDetected {
                    image: image.name.clone(),
                })?;
            embeddings.push(embedding);
        }

        let reference = self.policy.aggregate(&embeddings)?;
        if cancelled() {
            return Err(EnrollError::Cancelled);
        }
        let previous = self.store.put(identity, reference)?;

        tracing::info!(
            staff_id = identity,
            images = embeddings.len(),
            replaced = previous.is_some(),
            policy = %self.policy,
            "enrolled"
        );

        Ok(EnrollOutcome {
            identity: identity.to_string(),
            images_used: embeddings.len(),
            replaced: previous.is_some(),
        })
    }
}
