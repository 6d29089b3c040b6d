use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed deviation of an embedding's L2 norm from 1.0.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot aggregate an empty set of embeddings")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Serialized as a bare JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
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

    /// L2 norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// True when the norm is within [`UNIT_NORM_TOLERANCE`] of 1.0.
    pub fn is_unit(&self) -> bool {
        (self.norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Dot product. Equals cosine similarity when both sides are unit length.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine similarity in [-1, 1], independent of either vector's scale.
    ///
    /// Returns 0.0 when either side is the zero vector.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let denom = self.norm() * other.norm();
        if denom > 0.0 {
            self.dot(other) / denom
        } else {
            0.0
        }
    }

    /// Scale to unit length. The zero vector is returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }

    /// Component-wise arithmetic mean. All inputs must share one dimension.
    pub fn mean(embeddings: &[Embedding]) -> Result<Embedding, EmbeddingError> {
        let first = embeddings.first().ok_or(EmbeddingError::Empty)?;
        let dim = first.dim();

        let mut sum = vec![0.0f32; dim];
        for emb in embeddings {
            if emb.dim() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: emb.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&emb.values) {
                *acc += v;
            }
        }

        let count = embeddings.len() as f32;
        Ok(Embedding::new(sum.into_iter().map(|v| v / count).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_unit_vectors() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![0.6, 0.8, 0.0]);
        assert!((a.dot(&b) - 0.6).abs() < 1e-6);
        assert_eq!(a.dot(&b), b.dot(&a));
    }

    #[test]
    fn test_similarity_ignores_scale() {
        let a = Embedding::new(vec![2.0, 0.0]);
        let b = Embedding::new(vec![3.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!((a.dot(&b) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_is_unit() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!(e.is_unit());
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector_unchanged() {
        let e = Embedding::new(vec![0.0, 0.0]).normalized();
        assert_eq!(e.values, vec![0.0, 0.0]);
        assert!(!e.is_unit());
    }

    #[test]
    fn test_mean_of_unit_vectors_is_not_unit() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let m = Embedding::mean(&[a, b]).unwrap();
        assert_eq!(m.values, vec![0.5, 0.5]);
        assert!((m.norm() - 0.5f32.sqrt()).abs() < 1e-6);
        assert!(!m.is_unit());
    }

    #[test]
    fn test_mean_single_is_identity() {
        let a = Embedding::new(vec![0.6, 0.8]);
        assert_eq!(Embedding::mean(std::slice::from_ref(&a)).unwrap(), a);
    }

    #[test]
    fn test_mean_empty() {
        assert_eq!(Embedding::mean(&[]), Err(EmbeddingError::Empty));
    }

    #[test]
    fn test_mean_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(
            Embedding::mean(&[a, b]),
            Err(EmbeddingError::DimensionMismatch { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = Embedding::new(vec![0.5, -0.25]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.5,-0.25]");
        let back: Embedding = serde_json::from_str("[0.5,-0.25]").unwrap();
        assert_eq!(back, e);
    }
}
