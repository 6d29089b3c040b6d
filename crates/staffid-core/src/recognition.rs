//! Recognition: best-match search of a probe against the gallery.

use crate::frame::RawImage;
use crate::gallery::{Gallery, GalleryStore};
use crate::pipeline::{FaceEncoder, PipelineError};
use crate::types::Embedding;
use std::sync::Arc;
use thiserror::Error;

/// Minimum similarity accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;
/// Decimal places kept in a reported match score.
pub const DEFAULT_SCORE_DECIMALS: u32 = 2;
/// Score reported for an unknown face when the gallery was empty.
pub const EMPTY_GALLERY_SCORE: f32 = -1.0;

/// Decision parameters. Rounding only affects the reported score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub threshold: f32,
    pub score_decimals: u32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            score_decimals: DEFAULT_SCORE_DECIMALS,
        }
    }
}

impl MatchPolicy {
    /// Round a score for display.
    pub fn round_score(&self, score: f32) -> f32 {
        let factor = 10f64.powi(self.score_decimals.min(9) as i32);
        ((score as f64 * factor).round() / factor) as f32
    }
}

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("processing image {image} failed: {source}")]
    Encode {
        image: String,
        #[source]
        source: PipelineError,
    },
    #[error("probe embedding has dimension {actual}, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Outcome of one recognition call. None of these are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    /// The probe image contained no detectable face.
    NoFace,
    /// Best similarity fell below the threshold. `score` is the unrounded best
    /// similarity, `None` when the gallery is empty.
    Unknown { score: Option<f32> },
    /// Match with the score rounded for display.
    Match { identity: String, score: f32 },
}

impl Recognition {
    /// Score to report to a caller, if any. An empty gallery reports
    /// [`EMPTY_GALLERY_SCORE`].
    pub fn reported_score(&self) -> Option<f32> {
        match self {
            Recognition::NoFace => None,
            Recognition::Unknown { score } => Some(score.unwrap_or(EMPTY_GALLERY_SCORE)),
            Recognition::Match { score, .. } => Some(*score),
        }
    }
}

/// Highest-scoring gallery entry for a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch<'a> {
    pub identity: Option<&'a str>,
    pub score: f32,
}

/// Linear scan in gallery order. A strictly greater score is required to
/// replace the running best, so ties keep the first entry seen.
///
/// Starts from `f32::NEG_INFINITY`, below any cosine similarity.
pub fn best_match<'a>(probe: &Embedding, gallery: &'a Gallery) -> BestMatch<'a> {
    let mut best = BestMatch {
        identity: None,
        score: f32::NEG_INFINITY,
    };
    for entry in gallery.entries() {
        let score = entry.embedding.dot(probe);
        if score > best.score {
            best = BestMatch {
                identity: Some(entry.identity),
                score,
            };
        }
    }
    best
}

pub struct RecognitionService {
    store: Arc<GalleryStore>,
    policy: MatchPolicy,
}

impl RecognitionService {
    pub fn new(store: Arc<GalleryStore>, policy: MatchPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Identify the face in `image` against the current gallery snapshot.
    pub fn recognize<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
        image: &RawImage,
    ) -> Result<Recognition, RecognizeError> {
        let probe = encoder.encode(image).map_err(|source| RecognizeError::Encode {
            image: image.name.clone(),
            source,
        })?;

        let Some(probe) = probe else {
            tracing::info!(image = %image.name, "recognize: no face detected");
            return Ok(Recognition::NoFace);
        };

        let gallery = self.store.snapshot();
        let result = self.decide(&probe, &gallery)?;
        match &result {
            Recognition::Match { identity, score } => {
                tracing::info!(staff_id = %identity, score, "recognize: match");
            }
            Recognition::Unknown { score } => {
                tracing::info!(?score, gallery = gallery.len(), "recognize: unknown face");
            }
            Recognition::NoFace => {}
        }
        Ok(result)
    }

    /// Score `probe` against `gallery` and apply the threshold.
    pub fn decide(&self, probe: &Embedding, gallery: &Gallery) -> Result<Recognition, RecognizeError> {
        if let Some(expected) = gallery.dim() {
            if expected != probe.dim() {
                return Err(RecognizeError::DimensionMismatch {
                    expected,
                    actual: probe.dim(),
                });
            }
        }

        let best = best_match(probe, gallery);
        match best.identity {
            Some(identity) if best.score >= self.policy.threshold => Ok(Recognition::Match {
                identity: identity.to_string(),
                score: self.policy.round_score(best.score),
            }),
            Some(_) => Ok(Recognition::Unknown {
                score: Some(best.score),
            }),
            None => Ok(Recognition::Unknown { score: None }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{AggregationPolicy, EnrollmentService};
    use crate::testing::{broken, face, no_face, ScriptedEncoder};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery<const N: usize>(entries: &[(&str, [f32; N])]) -> Gallery {
        let mut g = Gallery::new();
        for (id, values) in entries {
            g.put(id, emb(values)).unwrap();
        }
        g
    }

    fn service() -> (tempfile::TempDir, Arc<GalleryStore>, RecognitionService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GalleryStore::open(dir.path().join("embeddings.json")).unwrap());
        let svc = RecognitionService::new(Arc::clone(&store), MatchPolicy::default());
        (dir, store, svc)
    }

    #[test]
    fn test_best_match_scans_all_entries() {
        let g = gallery(&[("a", [0.0, 1.0, 0.0]), ("b", [0.0, 0.0, 1.0]), ("c", [1.0, 0.0, 0.0])]);
        let best = best_match(&emb(&[1.0, 0.0, 0.0]), &g);
        assert_eq!(best.identity, Some("c"));
        assert!((best.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_match_tie_keeps_first_in_order() {
        // Inserted out of order; scan order is by identity.
        let g = gallery(&[("zed", [1.0, 0.0]), ("amy", [1.0, 0.0])]);
        let best = best_match(&emb(&[1.0, 0.0]), &g);
        assert_eq!(best.identity, Some("amy"));
    }

    #[test]
    fn test_best_match_empty_gallery() {
        let g = Gallery::new();
        let best = best_match(&emb(&[1.0, 0.0]), &g);
        assert_eq!(best.identity, None);
        assert_eq!(best.score, f32::NEG_INFINITY);
    }

    #[test]
    fn test_decide_match_rounds_score() {
        let (_dir, _store, svc) = service();
        let g = gallery(&[("s-001", [0.6, 0.8])]);
        let probe = emb(&[0.8, 0.6]); // dot = 0.96
        assert_eq!(
            svc.decide(&probe, &g).unwrap(),
            Recognition::Match { identity: "s-001".into(), score: 0.96 }
        );

        let probe = emb(&[0.7071, 0.7071]); // dot = 0.98994
        match svc.decide(&probe, &g).unwrap() {
            Recognition::Match { score, .. } => assert_eq!(score, 0.99),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_unknown_reports_unrounded_score() {
        let (_dir, _store, svc) = service();
        let g = gallery(&[("s-001", [1.0, 0.0])]);
        let probe = emb(&[0.4444, (1.0f32 - 0.4444 * 0.4444).sqrt()]);
        assert_eq!(
            svc.decide(&probe, &g).unwrap(),
            Recognition::Unknown { score: Some(0.4444) }
        );
    }

    #[test]
    fn test_rounding_does_not_affect_threshold() {
        // 0.4496 would display as 0.45 but is below the threshold.
        let (_dir, _store, svc) = service();
        let g = gallery(&[("s-001", [1.0, 0.0])]);
        let probe = emb(&[0.4496, 0.0]);
        assert_eq!(
            svc.decide(&probe, &g).unwrap(),
            Recognition::Unknown { score: Some(0.4496) }
        );
    }

    #[test]
    fn test_exact_threshold_is_accepted() {
        // `best < threshold` rejects; a score equal to the threshold is a match.
        let (_dir, _store, svc) = service();
        let g = gallery(&[("s-001", [1.0, 0.0])]);
        let probe = emb(&[DEFAULT_MATCH_THRESHOLD, (1.0f32 - 0.45 * 0.45).sqrt()]);
        assert_eq!(best_match(&probe, &g).score, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(
            svc.decide(&probe, &g).unwrap(),
            Recognition::Match { identity: "s-001".into(), score: 0.45 }
        );

        let just_below = emb(&[f32::from_bits(DEFAULT_MATCH_THRESHOLD.to_bits() - 1), 0.0]);
        assert!(matches!(svc.decide(&just_below, &g).unwrap(), Recognition::Unknown { .. }));
    }

    #[test]
    fn test_decide_empty_gallery_is_unknown() {
        let (_dir, _store, svc) = service();
        assert_eq!(
            svc.decide(&emb(&[1.0, 0.0]), &Gallery::new()).unwrap(),
            Recognition::Unknown { score: None }
        );
    }

    #[test]
    fn test_reported_score() {
        assert_eq!(Recognition::Unknown { score: None }.reported_score(), Some(EMPTY_GALLERY_SCORE));
        assert_eq!(Recognition::Unknown { score: Some(0.3) }.reported_score(), Some(0.3));
        assert_eq!(
            Recognition::Match { identity: "s-001".into(), score: 0.91 }.reported_score(),
            Some(0.91)
        );
        assert_eq!(Recognition::NoFace.reported_score(), None);
    }

    #[test]
    fn test_decide_dimension_mismatch() {
        let (_dir, _store, svc) = service();
        let g = gallery(&[("s-001", [1.0, 0.0])]);
        assert!(matches!(
            svc.decide(&emb(&[1.0, 0.0, 0.0]), &g),
            Err(RecognizeError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_decide_is_deterministic() {
        let (_dir, _store, svc) = service();
        let g = gallery(&[("a", [0.6, 0.8]), ("b", [0.8, 0.6]), ("c", [0.0, 1.0])]);
        let probe = emb(&[0.28, 0.96]);
        let first = svc.decide(&probe, &g).unwrap();
        let second = svc.decide(&probe, &g).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_recognize_no_face() {
        let (_dir, store, svc) = service();
        store.put("s-001", emb(&[1.0, 0.0])).unwrap();
        let mut enc = ScriptedEncoder::default();
        assert_eq!(svc.recognize(&mut enc, &no_face("probe.jpg")).unwrap(), Recognition::NoFace);
    }

    #[test]
    fn test_recognize_empty_gallery_any_probe() {
        let (_dir, _store, svc) = service();
        let mut enc = ScriptedEncoder::default();
        for probe in [face("p.jpg", &[1.0, 0.0]), face("q.jpg", &[-1.0, 0.0]), no_face("r.jpg")] {
            let result = svc.recognize(&mut enc, &probe).unwrap();
            assert!(!matches!(result, Recognition::Match { .. }));
        }
    }

    #[test]
    fn test_recognize_encode_failure() {
        let (_dir, _store, svc) = service();
        let mut enc = ScriptedEncoder::default();
        assert!(matches!(
            svc.recognize(&mut enc, &broken("x.bin")),
            Err(RecognizeError::Encode { image, .. }) if image == "x.bin"
        ));
    }

    #[test]
    fn test_enroll_then_recognize_reference_image() {
        let (_dir, store, svc) = service();
        let enrollment = EnrollmentService::new(Arc::clone(&store), AggregationPolicy::Renormalize);
        let mut enc = ScriptedEncoder::default();

        let refs = [face("a.jpg", &[0.6, 0.8, 0.0]), face("b.jpg", &[0.8, 0.6, 0.0])];
        enrollment.enroll(&mut enc, "s-042", &refs).unwrap();
        enrollment.enroll(&mut enc, "s-007", &[face("c.jpg", &[0.0, 0.0, 1.0])]).unwrap();

        for probe in &refs {
            match svc.recognize(&mut enc, probe).unwrap() {
                Recognition::Match { identity, score } => {
                    assert_eq!(identity, "s-042");
                    assert!(score >= DEFAULT_MATCH_THRESHOLD);
                }
                other => panic!("expected match, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_recognize_sees_latest_enrollment() {
        let (_dir, store, svc) = service();
        let mut enc = ScriptedEncoder::default();
        let probe = face("p.jpg", &[0.0, 1.0]);

        assert_eq!(svc.recognize(&mut enc, &probe).unwrap(), Recognition::Unknown { score: None });
        store.put("s-001", emb(&[0.0, 1.0])).unwrap();
        assert_eq!(
            svc.recognize(&mut enc, &probe).unwrap(),
            Recognition::Match { identity: "s-001".into(), score: 1.0 }
        );
    }

    #[test]
    fn test_round_score() {
        let policy = MatchPolicy::default();
        assert_eq!(policy.round_score(0.456), 0.46);
        assert_eq!(policy.round_score(0.454), 0.45);
        assert_eq!(policy.round_score(1.0), 1.0);
        let three = MatchPolicy { score_decimals: 3, ..policy };
        assert_eq!(three.round_score(0.45678), 0.457);
    }
}
