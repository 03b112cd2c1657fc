//! Fused multi-metric similarity between feature vectors, and gallery
//! identification on top of it.

use crate::config::FusionWeights;
use crate::types::{FeatureVector, SimilarityResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fused score at or above which two signatures are taken to match.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

const NORM_EPSILON: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("feature vectors have different lengths ({left} vs {right})")]
    DimensionMismatch { left: usize, right: usize },
    #[error("invalid fusion weights: {0}")]
    InvalidWeights(String),
}

/// A stored signature with the identifier of the subject it was enrolled for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledSignature {
    #[serde(alias = "student_id")]
    pub subject_id: String,
    #[serde(alias = "feature_vector")]
    pub features: FeatureVector,
}

/// Best gallery entry for a probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryMatch {
    pub subject_id: String,
    pub result: SimilarityResult,
}

/// Compares feature vectors with cosine, Euclidean, Pearson and Manhattan
/// measures fused into a single score.
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    weights: FusionWeights,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
        }
    }
}

impl SimilarityScorer {
    pub fn new(weights: FusionWeights) -> Result<Self, SimilarityError> {
        for (name, w) in [
            ("cosine", weights.cosine),
            ("euclidean", weights.euclidean),
            ("correlation", weights.correlation),
            ("manhattan", weights.manhattan),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(SimilarityError::InvalidWeights(format!(
                    "{name} weight must be finite and non-negative, got {w}"
                )));
            }
        }
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    /// Score two vectors of equal length.
    ///
    /// Vectors of different lengths are rejected, never padded or truncated.
    pub fn compare(
        &self,
        a: &[f32],
        b: &[f32],
        threshold: f64,
    ) -> Result<SimilarityResult, SimilarityError> {
        if a.len() != b.len() {
            return Err(SimilarityError::DimensionMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        let a: Vec<f64> = a.iter().map(|&v| sanitize(v)).collect();
        let b: Vec<f64> = b.iter().map(|&v| sanitize(v)).collect();

        let cosine = cosine_similarity(&a, &b);
        let euclidean_distance = a
            .iter()
            .zip(&b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt();
        let manhattan_distance = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum::<f64>();
        let correlation = pearson(&a, &b);

        let euclidean_similarity = 1.0 / (1.0 + euclidean_distance);
        let manhattan_similarity = 1.0 / (1.0 + manhattan_distance);

        let w = &self.weights;
        let fused = w.cosine * cosine
            + w.euclidean * euclidean_similarity
            + w.correlation * (correlation + 1.0) / 2.0
            + w.manhattan * manhattan_similarity;
        let similarity_score = if fused.is_nan() { 0.0 } else { fused.clamp(0.0, 1.0) };

        Ok(SimilarityResult {
            is_match: similarity_score >= threshold,
            similarity_score,
            cosine,
            euclidean_similarity,
            correlation,
            manhattan_similarity,
            euclidean_distance,
            manhattan_distance,
            threshold,
        })
    }

    /// Score `probe` against every gallery entry and return the best one
    /// that reaches `threshold`.
    ///
    /// Every entry is scored, with no early exit, so the time taken does
    /// not reveal where in the gallery a match sits. Entries whose length
    /// differs from the probe are skipped. Ties keep the earliest entry.
    pub fn identify(
        &self,
        probe: &[f32],
        gallery: &[EnrolledSignature],
        threshold: f64,
    ) -> Option<GalleryMatch> {
        let mut best: Option<(usize, SimilarityResult)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let result = match self.compare(probe, entry.features.as_slice(), threshold) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(subject_id = %entry.subject_id, error = %e, "skipping gallery entry");
                    continue;
                }
            };
            let better = best
                .as_ref()
                .map_or(true, |(_, b)| result.similarity_score > b.similarity_score);
            if better {
                best = Some((i, result));
            }
        }

        match best {
            Some((idx, result)) if result.is_match => Some(GalleryMatch {
                subject_id: gallery[idx].subject_id.clone(),
                result,
            }),
            Some((idx, result)) => {
                tracing::debug!(
                    closest = %gallery[idx].subject_id,
                    score = result.similarity_score,
                    threshold,
                    "no gallery entry reached the threshold"
                );
                None
            }
            None => None,
        }
    }
}

fn sanitize(v: f32) -> f64 {
    if v.is_nan() {
        0.0
    } else if v == f32::INFINITY {
        f32::MAX as f64
    } else if v == f32::NEG_INFINITY {
        f32::MIN as f64
    } else {
        v as f64
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let (norm_a, norm_b) = (norm_a.sqrt(), norm_b.sqrt());
    if norm_a > NORM_EPSILON && norm_b > NORM_EPSILON {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Pearson correlation coefficient; 0 when undefined.
fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let r = cov / (var_a * var_b).sqrt();
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
