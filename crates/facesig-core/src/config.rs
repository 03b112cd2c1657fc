//! Tunable detection and scoring parameters.
//!
//! Defaults reproduce the reference behaviour; every field can be
//! overridden from a TOML table.

use serde::{Deserialize, Serialize};

/// Face localization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Scale factors swept with the primary frontal cascade.
    pub scale_factors: Vec<f64>,
    /// Neighbour thresholds swept for every scale factor.
    pub min_neighbors: Vec<u32>,
    /// Scale factor for the alternate, profile and enhanced-image passes.
    pub extra_scale_factor: f64,
    /// Neighbour threshold for the alternate, profile and enhanced-image passes.
    pub extra_min_neighbors: u32,
    pub min_face_size: u32,
    pub max_face_size: u32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    /// A candidate is a duplicate when its intersection with an accepted
    /// region exceeds this fraction of the smaller area.
    pub overlap_ratio: f64,
    /// Images with more merged faces than this are rejected.
    pub max_faces: usize,
    /// Padding added around the dominant face, as a fraction of its shorter side.
    pub padding_ratio: f64,
    /// Run independent detector sweeps on the rayon pool.
    pub parallel: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale_factors: vec![1.05, 1.10, 1.15, 1.20, 1.30],
            min_neighbors: vec![3, 4, 5, 6],
            extra_scale_factor: 1.10,
            extra_min_neighbors: 4,
            min_face_size: 20,
            max_face_size: 300,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            overlap_ratio: 0.30,
            max_faces: 5,
            padding_ratio: 0.10,
            parallel: true,
        }
    }
}

/// Weights of the four metrics in the fused similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub cosine: f64,
    pub euclidean: f64,
    pub correlation: f64,
    pub manhattan: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            cosine: 0.35,
            euclidean: 0.25,
            correlation: 0.25,
            manhattan: 0.15,
        }
    }
}

/// Similarity scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: FusionWeights,
    /// Fused score at or above which two signatures match.
    pub threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            threshold: crate::similarity::DEFAULT_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_defaults() {
        let c = DetectionConfig::default();
        assert_eq!(c.scale_factors.len() * c.min_neighbors.len(), 20);
        assert_eq!(c.overlap_ratio, 0.30);
        assert_eq!(c.max_faces, 5);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let c: DetectionConfig = serde_json::from_str(r#"{"overlap_ratio": 0.5}"#).unwrap();
        assert_eq!(c.overlap_ratio, 0.5);
        assert_eq!(c.max_face_size, 300);

        let s: ScoringConfig = serde_json::from_str(r#"{"weights": {"cosine": 0.5}}"#).unwrap();
        assert_eq!(s.weights.cosine, 0.5);
        assert_eq!(s.weights.manhattan, 0.15);
        assert_eq!(s.threshold, 0.6);
    }
}
