//! facesig-core: face localization, signature extraction and matching.
//!
//! An ensemble of classical Haar cascades locates the face, a hand-crafted
//! 470-value descriptor summarizes it, and four similarity measures are
//! fused into a single match score. No learned models are involved.

pub mod cascade;
pub mod config;
pub mod features;
pub mod imgproc;
pub mod localizer;
pub mod pipeline;
pub mod similarity;
pub mod types;

pub use cascade::{CascadeError, HaarCascade};
pub use config::{DetectionConfig, FusionWeights, ScoringConfig};
pub use features::{ExtractionError, FeatureExtractor, FEATURE_LENGTH};
pub use localizer::{CascadeSet, EnsembleLocalizer, FaceLocator};
pub use pipeline::{
    compare_signatures, ComparisonReport, FaceEncoder, FaceEncoding, ImageSource, LoadError,
    PipelineError, ProcessResponse, ThumbnailEncoder,
};
pub use similarity::{EnrolledSignature, GalleryMatch, SimilarityError, SimilarityScorer};
pub use types::{FaceRegion, FeatureVector, SimilarityResult};

/// Where distribution packages of OpenCV install the stock cascades.
pub const DEFAULT_CASCADE_DIR: &str = "/usr/share/opencv4/haarcascades";
