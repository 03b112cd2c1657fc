//! Request-level entry points: validate an image, encode its dominant face,
//! and compare two stored signatures.
//!
//! Image loading and thumbnail encoding are collaborators supplied by the
//! caller through [`ImageSource`] and [`ThumbnailEncoder`].

use crate::cascade::CascadeError;
use crate::config::DetectionConfig;
use crate::features::{self, ExtractionError, FeatureExtractor};
use crate::localizer::{self, CascadeSet, EnsembleLocalizer, FaceLocator};
use crate::similarity::{SimilarityScorer, DEFAULT_THRESHOLD};
use crate::types::{FaceRegion, FeatureVector, SimilarityResult};
use image::GrayImage;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Reported in every successful envelope.
pub const EXTRACTION_METHOD: &str = "HaarCascade_Enhanced_Features";

/// Why an image could not be loaded. The messages are shown to end users.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Image file not found")]
    FileNotFound,
    #[error("Image file is empty")]
    Empty,
    #[error("Unsupported format. Supported formats: jpg, jpeg, png, bmp")]
    UnsupportedFormat,
    #[error("Could not load image file")]
    Undecodable,
    #[error("Image is too small for face detection")]
    TooSmall,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Load(#[from] LoadError),
    #[error("No face detected in the image. Please ensure good lighting and face is clearly visible.")]
    NoFaceFound,
    #[error("Too many faces detected ({0}). Please upload an image with fewer faces")]
    TooManyFaces(usize),
    #[error("Error extracting face features: {0}")]
    Extraction(#[from] ExtractionError),
}

/// Decodes an image file into 8-bit grayscale.
pub trait ImageSource {
    fn load_gray(&self, path: &Path) -> Result<GrayImage, LoadError>;
}

/// Turns the canonical face crop into a display string (e.g. base64 PNG).
/// Returns `None` when encoding fails; the thumbnail is optional.
pub trait ThumbnailEncoder {
    fn encode(&self, face: &GrayImage) -> Option<String>;
}

/// Faces found by [`FaceEncoder::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub faces: Vec<FaceRegion>,
}

impl Validation {
    pub fn message(&self) -> String {
        format!("Image is valid - {} face(s) detected", self.faces.len())
    }
}

/// Signature of the dominant face in an image.
#[derive(Debug, Clone)]
pub struct FaceEncoding {
    pub features: FeatureVector,
    /// Dominant face region after padding.
    pub face_region: FaceRegion,
    pub total_faces_detected: usize,
    /// The face resampled to the canonical grid, before enhancement.
    pub face: GrayImage,
}

/// JSON envelope returned by [`FaceEncoder::process`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<ProcessData>,
}

impl ProcessResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessData {
    #[serde(rename = "student_id")]
    pub subject_id: String,
    pub feature_vector: FeatureVector,
    pub face_region: FaceRegion,
    pub features_length: usize,
    pub total_faces_detected: usize,
    pub face_image_base64: Option<String>,
    pub validation_message: String,
    pub extraction_method: String,
}

/// Localize → extract, with the face-count policy in between.
pub struct FaceEncoder<L = EnsembleLocalizer> {
    locator: L,
    extractor: FeatureExtractor,
    max_faces: usize,
    padding_ratio: f64,
}

impl FaceEncoder<EnsembleLocalizer> {
    /// Load the cascades from `cascade_dir` and build the standard encoder.
    pub fn from_cascade_dir(
        cascade_dir: impl AsRef<Path>,
        config: DetectionConfig,
    ) -> Result<Self, CascadeError> {
        let cascades = CascadeSet::load(cascade_dir.as_ref())?;
        tracing::info!(dir = %cascade_dir.as_ref().display(), "cascades loaded");
        Ok(Self::with_cascades(cascades, config))
    }

    pub fn with_cascades(cascades: CascadeSet, config: DetectionConfig) -> Self {
        let extractor = FeatureExtractor::new(config.clahe_clip_limit, config.clahe_tiles);
        let max_faces = config.max_faces;
        let padding_ratio = config.padding_ratio;
        Self::new(EnsembleLocalizer::new(cascades, config), extractor, max_faces, padding_ratio)
    }
}

impl<L: FaceLocator> FaceEncoder<L> {
    pub fn new(locator: L, extractor: FeatureExtractor, max_faces: usize, padding_ratio: f64) -> Self {
        Self {
            locator,
            extractor,
            max_faces,
            padding_ratio,
        }
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Accept images with between one and `max_faces` faces.
    pub fn validate(&self, gray: &GrayImage) -> Result<Validation, PipelineError> {
        let faces = self.locator.locate(gray);
        match faces.len() {
            0 => Err(PipelineError::NoFaceFound),
            n if n > self.max_faces => Err(PipelineError::TooManyFaces(n)),
            _ => Ok(Validation { faces }),
        }
    }

    /// Signature of the largest face in `gray`.
    pub fn encode(&self, gray: &GrayImage) -> Result<FaceEncoding, PipelineError> {
        let validation = self.validate(gray)?;
        self.encode_validated(gray, &validation)
    }

    fn encode_validated(&self, gray: &GrayImage, validation: &Validation) -> Result<FaceEncoding, PipelineError> {
        let dominant = localizer::select_dominant(&validation.faces).ok_or(PipelineError::NoFaceFound)?;
        let face_region = dominant.padded(self.padding_ratio, gray.width(), gray.height());
        let face = features::canonical_face(gray, &face_region)?;
        let features = self.extractor.describe(&face)?;

        if features.is_degenerate() {
            tracing::warn!(?face_region, "face crop produced a degenerate signature");
        }
        tracing::debug!(?dominant, ?face_region, faces = validation.faces.len(), "face encoded");

        Ok(FaceEncoding {
            features,
            face_region,
            total_faces_detected: validation.faces.len(),
            face,
        })
    }

    /// Load, validate and encode one image into the response envelope.
    ///
    /// Never fails: every error is reported as an unsuccessful envelope.
    pub fn process(
        &self,
        source: &dyn ImageSource,
        path: &Path,
        subject_id: &str,
        thumbnails: Option<&dyn ThumbnailEncoder>,
    ) -> ProcessResponse {
        match self.process_inner(source, path, subject_id, thumbnails) {
            Ok(data) => {
                tracing::info!(
                    subject_id,
                    features = data.features_length,
                    faces = data.total_faces_detected,
                    "face encoding successful"
                );
                ProcessResponse {
                    success: true,
                    message: "Face encoding successful".into(),
                    data: Some(data),
                }
            }
            Err(e) => {
                tracing::info!(subject_id, path = %path.display(), error = %e, "face encoding failed");
                ProcessResponse::failure(e.to_string())
            }
        }
    }

    fn process_inner(
        &self,
        source: &dyn ImageSource,
        path: &Path,
        subject_id: &str,
        thumbnails: Option<&dyn ThumbnailEncoder>,
    ) -> Result<ProcessData, PipelineError> {
        let gray = source.load_gray(path)?;
        let validation = self.validate(&gray)?;
        let encoding = self.encode_validated(&gray, &validation)?;

        Ok(ProcessData {
            subject_id: subject_id.to_string(),
            features_length: encoding.features.len(),
            face_image_base64: thumbnails.and_then(|t| t.encode(&encoding.face)),
            feature_vector: encoding.features,
            face_region: encoding.face_region,
            total_faces_detected: encoding.total_faces_detected,
            validation_message: validation.message(),
            extraction_method: EXTRACTION_METHOD.to_string(),
        })
    }
}

/// Result of comparing two stored signatures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ComparisonReport {
    Scored(SimilarityResult),
    Failed {
        is_match: bool,
        similarity_score: f64,
        error: String,
    },
}

impl ComparisonReport {
    pub fn failed(error: impl Into<String>) -> Self {
        ComparisonReport::Failed {
            is_match: false,
            similarity_score: 0.0,
            error: error.into(),
        }
    }

    pub fn is_match(&self) -> bool {
        match self {
            ComparisonReport::Scored(r) => r.is_match,
            ComparisonReport::Failed { .. } => false,
        }
    }

    pub fn similarity_score(&self) -> f64 {
        match self {
            ComparisonReport::Scored(r) => r.similarity_score,
            ComparisonReport::Failed { similarity_score, .. } => *similarity_score,
        }
    }
}

/// Compare two signatures; a length mismatch is reported rather than raised.
pub fn compare_signatures(
    scorer: &SimilarityScorer,
    a: &[f32],
    b: &[f32],
    threshold: Option<f64>,
) -> ComparisonReport {
    let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
    match scorer.compare(a, b, threshold) {
        Ok(result) => ComparisonReport::Scored(result),
        Err(e) => {
            tracing::debug!(error = %e, "comparison rejected");
            ComparisonReport::failed("Feature vectors have different lengths")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::tests::DARK_CENTRE_CASCADE;
    use crate::cascade::HaarCascade;
    use crate::features::FEATURE_LENGTH;
    use image::Luma;
    use std::path::PathBuf;

    struct FixedLocator(Vec<FaceRegion>);

    impl FaceLocator for FixedLocator {
        fn locate(&self, _gray: &GrayImage) -> Vec<FaceRegion> {
            self.0.clone()
        }
    }

    struct MemorySource(Result<GrayImage, LoadError>);

    impl ImageSource for MemorySource {
        fn load_gray(&self, _path: &Path) -> Result<GrayImage, LoadError> {
            self.0.clone()
        }
    }

    struct FixedThumbnail;

    impl ThumbnailEncoder for FixedThumbnail {
        fn encode(&self, face: &GrayImage) -> Option<String> {
            Some(format!("{}x{}", face.width(), face.height()))
        }
    }

    fn portrait() -> GrayImage {
        GrayImage::from_fn(200, 160, |x, y| Luma([((x * 3 + y * 5 + (x ^ y)) % 256) as u8]))
    }

    fn encoder(regions: Vec<FaceRegion>) -> FaceEncoder<FixedLocator> {
        FaceEncoder::new(FixedLocator(regions), FeatureExtractor::default(), 5, 0.10)
    }

    #[test]
    fn test_validate_policy() {
        let img = portrait();
        assert!(matches!(encoder(vec![]).validate(&img), Err(PipelineError::NoFaceFound)));

        let six = (0..6).map(|i| FaceRegion::new(i * 30, 0, 25, 25)).collect();
        assert!(matches!(encoder(six).validate(&img), Err(PipelineError::TooManyFaces(6))));

        let five: Vec<_> = (0..5).map(|i| FaceRegion::new(i * 30, 0, 25, 25)).collect();
        let v = encoder(five).validate(&img).unwrap();
        assert_eq!(v.message(), "Image is valid - 5 face(s) detected");
    }

    #[test]
    fn test_encode_uses_largest_face_with_padding() {
        let img = portrait();
        let enc = encoder(vec![FaceRegion::new(10, 10, 30, 30), FaceRegion::new(80, 40, 60, 70)])
            .encode(&img)
            .unwrap();
        // Padding round(0.1 * 60) = 6 on each side.
        assert_eq!(enc.face_region, FaceRegion::new(74, 34, 72, 82));
        assert_eq!(enc.total_faces_detected, 2);
        assert_eq!(enc.features.len(), FEATURE_LENGTH);
        assert_eq!(enc.face.dimensions(), (100, 100));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let img = portrait();
        let e = encoder(vec![FaceRegion::new(40, 30, 90, 90)]);
        assert_eq!(e.encode(&img).unwrap().features, e.encode(&img).unwrap().features);
    }

    #[test]
    fn test_process_success_envelope() {
        let e = encoder(vec![FaceRegion::new(40, 30, 90, 90)]);
        let source = MemorySource(Ok(portrait()));
        let resp = e.process(&source, &PathBuf::from("a.png"), "S-001", Some(&FixedThumbnail));
        assert!(resp.success);
        assert_eq!(resp.message, "Face encoding successful");

        let json = serde_json::to_value(&resp).unwrap();
        let data = &json["data"];
        assert_eq!(data["student_id"], "S-001");
        assert_eq!(data["features_length"], 470);
        assert_eq!(data["feature_vector"].as_array().unwrap().len(), 470);
        assert_eq!(data["total_faces_detected"], 1);
        assert_eq!(data["face_image_base64"], "100x100");
        assert_eq!(data["validation_message"], "Image is valid - 1 face(s) detected");
        assert_eq!(data["extraction_method"], EXTRACTION_METHOD);
        assert_eq!(data["face_region"]["x"], 31);
    }

    #[test]
    fn test_process_failure_envelopes() {
        let path = PathBuf::from("x.jpg");
        let e = encoder(vec![]);

        let resp = e.process(&MemorySource(Err(LoadError::TooSmall)), &path, "S", None);
        assert!(!resp.success);
        assert_eq!(resp.message, "Image is too small for face detection");
        assert!(resp.data.is_none());

        let resp = e.process(&MemorySource(Ok(portrait())), &path, "S", None);
        assert!(resp.message.starts_with("No face detected in the image"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["data"].is_null());

        let many: Vec<_> = (0..7).map(|i| FaceRegion::new(i * 25, 0, 20, 20)).collect();
        let resp = encoder(many).process(&MemorySource(Ok(portrait())), &path, "S", None);
        assert_eq!(resp.message, "Too many faces detected (7). Please upload an image with fewer faces");
    }

    #[test]
    fn test_process_without_thumbnail_encoder() {
        let e = encoder(vec![FaceRegion::new(40, 30, 90, 90)]);
        let resp = e.process(&MemorySource(Ok(portrait())), Path::new("a.png"), "S", None);
        assert!(resp.data.unwrap().face_image_base64.is_none());
    }

    #[test]
    fn test_blank_image_reports_no_face() {
        let cascade = HaarCascade::parse(DARK_CENTRE_CASCADE).unwrap();
        let e = FaceEncoder::with_cascades(
            CascadeSet::new(cascade, None, None),
            DetectionConfig::default(),
        );
        let blank = GrayImage::from_pixel(100, 50, Luma([128]));
        assert!(matches!(e.encode(&blank), Err(PipelineError::NoFaceFound)));
    }

    #[test]
    fn test_encode_then_compare_self() {
        let e = encoder(vec![FaceRegion::new(40, 30, 90, 90)]);
        let v = e.encode(&portrait()).unwrap().features;
        let report = compare_signatures(&SimilarityScorer::default(), v.as_slice(), v.as_slice(), None);
        assert!(report.is_match());
        assert!((report.similarity_score() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_compare_length_mismatch_report() {
        let report = compare_signatures(&SimilarityScorer::default(), &[0.1; 470], &[0.1; 469], Some(0.5));
        assert!(!report.is_match());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["is_match"], false);
        assert_eq!(json["similarity_score"], 0.0);
        assert_eq!(json["error"], "Feature vectors have different lengths");
    }

    #[test]
    fn test_compare_threshold_override() {
        let a = [0.6f32, 0.8, 0.0];
        let b = [0.0f32, 0.8, 0.6];
        let scorer = SimilarityScorer::default();
        let strict = compare_signatures(&scorer, &a, &b, Some(0.99));
        let lenient = compare_signatures(&scorer, &a, &b, Some(0.01));
        assert!(!strict.is_match());
        assert!(lenient.is_match());
        let json = serde_json::to_value(&strict).unwrap();
        assert_eq!(json["threshold"], 0.99);
    }
}
