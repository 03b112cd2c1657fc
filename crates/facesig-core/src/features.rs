//! Hand-crafted face signature.
//!
//! A face crop is resampled to a canonical 100×100 grid, contrast-enhanced,
//! and described by four concatenated sub-vectors: a 64-bin intensity
//! histogram, 6×6 block statistics, a 16×16 thumbnail and six global
//! gradient statistics. The result is L2-normalized.
//!
//! Each sub-extractor returns a `Result`; a failing one is replaced by its
//! zero fallback so a single bad stage never aborts extraction.

use crate::imgproc::{self, ImageError};
use crate::types::{FaceRegion, FeatureVector};
use image::GrayImage;
use thiserror::Error;

/// Side of the square grid a face crop is resampled to.
pub const CANONICAL_SIZE: u32 = 100;
pub const HISTOGRAM_BINS: usize = 64;
/// Blocks per side for the block statistics.
pub const BLOCK_GRID: u32 = 6;
/// Side of the downsampled intensity grid.
pub const PIXEL_GRID: u32 = 16;
pub const GRADIENT_STATS: usize = 6;

const BLOCK_STATS: usize = 4;
const BLOCK_FEATURES: usize = (BLOCK_GRID * BLOCK_GRID) as usize * BLOCK_STATS;
const PIXEL_FEATURES: usize = (PIXEL_GRID * PIXEL_GRID) as usize;

/// Length of every signature produced by [`FeatureExtractor`].
pub const FEATURE_LENGTH: usize = HISTOGRAM_BINS + BLOCK_FEATURES + PIXEL_FEATURES + GRADIENT_STATS;

const NORM_EPSILON: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("face region unreadable: {0}")]
    Region(#[from] ImageError),
    #[error("signature has {actual} values, expected {expected}")]
    Length { expected: usize, actual: usize },
}

/// Produces fixed-length signatures from face crops.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    clahe_clip_limit: f32,
    clahe_tiles: u32,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(2.0, 8)
    }
}

impl FeatureExtractor {
    pub fn new(clahe_clip_limit: f32, clahe_tiles: u32) -> Self {
        Self {
            clahe_clip_limit,
            clahe_tiles,
        }
    }

    /// Signature of `region` within `gray`.
    ///
    /// Only an unreadable region is an error; every later stage degrades to
    /// its zero fallback.
    pub fn extract(&self, gray: &GrayImage, region: &FaceRegion) -> Result<FeatureVector, ExtractionError> {
        let face = canonical_face(gray, region)?;
        self.describe(&face)
    }

    /// Signature of a face already resampled to the canonical grid.
    pub fn describe(&self, face: &GrayImage) -> Result<FeatureVector, ExtractionError> {
        let sample = self.preprocess(face);

        let mut values = Vec::with_capacity(FEATURE_LENGTH);
        values.extend(or_zeros(histogram_features(&sample), HISTOGRAM_BINS, "histogram"));
        values.extend(or_zeros(block_features(&sample), BLOCK_FEATURES, "block statistics"));
        values.extend(or_zeros(pixel_features(&sample), PIXEL_FEATURES, "pixel intensities"));
        values.extend(or_zeros(gradient_features(&sample), GRADIENT_STATS, "gradient statistics"));

        if values.len() != FEATURE_LENGTH {
            return Err(ExtractionError::Length {
                expected: FEATURE_LENGTH,
                actual: values.len(),
            });
        }
        Ok(normalize(&values))
    }

    /// CLAHE followed by a 3×3 Gaussian; the input is returned unchanged
    /// when either step fails.
    pub fn preprocess(&self, face: &GrayImage) -> GrayImage {
        let enhanced = imgproc::clahe(face, self.clahe_clip_limit, self.clahe_tiles)
            .and_then(|img| imgproc::gaussian_blur_3x3(&img));
        match enhanced {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(error = %e, "preprocessing failed; using the unprocessed face");
                face.clone()
            }
        }
    }
}

/// Crop `region` and resample it to `CANONICAL_SIZE`².
pub fn canonical_face(gray: &GrayImage, region: &FaceRegion) -> Result<GrayImage, ExtractionError> {
    let crop = imgproc::crop(gray, region)?;
    Ok(imgproc::resize_bilinear(&crop, CANONICAL_SIZE, CANONICAL_SIZE)?)
}

fn or_zeros(result: Result<Vec<f64>, ImageError>, len: usize, stage: &str) -> Vec<f64> {
    result.unwrap_or_else(|e| {
        tracing::warn!(stage, error = %e, "feature stage failed; using zeros");
        vec![0.0; len]
    })
}

/// Population mean and standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// 64-bin intensity histogram, normalized to sum to ~1.
pub fn histogram_features(img: &GrayImage) -> Result<Vec<f64>, ImageError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::Empty);
    }
    let bin_width = 256 / HISTOGRAM_BINS;
    let mut counts = [0u64; HISTOGRAM_BINS];
    for &p in img.as_raw() {
        counts[p as usize / bin_width] += 1;
    }
    let total = counts.iter().sum::<u64>() as f64 + 1e-7;
    Ok(counts.iter().map(|&c| c as f64 / total).collect())
}

/// Mean, std, mean gradient magnitude and std gradient magnitude for each
/// block of a `BLOCK_GRID`² partition, row-major.
///
/// Blocks are `size / BLOCK_GRID` pixels on a side; the last row and column
/// absorb the remainder.
pub fn block_features(img: &GrayImage) -> Result<Vec<f64>, ImageError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::Empty);
    }
    let (w, h) = img.dimensions();
    let block_w = w / BLOCK_GRID;
    let block_h = h / BLOCK_GRID;
    let span = |i: u32, step: u32, size: u32| {
        let start = i * step;
        let end = if i == BLOCK_GRID - 1 { size } else { start + step };
        (start, end)
    };

    let mut out = Vec::with_capacity(BLOCK_FEATURES);
    for by in 0..BLOCK_GRID {
        let (y0, y1) = span(by, block_h, h);
        for bx in 0..BLOCK_GRID {
            let (x0, x1) = span(bx, block_w, w);
            if x1 <= x0 || y1 <= y0 {
                out.extend([0.0; BLOCK_STATS]);
                continue;
            }
            let block = image::imageops::crop_imm(img, x0, y0, x1 - x0, y1 - y0).to_image();
            let pixels: Vec<f64> = block.as_raw().iter().map(|&p| p as f64).collect();
            let (mean, std) = mean_std(&pixels);
            out.extend([mean, std]);
            match imgproc::sobel(&block) {
                Ok(g) => {
                    let (grad_mean, grad_std) = mean_std(&g.magnitude());
                    out.extend([grad_mean, grad_std]);
                }
                Err(_) => out.extend([0.0, 0.0]),
            }
        }
    }
    Ok(out)
}

/// The image downsampled to `PIXEL_GRID`², row-major, scaled into [0, 1].
pub fn pixel_features(img: &GrayImage) -> Result<Vec<f64>, ImageError> {
    let small = imgproc::resize_bilinear(img, PIXEL_GRID, PIXEL_GRID)?;
    Ok(small.as_raw().iter().map(|&p| p as f64 / 255.0).collect())
}

/// Mean and std of gradient magnitude, mean and std of gradient direction,
/// then maximum and minimum magnitude.
pub fn gradient_features(img: &GrayImage) -> Result<Vec<f64>, ImageError> {
    let gradients = imgproc::sobel(img)?;
    let magnitude = gradients.magnitude();
    let (mag_mean, mag_std) = mean_std(&magnitude);
    let (dir_mean, dir_std) = mean_std(&gradients.direction());
    let max = magnitude.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = magnitude.iter().copied().fold(f64::INFINITY, f64::min);
    Ok(vec![mag_mean, mag_std, dir_mean, dir_std, max, min])
}

/// Replace non-finite values (NaN → 0, ±∞ → ±1) and scale to unit L2 norm.
/// A vector whose norm does not exceed 1e-6 becomes all zeros.
pub fn normalize(values: &[f64]) -> FeatureVector {
    let cleaned: Vec<f32> = values
        .iter()
        .map(|&v| {
            let v = v as f32;
            if v.is_nan() {
                0.0
            } else if v == f32::INFINITY {
                1.0
            } else if v == f32::NEG_INFINITY {
                -1.0
            } else {
                v
            }
        })
        .collect();

    let norm = cleaned
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt();
    if norm > NORM_EPSILON {
        FeatureVector::new(cleaned.iter().map(|&v| (v as f64 / norm) as f32).collect())
    } else {
        FeatureVector::new(vec![0.0; cleaned.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 13 + (x * y) % 17) % 256) as u8]))
    }

    #[test]
    fn test_feature_length_constant() {
        assert_eq!(FEATURE_LENGTH, 470);
    }

    #[test]
    fn test_extract_length_and_norm() {
        let img = textured(160, 140);
        let v = FeatureExtractor::default()
            .extract(&img, &FaceRegion::new(20, 15, 90, 100))
            .unwrap();
        assert_eq!(v.len(), FEATURE_LENGTH);
        assert!((v.norm() - 1.0).abs() < 1e-3);
        assert!(v.as_slice().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_extract_is_deterministic() {
        let img = textured(120, 120);
        let region = FaceRegion::new(10, 10, 80, 80);
        let extractor = FeatureExtractor::default();
        let a = extractor.extract(&img, &region).unwrap();
        let b = extractor.extract(&img, &region).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_rejects_region_outside_image() {
        let img = textured(50, 50);
        let err = FeatureExtractor::default()
            .extract(&img, &FaceRegion::new(30, 30, 40, 40))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Region(ImageError::RegionOutOfBounds { .. })));
    }

    #[test]
    fn test_extract_rejects_region_at_coordinate_limit() {
        let img = textured(120, 120);
        let err = FeatureExtractor::default()
            .extract(&img, &FaceRegion::new(u32::MAX - 5, 0, 10, 10))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Region(ImageError::RegionOutOfBounds { .. })));
    }

    #[test]
    fn test_uniform_face_is_valid_signature() {
        let img = GrayImage::from_pixel(100, 100, Luma([90]));
        let v = FeatureExtractor::default().describe(&img).unwrap();
        assert_eq!(v.len(), FEATURE_LENGTH);
        assert!(!v.is_degenerate());
        assert!((v.norm() - 1.0).abs() < 1e-3);
        // No gradients anywhere.
        assert!(v.as_slice()[FEATURE_LENGTH - GRADIENT_STATS..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_histogram_sums_to_one() {
        let img = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 3 } else { 255 }]));
        let h = histogram_features(&img).unwrap();
        assert_eq!(h.len(), HISTOGRAM_BINS);
        assert!((h.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!((h[0] - 0.5).abs() < 1e-6);
        assert!((h[63] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_block_features_constant_image() {
        let img = GrayImage::from_pixel(100, 100, Luma([40]));
        let b = block_features(&img).unwrap();
        assert_eq!(b.len(), 144);
        for block in b.chunks(4) {
            assert_eq!(block, &[40.0, 0.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_block_features_last_row_absorbs_remainder() {
        // Only the bottom four rows are bright; they fall in the enlarged
        // last block row (rows 80..100).
        let img = GrayImage::from_fn(100, 100, |_, y| Luma([if y >= 96 { 255 } else { 0 }]));
        let b = block_features(&img).unwrap();
        let block = |row: usize, col: usize| &b[(row * 6 + col) * 4..(row * 6 + col + 1) * 4];
        assert_eq!(block(4, 0)[0], 0.0);
        assert!((block(5, 0)[0] - 51.0).abs() < 1e-9);
        assert!((block(5, 5)[0] - 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_block_features_tiny_image_has_empty_blocks() {
        // 4 pixels per side: every block but the last row/column is empty.
        let img = GrayImage::from_pixel(4, 4, Luma([10]));
        let b = block_features(&img).unwrap();
        assert_eq!(b.len(), 144);
        assert_eq!(&b[..4], &[0.0; 4]);
        let last = &b[140..];
        assert_eq!(last[0], 10.0);
    }

    #[test]
    fn test_pixel_features_range() {
        let p = pixel_features(&textured(100, 100)).unwrap();
        assert_eq!(p.len(), 256);
        assert!(p.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_gradient_features_vertical_edge() {
        let img = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 200 }]));
        let g = gradient_features(&img).unwrap();
        assert_eq!(g.len(), GRADIENT_STATS);
        // Sobel response at a 0→200 step is 4 * 200.
        assert_eq!(g[4], 800.0);
        assert_eq!(g[5], 0.0);
        assert!(g[0] > 0.0);
    }

    #[test]
    fn test_failed_stages_fall_back_to_zeros() {
        let empty = GrayImage::new(0, 0);
        assert!(histogram_features(&empty).is_err());
        assert!(block_features(&empty).is_err());
        assert!(pixel_features(&empty).is_err());
        assert!(gradient_features(&empty).is_err());
        assert_eq!(or_zeros(block_features(&empty), 144, "blocks"), vec![0.0; 144]);
    }

    #[test]
    fn test_preprocess_falls_back_on_failure() {
        // Smaller than the 8x8 tile grid: CLAHE fails, input returned.
        let tiny = GrayImage::from_pixel(4, 4, Luma([77]));
        assert_eq!(FeatureExtractor::default().preprocess(&tiny), tiny);
    }

    #[test]
    fn test_normalize_replaces_non_finite() {
        let v = normalize(&[f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0]);
        let s = std::f32::consts::FRAC_1_SQRT_2;
        assert_eq!(v.as_slice()[0], 0.0);
        assert!((v.as_slice()[1] - s).abs() < 1e-6);
        assert!((v.as_slice()[2] + s).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_near_zero_is_all_zero() {
        let v = normalize(&[1e-9, -1e-9, 0.0]);
        assert!(v.is_degenerate());
        assert_eq!(v.len(), 3);
    }
}
