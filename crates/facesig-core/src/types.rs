use serde::{Deserialize, Serialize};

/// Integer pixel rectangle of a detected face, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build a region from signed detector coordinates, clipped to an
    /// `image_width` × `image_height` frame. Returns `None` when nothing
    /// of the rectangle remains inside the frame.
    pub fn clamped(
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        let x0 = x.clamp(0, image_width as i64);
        let y0 = y.clamp(0, image_height as i64);
        let x1 = (x + width).clamp(0, image_width as i64);
        let y1 = (y + height).clamp(0, image_height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge, widened so it cannot overflow.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Area shared by two regions (0 when disjoint).
    pub fn intersection_area(&self, other: &FaceRegion) -> u64 {
        let overlap_x = self.right().min(other.right()).saturating_sub(self.x.max(other.x) as u64);
        let overlap_y = self.bottom().min(other.bottom()).saturating_sub(self.y.max(other.y) as u64);
        overlap_x * overlap_y
    }

    /// Whether the region is non-empty and lies entirely inside the frame.
    pub fn fits_within(&self, image_width: u32, image_height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.right() <= image_width as u64
            && self.bottom() <= image_height as u64
    }

    /// Grow the region by `round(ratio · min(width, height))` pixels on each
    /// side, clipped to the frame.
    pub fn padded(&self, ratio: f64, image_width: u32, image_height: u32) -> FaceRegion {
        let padding = (self.width.min(self.height) as f64 * ratio).round() as u32;
        let x = self.x.saturating_sub(padding);
        let y = self.y.saturating_sub(padding);
        let grown = |side: u32| side as u64 + 2 * padding as u64;
        let width = grown(self.width).min(image_width.saturating_sub(x) as u64) as u32;
        let height = grown(self.height).min(image_height.saturating_sub(y) as u64) as u32;
        FaceRegion { x, y, width, height }
    }
}

/// Fixed-length face signature produced by the feature extractor.
///
/// Serializes as a bare JSON array so stored signatures stay readable by
/// any client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// A degenerate (all-zero) signature comes from a blank face crop and
    /// must not be trusted as an identity.
    pub fn is_degenerate(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Outcome of comparing two feature vectors, with every intermediate metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub is_match: bool,
    /// Fused score in [0, 1].
    pub similarity_score: f64,
    #[serde(rename = "cosine_similarity")]
    pub cosine: f64,
    pub euclidean_similarity: f64,
    pub correlation: f64,
    pub manhattan_similarity: f64,
    pub euclidean_distance: f64,
    pub manhattan_distance: f64,
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection_area_partial() {
        let a = FaceRegion::new(0, 0, 10, 10);
        let b = FaceRegion::new(5, 0, 10, 10);
        assert_eq!(a.intersection_area(&b), 50);
        assert_eq!(b.intersection_area(&a), 50);
    }

    #[test]
    fn test_intersection_area_disjoint() {
        let a = FaceRegion::new(0, 0, 10, 10);
        let b = FaceRegion::new(20, 20, 10, 10);
        assert_eq!(a.intersection_area(&b), 0);
    }

    #[test]
    fn test_clamped_clips_to_frame() {
        let r = FaceRegion::clamped(-5, -5, 20, 20, 100, 100).unwrap();
        assert_eq!(r, FaceRegion::new(0, 0, 15, 15));

        let r = FaceRegion::clamped(90, 95, 20, 20, 100, 100).unwrap();
        assert_eq!(r, FaceRegion::new(90, 95, 10, 5));
    }

    #[test]
    fn test_clamped_outside_frame() {
        assert!(FaceRegion::clamped(120, 0, 10, 10, 100, 100).is_none());
        assert!(FaceRegion::clamped(-30, 0, 10, 10, 100, 100).is_none());
    }

    #[test]
    fn test_padded_interior() {
        // min(40, 50) * 0.1 = 4
        let r = FaceRegion::new(20, 20, 40, 50).padded(0.10, 200, 200);
        assert_eq!(r, FaceRegion::new(16, 16, 48, 58));
    }

    #[test]
    fn test_padded_rounds_padding() {
        // min(25, 25) * 0.1 = 2.5 -> 3
        let r = FaceRegion::new(10, 10, 25, 25).padded(0.10, 100, 100);
        assert_eq!(r, FaceRegion::new(7, 7, 31, 31));
    }

    #[test]
    fn test_padded_clamps_to_frame() {
        let r = FaceRegion::new(2, 0, 50, 50).padded(0.10, 54, 52);
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 0);
        assert!(r.fits_within(54, 52));
        assert_eq!(r.width, 54);
        assert_eq!(r.height, 52);
    }

    #[test]
    fn test_edges_do_not_overflow() {
        let r = FaceRegion::new(u32::MAX - 5, u32::MAX, 10, 10);
        assert_eq!(r.right(), u32::MAX as u64 + 5);
        assert!(!r.fits_within(u32::MAX, u32::MAX));

        let huge = FaceRegion::new(0, 0, u32::MAX - 1, u32::MAX - 1);
        assert_eq!(huge.padded(0.10, 100, 100), FaceRegion::new(0, 0, 100, 100));
        assert_eq!(huge.intersection_area(&FaceRegion::new(10, 10, 5, 5)), 25);
    }

    #[test]
    fn test_feature_vector_degenerate() {
        assert!(FeatureVector::new(vec![0.0; 4]).is_degenerate());
        assert!(!FeatureVector::new(vec![0.0, 0.5]).is_degenerate());
    }

    #[test]
    fn test_feature_vector_serializes_as_array() {
        let v = FeatureVector::new(vec![0.5, 0.25]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[0.5,0.25]");
        let back: FeatureVector = serde_json::from_str("[0.5,0.25]").unwrap();
        assert_eq!(back, v);
    }
}
