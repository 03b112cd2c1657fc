//! Face localization with an ensemble of Haar cascades.
//!
//! Candidates come from an explicit, ordered plan of detector passes, each a
//! `(cascade, preprocessing, scale factor, min neighbours)` tuple, and are
//! reduced by an order-preserving overlap merge.

use crate::cascade::{self, CascadeError, HaarCascade, Rect};
use crate::config::DetectionConfig;
use crate::imgproc::{self, ImageError};
use crate::types::FaceRegion;
use image::GrayImage;
use rayon::prelude::*;
use std::path::Path;

pub const FRONTAL_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const FRONTAL_ALT_CASCADE_FILE: &str = "haarcascade_frontalface_alt.xml";
pub const PROFILE_CASCADE_FILE: &str = "haarcascade_profileface.xml";

/// Which cascade a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeKind {
    Frontal,
    FrontalAlt,
    Profile,
}

/// Image enhancement applied before a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preprocessing {
    None,
    Equalized,
    Clahe,
}

/// One detector invocation in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionPass {
    pub cascade: CascadeKind,
    pub preprocessing: Preprocessing,
    pub scale_factor: f64,
    pub min_neighbors: u32,
}

/// Ordered list of detector passes.
///
/// Primary frontal sweep (scale factor, then neighbour threshold), then the
/// alternate frontal and profile cascades, then the frontal cascade on the
/// histogram-equalized and CLAHE-enhanced images.
pub fn detection_plan(config: &DetectionConfig) -> Vec<DetectionPass> {
    let mut plan = Vec::with_capacity(config.scale_factors.len() * config.min_neighbors.len() + 4);
    for &scale_factor in &config.scale_factors {
        for &min_neighbors in &config.min_neighbors {
            plan.push(DetectionPass {
                cascade: CascadeKind::Frontal,
                preprocessing: Preprocessing::None,
                scale_factor,
                min_neighbors,
            });
        }
    }
    for (cascade, preprocessing) in [
        (CascadeKind::FrontalAlt, Preprocessing::None),
        (CascadeKind::Profile, Preprocessing::None),
        (CascadeKind::Frontal, Preprocessing::Equalized),
        (CascadeKind::Frontal, Preprocessing::Clahe),
    ] {
        plan.push(DetectionPass {
            cascade,
            preprocessing,
            scale_factor: config.extra_scale_factor,
            min_neighbors: config.extra_min_neighbors,
        });
    }
    plan
}

/// The cascades used by the ensemble, loaded once and shared read-only.
///
/// Only the primary frontal cascade is mandatory; passes whose cascade is
/// absent are skipped.
#[derive(Debug, Clone)]
pub struct CascadeSet {
    frontal: HaarCascade,
    frontal_alt: Option<HaarCascade>,
    profile: Option<HaarCascade>,
}

impl CascadeSet {
    pub fn new(
        frontal: HaarCascade,
        frontal_alt: Option<HaarCascade>,
        profile: Option<HaarCascade>,
    ) -> Self {
        Self {
            frontal,
            frontal_alt,
            profile,
        }
    }

    /// Load the standard OpenCV cascade files from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let dir = dir.as_ref();
        let frontal = HaarCascade::load(dir.join(FRONTAL_CASCADE_FILE))?;
        let frontal_alt = load_optional(&dir.join(FRONTAL_ALT_CASCADE_FILE));
        let profile = load_optional(&dir.join(PROFILE_CASCADE_FILE));
        Ok(Self::new(frontal, frontal_alt, profile))
    }

    pub fn get(&self, kind: CascadeKind) -> Option<&HaarCascade> {
        match kind {
            CascadeKind::Frontal => Some(&self.frontal),
            CascadeKind::FrontalAlt => self.frontal_alt.as_ref(),
            CascadeKind::Profile => self.profile.as_ref(),
        }
    }
}

fn load_optional(path: &Path) -> Option<HaarCascade> {
    match HaarCascade::load(path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "optional cascade unavailable; its pass will be skipped");
            None
        }
    }
}

/// Strategy for finding faces in a grayscale image.
pub trait FaceLocator {
    /// All distinct face regions, in discovery order. May be empty.
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion>;
}

/// Greedy, order-dependent duplicate removal.
///
/// A candidate is dropped when its intersection with any already accepted
/// region exceeds `overlap_ratio` of the smaller of the two areas; otherwise
/// it is accepted. Earlier candidates win ties.
pub fn merge_overlapping(candidates: &[FaceRegion], overlap_ratio: f64) -> Vec<FaceRegion> {
    let mut merged: Vec<FaceRegion> = Vec::new();
    for face in candidates {
        let duplicate = merged.iter().any(|kept| {
            let overlap = face.intersection_area(kept) as f64;
            overlap > overlap_ratio * face.area().min(kept.area()) as f64
        });
        if !duplicate {
            merged.push(*face);
        }
    }
    merged
}

/// The region with the largest area; the first one wins ties.
pub fn select_dominant(regions: &[FaceRegion]) -> Option<FaceRegion> {
    regions
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.area().cmp(&b.area()).then(ib.cmp(ia)))
        .map(|(_, r)| *r)
}

/// Key of one multi-scale sweep: the raw pyramid hits depend only on the
/// cascade, the input image and the scale factor, so passes that differ
/// only in neighbour threshold share a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SweepKey {
    cascade: CascadeKind,
    preprocessing: Preprocessing,
    scale_factor: f64,
}

/// The detector inputs for one image: the raw frame plus whichever
/// enhanced copies the plan asks for.
struct PreparedImages<'a> {
    raw: &'a GrayImage,
    equalized: Option<Result<GrayImage, ImageError>>,
    enhanced: Option<Result<GrayImage, ImageError>>,
}

impl PreparedImages<'_> {
    fn get(&self, preprocessing: Preprocessing) -> Result<&GrayImage, CascadeError> {
        let prepared = match preprocessing {
            Preprocessing::None => return Ok(self.raw),
            Preprocessing::Equalized => &self.equalized,
            Preprocessing::Clahe => &self.enhanced,
        };
        match prepared {
            Some(Ok(img)) => Ok(img),
            Some(Err(e)) => Err(CascadeError::Image(e.clone())),
            None => Err(CascadeError::InvalidParameter(format!(
                "{preprocessing:?} image was not prepared"
            ))),
        }
    }
}

fn to_region(r: &Rect, width: u32, height: u32) -> Option<FaceRegion> {
    FaceRegion::clamped(r.x as i64, r.y as i64, r.width as i64, r.height as i64, width, height)
}

/// Ensemble face localizer over a [`CascadeSet`].
pub struct EnsembleLocalizer {
    cascades: CascadeSet,
    config: DetectionConfig,
    plan: Vec<DetectionPass>,
}

impl EnsembleLocalizer {
    pub fn new(cascades: CascadeSet, config: DetectionConfig) -> Self {
        let plan = detection_plan(&config);
        Self {
            cascades,
            config,
            plan,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn plan(&self) -> &[DetectionPass] {
        &self.plan
    }

    /// Every candidate from every pass, in plan order, before merging.
    pub fn candidates(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let images = PreparedImages {
            raw: gray,
            equalized: self
                .needs(Preprocessing::Equalized)
                .then(|| imgproc::equalize_hist(gray)),
            enhanced: self.needs(Preprocessing::Clahe).then(|| {
                imgproc::clahe(gray, self.config.clahe_clip_limit, self.config.clahe_tiles)
            }),
        };

        let mut sweeps: Vec<SweepKey> = Vec::new();
        let mut sweep_of_pass = Vec::with_capacity(self.plan.len());
        for pass in &self.plan {
            let key = SweepKey {
                cascade: pass.cascade,
                preprocessing: pass.preprocessing,
                scale_factor: pass.scale_factor,
            };
            let idx = match sweeps.iter().position(|k| *k == key) {
                Some(idx) => idx,
                None => {
                    sweeps.push(key);
                    sweeps.len() - 1
                }
            };
            sweep_of_pass.push(idx);
        }

        let run = |key: &SweepKey| -> Option<Result<Vec<Rect>, CascadeError>> {
            let cascade = self.cascades.get(key.cascade)?;
            let min = self.config.min_face_size;
            let max = self.config.max_face_size;
            Some(images.get(key.preprocessing).and_then(|img| {
                cascade.detect_raw(img, key.scale_factor, (min, min), (max, max))
            }))
        };

        // Sweeps are independent and read-only over the images; collecting
        // keeps them in plan order either way.
        let raw: Vec<Option<Result<Vec<Rect>, CascadeError>>> = if self.config.parallel {
            sweeps.par_iter().map(run).collect()
        } else {
            sweeps.iter().map(run).collect()
        };

        let mut candidates = Vec::new();
        for (pass, &idx) in self.plan.iter().zip(&sweep_of_pass) {
            match &raw[idx] {
                None => {
                    tracing::debug!(?pass, "cascade not loaded; pass skipped");
                }
                Some(Err(e)) => {
                    tracing::debug!(?pass, error = %e, "detector pass failed; skipped");
                }
                Some(Ok(hits)) => {
                    let grouped = cascade::group_rectangles(hits, pass.min_neighbors, cascade::GROUP_EPS);
                    let before = candidates.len();
                    candidates.extend(grouped.iter().filter_map(|r| to_region(r, width, height)));
                    tracing::trace!(?pass, found = candidates.len() - before, "detector pass");
                }
            }
        }
        candidates
    }

    fn needs(&self, preprocessing: Preprocessing) -> bool {
        self.plan.iter().any(|p| {
            p.preprocessing == preprocessing && self.cascades.get(p.cascade).is_some()
        })
    }
}

impl FaceLocator for EnsembleLocalizer {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let candidates = self.candidates(gray);
        let merged = merge_overlapping(&candidates, self.config.overlap_ratio);
        tracing::debug!(
            candidates = candidates.len(),
            faces = merged.len(),
            "merged detector candidates"
        );
        merged
    }
}
