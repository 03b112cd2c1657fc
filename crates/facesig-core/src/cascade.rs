//! Haar cascade detector.
//!
//! Reads boosted Haar cascades in the OpenCV `opencv-cascade-classifier`
//! XML layout (the `haarcascade_*.xml` files shipped with OpenCV) and runs
//! them as a sliding-window detector over an image pyramid, followed by
//! neighbour grouping of the raw hits.

use crate::imgproc::{self, ImageError, IntegralImages};
use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use thiserror::Error;

/// Relative tolerance used when clustering raw window hits.
pub const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameter: {0}")]
    InvalidParameter(String),
    #[error("image: {0}")]
    Image(#[from] ImageError),
}

/// Signed pixel rectangle as produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Multi-scale detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Window growth per pyramid level; must exceed 1.0.
    pub scale_factor: f64,
    /// A cluster must gather more than this many raw hits to be reported.
    pub min_neighbors: u32,
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

#[derive(Debug, Clone)]
struct WeightedRect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
    tilted: bool,
}

#[derive(Debug, Clone, Copy)]
struct SplitNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<SplitNode>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    name: String,
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
    has_tilted: bool,
}

fn element_children<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    element_children(node)
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| CascadeError::Malformed(format!("missing <{name}>")))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or("").trim())
}

fn parse_num<T: std::str::FromStr>(token: &str, what: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Malformed(format!("bad {what} value {token:?}")))
}

/// Node indices are stored as numbers alongside the float thresholds.
fn node_index(v: f64, what: &str) -> Result<i32, CascadeError> {
    if v.fract() != 0.0 || v < i32::MIN as f64 || v > i32::MAX as f64 {
        return Err(CascadeError::Malformed(format!("bad {what} index {v}")));
    }
    Ok(v as i32)
}

fn parse_list<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_whitespace().map(|t| parse_num(t, what)).collect()
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cascade = Self::parse_named(&xml, name)?;

        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?(cascade.window_width, cascade.window_height),
            tilted = cascade.has_tilted,
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from XML text.
    pub fn parse(xml: &str) -> Result<Self, CascadeError> {
        Self::parse_named(xml, "cascade".to_string())
    }

    fn parse_named(xml: &str, name: String) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported("no <cascade> node (legacy haar format?)".into())
            })?;

        let stage_type = child_text(root, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = child_text(root, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }
        if let Ok(params) = child(root, "featureParams") {
            let cat_count: u32 = parse_num(child_text(params, "maxCatCount")?, "maxCatCount")?;
            if cat_count != 0 {
                return Err(CascadeError::Unsupported("categorical features".into()));
            }
        }

        let window_width: u32 = parse_num(child_text(root, "width")?, "width")?;
        let window_height: u32 = parse_num(child_text(root, "height")?, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Malformed(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let mut features = Vec::new();
        for node in element_children(child(root, "features")?) {
            let mut rects = Vec::new();
            for r in element_children(child(node, "rects")?) {
                let vals: Vec<f32> = parse_list(r.text().unwrap_or(""), "rect")?;
                if vals.len() != 5 {
                    return Err(CascadeError::Malformed(format!(
                        "rect needs 5 values, got {}",
                        vals.len()
                    )));
                }
                rects.push(WeightedRect {
                    x: vals[0] as i32,
                    y: vals[1] as i32,
                    width: vals[2] as i32,
                    height: vals[3] as i32,
                    weight: vals[4],
                });
            }
            let tilted = match child(node, "tilted") {
                Ok(t) => t.text().unwrap_or("0").trim() == "1",
                Err(_) => false,
            };
            let feature = HaarFeature { rects, tilted };
            validate_feature(&feature, window_width as i32, window_height as i32, features.len())?;
            features.push(feature);
        }

        let mut stages = Vec::new();
        for stage_node in element_children(child(root, "stages")?) {
            let threshold: f32 = parse_num(child_text(stage_node, "stageThreshold")?, "stageThreshold")?;
            let mut classifiers = Vec::new();
            for weak in element_children(child(stage_node, "weakClassifiers")?) {
                let raw: Vec<f64> = parse_list(child_text(weak, "internalNodes")?, "internalNodes")?;
                let leaves: Vec<f32> = parse_list(child_text(weak, "leafValues")?, "leafValues")?;
                if raw.is_empty() || raw.len() % 4 != 0 {
                    return Err(CascadeError::Malformed(format!(
                        "internalNodes has {} values, expected groups of 4",
                        raw.len()
                    )));
                }
                let nodes = raw
                    .chunks_exact(4)
                    .map(|c| {
                        let feature = node_index(c[2], "feature")?;
                        if feature < 0 {
                            return Err(CascadeError::Malformed(format!(
                                "negative feature index {feature}"
                            )));
                        }
                        Ok(SplitNode {
                            left: node_index(c[0], "left child")?,
                            right: node_index(c[1], "right child")?,
                            feature: feature as usize,
                            threshold: c[3] as f32,
                        })
                    })
                    .collect::<Result<Vec<_>, CascadeError>>()?;
                let classifier = WeakClassifier { nodes, leaves };
                validate_classifier(&classifier, features.len())?;
                classifiers.push(classifier);
            }
            stages.push(Stage { threshold, classifiers });
        }
        if stages.is_empty() {
            return Err(CascadeError::Malformed("cascade has no stages".into()));
        }

        let has_tilted = features.iter().any(|f| f.tilted);
        Ok(Self {
            name,
            window_width,
            window_height,
            stages,
            features,
            has_tilted,
        })
    }

    /// Base detection window (width, height) in pixels.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Detect objects and group the raw hits.
    pub fn detect(&self, img: &GrayImage, params: &DetectParams) -> Result<Vec<Rect>, CascadeError> {
        let raw = self.detect_raw(img, params.scale_factor, params.min_size, params.max_size)?;
        Ok(group_rectangles(&raw, params.min_neighbors, GROUP_EPS))
    }

    /// Run the sliding window over every pyramid level and return all
    /// accepted windows in image coordinates, ungrouped.
    ///
    /// The image is shrunk by `scale_factor^k` at level `k`, so the effective
    /// window grows by the same factor. Levels whose window falls below
    /// `min_size` are skipped; the sweep stops once the window exceeds
    /// `max_size` or no longer fits the image.
    pub fn detect_raw(
        &self,
        img: &GrayImage,
        scale_factor: f64,
        min_size: (u32, u32),
        max_size: (u32, u32),
    ) -> Result<Vec<Rect>, CascadeError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(CascadeError::Image(ImageError::Empty));
        }
        if !scale_factor.is_finite() || scale_factor <= 1.0 {
            return Err(CascadeError::InvalidParameter(format!(
                "scale factor must exceed 1.0, got {scale_factor}"
            )));
        }

        let (ww, wh) = (self.window_width, self.window_height);
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            let scaled_w = (img.width() as f64 / factor).round() as u32;
            let scaled_h = (img.height() as f64 / factor).round() as u32;

            if scaled_w < ww || scaled_h < wh {
                break;
            }
            if win_w > max_size.0 || win_h > max_size.1 {
                break;
            }
            if win_w < min_size.0 || win_h < min_size.1 {
                factor *= scale_factor;
                continue;
            }

            let scaled = if scaled_w == img.width() && scaled_h == img.height() {
                img.clone()
            } else {
                imgproc::resize_bilinear(img, scaled_w, scaled_h)?
            };
            let ii = IntegralImages::new(&scaled, self.has_tilted);
            let step = if factor > 2.0 { 1 } else { 2 };

            let before = hits.len();
            for y in (0..=(scaled_h - wh) as usize).step_by(step) {
                for x in (0..=(scaled_w - ww) as usize).step_by(step) {
                    if self.classify(&ii, x, y) {
                        hits.push(Rect::new(
                            (x as f64 * factor).round() as i32,
                            (y as f64 * factor).round() as i32,
                            win_w as i32,
                            win_h as i32,
                        ));
                    }
                }
            }
            tracing::trace!(
                cascade = %self.name,
                factor,
                window = win_w,
                hits = hits.len() - before,
                "pyramid level"
            );

            factor *= scale_factor;
        }

        Ok(hits)
    }

    /// Evaluate every stage at window origin `(x, y)` of an integral image.
    fn classify(&self, ii: &IntegralImages, x: usize, y: usize) -> bool {
        let (ww, wh) = (self.window_width as usize, self.window_height as usize);

        // Variance normaliser over the window inset by one pixel.
        let area = ((ww - 2) * (wh - 2)) as f64;
        let sum = ii.rect_sum(x + 1, y + 1, ww - 2, wh - 2) as f64;
        let sqsum = ii.rect_sqsum(x + 1, y + 1, ww - 2, wh - 2) as f64;
        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut score = 0.0f64;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.feature_value(ii, node.feature, x, y);
                    idx = if value < node.threshold as f64 * nf {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                score += weak.leaves[idx.unsigned_abs() as usize] as f64;
            }
            if score < stage.threshold as f64 {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, ii: &IntegralImages, feature: usize, x: usize, y: usize) -> f64 {
        let f = &self.features[feature];
        f.rects
            .iter()
            .map(|r| {
                let rx = x + r.x as usize;
                let ry = y + r.y as usize;
                let (rw, rh) = (r.width as usize, r.height as usize);
                let s = if f.tilted {
                    ii.tilted_sum(rx, ry, rw, rh)
                } else {
                    ii.rect_sum(rx, ry, rw, rh)
                };
                r.weight as f64 * s as f64
            })
            .sum()
    }
}

fn validate_feature(f: &HaarFeature, win_w: i32, win_h: i32, idx: usize) -> Result<(), CascadeError> {
    if f.rects.is_empty() {
        return Err(CascadeError::Malformed(format!("feature {idx} has no rects")));
    }
    for r in &f.rects {
        let inside = if f.tilted {
            r.x - r.height >= 0
                && r.y >= 0
                && r.x + r.width <= win_w
                && r.y + r.width + r.height <= win_h
        } else {
            r.x >= 0 && r.y >= 0 && r.x + r.width <= win_w && r.y + r.height <= win_h
        };
        if r.width < 0 || r.height < 0 || !inside {
            return Err(CascadeError::Malformed(format!(
                "feature {idx} rect ({}, {}, {}, {}) leaves the {win_w}x{win_h} window",
                r.x, r.y, r.width, r.height
            )));
        }
    }
    Ok(())
}

/// Children must point forward so evaluation always terminates, and every
/// reachable leaf and feature index must exist.
fn validate_classifier(weak: &WeakClassifier, num_features: usize) -> Result<(), CascadeError> {
    for (i, node) in weak.nodes.iter().enumerate() {
        if node.feature >= num_features {
            return Err(CascadeError::Malformed(format!(
                "feature index {} out of range ({num_features} features)",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            if child > 0 {
                if child as usize <= i || child as usize >= weak.nodes.len() {
                    return Err(CascadeError::Malformed(format!("bad child node index {child}")));
                }
            } else if child.unsigned_abs() as usize >= weak.leaves.len() {
                return Err(CascadeError::Malformed(format!(
                    "leaf index {} out of range",
                    child.unsigned_abs()
                )));
            }
        }
    }
    Ok(())
}

/// Whether two rectangles are near-duplicates: every edge within
/// `eps · (mean of the smaller width and height)`.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.x + a.width - b.x - b.width).abs() as f64 <= delta
        && (a.y + a.height - b.y - b.height).abs() as f64 <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits and keep the well-supported clusters.
///
/// Similar rectangles are joined transitively; each cluster is replaced by
/// its average rectangle and kept only when it has more than `min_neighbors`
/// members. A kept cluster is still dropped when it sits inside another
/// kept cluster with stronger support. With `min_neighbors == 0` the input
/// is returned as is. Clusters are ordered by their first member.
pub fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    // Label clusters in order of first appearance
    let mut label_of_root = vec![usize::MAX; n];
    let mut sums: Vec<[i64; 4]> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if label_of_root[root] == usize::MAX {
            label_of_root[root] = sums.len();
            sums.push([0; 4]);
            counts.push(0);
        }
        let label = label_of_root[root];
        sums[label][0] += r.x as i64;
        sums[label][1] += r.y as i64;
        sums[label][2] += r.width as i64;
        sums[label][3] += r.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &c)| {
            let inv = 1.0 / c as f64;
            Rect::new(
                (s[0] as f64 * inv).round() as i32,
                (s[1] as f64 * inv).round() as i32,
                (s[2] as f64 * inv).round() as i32,
                (s[3] as f64 * inv).round() as i32,
            )
        })
        .collect();

    let mut kept = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            kept.push(*r1);
        }
    }
    kept
}
