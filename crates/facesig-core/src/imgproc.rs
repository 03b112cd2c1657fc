//! Grayscale image primitives: resize, histogram equalization, CLAHE,
//! smoothing, Sobel gradients and integral images.
//!
//! Border handling follows the reflect-101 convention (`dcb|abcd|cba`)
//! everywhere a kernel reaches past the edge.

use crate::types::FaceRegion;
use image::GrayImage;
use thiserror::Error;

const HIST_SIZE: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,
    #[error("image {width}x{height} is smaller than the {tiles}x{tiles} tile grid")]
    TooSmallForTiles { width: u32, height: u32, tiles: u32 },
    #[error("region {region:?} lies outside the {width}x{height} image")]
    RegionOutOfBounds {
        region: FaceRegion,
        width: u32,
        height: u32,
    },
}

/// Map an out-of-range index back into `0..len` by reflect-101.
fn reflect101(index: i64, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as i64 - 1;
    let mut i = index;
    while i < 0 || i > last {
        if i < 0 {
            i = -i;
        }
        if i > last {
            i = 2 * last - i;
        }
    }
    i as usize
}

fn ensure_non_empty(img: &GrayImage) -> Result<(), ImageError> {
    if img.width() == 0 || img.height() == 0 {
        Err(ImageError::Empty)
    } else {
        Ok(())
    }
}

/// Copy `region` out of `img`.
pub fn crop(img: &GrayImage, region: &FaceRegion) -> Result<GrayImage, ImageError> {
    if !region.fits_within(img.width(), img.height()) {
        return Err(ImageError::RegionOutOfBounds {
            region: *region,
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(image::imageops::crop_imm(img, region.x, region.y, region.width, region.height).to_image())
}

/// Resize with bilinear interpolation, sampling at pixel centres.
pub fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> Result<GrayImage, ImageError> {
    ensure_non_empty(src)?;
    if new_w == 0 || new_h == 0 {
        return Err(ImageError::Empty);
    }

    let width = src.width() as usize;
    let height = src.height() as usize;
    let frame = src.as_raw();
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w as usize * new_h as usize];
    for y in 0..new_h as usize {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);
        let fy = if src_y < 0.0 { 0.0 } else { fy };

        for x in 0..new_w as usize {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);
            let fx = if src_x < 0.0 { 0.0 } else { fx };

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w as usize + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_w, new_h, resized).ok_or(ImageError::Empty)
}

/// Global histogram equalization.
///
/// The first occupied intensity maps to 0 and the cumulative histogram is
/// stretched over the remaining range. A single-valued image is returned
/// unchanged.
pub fn equalize_hist(src: &GrayImage) -> Result<GrayImage, ImageError> {
    ensure_non_empty(src)?;
    let total = src.as_raw().len() as u64;

    let mut hist = [0u64; HIST_SIZE];
    for &p in src.as_raw() {
        hist[p as usize] += 1;
    }

    let first = hist.iter().position(|&c| c > 0).unwrap_or(0);
    if hist[first] == total {
        return Ok(src.clone());
    }

    let scale = (HIST_SIZE - 1) as f32 / (total - hist[first]) as f32;
    let mut lut = [0u8; HIST_SIZE];
    let mut sum = 0u64;
    for i in first + 1..HIST_SIZE {
        sum += hist[i];
        lut[i] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    let data = src.as_raw().iter().map(|&p| lut[p as usize]).collect();
    GrayImage::from_raw(src.width(), src.height(), data).ok_or(ImageError::Empty)
}

/// Contrast-Limited Adaptive Histogram Equalization over a `tiles` × `tiles`
/// grid.
///
/// `clip_limit` is a multiple of the uniform bin height: each tile histogram
/// is clipped at `max(1, clip_limit · tile_pixels / 256)` and the excess is
/// spread evenly. When the image does not divide into whole tiles it is
/// virtually extended by reflection so every tile has the same size. Output
/// pixels blend the four nearest tile mappings bilinearly.
pub fn clahe(src: &GrayImage, clip_limit: f32, tiles: u32) -> Result<GrayImage, ImageError> {
    ensure_non_empty(src)?;
    let w = src.width() as usize;
    let h = src.height() as usize;
    let t = tiles as usize;
    if t == 0 || w < t || h < t {
        return Err(ImageError::TooSmallForTiles {
            width: src.width(),
            height: src.height(),
            tiles,
        });
    }

    let gray = src.as_raw();
    let tile_w = w.div_ceil(t);
    let tile_h = h.div_ceil(t);
    let tile_pixels = tile_w * tile_h;

    let clip = if clip_limit > 0.0 {
        ((clip_limit * tile_pixels as f32 / HIST_SIZE as f32) as u32).max(1)
    } else {
        u32::MAX
    };
    let lut_scale = (HIST_SIZE - 1) as f32 / tile_pixels as f32;

    // Per-tile lookup tables
    let mut luts: Vec<[u8; HIST_SIZE]> = Vec::with_capacity(t * t);

    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; HIST_SIZE];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                let sy = reflect101(y as i64, h);
                for x in x0..x0 + tile_w {
                    let sx = reflect101(x as i64, w);
                    hist[gray[sy * w + sx] as usize] += 1;
                }
            }

            // Clip histogram
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / HIST_SIZE as u32;
            let mut residual = (excess % HIST_SIZE as u32) as usize;
            for bin in hist.iter_mut() {
                *bin += redist;
            }
            if residual > 0 {
                let step = (HIST_SIZE / residual).max(1);
                let mut i = 0;
                while i < HIST_SIZE && residual > 0 {
                    hist[i] += 1;
                    residual -= 1;
                    i += step;
                }
            }

            let mut lut = [0u8; HIST_SIZE];
            let mut sum = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                sum += count;
                lut[i] = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    // Map each pixel using bilinear interpolation between tile LUTs
    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;
    let mut out = vec![0u8; w * h];

    for y in 0..h {
        let fy = y as f32 * inv_th - 0.5;
        let r0 = fy.floor() as i32;
        let dy = fy - r0 as f32;
        let r1 = ((r0 + 1).max(0) as usize).min(t - 1);
        let r0 = (r0.max(0) as usize).min(t - 1);

        for x in 0..w {
            let pixel = gray[y * w + x] as usize;

            let fx = x as f32 * inv_tw - 0.5;
            let c0 = fx.floor() as i32;
            let dx = fx - c0 as f32;
            let c1 = ((c0 + 1).max(0) as usize).min(t - 1);
            let c0 = (c0.max(0) as usize).min(t - 1);

            let tl = luts[r0 * t + c0][pixel] as f32;
            let tr = luts[r0 * t + c1][pixel] as f32;
            let bl = luts[r1 * t + c0][pixel] as f32;
            let br = luts[r1 * t + c1][pixel] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            out[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(src.width(), src.height(), out).ok_or(ImageError::Empty)
}

/// 3×3 Gaussian smoothing with the `[1/4, 1/2, 1/4]` kernel in each axis.
pub fn gaussian_blur_3x3(src: &GrayImage) -> Result<GrayImage, ImageError> {
    const KERNEL: [f32; 3] = [0.25, 0.5, 0.25];

    ensure_non_empty(src)?;
    let w = src.width() as usize;
    let h = src.height() as usize;
    let gray = src.as_raw();

    let mut horizontal = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                let sx = reflect101(x as i64 + k as i64 - 1, w);
                acc += weight * gray[y * w + sx] as f32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                let sy = reflect101(y as i64 + k as i64 - 1, h);
                acc += weight * horizontal[sy * w + x];
            }
            out[y * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(src.width(), src.height(), out).ok_or(ImageError::Empty)
}

/// Per-pixel first derivatives of an image.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub width: usize,
    pub height: usize,
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
}

impl Gradients {
    /// Euclidean norm of `(dx, dy)` per pixel.
    pub fn magnitude(&self) -> Vec<f64> {
        self.dx
            .iter()
            .zip(&self.dy)
            .map(|(gx, gy)| (gx * gx + gy * gy).sqrt())
            .collect()
    }

    /// `atan2(dy, dx)` per pixel, in radians.
    pub fn direction(&self) -> Vec<f64> {
        self.dx.iter().zip(&self.dy).map(|(gx, gy)| gy.atan2(*gx)).collect()
    }
}

/// 3×3 Sobel derivatives in x and y.
///
/// `dx` uses `[-1 0 1]` along rows smoothed by `[1 2 1]` along columns;
/// `dy` is the transpose. Positive `dx` means intensity rising to the right.
pub fn sobel(src: &GrayImage) -> Result<Gradients, ImageError> {
    const DERIV: [f64; 3] = [-1.0, 0.0, 1.0];
    const SMOOTH: [f64; 3] = [1.0, 2.0, 1.0];

    ensure_non_empty(src)?;
    let w = src.width() as usize;
    let h = src.height() as usize;
    let gray = src.as_raw();

    let mut dx = vec![0f64; w * h];
    let mut dy = vec![0f64; w * h];

    for y in 0..h {
        for x in 0..w {
            let mut gx = 0.0;
            let mut gy = 0.0;
            for (j, (&smooth_y, &deriv_y)) in SMOOTH.iter().zip(&DERIV).enumerate() {
                let sy = reflect101(y as i64 + j as i64 - 1, h);
                for (i, (&deriv_x, &smooth_x)) in DERIV.iter().zip(&SMOOTH).enumerate() {
                    let sx = reflect101(x as i64 + i as i64 - 1, w);
                    let p = gray[sy * w + sx] as f64;
                    gx += deriv_x * smooth_y * p;
                    gy += smooth_x * deriv_y * p;
                }
            }
            dx[y * w + x] = gx;
            dy[y * w + x] = gy;
        }
    }

    Ok(Gradients {
        width: w,
        height: h,
        dx,
        dy,
    })
}

/// Summed-area tables over an image: plain sum, squared sum and (optionally)
/// the 45°-rotated sum used by tilted Haar features.
///
/// Tables are `(width + 1) × (height + 1)`; entry `(x, y)` covers all pixels
/// strictly above and left of it. The tilted entry `(x, y)` covers the
/// upward-opening triangle with apex at pixel `(x - 1, y - 1)`.
pub struct IntegralImages {
    width: usize,
    height: usize,
    stride: usize,
    sum: Vec<i64>,
    sqsum: Vec<i64>,
    tilted: Option<Vec<i64>>,
}

impl IntegralImages {
    pub fn new(src: &GrayImage, with_tilted: bool) -> Self {
        let w = src.width() as usize;
        let h = src.height() as usize;
        let stride = w + 1;
        let gray = src.as_raw();

        let mut sum = vec![0i64; stride * (h + 1)];
        let mut sqsum = vec![0i64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0i64;
            let mut row_sq = 0i64;
            for x in 0..w {
                let p = gray[y * w + x] as i64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }

        let tilted = with_tilted.then(|| tilted_table(gray, w, h));

        Self {
            width: w,
            height: h,
            stride,
            sum,
            sqsum,
            tilted,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    fn rect(table: &[i64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> i64 {
        table[y * stride + x] - table[y * stride + x + w] - table[(y + h) * stride + x]
            + table[(y + h) * stride + x + w]
    }

    /// Sum of pixels in the upright rectangle. The rectangle must lie inside
    /// the image.
    #[inline]
    pub fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixels in the upright rectangle.
    #[inline]
    pub fn rect_sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }

    /// Sum over a 45°-rotated rectangle whose top corner is `(x, y)`.
    ///
    /// Returns 0 when the table was built without tilted support.
    #[inline]
    pub fn tilted_sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        let Some(t) = self.tilted.as_deref() else {
            return 0;
        };
        let s = self.stride;
        t[y * s + x] - t[(y + h) * s + x - h] - t[(y + w) * s + x + w]
            + t[(y + w + h) * s + x + w - h]
    }
}

/// Rotated summed-area table.
///
/// `T(x, y) = T(x-1, y-1) + T(x+1, y-1) - T(x, y-2) + I(x-1, y-1) + I(x-1, y-2)`.
/// The recurrence reaches one column further out per row, so rows are
/// evaluated over a band widened by `h` columns on each side and only the
/// image columns are kept.
fn tilted_table(gray: &[u8], w: usize, h: usize) -> Vec<i64> {
    let stride = w + 1;
    let pad = h;
    let ext = stride + 2 * pad;
    let pixel = |x: i64, y: i64| -> i64 {
        if x >= 0 && (x as usize) < w && y >= 0 && (y as usize) < h {
            gray[y as usize * w + x as usize] as i64
        } else {
            0
        }
    };

    let mut out = vec![0i64; stride * (h + 1)];
    let mut prev2 = vec![0i64; ext];
    let mut prev1 = vec![0i64; ext];
    let mut cur = vec![0i64; ext];

    for y in 1..=h {
        for k in 0..ext {
            let x = k as i64 - pad as i64;
            let left = if k > 0 { prev1[k - 1] } else { 0 };
            let right = if k + 1 < ext { prev1[k + 1] } else { 0 };
            cur[k] = left + right - prev2[k] + pixel(x - 1, y as i64 - 1) + pixel(x - 1, y as i64 - 2);
        }
        out[y * stride..(y + 1) * stride].copy_from_slice(&cur[pad..pad + stride]);
        std::mem::swap(&mut prev2, &mut prev1);
        std::mem::swap(&mut prev1, &mut cur);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 5), 3);
        assert_eq!(reflect101(-1, 1), 0);
        assert_eq!(reflect101(-1, 2), 1);
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let img = GrayImage::new(10, 10);
        assert!(crop(&img, &FaceRegion::new(5, 5, 6, 2)).is_err());
        let c = crop(&img, &FaceRegion::new(5, 5, 5, 2)).unwrap();
        assert_eq!(c.dimensions(), (5, 2));
    }

    #[test]
    fn test_bilinear_resize_uniform() {
        let img = GrayImage::from_pixel(100, 100, image::Luma([128]));
        let resized = resize_bilinear(&img, 200, 37).unwrap();
        assert_eq!(resized.dimensions(), (200, 37));
        assert!(resized.as_raw().iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }

    #[test]
    fn test_bilinear_resize_identity() {
        let img = GrayImage::from_fn(17, 9, |x, y| image::Luma([(x * 13 + y * 7) as u8]));
        let resized = resize_bilinear(&img, 17, 9).unwrap();
        assert_eq!(resized, img);
    }

    #[test]
    fn test_bilinear_resize_empty_target() {
        let img = GrayImage::new(4, 4);
        assert_eq!(resize_bilinear(&img, 0, 4), Err(ImageError::Empty));
    }

    #[test]
    fn test_equalize_stretches_range() {
        let img = GrayImage::from_fn(16, 16, |x, _| image::Luma([100 + (x % 8) as u8]));
        let eq = equalize_hist(&img).unwrap();
        let min = *eq.as_raw().iter().min().unwrap();
        let max = *eq.as_raw().iter().max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_equalize_constant_image_unchanged() {
        let img = GrayImage::from_pixel(8, 8, image::Luma([77]));
        assert_eq!(equalize_hist(&img).unwrap(), img);
    }

    #[test]
    fn test_clahe_increases_contrast() {
        // Low-contrast 16x16 image: all pixels between 100–110
        let mut img = GrayImage::new(16, 16);
        for (i, p) in img.pixels_mut().enumerate() {
            p.0[0] = 100 + (i % 11) as u8;
        }

        let orig_stddev = stddev(img.as_raw());
        let out = clahe(&img, 2.0, 2).unwrap();
        let new_stddev = stddev(out.as_raw());

        assert!(
            new_stddev > orig_stddev,
            "CLAHE should increase contrast: orig={orig_stddev:.2}, new={new_stddev:.2}"
        );
    }

    #[test]
    fn test_clahe_non_divisible_size() {
        let img = GrayImage::from_fn(100, 100, |x, y| image::Luma([((x * 3 + y) % 256) as u8]));
        let out = clahe(&img, 2.0, 8).unwrap();
        assert_eq!(out.dimensions(), (100, 100));
    }

    #[test]
    fn test_clahe_too_small() {
        let img = GrayImage::new(5, 20);
        assert!(matches!(
            clahe(&img, 2.0, 8),
            Err(ImageError::TooSmallForTiles { .. })
        ));
    }

    #[test]
    fn test_blur_uniform_unchanged() {
        let img = GrayImage::from_pixel(9, 7, image::Luma([200]));
        assert_eq!(gaussian_blur_3x3(&img).unwrap(), img);
    }

    #[test]
    fn test_blur_smooths_impulse() {
        let mut img = GrayImage::new(5, 5);
        img.put_pixel(2, 2, image::Luma([160]));
        let out = gaussian_blur_3x3(&img).unwrap();
        assert_eq!(out.get_pixel(2, 2).0[0], 40);
        assert_eq!(out.get_pixel(1, 2).0[0], 20);
        assert_eq!(out.get_pixel(1, 1).0[0], 10);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_sobel_vertical_edge() {
        // Left half = 0, right half = 100
        let img = GrayImage::from_fn(20, 10, |x, _| image::Luma([if x >= 10 { 100 } else { 0 }]));
        let g = sobel(&img).unwrap();
        // Across the step: (100 - 0) * (1 + 2 + 1)
        assert_eq!(g.dx[5 * 20 + 10], 400.0);
        assert_eq!(g.dx[5 * 20 + 9], 400.0);
        assert_eq!(g.dx[5 * 20 + 3], 0.0);
        assert!(g.dy.iter().all(|&v| v == 0.0));
        let mag = g.magnitude();
        assert_eq!(mag[5 * 20 + 10], 400.0);
        assert_eq!(g.direction()[5 * 20 + 10], 0.0);
    }

    #[test]
    fn test_sobel_empty() {
        assert!(sobel(&GrayImage::new(0, 3)).is_err());
    }

    #[test]
    fn test_integral_rect_sum() {
        let img = GrayImage::from_fn(6, 5, |x, y| image::Luma([(x + 10 * y) as u8]));
        let ii = IntegralImages::new(&img, false);
        let mut expected = 0i64;
        let mut expected_sq = 0i64;
        for y in 1..4 {
            for x in 2..5 {
                let p = (x + 10 * y) as i64;
                expected += p;
                expected_sq += p * p;
            }
        }
        assert_eq!(ii.rect_sum(2, 1, 3, 3), expected);
        assert_eq!(ii.rect_sqsum(2, 1, 3, 3), expected_sq);
        assert_eq!(ii.rect_sum(0, 0, 6, 5), img.as_raw().iter().map(|&p| p as i64).sum::<i64>());
    }

    #[test]
    fn test_tilted_table_matches_definition() {
        let (w, h) = (7usize, 6usize);
        let img = GrayImage::from_fn(w as u32, h as u32, |x, y| {
            image::Luma([((x * 31 + y * 17) % 50) as u8])
        });
        let ii = IntegralImages::new(&img, true);
        let t = ii.tilted.as_ref().unwrap();

        for ty in 0..=h as i64 {
            for tx in 0..=w as i64 {
                let mut expected = 0i64;
                for y in 0..ty {
                    for x in 0..w as i64 {
                        if (x - tx + 1).abs() <= ty - y - 1 {
                            expected += img.get_pixel(x as u32, y as u32).0[0] as i64;
                        }
                    }
                }
                assert_eq!(
                    t[ty as usize * (w + 1) + tx as usize],
                    expected,
                    "tilted mismatch at ({tx}, {ty})"
                );
            }
        }
    }

    #[test]
    fn test_tilted_sum_uniform() {
        // A tilted w=2, h=2 rectangle on a uniform image covers 2*w*h pixels.
        let img = GrayImage::from_pixel(12, 12, image::Luma([1]));
        let ii = IntegralImages::new(&img, true);
        assert_eq!(ii.tilted_sum(5, 2, 2, 2), 8);
    }
}
