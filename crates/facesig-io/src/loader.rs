//! Image file loading.

use facesig_core::{ImageSource, LoadError};
use image::GrayImage;
use std::path::Path;

/// File extensions accepted by [`FsImageLoader`], lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Images narrower or shorter than this are rejected.
pub const MIN_DIMENSION: u32 = 50;

/// Loads image files from disk as 8-bit grayscale.
///
/// Checks run in order: existence, non-zero size, extension, decode,
/// minimum dimensions.
#[derive(Debug, Clone)]
pub struct FsImageLoader {
    min_dimension: u32,
}

impl Default for FsImageLoader {
    fn default() -> Self {
        Self {
            min_dimension: MIN_DIMENSION,
        }
    }
}

impl FsImageLoader {
    pub fn new(min_dimension: u32) -> Self {
        Self { min_dimension }
    }
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl ImageSource for FsImageLoader {
    fn load_gray(&self, path: &Path) -> Result<GrayImage, LoadError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => return Err(LoadError::FileNotFound),
        };
        if metadata.len() == 0 {
            return Err(LoadError::Empty);
        }
        if !has_supported_extension(path) {
            return Err(LoadError::UnsupportedFormat);
        }

        let img = image::open(path).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "image decode failed");
            LoadError::Undecodable
        })?;

        if img.width() < self.min_dimension || img.height() < self.min_dimension {
            return Err(LoadError::TooSmall);
        }

        tracing::debug!(
            path = %path.display(),
            width = img.width(),
            height = img.height(),
            "image loaded"
        );
        Ok(img.to_luma8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("facesig-loader-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_missing_file() {
        let err = FsImageLoader::default()
            .load_gray(&scratch("does-not-exist.png"))
            .unwrap_err();
        assert_eq!(err, LoadError::FileNotFound);
    }

    #[test]
    fn test_empty_file() {
        let path = scratch("empty.png");
        std::fs::write(&path, b"").unwrap();
        let err = FsImageLoader::default().load_gray(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err, LoadError::Empty);
    }

    #[test]
    fn test_unsupported_extension() {
        let path = scratch("photo.gif");
        std::fs::write(&path, b"GIF89a").unwrap();
        let err = FsImageLoader::default().load_gray(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err, LoadError::UnsupportedFormat);
        assert_eq!(
            err.to_string(),
            "Unsupported format. Supported formats: jpg, jpeg, png, bmp"
        );
    }

    #[test]
    fn test_undecodable_contents() {
        let path = scratch("garbage.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        let err = FsImageLoader::default().load_gray(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err, LoadError::Undecodable);
    }

    #[test]
    fn test_too_small() {
        let path = scratch("small.png");
        GrayImage::from_pixel(49, 80, Luma([10])).save(&path).unwrap();
        let err = FsImageLoader::default().load_gray(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err, LoadError::TooSmall);
    }

    #[test]
    fn test_color_image_loads_as_gray() {
        let path = scratch("color.PNG");
        RgbImage::from_pixel(64, 60, Rgb([255, 255, 255])).save_with_format(&path, image::ImageFormat::Png).unwrap();
        let gray = FsImageLoader::default().load_gray(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(gray.dimensions(), (64, 60));
        assert_eq!(gray.get_pixel(10, 10)[0], 255);
    }

    #[test]
    fn test_custom_min_dimension() {
        let path = scratch("custom-min.bmp");
        GrayImage::from_pixel(30, 30, Luma([200])).save(&path).unwrap();
        let loaded = FsImageLoader::new(20).load_gray(&path);
        std::fs::remove_file(&path).ok();
        assert!(loaded.is_ok());
    }
}
