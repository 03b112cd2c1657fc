//! Face thumbnails for display.

use base64::prelude::*;
use facesig_core::ThumbnailEncoder;
use image::{GrayImage, ImageFormat};
use std::io::Cursor;

/// Encodes a face crop as PNG and then as standard base64.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngThumbnailEncoder;

impl PngThumbnailEncoder {
    pub fn encode_png(face: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
        let mut png = Vec::new();
        face.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(png)
    }
}

impl ThumbnailEncoder for PngThumbnailEncoder {
    fn encode(&self, face: &GrayImage) -> Option<String> {
        if face.width() == 0 || face.height() == 0 {
            return None;
        }
        match Self::encode_png(face) {
            Ok(png) => Some(BASE64_STANDARD.encode(png)),
            Err(e) => {
                tracing::warn!(error = %e, "thumbnail encoding failed");
                None
            }
        }
    }
}
