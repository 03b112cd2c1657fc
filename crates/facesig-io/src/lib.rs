//! facesig-io: filesystem and encoding collaborators for the core pipeline.
//!
//! Loads image files into grayscale with the checks the pipeline expects,
//! and renders face crops as base64 PNG thumbnails.

pub mod loader;
pub mod thumbnail;

pub use loader::FsImageLoader;
pub use thumbnail::PngThumbnailEncoder;
