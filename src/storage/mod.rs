//! Image storage capability
//!
//! Result images are written through [`ImageStore`]; request images (uploads
//! and chat history) are read back by locator before an edit.

pub mod local;

pub use local::LocalImageStore;

use async_trait::async_trait;
use thiserror::Error;

/// Where a stored image ended up, in the shape the success response needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// Relative key, `{prefix}/{file_name}`
    pub locator: String,
    /// File name with extension
    pub file_name: String,
    /// File name without extension
    pub image_name: String,
    pub extension: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Image not found: {0}")]
    NotFound(String),
    #[error("Invalid locator '{0}'")]
    InvalidLocator(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put_image(&self, bytes: Vec<u8>, content_type: &str)
        -> Result<StoredImage, StorageError>;

    /// Returns the bytes and their content type
    async fn get_image(&self, locator: &str) -> Result<(Vec<u8>, String), StorageError>;
}

/// Content type inferred from a locator's extension
pub fn content_type_for(locator: &str) -> &'static str {
    let extension = locator
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// Extension for a content type, used when naming stored results
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(content_type_for("a/b.PNG"), "image/png");
        assert_eq!(content_type_for("a/b.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a/b.webp"), "image/webp");
        assert_eq!(content_type_for("no-extension"), "image/png");
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("application/octet-stream"), "png");
    }
}
