//! Filesystem-backed image store

use super::{content_type_for, extension_for, ImageStore, StorageError, StoredImage};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Stores images under `root`, keyed by locators relative to it
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
    prefix: String,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a locator to a path under the root. A leading `/` is tolerated;
    /// parent or absolute components are not.
    fn resolve_path(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let relative = locator.trim().trim_start_matches('/');
        if relative.is_empty() {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }

        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put_image(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredImage, StorageError> {
        let image_name = Uuid::new_v4().to_string();
        let extension = extension_for(content_type).to_string();
        let file_name = format!("{image_name}.{extension}");
        let locator = if self.prefix.is_empty() {
            file_name.clone()
        } else {
            format!("{}/{file_name}", self.prefix)
        };

        let path = self.resolve_path(&locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!("Stored {} bytes at {}", bytes.len(), path.display());

        Ok(StoredImage {
            locator,
            file_name,
            image_name,
            extension,
        })
    }

    async fn get_image(&self, locator: &str) -> Result<(Vec<u8>, String), StorageError> {
        let path = self.resolve_path(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((bytes, content_type_for(locator).to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "generated");

        let stored = store
            .put_image(vec![1, 2, 3], "image/png")
            .await
            .unwrap();

        assert!(stored.locator.starts_with("generated/"));
        assert!(stored.locator.ends_with(".png"));
        assert_eq!(stored.extension, "png");
        assert_eq!(stored.file_name, format!("{}.png", stored.image_name));

        let (bytes, content_type) = store.get_image(&stored.locator).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(content_type, "image/png");
    }

    #[tokio::test]
    async fn test_leading_slash_is_tolerated() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("u")).unwrap();
        std::fs::write(dir.path().join("u/a.jpg"), b"jpeg").unwrap();
        let store = LocalImageStore::new(dir.path(), "generated");

        let (bytes, content_type) = store.get_image("/u/a.jpg").await.unwrap();
        assert_eq!(bytes, b"jpeg");
        assert_eq!(content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "generated");

        let result = store.get_image("u/missing.png").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_parent_components_are_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "generated");

        let result = store.get_image("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidLocator(_))));
        assert!(matches!(
            store.get_image("   ").await,
            Err(StorageError::InvalidLocator(_))
        ));
    }
}
