// File system storage backend
//
// Keys map to `<base>/<key>.ts`. Writes go through a temporary sibling and a
// rename so a concurrent reader never observes a partial segment.

use super::SegmentStorage;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;
use tokio::fs;

/// Keys are restricted to a flat, traversal-free alphabet.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// File system storage backend
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn get_path(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid storage key: {key}"),
            ));
        }
        Ok(self.base_path.join(format!("{key}.ts")))
    }
}

#[async_trait]
impl SegmentStorage for FileStorage {
    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let file_path = self.get_path(key)?;
        let tmp_path = file_path.with_extension("ts.part");
        let size = data.len();

        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &file_path).await?;

        tracing::trace!("Wrote: {:?} ({} bytes)", file_path, size);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let file_path = self.get_path(key)?;
        let data = fs::read(&file_path).await?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let file_path = self.get_path(key)?;
        match fs::remove_file(&file_path).await {
            Ok(()) => {
                tracing::trace!("Deleted: {:?}", file_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let file_path = self.get_path(key)?;
        fs::try_exists(&file_path).await
    }
}
