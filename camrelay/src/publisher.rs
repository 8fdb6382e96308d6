//! Directory-backed bus publisher.
//!
//! Each topic maps to one file that always holds the latest payload, which
//! gives readers the same view a retained bus message would.

use async_trait::async_trait;
use bytes::Bytes;
use camrelay_rtc::{BusPublisher, Qos, RelayError, Result};
use std::path::{Path, PathBuf};
use tracing::trace;

pub struct DirectoryPublisher {
    dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", topic.replace('/', "_")))
    }
}

#[async_trait]
impl BusPublisher for DirectoryPublisher {
    async fn publish(&self, topic: &str, payload: Bytes, retained: bool, qos: Qos) -> Result<()> {
        let path = self.path_for(topic);
        replace_atomically(&path, &payload)
            .await
            .map_err(|e| RelayError::Publish(format!("{}: {e}", path.display())))?;
        trace!(topic, bytes = payload.len(), retained, ?qos, "Snapshot written");
        Ok(())
    }
}

/// Writes next to the target, then renames over it.
async fn replace_atomically(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, payload).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(())
}
