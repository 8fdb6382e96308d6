// Segment storage abstraction
//
// Backends:
// - FileStorage: flat directory of finished segments (default, one per device)
// - MemoryStorage: in-process map (tests, diskless deployments)
//
// The storage layer is a plain key-value store. Windowing and playlist
// rendering live in `hls::store`.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Result;
use std::sync::Arc;
use std::time::Duration;

/// Backing store for finished segments.
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    /// Write data under `key`, replacing any previous value.
    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read data, or a `NotFound` error.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Delete a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Writes with exponential backoff on transient I/O errors.
pub async fn write_with_retry(
    storage: &Arc<dyn SegmentStorage>,
    key: &str,
    data: Bytes,
) -> Result<()> {
    use backon::{BackoffBuilder, ExponentialBuilder};

    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
        .build();

    let mut last_err = None;
    for delay in std::iter::once(Duration::ZERO).chain(backoff) {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        match storage.write(key, data.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if !is_transient_error(&e) {
                    return Err(e);
                }
                tracing::warn!(key = %key, error = %e, "Segment write failed, retrying");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| std::io::Error::other("segment write retries exhausted")))
}

fn is_transient_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ResourceBusy
    )
}

pub use file::FileStorage;
pub use memory::MemoryStorage;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyStorage {
        failures_left: AtomicUsize,
        kind: ErrorKind,
        inner: MemoryStorage,
    }

    #[async_trait]
    impl SegmentStorage for FlakyStorage {
        async fn write(&self, key: &str, data: Bytes) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::new(self.kind, "injected"));
            }
            self.inner.write(key, data).await
        }

        async fn read(&self, key: &str) -> Result<Bytes> {
            self.inner.read(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_is_retried() {
        let storage: Arc<dyn SegmentStorage> = Arc::new(FlakyStorage {
            failures_left: AtomicUsize::new(2),
            kind: ErrorKind::TimedOut,
            inner: MemoryStorage::new(),
        });

        write_with_retry(&storage, "segment0", Bytes::from_static(b"ts"))
            .await
            .unwrap();
        assert_eq!(storage.read("segment0").await.unwrap(), Bytes::from_static(b"ts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_write_error_is_not_retried() {
        let storage: Arc<dyn SegmentStorage> = Arc::new(FlakyStorage {
            failures_left: AtomicUsize::new(1),
            kind: ErrorKind::PermissionDenied,
            inner: MemoryStorage::new(),
        });

        let err = write_with_retry(&storage, "segment0", Bytes::from_static(b"ts"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!storage.exists("segment0").await.unwrap());
    }
}
