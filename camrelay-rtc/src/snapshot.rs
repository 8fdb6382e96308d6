//! Still-image path: every decoded picture becomes a retained JPEG on the bus.

use crate::codec::{encode_jpeg, VideoFrame};
use crate::error::{RelayError, Result};
use crate::source::VideoSource;
use crate::types::{DeviceId, SiteId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Delivery guarantee requested from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Message-bus publish primitive.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, retained: bool, qos: Qos) -> Result<()>;
}

#[must_use]
pub fn snapshot_topic(prefix: &str, site_id: &SiteId, device_id: &DeviceId) -> String {
    format!("{prefix}/{site_id}/{device_id}/snapshot")
}

/// Publishes snapshots for one device.
pub struct SnapshotLoop {
    publisher: Arc<dyn BusPublisher>,
    device_id: DeviceId,
    topic: String,
    quality: u8,
    quiet_failures: u32,
    consecutive_failures: u32,
    published: u64,
}

impl SnapshotLoop {
    pub fn new(
        publisher: Arc<dyn BusPublisher>,
        device_id: DeviceId,
        topic: String,
        quality: u8,
        quiet_failures: u32,
    ) -> Self {
        Self {
            publisher,
            device_id,
            topic,
            quality,
            quiet_failures,
            consecutive_failures: 0,
            published: 0,
        }
    }

    /// Pulls frames until the source ends. Per-frame failures are skipped.
    pub async fn run(mut self, mut source: impl VideoSource) -> u64 {
        info!(device_id = %self.device_id, topic = %self.topic, "Snapshot loop started");
        loop {
            let outcome = match source.next_frame().await {
                Ok(frame) => self.publish_frame(&frame).await,
                Err(e) if e.is_terminal() => break,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    self.published += 1;
                }
                Err(e) => self.record_failure(&e),
            }
        }
        info!(
            device_id = %self.device_id,
            published = self.published,
            "Snapshot loop ended"
        );
        self.published
    }

    async fn publish_frame(&self, frame: &VideoFrame) -> Result<()> {
        let jpeg = encode_jpeg(frame, self.quality)?;
        self.publisher
            .publish(&self.topic, jpeg, true, Qos::ExactlyOnce)
            .await
    }

    fn record_failure(&mut self, e: &RelayError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures <= self.quiet_failures {
            debug!(
                device_id = %self.device_id,
                failures = self.consecutive_failures,
                error = %e,
                "Snapshot frame skipped"
            );
        } else {
            error!(
                device_id = %self.device_id,
                failures = self.consecutive_failures,
                error = %e,
                "Snapshot frames keep failing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<(String, Bytes, bool, Qos)>>,
    }

    #[async_trait]
    impl BusPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Bytes, retained: bool, qos: Qos) -> Result<()> {
            self.messages
                .lock()
                .push((topic.to_string(), payload, retained, qos));
            Ok(())
        }
    }

    struct ScriptedSource {
        script: VecDeque<std::result::Result<VideoFrame, MediaError>>,
    }

    #[async_trait]
    impl VideoSource for ScriptedSource {
        async fn next_frame(&mut self) -> std::result::Result<VideoFrame, MediaError> {
            self.script.pop_front().unwrap_or(Err(MediaError::TrackEnded))
        }
    }

    #[test]
    fn test_snapshot_topic() {
        let topic = snapshot_topic("camrelay", &SiteId::from("home"), &DeviceId::from("cam1"));
        assert_eq!(topic, "camrelay/home/cam1/snapshot");
    }

    #[tokio::test]
    async fn test_failures_are_skipped_not_fatal() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut script = VecDeque::new();
        for _ in 0..15 {
            script.push_back(Err(MediaError::Decode("corrupt".to_string())));
        }
        script.push_back(Ok(VideoFrame::filled(16, 16, 90)));
        script.push_back(Err(MediaError::Decode("corrupt".to_string())));
        script.push_back(Ok(VideoFrame::filled(16, 16, 30)));

        let snapshots = SnapshotLoop::new(
            publisher.clone(),
            DeviceId::from("cam1"),
            "camrelay/home/cam1/snapshot".to_string(),
            80,
            10,
        );
        let published = snapshots.run(ScriptedSource { script }).await;

        assert_eq!(published, 2);
        let messages = publisher.messages.lock();
        assert_eq!(messages.len(), 2);
        for (topic, payload, retained, qos) in messages.iter() {
            assert_eq!(topic, "camrelay/home/cam1/snapshot");
            assert!(payload.starts_with(&[0xff, 0xd8]));
            assert!(*retained);
            assert_eq!(*qos, Qos::ExactlyOnce);
        }
    }
}
