// Frame routing
//
// Decides what happens to a received track in the configured mode, and
// runs the per-track readers that feed a device's muxer queues.

use crate::config::{MediaConfig, SnapshotConfig, StreamingMode};
use crate::muxer::MuxerShared;
use crate::queue::PushOutcome;
use crate::snapshot::{snapshot_topic, BusPublisher, SnapshotLoop};
use crate::source::{AudioSource, VideoSource};
use crate::types::{DeviceId, SiteId, TrackKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// What to do with a received track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Encode every picture to a still and publish it.
    Snapshot,
    /// Feed the device's video queue.
    MuxVideo,
    /// Feed the device's audio queue.
    MuxAudio,
    /// No consumer in this mode.
    Ignore,
}

/// Dispatches tracks by kind and streaming mode.
#[derive(Clone)]
pub struct FrameRouter {
    mode: StreamingMode,
    media: MediaConfig,
    snapshot: SnapshotConfig,
    publisher: Arc<dyn BusPublisher>,
}

impl FrameRouter {
    pub fn new(
        mode: StreamingMode,
        media: MediaConfig,
        snapshot: SnapshotConfig,
        publisher: Arc<dyn BusPublisher>,
    ) -> Self {
        Self {
            mode,
            media,
            snapshot,
            publisher,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> StreamingMode {
        self.mode
    }

    #[must_use]
    pub const fn route(&self, kind: TrackKind) -> Route {
        match (self.mode, kind) {
            (StreamingMode::PublishToBus, TrackKind::Video) => Route::Snapshot,
            (StreamingMode::PublishToBus, TrackKind::Audio) => Route::Ignore,
            (StreamingMode::RelayToPlaylist, TrackKind::Video) => Route::MuxVideo,
            (StreamingMode::RelayToPlaylist, TrackKind::Audio) => Route::MuxAudio,
        }
    }

    #[must_use]
    pub fn snapshot_loop(&self, site_id: &SiteId, device_id: &DeviceId) -> SnapshotLoop {
        SnapshotLoop::new(
            self.publisher.clone(),
            device_id.clone(),
            snapshot_topic(&self.snapshot.topic_prefix, site_id, device_id),
            self.media.jpeg_quality,
            self.media.snapshot_quiet_failures,
        )
    }

    #[must_use]
    pub fn audio_policy(&self) -> AudioReadPolicy {
        AudioReadPolicy::from_config(&self.media)
    }

    #[must_use]
    pub const fn quiet_failures(&self) -> u32 {
        self.media.snapshot_quiet_failures
    }
}

/// Feeds decoded video into the device queue until the track ends.
pub async fn feed_video(mut source: impl VideoSource, shared: Arc<MuxerShared>, quiet_failures: u32) {
    let device_id = shared.device_id().clone();
    let mut consecutive_failures = 0u32;
    let mut frames = 0u64;

    loop {
        match source.next_frame().await {
            Ok(frame) => {
                consecutive_failures = 0;
                if frames == 0 {
                    info!(device_id = %device_id, width = frame.width, height = frame.height, "First video frame");
                    shared.mark_video_ready();
                }
                frames += 1;
                if shared.video.push(frame) != PushOutcome::Queued {
                    trace!(device_id = %device_id, "Video queue full, frame dropped");
                }
            }
            Err(e) if e.is_terminal() => break,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= quiet_failures {
                    debug!(device_id = %device_id, error = %e, "Video frame skipped");
                } else {
                    error!(device_id = %device_id, failures = consecutive_failures, error = %e, "Video frames keep failing");
                }
            }
        }
    }

    info!(device_id = %device_id, frames, dropped = shared.video.dropped(), "Video track ended");
}

/// Error budget of an audio reader.
#[derive(Debug, Clone, Copy)]
pub struct AudioReadPolicy {
    pub read_timeout: Duration,
    pub error_budget: u32,
    pub timeout_backoff: Duration,
    pub error_backoff: Duration,
}

impl AudioReadPolicy {
    #[must_use]
    pub fn from_config(media: &MediaConfig) -> Self {
        Self {
            read_timeout: media.audio_read_timeout(),
            error_budget: media.audio_error_budget.max(1),
            timeout_backoff: Duration::from_millis(500),
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Feeds decoded audio into the device queue. Stalls and errors count
/// against the budget; once it is spent the audio leg is disabled for the
/// device and the reader stops. Video is not affected.
pub async fn feed_audio(mut source: impl AudioSource, shared: Arc<MuxerShared>, policy: AudioReadPolicy) {
    let device_id = shared.device_id().clone();
    let mut consecutive_errors = 0u32;
    let mut total_errors = 0u64;

    loop {
        if shared.audio_failed() {
            break;
        }

        let backoff = match tokio::time::timeout(policy.read_timeout, source.next_frame()).await {
            Ok(Ok(frame)) => {
                consecutive_errors = 0;
                if !shared.audio_ready() {
                    info!(
                        device_id = %device_id,
                        channels = frame.channels,
                        sample_rate = frame.sample_rate,
                        "First audio frame"
                    );
                    shared.mark_audio_ready();
                }
                shared.audio.push(frame);
                continue;
            }
            Ok(Err(e)) if e.is_terminal() => {
                info!(device_id = %device_id, "Audio track ended");
                shared.mark_audio_failed();
                break;
            }
            Ok(Err(e)) => {
                total_errors += 1;
                if total_errors % 100 == 1 {
                    warn!(device_id = %device_id, total_errors, error = %e, "Audio read error");
                }
                policy.error_backoff
            }
            Err(_) => {
                total_errors += 1;
                if total_errors % 100 == 1 {
                    warn!(device_id = %device_id, total_errors, "Audio read timed out");
                }
                policy.timeout_backoff
            }
        };

        consecutive_errors += 1;
        if consecutive_errors >= policy.error_budget {
            error!(
                device_id = %device_id,
                consecutive_errors,
                "Audio error budget exhausted, disabling audio"
            );
            shared.mark_audio_failed();
            break;
        }
        tokio::time::sleep(backoff).await;
    }
}
