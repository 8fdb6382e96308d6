// Per-device segment writer
//
// One loop per streaming device. It waits for the video track (mandatory)
// and, for a bounded grace period, the audio track. It then cuts the queued
// frames into fixed-duration MPEG-TS segments. Every segment gets fresh
// encoders, so each one opens on a keyframe.
//
// Timestamps come from frame and sample counters, never from arrival time.

use crate::codec::{
    AudioCodec, AudioEncoder, AudioFrame, EncodedPacket, EncoderFactory, VideoEncoder, VideoFrame,
    VideoProfile,
};
use crate::config::{HlsConfig, MediaConfig};
use crate::error::MediaError;
use crate::queue::{FrameQueue, OverflowPolicy};
use crate::types::DeviceId;
use camrelay_hls::hls::segment_key;
use camrelay_hls::storage::write_with_retry;
use camrelay_hls::{PlaylistBuilder, SegmentStorage, TsMuxer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long opening a segment waits for its first frame.
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(1);
/// Idle back-off when neither queue had a frame.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// State shared between a device's track feeders and its segment writer.
#[derive(Debug)]
pub struct MuxerShared {
    device_id: DeviceId,
    pub video: FrameQueue<VideoFrame>,
    pub audio: FrameQueue<AudioFrame>,
    video_ready: AtomicBool,
    audio_ready: AtomicBool,
    audio_failed: AtomicBool,
    segments_written: AtomicU64,
    flags: Notify,
}

impl MuxerShared {
    #[must_use]
    pub fn new(device_id: DeviceId, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            device_id,
            video: FrameQueue::new(capacity, policy),
            audio: FrameQueue::new(capacity, policy),
            video_ready: AtomicBool::new(false),
            audio_ready: AtomicBool::new(false),
            audio_failed: AtomicBool::new(false),
            segments_written: AtomicU64::new(0),
            flags: Notify::new(),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn mark_video_ready(&self) {
        self.video_ready.store(true, Ordering::Release);
        self.flags.notify_waiters();
    }

    pub fn mark_audio_ready(&self) {
        self.audio_ready.store(true, Ordering::Release);
        self.flags.notify_waiters();
    }

    /// Disables the audio leg for the rest of the device's lifetime.
    pub fn mark_audio_failed(&self) {
        if !self.audio_failed.swap(true, Ordering::AcqRel) {
            warn!(device_id = %self.device_id, "Audio permanently failed, continuing video-only");
            self.audio.clear();
        }
        self.flags.notify_waiters();
    }

    #[must_use]
    pub fn video_ready(&self) -> bool {
        self.video_ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn audio_ready(&self) -> bool {
        self.audio_ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn audio_failed(&self) -> bool {
        self.audio_failed.load(Ordering::Acquire)
    }

    /// Audio is worth muxing.
    #[must_use]
    pub fn audio_usable(&self) -> bool {
        self.audio_ready() && !self.audio_failed()
    }

    /// Segments handed to the store so far.
    #[must_use]
    pub fn segments_written(&self) -> u64 {
        self.segments_written.load(Ordering::Relaxed)
    }

    async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.flags.notified();
            if condition(self) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition(self);
            }
        }
    }
}

/// Fixed encoding and timing parameters of a device's segments.
#[derive(Debug, Clone, Copy)]
pub struct MuxerSettings {
    pub segment_duration: Duration,
    pub frame_rate: u32,
    pub keyframe_interval: u32,
    pub video_bitrate_bps: u32,
    pub track_wait: Duration,
    pub audio_grace: Duration,
}

impl MuxerSettings {
    #[must_use]
    pub fn from_config(hls: &HlsConfig, media: &MediaConfig) -> Self {
        Self {
            segment_duration: hls.segment_duration(),
            frame_rate: hls.frame_rate,
            keyframe_interval: hls.keyframe_interval(),
            video_bitrate_bps: hls.video_bitrate_bps,
            track_wait: media.track_wait(),
            audio_grace: media.audio_grace(),
        }
    }

    #[must_use]
    pub fn video_pts_step(&self) -> u64 {
        90_000 / u64::from(self.frame_rate.max(1))
    }
}

struct AudioLeg {
    pid: u16,
    encoder: Box<dyn AudioEncoder>,
    sample_rate: u32,
}

/// The segment currently being written.
struct OpenSegment {
    ts: TsMuxer,
    video_pid: u16,
    video: Box<dyn VideoEncoder>,
    audio: Option<AudioLeg>,
    opened_at: Instant,
    video_packets: usize,
}

/// Cuts a device's queued frames into segments and rotates its playlist.
pub struct SegmentWriter {
    shared: Arc<MuxerShared>,
    factory: Arc<dyn EncoderFactory>,
    storage: Arc<dyn SegmentStorage>,
    builder: PlaylistBuilder,
    settings: MuxerSettings,
    index: u64,
    video_pts: u64,
    audio_samples: u64,
    open: Option<OpenSegment>,
}

impl SegmentWriter {
    pub fn new(
        shared: Arc<MuxerShared>,
        factory: Arc<dyn EncoderFactory>,
        storage: Arc<dyn SegmentStorage>,
        builder: PlaylistBuilder,
        settings: MuxerSettings,
    ) -> Self {
        Self {
            shared,
            factory,
            storage,
            builder,
            settings,
            index: 0,
            video_pts: 0,
            audio_samples: 0,
            open: None,
        }
    }

    /// Runs until the video leg cannot be served. Never returns early on
    /// per-frame errors.
    pub async fn run(mut self) {
        let device_id = self.shared.device_id().clone();

        if !self
            .shared
            .wait_for(self.settings.track_wait, MuxerShared::video_ready)
            .await
        {
            warn!(device_id = %device_id, "No video track arrived, muxer not started");
            return;
        }
        if !self
            .shared
            .wait_for(self.settings.audio_grace, |s| s.audio_ready() || s.audio_failed())
            .await
        {
            info!(device_id = %device_id, "No audio track, streaming video-only");
        }

        info!(device_id = %device_id, "Segment writer started");
        loop {
            if self.open.is_none() {
                match self.open_segment().await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        error!(device_id = %device_id, error = %e, "Cannot encode video, muxer stopped");
                        return;
                    }
                }
            }

            let elapsed = self
                .open
                .as_ref()
                .map_or(Duration::ZERO, |segment| segment.opened_at.elapsed());
            if elapsed >= self.settings.segment_duration {
                self.close_segment().await;
                continue;
            }

            if !self.mux_pending() {
                tokio::select! {
                    () = self.shared.video.notified() => {}
                    () = tokio::time::sleep(IDLE_WAIT) => {}
                }
            }
        }
    }

    /// Opens the next segment once a video frame is available.
    ///
    /// `Ok(false)` means no frame turned up yet. An error means no video
    /// encoder can be built, which ends the device's muxer.
    async fn open_segment(&mut self) -> Result<bool, MediaError> {
        if !self.shared.video.wait_non_empty(FIRST_FRAME_WAIT).await {
            return Ok(false);
        }
        let Some((width, height)) = self.shared.video.peek_with(|f| (f.width, f.height)) else {
            return Ok(false);
        };

        let profile = VideoProfile {
            width,
            height,
            frame_rate: self.settings.frame_rate,
            keyframe_interval: self.settings.keyframe_interval,
            bitrate_bps: self.settings.video_bitrate_bps,
        };
        let video = self.factory.video_encoder(&profile)?;
        let mut ts = TsMuxer::new();
        let video_pid = ts.add_stream(camrelay_hls::StreamCodec::H264)?;

        let audio = if self.shared.audio_usable() {
            open_audio_leg(&self.shared, self.factory.as_ref(), &mut ts).await
        } else {
            self.shared.audio.clear();
            None
        };

        debug!(
            device_id = %self.shared.device_id(),
            index = self.index,
            width,
            height,
            audio = audio.is_some(),
            "Segment opened"
        );
        self.open = Some(OpenSegment {
            ts,
            video_pid,
            video,
            audio,
            opened_at: Instant::now(),
            video_packets: 0,
        });
        Ok(true)
    }

    /// Encodes at most one queued frame per leg. Returns whether any frame
    /// was taken.
    fn mux_pending(&mut self) -> bool {
        let Some(segment) = self.open.as_mut() else {
            return false;
        };
        let device_id = &self.shared.device_id;
        let mut progressed = false;

        if let Some(frame) = self.shared.video.pop() {
            progressed = true;
            let pts = self.video_pts;
            self.video_pts += self.settings.video_pts_step();
            match segment.video.encode(&frame, pts) {
                Ok(packets) => segment.video_packets += mux_video(segment, &packets, device_id),
                Err(e) => warn!(device_id = %device_id, error = %e, "Video frame encode failed"),
            }
        }

        if segment.audio.is_some() && self.shared.audio_failed() {
            segment.audio = None;
        }
        if let Some(leg) = segment.audio.as_mut() {
            if let Some(frame) = self.shared.audio.pop() {
                progressed = true;
                let pts = self.audio_samples;
                self.audio_samples += frame.samples_per_channel() as u64;
                match leg.encoder.encode(&frame, pts) {
                    Ok(packets) => mux_audio(&mut segment.ts, leg, &packets, device_id),
                    Err(e) => warn!(device_id = %device_id, error = %e, "Audio frame encode failed"),
                }
            }
        } else if self.shared.audio.pop().is_some() {
            // nothing consumes audio until the next segment opens
            progressed = true;
        }

        progressed
    }

    /// Drains the encoders and hands the finished segment to the store.
    async fn close_segment(&mut self) {
        let Some(mut segment) = self.open.take() else {
            return;
        };
        let device_id = self.shared.device_id().clone();

        match segment.video.flush() {
            Ok(packets) => segment.video_packets += mux_video(&mut segment, &packets, &device_id),
            Err(e) => warn!(device_id = %device_id, error = %e, "Video encoder flush failed"),
        }
        if let Some(leg) = segment.audio.as_mut() {
            match leg.encoder.flush() {
                Ok(packets) => mux_audio(&mut segment.ts, leg, &packets, &device_id),
                Err(e) => warn!(device_id = %device_id, error = %e, "Audio encoder flush failed"),
            }
        }

        if segment.video_packets == 0 {
            debug!(device_id = %device_id, index = self.index, "Discarding segment without video");
            return;
        }

        let data = segment.ts.finish();
        let size = data.len();
        if let Err(e) = write_with_retry(&self.storage, &segment_key(self.index), data).await {
            error!(device_id = %device_id, index = self.index, error = %e, "Failed to store segment");
        }

        self.index += 1;
        let rotated = self.builder.rotate(self.index).await;
        self.shared.segments_written.fetch_add(1, Ordering::Relaxed);
        match rotated {
            Ok(rotation) => debug!(
                device_id = %device_id,
                index = self.index - 1,
                size,
                media_sequence = rotation.media_sequence,
                "Segment closed"
            ),
            Err(e) => error!(device_id = %device_id, error = %e, "Playlist rotation failed"),
        }
    }
}

async fn open_audio_leg(
    shared: &MuxerShared,
    factory: &dyn EncoderFactory,
    ts: &mut TsMuxer,
) -> Option<AudioLeg> {
    if !shared.audio.wait_non_empty(FIRST_FRAME_WAIT).await {
        return None;
    }
    let (channels, sample_rate) = shared.audio.peek_with(|f| (f.channels, f.sample_rate))?;

    for codec in AudioCodec::FALLBACK_ORDER {
        let encoder = match factory.audio_encoder(codec, channels, sample_rate) {
            Ok(encoder) => encoder,
            Err(e) => {
                debug!(device_id = %shared.device_id(), ?codec, error = %e, "Audio codec unavailable");
                continue;
            }
        };
        match ts.add_stream(encoder.stream_codec()) {
            Ok(pid) => {
                return Some(AudioLeg {
                    pid,
                    encoder,
                    sample_rate,
                })
            }
            Err(e) => {
                debug!(device_id = %shared.device_id(), ?codec, error = %e, "Audio stream rejected");
            }
        }
    }

    shared.mark_audio_failed();
    None
}

fn mux_video(segment: &mut OpenSegment, packets: &[EncodedPacket], device_id: &DeviceId) -> usize {
    let mut written = 0;
    for packet in packets {
        match segment.ts.write_frame(
            segment.video_pid,
            packet.pts,
            packet.pts,
            packet.keyframe,
            &packet.data,
        ) {
            Ok(()) => written += 1,
            Err(e) => warn!(device_id = %device_id, error = %e, "Video packet mux failed"),
        }
    }
    written
}

fn mux_audio(ts: &mut TsMuxer, leg: &AudioLeg, packets: &[EncodedPacket], device_id: &DeviceId) {
    let rate = u64::from(leg.sample_rate.max(1));
    for packet in packets {
        let pts = packet.pts * 90_000 / rate;
        if let Err(e) = ts.write_frame(leg.pid, pts, pts, false, &packet.data) {
            warn!(device_id = %device_id, error = %e, "Audio packet mux failed");
        }
    }
}
