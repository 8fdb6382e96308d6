//! Relay configuration

use crate::queue::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Where received media goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamingMode {
    /// Still snapshots published to the message bus
    #[default]
    #[serde(alias = "mqtt")]
    PublishToBus,
    /// Rolling HLS playlist served over HTTP
    #[serde(alias = "go2rtc")]
    RelayToPlaylist,
}

/// Relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: StreamingMode,
    pub hls: HlsConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub snapshot: SnapshotConfig,
}

/// Live playlist output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Nominal segment length in milliseconds
    pub segment_duration_ms: u64,
    /// Segments listed in the playlist
    pub max_segments: usize,
    /// Extra segments kept after leaving the window
    pub grace_segments: usize,
    pub frame_rate: u32,
    pub video_bitrate_bps: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8090,
            segment_duration_ms: 1000,
            max_segments: 8,
            grace_segments: 10,
            frame_rate: 30,
            video_bitrate_bps: 1_500_000,
        }
    }
}

impl HlsConfig {
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    /// Frames between keyframes, aligned to segment boundaries.
    #[must_use]
    pub fn keyframe_interval(&self) -> u32 {
        let frames = self.segment_duration_ms * u64::from(self.frame_rate) / 1000;
        u32::try_from(frames).unwrap_or(u32::MAX).max(1)
    }

    /// Fixed video timestamp step in 90 kHz units.
    #[must_use]
    pub fn video_pts_step(&self) -> u64 {
        90_000 / u64::from(self.frame_rate.max(1))
    }
}

/// Connectivity establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub gathering_timeout_ms: u64,
    pub gathering_poll_ms: u64,
    /// Watchdog polls before a stalled session is closed
    pub watchdog_checks: u32,
    pub watchdog_interval_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gathering_timeout_ms: 2000,
            gathering_poll_ms: 100,
            watchdog_checks: 20,
            watchdog_interval_ms: 1000,
        }
    }
}

impl IceConfig {
    #[must_use]
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    #[must_use]
    pub fn gathering_poll(&self) -> Duration {
        Duration::from_millis(self.gathering_poll_ms.max(1))
    }

    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Frame pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// How long a muxer waits for its video track
    pub track_wait_ms: u64,
    /// How long a muxer waits for audio before going video-only
    pub audio_grace_ms: u64,
    pub audio_read_timeout_ms: u64,
    /// Consecutive audio read errors before the leg is disabled
    pub audio_error_budget: u32,
    /// Consecutive snapshot failures logged at debug before escalating
    pub snapshot_quiet_failures: u32,
    pub jpeg_quality: u8,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            overflow: OverflowPolicy::DropOldest,
            track_wait_ms: 5000,
            audio_grace_ms: 5000,
            audio_read_timeout_ms: 2000,
            audio_error_budget: 200,
            snapshot_quiet_failures: 10,
            jpeg_quality: 85,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub fn track_wait(&self) -> Duration {
        Duration::from_millis(self.track_wait_ms)
    }

    #[must_use]
    pub fn audio_grace(&self) -> Duration {
        Duration::from_millis(self.audio_grace_ms)
    }

    #[must_use]
    pub fn audio_read_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_read_timeout_ms)
    }
}

/// Snapshot publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub topic_prefix: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "camrelay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Validate configuration, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.hls.segment_duration_ms == 0 {
            errors.push("hls.segment_duration_ms must be greater than 0".to_string());
        }
        if self.hls.frame_rate == 0 || self.hls.frame_rate > 120 {
            errors.push("hls.frame_rate must be between 1 and 120".to_string());
        }
        if self.hls.max_segments == 0 {
            errors.push("hls.max_segments must be greater than 0".to_string());
        }
        if self.media.queue_capacity == 0 {
            errors.push("media.queue_capacity must be greater than 0".to_string());
        }
        if self.media.jpeg_quality == 0 || self.media.jpeg_quality > 100 {
            errors.push("media.jpeg_quality must be between 1 and 100".to_string());
        }
        if self.ice.gathering_poll_ms == 0 {
            errors.push("ice.gathering_poll_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hls.port, 8090);
        assert_eq!(config.hls.keyframe_interval(), 30);
        assert_eq!(config.hls.video_pts_step(), 3000);
        assert_eq!(config.media.queue_capacity, 30);
    }

    #[test]
    fn test_invalid_config_reports_every_error() {
        let mut config = RelayConfig::default();
        config.hls.segment_duration_ms = 0;
        config.media.queue_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_mode_names_and_aliases() {
        let mode: StreamingMode = serde_json::from_str("\"relay-to-playlist\"").unwrap();
        assert_eq!(mode, StreamingMode::RelayToPlaylist);
        let mode: StreamingMode = serde_json::from_str("\"go2rtc\"").unwrap();
        assert_eq!(mode, StreamingMode::RelayToPlaylist);
        let mode: StreamingMode = serde_json::from_str("\"mqtt\"").unwrap();
        assert_eq!(mode, StreamingMode::PublishToBus);
    }

    #[test]
    fn test_overflow_policy_defaults_to_drop_oldest() {
        assert_eq!(MediaConfig::default().overflow, OverflowPolicy::DropOldest);

        let media: MediaConfig = serde_json::from_str(r#"{"overflow":"drop-newest"}"#).unwrap();
        assert_eq!(media.overflow, OverflowPolicy::DropNewest);
        assert_eq!(media.queue_capacity, 30);
    }

    #[test]
    fn test_keyframe_interval_follows_segment_duration() {
        let hls = HlsConfig {
            segment_duration_ms: 2000,
            frame_rate: 25,
            ..HlsConfig::default()
        };
        assert_eq!(hls.keyframe_interval(), 50);
        assert_eq!(hls.video_pts_step(), 3600);
    }
}
