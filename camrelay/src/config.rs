use camrelay_rtc::RelayConfig;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Where published snapshots land
    pub snapshot_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        // CAMRELAY_RELAY__MODE, CAMRELAY_RELAY__HLS__PORT, ...
        builder = builder.add_source(
            Environment::with_prefix("CAMRELAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("relay.ice.stun_servers")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.relay.validate().err().unwrap_or_default();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.bridge.snapshot_dir.as_os_str().is_empty() {
            errors.push("bridge.snapshot_dir must not be empty".to_string());
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
    use camrelay_rtc::StreamingMode;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.mode, StreamingMode::PublishToBus);
        assert_eq!(config.bridge.snapshot_dir, PathBuf::from("snapshots"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camrelay.toml");
        std::fs::write(
            &path,
            r#"
[logging]
format = "json"

[relay]
mode = "go2rtc"

[relay.hls]
port = 9000
max_segments = 4
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.relay.mode, StreamingMode::RelayToPlaylist);
        assert_eq!(config.relay.hls.port, 9000);
        assert_eq!(config.relay.hls.max_segments, 4);
        assert_eq!(config.relay.hls.segment_duration_ms, 1000);
        assert_eq!(config.relay.media.queue_capacity, 30);
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default();
        config.logging.format = "xml".to_string();
        config.relay.hls.frame_rate = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }
}
