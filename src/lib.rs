pub mod capability;
pub mod error;
pub mod media;
pub mod params;
pub mod pipeline;
pub mod playback;
pub mod pump;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{ConfigError, PipelineError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Runtime tuning; device parameters live in the [`params`] store instead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pump: PumpConfig,
    pub playback: PlaybackConfig,
    pub buffers: BufferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Fetch timeout for encoded and raw streams
    pub fetch_timeout_ms: u64,
    /// JPEG encodes of a full sensor frame take longer
    pub photo_fetch_timeout_ms: u64,
    /// How long a stop waits for a worker before reporting a drain error
    pub drain_timeout_ms: u64,
    /// Units between fps diagnostics
    pub diag_interval: u64,
    /// Allowed relative fps deviation before warning
    pub fps_tolerance: f64,
    pub error_backoff_ms: u64,
    pub sink_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Sleep of a paused track between state checks
    pub idle_wait_ms: u64,
    pub event_queue_depth: usize,
    /// Max audio self-throttle, in video frame intervals
    pub sync_cap_frames: u32,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub vi: u32,
    pub gdc: u32,
    pub venc: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            vi: 4,
            gdc: 3,
            venc: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pump: PumpConfig {
                fetch_timeout_ms: 1000,
                photo_fetch_timeout_ms: 2500,
                drain_timeout_ms: 3000,
                diag_interval: 300,
                fps_tolerance: 0.1,
                error_backoff_ms: 100,
                sink_queue_depth: 64,
            },
            playback: PlaybackConfig {
                idle_wait_ms: 20,
                event_queue_depth: 16,
                sync_cap_frames: 4,
                drain_timeout_ms: 3000,
            },
            buffers: BufferConfig::default(),
        }
    }
}

impl PumpConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn photo_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.photo_fetch_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl PlaybackConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `RKCAM__*` environment
    /// variables (`RKCAM__PUMP__FETCH_TIMEOUT_MS=500`)
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("RKCAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rkcam.toml");
        std::fs::write(&path, "[pump]\nfetch_timeout_ms = 250\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.pump.fetch_timeout(), Duration::from_millis(250));
        assert_eq!(config.pump.drain_timeout_ms, 3000);
        assert_eq!(config.playback.sync_cap_frames, 4);
    }
}
