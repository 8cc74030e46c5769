//! Engine configuration, loadable from JSON

use std::path::Path;
use std::time::Duration;

use bt_core::PlaybackSettings;
use serde::{Deserialize, Serialize};

use crate::DataError;

/// Buffering behaviour of the per-topic loaders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// How far behind the playhead a loader buffers
    pub lookbehind_ms: u64,

    /// How far ahead of the playhead a loader buffers
    pub lookahead_ms: u64,

    /// Maximum number of messages held per topic
    pub buffer_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            lookbehind_ms: 1_000,
            lookahead_ms: 1_000,
            buffer_capacity: 256,
        }
    }
}

impl LoaderConfig {
    pub fn lookbehind(&self) -> Duration {
        Duration::from_millis(self.lookbehind_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }
}

/// Configuration for a timeline engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the playback scheduler
    pub tick_interval_ms: u64,

    /// Smallest non-zero playback speed magnitude
    pub min_play_speed: f64,

    /// Largest playback speed magnitude
    pub max_play_speed: f64,

    /// Whether playback wraps around the play region
    pub wrap: bool,

    /// Longest wall-clock gap one locked-mode step may consume
    pub locked_step_cap_ms: u64,

    pub loader: LoaderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let playback = PlaybackSettings::default();
        Self {
            tick_interval_ms: 1,
            min_play_speed: playback.min_speed,
            max_play_speed: playback.max_speed,
            wrap: playback.wrap,
            locked_step_cap_ms: playback.locked_step_cap.as_millis() as u64,
            loader: LoaderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file; absent keys take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, DataError> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json_file(&self, path: &Path) -> Result<(), DataError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.tick_interval_ms == 0 {
            return Err(DataError::InvalidConfig("tick_interval_ms must be positive".to_string()));
        }
        if !(self.min_play_speed > 0.0 && self.min_play_speed <= self.max_play_speed) {
            return Err(DataError::InvalidConfig(format!(
                "speed limits {}..{} are not an increasing positive range",
                self.min_play_speed, self.max_play_speed
            )));
        }
        if !self.max_play_speed.is_finite() {
            return Err(DataError::InvalidConfig("max_play_speed must be finite".to_string()));
        }
        if self.loader.buffer_capacity == 0 {
            return Err(DataError::InvalidConfig("loader.buffer_capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            min_speed: self.min_play_speed,
            max_speed: self.max_play_speed,
            wrap: self.wrap,
            locked_step_cap: Duration::from_millis(self.locked_step_cap_ms),
        }
    }
}
