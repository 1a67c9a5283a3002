use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::audio::simulated::EventDescriptor;
use crate::{Result, SyncError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Parses and validates a JSON configuration. Missing sections and
    /// fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Rejects authored events the simulated engine could not schedule and
    /// a zero frame rate.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.fps == 0 {
            return Err(SyncError::Config("bridge fps must be at least 1".to_string()));
        }
        for event in &self.engine.events {
            event
                .validate()
                .map_err(|err| SyncError::Config(err.to_string()))?;
        }
        Ok(())
    }
}

/// Configuration for the component driving the timeline bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the music event to play.
    pub event: String,
    /// Host frame rate used to pace `tick`.
    pub fps: u32,
    /// Log the timeline dump every frame.
    pub diagnostics: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event: "music/theme".to_string(),
            fps: 60,
            diagnostics: false,
        }
    }
}

/// Events authored in the simulated audio engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub events: Vec<EventDescriptor>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            events: vec![EventDescriptor::new("music/theme", 16_000)
                .with_tempo(120.0, 4)
                .with_marker(0, "intro{section=1}")
                .with_marker(4_000, "verse{section=2}{intensity=3}")
                .with_marker(12_000, "outro{section=3}")],
        }
    }
}
