use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const BASE_URL_ENV: &str = "MODEL_VIEWER_BASE_URL";
pub const CONFIG_PATH_ENV: &str = "MODEL_VIEWER_CONFIG";

/// Tunables shared by every stage of the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Origin used for resolution calls and stored model URLs.
    pub base_url: String,
    /// Literal tag that marks a launch parameter carrying an encoded payload.
    pub launch_prefix: String,
    pub camera: CameraConfig,
    pub normalize: NormalizeConfig,
    pub controls: ControlsConfig,
    /// Leading bytes requested by the content probe.
    pub probe_bytes: usize,
    /// Skip every other draw on low-tier devices.
    pub frame_skip: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            launch_prefix: "model_".to_string(),
            camera: CameraConfig::default(),
            normalize: NormalizeConfig::default(),
            controls: ControlsConfig::default(),
            probe_bytes: 64,
            frame_skip: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Vertical field of view in degrees.
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// Multiplier (> 1) applied to the fitted camera distance.
    pub padding: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 75.0,
            near: 0.1,
            far: 1000.0,
            padding: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Models whose largest dimension is below this get scaled up.
    pub min_dimension: f32,
    /// Models whose largest dimension is above this get scaled down.
    pub max_dimension: f32,
    /// Largest dimension after a rescale.
    pub reference_size: f32,
    pub fbx_large_dimension: f32,
    pub fbx_small_dimension: f32,
    /// Largest dimension given to tiny FBX models.
    pub fbx_small_target: f32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            min_dimension: 0.1,
            max_dimension: 10.0,
            reference_size: 5.0,
            fbx_large_dimension: 100.0,
            fbx_small_dimension: 0.01,
            fbx_small_target: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    /// Orbit speed while auto-rotating, in radians per second.
    pub auto_rotate_speed: f32,
    /// Auto-rotate switches itself off this many milliseconds after a model loads.
    pub auto_rotate_ms: u64,
    pub rotate_speed: f32,
    pub zoom_speed: f32,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            auto_rotate_speed: 1.0,
            auto_rotate_ms: 5_000,
            rotate_speed: 0.005,
            zoom_speed: 0.1,
        }
    }
}

impl ControlsConfig {
    pub fn auto_rotate_duration(&self) -> Duration {
        Duration::from_millis(self.auto_rotate_ms)
    }
}

impl ViewerConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid viewer config JSON")
    }

    /// Loads the file named by `MODEL_VIEWER_CONFIG` (if set), then applies
    /// `MODEL_VIEWER_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("unable to read config file {path}"))?;
                Self::from_json(&text).with_context(|| format!("in config file {path}"))?
            }
            _ => Self::default(),
        };
        if let Ok(base_url) = env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                config.base_url = base_url.trim().to_string();
            }
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(config)
    }
}
