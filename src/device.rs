//! Coarse classification of the client's rendering capability.

use serde::{Deserialize, Serialize};

const MOBILE_TOKENS: &[&str] = &[
    "android",
    "webos",
    "iphone",
    "ipad",
    "ipod",
    "blackberry",
    "iemobile",
    "opera mini",
    "mobile",
];

/// Handset families that struggle with real-time shading regardless of the
/// core count they report.
const LOW_END_TOKENS: &[&str] = &[
    "android 4",
    "android 5",
    "android 6",
    "sm-j",
    "galaxy j",
    "redmi 4",
    "redmi 5",
    "redmi go",
    "moto e",
    "moto g4",
    "nokia 1",
    "nokia 2",
    "iphone os 9_",
    "iphone os 10_",
    "iphone os 11_",
];

/// Raw environment readings. Every field is optional; missing values never
/// cause classification to fail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignals {
    pub user_agent: Option<String>,
    pub logical_cores: Option<u32>,
    /// `navigator.deviceMemory`, in GiB.
    pub memory_gib: Option<f32>,
}

impl DeviceSignals {
    /// Signals of the machine the binary is running on.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn native() -> Self {
        Self {
            user_agent: None,
            logical_cores: std::thread::available_parallelism()
                .ok()
                .and_then(|n| u32::try_from(n.get()).ok()),
            memory_gib: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.user_agent.as_deref().map_or(true, |ua| ua.trim().is_empty())
            && self.logical_cores.is_none()
            && self.memory_gib.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub is_mobile: bool,
    pub performance_tier: PerformanceTier,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            is_mobile: false,
            performance_tier: PerformanceTier::High,
        }
    }
}

impl DeviceProfile {
    pub fn classify(signals: &DeviceSignals) -> Self {
        if signals.is_empty() {
            return Self::default();
        }
        let user_agent = signals
            .user_agent
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let is_mobile = MOBILE_TOKENS.iter().any(|token| user_agent.contains(token));
        let cores = signals.logical_cores;
        let memory = signals.memory_gib.filter(|gib| gib.is_finite() && *gib > 0.0);

        let performance_tier = if is_mobile {
            let low_end = LOW_END_TOKENS.iter().any(|token| user_agent.contains(token));
            if low_end || cores.is_some_and(|c| c <= 4) || memory.is_some_and(|m| m <= 2.0) {
                PerformanceTier::Low
            } else if cores.is_some_and(|c| c >= 8) && memory.is_some_and(|m| m >= 6.0) {
                PerformanceTier::High
            } else {
                PerformanceTier::Medium
            }
        } else if cores.is_some_and(|c| c <= 2) || memory.is_some_and(|m| m <= 2.0) {
            PerformanceTier::Low
        } else if cores.is_some_and(|c| c <= 4) || memory.is_some_and(|m| m <= 4.0) {
            PerformanceTier::Medium
        } else {
            PerformanceTier::High
        };

        Self {
            is_mobile,
            performance_tier,
        }
    }
}

/// Render settings derived from a [`DeviceProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderQuality {
    pub shadows: bool,
    pub msaa_samples: u32,
    pub pixel_ratio: f32,
    /// Orbit damping factor; 0 disables inertia.
    pub damping: f32,
    /// Draw only every other frame.
    pub frame_skip: bool,
}

impl RenderQuality {
    pub fn for_profile(profile: DeviceProfile, device_pixel_ratio: f32, frame_skip: bool) -> Self {
        let device_pixel_ratio = if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
            device_pixel_ratio
        } else {
            1.0
        };
        match profile.performance_tier {
            PerformanceTier::Low => Self {
                shadows: false,
                msaa_samples: 1,
                pixel_ratio: device_pixel_ratio.min(1.0),
                damping: 0.0,
                frame_skip,
            },
            PerformanceTier::Medium => Self {
                shadows: false,
                msaa_samples: 4,
                pixel_ratio: device_pixel_ratio.min(1.5),
                damping: 0.1,
                frame_skip: false,
            },
            PerformanceTier::High => Self {
                shadows: true,
                msaa_samples: 4,
                pixel_ratio: device_pixel_ratio.min(2.0),
                damping: 0.05,
                frame_skip: false,
            },
        }
    }
}
