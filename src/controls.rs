use std::f32::consts::FRAC_PI_2;
use std::time::Duration;

use glam::{Vec2, Vec3};

use crate::config::ControlsConfig;
use crate::input::Gesture;

const PITCH_LIMIT: f32 = FRAC_PI_2 - 0.01;

/// Orbit camera around a target, driven by drag and wheel gestures, with an
/// optional timed auto-rotate.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitControls {
    target: Vec3,
    yaw: f32,
    pitch: f32,
    distance: f32,
    min_distance: f32,
    max_distance: f32,
    velocity: Vec2,
    damping: f32,
    rotate_speed: f32,
    zoom_speed: f32,
    auto_rotate_speed: f32,
    auto_rotate_remaining: Option<Duration>,
}

impl OrbitControls {
    pub fn new(config: &ControlsConfig, damping: f32) -> Self {
        Self {
            target: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            distance: 5.0,
            min_distance: 0.01,
            max_distance: 1.0e4,
            velocity: Vec2::ZERO,
            damping: damping.clamp(0.0, 1.0),
            rotate_speed: config.rotate_speed,
            zoom_speed: config.zoom_speed,
            auto_rotate_speed: config.auto_rotate_speed,
            auto_rotate_remaining: None,
        }
    }

    /// Places the camera at `position` looking at `target`.
    pub fn look_from(&mut self, position: Vec3, target: Vec3) {
        let offset = position - target;
        self.target = target;
        self.distance = offset.length().max(self.min_distance);
        self.max_distance = (self.distance * 20.0).max(self.min_distance * 2.0);
        self.min_distance = (self.distance * 0.01).max(1e-4);
        self.yaw = offset.x.atan2(offset.z);
        self.pitch = (offset.y / self.distance).clamp(-1.0, 1.0).asin();
        self.velocity = Vec2::ZERO;
    }

    /// Rotates automatically for `duration` of update time, then stops.
    pub fn start_auto_rotate(&mut self, duration: Duration) {
        self.auto_rotate_remaining = (!duration.is_zero()).then_some(duration);
    }

    pub fn is_auto_rotating(&self) -> bool {
        self.auto_rotate_remaining.is_some()
    }

    pub fn apply(&mut self, gesture: Gesture) {
        self.velocity += gesture.rotate * self.rotate_speed;
        if gesture.zoom != 0.0 {
            let factor = (1.0 + gesture.zoom.signum() * self.zoom_speed).max(0.1);
            self.distance = (self.distance * factor).clamp(self.min_distance, self.max_distance);
        }
    }

    pub fn update(&mut self, dt: Duration) {
        if let Some(remaining) = self.auto_rotate_remaining {
            let step = dt.min(remaining);
            self.yaw += self.auto_rotate_speed * step.as_secs_f32();
            self.auto_rotate_remaining = remaining.checked_sub(dt).filter(|left| !left.is_zero());
        }

        self.yaw -= self.velocity.x;
        self.pitch = (self.pitch + self.velocity.y).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        if self.damping > 0.0 {
            self.velocity *= 1.0 - self.damping;
            if self.velocity.length_squared() < 1e-10 {
                self.velocity = Vec2::ZERO;
            }
        } else {
            self.velocity = Vec2::ZERO;
        }
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn position(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        self.target
            + Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw) * self.distance
    }
}
