use glam::{Mat4, Vec3, Vec4};

use crate::config::CameraConfig;
use crate::scene::{GeometryHandle, TextureHandle};

/// Camera parameters consumed by the renderer's uniform buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraParams {
    pub view_proj: Mat4,
    pub position: Vec3,
}

/// Lighting state consumed by the renderer's uniform buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightParams {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Half-size of the square the shadow map covers around the origin.
    pub shadow_extent: f32,
}

impl Default for LightParams {
    fn default() -> Self {
        Self {
            position: Vec3::new(3.0, 5.0, 3.0),
            color: Vec3::ONE,
            intensity: 1.0,
            shadow_extent: 5.0,
        }
    }
}

impl LightParams {
    /// Orthographic projection from the light towards the origin.
    pub fn view_proj(&self) -> Mat4 {
        let extent = self.shadow_extent.max(0.01);
        let distance = self.position.length().max(extent);
        let up = if self.position.cross(Vec3::Y).length_squared() < 1e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_at_rh(self.position, Vec3::ZERO, up);
        let projection = Mat4::orthographic_rh(
            -extent,
            extent,
            -extent,
            extent,
            0.01,
            distance + extent * 2.0,
        );
        projection * view
    }
}

/// Everything the backend needs for one frame besides the draw list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameParams {
    pub camera: CameraParams,
    pub light: LightParams,
}

/// One mesh instance in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawItem {
    pub geometry: GeometryHandle,
    pub model: Mat4,
    pub color: Vec4,
    pub base_color: Option<TextureHandle>,
}

/// Drawable area in logical pixels plus the device pixel ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub device_pixel_ratio: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32, device_pixel_ratio: f32) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio,
        }
    }

    pub fn aspect(&self) -> f32 {
        if self.height <= 0.0 || self.width <= 0.0 {
            1.0
        } else {
            self.width / self.height
        }
    }

    /// Backing-store size with the pixel ratio capped at `max_ratio`.
    pub fn physical_size(&self, max_ratio: f32) -> (u32, u32) {
        let ratio = self.device_pixel_ratio.min(max_ratio).max(0.1);
        (
            ((self.width * ratio).round() as u32).max(1),
            ((self.height * ratio).round() as u32).max(1),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerspectiveCamera {
    pub fov_y_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl PerspectiveCamera {
    pub fn new(config: &CameraConfig, aspect: f32) -> Self {
        Self {
            fov_y_degrees: config.fov_degrees,
            aspect,
            near: config.near,
            far: config.far,
        }
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.fov_y_degrees.to_radians(),
            self.aspect.max(0.01),
            self.near.max(1e-5),
            self.far.max(self.near + 1e-3),
        )
    }

    pub fn params(&self, position: Vec3, target: Vec3) -> CameraParams {
        let view = Mat4::look_at_rh(position, target, Vec3::Y);
        CameraParams {
            view_proj: self.projection() * view,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_ratio_is_capped() {
        let viewport = Viewport::new(400.0, 300.0, 3.0);
        assert_eq!(viewport.physical_size(2.0), (800, 600));
        assert_eq!(viewport.physical_size(1.0), (400, 300));
        assert_eq!(Viewport::new(0.0, 0.0, 1.0).aspect(), 1.0);
    }

    #[test]
    fn target_projects_to_screen_center() {
        let camera = PerspectiveCamera::new(&CameraConfig::default(), 16.0 / 9.0);
        let params = camera.params(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let clip = params.view_proj * Vec3::ZERO.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn light_projection_contains_origin() {
        let light = LightParams::default();
        let clip = light.view_proj() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(clip.x.abs() < 1e-4 && clip.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&clip.z));
    }
}
