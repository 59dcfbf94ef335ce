//! Turns a parsed scene of unknown scale, pivot and orientation into a
//! camera-ready one: centered at the origin, unrotated at the root, scaled
//! into a comfortable band, with the camera distance derived from the final
//! bounds.

use glam::{Quat, Vec3};
use serde::Serialize;

use crate::config::{CameraConfig, NormalizeConfig};
use crate::format::ModelFormat;
use crate::scene::{Aabb, SceneGraph};

/// Camera placement for a normalized scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Framing {
    /// Uniform scale applied to the root.
    pub scale: f32,
    /// Bounds after scaling and centering.
    pub bounds: Option<Aabb>,
    pub camera_position: Vec3,
    /// Look-at target of the camera and the orbit controls.
    pub target: Vec3,
    pub distance: f32,
    pub near: f32,
    pub far: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct SceneNormalizer {
    limits: NormalizeConfig,
    camera: CameraConfig,
}

impl SceneNormalizer {
    pub fn new(limits: NormalizeConfig, camera: CameraConfig) -> Self {
        Self { limits, camera }
    }

    /// Scale factor for a raw largest dimension; `1.0` means "leave alone".
    pub fn scale_for(&self, format: ModelFormat, max_dimension: f32) -> f32 {
        if !max_dimension.is_finite() || max_dimension <= f32::EPSILON {
            return 1.0;
        }
        let limits = &self.limits;
        match format {
            // FBX exports swing between centimetre and metre units, so
            // anything outside the tiny band is brought to the reference size.
            ModelFormat::Fbx => {
                if max_dimension > limits.fbx_large_dimension {
                    limits.reference_size / max_dimension
                } else if max_dimension < limits.fbx_small_dimension {
                    limits.fbx_small_target / max_dimension
                } else {
                    limits.reference_size / max_dimension
                }
            }
            _ => {
                if max_dimension < limits.min_dimension || max_dimension > limits.max_dimension {
                    limits.reference_size / max_dimension
                } else {
                    1.0
                }
            }
        }
    }

    pub fn normalize(&self, scene: &mut SceneGraph, format: ModelFormat) -> Framing {
        scene.root.transform.rotation = Quat::IDENTITY;

        let raw = scene.world_bounds().filter(|bounds| !bounds.is_degenerate());
        let scale = raw.map_or(1.0, |bounds| self.scale_for(format, bounds.max_dimension()));
        if scale != 1.0 {
            scene.root.transform.scale *= scale;
            scene.root.transform.translation *= scale;
        }

        if let Some(scaled) = scene.world_bounds() {
            if scaled.min.is_finite() && scaled.max.is_finite() {
                scene.root.transform.translation -= scaled.center();
            }
        }

        let bounds = scene.world_bounds();
        self.frame(bounds, scale)
    }

    fn frame(&self, bounds: Option<Aabb>, scale: f32) -> Framing {
        let camera = &self.camera;
        let max_dimension = bounds
            .map(|b| b.max_dimension())
            .filter(|d| d.is_finite() && *d > f32::EPSILON)
            .unwrap_or(1.0);
        let half_fov = (camera.fov_degrees.to_radians() * 0.5).max(1e-3);
        let distance = max_dimension / (2.0 * half_fov.tan()) * camera.padding;
        let near = (distance / 100.0).min(camera.near).max(1e-4);
        let far = (distance * 100.0).max(camera.far);
        Framing {
            scale,
            bounds,
            camera_position: Vec3::new(0.0, 0.0, distance),
            target: Vec3::ZERO,
            distance,
            near,
            far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewerConfig;
    use crate::scene::{Mesh, SceneNode};

    fn normalizer() -> SceneNormalizer {
        let config = ViewerConfig::default();
        SceneNormalizer::new(config.normalize, config.camera)
    }

    /// A box spanning `min..max` under a rotated, offset root.
    fn box_scene(min: Vec3, max: Vec3) -> SceneGraph {
        let corners = (0..8)
            .map(|i| {
                Vec3::new(
                    if i & 1 == 0 { min.x } else { max.x },
                    if i & 2 == 0 { min.y } else { max.y },
                    if i & 4 == 0 { min.z } else { max.z },
                )
            })
            .collect();
        let mut root = SceneNode::named("root");
        root.transform.rotation = Quat::from_rotation_y(0.7);
        root.transform.translation = Vec3::new(4.0, -2.0, 9.0);
        let mut child = SceneNode::named("part");
        child.meshes.push(0);
        root.children.push(child);
        SceneGraph {
            root,
            meshes: vec![Mesh {
                positions: corners,
                indices: vec![0, 1, 2],
                ..Mesh::default()
            }],
            ..SceneGraph::default()
        }
    }

    fn assert_centered(scene: &SceneGraph) {
        let center = scene.world_bounds().unwrap().center();
        assert!(center.length() < 1e-4, "center {center:?}");
    }

    #[test]
    fn in_band_models_are_centered_but_not_scaled() {
        let mut scene = box_scene(Vec3::new(1.0, 1.0, 1.0), Vec3::new(4.0, 2.0, 3.0));
        let framing = normalizer().normalize(&mut scene, ModelFormat::Glb);
        assert_eq!(framing.scale, 1.0);
        assert_eq!(scene.root.transform.rotation, Quat::IDENTITY);
        assert_centered(&scene);
        let bounds = framing.bounds.unwrap();
        assert!((bounds.max_dimension() - 3.0).abs() < 1e-4);
        assert_eq!(framing.target, Vec3::ZERO);
    }

    #[test]
    fn oversized_models_shrink_to_reference_size() {
        let mut scene = box_scene(Vec3::ZERO, Vec3::new(250.0, 40.0, 10.0));
        let framing = normalizer().normalize(&mut scene, ModelFormat::Obj);
        assert!((framing.scale - 5.0 / 250.0).abs() < 1e-6);
        assert!((framing.bounds.unwrap().max_dimension() - 5.0).abs() < 1e-3);
        assert_centered(&scene);
    }

    #[test]
    fn tiny_models_grow_to_reference_size() {
        let mut scene = box_scene(Vec3::ZERO, Vec3::splat(0.02));
        let framing = normalizer().normalize(&mut scene, ModelFormat::Gltf);
        assert!((framing.bounds.unwrap().max_dimension() - 5.0).abs() < 1e-3);
        assert_centered(&scene);
    }

    #[test]
    fn fbx_has_its_own_scale_branch() {
        let n = normalizer();
        assert!((n.scale_for(ModelFormat::Fbx, 500.0) - 0.01).abs() < 1e-6);
        assert!((n.scale_for(ModelFormat::Fbx, 0.005) - 400.0).abs() < 1e-2);
        assert!((n.scale_for(ModelFormat::Fbx, 2.5) - 2.0).abs() < 1e-6);
        assert_eq!(n.scale_for(ModelFormat::Glb, 2.5), 1.0);
    }

    #[test]
    fn camera_distance_follows_post_scale_bounds() {
        let mut scene = box_scene(Vec3::ZERO, Vec3::new(3.0, 1.0, 1.0));
        let framing = normalizer().normalize(&mut scene, ModelFormat::Glb);
        let expected = 3.0 / (2.0 * (75f32.to_radians() / 2.0).tan()) * 1.5;
        assert!((framing.distance - expected).abs() < 1e-4);
        assert_eq!(framing.camera_position, Vec3::new(0.0, 0.0, framing.distance));
        assert!(framing.near < framing.distance && framing.far > framing.distance);
    }

    #[test]
    fn normalization_is_deterministic() {
        let make = || box_scene(Vec3::new(-7.0, 3.0, 0.5), Vec3::new(80.0, 9.0, 4.0));
        let (mut a, mut b) = (make(), make());
        let fa = normalizer().normalize(&mut a, ModelFormat::Fbx);
        let fb = normalizer().normalize(&mut b, ModelFormat::Fbx);
        assert_eq!(fa, fb);
        assert_eq!(a.root.transform, b.root.transform);
    }

    #[test]
    fn empty_scene_is_left_alone() {
        let mut scene = SceneGraph::default();
        let framing = normalizer().normalize(&mut scene, ModelFormat::Obj);
        assert_eq!(framing.scale, 1.0);
        assert_eq!(framing.bounds, None);
        assert!(framing.distance > 0.0);
    }
}
