//! Continuous rendering of one normalized scene.
//!
//! [`RenderSession`] owns the scene, the camera and the orbit controls and
//! talks to the GPU through the [`RenderBackend`] seam. The wgpu backend
//! lives in [`gpu`]; tests drive sessions with in-memory backends.

use std::time::Duration;

use anyhow::{bail, Result};
use glam::{Vec3, Vec4};
use log::{debug, info};

use crate::config::ViewerConfig;
use crate::controls::OrbitControls;
use crate::device::{DeviceProfile, RenderQuality};
use crate::input::Gesture;
use crate::normalize::Framing;
use crate::scene::{GeometryHandle, Mesh, SceneGraph, TextureHandle, TextureImage, TextureSlot};

pub mod common;
pub mod dispose;
pub mod gpu;
mod shared;

pub use common::{CameraParams, DrawItem, FrameParams, LightParams, PerspectiveCamera, Viewport};
pub use dispose::{visit_resources, Released, ResourceVisitor};
pub use gpu::GpuBackend;

/// GPU operations a render session needs.
pub trait RenderBackend {
    /// Applies tier-dependent settings and sizes the drawing surface.
    fn configure(&mut self, quality: &RenderQuality, width: u32, height: u32) -> Result<()>;

    fn resize(&mut self, width: u32, height: u32);

    fn upload_geometry(&mut self, mesh: &Mesh) -> Result<GeometryHandle>;

    fn upload_texture(&mut self, image: &TextureImage) -> Result<TextureHandle>;

    fn release_geometry(&mut self, handle: GeometryHandle);

    fn release_texture(&mut self, handle: TextureHandle);

    fn draw(&mut self, frame: &FrameParams, items: &[DrawItem]) -> Result<()>;

    /// Gives up the drawing surface. Nothing is drawn afterwards.
    fn detach(&mut self);
}

/// Resource and frame counters of one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub geometries_uploaded: usize,
    pub textures_uploaded: usize,
    pub geometries_released: usize,
    pub textures_released: usize,
    pub frames_drawn: u64,
    pub frames_skipped: u64,
}

impl SessionStats {
    /// Every uploaded resource has been released.
    pub fn balanced(&self) -> bool {
        self.geometries_uploaded == self.geometries_released
            && self.textures_uploaded == self.textures_released
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Drawn,
    Skipped,
    Inactive,
}

struct Disposer<'a, B> {
    backend: &'a mut B,
    released: Released,
}

impl<B: RenderBackend> ResourceVisitor for Disposer<'_, B> {
    fn geometry(&mut self, handle: GeometryHandle) {
        self.backend.release_geometry(handle);
        self.released.geometries += 1;
    }

    fn texture(&mut self, _slot: Option<TextureSlot>, handle: TextureHandle) {
        self.backend.release_texture(handle);
        self.released.textures += 1;
    }
}

pub struct RenderSession<B: RenderBackend> {
    backend: B,
    quality: RenderQuality,
    viewport: Viewport,
    camera: PerspectiveCamera,
    controls: OrbitControls,
    light: LightParams,
    scene: Option<SceneGraph>,
    auto_rotate: Duration,
    active: bool,
    frame_index: u64,
    stats: SessionStats,
}

impl<B: RenderBackend> RenderSession<B> {
    pub fn new(
        mut backend: B,
        profile: DeviceProfile,
        viewport: Viewport,
        config: &ViewerConfig,
    ) -> Result<Self> {
        let quality =
            RenderQuality::for_profile(profile, viewport.device_pixel_ratio, config.frame_skip);
        let (width, height) = viewport.physical_size(quality.pixel_ratio);
        backend.configure(&quality, width, height)?;
        info!(
            "Render session: {:?} tier, {}x{} px, msaa {}, shadows {}",
            profile.performance_tier, width, height, quality.msaa_samples, quality.shadows
        );
        Ok(Self {
            backend,
            quality,
            viewport,
            camera: PerspectiveCamera::new(&config.camera, viewport.aspect()),
            controls: OrbitControls::new(&config.controls, quality.damping),
            light: LightParams::default(),
            scene: None,
            auto_rotate: config.controls.auto_rotate_duration(),
            active: true,
            frame_index: 0,
            stats: SessionStats::default(),
        })
    }

    pub fn quality(&self) -> &RenderQuality {
        &self.quality
    }

    pub fn camera(&self) -> &PerspectiveCamera {
        &self.camera
    }

    pub fn controls(&self) -> &OrbitControls {
        &self.controls
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn scene(&self) -> Option<&SceneGraph> {
        self.scene.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Uploads `scene`, frames it and starts the timed auto-rotate. A
    /// previously presented scene is released first.
    pub fn present(&mut self, mut scene: SceneGraph, framing: &Framing) -> Result<()> {
        if !self.active {
            bail!("render session has been torn down");
        }
        self.release_scene();

        if let Err(err) = self.upload(&mut scene) {
            self.dispose(&mut scene);
            return Err(err);
        }

        self.camera.near = framing.near;
        self.camera.far = framing.far;
        self.controls.look_from(framing.camera_position, framing.target);
        self.controls.start_auto_rotate(self.auto_rotate);

        let radius = framing
            .bounds
            .map(|bounds| bounds.size().length() * 0.5)
            .unwrap_or(1.0)
            .max(0.01);
        self.light = LightParams {
            position: Vec3::new(0.6, 1.0, 0.8).normalize() * radius * 3.0,
            shadow_extent: radius * 1.5,
            ..LightParams::default()
        };

        debug!(
            "Presented {} meshes / {} textures",
            scene.meshes.len(),
            scene.textures.len()
        );
        self.scene = Some(scene);
        Ok(())
    }

    fn upload(&mut self, scene: &mut SceneGraph) -> Result<()> {
        for mesh in &mut scene.meshes {
            if mesh.indices.is_empty() {
                continue;
            }
            mesh.ensure_normals();
            mesh.gpu = Some(self.backend.upload_geometry(mesh)?);
            self.stats.geometries_uploaded += 1;
        }
        for texture in &mut scene.textures {
            let Some(image) = &texture.image else {
                continue;
            };
            texture.gpu = Some(self.backend.upload_texture(image)?);
            self.stats.textures_uploaded += 1;
        }
        Ok(())
    }

    fn dispose(&mut self, scene: &mut SceneGraph) {
        let mut disposer = Disposer {
            backend: &mut self.backend,
            released: Released::default(),
        };
        visit_resources(scene, &mut disposer);
        let released = disposer.released;
        self.stats.geometries_released += released.geometries;
        self.stats.textures_released += released.textures;
    }

    fn release_scene(&mut self) {
        if let Some(mut scene) = self.scene.take() {
            self.dispose(&mut scene);
        }
    }

    pub fn apply_gesture(&mut self, gesture: Gesture) {
        if self.active && gesture != Gesture::default() {
            self.controls.apply(gesture);
        }
    }

    /// Advances the controls by `dt` and draws, unless frame skipping
    /// drops this frame.
    pub fn frame(&mut self, dt: Duration) -> Result<FrameOutcome> {
        if !self.active {
            return Ok(FrameOutcome::Inactive);
        }
        self.controls.update(dt);

        let skip = self.quality.frame_skip && self.frame_index % 2 == 1;
        self.frame_index += 1;
        if skip {
            self.stats.frames_skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }

        let frame = FrameParams {
            camera: self
                .camera
                .params(self.controls.position(), self.controls.target()),
            light: self.light,
        };
        let items = self.scene.as_ref().map(draw_items).unwrap_or_default();
        self.backend.draw(&frame, &items)?;
        self.stats.frames_drawn += 1;
        Ok(FrameOutcome::Drawn)
    }

    pub fn resize(&mut self, viewport: Viewport) {
        if !self.active {
            return;
        }
        self.viewport = viewport;
        self.camera.aspect = viewport.aspect();
        let (width, height) = viewport.physical_size(self.quality.pixel_ratio);
        self.backend.resize(width, height);
    }

    /// Stops drawing, releases every GPU resource and detaches the surface.
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.release_scene();
        self.backend.detach();
        info!(
            "Render session torn down ({} geometries, {} textures released)",
            self.stats.geometries_released, self.stats.textures_released
        );
    }
}

impl<B: RenderBackend> Drop for RenderSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn draw_items(scene: &SceneGraph) -> Vec<DrawItem> {
    let mut items = Vec::new();
    scene.visit_nodes(|node, world| {
        for &index in &node.meshes {
            let Some(mesh) = scene.meshes.get(index) else {
                continue;
            };
            let Some(geometry) = mesh.gpu else {
                continue;
            };
            let material = mesh.material.and_then(|m| scene.materials.get(m));
            let color = material.map_or(Vec4::ONE, |m| m.base_color);
            let base_color = material
                .and_then(|m| m.texture(TextureSlot::BaseColor))
                .and_then(|t| scene.textures.get(t))
                .and_then(|t| t.gpu);
            items.push(DrawItem {
                geometry,
                model: world,
                color,
                base_color,
            });
        }
    });
    items
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// What a [`RecordingBackend`] has been asked to do.
    #[derive(Debug, Default)]
    pub struct BackendLog {
        pub live_geometries: Vec<GeometryHandle>,
        pub live_textures: Vec<TextureHandle>,
        pub draws: Vec<usize>,
        pub sizes: Vec<(u32, u32)>,
        pub msaa: Option<u32>,
        pub detached: bool,
        pub draws_after_detach: usize,
    }

    #[derive(Debug, Default, Clone)]
    pub struct RecordingBackend {
        pub log: Arc<Mutex<BackendLog>>,
        next: u64,
    }

    impl RenderBackend for RecordingBackend {
        fn configure(&mut self, quality: &RenderQuality, width: u32, height: u32) -> Result<()> {
            let mut log = self.log.lock();
            log.msaa = Some(quality.msaa_samples);
            log.sizes.push((width, height));
            Ok(())
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.log.lock().sizes.push((width, height));
        }

        fn upload_geometry(&mut self, _mesh: &Mesh) -> Result<GeometryHandle> {
            self.next += 1;
            let handle = GeometryHandle(self.next);
            self.log.lock().live_geometries.push(handle);
            Ok(handle)
        }

        fn upload_texture(&mut self, _image: &TextureImage) -> Result<TextureHandle> {
            self.next += 1;
            let handle = TextureHandle(self.next);
            self.log.lock().live_textures.push(handle);
            Ok(handle)
        }

        fn release_geometry(&mut self, handle: GeometryHandle) {
            self.log.lock().live_geometries.retain(|h| *h != handle);
        }

        fn release_texture(&mut self, handle: TextureHandle) {
            self.log.lock().live_textures.retain(|h| *h != handle);
        }

        fn draw(&mut self, _frame: &FrameParams, items: &[DrawItem]) -> Result<()> {
            let mut log = self.log.lock();
            if log.detached {
                log.draws_after_detach += 1;
            }
            log.draws.push(items.len());
            Ok(())
        }

        fn detach(&mut self) {
            self.log.lock().detached = true;
        }
    }
}
