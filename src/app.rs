//! Native front end shared by the binary: the blocking load pipeline, a
//! no-op backend for `--summary-only`, and the winit window loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use glam::Vec2;
use log::{info, warn};
use pollster::block_on;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, MouseButton as WinitMouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};
use winit::platform::run_on_demand::EventLoopExtRunOnDemand;
use winit::window::Window;

use crate::cascade::LoaderCascade;
use crate::device::RenderQuality;
use crate::format::{detect, probe_and_publish};
use crate::input::{InputState, MouseButton};
use crate::render::{DrawItem, FrameParams, RenderBackend, Viewport};
use crate::scene::{GeometryHandle, Mesh, TextureHandle, TextureImage};
use crate::source::{HttpResolutionClient, LaunchContext, NavigationContext, SourceResolver};
use crate::transport::NativeTransport;
use crate::viewer::{Applied, ViewState, Viewer};

/// Resolves the model for `navigation` and runs the loader cascade, with the
/// content probe racing on a helper thread. Returns `None` when there was
/// nothing to load.
pub fn load_model<B, F>(
    viewer: &mut Viewer<B>,
    transport: &NativeTransport,
    navigation: &NavigationContext,
    launch: Option<&LaunchContext>,
    make_backend: F,
) -> Option<Applied>
where
    B: RenderBackend,
    F: FnOnce() -> Result<B>,
{
    let config = viewer.config().clone();
    let diagnostics = viewer.diagnostics().clone();
    let client = HttpResolutionClient::new(transport.clone(), config.base_url.clone());
    let outcome = block_on(SourceResolver::new(&client, &config, &diagnostics).resolve(navigation, launch));

    let ticket = viewer.apply_source(outcome)?;
    let reference = viewer.reference().cloned()?;
    let detected = viewer.detected().clone();

    let probe = {
        let transport = transport.clone();
        let url = reference.origin_url().to_string();
        let detected = detected.clone();
        let ticket = ticket.clone();
        let diagnostics = diagnostics.clone();
        let max_bytes = config.probe_bytes;
        thread::Builder::new()
            .name("content-probe".into())
            .spawn(move || {
                block_on(probe_and_publish(
                    &transport,
                    &url,
                    max_bytes,
                    &detected,
                    &ticket,
                    &diagnostics,
                ))
            })
    };
    if let Err(err) = &probe {
        warn!("Content probe not started: {err}");
    }

    let outcome = block_on(
        LoaderCascade::new(transport, &diagnostics, &detected).run(&reference, detect(&reference), &ticket),
    );
    if let Ok(handle) = probe {
        if handle.join().is_err() {
            warn!("Content probe thread panicked");
        }
    }
    Some(viewer.finish(&ticket, outcome, make_backend))
}

/// Prints what was loaded, or why nothing was.
pub fn print_summary<B: RenderBackend>(viewer: &Viewer<B>, embedded: bool) {
    match viewer.state() {
        ViewState::Ready => {}
        ViewState::Empty => {
            println!("No model to display.");
            return;
        }
        ViewState::Loading => {
            println!("Model is still loading.");
            return;
        }
        ViewState::Failed(err) => {
            println!("{}", err.user_message(embedded));
            return;
        }
    }
    let Some(report) = viewer.report() else {
        return;
    };
    if let Some(url) = viewer.download_url() {
        println!("Model: {url}");
    }
    println!("Format: {} (attempts: {})", report.format, report.attempt_chain());
    println!("Meshes: {}, triangles: {}", report.meshes, report.triangles);
    println!("Scale: {:.4}", report.framing.scale);
    if let Some(bounds) = report.framing.bounds {
        let size = bounds.size();
        println!("Bounds: {:.3} x {:.3} x {:.3}", size.x, size.y, size.z);
    }
    println!("Camera distance: {:.3}", report.framing.distance);
    println!(
        "Device: {:?} tier{}",
        viewer.profile().performance_tier,
        if viewer.profile().is_mobile { ", mobile" } else { "" }
    );
}

/// Backend for runs without a window. Hands out handles and draws nothing.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next: u64,
    live: usize,
}

impl HeadlessBackend {
    pub fn live_resources(&self) -> usize {
        self.live
    }

    fn allocate(&mut self) -> u64 {
        self.next += 1;
        self.live += 1;
        self.next
    }
}

impl RenderBackend for HeadlessBackend {
    fn configure(&mut self, _quality: &RenderQuality, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) {}

    fn upload_geometry(&mut self, _mesh: &Mesh) -> Result<GeometryHandle> {
        Ok(GeometryHandle(self.allocate()))
    }

    fn upload_texture(&mut self, _image: &TextureImage) -> Result<TextureHandle> {
        Ok(TextureHandle(self.allocate()))
    }

    fn release_geometry(&mut self, _handle: GeometryHandle) {
        self.live = self.live.saturating_sub(1);
    }

    fn release_texture(&mut self, _handle: TextureHandle) {
        self.live = self.live.saturating_sub(1);
    }

    fn draw(&mut self, _frame: &FrameParams, _items: &[DrawItem]) -> Result<()> {
        Ok(())
    }

    fn detach(&mut self) {}
}

/// Logical viewport of a window.
pub fn window_viewport(window: &Window) -> Viewport {
    viewport_from(window.inner_size(), window.scale_factor())
}

fn viewport_from(size: PhysicalSize<u32>, scale_factor: f64) -> Viewport {
    let scale = scale_factor.max(0.1) as f32;
    Viewport::new(size.width as f32 / scale, size.height as f32 / scale, scale)
}

/// Drives the viewer from a winit event loop until the window closes.
pub fn run_window<B: RenderBackend>(
    event_loop: &mut EventLoop<()>,
    window: Arc<Window>,
    viewer: &mut Viewer<B>,
) -> Result<()> {
    let mut app = WindowApp {
        window,
        viewer,
        input: InputState::new(),
        last_frame: Instant::now(),
        last_error: None,
    };

    event_loop
        .run_on_demand(|event, target| {
            target.set_control_flow(ControlFlow::Poll);
            if let Err(err) = app.process_event(event, target) {
                app.last_error = Some(err);
                target.exit();
            }
        })
        .map_err(|err| anyhow!("event loop failed: {err}"))?;

    info!("Viewer window closed");
    app.viewer.unmount();
    match app.last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct WindowApp<'a, B: RenderBackend> {
    window: Arc<Window>,
    viewer: &'a mut Viewer<B>,
    input: InputState,
    last_frame: Instant,
    last_error: Option<anyhow::Error>,
}

impl<B: RenderBackend> WindowApp<'_, B> {
    fn process_event(&mut self, event: Event<()>, target: &EventLoopWindowTarget<()>) -> Result<()> {
        match event {
            Event::WindowEvent { event, window_id } if window_id == self.window.id() => match event {
                WindowEvent::CloseRequested => target.exit(),
                WindowEvent::Resized(size) => {
                    self.viewer
                        .resize(viewport_from(size, self.window.scale_factor()));
                }
                WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                    self.viewer
                        .resize(viewport_from(self.window.inner_size(), scale_factor));
                }
                WindowEvent::CursorMoved { position, .. } => {
                    self.input
                        .set_mouse_position(Vec2::new(position.x as f32, position.y as f32));
                }
                WindowEvent::CursorLeft { .. } => self.input.pointer_left(),
                WindowEvent::MouseInput { state, button, .. } => {
                    self.handle_mouse_button(state, button);
                }
                WindowEvent::MouseWheel { delta, .. } => {
                    // Wheel up moves the camera closer.
                    let delta_y = match delta {
                        MouseScrollDelta::LineDelta(_, y) => y,
                        MouseScrollDelta::PixelDelta(position) => position.y as f32,
                    };
                    self.input.scroll(-delta_y);
                }
                WindowEvent::RedrawRequested => self.draw_frame()?,
                _ => {}
            },
            Event::AboutToWait => self.window.request_redraw(),
            _ => {}
        }
        Ok(())
    }

    fn draw_frame(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).min(Duration::from_millis(100));
        self.last_frame = now;
        self.viewer.apply_gesture(self.input.take_gesture());
        self.viewer.frame(dt).context("failed to draw frame")?;
        Ok(())
    }

    fn handle_mouse_button(&self, state: ElementState, button: WinitMouseButton) {
        let index = match button {
            WinitMouseButton::Left => 0,
            WinitMouseButton::Middle => 1,
            WinitMouseButton::Right => 2,
            WinitMouseButton::Back => 3,
            WinitMouseButton::Forward => 4,
            WinitMouseButton::Other(value) => value.min(u8::MAX as u16) as u8,
        };
        let button = MouseButton::new(index);
        match state {
            ElementState::Pressed => self.input.set_mouse_button_down(button),
            ElementState::Released => self.input.set_mouse_button_up(button),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewerConfig;
    use crate::device::DeviceProfile;

    fn write_obj(dir: &std::path::Path) -> String {
        let path = dir.join("cube.obj");
        std::fs::write(&path, "v 0 0 0\nv 2 0 0\nv 0 2 0\nf 1 2 3\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn local_file_loads_headless() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(dir.path());
        let navigation = NavigationContext {
            path: "/".into(),
            query: vec![("model".into(), path.clone())],
        };
        let mut viewer: Viewer<HeadlessBackend> = Viewer::new(
            ViewerConfig::default(),
            DeviceProfile::default(),
            Viewport::new(800.0, 600.0, 1.0),
        );
        let transport = NativeTransport::new().unwrap();
        let applied = load_model(&mut viewer, &transport, &navigation, None, || {
            Ok(HeadlessBackend::default())
        });
        assert_eq!(applied, Some(Applied::Presented));
        let report = viewer.report().unwrap();
        assert_eq!(report.format, crate::format::ModelFormat::Obj);
        assert_eq!(report.triangles, 1);
        assert_eq!(viewer.download_url(), Some(path.as_str()));
        assert_eq!(viewer.session().unwrap().backend().live_resources(), 1);
    }

    #[test]
    fn viewport_is_logical() {
        let viewport = viewport_from(PhysicalSize::new(1600, 1200), 2.0);
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert_eq!(viewport.device_pixel_ratio, 2.0);
    }
}
