#![cfg(target_arch = "wasm32")]
//! Browser embedding: mounts a canvas into a host element, resolves the
//! model from the page location and the chat host's launch data, and drives
//! the render loop from `requestAnimationFrame`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use gloo_events::EventListener;
use js_sys::{Function, Reflect};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;
use web_sys::{window, Document, HtmlCanvasElement, HtmlElement, Window};

use crate::cascade::{CascadeOutcome, LoaderCascade};
use crate::config::ViewerConfig;
use crate::device::{DeviceProfile, DeviceSignals, RenderQuality};
use crate::format::{detect, probe_and_publish};
use crate::input::wasm::CanvasInputHandler;
use crate::input::InputState;
use crate::render::{GpuBackend, Viewport};
use crate::source::{HttpResolutionClient, LaunchContext, NavigationContext, SourceResolver};
use crate::viewer::{ViewState, Viewer};

mod fetch;

pub use fetch::FetchTransport;

/// Longest frame step fed to the controls; larger gaps (a hidden tab) are
/// clamped so damping and auto-rotate do not jump.
const MAX_FRAME_STEP: Duration = Duration::from_millis(100);

#[wasm_bindgen(start)]
pub fn bootstrap() {
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
}

/// Handle held by the host page for one mounted viewer.
#[wasm_bindgen]
pub struct WebViewer {
    inner: Rc<RefCell<AppState>>,
}

#[wasm_bindgen]
impl WebViewer {
    /// Creates the canvas inside the element with id `container_id`.
    pub fn mount(container_id: &str) -> Result<WebViewer, JsValue> {
        let state = AppState::mount(container_id).map_err(to_js)?;
        let inner = Rc::new(RefCell::new(state));
        install_resize_listener(&inner).map_err(to_js)?;
        schedule_animation_loop(Rc::clone(&inner)).map_err(to_js)?;
        Ok(Self { inner })
    }

    /// Resolves and loads the model described by a query string such as
    /// `?model=...&ext=.glb`. Replaces whatever is currently shown.
    pub fn set_source(&self, search: &str) {
        let path = window()
            .and_then(|win| win.location().pathname().ok())
            .unwrap_or_else(|| "/".to_string());
        let navigation = NavigationContext::from_parts(&path, search);
        let app = Rc::clone(&self.inner);
        spawn_local(async move {
            if let Err(err) = load(Rc::clone(&app), navigation).await {
                log::error!("load failed: {err:?}");
            }
        });
    }

    /// Tears the viewer down and removes its elements from the page.
    pub fn unmount(&self) {
        self.inner.borrow_mut().unmount();
    }

    /// Location of the model on screen, for the download button.
    pub fn download_url(&self) -> Option<String> {
        self.inner.borrow().viewer.download_url().map(str::to_string)
    }

    /// Text shown instead of the model, if any.
    pub fn status(&self) -> Option<String> {
        self.inner.borrow().status_text()
    }
}

struct AppState {
    viewer: Viewer<GpuBackend>,
    launch: Option<LaunchContext>,
    container: HtmlElement,
    canvas: HtmlCanvasElement,
    status: HtmlElement,
    overlay: HtmlElement,
    input: Arc<InputState>,
    _input_handler: CanvasInputHandler,
    resize_listener: Option<EventListener>,
    animation_closure: Option<Closure<dyn FnMut(f64)>>,
    animation_handle: Option<i32>,
    last_timestamp: Option<f64>,
    shown_status: Option<String>,
    shown_trace: u64,
    debug: bool,
    mounted: bool,
}

impl AppState {
    fn mount(container_id: &str) -> Result<Self> {
        let window = window().ok_or_else(|| anyhow!("window not available"))?;
        let document = window
            .document()
            .ok_or_else(|| anyhow!("document not available"))?;
        let container = document
            .get_element_by_id(container_id)
            .ok_or_else(|| anyhow!("element #{container_id} not found"))?
            .dyn_into::<HtmlElement>()
            .map_err(|_| anyhow!("element #{container_id} is not an HTML element"))?;

        let canvas = create_element::<HtmlCanvasElement>(&document, "canvas")?;
        set_style(&canvas, "width:100%;height:100%;display:block;touch-action:none;");
        let status = create_element::<HtmlElement>(&document, "div")?;
        set_style(
            &status,
            "position:absolute;inset:0;display:none;align-items:center;justify-content:center;\
             text-align:center;white-space:pre-line;padding:1em;font-family:sans-serif;",
        );
        let overlay = create_element::<HtmlElement>(&document, "pre")?;
        set_style(
            &overlay,
            "position:absolute;left:0;bottom:0;max-height:40%;overflow:auto;margin:0;display:none;\
             font-size:11px;background:rgba(0,0,0,0.6);color:#fff;pointer-events:none;",
        );
        for element in [canvas.unchecked_ref::<HtmlElement>(), &status, &overlay] {
            container
                .append_child(element)
                .map_err(|err| anyhow!("failed to append element: {err:?}"))?;
        }

        let launch = launch_context(&window);
        let mut config = ViewerConfig::default();
        if let Ok(origin) = window.location().origin() {
            config.base_url = origin;
        }
        let profile = DeviceProfile::classify(&device_signals(&window));
        log::info!("Device profile: {profile:?}");

        let input = Arc::new(InputState::new());
        let input_handler = CanvasInputHandler::attach(&canvas, Arc::clone(&input));
        let viewport = container_viewport(&window, &container);

        let state = Self {
            viewer: Viewer::new(config, profile, viewport),
            launch,
            container,
            canvas,
            status,
            overlay,
            input,
            _input_handler: input_handler,
            resize_listener: None,
            animation_closure: None,
            animation_handle: None,
            last_timestamp: None,
            shown_status: None,
            shown_trace: 0,
            debug: false,
            mounted: true,
        };
        state.sync_canvas_size(viewport);
        Ok(state)
    }

    /// Backing-store size the render session will configure for `viewport`.
    fn physical_size(&self, viewport: Viewport) -> (u32, u32) {
        let quality = RenderQuality::for_profile(
            self.viewer.profile(),
            viewport.device_pixel_ratio,
            self.viewer.config().frame_skip,
        );
        viewport.physical_size(quality.pixel_ratio)
    }

    fn sync_canvas_size(&self, viewport: Viewport) {
        let (width, height) = self.physical_size(viewport);
        self.canvas.set_width(width);
        self.canvas.set_height(height);
    }

    fn resize(&mut self) {
        let Some(window) = window() else {
            return;
        };
        let viewport = container_viewport(&window, &self.container);
        self.sync_canvas_size(viewport);
        self.viewer.resize(viewport);
    }

    fn render_frame(&mut self, timestamp: f64) -> Result<()> {
        let dt = self
            .last_timestamp
            .map(|last| Duration::from_secs_f64(((timestamp - last) / 1000.0).max(0.0)))
            .unwrap_or_default()
            .min(MAX_FRAME_STEP);
        self.last_timestamp = Some(timestamp);

        self.viewer.apply_gesture(self.input.take_gesture());
        self.viewer.frame(dt)?;
        self.refresh_status();
        Ok(())
    }

    fn status_text(&self) -> Option<String> {
        let embedded = self.launch.is_some();
        match self.viewer.state() {
            ViewState::Ready => None,
            ViewState::Empty => {
                Some("No model to display. Send a 3D model file to the bot to view it here.".to_string())
            }
            ViewState::Loading => Some(match self.viewer.diagnostics().percent() {
                Some(percent) => format!("Loading model... {percent}%"),
                None => "Loading model...".to_string(),
            }),
            ViewState::Failed(err) => Some(err.user_message(embedded)),
        }
    }

    fn refresh_status(&mut self) {
        let text = self.status_text();
        if text != self.shown_status {
            let visible = text.is_some();
            self.status.set_text_content(text.as_deref());
            let _ = self
                .status
                .style()
                .set_property("display", if visible { "flex" } else { "none" });
            let _ = self
                .canvas
                .style()
                .set_property("visibility", if visible { "hidden" } else { "visible" });
            self.shown_status = text;
        }

        if self.debug {
            let events = self.viewer.diagnostics().recorded();
            if events != self.shown_trace {
                self.overlay
                    .set_text_content(Some(&self.viewer.diagnostics().render_trace()));
                self.shown_trace = events;
            }
        }
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
        self.shown_trace = 0;
        let _ = self
            .overlay
            .style()
            .set_property("display", if debug { "block" } else { "none" });
    }

    fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        if let (Some(window), Some(handle)) = (window(), self.animation_handle.take()) {
            let _ = window.cancel_animation_frame(handle);
        }
        self.animation_closure = None;
        self.resize_listener = None;
        self.viewer.unmount();
        for element in [self.canvas.unchecked_ref::<HtmlElement>(), &self.status, &self.overlay] {
            element.remove();
        }
        log::info!("Viewer unmounted");
    }
}

async fn load(app: Rc<RefCell<AppState>>, navigation: NavigationContext) -> Result<()> {
    let (claim, config, diagnostics, launch) = {
        let mut state = app.borrow_mut();
        state.set_debug(navigation.debug_requested());
        (
            state.viewer.claim_resolution(),
            state.viewer.config().clone(),
            state.viewer.diagnostics().clone(),
            state.launch.clone(),
        )
    };

    let transport = FetchTransport::new();
    let client = HttpResolutionClient::new(transport.clone(), config.base_url.clone());
    let outcome = SourceResolver::new(&client, &config, &diagnostics)
        .resolve(&navigation, launch.as_ref())
        .await;

    let (ticket, reference, detected) = {
        let mut state = app.borrow_mut();
        if !state.mounted {
            return Ok(());
        }
        let Some(ticket) = state.viewer.apply_resolved(&claim, outcome) else {
            state.refresh_status();
            return Ok(());
        };
        let reference = state
            .viewer
            .reference()
            .cloned()
            .ok_or_else(|| anyhow!("load started without a reference"))?;
        (ticket, reference, state.viewer.detected().clone())
    };

    {
        let transport = transport.clone();
        let url = reference.origin_url().to_string();
        let detected = detected.clone();
        let ticket = ticket.clone();
        let diagnostics = diagnostics.clone();
        let max_bytes = config.probe_bytes;
        spawn_local(async move {
            probe_and_publish(&transport, &url, max_bytes, &detected, &ticket, &diagnostics).await;
        });
    }

    let outcome = LoaderCascade::new(&transport, &diagnostics, &detected)
        .run(&reference, detect(&reference), &ticket)
        .await;
    if !ticket.is_live() {
        return Ok(());
    }

    let backend = match outcome {
        CascadeOutcome::Loaded { .. } => {
            let (canvas, (width, height)) = {
                let state = app.borrow();
                let viewport = container_viewport_of(&state);
                (state.canvas.clone(), state.physical_size(viewport))
            };
            Some(GpuBackend::new(wgpu::SurfaceTarget::Canvas(canvas), width, height).await)
        }
        _ => None,
    };
    if !ticket.is_live() {
        return Ok(());
    }

    let mut state = app.borrow_mut();
    state.viewer.finish(&ticket, outcome, move || {
        backend.unwrap_or_else(|| Err(anyhow!("renderer was not created")))
    });
    state.refresh_status();
    Ok(())
}

fn schedule_animation_loop(app: Rc<RefCell<AppState>>) -> Result<()> {
    let window = window().ok_or_else(|| anyhow!("window not available"))?;
    let app_clone = Rc::clone(&app);

    let closure = Closure::wrap(Box::new(move |timestamp: f64| {
        let mut state = app_clone.borrow_mut();
        if !state.mounted {
            return;
        }
        if let Err(err) = state.render_frame(timestamp) {
            log::error!("frame failed: {err:?}");
        }
        let Some(window) = web_sys::window() else {
            return;
        };
        let Some(callback) = state.animation_closure.as_ref() else {
            return;
        };
        match window.request_animation_frame(callback.as_ref().unchecked_ref()) {
            Ok(handle) => state.animation_handle = Some(handle),
            Err(err) => log::error!("requestAnimationFrame failed: {err:?}"),
        }
    }) as Box<dyn FnMut(f64)>);

    let handle = window
        .request_animation_frame(closure.as_ref().unchecked_ref())
        .map_err(|err| anyhow!("requestAnimationFrame failed: {err:?}"))?;

    let mut state = app.borrow_mut();
    state.animation_handle = Some(handle);
    state.animation_closure = Some(closure);
    Ok(())
}

fn install_resize_listener(app: &Rc<RefCell<AppState>>) -> Result<()> {
    let window = window().ok_or_else(|| anyhow!("window not available"))?;
    let app_clone = Rc::clone(app);
    let listener = EventListener::new(&window, "resize", move |_| {
        app_clone.borrow_mut().resize();
    });
    app.borrow_mut().resize_listener = Some(listener);
    Ok(())
}

fn container_viewport(window: &Window, container: &HtmlElement) -> Viewport {
    Viewport::new(
        container.client_width().max(1) as f32,
        container.client_height().max(1) as f32,
        window.device_pixel_ratio() as f32,
    )
}

fn container_viewport_of(state: &AppState) -> Viewport {
    match window() {
        Some(window) => container_viewport(&window, &state.container),
        None => Viewport::new(1.0, 1.0, 1.0),
    }
}

fn create_element<T: JsCast>(document: &Document, tag: &str) -> Result<T> {
    document
        .create_element(tag)
        .map_err(|err| anyhow!("failed to create <{tag}>: {err:?}"))?
        .dyn_into::<T>()
        .map_err(|_| anyhow!("<{tag}> has an unexpected element type"))
}

fn set_style(element: &HtmlElement, css: &str) {
    element.style().set_css_text(css);
}

fn device_signals(window: &Window) -> DeviceSignals {
    let navigator = window.navigator();
    let memory_gib = Reflect::get(&navigator, &JsValue::from_str("deviceMemory"))
        .ok()
        .and_then(|value| value.as_f64())
        .map(|gib| gib as f32);
    let cores = navigator.hardware_concurrency();
    DeviceSignals {
        user_agent: navigator.user_agent().ok(),
        logical_cores: (cores.is_finite() && cores >= 1.0).then_some(cores as u32),
        memory_gib,
    }
}

/// Reads `Telegram.WebApp.initDataUnsafe` when the page runs inside the
/// chat host, and tells the host the viewer is ready.
fn launch_context(window: &Window) -> Option<LaunchContext> {
    let webapp = object_at(window, "Telegram").and_then(|telegram| object_at(&telegram, "WebApp"))?;
    for method in ["ready", "expand"] {
        if let Some(function) = object_at(&webapp, method).and_then(|f| f.dyn_into::<Function>().ok()) {
            let _ = function.call0(&webapp);
        }
    }
    let init_data = object_at(&webapp, "initDataUnsafe")?;
    let read = |key: &str| {
        Reflect::get(&init_data, &JsValue::from_str(key))
            .ok()
            .and_then(|value| value.as_string())
            .filter(|value| !value.is_empty())
    };
    Some(LaunchContext {
        start_param: read("start_param"),
        start_command: read("start_command"),
    })
}

fn object_at(target: &JsValue, key: &str) -> Option<JsValue> {
    Reflect::get(target, &JsValue::from_str(key))
        .ok()
        .filter(|value| !value.is_undefined() && !value.is_null())
}

fn to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}
