use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use pollster::block_on;

use model_viewer::error::TransportError;
use model_viewer::format::{detect, probe_and_publish};
use model_viewer::render::{DrawItem, FrameParams};
use model_viewer::scene::{GeometryHandle, Mesh, TextureHandle, TextureImage};
use model_viewer::source::HttpResolutionClient;
use model_viewer::transport::Progress;
use model_viewer::{
    Applied, AttemptOutcome, DetectedFormat, DeviceProfile, Epoch, FrameOutcome, LoaderCascade,
    ModelFormat, NavigationContext, RenderBackend, RenderQuality, SourceResolver, Transport,
    ViewState, Viewer, ViewerConfig, Viewport,
};

const BASE: &str = "https://viewer.test";

#[derive(Clone, Default)]
struct MemoryTransport {
    bodies: Arc<HashMap<String, Vec<u8>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MemoryTransport {
    fn new(bodies: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            bodies: Arc::new(bodies.into_iter().collect()),
            fetched: Arc::default(),
        }
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.fetched.lock().iter().filter(|u| *u == url).count()
    }

    fn body(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.bodies.get(url).cloned().ok_or(TransportError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

impl Transport for MemoryTransport {
    async fn fetch(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<u8>, TransportError> {
        self.fetched.lock().push(url.to_string());
        let body = self.body(url)?;
        on_progress(Progress {
            loaded: body.len() as u64,
            total: Some(body.len() as u64),
        });
        Ok(body)
    }

    async fn fetch_prefix(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut body = self.body(url)?;
        body.truncate(max_bytes);
        Ok(body)
    }
}

#[derive(Debug, Default)]
struct BackendLog {
    live: usize,
    uploads: usize,
    draws: usize,
    detached: bool,
    draws_after_detach: usize,
    created: usize,
}

#[derive(Debug, Clone, Default)]
struct RecordingBackend {
    log: Arc<Mutex<BackendLog>>,
    next: u64,
}

impl RecordingBackend {
    fn create(&self) -> Result<Self> {
        self.log.lock().created += 1;
        Ok(self.clone())
    }

    fn allocate(&mut self) -> u64 {
        let mut log = self.log.lock();
        log.live += 1;
        log.uploads += 1;
        self.next += 1;
        self.next
    }
}

impl RenderBackend for RecordingBackend {
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
        self.log.lock().live -= 1;
    }

    fn release_texture(&mut self, _handle: TextureHandle) {
        self.log.lock().live -= 1;
    }

    fn draw(&mut self, _frame: &FrameParams, _items: &[DrawItem]) -> Result<()> {
        let mut log = self.log.lock();
        log.draws += 1;
        if log.detached {
            log.draws_after_detach += 1;
        }
        Ok(())
    }

    fn detach(&mut self) {
        self.log.lock().detached = true;
    }
}

/// A unit quad scaled to `size`, as glTF JSON plus its binary buffer.
fn quad_gltf(size: f32, buffer_uri: Option<&str>) -> (String, Vec<u8>) {
    let mut buffer = Vec::new();
    for value in [0.0, 0.0, 0.0, size, 0.0, 0.0, size, size, 0.0, 0.0, size, 0.0f32] {
        buffer.extend_from_slice(&value.to_le_bytes());
    }
    for index in [0u16, 1, 2, 0, 2, 3] {
        buffer.extend_from_slice(&index.to_le_bytes());
    }
    let uri = buffer_uri
        .map(|uri| format!(r#","uri":"{uri}""#))
        .unwrap_or_default();
    let json = format!(
        r#"{{"asset":{{"version":"2.0"}},"scene":0,"scenes":[{{"nodes":[0]}}],"nodes":[{{"mesh":0}}],
"meshes":[{{"primitives":[{{"attributes":{{"POSITION":0}},"indices":1}}]}}],
"buffers":[{{"byteLength":60{uri}}}],
"bufferViews":[{{"buffer":0,"byteOffset":0,"byteLength":48}},{{"buffer":0,"byteOffset":48,"byteLength":12}}],
"accessors":[{{"bufferView":0,"componentType":5126,"count":4,"type":"VEC3","min":[0,0,0],"max":[{size},{size},0]}},
{{"bufferView":1,"componentType":5123,"count":6,"type":"SCALAR"}}]}}"#
    );
    (json, buffer)
}

fn quad_glb(size: f32) -> Vec<u8> {
    let (json, bin) = quad_gltf(size, None);
    let mut json = json.into_bytes();
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut glb = Vec::with_capacity(total);
    glb.extend_from_slice(b"glTF");
    glb.extend_from_slice(&2u32.to_le_bytes());
    glb.extend_from_slice(&(total as u32).to_le_bytes());
    glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
    glb.extend_from_slice(b"JSON");
    glb.extend_from_slice(&json);
    glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    glb.extend_from_slice(b"BIN\0");
    glb.extend_from_slice(&bin);
    glb
}

const OBJ: &str = "# exported\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";

fn viewer() -> Viewer<RecordingBackend> {
    let config = ViewerConfig {
        base_url: BASE.to_string(),
        ..ViewerConfig::default()
    };
    Viewer::new(config, DeviceProfile::default(), Viewport::new(800.0, 600.0, 1.0))
}

fn navigation(query: &[(&str, &str)]) -> NavigationContext {
    NavigationContext {
        path: "/view".to_string(),
        query: query
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

/// Resolves, probes, runs the cascade and presents, all for one generation.
fn open(
    viewer: &mut Viewer<RecordingBackend>,
    transport: &MemoryTransport,
    navigation: &NavigationContext,
    backend: &RecordingBackend,
) -> Option<Applied> {
    let config = viewer.config().clone();
    let diagnostics = viewer.diagnostics().clone();
    let client = HttpResolutionClient::new(transport.clone(), BASE);
    let outcome = block_on(SourceResolver::new(&client, &config, &diagnostics).resolve(navigation, None));
    let ticket = viewer.apply_source(outcome)?;
    let reference = viewer.reference().cloned()?;
    let detected = viewer.detected().clone();
    block_on(probe_and_publish(
        transport,
        reference.origin_url(),
        config.probe_bytes,
        &detected,
        &ticket,
        &diagnostics,
    ));
    let outcome = block_on(
        LoaderCascade::new(transport, &diagnostics, &detected).run(&reference, detect(&reference), &ticket),
    );
    Some(viewer.finish(&ticket, outcome, || backend.create()))
}

#[test]
fn glb_in_comfortable_band_is_presented_unscaled() {
    let url = format!("{BASE}/models/abc/model.glb");
    let transport = MemoryTransport::new([(url.clone(), quad_glb(3.0))]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();

    let applied = open(&mut viewer, &transport, &navigation(&[("model", &url)]), &backend);
    assert_eq!(applied, Some(Applied::Presented));
    let report = viewer.report().expect("report");
    assert_eq!(report.format, ModelFormat::Glb);
    assert_eq!(report.framing.scale, 1.0);
    assert_eq!(report.triangles, 2);
    assert_eq!(viewer.frame(Duration::from_millis(16)).unwrap(), FrameOutcome::Drawn);
    assert_eq!(backend.log.lock().draws, 1);
}

#[test]
fn oversized_gltf_with_external_buffer_is_scaled_down() {
    let url = format!("{BASE}/models/big/scene.gltf");
    let buffer_url = format!("{BASE}/models/big/quad.bin");
    let (json, buffer) = quad_gltf(200.0, Some("quad.bin"));
    let transport = MemoryTransport::new([(url.clone(), json.into_bytes()), (buffer_url.clone(), buffer)]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();

    let applied = open(&mut viewer, &transport, &navigation(&[("model", &url)]), &backend);
    assert_eq!(applied, Some(Applied::Presented));
    assert_eq!(transport.fetch_count(&buffer_url), 1);
    let framing = viewer.report().expect("report").framing;
    assert!((framing.scale - 5.0 / 200.0).abs() < 1e-6);
    let bounds = framing.bounds.expect("bounds");
    assert!((bounds.max_dimension() - 5.0).abs() < 1e-3);
    assert!(bounds.center().length() < 1e-3);
}

#[test]
fn declared_glb_carrying_obj_falls_back_to_obj() {
    let url = format!("{BASE}/models/abc/model.glb");
    let transport = MemoryTransport::new([(url.clone(), OBJ.as_bytes().to_vec())]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();

    let applied = open(
        &mut viewer,
        &transport,
        &navigation(&[("model", &url), ("ext", ".glb")]),
        &backend,
    );
    assert_eq!(applied, Some(Applied::Presented));
    let attempts: Vec<_> = viewer
        .report()
        .expect("report")
        .attempts
        .iter()
        .map(|a| (a.format_tried, a.outcome))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (ModelFormat::Glb, AttemptOutcome::ParseError),
            (ModelFormat::Obj, AttemptOutcome::Success)
        ]
    );
}

#[test]
fn default_endpoint_is_asked_exactly_once() {
    let lookup = format!("{BASE}/view");
    let model = format!("{BASE}/models/abc/model.glb");
    let response = r#"{"status":"success","model_url":"/models/abc/model.glb"}"#;
    let transport = MemoryTransport::new([
        (lookup.clone(), response.as_bytes().to_vec()),
        (model.clone(), quad_glb(1.0)),
    ]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();

    let applied = open(&mut viewer, &transport, &navigation(&[]), &backend);
    assert_eq!(applied, Some(Applied::Presented));
    assert_eq!(transport.fetch_count(&lookup), 1);
    assert_eq!(viewer.download_url(), Some(model.as_str()));
}

#[test]
fn lookup_without_a_model_leaves_the_view_empty() {
    let transport = MemoryTransport::new([(format!("{BASE}/view"), br#"{"status":"success"}"#.to_vec())]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();

    assert_eq!(open(&mut viewer, &transport, &navigation(&[]), &backend), None);
    assert!(matches!(viewer.state(), ViewState::Empty));
    assert_eq!(backend.log.lock().created, 0);
}

#[test]
fn superseded_load_never_reaches_the_renderer() {
    let first = format!("{BASE}/models/a/model.glb");
    let transport = MemoryTransport::new([(first.clone(), quad_glb(1.0))]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();
    let config = viewer.config().clone();
    let diagnostics = viewer.diagnostics().clone();
    let client = HttpResolutionClient::new(transport.clone(), BASE);

    let outcome = block_on(
        SourceResolver::new(&client, &config, &diagnostics).resolve(&navigation(&[("model", &first)]), None),
    );
    let stale = viewer.apply_source(outcome).expect("ticket");
    let reference = viewer.reference().cloned().expect("reference");
    let detected = viewer.detected().clone();
    let outcome = block_on(
        LoaderCascade::new(&transport, &diagnostics, &detected).run(&reference, detect(&reference), &stale),
    );

    let next = block_on(
        SourceResolver::new(&client, &config, &diagnostics)
            .resolve(&navigation(&[("model", &format!("{BASE}/models/b/model.obj"))]), None),
    );
    let current = viewer.apply_source(next).expect("ticket");
    assert!(!stale.is_live() && current.is_live());

    assert_eq!(viewer.finish(&stale, outcome, || backend.create()), Applied::Stale);
    assert_eq!(backend.log.lock().created, 0);
    assert!(matches!(viewer.state(), ViewState::Loading));
}

#[test]
fn unmount_releases_everything_and_stops_drawing() {
    let url = format!("{BASE}/models/abc/model.glb");
    let transport = MemoryTransport::new([(url.clone(), quad_glb(2.0))]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();
    open(&mut viewer, &transport, &navigation(&[("model", &url)]), &backend);
    viewer.frame(Duration::from_millis(16)).unwrap();

    viewer.unmount();
    assert_eq!(viewer.frame(Duration::from_millis(16)).unwrap(), FrameOutcome::Inactive);
    let log = backend.log.lock();
    assert!(log.uploads > 0);
    assert_eq!(log.live, 0);
    assert!(log.detached);
    assert_eq!(log.draws_after_detach, 0);
}

#[test]
fn auto_rotate_stops_after_its_window() {
    let url = format!("{BASE}/models/abc/model.glb");
    let transport = MemoryTransport::new([(url.clone(), quad_glb(2.0))]);
    let backend = RecordingBackend::default();
    let mut viewer = viewer();
    open(&mut viewer, &transport, &navigation(&[("model", &url)]), &backend);

    let rotating = |viewer: &Viewer<RecordingBackend>| {
        viewer.session().expect("session").controls().is_auto_rotating()
    };
    assert!(rotating(&viewer));
    for _ in 0..49 {
        viewer.frame(Duration::from_millis(100)).unwrap();
    }
    assert!(rotating(&viewer));
    for _ in 0..2 {
        viewer.frame(Duration::from_millis(100)).unwrap();
    }
    assert!(!rotating(&viewer));
}

#[test]
fn probe_results_only_apply_to_their_generation() {
    let epoch = Epoch::new();
    let detected = DetectedFormat::new();
    let old = epoch.advance();
    detected.publish(old.generation(), ModelFormat::Obj);
    let current = epoch.advance();
    assert_eq!(detected.get(current.generation()), None);
    assert_eq!(detected.get(old.generation()), Some(ModelFormat::Obj));
}
