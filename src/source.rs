//! Decides which model a view session shows and where it lives.
//!
//! Sources are consulted in strict priority order: an explicit `model` query
//! parameter, the host-injected launch parameter, the `uuid` query parameter
//! and finally the default resolution endpoint. Resolution never fails
//! outward; anything unusable becomes [`SourceOutcome::NoModel`] or
//! [`SourceOutcome::Unresolved`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::config::ViewerConfig;
use crate::diagnostics::Diagnostics;
use crate::error::ResolutionFailure;
use crate::format::{self, DeclaredExtension};
use crate::transport::{is_http, Transport};

const DEFAULT_EXTENSION: &str = ".glb";

/// Resolved pointer to a model's location and declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReference {
    origin_url: String,
    declared_extension: DeclaredExtension,
    correlation_id: String,
}

impl ModelReference {
    pub fn new(
        origin_url: impl Into<String>,
        declared_extension: DeclaredExtension,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            origin_url: origin_url.into(),
            declared_extension,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn origin_url(&self) -> &str {
        &self.origin_url
    }

    pub fn declared_extension(&self) -> DeclaredExtension {
        self.declared_extension
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Current location: route path plus decoded query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationContext {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl NavigationContext {
    /// Builds a context from a route path and a raw query string (with or
    /// without the leading `?`).
    pub fn from_parts(path: &str, search: &str) -> Self {
        let search = search.strip_prefix('?').unwrap_or(search);
        Self {
            path: path.to_string(),
            query: form_urlencoded::parse(search.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect(),
        }
    }

    /// Accepts a full URL or a `/path?query` string.
    pub fn from_location(location: &str) -> Self {
        let location = location.split('#').next().unwrap_or(location);
        let (path, search) = location.split_once('?').unwrap_or((location, ""));
        let path = if is_http(path) {
            url::Url::parse(path)
                .map(|url| url.path().to_string())
                .unwrap_or_else(|_| path.to_string())
        } else {
            path.to_string()
        };
        Self::from_parts(&path, search)
    }

    /// First non-empty value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .find(|value| !value.is_empty())
    }

    pub fn debug_requested(&self) -> bool {
        matches!(self.param("debug"), Some("1" | "true" | "yes"))
    }
}

/// Values the host application injects when it launches the viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchContext {
    pub start_param: Option<String>,
    pub start_command: Option<String>,
}

impl LaunchContext {
    fn candidates(&self) -> impl Iterator<Item = &str> {
        [self.start_param.as_deref(), self.start_command.as_deref()]
            .into_iter()
            .flatten()
    }
}

/// What a launch parameter turned out to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    ModelUrl(String),
    Identifier(String),
}

/// Decodes a launch parameter: `<prefix><percent-encoded payload>` or a bare
/// id-like token.
pub fn parse_launch_param(raw: &str, prefix: &str) -> Option<LaunchTarget> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(payload) = raw.strip_prefix(prefix).filter(|_| !prefix.is_empty()) {
        let decoded = percent_decode_str(payload).decode_utf8_lossy();
        let decoded = decoded.trim();
        if decoded.is_empty() {
            return None;
        }
        if is_http(decoded) {
            return Some(LaunchTarget::ModelUrl(decoded.to_string()));
        }
        let id = extract_uuid(decoded).unwrap_or(decoded);
        return Some(LaunchTarget::Identifier(id.to_string()));
    }
    if let Some(uuid) = extract_uuid(raw) {
        return Some(LaunchTarget::Identifier(uuid.to_string()));
    }
    is_id_like(raw).then(|| LaunchTarget::Identifier(raw.to_string()))
}

fn is_id_like(token: &str) -> bool {
    token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && token.contains(['-', '_'])
}

/// Finds the first `8-4-4-4-12` hex UUID inside free text.
pub fn extract_uuid(text: &str) -> Option<&str> {
    const LEN: usize = 36;
    let bytes = text.as_bytes();
    if bytes.len() < LEN {
        return None;
    }
    (0..=bytes.len() - LEN)
        .find(|&start| is_uuid(&bytes[start..start + LEN]))
        .map(|start| &text[start..start + LEN])
}

fn is_uuid(candidate: &[u8]) -> bool {
    candidate.iter().enumerate().all(|(index, &b)| match index {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// Resolution endpoint paths; the one used follows the current route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionEndpoint {
    View,
    Viewer,
    MiniApp,
}

impl ResolutionEndpoint {
    pub fn from_route(path: &str) -> Self {
        let path = path.to_ascii_lowercase();
        if path.contains("miniapp") {
            Self::MiniApp
        } else if path.contains("viewer") {
            Self::Viewer
        } else {
            Self::View
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::View => "/view",
            Self::Viewer => "/viewer",
            Self::MiniApp => "/miniapp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub endpoint: ResolutionEndpoint,
    pub uuid: Option<String>,
    pub ext: Option<String>,
}

impl ResolutionRequest {
    pub fn url(&self, base_url: &str) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(uuid) = &self.uuid {
            query.append_pair("uuid", uuid);
        }
        if let Some(ext) = &self.ext {
            query.append_pair("ext", ext);
        }
        let query = query.finish();
        let base = base_url.trim_end_matches('/');
        if query.is_empty() {
            format!("{base}{}", self.endpoint.path())
        } else {
            format!("{base}{}?{query}", self.endpoint.path())
        }
    }
}

/// JSON body returned by the resolution endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResolutionResponse {
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Storage-side lookup of a model by identifier.
#[allow(async_fn_in_trait)]
pub trait ResolutionClient {
    async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolutionResponse, ResolutionFailure>;
}

/// Resolution over any [`Transport`], decoding the JSON body.
#[derive(Debug, Clone)]
pub struct HttpResolutionClient<T> {
    transport: T,
    base_url: String,
}

impl<T: Transport> HttpResolutionClient<T> {
    pub fn new(transport: T, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }
}

impl<T: Transport> ResolutionClient for HttpResolutionClient<T> {
    async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolutionResponse, ResolutionFailure> {
        let url = request.url(&self.base_url);
        let body = self
            .transport
            .fetch(&url, &mut |_| {})
            .await
            .map_err(|err| ResolutionFailure::Unreachable(err.to_string()))?;
        serde_json::from_slice(&body).map_err(|err| ResolutionFailure::Malformed(err.to_string()))
    }
}

/// Result of source resolution for one view session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Model(ModelReference),
    NoModel,
    Unresolved(ResolutionFailure),
}

pub struct SourceResolver<'a, C> {
    client: &'a C,
    config: &'a ViewerConfig,
    diagnostics: &'a Diagnostics,
}

impl<'a, C: ResolutionClient> SourceResolver<'a, C> {
    pub fn new(client: &'a C, config: &'a ViewerConfig, diagnostics: &'a Diagnostics) -> Self {
        Self {
            client,
            config,
            diagnostics,
        }
    }

    pub async fn resolve(
        &self,
        navigation: &NavigationContext,
        launch: Option<&LaunchContext>,
    ) -> SourceOutcome {
        let ext_param = navigation.param("ext");

        if let Some(model_url) = navigation.param("model") {
            self.diagnostics
                .debug(format!("Model URL from query parameter: {model_url}"));
            return SourceOutcome::Model(self.explicit_reference(model_url, ext_param, None));
        }

        let endpoint = ResolutionEndpoint::from_route(&navigation.path);
        let launch_target = launch.and_then(|launch| {
            launch
                .candidates()
                .find_map(|raw| parse_launch_param(raw, &self.config.launch_prefix))
        });
        match launch_target {
            Some(LaunchTarget::ModelUrl(url)) => {
                self.diagnostics
                    .debug(format!("Model URL from launch parameter: {url}"));
                return SourceOutcome::Model(self.explicit_reference(&url, ext_param, None));
            }
            Some(LaunchTarget::Identifier(id)) => {
                self.diagnostics
                    .debug(format!("Model id from launch parameter: {id}"));
                return self.resolve_remote(endpoint, Some(id), ext_param).await;
            }
            None => {}
        }

        if let Some(uuid) = navigation.param("uuid") {
            self.diagnostics
                .debug(format!("Model id from query parameter: {uuid}"));
            return self
                .resolve_remote(endpoint, Some(uuid.to_string()), ext_param)
                .await;
        }

        self.diagnostics.debug(format!(
            "No model parameters; asking default endpoint {}",
            endpoint.path()
        ));
        self.resolve_remote(endpoint, None, ext_param).await
    }

    fn explicit_reference(
        &self,
        url: &str,
        ext_param: Option<&str>,
        id: Option<&str>,
    ) -> ModelReference {
        let extension = ext_param
            .map(str::to_string)
            .or_else(|| url_extension(url))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        let correlation_id = id
            .map(str::to_string)
            .or_else(|| extract_uuid(url).map(str::to_string))
            .unwrap_or_else(|| url_correlation_id(url));
        ModelReference::new(url, DeclaredExtension::parse(&extension), correlation_id)
    }

    async fn resolve_remote(
        &self,
        endpoint: ResolutionEndpoint,
        uuid: Option<String>,
        ext_param: Option<&str>,
    ) -> SourceOutcome {
        let request = ResolutionRequest {
            endpoint,
            uuid: uuid.clone(),
            ext: ext_param.map(str::to_string),
        };
        let response = match self.client.resolve(&request).await {
            Ok(response) => response,
            Err(failure) => {
                self.diagnostics.warn(format!("Model lookup failed: {failure}"));
                return SourceOutcome::Unresolved(failure);
            }
        };

        if let Some(status) = response.status.as_deref() {
            if !matches!(status.to_ascii_lowercase().as_str(), "success" | "ok") {
                self.diagnostics
                    .warn(format!("Model lookup returned status {status}"));
                return SourceOutcome::Unresolved(ResolutionFailure::Status(status.to_string()));
            }
        }

        let id = response.uuid.clone().filter(|id| !id.is_empty()).or(uuid);
        let base = response
            .base_url
            .as_deref()
            .filter(|base| !base.is_empty())
            .unwrap_or(&self.config.base_url)
            .trim_end_matches('/')
            .to_string();
        let extension = ext_param
            .map(str::to_string)
            .or_else(|| response.file_extension.clone().filter(|ext| !ext.is_empty()));

        let model_url = match response.model_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                if url.starts_with('/') {
                    format!("{base}{url}")
                } else {
                    url.to_string()
                }
            }
            _ => match &id {
                Some(id) => {
                    let extension = extension.as_deref().unwrap_or(DEFAULT_EXTENSION);
                    let extension = format::normalize_extension(extension);
                    format!("{base}/models/{id}/model.{extension}")
                }
                None => {
                    self.diagnostics.debug("Lookup returned no model");
                    return SourceOutcome::NoModel;
                }
            },
        };

        self.diagnostics
            .debug(format!("Lookup resolved model URL: {model_url}"));
        let ext = extension.as_deref();
        SourceOutcome::Model(self.explicit_reference(&model_url, ext, id.as_deref()))
    }
}

fn url_extension(url: &str) -> Option<String> {
    let path = format::strip_query(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    segment
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
        .filter(|ext| ext.len() > 1)
}

fn url_correlation_id(url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    format!("url-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct RecordingClient {
        response: Result<ResolutionResponse, ResolutionFailure>,
        calls: RefCell<Vec<ResolutionRequest>>,
    }

    impl RecordingClient {
        fn answering(response: ResolutionResponse) -> Self {
            Self {
                response: Ok(response),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing(failure: ResolutionFailure) -> Self {
            Self {
                response: Err(failure),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ResolutionClient for RecordingClient {
        async fn resolve(
            &self,
            request: &ResolutionRequest,
        ) -> Result<ResolutionResponse, ResolutionFailure> {
            self.calls.borrow_mut().push(request.clone());
            self.response.clone()
        }
    }

    const ID: &str = "0f8e4c2a-1b3d-4e5f-8a9b-0c1d2e3f4a5b";

    fn run(
        client: &RecordingClient,
        navigation: &NavigationContext,
        launch: Option<&LaunchContext>,
    ) -> SourceOutcome {
        let config = ViewerConfig::default();
        let diagnostics = Diagnostics::new();
        let resolver = SourceResolver::new(client, &config, &diagnostics);
        pollster::block_on(resolver.resolve(navigation, launch))
    }

    #[test]
    fn explicit_model_param_wins_and_skips_lookup() {
        let client = RecordingClient::answering(ResolutionResponse::default());
        let navigation =
            NavigationContext::from_location("/view?model=https%3A%2F%2Fcdn%2Fchair.fbx&uuid=x-y");
        let launch = LaunchContext {
            start_param: Some(ID.to_string()),
            start_command: None,
        };
        let SourceOutcome::Model(reference) = run(&client, &navigation, Some(&launch)) else {
            panic!("expected a model");
        };
        assert_eq!(reference.origin_url(), "https://cdn/chair.fbx");
        assert_eq!(reference.declared_extension(), DeclaredExtension::Fbx);
        assert!(client.calls.borrow().is_empty());
    }

    #[test]
    fn ext_param_overrides_url_extension() {
        let client = RecordingClient::answering(ResolutionResponse::default());
        let navigation = NavigationContext::from_location("/view?model=https://h/m.bin&ext=.obj");
        let SourceOutcome::Model(reference) = run(&client, &navigation, None) else {
            panic!("expected a model");
        };
        assert_eq!(reference.declared_extension(), DeclaredExtension::Obj);
    }

    #[test]
    fn launch_param_beats_uuid_param() {
        let client = RecordingClient::answering(ResolutionResponse {
            model_url: Some("/models/abc/model.glb".into()),
            status: Some("success".into()),
            ..Default::default()
        });
        let navigation = NavigationContext::from_location("/miniapp?uuid=11111111-2222");
        let launch = LaunchContext {
            start_param: Some(format!("model_{ID}")),
            start_command: None,
        };
        let SourceOutcome::Model(reference) = run(&client, &navigation, Some(&launch)) else {
            panic!("expected a model");
        };
        let calls = client.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].uuid.as_deref(), Some(ID));
        assert_eq!(calls[0].endpoint, ResolutionEndpoint::MiniApp);
        assert_eq!(
            reference.origin_url(),
            "http://localhost:5000/models/abc/model.glb"
        );
        assert_eq!(reference.correlation_id(), ID);
    }

    #[test]
    fn launch_prefix_with_encoded_url_is_used_directly() {
        let target = parse_launch_param("model_https%3A%2F%2Fcdn.example%2Fa.obj", "model_");
        assert_eq!(
            target,
            Some(LaunchTarget::ModelUrl("https://cdn.example/a.obj".into()))
        );
        assert_eq!(
            parse_launch_param("abc_123", "model_"),
            Some(LaunchTarget::Identifier("abc_123".into()))
        );
        assert_eq!(parse_launch_param("hello", "model_"), None);
        assert_eq!(parse_launch_param("  ", "model_"), None);
    }

    #[test]
    fn no_parameters_call_default_endpoint_once_without_uuid() {
        let client = RecordingClient::answering(ResolutionResponse {
            status: Some("success".into()),
            ..Default::default()
        });
        let navigation = NavigationContext::from_location("/viewer");
        assert_eq!(run(&client, &navigation, None), SourceOutcome::NoModel);
        let calls = client.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].uuid, None);
        assert_eq!(calls[0].url("http://h/"), "http://h/viewer");
    }

    #[test]
    fn uuid_without_model_url_builds_storage_url() {
        let client = RecordingClient::answering(ResolutionResponse {
            uuid: Some(ID.into()),
            file_extension: Some(".FBX".into()),
            base_url: Some("https://files.example/".into()),
            status: Some("ok".into()),
            ..Default::default()
        });
        let navigation = NavigationContext::from_location(&format!("/view?uuid={ID}"));
        let SourceOutcome::Model(reference) = run(&client, &navigation, None) else {
            panic!("expected a model");
        };
        assert_eq!(
            reference.origin_url(),
            format!("https://files.example/models/{ID}/model.fbx")
        );
        assert_eq!(reference.declared_extension(), DeclaredExtension::Fbx);
    }

    #[test]
    fn lookup_failures_become_unresolved() {
        let client = RecordingClient::failing(ResolutionFailure::Unreachable("down".into()));
        let navigation = NavigationContext::from_location(&format!("/view?uuid={ID}"));
        assert!(matches!(
            run(&client, &navigation, None),
            SourceOutcome::Unresolved(ResolutionFailure::Unreachable(_))
        ));

        let client = RecordingClient::answering(ResolutionResponse {
            status: Some("error".into()),
            ..Default::default()
        });
        assert!(matches!(
            run(&client, &navigation, None),
            SourceOutcome::Unresolved(ResolutionFailure::Status(_))
        ));
    }

    #[test]
    fn extracts_uuid_from_text() {
        let text = format!("/start {ID} please");
        assert_eq!(extract_uuid(&text), Some(ID));
        assert_eq!(extract_uuid("no id here"), None);
    }
}
