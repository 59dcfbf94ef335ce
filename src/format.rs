//! Works out which parser a model actually needs.
//!
//! Signals are consulted in order of trust: the declared extension, the URL
//! path, substring heuristics on the URL, and finally a live probe of the
//! leading body bytes. The probe runs alongside the first load attempt and
//! publishes into a [`DetectedFormat`] cell that the cascade reads when an
//! attempt fails.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::leading_content;
use crate::source::ModelReference;
use crate::transport::Transport;
use crate::viewer::LoadTicket;

/// Formats the viewer has a parser for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Glb,
    Gltf,
    Fbx,
    Obj,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 4] = [Self::Glb, Self::Gltf, Self::Fbx, Self::Obj];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Glb => "glb",
            Self::Gltf => "gltf",
            Self::Fbx => "fbx",
            Self::Obj => "obj",
        }
    }

    /// Accepts `glb`, `.GLB`, ` .glb ` and so on.
    pub fn from_extension(raw: &str) -> Option<Self> {
        match normalize_extension(raw).as_str() {
            "glb" => Some(Self::Glb),
            "gltf" => Some(Self::Gltf),
            "fbx" => Some(Self::Fbx),
            "obj" => Some(Self::Obj),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Glb => "model/gltf-binary",
            Self::Gltf => "model/gltf+json",
            Self::Fbx => "application/octet-stream",
            Self::Obj => "text/plain",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Lowercases and strips surrounding whitespace and a leading dot.
pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension carried by the model reference, possibly unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredExtension {
    Glb,
    Gltf,
    Fbx,
    Obj,
    Unknown,
}

impl DeclaredExtension {
    pub fn parse(raw: &str) -> Self {
        match ModelFormat::from_extension(raw) {
            Some(ModelFormat::Glb) => Self::Glb,
            Some(ModelFormat::Gltf) => Self::Gltf,
            Some(ModelFormat::Fbx) => Self::Fbx,
            Some(ModelFormat::Obj) => Self::Obj,
            None => Self::Unknown,
        }
    }

    pub fn format(self) -> Option<ModelFormat> {
        match self {
            Self::Glb => Some(ModelFormat::Glb),
            Self::Gltf => Some(ModelFormat::Gltf),
            Self::Fbx => Some(ModelFormat::Fbx),
            Self::Obj => Some(ModelFormat::Obj),
            Self::Unknown => None,
        }
    }
}

/// Which signal produced a format decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionSource {
    Declared,
    UrlPath,
    UrlHeuristic,
    Default,
    ContentProbe,
    FailureInference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub format: ModelFormat,
    pub source: DetectionSource,
}

const HEURISTIC_ORDER: [ModelFormat; 4] = [
    ModelFormat::Obj,
    ModelFormat::Fbx,
    ModelFormat::Gltf,
    ModelFormat::Glb,
];

/// Best-guess format for a reference. Never fails: with no usable signal the
/// answer is glTF binary, the most common container.
pub fn detect(reference: &ModelReference) -> Detection {
    if let Some(format) = reference.declared_extension().format() {
        return Detection {
            format,
            source: DetectionSource::Declared,
        };
    }
    let url = reference.origin_url();
    if let Some(format) = format_from_url_path(url) {
        return Detection {
            format,
            source: DetectionSource::UrlPath,
        };
    }
    if let Some(format) = format_from_url_heuristic(url) {
        return Detection {
            format,
            source: DetectionSource::UrlHeuristic,
        };
    }
    Detection {
        format: ModelFormat::Glb,
        source: DetectionSource::Default,
    }
}

/// Extension of the last path segment, ignoring query and fragment.
pub fn format_from_url_path(url: &str) -> Option<ModelFormat> {
    let path = strip_query(url);
    let segment = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let (_, extension) = segment.rsplit_once('.')?;
    ModelFormat::from_extension(extension)
}

/// `Accept` header for a request: the model's content type when the URL
/// names a model file, JSON otherwise (resolution lookups).
pub fn accept_for(url: &str) -> &'static str {
    format_from_url_path(url).map_or("application/json", ModelFormat::content_type)
}

/// First supported format token found anywhere in the URL.
pub fn format_from_url_heuristic(url: &str) -> Option<ModelFormat> {
    let lowered = url.to_ascii_lowercase();
    HEURISTIC_ORDER
        .into_iter()
        .find(|format| lowered.contains(format.extension()))
}

pub(crate) fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Recognizes a format from the first bytes of a body.
pub fn sniff(bytes: &[u8]) -> Option<ModelFormat> {
    if bytes.starts_with(b"glTF") {
        return Some(ModelFormat::Glb);
    }
    if bytes.starts_with(b"Kaydara FBX Binary") {
        return Some(ModelFormat::Fbx);
    }
    let text = leading_content(bytes);
    if text.starts_with(b"{") {
        return Some(ModelFormat::Gltf);
    }
    if text.starts_with(b";") {
        let header = &text[..text.len().min(64)];
        return header
            .windows(3)
            .any(|w| w == b"FBX")
            .then_some(ModelFormat::Fbx);
    }
    if text.starts_with(b"#") || text.starts_with(b"v ") || text.starts_with(b"mtllib ") {
        return Some(ModelFormat::Obj);
    }
    None
}

/// Reads only the leading bytes of `url` and sniffs them.
pub async fn probe<T: Transport>(
    transport: &T,
    url: &str,
    max_bytes: usize,
    diagnostics: &Diagnostics,
) -> Option<ModelFormat> {
    match transport.fetch_prefix(url, max_bytes).await {
        Ok(bytes) => {
            let sniffed = sniff(&bytes);
            match sniffed {
                Some(format) => diagnostics.debug(format!("Content probe: looks like {format}")),
                None => diagnostics.debug("Content probe: no known signature"),
            }
            sniffed
        }
        Err(err) => {
            diagnostics.debug(format!("Content probe skipped: {err}"));
            None
        }
    }
}

/// Runs [`probe`] and publishes the result for the ticket's generation.
pub async fn probe_and_publish<T: Transport>(
    transport: &T,
    url: &str,
    max_bytes: usize,
    cell: &DetectedFormat,
    ticket: &LoadTicket,
    diagnostics: &Diagnostics,
) {
    if let Some(format) = probe(transport, url, max_bytes, diagnostics).await {
        if ticket.is_live() {
            cell.publish(ticket.generation(), format);
        }
    }
}

/// Shared, generation-tagged format revision written by the content probe.
///
/// Last writer wins. Readers only see a value tagged with their own
/// generation, so a probe from a previous reference can never steer the
/// current cascade.
#[derive(Debug, Clone, Default)]
pub struct DetectedFormat {
    inner: Arc<RwLock<Option<(u64, ModelFormat)>>>,
}

impl DetectedFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, generation: u64, format: ModelFormat) {
        *self.inner.write() = Some((generation, format));
    }

    pub fn get(&self, generation: u64) -> Option<ModelFormat> {
        match *self.inner.read() {
            Some((tag, format)) if tag == generation => Some(format),
            _ => None,
        }
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}
