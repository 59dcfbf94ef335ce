//! Drives format attempts for one model reference until a parser accepts
//! the bytes or no plausible format is left.
//!
//! The first attempt uses the detector's answer. After a parse failure the
//! next format comes from the content probe when it has published one for
//! this generation, otherwise from [`classify_failure`]. Transport failures
//! end the cascade immediately.

use std::collections::HashMap;

use serde::Serialize;

use crate::diagnostics::Diagnostics;
use crate::error::{ParseError, TransportError, ViewerError};
use crate::format::{DetectedFormat, Detection, ModelFormat};
use crate::loaders::{decode_image, ParseInput};
use crate::scene::{SceneGraph, TextureSource};
use crate::source::ModelReference;
use crate::transport::{directory_of, resolve_relative, Transport};
use crate::viewer::LoadTicket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    /// The attempt was abandoned because the reference was superseded.
    Pending,
    Success,
    ParseError,
    NetworkError,
}

/// Record of one format tried for a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadAttempt {
    pub format_tried: ModelFormat,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

impl LoadAttempt {
    fn new(format: ModelFormat, outcome: AttemptOutcome, detail: Option<String>) -> Self {
        Self {
            format_tried: format,
            outcome,
            error_detail: detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CascadeState {
    Idle,
    Attempting(ModelFormat),
    Succeeded(ModelFormat),
    ExhaustedFailure,
    Cancelled,
}

/// One row of the mismatch table: while attempting one of `attempting`,
/// an error message containing `marker` (and a JSON syntax tell, when
/// `needs_syntax_tell` is set) means the bytes are really `inferred`.
struct MismatchRule {
    attempting: &'static [ModelFormat],
    needs_syntax_tell: bool,
    marker: &'static str,
    inferred: ModelFormat,
}

const GLTF_FAMILY: &[ModelFormat] = &[ModelFormat::Glb, ModelFormat::Gltf];
const OBJ_ONLY: &[ModelFormat] = &[ModelFormat::Obj];
const FBX_ONLY: &[ModelFormat] = &[ModelFormat::Fbx];

const SYNTAX_TELLS: [&str; 4] = ["unexpected token", "syntax error", "syntaxerror", "not valid json"];

// Markers are matched against the lowercased message.
const MISMATCH_RULES: &[MismatchRule] = &[
    MismatchRule {
        attempting: GLTF_FAMILY,
        needs_syntax_tell: true,
        marker: "kaydara fbx binary",
        inferred: ModelFormat::Fbx,
    },
    MismatchRule {
        attempting: GLTF_FAMILY,
        needs_syntax_tell: true,
        marker: "leading bytes: \"; fbx",
        inferred: ModelFormat::Fbx,
    },
    MismatchRule {
        attempting: GLTF_FAMILY,
        needs_syntax_tell: true,
        marker: "leading bytes: \"#",
        inferred: ModelFormat::Obj,
    },
    MismatchRule {
        attempting: GLTF_FAMILY,
        needs_syntax_tell: true,
        marker: "leading bytes: \"v ",
        inferred: ModelFormat::Obj,
    },
    MismatchRule {
        attempting: GLTF_FAMILY,
        needs_syntax_tell: true,
        marker: "leading bytes: \"mtllib",
        inferred: ModelFormat::Obj,
    },
    MismatchRule {
        attempting: OBJ_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"gltf",
        inferred: ModelFormat::Glb,
    },
    MismatchRule {
        attempting: OBJ_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"kaydara",
        inferred: ModelFormat::Fbx,
    },
    MismatchRule {
        attempting: OBJ_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"{",
        inferred: ModelFormat::Gltf,
    },
    MismatchRule {
        attempting: FBX_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"gltf",
        inferred: ModelFormat::Glb,
    },
    MismatchRule {
        attempting: FBX_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"{",
        inferred: ModelFormat::Gltf,
    },
    MismatchRule {
        attempting: FBX_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"#",
        inferred: ModelFormat::Obj,
    },
    MismatchRule {
        attempting: FBX_ONLY,
        needs_syntax_tell: false,
        marker: "leading bytes: \"v ",
        inferred: ModelFormat::Obj,
    },
];

/// Infers the real format from a parser's error message, if it reveals one.
pub fn classify_failure(attempted: ModelFormat, message: &str) -> Option<ModelFormat> {
    let lowered = message.to_ascii_lowercase();
    let has_syntax_tell = SYNTAX_TELLS.iter().any(|tell| lowered.contains(tell));
    MISMATCH_RULES
        .iter()
        .filter(|rule| rule.attempting.contains(&attempted))
        .filter(|rule| has_syntax_tell || !rule.needs_syntax_tell)
        .find(|rule| lowered.contains(rule.marker))
        .map(|rule| rule.inferred)
}

/// Where one attempt fetches from and what relative references resolve
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub format: ModelFormat,
    /// Explicit resource directory. FBX files reference their textures
    /// relative to the model's directory rather than to the model itself.
    pub resource_path: Option<String>,
}

impl LoadRequest {
    pub fn new(url: &str, format: ModelFormat) -> Self {
        let resource_path = (format == ModelFormat::Fbx).then(|| directory_of(url));
        Self {
            url: url.to_string(),
            format,
            resource_path,
        }
    }

    pub fn resource_base(&self) -> &str {
        self.resource_path.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug)]
pub enum CascadeOutcome {
    Loaded {
        scene: SceneGraph,
        format: ModelFormat,
        attempts: Vec<LoadAttempt>,
    },
    Exhausted {
        attempts: Vec<LoadAttempt>,
        last_message: String,
    },
    Cancelled {
        attempts: Vec<LoadAttempt>,
    },
}

impl CascadeOutcome {
    pub fn state(&self) -> CascadeState {
        match self {
            Self::Loaded { format, .. } => CascadeState::Succeeded(*format),
            Self::Exhausted { .. } => CascadeState::ExhaustedFailure,
            Self::Cancelled { .. } => CascadeState::Cancelled,
        }
    }

    pub fn attempts(&self) -> &[LoadAttempt] {
        match self {
            Self::Loaded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts } => attempts,
        }
    }

    /// The user-facing error of an exhausted cascade.
    pub fn into_error(self) -> Option<ViewerError> {
        match self {
            Self::Exhausted {
                attempts,
                last_message,
            } => Some(ViewerError::ParseExhausted {
                attempts,
                last_message,
            }),
            _ => None,
        }
    }
}

enum AttemptError {
    Network(TransportError),
    Parse(ParseError),
    Superseded,
}

pub struct LoaderCascade<'a, T> {
    transport: &'a T,
    diagnostics: &'a Diagnostics,
    detected: &'a DetectedFormat,
}

impl<'a, T: Transport> LoaderCascade<'a, T> {
    pub fn new(transport: &'a T, diagnostics: &'a Diagnostics, detected: &'a DetectedFormat) -> Self {
        Self {
            transport,
            diagnostics,
            detected,
        }
    }

    pub async fn run(
        &self,
        reference: &ModelReference,
        initial: Detection,
        ticket: &LoadTicket,
    ) -> CascadeOutcome {
        let url = reference.origin_url();
        let mut attempts: Vec<LoadAttempt> = Vec::new();
        let mut last_message = String::new();
        let mut next = Some(initial.format);
        self.enter(CascadeState::Idle);
        self.diagnostics.debug(format!(
            "Detected {} from {:?} for {}",
            initial.format,
            initial.source,
            reference.correlation_id()
        ));

        while let Some(format) = next.take() {
            if !ticket.is_live() {
                self.enter(CascadeState::Cancelled);
                return CascadeOutcome::Cancelled { attempts };
            }
            self.enter(CascadeState::Attempting(format));

            match self.attempt(&LoadRequest::new(url, format), ticket).await {
                Ok(scene) => {
                    attempts.push(LoadAttempt::new(format, AttemptOutcome::Success, None));
                    self.enter(CascadeState::Succeeded(format));
                    self.diagnostics.debug(format!(
                        "Loaded {format}: {} meshes, {} triangles",
                        scene.meshes.len(),
                        scene.triangle_count()
                    ));
                    return CascadeOutcome::Loaded {
                        scene,
                        format,
                        attempts,
                    };
                }
                Err(AttemptError::Superseded) => {
                    attempts.push(LoadAttempt::new(format, AttemptOutcome::Pending, None));
                    self.enter(CascadeState::Cancelled);
                    return CascadeOutcome::Cancelled { attempts };
                }
                Err(AttemptError::Network(err)) => {
                    last_message = err.to_string();
                    attempts.push(LoadAttempt::new(
                        format,
                        AttemptOutcome::NetworkError,
                        Some(last_message.clone()),
                    ));
                }
                Err(AttemptError::Parse(err)) => {
                    last_message = err.to_string();
                    self.diagnostics
                        .warn(format!("{format} parser failed: {last_message}"));
                    attempts.push(LoadAttempt::new(
                        format,
                        AttemptOutcome::ParseError,
                        Some(last_message.clone()),
                    ));
                    next = self.next_format(format, &last_message, &attempts, ticket);
                }
            }
        }

        if !ticket.is_live() {
            self.enter(CascadeState::Cancelled);
            return CascadeOutcome::Cancelled { attempts };
        }
        self.enter(CascadeState::ExhaustedFailure);
        self.diagnostics.error(format!("Error loading model: {last_message}"));
        CascadeOutcome::Exhausted {
            attempts,
            last_message,
        }
    }

    fn enter(&self, state: CascadeState) {
        self.diagnostics.debug(format!("Cascade state: {state:?}"));
    }

    fn next_format(
        &self,
        failed: ModelFormat,
        message: &str,
        attempts: &[LoadAttempt],
        ticket: &LoadTicket,
    ) -> Option<ModelFormat> {
        let untried = |format: &ModelFormat| !attempts.iter().any(|a| a.format_tried == *format);

        if let Some(format) = self.detected.get(ticket.generation()).filter(untried) {
            self.diagnostics
                .debug(format!("Content probe says {format}; retrying"));
            return Some(format);
        }
        let inferred = classify_failure(failed, message).filter(untried);
        if let Some(format) = inferred {
            self.diagnostics
                .debug(format!("{failed} error looks like {format} content; retrying"));
        }
        inferred
    }

    async fn attempt(
        &self,
        request: &LoadRequest,
        ticket: &LoadTicket,
    ) -> Result<SceneGraph, AttemptError> {
        let format = request.format;
        if let Some(path) = &request.resource_path {
            self.diagnostics
                .debug(format!("Resource path for {format}: {path}"));
        }

        let diagnostics = self.diagnostics;
        let bytes = self
            .transport
            .fetch(&request.url, &mut |progress| {
                diagnostics.progress(format, progress.loaded, progress.total)
            })
            .await
            .map_err(AttemptError::Network)?;
        if !ticket.is_live() {
            return Err(AttemptError::Superseded);
        }

        let parser = format.parser();
        let mut resources = HashMap::new();
        for reference in parser.dependencies(&bytes) {
            let location = resolve_relative(request.resource_base(), &reference);
            match self.transport.fetch(&location, &mut |_| {}).await {
                Ok(body) => {
                    resources.insert(reference, body);
                }
                Err(err) => self
                    .diagnostics
                    .warn(format!("Missing resource {reference}: {err}")),
            }
        }
        if !ticket.is_live() {
            return Err(AttemptError::Superseded);
        }

        let mut scene = parser
            .parse(&ParseInput {
                url: &request.url,
                bytes: &bytes,
                resource_base: request.resource_base(),
                resources: &resources,
            })
            .map_err(AttemptError::Parse)?;

        self.resolve_textures(&mut scene).await;
        if !ticket.is_live() {
            return Err(AttemptError::Superseded);
        }
        Ok(scene)
    }

    /// Fetches and decodes external textures. A texture that cannot be
    /// loaded stays without an image and renders untextured.
    async fn resolve_textures(&self, scene: &mut SceneGraph) {
        for texture in &mut scene.textures {
            let TextureSource::Uri(location) = &texture.source else {
                continue;
            };
            if texture.image.is_some() {
                continue;
            }
            let decoded = match self.transport.fetch(location, &mut |_| {}).await {
                Ok(body) => decode_image(&body).map_err(|err| format!("{err:#}")),
                Err(err) => Err(err.to_string()),
            };
            match decoded {
                Ok(image) => texture.image = Some(image),
                Err(message) => self
                    .diagnostics
                    .warn(format!("Texture {location} unavailable: {message}")),
            }
        }
    }
}
