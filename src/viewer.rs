//! Ties the pipeline together for one mounted view: one render session,
//! one active model reference, and a generation counter that makes every
//! late callback from a superseded load harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;

use crate::cascade::{CascadeOutcome, LoadAttempt};
use crate::config::ViewerConfig;
use crate::device::DeviceProfile;
use crate::diagnostics::Diagnostics;
use crate::error::ViewerError;
use crate::format::{DetectedFormat, ModelFormat};
use crate::input::Gesture;
use crate::normalize::{Framing, SceneNormalizer};
use crate::render::{FrameOutcome, RenderBackend, RenderSession, Viewport};
use crate::scene::SceneGraph;
use crate::source::{ModelReference, SourceOutcome};

/// Monotonic load generation shared by everything spawned for a view.
#[derive(Debug, Clone, Default)]
pub struct Epoch(Arc<AtomicU64>);

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Starts a new generation; tickets from earlier ones stop being live.
    pub fn advance(&self) -> LoadTicket {
        let generation = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        LoadTicket {
            generation,
            epoch: self.clone(),
        }
    }
}

/// Proof that a callback belongs to a particular load generation.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    generation: u64,
    epoch: Epoch,
}

impl LoadTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.epoch.current() == self.generation
    }
}

#[derive(Debug, Clone)]
pub enum ViewState {
    Empty,
    Loading,
    Ready,
    Failed(ViewerError),
}

/// What [`Viewer::finish`] did with a cascade outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Presented,
    Failed,
    Stale,
}

/// Facts about the model currently on screen.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub format: ModelFormat,
    pub attempts: Vec<LoadAttempt>,
    pub meshes: usize,
    pub triangles: usize,
    pub framing: Framing,
}

impl LoadReport {
    pub fn new(scene: &SceneGraph, format: ModelFormat, attempts: Vec<LoadAttempt>, framing: Framing) -> Self {
        Self {
            format,
            attempts,
            meshes: scene.meshes.len(),
            triangles: scene.triangle_count(),
            framing,
        }
    }

    /// Formats tried, in order, e.g. `glb -> obj`.
    pub fn attempt_chain(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| attempt.format_tried.extension())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

pub struct Viewer<B: RenderBackend> {
    config: ViewerConfig,
    diagnostics: Diagnostics,
    detected: DetectedFormat,
    epoch: Epoch,
    profile: DeviceProfile,
    viewport: Viewport,
    session: Option<RenderSession<B>>,
    reference: Option<ModelReference>,
    report: Option<LoadReport>,
    state: ViewState,
}

impl<B: RenderBackend> Viewer<B> {
    pub fn new(config: ViewerConfig, profile: DeviceProfile, viewport: Viewport) -> Self {
        Self {
            config,
            diagnostics: Diagnostics::new(),
            detected: DetectedFormat::new(),
            epoch: Epoch::new(),
            profile,
            viewport,
            session: None,
            reference: None,
            report: None,
            state: ViewState::Empty,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn detected(&self) -> &DetectedFormat {
        &self.detected
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn session(&self) -> Option<&RenderSession<B>> {
        self.session.as_ref()
    }

    pub fn reference(&self) -> Option<&ModelReference> {
        self.reference.as_ref()
    }

    pub fn report(&self) -> Option<&LoadReport> {
        self.report.as_ref()
    }

    /// The resolved model location, offered unchanged as a download link.
    pub fn download_url(&self) -> Option<&str> {
        self.reference.as_ref().map(ModelReference::origin_url)
    }

    /// Switches to a new reference. The previous session is torn down
    /// before the generation moves on.
    pub fn begin(&mut self, reference: ModelReference) -> LoadTicket {
        self.release_session();
        let ticket = self.epoch.advance();
        self.detected.clear();
        self.diagnostics.reset_progress();
        info!(
            "Loading {} (generation {})",
            reference.origin_url(),
            ticket.generation()
        );
        self.reference = Some(reference);
        self.report = None;
        self.state = ViewState::Loading;
        ticket
    }

    /// Supersedes whatever is in flight before an asynchronous source
    /// lookup starts. Only the newest claim may apply its outcome.
    pub fn claim_resolution(&self) -> LoadTicket {
        self.epoch.advance()
    }

    /// [`Viewer::apply_source`] for a lookup started under `claim`. Outcomes
    /// of lookups that were overtaken by a newer one are dropped.
    pub fn apply_resolved(&mut self, claim: &LoadTicket, outcome: SourceOutcome) -> Option<LoadTicket> {
        if !claim.is_live() {
            debug!("Dropping source lookup of superseded generation {}", claim.generation());
            return None;
        }
        self.apply_source(outcome)
    }

    /// Acts on a source resolution result. Returns a ticket when a load
    /// should start.
    pub fn apply_source(&mut self, outcome: SourceOutcome) -> Option<LoadTicket> {
        match outcome {
            SourceOutcome::Model(reference) => Some(self.begin(reference)),
            SourceOutcome::NoModel => {
                self.clear();
                self.state = ViewState::Empty;
                None
            }
            SourceOutcome::Unresolved(failure) => {
                self.clear();
                self.diagnostics.error(failure.to_string());
                self.state = ViewState::Failed(ViewerError::Resolution(failure));
                None
            }
        }
    }

    /// Applies a finished cascade. `make_backend` is only called when there
    /// is a scene to show for the current generation.
    pub fn finish<F>(&mut self, ticket: &LoadTicket, outcome: CascadeOutcome, make_backend: F) -> Applied
    where
        F: FnOnce() -> Result<B>,
    {
        if !ticket.is_live() {
            debug!("Dropping outcome of superseded generation {}", ticket.generation());
            return Applied::Stale;
        }
        match outcome {
            CascadeOutcome::Loaded {
                mut scene,
                format,
                attempts,
            } => {
                let framing = SceneNormalizer::new(self.config.normalize, self.config.camera)
                    .normalize(&mut scene, format);
                self.diagnostics.debug(format!(
                    "Normalized: scale {:.4}, camera distance {:.3}",
                    framing.scale, framing.distance
                ));
                let report = LoadReport::new(&scene, format, attempts, framing);
                match self.present(scene, &framing, make_backend) {
                    Ok(()) => {
                        self.report = Some(report);
                        self.state = ViewState::Ready;
                        Applied::Presented
                    }
                    Err(err) => {
                        let message = format!("{err:#}");
                        self.diagnostics.error(format!("Renderer error: {message}"));
                        self.state = ViewState::Failed(ViewerError::Render(message));
                        Applied::Failed
                    }
                }
            }
            CascadeOutcome::Cancelled { .. } => Applied::Stale,
            exhausted @ CascadeOutcome::Exhausted { .. } => {
                if let Some(err) = exhausted.into_error() {
                    self.state = ViewState::Failed(err);
                }
                Applied::Failed
            }
        }
    }

    fn present<F>(&mut self, scene: SceneGraph, framing: &Framing, make_backend: F) -> Result<()>
    where
        F: FnOnce() -> Result<B>,
    {
        self.release_session();
        let backend = make_backend()?;
        let mut session = RenderSession::new(backend, self.profile, self.viewport, &self.config)?;
        session.present(scene, framing)?;
        self.session = Some(session);
        Ok(())
    }

    pub fn apply_gesture(&mut self, gesture: Gesture) {
        if let Some(session) = self.session.as_mut() {
            session.apply_gesture(gesture);
        }
    }

    pub fn frame(&mut self, dt: Duration) -> Result<FrameOutcome> {
        match self.session.as_mut() {
            Some(session) => session.frame(dt),
            None => Ok(FrameOutcome::Inactive),
        }
    }

    pub fn resize(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        if let Some(session) = self.session.as_mut() {
            session.resize(viewport);
        }
    }

    /// Tears everything down. Late callbacks from the current load become
    /// stale.
    pub fn unmount(&mut self) {
        self.clear();
        self.reference = None;
        self.state = ViewState::Empty;
    }

    fn clear(&mut self) {
        self.release_session();
        self.epoch.advance();
        self.detected.clear();
        self.report = None;
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.teardown();
            if !session.stats().balanced() {
                warn!("Render session released with unbalanced resources: {:?}", session.stats());
            }
        }
    }
}
