//! Model resolution, format detection and adaptive rendering for a 3D model
//! viewer embedded in a chat client.
//!
//! A page location (or the chat host's launch data) is resolved into a
//! [`ModelReference`], the loader cascade retries other parsers when the
//! declared format turns out to be wrong, the parsed scene is normalized to
//! a predictable size, and a [`RenderSession`] draws it with quality chosen
//! from the device profile. The crate builds both as a native binary (with
//! a headless `--summary-only` mode) and as a wasm module exporting
//! [`WebViewer`](web::WebViewer).

#[cfg(not(target_arch = "wasm32"))]
pub mod app;
pub mod cascade;
pub mod config;
pub mod controls;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod format;
pub mod input;
pub mod loaders;
pub mod normalize;
pub mod render;
pub mod scene;
pub mod source;
pub mod transport;
pub mod viewer;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use cascade::{AttemptOutcome, CascadeOutcome, CascadeState, LoadAttempt, LoaderCascade};
pub use config::ViewerConfig;
pub use controls::OrbitControls;
pub use device::{DeviceProfile, DeviceSignals, PerformanceTier, RenderQuality};
pub use diagnostics::{DiagnosticEvent, Diagnostics};
pub use error::{ParseError, ResolutionFailure, TransportError, ViewerError};
pub use format::{DetectedFormat, Detection, DetectionSource, ModelFormat};
pub use input::{Gesture, InputState, MouseButton};
pub use normalize::{Framing, SceneNormalizer};
pub use render::{FrameOutcome, GpuBackend, RenderBackend, RenderSession, Viewport};
pub use scene::SceneGraph;
pub use source::{
    LaunchContext, ModelReference, NavigationContext, ResolutionClient, SourceOutcome,
    SourceResolver,
};
#[cfg(not(target_arch = "wasm32"))]
pub use transport::NativeTransport;
pub use transport::Transport;
pub use viewer::{Applied, Epoch, LoadReport, LoadTicket, ViewState, Viewer};
