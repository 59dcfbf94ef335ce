use thiserror::Error;

use crate::cascade::LoadAttempt;
use crate::format::ModelFormat;

/// Number of leading body bytes echoed into parser error messages.
pub const PREVIEW_LEN: usize = 24;

/// Failure to obtain bytes for a URL or path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("HTTP {status} while fetching {url}")]
    Status { url: String, status: u16 },
    #[error("network error while fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("unable to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// A parser rejected the bytes it was given.
///
/// The message always carries a printable preview of the leading bytes so the
/// cascade can tell a format mismatch apart from a corrupt file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (leading bytes: \"{preview}\")")]
pub struct ParseError {
    pub format: ModelFormat,
    pub message: String,
    pub preview: String,
}

impl ParseError {
    pub fn new(format: ModelFormat, message: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            format,
            message: message.into(),
            preview: preview_bytes(leading_content(bytes)),
        }
    }
}

/// Skips a UTF-8 byte order mark and leading whitespace.
pub fn leading_content(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Renders the first [`PREVIEW_LEN`] bytes, replacing anything unprintable with `.`.
pub fn preview_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(PREVIEW_LEN)
        .map(|&b| {
            if (0x20..=0x7e).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// The resolution endpoint could not produce a usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    #[error("resolution endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("resolution endpoint reported status {0:?}")]
    Status(String),
    #[error("malformed resolution response: {0}")]
    Malformed(String),
}

/// User-visible failure states of the viewer.
#[derive(Debug, Clone, Error)]
pub enum ViewerError {
    #[error("could not resolve the model: {0}")]
    Resolution(#[from] ResolutionFailure),
    #[error("failed to load model after {} attempt(s): {last_message}", attempts.len())]
    ParseExhausted {
        attempts: Vec<LoadAttempt>,
        last_message: String,
    },
    #[error("renderer error: {0}")]
    Render(String),
}

const EXHAUSTED_SUGGESTIONS: &[&str] = &[
    "Check that the model URL is reachable from this device.",
    "Check that the file extension matches the actual file format.",
    "Check that the server allows cross-origin requests (CORS).",
];

impl ViewerError {
    /// Actionable hints shown below the error text.
    pub fn suggestions(&self) -> &'static [&'static str] {
        match self {
            Self::ParseExhausted { .. } => EXHAUSTED_SUGGESTIONS,
            _ => &[],
        }
    }

    /// Text rendered in place of the canvas.
    pub fn user_message(&self, embedded: bool) -> String {
        match self {
            Self::Resolution(_) if embedded => {
                "This model link has expired. Please send the file to the bot again.".to_string()
            }
            Self::Resolution(_) => "No model to display. Send a 3D model file to the bot to view it here."
                .to_string(),
            Self::ParseExhausted { last_message, .. } => {
                let mut text = format!("Error loading model: {last_message}");
                for hint in self.suggestions() {
                    text.push_str("\n- ");
                    text.push_str(hint);
                }
                text
            }
            Self::Render(message) => format!("Unable to start the 3D view: {message}"),
        }
    }
}
