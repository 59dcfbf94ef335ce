//! Write-only progress and debug sink shared by every stage.
//!
//! Events are appended to an in-memory trace (rendered by the debug overlay)
//! and mirrored to the `log` facade. Nothing in here can fail.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::format::ModelFormat;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DiagnosticEvent {
    Debug(String),
    Progress {
        format: ModelFormat,
        loaded: u64,
        total: Option<u64>,
    },
    Warning(String),
    Error(String),
}

/// Events kept in the trace; older ones are dropped first.
pub const MAX_TRACE_EVENTS: usize = 512;

#[derive(Debug, Default)]
struct Channel {
    trace: VecDeque<DiagnosticEvent>,
    recorded: u64,
    percent: Option<u8>,
    last_error: Option<String>,
}

impl Channel {
    fn record(&mut self, event: DiagnosticEvent) {
        if self.trace.len() == MAX_TRACE_EVENTS {
            self.trace.pop_front();
        }
        self.trace.push_back(event);
        self.recorded += 1;
    }
}

/// Cloneable handle to the diagnostics channel.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Mutex<Channel>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("{message}");
        self.inner.lock().record(DiagnosticEvent::Debug(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.inner.lock().record(DiagnosticEvent::Warning(message));
    }

    /// Records a user-visible error; the latest one is kept for display.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        let mut channel = self.inner.lock();
        channel.last_error = Some(message.clone());
        channel.record(DiagnosticEvent::Error(message));
    }

    /// Records transfer progress. A percentage is only derived when the
    /// transport reported a non-zero total.
    pub fn progress(&self, format: ModelFormat, loaded: u64, total: Option<u64>) {
        let percent = total
            .filter(|&total| total > 0)
            .map(|total| ((loaded.min(total) * 100) / total) as u8);
        if let Some(percent) = percent {
            log::debug!("loading {format}: {percent}%");
        }
        let mut channel = self.inner.lock();
        if percent.is_some() {
            channel.percent = percent;
        }
        channel.record(DiagnosticEvent::Progress {
            format,
            loaded,
            total,
        });
    }

    pub fn percent(&self) -> Option<u8> {
        self.inner.lock().percent
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Clears the per-load view (percentage, error) but keeps the trace.
    pub fn reset_progress(&self) {
        let mut channel = self.inner.lock();
        channel.percent = None;
        channel.last_error = None;
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.inner.lock().trace.iter().cloned().collect()
    }

    /// Total events ever recorded, including those rotated out of the trace.
    pub fn recorded(&self) -> u64 {
        self.inner.lock().recorded
    }

    /// Human-readable trace, one event per line.
    pub fn render_trace(&self) -> String {
        let channel = self.inner.lock();
        let mut text = String::new();
        for event in &channel.trace {
            let line = match event {
                DiagnosticEvent::Debug(message) => message.clone(),
                DiagnosticEvent::Warning(message) => format!("warning: {message}"),
                DiagnosticEvent::Error(message) => format!("error: {message}"),
                DiagnosticEvent::Progress {
                    format,
                    loaded,
                    total: Some(total),
                } if *total > 0 => {
                    format!("Loading {format}: {}%", ((*loaded).min(*total) * 100) / *total)
                }
                DiagnosticEvent::Progress { format, loaded, .. } => {
                    format!("Loading {format}: {loaded} bytes")
                }
            };
            text.push_str(&line);
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_without_total_has_no_percentage() {
        let diagnostics = Diagnostics::new();
        diagnostics.progress(ModelFormat::Glb, 512, None);
        assert_eq!(diagnostics.percent(), None);
        diagnostics.progress(ModelFormat::Glb, 512, Some(1024));
        assert_eq!(diagnostics.percent(), Some(50));
        assert_eq!(diagnostics.events().len(), 2);
    }

    #[test]
    fn clones_share_one_trace() {
        let diagnostics = Diagnostics::new();
        let other = diagnostics.clone();
        other.debug("from clone");
        diagnostics.error("boom");
        assert_eq!(diagnostics.events().len(), 2);
        assert_eq!(other.last_error().as_deref(), Some("boom"));
        assert_eq!(diagnostics.render_trace(), "from clone\nerror: boom\n");
    }

    #[test]
    fn trace_keeps_only_the_newest_events() {
        let diagnostics = Diagnostics::new();
        for i in 0..MAX_TRACE_EVENTS + 10 {
            diagnostics.debug(format!("event {i}"));
        }
        let events = diagnostics.events();
        assert_eq!(events.len(), MAX_TRACE_EVENTS);
        assert_eq!(events[0], DiagnosticEvent::Debug("event 10".into()));
        assert_eq!(diagnostics.recorded(), (MAX_TRACE_EVENTS + 10) as u64);
        assert!(diagnostics.render_trace().ends_with(&format!("event {}\n", MAX_TRACE_EVENTS + 9)));
    }
}
