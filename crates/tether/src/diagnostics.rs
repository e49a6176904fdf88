//! Structured reports of non-fatal protocol violations.
//!
//! Channels never fail on an orphaned result, an orphaned call event or an
//! unrecognized frame; they hand a [`Diagnostic`] to the embedder's sink and
//! keep running.

use std::sync::Arc;

use crate::bridge::protocol::CallId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A result arrived for an id with no pending call.
    OrphanResult { id: CallId },
    /// A call event arrived for an id with no pending call.
    OrphanEvent { id: CallId, event_name: String },
    /// A frame decoded but its message kind is not part of the protocol.
    UnknownMessage { detail: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrphanResult { id } => write!(f, "result for unknown call {}", id),
            Self::OrphanEvent { id, event_name } => {
                write!(f, "event {:?} for unknown call {}", event_name, id)
            }
            Self::UnknownMessage { detail } => write!(f, "unknown message: {}", detail),
        }
    }
}

pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Default sink: log at warn.
pub fn log_diagnostics() -> DiagnosticSink {
    Arc::new(|diagnostic: &Diagnostic| {
        tracing::warn!(%diagnostic, "Dropped message");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_render_for_logs() {
        assert_eq!(
            Diagnostic::OrphanResult { id: 5 }.to_string(),
            "result for unknown call 5"
        );
        assert_eq!(
            Diagnostic::OrphanEvent {
                id: 2,
                event_name: "tick".to_string()
            }
            .to_string(),
            "event \"tick\" for unknown call 2"
        );
    }
}
