//! Error types for both sides of a channel.

use std::backtrace::{Backtrace, BacktraceStatus};

use serde_json::Value;

use crate::bridge::protocol::{ErrorRecord, RemoteFault};

/// Failure of one call, as observed by the controller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The channel's execution context has exited or was terminated.
    #[error("Worker is not alive")]
    NotAlive,

    /// The worker reported a failure (handler error, unhandled method).
    #[error("{0}")]
    Remote(RemoteFault),

    #[error("transport error: {0}")]
    Transport(String),

    /// The result arrived but did not match the requested type.
    #[error("failed to decode result: {0}")]
    Decode(String),
}

impl CallError {
    pub fn fault(&self) -> Option<&RemoteFault> {
        match self {
            Self::Remote(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_not_alive(&self) -> bool {
        matches!(self, Self::NotAlive)
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failure raised by a worker-side method handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Structured error, serialized as an [`ErrorRecord`].
    #[error("{name}: {message}")]
    Error {
        name: String,
        message: String,
        trace: String,
    },

    /// Arbitrary raised value, carried to the caller unchanged.
    #[error("{0}")]
    Value(Value),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let trace = render_trace(&name, &message);
        Self::Error {
            name,
            message,
            trace,
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn unhandled_method(method: &str) -> Self {
        Self::named(
            "UnhandledMethodError",
            format!("Method {} is unhandled", method),
        )
    }

    pub fn into_fault(self) -> RemoteFault {
        match self {
            Self::Error {
                name,
                message,
                trace,
            } => RemoteFault::Record(ErrorRecord {
                message,
                name,
                trace,
            }),
            Self::Value(value) => RemoteFault::Value(value),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Error {
            name: "Error".to_string(),
            message: err.to_string(),
            // Debug rendering carries the context chain and, when enabled, the backtrace.
            trace: format!("{:?}", err),
        }
    }
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        Self::named("TransportError", err.to_string())
    }
}

fn render_trace(name: &str, message: &str) -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => format!("{}: {}\n{}", name, message, backtrace),
        _ => format!("{}: {}", name, message),
    }
}

/// Failure moving messages through an execution context.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("execution context is closed")]
    Closed,

    #[error("transfer buffer {index} is already detached")]
    Detached { index: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
