//! Execution contexts: the isolated places a worker runs.
//!
//! A [`WorkerSpawner`] starts one context and hands back a
//! [`SpawnedContext`]: a posting handle plus the stream of everything the
//! context reports (return messages, diagnostics, exit).
//!
//! - **inline**: a `WorkerChannel` on its own tokio task
//! - **process**: a child program speaking framed JSON over stdio

pub mod inline;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Envelope, ReturnMessage, SendMessage};
use crate::diagnostics::Diagnostic;
use crate::error::TransportError;

pub use inline::InProcessSpawner;
pub use process::{ProcessSpawner, ProgramSpec};

/// Posting side of a running context.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Queue `message` with already-detached `transfers`. Never blocks.
    fn post_message(&self, message: SendMessage, transfers: Vec<Bytes>)
    -> Result<(), TransportError>;

    /// Stop the context and wait until it is gone.
    async fn terminate(&self) -> Result<(), TransportError>;
}

/// Everything a context reports back to its controller, in order.
#[derive(Debug)]
pub enum ContextEvent {
    Message(Envelope<ReturnMessage>),
    Diagnostic(Diagnostic),
    /// The context is gone. Sent once, last.
    Exit { code: Option<i32> },
}

pub struct SpawnedContext {
    pub context: Arc<dyn ExecutionContext>,
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Called from within a tokio runtime; implementations start their pump
/// tasks with `tokio::spawn`.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, initial_data: &Value) -> Result<SpawnedContext, SpawnError>;
}

/// Queue-backed context handle shared by the built-in spawners.
///
/// `kill` asks the context's pump task to tear everything down; the pump
/// cancels `exited` after it has reported [`ContextEvent::Exit`].
pub(crate) struct QueueContext {
    inbound: mpsc::UnboundedSender<Envelope<SendMessage>>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl QueueContext {
    pub(crate) fn new(
        inbound: mpsc::UnboundedSender<Envelope<SendMessage>>,
        kill: CancellationToken,
        exited: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            kill,
            exited,
        }
    }
}

#[async_trait]
impl ExecutionContext for QueueContext {
    fn post_message(
        &self,
        message: SendMessage,
        transfers: Vec<Bytes>,
    ) -> Result<(), TransportError> {
        if self.kill.is_cancelled() || self.exited.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.inbound
            .send(Envelope::with_transfers(message, transfers))
            .map_err(|_| TransportError::Closed)
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        self.kill.cancel();
        self.exited.cancelled().await;
        Ok(())
    }
}

impl Drop for QueueContext {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
