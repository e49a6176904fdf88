//! In-process execution context: a worker on its own tokio task.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ContextEvent, QueueContext, SpawnError, SpawnedContext, WorkerSpawner};
use crate::diagnostics::{DiagnosticSink, log_diagnostics};
use crate::worker::{Registration, WorkerChannel, WorkerConfig};

/// Spawns workers whose methods are installed by a static registration callback.
pub struct InProcessSpawner {
    registration: Registration,
    diagnostics: DiagnosticSink,
}

impl InProcessSpawner {
    pub fn new(registration: Registration) -> Self {
        Self {
            registration,
            diagnostics: log_diagnostics(),
        }
    }

    /// Sink for protocol violations seen by the worker side.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, initial_data: &Value) -> Result<SpawnedContext, SpawnError> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let config = WorkerConfig::default()
            .with_worker_data(initial_data.clone())
            .with_diagnostics(Arc::clone(&self.diagnostics));
        let worker = WorkerChannel::new(out_tx, config);
        (self.registration)(&worker);

        let shutdown = worker.shutdown_token();
        let kill = CancellationToken::new();
        let exited = CancellationToken::new();

        tokio::spawn(worker.serve(in_rx));

        let kill_for_pump = kill.clone();
        let exited_for_pump = exited.clone();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    biased;

                    _ = kill_for_pump.cancelled() => {
                        tracing::debug!("Inline worker terminated");
                        shutdown.cancel();
                        break None;
                    }

                    _ = shutdown.cancelled() => {
                        // results posted before exit() still reach the controller
                        while let Ok(envelope) = out_rx.try_recv() {
                            let _ = events_tx.send(ContextEvent::Message(envelope));
                        }
                        tracing::debug!("Inline worker exited");
                        break Some(0);
                    }

                    msg = out_rx.recv() => match msg {
                        Some(envelope) => {
                            if events_tx.send(ContextEvent::Message(envelope)).is_err() {
                                tracing::trace!("Controller gone, stopping inline pump");
                                shutdown.cancel();
                                break None;
                            }
                        }
                        None => {
                            tracing::debug!("Inline worker finished");
                            break Some(0);
                        }
                    },
                }
            };
            let _ = events_tx.send(ContextEvent::Exit { code });
            exited_for_pump.cancel();
        });

        tracing::debug!("Spawned inline worker");
        Ok(SpawnedContext {
            context: Arc::new(QueueContext::new(in_tx, kill, exited)),
            events: events_rx,
        })
    }
}
