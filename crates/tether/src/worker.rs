//! Worker-side channel endpoint.
//!
//! Runs inside the execution context. The controller side (id allocation,
//! pending-call routing) is in controller.rs.
//!
//! Architecture:
//! - Method registry: name -> boxed async handler, last registration wins
//! - Each call runs on its own task, so calls on one worker are logically
//!   concurrent
//! - Call events and the final result share one FIFO outbound queue; a
//!   handler's events are queued before its result

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::protocol::{
    CallEventPayload, CallId, CallPayload, CallResultPayload, Envelope, PureEventPayload,
    ReturnMessage, SendMessage,
};
use crate::bridge::transport::{read_frames, worker_data_from_env, write_frames};
use crate::diagnostics::{DiagnosticSink, log_diagnostics};
use crate::error::{HandlerError, TransportError, panic_message};
use crate::events::{EventListener, EventRegistry};
use crate::transfer::{TransferBuffer, TransferSet, attach_all, detach_all};

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

type MethodFn = Arc<dyn Fn(CallContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Static registration callback, run on a fresh worker before it accepts messages.
pub type Registration = Arc<dyn Fn(&WorkerChannel) + Send + Sync>;

pub type Outbound = mpsc::UnboundedSender<Envelope<ReturnMessage>>;

#[derive(Clone)]
pub struct WorkerConfig {
    /// Startup data handed over by the controller.
    pub worker_data: Value,
    pub diagnostics: DiagnosticSink,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_data: Value::Null,
            diagnostics: log_diagnostics(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_data(mut self, worker_data: Value) -> Self {
        self.worker_data = worker_data;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// Handle given to a method handler for the duration of one call.
#[derive(Clone)]
pub struct CallContext {
    id: CallId,
    worker: WorkerChannel,
    received: Arc<TransferSet>,
    staged: Arc<Mutex<TransferSet>>,
}

impl CallContext {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Post a progress event scoped to this call.
    pub fn send_event(
        &self,
        event_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), TransportError> {
        let payload = CallEventPayload {
            id: self.id,
            event_name: event_name.into(),
            args,
        };
        self.worker
            .post(ReturnMessage::CallEvent(payload), Vec::new())
    }

    /// Stage buffers to transfer with the success result.
    pub fn set_transfer_list(&self, buffers: TransferSet) {
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = buffers;
    }

    /// Buffers transferred by the controller with this call.
    pub fn transfers(&self) -> &[TransferBuffer] {
        &self.received
    }

    pub fn worker(&self) -> &WorkerChannel {
        &self.worker
    }

    fn take_staged(&self) -> TransferSet {
        std::mem::take(&mut *self.staged.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct WorkerInner {
    methods: RwLock<HashMap<String, MethodFn>>,
    events: EventRegistry,
    outbound: Outbound,
    worker_data: Value,
    diagnostics: DiagnosticSink,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Worker-side endpoint: method registry, call dispatch, pure events.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<WorkerInner>,
}

/// Non-owning handle to a [`WorkerChannel`], for listeners and handlers
/// that the worker itself stores.
#[derive(Clone)]
pub struct WeakWorkerChannel {
    inner: Weak<WorkerInner>,
}

impl WeakWorkerChannel {
    pub fn upgrade(&self) -> Option<WorkerChannel> {
        self.inner.upgrade().map(|inner| WorkerChannel { inner })
    }
}

impl WorkerChannel {
    pub fn new(outbound: Outbound, config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                methods: RwLock::new(HashMap::new()),
                events: EventRegistry::new(),
                outbound,
                worker_data: config.worker_data,
                diagnostics: config.diagnostics,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Register `handler` under `name`, replacing any earlier registration.
    pub fn register_method<F, Fut>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let method: MethodFn = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        let replaced = self
            .inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), method)
            .is_some();
        tracing::trace!(method = %name, replaced, "Registered method");
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<MethodFn> {
        self.inner
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn worker_data(&self) -> &Value {
        &self.inner.worker_data
    }

    pub fn diagnostics(&self) -> DiagnosticSink {
        Arc::clone(&self.inner.diagnostics)
    }

    /// Broadcast a pure event to the controller.
    pub fn emit(&self, event_name: impl Into<String>, args: Vec<Value>) -> Result<(), TransportError> {
        let payload = PureEventPayload {
            event_name: event_name.into(),
            args,
        };
        self.post(ReturnMessage::PureEvent(payload), Vec::new())
    }

    pub fn downgrade(&self) -> WeakWorkerChannel {
        WeakWorkerChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to a pure event from the controller.
    ///
    /// The listener is owned by this worker: capture a [`downgrade`](Self::downgrade)d
    /// handle rather than a `WorkerChannel` clone, or the worker keeps itself
    /// and its outbound queue alive.
    pub fn on(&self, event_name: &str, listener: EventListener) {
        self.inner.events.on(event_name, listener);
    }

    pub fn off(&self, event_name: &str, listener: &EventListener) -> bool {
        self.inner.events.off(event_name, listener)
    }

    /// Stop serving. In-flight handlers are abandoned without posting results.
    pub fn exit(&self) {
        tracing::debug!("Worker exit requested");
        self.inner.shutdown.cancel();
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn post(&self, message: ReturnMessage, transfers: Vec<Bytes>) -> Result<(), TransportError> {
        self.inner
            .outbound
            .send(Envelope::with_transfers(message, transfers))
            .map_err(|_| TransportError::Closed)
    }

    pub fn on_message(&self, envelope: Envelope<SendMessage>) {
        let Envelope { message, transfers } = envelope;
        match message {
            SendMessage::Call(call) => self.on_call(call, attach_all(transfers)),
            SendMessage::Event(PureEventPayload { event_name, args }) => {
                let fired = self.inner.events.dispatch(&event_name, &args);
                tracing::trace!(%event_name, fired, "Pure event received");
            }
        }
    }

    fn on_call(&self, call: CallPayload, received: TransferSet) {
        let CallPayload { id, method, args } = call;

        let Some(handler) = self.lookup(&method) else {
            tracing::debug!(id, %method, "Call for unhandled method");
            let fault = HandlerError::unhandled_method(&method).into_fault();
            self.post_result(CallResultPayload::failure(id, fault), Vec::new());
            return;
        };

        tracing::trace!(id, %method, "Dispatching call");
        let ctx = CallContext {
            id,
            worker: self.clone(),
            received: Arc::new(received),
            staged: Arc::new(Mutex::new(Vec::new())),
        };
        let worker = self.clone();
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(async move {
            let handler_ctx = ctx.clone();
            let run = AssertUnwindSafe(async move { handler(handler_ctx, args).await }).catch_unwind();

            let outcome = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::trace!(id, %method, "Worker exiting, abandoning call");
                    return;
                }
                outcome = run => outcome,
            };

            let (payload, transfers) = match outcome {
                Ok(Ok(value)) => match detach_all(&ctx.take_staged()) {
                    Ok(bytes) => (CallResultPayload::success(id, value), bytes),
                    Err(e) => (
                        CallResultPayload::failure(id, HandlerError::from(e).into_fault()),
                        Vec::new(),
                    ),
                },
                Ok(Err(err)) => {
                    tracing::debug!(id, %method, error = %err, "Handler failed");
                    (CallResultPayload::failure(id, err.into_fault()), Vec::new())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(id, %method, %message, "Handler panicked");
                    let fault = HandlerError::named("PanicError", message).into_fault();
                    (CallResultPayload::failure(id, fault), Vec::new())
                }
            };

            worker.post_result(payload, transfers);
        });
    }

    fn post_result(&self, payload: CallResultPayload, transfers: Vec<Bytes>) {
        let id = payload.id;
        if let Err(e) = self.post(ReturnMessage::CallResult(payload), transfers) {
            tracing::warn!(id, error = %e, "Failed to post call result");
        }
    }

    /// Dispatch inbound messages until the controller side closes or
    /// [`exit`](Self::exit) is called.
    pub async fn serve(self, mut inbound: mpsc::UnboundedReceiver<Envelope<SendMessage>>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::debug!("Worker shutting down");
                    break;
                }

                msg = inbound.recv() => match msg {
                    Some(envelope) => self.on_message(envelope),
                    None => {
                        tracing::debug!("Inbound channel closed (controller gone?)");
                        break;
                    }
                },
            }
        }
    }

    /// Wait for every in-flight handler to post its result.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Run a worker program over stdin/stdout.
///
/// Startup data is read from the environment, `register` installs the
/// worker's methods, then frames are served until the controller closes
/// stdin or the worker exits.
pub async fn run_stdio_worker<F>(register: F) -> io::Result<()>
where
    F: FnOnce(&WorkerChannel),
{
    let worker_data = worker_data_from_env()?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let worker = WorkerChannel::new(
        out_tx,
        WorkerConfig::default().with_worker_data(worker_data),
    );
    register(&worker);

    let flushed = CancellationToken::new();
    let writer = tokio::spawn(write_frames(stdout(), out_rx, flushed.clone()));

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let diagnostics = worker.diagnostics();
    let reader = tokio::spawn(async move {
        let result = read_frames::<_, SendMessage, _>(stdin(), |item| match item {
            Ok(envelope) => in_tx.send(envelope).is_ok(),
            Err(diagnostic) => {
                diagnostics(&diagnostic);
                true
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Control stream error");
        }
    });

    tracing::info!("Worker ready");
    worker.clone().serve(in_rx).await;

    if !worker.is_exiting() {
        worker.drain().await;
    }
    flushed.cancel();
    match writer.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "Frame writer task failed"),
    }
    reader.abort();

    tracing::info!("Worker exiting");
    Ok(())
}
