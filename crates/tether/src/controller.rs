//! Controller-side channel endpoint.
//!
//! Allocates call ids, keeps the pending-call table, correlates results and
//! call events coming back from the execution context, and tracks whether
//! the context is still alive.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CallEventPayload, CallId, CallPayload, Envelope, PureEventPayload, ReturnMessage, SendMessage,
};
use crate::context::{ContextEvent, ExecutionContext, SpawnedContext};
use crate::diagnostics::{Diagnostic, DiagnosticSink, log_diagnostics};
use crate::error::{CallError, TransportError, panic_message};
use crate::events::{EventListener, EventRegistry};
use crate::session::CallSession;
use crate::transfer::{TransferBuffer, TransferSet, attach_all, detach_all};

/// Unique identifier for a controller channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(uuid::Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Success payload of a call.
#[derive(Debug, Clone)]
pub struct CallReturn {
    pub data: Value,
    /// Buffers the worker transferred with the result.
    pub transfers: TransferSet,
}

pub type Reply = BoxFuture<'static, Result<CallReturn, CallError>>;

/// Receives the call events of one outstanding call.
pub type CallEventRouter = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

#[derive(Clone)]
pub struct ChannelConfig {
    pub diagnostics: DiagnosticSink,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            diagnostics: log_diagnostics(),
        }
    }
}

impl ChannelConfig {
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

struct PendingCall {
    method: String,
    resolver: oneshot::Sender<Result<CallReturn, CallError>>,
    on_event: Option<CallEventRouter>,
}

pub struct ControllerChannel {
    id: ChannelId,
    next_id: AtomicU64,
    pending: DashMap<CallId, PendingCall>,
    alive: AtomicBool,
    closed: CancellationToken,
    events: EventRegistry,
    context: Arc<dyn ExecutionContext>,
    diagnostics: DiagnosticSink,
}

impl ControllerChannel {
    /// Wire a channel to a freshly spawned context and start routing its events.
    pub fn attach(spawned: SpawnedContext, config: ChannelConfig) -> Arc<Self> {
        let SpawnedContext { context, events } = spawned;
        let channel = Arc::new(Self {
            id: ChannelId::new(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
            events: EventRegistry::new(),
            context,
            diagnostics: config.diagnostics,
        });
        tokio::spawn(run_event_loop(Arc::downgrade(&channel), events));
        tracing::debug!(channel = %channel.id, "Channel attached");
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Plan a call. Nothing is sent until the session is first observed.
    pub fn call(self: &Arc<Self>, method: impl Into<String>, args: Vec<Value>) -> CallSession {
        CallSession::new(Arc::clone(self), method.into(), args)
    }

    /// Send a call now and return its reply.
    ///
    /// Fails immediately with [`CallError::NotAlive`], without posting, once
    /// the context is gone.
    pub fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        transfers: &[TransferBuffer],
        on_event: Option<CallEventRouter>,
    ) -> Reply {
        if !self.is_alive() {
            tracing::debug!(channel = %self.id, %method, "Call on dead channel");
            return future::ready(Err(CallError::NotAlive)).boxed();
        }

        let transfers = match detach_all(transfers) {
            Ok(bytes) => bytes,
            Err(e) => return future::ready(Err(e.into())).boxed(),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resolver, reply) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                resolver,
                on_event,
            },
        );

        // the context may have exited between the liveness check and the insert
        if !self.is_alive() {
            self.pending.remove(&id);
            return future::ready(Err(CallError::NotAlive)).boxed();
        }

        let message = SendMessage::Call(CallPayload {
            id,
            method: method.to_string(),
            args,
        });
        if let Err(e) = self.context.post_message(message, transfers) {
            tracing::warn!(channel = %self.id, id, %method, error = %e, "Failed to post call");
            self.pending.remove(&id);
            return future::ready(Err(e.into())).boxed();
        }
        tracing::trace!(channel = %self.id, id, %method, "Call posted");

        async move { reply.await.unwrap_or(Err(CallError::NotAlive)) }.boxed()
    }

    /// Route one message from the context.
    pub fn on_message(&self, envelope: Envelope<ReturnMessage>) {
        let Envelope { message, transfers } = envelope;
        match message {
            ReturnMessage::CallResult(payload) => {
                let id = payload.id;
                let Some((_, pending)) = self.pending.remove(&id) else {
                    self.report(Diagnostic::OrphanResult { id });
                    return;
                };
                let outcome = payload
                    .into_outcome()
                    .map(|data| CallReturn {
                        data,
                        transfers: attach_all(transfers),
                    })
                    .map_err(CallError::Remote);
                tracing::trace!(
                    channel = %self.id,
                    id,
                    method = %pending.method,
                    success = outcome.is_ok(),
                    "Call resolved"
                );
                if pending.resolver.send(outcome).is_err() {
                    tracing::trace!(channel = %self.id, id, "Caller dropped before result");
                }
            }
            ReturnMessage::CallEvent(CallEventPayload {
                id,
                event_name,
                args,
            }) => {
                // clone the router out so the table is not locked while it runs
                let router = match self.pending.get(&id) {
                    Some(pending) => pending.on_event.clone(),
                    None => {
                        self.report(Diagnostic::OrphanEvent { id, event_name });
                        return;
                    }
                };
                let Some(router) = router else {
                    return;
                };
                // the pump outlives a panicking handler
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| router(&event_name, &args))) {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(channel = %self.id, id, %event_name, %message, "Call event handler panicked");
                }
            }
            ReturnMessage::PureEvent(PureEventPayload { event_name, args }) => {
                let fired = self.events.dispatch(&event_name, &args);
                tracing::trace!(channel = %self.id, %event_name, fired, "Pure event received");
            }
        }
    }

    /// The context is gone: reject everything still pending.
    pub fn on_exit(&self, code: Option<i32>) {
        self.alive.store(false, Ordering::SeqCst);
        let rejected = self.reject_pending();
        self.closed.cancel();
        tracing::info!(channel = %self.id, ?code, rejected, "Worker exited");
    }

    fn reject_pending(&self) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                tracing::debug!(channel = %self.id, id, method = %pending.method, "Failing call, worker not alive");
                let _ = pending.resolver.send(Err(CallError::NotAlive));
                rejected += 1;
            }
        }
        rejected
    }

    fn report(&self, diagnostic: Diagnostic) {
        (self.diagnostics)(&diagnostic);
    }

    /// Broadcast a pure event to the worker.
    pub fn emit(&self, event_name: impl Into<String>, args: Vec<Value>) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let message = SendMessage::Event(PureEventPayload {
            event_name: event_name.into(),
            args,
        });
        self.context.post_message(message, Vec::new())
    }

    pub fn on(&self, event_name: &str, listener: EventListener) {
        self.events.on(event_name, listener);
    }

    pub fn off(&self, event_name: &str, listener: &EventListener) -> bool {
        self.events.off(event_name, listener)
    }

    /// Tear down the context and reject every pending call.
    ///
    /// The channel is dead afterwards even if the context reports an error.
    pub async fn terminate(&self) -> Result<(), TransportError> {
        tracing::debug!(channel = %self.id, "Terminating channel");
        self.alive.store(false, Ordering::SeqCst);
        let result = self.context.terminate().await;
        let rejected = self.reject_pending();
        self.closed.cancel();
        tracing::info!(channel = %self.id, rejected, "Channel terminated");
        result
    }

    /// Resolves once the channel is dead, whether by exit or terminate.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + use<> {
        self.closed.clone().cancelled_owned()
    }
}

async fn run_event_loop(
    channel: Weak<ControllerChannel>,
    mut events: mpsc::UnboundedReceiver<ContextEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(channel) = channel.upgrade() else {
            tracing::trace!("Channel dropped, event loop exiting");
            return;
        };
        match event {
            ContextEvent::Message(envelope) => channel.on_message(envelope),
            ContextEvent::Diagnostic(diagnostic) => channel.report(diagnostic),
            ContextEvent::Exit { code } => {
                channel.on_exit(code);
                return;
            }
        }
    }

    if let Some(channel) = channel.upgrade() {
        tracing::warn!(channel = %channel.id, "Context event stream closed without exit");
        channel.on_exit(None);
    }
}
