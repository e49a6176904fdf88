//! Lazy, exactly-once call handles.
//!
//! A [`CallSession`] is configured (transfer list, event handlers) and then
//! observed. The first observation dispatches the call through its channel;
//! every later observation, on this handle or any clone, shares that one
//! dispatch and sees the same outcome.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::controller::{CallEventRouter, CallReturn, ControllerChannel, Reply};
use crate::error::CallError;
use crate::events::{EventListener, listener};
use crate::transfer::{TransferBuffer, TransferSet};

#[derive(Default)]
struct CallPlan {
    args: Vec<Value>,
    transfers: TransferSet,
    handlers: HashMap<String, Vec<EventListener>>,
}

enum SessionState {
    Configuring(CallPlan),
    Dispatched(Shared<Reply>),
}

#[derive(Clone)]
pub struct CallSession {
    channel: Arc<ControllerChannel>,
    method: Arc<str>,
    state: Arc<Mutex<SessionState>>,
}

impl CallSession {
    pub(crate) fn new(channel: Arc<ControllerChannel>, method: String, args: Vec<Value>) -> Self {
        Self {
            channel,
            method: method.into(),
            state: Arc::new(Mutex::new(SessionState::Configuring(CallPlan {
                args,
                ..CallPlan::default()
            }))),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(*self.lock(), SessionState::Dispatched(_))
    }

    /// Buffers to transfer with the call. Replaces any earlier list.
    pub fn with_transfer_list(self, buffers: impl IntoIterator<Item = TransferBuffer>) -> Self {
        let buffers: TransferSet = buffers.into_iter().collect();
        self.configure("with_transfer_list", |plan| plan.transfers = buffers);
        self
    }

    /// Subscribe to a call event. Handlers for one name fire in attachment order.
    pub fn on<F>(self, event_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let handler = listener(handler);
        self.configure("on", |plan| {
            plan.handlers.entry(event_name).or_default().push(handler)
        });
        self
    }

    /// Dispatch if needed and wait for the full success payload.
    pub fn returned(&self) -> impl Future<Output = Result<CallReturn, CallError>> + Send + use<> {
        self.reply()
    }

    /// Dispatch if needed and wait for the result value.
    pub fn outcome(&self) -> impl Future<Output = Result<Value, CallError>> + Send + use<> {
        self.reply().map(|result| result.map(|ret| ret.data))
    }

    /// Like [`outcome`](Self::outcome), deserializing the value into `T`.
    pub fn decode<T: DeserializeOwned + 'static>(
        &self,
    ) -> impl Future<Output = Result<T, CallError>> + Send + use<T> {
        self.outcome().map(|result| {
            result.and_then(|data| {
                serde_json::from_value(data).map_err(|e| CallError::Decode(e.to_string()))
            })
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configure(&self, what: &str, apply: impl FnOnce(&mut CallPlan)) {
        match &mut *self.lock() {
            SessionState::Configuring(plan) => apply(plan),
            SessionState::Dispatched(_) => {
                tracing::debug!(method = %self.method, what, "Session already dispatched, ignoring");
            }
        }
    }

    fn reply(&self) -> Shared<Reply> {
        let mut state = self.lock();
        let plan = match &mut *state {
            SessionState::Dispatched(reply) => return reply.clone(),
            SessionState::Configuring(plan) => std::mem::take(plan),
        };

        let CallPlan {
            args,
            transfers,
            handlers,
        } = plan;
        let router = (!handlers.is_empty()).then(|| route_to(handlers));
        let reply = self
            .channel
            .dispatch(&self.method, args, &transfers, router)
            .shared();
        *state = SessionState::Dispatched(reply.clone());
        reply
    }
}

fn route_to(handlers: HashMap<String, Vec<EventListener>>) -> CallEventRouter {
    Arc::new(move |event_name: &str, args: &[Value]| {
        if let Some(list) = handlers.get(event_name) {
            for handler in list {
                handler(args);
            }
        }
    })
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("channel", &self.channel.id())
            .field("method", &self.method)
            .field("dispatched", &self.is_dispatched())
            .finish()
    }
}

impl IntoFuture for CallSession {
    type Output = Result<Value, CallError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome().boxed()
    }
}

impl IntoFuture for &CallSession {
    type Output = Result<Value, CallError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome().boxed()
    }
}
