//! tether: request/response RPC with call-scoped events between a
//! controller and isolated workers.

pub mod bridge;
pub mod context;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod group;
pub mod logging;
pub mod session;
pub mod transfer;
pub mod worker;

pub use bridge::protocol::{CallId, ErrorRecord, RemoteFault};
pub use context::{ExecutionContext, ProgramSpec, SpawnError, WorkerSpawner};
pub use controller::{CallReturn, ChannelConfig, ChannelId, ControllerChannel};
pub use diagnostics::{Diagnostic, DiagnosticSink};
pub use error::{CallError, HandlerError, TransportError};
pub use events::{EventListener, listener};
pub use group::{ChannelGroup, GroupConfig, WorkerSource};
pub use session::CallSession;
pub use transfer::{TransferBuffer, TransferSet};
pub use worker::{
    CallContext, Registration, WeakWorkerChannel, WorkerChannel, WorkerConfig, run_stdio_worker,
};
