//! Wire layer shared by controller and worker.
//!
//! # Architecture
//!
//! - **protocol**: Message types (SendMessage, ReturnMessage, Envelope)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: frame pumps between byte streams and in-memory queues

pub mod codec;
pub mod protocol;
pub mod transport;
