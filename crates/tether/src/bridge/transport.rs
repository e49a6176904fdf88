//! Byte-stream transport: moves envelopes between framed AsyncRead/AsyncWrite
//! halves and the in-memory queues the channels work with.
//!
//! Used on the controller side for child stdio and on the worker side for
//! its own stdin/stdout.

use std::io;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::protocol::Envelope;
use crate::diagnostics::Diagnostic;

/// Env var carrying the worker's startup data (JSON) into a spawned program.
pub const WORKER_DATA_ENV: &str = "TETHER_WORKER_DATA";

/// Read startup data passed by the controller; `null` when absent.
pub fn worker_data_from_env() -> io::Result<serde_json::Value> {
    match std::env::var(WORKER_DATA_ENV) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not valid JSON: {}", WORKER_DATA_ENV, e),
            )
        }),
        Err(_) => Ok(serde_json::Value::Null),
    }
}

/// Decode frames from `reader` and hand them to `deliver` until EOF.
///
/// Frames whose message kind is not part of the protocol are delivered as
/// `Err(Diagnostic)` and reading continues. A malformed frame ends the stream.
/// `deliver` returns false to stop early.
pub async fn read_frames<R, M, F>(reader: R, mut deliver: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
    F: FnMut(Result<Envelope<M>, Diagnostic>) -> bool,
{
    let mut frames = FramedRead::new(reader, JsonCodec::<Envelope<serde_json::Value>>::new());
    while let Some(frame) = frames.next().await {
        let raw = frame?;
        let item = match serde_json::from_value::<M>(raw.message) {
            Ok(message) => Ok(Envelope::with_transfers(message, raw.transfers)),
            Err(e) => Err(Diagnostic::UnknownMessage {
                detail: e.to_string(),
            }),
        };
        if !deliver(item) {
            tracing::trace!("Frame consumer gone, stopping reader");
            break;
        }
    }
    Ok(())
}

/// Encode envelopes from `rx` onto `writer`.
///
/// Stops when every sender is gone, or once `done` fires and the queue has
/// been drained.
pub async fn write_frames<W, M>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope<M>>,
    done: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut frames = FramedWrite::new(writer, JsonCodec::<Envelope<M>>::new());
    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(envelope) => frames.send(envelope).await?,
                None => break,
            },

            _ = done.cancelled() => {
                while let Ok(envelope) = rx.try_recv() {
                    frames.send(envelope).await?;
                }
                break;
            }
        }
    }
    frames.flush().await?;
    tracing::trace!("Frame writer exiting");
    Ok(())
}
