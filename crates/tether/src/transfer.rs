//! Detachable buffers for ownership-moving handoff.
//!
//! A [`TransferBuffer`] is a shared handle to one byte buffer. Putting it in a
//! transfer list and posting a message detaches the storage: every handle on
//! the sending side reads as empty from then on, and the receiving side gets
//! a fresh handle over byte-identical content.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::bytes::Bytes;

use crate::error::TransportError;

/// Ordered list of buffers accompanying one message.
pub type TransferSet = Vec<TransferBuffer>;

#[derive(Clone)]
pub struct TransferBuffer {
    slot: Arc<Mutex<Option<Bytes>>>,
}

impl TransferBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(data.into()))),
        }
    }

    // The slot only ever holds plain bytes, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Option<Bytes>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Byte length; zero once detached.
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_detached(&self) -> bool {
        self.lock().is_none()
    }

    /// Cheap copy of the current contents, `None` once detached.
    pub fn to_bytes(&self) -> Option<Bytes> {
        self.lock().clone()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().map(|b| b.to_vec()).unwrap_or_default()
    }

    /// Move the storage out, leaving every handle to this buffer empty.
    pub fn detach(&self) -> Option<Bytes> {
        self.lock().take()
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_bytes() {
            Some(bytes) => f
                .debug_struct("TransferBuffer")
                .field("len", &bytes.len())
                .finish(),
            None => f.write_str("TransferBuffer(detached)"),
        }
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Bytes> for TransferBuffer {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

/// Detach every buffer of a transfer list for sending.
///
/// Nothing is detached if any buffer was already handed off.
pub fn detach_all(buffers: &[TransferBuffer]) -> Result<Vec<Bytes>, TransportError> {
    if let Some(index) = buffers.iter().position(TransferBuffer::is_detached) {
        return Err(TransportError::Detached { index });
    }
    Ok(buffers.iter().filter_map(TransferBuffer::detach).collect())
}

/// Wrap received storage into fresh handles.
pub fn attach_all(buffers: Vec<Bytes>) -> TransferSet {
    buffers.into_iter().map(TransferBuffer::new).collect()
}
