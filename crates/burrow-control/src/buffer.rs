//! Bounded byte queue bridging RPC calls and a real socket
//!
//! One side of a `RelayBuffer` is always an RPC handler (Read or Write) and
//! must never wait; the other side is a per-connection socket task that may.
//! The non-blocking entry points are `try_push` and `drain`, the waiting ones
//! are `push` and `pop`.

use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// Why a push was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The chunk does not fit next to what is already queued
    ///
    /// Only [`RelayBuffer::try_push`] returns this; `push` waits instead.
    #[error("Buffer full ({queued} of {capacity} bytes queued)")]
    Full {
        /// Bytes waiting when the push was refused
        queued: usize,
        /// Configured ceiling of the buffer
        capacity: usize,
    },

    /// The buffer was closed, no more bytes are accepted
    #[error("Buffer closed")]
    Closed,
}

/// Outcome of a non-blocking drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drained {
    pub data: Bytes,
    /// Closed and nothing left behind this chunk
    pub finished: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    queue: BytesMut,
    closed: bool,
}

#[derive(Debug)]
pub struct RelayBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    /// Woken when bytes arrive or the buffer closes
    readable: Notify,
    /// Woken when bytes leave or the buffer closes
    writable: Notify,
}

impl RelayBuffer {
    /// Empty open buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured ceiling in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// True after [`RelayBuffer::close`], even while bytes remain queued
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append `data` without waiting, all or nothing
    ///
    /// An empty queue always admits the chunk, even an oversized one, so a
    /// single large write can still make progress.
    pub fn try_push(&self, data: &[u8]) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.lock();
            if state.closed {
                return Err(BufferError::Closed);
            }
            let queued = state.queue.len();
            if queued > 0 && queued + data.len() > self.capacity {
                return Err(BufferError::Full {
                    queued,
                    capacity: self.capacity,
                });
            }
            state.queue.extend_from_slice(data);
        }

        self.readable.notify_waiters();
        Ok(())
    }

    /// Append `data`, waiting for room
    pub async fn push(&self, data: &[u8]) -> Result<(), BufferError> {
        loop {
            let writable = self.writable.notified();
            match self.try_push(data) {
                Err(BufferError::Full { .. }) => writable.await,
                other => return other,
            }
        }
    }

    /// Take up to `max` bytes without waiting
    pub fn drain(&self, max: usize) -> Drained {
        let drained = {
            let mut state = self.lock();
            let n = state.queue.len().min(max);
            let data = state.queue.split_to(n).freeze();
            Drained {
                finished: state.closed && state.queue.is_empty(),
                data,
            }
        };

        if !drained.data.is_empty() {
            self.writable.notify_waiters();
        }
        drained
    }

    /// Take up to `max` bytes, waiting for some to arrive
    ///
    /// Returns `None` once the buffer is closed and empty.
    pub async fn pop(&self, max: usize) -> Option<Bytes> {
        loop {
            let readable = self.readable.notified();
            let drained = self.drain(max);
            if !drained.data.is_empty() {
                return Some(drained.data);
            }
            if drained.finished {
                return None;
            }
            readable.await;
        }
    }

    /// Refuse further pushes; queued bytes stay drainable
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}
