//! Error types for the shared-memory control surface.

use thiserror::Error;

/// Errors raised by the shared-memory server, client and backends.
///
/// Malformed or unknown commands coming from a client are not errors on the
/// server side: they are answered with a typed failure reply.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The shared-memory region could not be allocated.
    #[error("Shared memory allocation failed for key {key}: {reason}")]
    AllocationFailed {
        /// Region key.
        key: i32,
        /// Why allocation failed.
        reason: String,
    },

    /// The region exists but no server has initialized it.
    #[error("Shared memory for key {0} is not initialized")]
    NotInitialized(i32),

    /// The command ring has no free slot.
    #[error("Command queue is full ({capacity} outstanding)")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// Nothing to pop.
    #[error("Queue is empty")]
    QueueEmpty,

    /// Unknown wire tag.
    #[error("Unsupported command tag {0}")]
    UnsupportedCommand(u32),

    /// Model import failed.
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// The physics backend rejected a request.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ShmError {
    /// Create an allocation failure.
    pub fn allocation_failed(key: i32, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            key,
            reason: reason.into(),
        }
    }

    /// Create a model load error.
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Result type for shared-memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;
