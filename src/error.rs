//! Error types for PageShare

use crate::process::Pid;
use std::io;
use thiserror::Error;

/// Result type for PageShare operations
pub type Result<T> = std::result::Result<T, ShareError>;

/// Errors that can occur while mapping, queueing or servicing shared regions
#[derive(Debug, Error)]
pub enum ShareError {
    /// Zero size, out-of-bounds offset or virtual-address overflow
    #[error("Invalid range: va 0x{va:x}, size {size}")]
    InvalidRange { va: usize, size: usize },

    /// Source page absent, not present or not user-accessible
    #[error("Permission denied at va 0x{va:x}")]
    PermissionDenied { va: usize },

    /// Caller is not allowed to perform this operation
    #[error("Process {0} is not authorized for this operation")]
    NotAuthorized(Pid),

    /// The worker process has not been started
    #[error("Worker process not initialized")]
    NotInitialized,

    /// The worker process was already started
    #[error("Worker process already initialized")]
    AlreadyInitialized,

    /// Unmap target is not a currently shared page
    #[error("Page at va 0x{va:x} is not a shared mapping")]
    UnmappedOrForeign { va: usize },

    /// Destination page slot already in use
    #[error("Destination page at va 0x{va:x} is already mapped")]
    Overlap { va: usize },

    /// No process with this pid
    #[error("No such process: {0}")]
    NoSuchProcess(Pid),

    /// Physical frame pool exhausted
    #[error("Out of physical frames")]
    OutOfMemory,

    /// Request queue is full
    #[error("Request queue is full")]
    QueueFull,

    /// Request queue was shut down
    #[error("Request queue is closed")]
    QueueClosed,

    /// Failed to reserve backing memory
    #[error("Failed to map physical memory: {0}")]
    Mmap(#[source] io::Error),
}
