//! # Buffer Heap Errors
//!
//! Allocation-time errors propagate to the caller of `allocate` or
//! `create_heap`. Release-time errors (zero failure, backend free failure)
//! have no caller: the heap logs them and keeps the memory out of reuse.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Buffer heap result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Buffer heap error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Backend allocation or transient mapping allocation failed
    OutOfMemory,
    /// Unknown heap type tag or unusable platform parameters
    InvalidConfig(&'static str),
    /// Kernel, user or device mapping step failed
    MapFailure(&'static str),
    /// Bulk zeroing aborted before covering the whole buffer
    ZeroFailure {
        /// Pages zeroed before the abort
        zeroed_pages: u64,
        /// Pages in the buffer
        total_pages: u64,
    },
    /// Invalid argument to a heap operation
    InvalidParameter(&'static str),
    /// Heap has been torn down
    HeapDestroyed,
    /// Backend does not implement the operation
    NotSupported,
}

impl Error {
    /// Whether retrying after reclaim could succeed
    pub const fn is_pressure(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidConfig(reason) => write!(f, "invalid heap configuration: {reason}"),
            Self::MapFailure(reason) => write!(f, "mapping failed: {reason}"),
            Self::ZeroFailure {
                zeroed_pages,
                total_pages,
            } => write!(
                f,
                "bulk zero aborted after {zeroed_pages} of {total_pages} pages"
            ),
            Self::InvalidParameter(reason) => write!(f, "invalid parameter: {reason}"),
            Self::HeapDestroyed => write!(f, "heap already destroyed"),
            Self::NotSupported => write!(f, "operation not supported by backend"),
        }
    }
}

impl std::error::Error for Error {}
