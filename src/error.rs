//! Error taxonomy for registration, mapping and dispatch operations.
//!
//! Deferral and engine scheduling outcomes are *not* errors; they travel in
//! [`IoStatus`](crate::status::IoStatus). Everything here is a genuine
//! failure that the caller must handle or propagate.

use thiserror::Error;

/// Dedicated [`Result`](std::result::Result) type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the I/O dispatch subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle is out of range or owned by a different device.
    #[error("invalid registration handle {0}")]
    InvalidHandle(u32),

    /// Bad flags, width, size or other caller-supplied value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Operation attempted after freeze or before required setup.
    #[error("operation out of order (registrations are frozen)")]
    WrongOrder,

    /// Registration or statistics table reached its configured cap.
    #[error("too many registrations (cap is {0})")]
    TooManyRegistrations(u32),

    /// Requested port or address range overlaps an existing mapping.
    #[error("range {first:#x}..={last:#x} conflicts with an existing mapping")]
    RangeConflict { first: u64, last: u64 },

    /// Unmap or alias attempted on a registration that is not mapped.
    #[error("registration is not mapped")]
    NotMapped,

    /// Map attempted on a registration that is already mapped.
    #[error("registration is already mapped")]
    AlreadyMapped,

    /// Backing allocation failed while growing a table.
    #[error("out of memory growing a registration table")]
    OutOfMemory,

    /// The page-fault path found no registration for the faulting address.
    #[error("no registration covers address {0:#x}")]
    RangeNotFound(u64),

    /// Failure reported by the external physical-memory manager.
    #[error("memory manager: {0}")]
    MemoryManager(&'static str),

    /// Protocol violation inside the dispatcher (e.g. a second deferred
    /// write while one is still pending, or a lookup/table desync).
    #[error("internal dispatch error: {0}")]
    Internal(&'static str),
}
