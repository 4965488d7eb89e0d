//! # Error Codes
//!
//! Every public runtime operation reports failure through [`Error`]. The
//! variants map one-to-one onto the conditions callers can run into:
//! calling from a thread that is not an execution stream, using a freed
//! handle, violating a pool's access policy, or exhausting memory.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes returned by the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The calling thread is not an execution stream, the runtime is not
    /// initialized, or the target execution stream is in the wrong state.
    #[error("invalid execution stream")]
    InvalidXstream,
    /// The pool handle is freed or otherwise unusable.
    #[error("invalid pool")]
    InvalidPool,
    /// The scheduler handle is freed, already in use, or in the wrong state.
    #[error("invalid scheduler")]
    InvalidSched,
    /// The operation would violate the pool's producer/consumer policy.
    #[error("pool access violation")]
    InvalidPoolAccess,
    /// The predefined scheduler kind cannot be built from the given pools.
    #[error("invalid predefined scheduler")]
    InvalidSchedPredef,
    /// The work-unit handle is freed, or its state forbids the operation
    /// (joining itself, freeing a live ULT, reviving a running one, ...).
    #[error("invalid thread")]
    InvalidThread,
    /// Memory allocation failed.
    #[error("out of resources")]
    Resource,
    /// Generic scheduler error.
    #[error("scheduler error")]
    Sched,
}
