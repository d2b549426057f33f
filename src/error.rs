//! Error types.
//!
//! `RegistrationConflict` is the only error surfaced locally to a caller as a
//! typed `Result`; `CancellationRequested` and `ForceCancellation` are
//! surfaced through a [`crate::future::Future`]'s status, never raised up a
//! call stack, so they have no variant here. `WorkerFault` is absorbed by the
//! worker pool and only reported through logs (see [`crate::trace`]).
//! `PreconditionViolation` is a programmer error and is implemented as a
//! panic at the call site, not as a value of this enum.

use thiserror::Error;

/// Failure to register a [`crate::subsystem::Subsystem`] under an identifier
/// that already exists in the registry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("a subsystem named {0:?} is already registered")]
pub struct RegistrationConflict(pub String);

/// Why the worker pool declined to dispatch a closure immediately.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum DispatchError {
    /// The target worker's inbox is full; retry on a later tick.
    #[error("worker inbox is full")]
    Full,
    /// The worker pool has already been shut down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}
