//! A cooperative, priority-aware task scheduler core.
//!
//! Work is submitted as a bare closure (see [`Scheduler::submit`]) or as a
//! statically-typed [`chain::Chain`] of stages. Every unit of work is
//! represented by a [`future::Promise`]/[`future::Future`] pair whose
//! lifecycle moves monotonically through
//! `Scheduled -> Executing -> {Suspended <-> Executing}* -> {Completed | Canceled | ForceCanceled}`.
//! Tasks run at one of three [`priority::TaskPriority`] levels and are
//! dispatched to a fixed [`worker::WorkerPool`] by [`scheduler::Scheduler`]'s
//! tick loop; longer-lived application components register as
//! [`subsystem::Subsystem`]s in a [`subsystem::SubsystemsRegistry`].
//!
//! Submission and cancellation/suspension are cooperative and advisory:
//! nothing here preempts a running task. A task (or chain stage) only stops
//! early if it chooses to notice a request via its
//! [`token::RequestProxy`].

pub mod chain;
pub mod error;
pub mod future;
pub mod priority;
pub mod scheduler;
pub mod subsystem;
pub mod task;
pub mod token;
pub mod trace;
pub mod worker;

pub use chain::{Chain, ChainEnd, ChainLink, Stage};
pub use error::{DispatchError, RegistrationConflict};
pub use future::{make_future, Future, FutureAny, FutureStatus, Promise};
pub use priority::TaskPriority;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, TaskOutcome};
pub use subsystem::{Subsystem, SubsystemsContext, SubsystemsRegistry};
pub use task::{DeferredTask, Readiness, Task};
pub use token::{CancelRequest, RequestProxy, RequestSource, ServiceKind, ServiceToken, SuspendRequest};
pub use trace::TaskTraceInfo;
