//! Task and deferred-task records.
//!
//! A task is a closure plus a readiness poll plus a priority plus trace
//! info; a deferred task additionally carries a `schedule` closure that
//! produces the real task once its readiness closure first reports ready.

use std::time::Duration;

use crate::priority::TaskPriority;
use crate::token::ServiceToken;
use crate::trace::TaskTraceInfo;

/// Result of polling a task's (or deferred task's) readiness closure.
///
/// `Ready` and `Cancel` are both terminal outcomes for the poll itself (the
/// task either runs or is dropped this tick); `Awaiting` means try again
/// next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Run the task this tick.
    Ready,
    /// Not ready yet; poll again next tick.
    Awaiting,
    /// Drop the task without running it, transitioning its promise to
    /// `Canceled`.
    Cancel,
}

impl Readiness {
    /// A readiness closure that is always ready; the common case for tasks
    /// submitted with no external dependency.
    pub fn always_ready() -> Self {
        Readiness::Ready
    }
}

/// The closure a dispatched task runs on its worker thread. It derives its
/// own [`crate::token::RequestProxy`] from the promise it closed over,
/// rather than receiving one as a parameter — this keeps the type
/// identical to the worker pool's own job type, so a task's body can be
/// handed straight to [`crate::worker::WorkerPool::dispatch`].
pub type TaskBody = Box<dyn FnOnce() + Send>;

/// A closure polled once per tick to decide whether a task (or deferred
/// task) should run yet. Receives the elapsed time since the task was
/// submitted, derived from the scheduler's `reference_timepoint`.
pub type ReadinessPoll = Box<dyn FnMut(Duration) -> Readiness + Send>;

/// The scheduler-side hooks that settle a task's promise *without* running
/// its body — used when a task is cancelled or force-cancelled before it is
/// ever dispatched. Kept separate from `body` because the scheduler must be
/// able to resolve a pending task's future while never invoking (or taking
/// ownership of, for a retry) its body.
pub(crate) struct TaskLifecycle {
    pub(crate) cancel: Box<dyn FnOnce(ServiceToken) + Send>,
    pub(crate) force_cancel: Box<dyn FnOnce() + Send>,
}

/// A scheduled unit of work: a closure, a readiness poll, a priority, and
/// diagnostic trace info.
///
/// `original_priority` is what the task was submitted with;
/// `effective_priority` starts equal to it and only ever moves upward, via
/// [`Task::bump_for_starvation`], when the starvation guard in the
/// scheduler's tick loop detects the task has waited past its threshold.
pub struct Task {
    pub body: TaskBody,
    pub poll_ready: ReadinessPoll,
    pub original_priority: TaskPriority,
    pub effective_priority: TaskPriority,
    pub trace_info: TaskTraceInfo,
    pub(crate) lifecycle: TaskLifecycle,
    /// Offset from the scheduler's `reference_timepoint` at which this task
    /// was submitted; elapsed-since-submission for the readiness poll, and
    /// the starvation guard, are both derived from it.
    pub(crate) schedule_offset: Duration,
}

impl Task {
    pub fn new(
        body: TaskBody,
        poll_ready: ReadinessPoll,
        priority: TaskPriority,
        trace_info: TaskTraceInfo,
        lifecycle: TaskLifecycle,
        schedule_offset: Duration,
    ) -> Self {
        Self {
            body,
            poll_ready,
            original_priority: priority,
            effective_priority: priority,
            trace_info,
            lifecycle,
            schedule_offset,
        }
    }

    /// Raises `effective_priority` by one level. A no-op once it reaches
    /// `Critical`.
    pub(crate) fn bump_for_starvation(&mut self) {
        self.effective_priority = self.effective_priority.bump();
    }
}

/// A closure that, once its readiness poll first reports `Ready`, produces
/// the [`Task`] to actually submit.
///
/// Mirrors `DeferredTask` in the original scheduler header: used for work
/// whose shape (priority, trace info, even body) isn't known until some
/// precondition is satisfied, e.g. "wait for a prior chain stage to settle
/// before deciding whether to retry or give up."
pub struct DeferredTask {
    pub poll_ready: ReadinessPoll,
    pub schedule: Box<dyn FnOnce() -> Task + Send>,
    pub(crate) schedule_offset: Duration,
}

impl DeferredTask {
    pub fn new(
        poll_ready: ReadinessPoll,
        schedule: Box<dyn FnOnce() -> Task + Send>,
        schedule_offset: Duration,
    ) -> Self {
        Self {
            poll_ready,
            schedule,
            schedule_offset,
        }
    }
}
