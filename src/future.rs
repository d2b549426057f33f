//! Promise/Future pair.
//!
//! The cell holds an atomic state word plus an uninitialized result slot. A
//! writer (the [`Promise`]) transitions the state word; on a transition to
//! [`FutureStatus::Completed`] it first writes the result slot, then
//! publishes the state with a `Release` store. Readers load the state word
//! with `Acquire`; once they observe `Completed` the result slot is safe to
//! read.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::token::{CancelRequest, ServiceKind, ServiceToken, SuspendRequest};
use crate::trace::trace_event;

const SCHEDULED: u8 = 0;
const EXECUTING: u8 = 1;
const SUSPENDED: u8 = 2;
const CANCELED: u8 = 3;
const FORCE_CANCELED: u8 = 4;
const COMPLETED: u8 = 5;

/// A snapshot of a future's lifecycle state.
///
/// Transitions are monotonic in the direction
/// `Scheduled → Executing → {Suspended ↔ Executing}* → {Completed | Canceled | ForceCanceled}`.
/// `Completed`, `Canceled` and `ForceCanceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Scheduled,
    Executing,
    Suspended,
    Canceled,
    ForceCanceled,
    Completed,
}

impl FutureStatus {
    fn from_word(word: u8) -> Self {
        match word {
            SCHEDULED => FutureStatus::Scheduled,
            EXECUTING => FutureStatus::Executing,
            SUSPENDED => FutureStatus::Suspended,
            CANCELED => FutureStatus::Canceled,
            FORCE_CANCELED => FutureStatus::ForceCanceled,
            COMPLETED => FutureStatus::Completed,
            other => unreachable!("corrupt future state word: {other}"),
        }
    }

    /// True for `Completed`, `Canceled` and `ForceCanceled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FutureStatus::Completed | FutureStatus::Canceled | FutureStatus::ForceCanceled
        )
    }
}

impl fmt::Display for FutureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FutureStatus::Scheduled => "Scheduled",
            FutureStatus::Executing => "Executing",
            FutureStatus::Suspended => "Suspended",
            FutureStatus::Canceled => "Canceled",
            FutureStatus::ForceCanceled => "ForceCanceled",
            FutureStatus::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// State shared between a [`Promise`]/[`Future`] pair and type-erasable into
/// a [`FutureAny`] / [`RequestProxy`] since it carries no result payload.
struct Shared {
    state: AtomicU8,
    cancel_requested: AtomicBool,
    suspend_requested: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SCHEDULED),
            cancel_requested: AtomicBool::new(false),
            suspend_requested: AtomicBool::new(false),
        }
    }

    fn status(&self) -> FutureStatus {
        FutureStatus::from_word(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: &[u8], to: u8) {
        let current = self.state.load(Ordering::Acquire);
        if !from.contains(&current) {
            panic!(
                "precondition violation: expected future state in {from:?}, found {:?}",
                FutureStatus::from_word(current)
            );
        }
        match self
            .state
            .compare_exchange(current, to, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(observed) => panic!(
                "precondition violation: future state changed concurrently (expected {:?}, observed {:?})",
                FutureStatus::from_word(current),
                FutureStatus::from_word(observed)
            ),
        }
    }
}

/// The shared cell backing one `make_future` allocation: the lifecycle
/// state plus the uninitialized result slot.
struct Cell<T> {
    shared: Arc<Shared>,
    result: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for Cell<T> {}
// `Future<T>` is `Clone` and `copy_result` takes `&self`, so two threads can
// read `result` concurrently through a shared `&Cell<T>` — only sound if
// `T: Sync`, not merely `T: Send`.
unsafe impl<T: Send + Sync> Sync for Cell<T> {}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        if self.shared.status() == FutureStatus::Completed {
            // SAFETY: the result was written before the state was published
            // as `Completed` (see `Promise::notify_completed`), so it is
            // initialized here.
            unsafe {
                self.result.get_mut().assume_init_drop();
            }
        }
    }
}

/// Allocates the shared cell for one task's lifecycle, returning the
/// task-body-facing [`Promise`] and the observer-facing [`Future`].
pub fn make_future<T>() -> (Promise<T>, Future<T>) {
    let cell = Arc::new(Cell {
        shared: Arc::new(Shared::new()),
        result: UnsafeCell::new(MaybeUninit::uninit()),
    });
    (
        Promise {
            cell: cell.clone(),
        },
        Future { cell },
    )
}

/// The task-body half of a promise/future pair.
///
/// Unique by default (not `Clone`) but transferable: it can be moved into
/// whichever closure or continuation ends up running the task. Calling a
/// `notify_*` method from the wrong lifecycle state is a precondition
/// violation and panics.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Promise<T> {
    /// Returns a new, independent observer handle sharing this promise's
    /// cell.
    pub fn get_future(&self) -> Future<T> {
        Future {
            cell: self.cell.clone(),
        }
    }

    /// Returns a read-only view of this promise's request flags, to be
    /// handed to the running task.
    pub fn request_proxy(&self) -> RequestProxy {
        RequestProxy {
            shared: self.cell.shared.clone(),
        }
    }

    /// Transitions `Scheduled` or `Suspended` to `Executing`. Idempotent if
    /// already `Executing`. Called by whoever begins (or resumes) running
    /// the task body; not part of the public task-author surface.
    pub(crate) fn begin_execution(&self) {
        if self.cell.shared.status() == FutureStatus::Executing {
            return;
        }
        self.cell.shared.transition(&[SCHEDULED, SUSPENDED], EXECUTING);
    }

    /// Transitions `Executing` to `Completed`, publishing `value`.
    ///
    /// The generic CAS-based transition helper can't carry a payload, so
    /// this checks the precondition itself, writes the result, then
    /// publishes the state with a `Release` store — matching the
    /// happens-before protocol described above.
    ///
    /// # Panics
    /// Panics if the promise is not currently `Executing`.
    pub fn notify_completed(&self, value: T) {
        let current = self.cell.shared.state.load(Ordering::Acquire);
        if current != EXECUTING {
            panic!(
                "precondition violation: expected future state in [Executing], found {:?}",
                FutureStatus::from_word(current)
            );
        }
        unsafe {
            (*self.cell.result.get()).write(value);
        }
        self.cell.shared.state.store(COMPLETED, Ordering::Release);
    }

    /// Transitions `Executing` (or `Suspended`) to `Suspended`, recording
    /// `token`. Non-terminal: the future may later return to `Executing`.
    ///
    /// # Panics
    /// Panics if the promise is not currently `Executing`.
    pub fn notify_suspended(&self, token: ServiceToken) {
        debug_assert_eq!(token.kind, ServiceKind::Suspend);
        self.cell.shared.transition(&[EXECUTING], SUSPENDED);
    }

    /// Transitions to `Canceled`, from `Scheduled` (readiness closure
    /// returned `Cancel` before dispatch), `Executing` or `Suspended`
    /// (the running task cooperatively honored a cancel request).
    ///
    /// # Panics
    /// Panics if the promise is already terminal.
    pub fn notify_canceled(&self, token: ServiceToken) {
        debug_assert_eq!(token.kind, ServiceKind::Cancel);
        self.cell
            .shared
            .transition(&[SCHEDULED, EXECUTING, SUSPENDED], CANCELED);
    }

    /// Transitions `Scheduled` to `ForceCanceled`. Used only by the
    /// scheduler's shutdown sweep against tasks that never started running
    /// a task already `Executing` is never
    /// force-cancelled.
    ///
    /// # Panics
    /// Panics if the promise is not currently `Scheduled`.
    pub fn notify_force_canceled(&self) {
        self.cell.shared.transition(&[SCHEDULED], FORCE_CANCELED);
    }
}

impl<T> Clone for Promise<T> {
    /// Cheap: clones the `Arc` to the shared cell. A `Promise` is
    /// unique-by-default in the sense that only one of its clones is ever
    /// expected to actually call a `notify_*` method on a given lifecycle
    /// path (the scheduler hands out separate clones for the "run the task
    /// body", "readiness closure said cancel" and "shutdown force-cancel"
    /// paths, of which at most one ever fires) — precondition checks inside
    /// `notify_*` still guard against misuse.
    fn clone(&self) -> Self {
        Promise {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.cell.shared.status())
            .finish_non_exhaustive()
    }
}

/// The observer half of a promise/future pair. Cheaply [`Clone`]-able; all
/// clones observe the same underlying cell.
pub struct Future<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Future<T> {
    /// Snapshot of the current lifecycle state.
    pub fn status(&self) -> FutureStatus {
        self.cell.shared.status()
    }

    /// True iff the current state is terminal.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Requests cancellation. Idempotent; advisory — a
    /// `Critical` task may ignore it entirely.
    pub fn request_cancel(&self) {
        self.cell.shared.cancel_requested.store(true, Ordering::Release);
    }

    /// Requests suspension. Idempotent.
    pub fn request_suspend(&self) {
        self.cell.shared.suspend_requested.store(true, Ordering::Release);
    }

    /// Clears a prior suspend request. Idempotent.
    pub fn request_resume(&self) {
        self.cell.shared.suspend_requested.store(false, Ordering::Release);
    }

    /// Type-erases this future into a [`FutureAny`], e.g. for use as a
    /// subsystem shutdown fence.
    pub fn into_any(self) -> FutureAny {
        FutureAny {
            shared: self.cell.shared.clone(),
        }
    }
}

impl<T: Clone> Future<T> {
    /// Returns a copy of the result if the future is `Completed`, otherwise
    /// `None`. The result is read-only after completion, so every observer
    /// that calls this sees the same value.
    pub fn copy_result(&self) -> Option<T> {
        if self.status() != FutureStatus::Completed {
            return None;
        }
        // SAFETY: state is `Completed`, so the result slot was initialized
        // before that state was published (Release store in
        // `notify_completed`), and this `Acquire` status load synchronizes
        // with it.
        Some(unsafe { (*self.cell.result.get()).assume_init_ref().clone() })
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A type-erased [`Future`], used where the output type is irrelevant (e.g.
/// a subsystem's shutdown fence).
#[derive(Clone)]
pub struct FutureAny {
    shared: Arc<Shared>,
}

impl FutureAny {
    pub fn status(&self) -> FutureStatus {
        self.shared.status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn request_cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
    }

    pub fn request_suspend(&self) {
        self.shared.suspend_requested.store(true, Ordering::Release);
    }

    pub fn request_resume(&self) {
        self.shared.suspend_requested.store(false, Ordering::Release);
    }
}

impl fmt::Debug for FutureAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureAny")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A read-only view onto the request flags of a promise's cell, handed to
/// the running task so it can cooperatively check for cancel/suspend
/// requests.
#[derive(Clone)]
pub struct RequestProxy {
    shared: Arc<Shared>,
}

impl RequestProxy {
    pub fn fetch_cancel_request(&self) -> CancelRequest {
        if self.shared.cancel_requested.load(Ordering::Acquire) {
            CancelRequest::Requested
        } else {
            CancelRequest::NotRequested
        }
    }

    pub fn fetch_suspend_request(&self) -> SuspendRequest {
        if self.shared.suspend_requested.load(Ordering::Acquire) {
            SuspendRequest::Suspended
        } else {
            SuspendRequest::Resumed
        }
    }
}
