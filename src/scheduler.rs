//! The scheduler core.
//!
//! Owns the pending/deferred queues and the worker pool, and drives one
//! tick at a time: drain cross-thread submissions, force-cancel pending
//! work if shutting down, sweep readiness, dispatch by priority, sweep
//! deferred entries, then bump starved tasks. Pending/deferred queues are
//! single-writer (this struct, from whichever thread calls `tick()`); tasks
//! and deferred entries submitted from worker threads (e.g. a chain's
//! suspend/resume continuation) go through [`SchedulerHandle`]'s
//! `Mutex`-guarded inbox instead, and are only spliced into the real queues
//! while draining at the top of a tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::future::{make_future, Future, FutureAny, Promise};
use crate::priority::TaskPriority;
use crate::subsystem::{Subsystem, SubsystemsContext};
use crate::task::{DeferredTask, Readiness, Task, TaskLifecycle};
use crate::token::{RequestProxy, RequestSource, ServiceToken};
use crate::trace::{trace_event, TaskTraceInfo};
use crate::worker::WorkerPool;

/// Outcome a bare (non-chain) task body reports back through its promise.
pub enum TaskOutcome<T> {
    /// The task ran to completion, producing `T`.
    Completed(T),
    /// The task observed a cancel request (via its [`RequestProxy`]) and
    /// stopped early.
    Canceled,
}

/// Builder for a [`Scheduler`]'s fixed configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    worker_count: usize,
    starvation_threshold: Duration,
    reference_timepoint: Instant,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            starvation_threshold: Duration::from_millis(50),
            reference_timepoint: Instant::now(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the worker pool size (default: `num_cpus::get()`).
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Overrides how long an `Awaiting` task may go un-dispatched before its
    /// effective priority is bumped (default: 50ms).
    pub fn with_starvation_threshold(mut self, threshold: Duration) -> Self {
        self.starvation_threshold = threshold;
        self
    }

    /// Overrides the origin of the monotonic clock that every "time since
    /// submission" readiness value is measured against. Default:
    /// `Instant::now()` at construction.
    pub fn with_reference_timepoint(mut self, reference_timepoint: Instant) -> Self {
        self.reference_timepoint = reference_timepoint;
        self
    }
}

struct Inbox {
    tasks: Vec<Task>,
    deferred: Vec<DeferredTask>,
}

/// A cheaply-cloneable, `Send + Sync` handle for submitting work from any
/// thread — most notably from inside a running task body on a worker
/// thread, e.g. a suspended chain's continuation.
#[derive(Clone)]
pub struct SchedulerHandle {
    inbox: Arc<Mutex<Inbox>>,
    tick_counter: Arc<AtomicU64>,
    reference_timepoint: Instant,
}

impl SchedulerHandle {
    /// Appends `task` to the cross-thread inbox; spliced into the real
    /// pending queue at the start of the scheduler's next tick.
    pub fn submit_task(&self, task: Task) {
        self.inbox.lock().unwrap().tasks.push(task);
    }

    /// Appends `deferred` to the cross-thread inbox.
    pub fn submit_deferred(&self, deferred: DeferredTask) {
        self.inbox.lock().unwrap().deferred.push(deferred);
    }

    /// The scheduler's current tick counter. Diagnostic only.
    pub fn current_tick(&self) -> u64 {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Elapsed time since the scheduler's `reference_timepoint`, used to
    /// stamp a newly-built task's `schedule_offset`.
    pub fn now_offset(&self) -> Duration {
        Instant::now().saturating_duration_since(self.reference_timepoint)
    }
}

/// The scheduler core: owns the pending/deferred queues and the worker
/// pool, and advances them one tick at a time.
///
/// The scheduler is itself a [`Subsystem`]: its `get_future()` is the
/// cancellation fence the host sets to request shutdown, `link()` is a
/// no-op, and `tick()` runs the per-tick algorithm below.
pub struct Scheduler {
    pending: Vec<Task>,
    deferred: Vec<DeferredTask>,
    workers: WorkerPool,
    inbox: Arc<Mutex<Inbox>>,
    tick_counter: Arc<AtomicU64>,
    starvation_threshold: Duration,
    reference_timepoint: Instant,
    shutdown_promise: Promise<()>,
    shutdown_future: Future<()>,
    shutdown_proxy: RequestProxy,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (shutdown_promise, shutdown_future) = make_future::<()>();
        shutdown_promise.begin_execution();
        let shutdown_proxy = shutdown_promise.request_proxy();
        Self {
            pending: Vec::new(),
            deferred: Vec::new(),
            workers: WorkerPool::new(config.worker_count),
            inbox: Arc::new(Mutex::new(Inbox {
                tasks: Vec::new(),
                deferred: Vec::new(),
            })),
            tick_counter: Arc::new(AtomicU64::new(0)),
            starvation_threshold: config.starvation_threshold,
            reference_timepoint: config.reference_timepoint,
            shutdown_promise,
            shutdown_future,
            shutdown_proxy,
        }
    }

    /// A cloneable handle usable from any thread to submit work into this
    /// scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            inbox: self.inbox.clone(),
            tick_counter: self.tick_counter.clone(),
            reference_timepoint: self.reference_timepoint,
        }
    }

    /// The current tick count. Diagnostic only.
    pub fn current_tick(&self) -> u64 {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Elapsed time since `reference_timepoint`.
    pub fn now_offset(&self) -> Duration {
        Instant::now().saturating_duration_since(self.reference_timepoint)
    }

    /// How many tasks are currently pending (not yet dispatched).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// How many deferred entries are currently outstanding.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Submits a bare task body directly on the scheduler's owning thread.
    ///
    /// `body` receives a [`RequestProxy`] so it can cooperatively notice a
    /// cancel request and return [`TaskOutcome::Canceled`] instead of
    /// running to completion.
    pub fn submit<F, T>(
        &mut self,
        priority: TaskPriority,
        trace_info: TaskTraceInfo,
        body: F,
    ) -> Future<T>
    where
        F: FnOnce(&RequestProxy) -> TaskOutcome<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.submit_when_ready(
            priority,
            trace_info,
            Box::new(|_elapsed| Readiness::Ready),
            body,
        )
    }

    /// Like [`Scheduler::submit`], but with an explicit readiness poll
    /// instead of the implicit always-ready one — the same knob
    /// [`crate::chain::Chain`] and [`crate::task::DeferredTask`] use
    /// internally, exposed here for bare tasks whose eligibility depends on
    /// an external condition.
    pub fn submit_when_ready<F, T>(
        &mut self,
        priority: TaskPriority,
        trace_info: TaskTraceInfo,
        poll_ready: crate::task::ReadinessPoll,
        body: F,
    ) -> Future<T>
    where
        F: FnOnce(&RequestProxy) -> TaskOutcome<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let (promise, future) = make_future::<T>();
        let task = build_bare_task(
            promise,
            priority,
            trace_info,
            self.now_offset(),
            poll_ready,
            body,
        );
        self.pending.push(task);
        future
    }

    /// Submits a task chain, built via [`crate::chain::Chain::into_task`].
    pub fn submit_task(&mut self, task: Task) {
        self.pending.push(task);
    }

    /// Requests an orderly shutdown: from the next tick onward, any pending
    /// task whose priority permits force-cancellation is force-cancelled
    /// rather than dispatched; `Critical` tasks are still dispatched and
    /// run to completion.
    pub fn request_shutdown(&mut self) {
        self.shutdown_future.request_cancel();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_proxy.fetch_cancel_request().is_requested()
    }

    /// Advances the scheduler by one tick:
    /// 1. drain cross-thread submissions into the pending/deferred queues,
    /// 2. if shutting down, force-cancel force-cancellable pending tasks,
    /// 3. sweep pending tasks' readiness,
    /// 4. dispatch ready tasks to the worker pool in priority order,
    /// 5. sweep deferred entries' readiness,
    /// 6. bump the effective priority of tasks that have starved.
    pub fn tick(&mut self) {
        self.tick_counter.fetch_add(1, Ordering::Relaxed);
        self.drain_inbox();

        if self.shutdown_requested() {
            self.force_cancel_pending();
        }

        let ready = self.sweep_pending_readiness();
        self.dispatch(ready);
        self.sweep_deferred();
        self.bump_starved();
    }

    fn drain_inbox(&mut self) {
        let mut inbox = self.inbox.lock().unwrap();
        self.pending.append(&mut inbox.tasks);
        self.deferred.append(&mut inbox.deferred);
    }

    /// Force-cancels pending tasks whose *original* priority permits it.
    ///
    /// Keyed off `original_priority`, not `effective_priority`: a task
    /// starved into a higher effective priority still shuts down according
    /// to what it was submitted as — starvation bumps change dispatch
    /// order, not the shutdown contract.
    fn force_cancel_pending(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].original_priority.is_force_cancellable() {
                let task = self.pending.remove(i);
                trace_event!(
                    info,
                    "task_force_canceled",
                    task.trace_info,
                    tick = self.tick_counter.load(Ordering::Relaxed)
                );
                (task.lifecycle.force_cancel)();
            } else {
                i += 1;
            }
        }
    }

    fn sweep_pending_readiness(&mut self) -> Vec<Task> {
        let now = self.now_offset();
        let mut ready = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut task in self.pending.drain(..) {
            let elapsed = now.saturating_sub(task.schedule_offset);
            match (task.poll_ready)(elapsed) {
                Readiness::Ready => ready.push(task),
                Readiness::Awaiting => still_pending.push(task),
                Readiness::Cancel => {
                    trace_event!(
                        info,
                        "task_canceled",
                        task.trace_info,
                        tick = self.tick_counter.load(Ordering::Relaxed)
                    );
                    (task.lifecycle.cancel)(ServiceToken::cancel(RequestSource::Executor));
                }
            }
        }
        self.pending = still_pending;
        ready
    }

    fn dispatch(&mut self, mut ready: Vec<Task>) {
        // Stable sort: `Critical` first, ties broken by submission order.
        ready.sort_by(|a, b| b.effective_priority.cmp(&a.effective_priority));

        for mut task in ready {
            trace_event!(
                debug,
                "task_dispatched",
                task.trace_info,
                priority = ?task.effective_priority
            );
            match self.workers.dispatch(task.body) {
                Ok(()) => {}
                Err(failure) => {
                    task.body = failure.job;
                    self.pending.push(task);
                }
            }
        }
    }

    fn sweep_deferred(&mut self) {
        let now = self.now_offset();
        let mut still_deferred = Vec::with_capacity(self.deferred.len());
        for mut deferred in self.deferred.drain(..) {
            let elapsed = now.saturating_sub(deferred.schedule_offset);
            match (deferred.poll_ready)(elapsed) {
                Readiness::Ready => {
                    let task = (deferred.schedule)();
                    self.pending.push(task);
                }
                Readiness::Awaiting => still_deferred.push(deferred),
                Readiness::Cancel => {}
            }
        }
        self.deferred = still_deferred;
    }

    fn bump_starved(&mut self) {
        let now = self.now_offset();
        for task in self.pending.iter_mut() {
            if task.effective_priority == TaskPriority::Critical {
                continue;
            }
            if now.saturating_sub(task.schedule_offset) >= self.starvation_threshold {
                trace_event!(info, "task_starvation_bump", task.trace_info);
                task.bump_for_starvation();
            }
        }
    }

    /// Shuts the worker pool down, joining every worker thread. Any tasks
    /// already dispatched finish running; nothing new can be dispatched
    /// afterward. Settles the scheduler's own cancellation future to
    /// `Completed`.
    pub fn shutdown_workers(self) {
        self.workers.shutdown();
        self.shutdown_promise.notify_completed(());
    }
}

impl Subsystem for Scheduler {
    /// The scheduler's own cancellation fence: requesting cancel on it is
    /// equivalent to [`Scheduler::request_shutdown`]; it becomes done once
    /// [`Scheduler::shutdown_workers`] has joined every worker thread.
    fn get_future(&self) -> FutureAny {
        self.shutdown_future.clone().into_any()
    }

    /// No-op: the scheduler has no dependency on its sibling subsystems.
    fn link(&mut self, _ctx: &SubsystemsContext) {}

    /// Drives one tick of the algorithm. `delta` is accepted to satisfy the
    /// [`Subsystem`] interface's per-frame contract but is otherwise unused:
    /// the scheduler derives all "time since X" values from its own
    /// monotonic `reference_timepoint`, not from an accumulated delta.
    fn tick(&mut self, _delta: Duration) {
        self.tick();
    }
}

fn build_bare_task<F, T>(
    promise: crate::future::Promise<T>,
    priority: TaskPriority,
    trace_info: TaskTraceInfo,
    schedule_offset: Duration,
    poll_ready: crate::task::ReadinessPoll,
    body: F,
) -> Task
where
    F: FnOnce(&RequestProxy) -> TaskOutcome<T> + Send + 'static,
    T: Send + Sync + 'static,
{
    let run_promise = promise.clone();
    let cancel_promise = promise.clone();
    let force_cancel_promise = promise.clone();

    let task_body: crate::task::TaskBody = Box::new(move || {
        run_promise.begin_execution();
        let proxy = run_promise.request_proxy();
        match body(&proxy) {
            TaskOutcome::Completed(value) => run_promise.notify_completed(value),
            TaskOutcome::Canceled => {
                run_promise.notify_canceled(ServiceToken::cancel(RequestSource::UserRequest))
            }
        }
    });

    let lifecycle = TaskLifecycle {
        cancel: Box::new(move |token| cancel_promise.notify_canceled(token)),
        force_cancel: Box::new(move || force_cancel_promise.notify_force_canceled()),
    };

    Task::new(
        task_body,
        poll_ready,
        priority,
        trace_info,
        lifecycle,
        schedule_offset,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn wait_for<T: Clone>(future: &Future<T>, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(value) = future.copy_result() {
                return Some(value);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn a_simple_task_completes() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new().with_worker_count(1));
        let future = scheduler.submit(TaskPriority::Interactive, TaskTraceInfo::default(), |_proxy| {
            TaskOutcome::Completed(42)
        });
        scheduler.tick();
        assert_eq!(wait_for(&future, Duration::from_secs(1)), Some(42));
        scheduler.shutdown_workers();
    }

    #[test]
    fn critical_tasks_dispatch_before_background_tasks() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new().with_worker_count(1));
        let (tx, rx) = mpsc::channel::<&'static str>();

        let tx_bg = tx.clone();
        let _bg = scheduler.submit(TaskPriority::Background, TaskTraceInfo::default(), move |_p| {
            tx_bg.send("background").unwrap();
            TaskOutcome::Completed(())
        });
        let tx_crit = tx.clone();
        let _crit = scheduler.submit(TaskPriority::Critical, TaskTraceInfo::default(), move |_p| {
            tx_crit.send("critical").unwrap();
            TaskOutcome::Completed(())
        });

        scheduler.tick();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "critical");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "background");
        scheduler.shutdown_workers();
    }

    #[test]
    fn readiness_cancel_settles_the_future_without_running_the_body() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new().with_worker_count(1));
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();

        let (promise, future) = make_future::<()>();
        let lifecycle_promise = promise.clone();
        let body: crate::task::TaskBody = Box::new(move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        let task = Task::new(
            body,
            Box::new(|_elapsed| Readiness::Cancel),
            TaskPriority::Interactive,
            TaskTraceInfo::default(),
            TaskLifecycle {
                cancel: Box::new(move |token| lifecycle_promise.notify_canceled(token)),
                force_cancel: Box::new(move || {}),
            },
            Duration::ZERO,
        );
        scheduler.submit_task(task);
        scheduler.tick();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(
            future.status(),
            crate::future::FutureStatus::Canceled
        );
        scheduler.shutdown_workers();
    }

    #[test]
    fn shutdown_force_cancels_background_but_spares_critical() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new().with_worker_count(1));

        let (bg_promise, bg_future) = make_future::<()>();
        let (crit_promise, _crit_future) = make_future::<()>();

        let never_runs = || -> crate::task::TaskBody { Box::new(|| {}) };

        let bg_cancel_promise = bg_promise.clone();
        let bg_force_promise = bg_promise.clone();
        scheduler.submit_task(Task::new(
            never_runs(),
            Box::new(|_elapsed| Readiness::Awaiting),
            TaskPriority::Background,
            TaskTraceInfo::default(),
            TaskLifecycle {
                cancel: Box::new(move |token| bg_cancel_promise.notify_canceled(token)),
                force_cancel: Box::new(move || bg_force_promise.notify_force_canceled()),
            },
            Duration::ZERO,
        ));

        let crit_cancel_promise = crit_promise.clone();
        let crit_force_promise = crit_promise;
        scheduler.submit_task(Task::new(
            never_runs(),
            Box::new(|_elapsed| Readiness::Awaiting),
            TaskPriority::Critical,
            TaskTraceInfo::default(),
            TaskLifecycle {
                cancel: Box::new(move |token| crit_cancel_promise.notify_canceled(token)),
                force_cancel: Box::new(move || crit_force_promise.notify_force_canceled()),
            },
            Duration::ZERO,
        ));

        scheduler.request_shutdown();
        scheduler.tick();

        assert_eq!(bg_future.status(), crate::future::FutureStatus::ForceCanceled);
        assert_eq!(scheduler.pending_len(), 1); // the critical task is still pending, awaiting dispatch
        scheduler.shutdown_workers();
    }

    #[test]
    fn a_starved_background_task_is_bumped_above_critical_is_never_reached() {
        // Starvation bumps by exactly one level and saturates at Critical;
        // this exercises the bump firing at all under a short threshold.
        let mut scheduler = Scheduler::new(
            SchedulerConfig::new()
                .with_worker_count(1)
                .with_starvation_threshold(Duration::from_millis(1)),
        );
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let poll_gate = gate.clone();
        let _future = scheduler.submit_when_ready(
            TaskPriority::Background,
            TaskTraceInfo::default(),
            Box::new(move |_elapsed| {
                if poll_gate.load(Ordering::SeqCst) {
                    Readiness::Ready
                } else {
                    Readiness::Awaiting
                }
            }),
            |_proxy| TaskOutcome::Completed(()),
        );

        scheduler.tick();
        std::thread::sleep(Duration::from_millis(5));
        scheduler.tick();

        assert_eq!(scheduler.pending[0].effective_priority, TaskPriority::Interactive);
        assert_eq!(scheduler.pending[0].original_priority, TaskPriority::Background);
        scheduler.shutdown_workers();
    }

    #[test]
    fn scheduler_as_subsystem_reports_done_after_shutdown_workers() {
        let scheduler = Scheduler::new(SchedulerConfig::new().with_worker_count(1));
        let fence = Subsystem::get_future(&scheduler);
        assert!(!fence.is_done());
        scheduler.shutdown_workers();
        assert!(fence.is_done());
    }
}
