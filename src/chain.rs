//! Compile-time-typed task chains.
//!
//! A chain is built as a cons-list of [`Stage`]s, each one's closure
//! signature checked against its neighbor at compile time — there is no way
//! to build a chain where stage *n*'s output type doesn't match stage
//! *n+1*'s input type. Once built, [`ChainLink::into_dyn`] erases that
//! static structure into a recursive [`ChainLinkDyn`] trait object so the
//! scheduler can drive it through the same uniform, non-generic
//! [`crate::task::TaskBody`] every other task uses; downcasting a stage's
//! input back to its concrete type can never fail, because the cons-list
//! that produced the chain already proved the types line up.
//!
//! The `stage_index` threaded through [`make_chain_body`] is diagnostic
//! only: the stored [`ChainLinkDyn`] itself, not an index into a table, is
//! what resumption dispatches on.

use std::any::Any;
use std::marker::PhantomData;

use crate::future::Promise;
use crate::priority::TaskPriority;
use crate::scheduler::SchedulerHandle;
use crate::task::{DeferredTask, Readiness, Task, TaskBody, TaskLifecycle};
use crate::token::{RequestProxy, RequestSource, ServiceToken};
use crate::trace::TaskTraceInfo;

/// The statically-typed half of a chain's stage list.
///
/// `Input`/`Output` let the compiler check adjacent stages line up; the
/// only operation is erasing into a [`ChainLinkDyn`] for execution.
pub trait ChainLink: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    #[doc(hidden)]
    fn into_dyn(self) -> Box<dyn ChainLinkDyn>;
}

/// The empty tail of a chain: its output is whatever its input was.
pub struct ChainEnd<T> {
    _marker: PhantomData<T>,
}

impl<T> ChainEnd<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ChainEnd<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ChainLink for ChainEnd<T> {
    type Input = T;
    type Output = T;

    fn into_dyn(self) -> Box<dyn ChainLinkDyn> {
        Box::new(DynEnd::<T> {
            _marker: PhantomData,
        })
    }
}

/// One stage: a closure from `In` to `Out`, followed by the rest of the
/// chain (`Next`, whose `Input` must equal `Out`).
pub struct Stage<F, In, Out, Next> {
    f: F,
    next: Next,
    _marker: PhantomData<(In, Out)>,
}

impl<F, In, Out, Next> Stage<F, In, Out, Next>
where
    F: FnOnce(In, &RequestProxy) -> Out + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
    Next: ChainLink<Input = Out>,
{
    pub fn new(f: F, next: Next) -> Self {
        Self {
            f,
            next,
            _marker: PhantomData,
        }
    }
}

impl<F, In, Out, Next> ChainLink for Stage<F, In, Out, Next>
where
    F: FnOnce(In, &RequestProxy) -> Out + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
    Next: ChainLink<Input = Out>,
{
    type Input = In;
    type Output = Next::Output;

    fn into_dyn(self) -> Box<dyn ChainLinkDyn> {
        Box::new(DynStage::<F, In, Out> {
            f: self.f,
            next: self.next.into_dyn(),
            _marker: PhantomData,
        })
    }
}

/// Result of running one type-erased link against its (type-erased) input.
#[doc(hidden)]
pub enum ChainStep {
    /// This was the last stage; the chain is done.
    Completed(Box<dyn Any + Send>),
    /// Run `0` (the remaining chain) against `1` (the next stage's input).
    Continue(Box<dyn ChainLinkDyn>, Box<dyn Any + Send>),
}

/// Object-safe, type-erased counterpart of [`ChainLink`]. The scheduler and
/// worker pool only ever see this trait, never the statically-typed
/// [`Stage`]/[`ChainEnd`] cons-list that produced it.
#[doc(hidden)]
pub trait ChainLinkDyn: Send {
    fn run(self: Box<Self>, input: Box<dyn Any + Send>, proxy: &RequestProxy) -> ChainStep;
}

struct DynStage<F, In, Out> {
    f: F,
    next: Box<dyn ChainLinkDyn>,
    _marker: PhantomData<(In, Out)>,
}

impl<F, In, Out> ChainLinkDyn for DynStage<F, In, Out>
where
    F: FnOnce(In, &RequestProxy) -> Out + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    fn run(self: Box<Self>, input: Box<dyn Any + Send>, proxy: &RequestProxy) -> ChainStep {
        let typed_input = *input
            .downcast::<In>()
            .expect("chain construction invariant violated: stage input type mismatch");
        let out = (self.f)(typed_input, proxy);
        ChainStep::Continue(self.next, Box::new(out))
    }
}

struct DynEnd<T> {
    _marker: PhantomData<T>,
}

impl<T: Send + 'static> ChainLinkDyn for DynEnd<T> {
    fn run(self: Box<Self>, input: Box<dyn Any + Send>, _proxy: &RequestProxy) -> ChainStep {
        ChainStep::Completed(input)
    }
}

/// Builds a chain from its stage closures in source order.
///
/// ```ignore
/// let chain: Chain<u32, String> = chain!(
///     |n: u32, _proxy| n * 2,
///     |n: u32, _proxy| n.to_string(),
/// );
/// ```
#[macro_export]
macro_rules! chain {
    ($f:expr $(,)?) => {
        $crate::chain::Stage::new($f, $crate::chain::ChainEnd::new())
    };
    ($f:expr, $($rest:expr),+ $(,)?) => {
        $crate::chain::Stage::new($f, $crate::chain!($($rest),+))
    };
}

/// A fully-typed, ready-to-submit task chain.
pub struct Chain<In, Out> {
    link: Box<dyn ChainLinkDyn>,
    _marker: PhantomData<(In, Out)>,
}

impl<In: Send + 'static, Out: Send + Sync + 'static> Chain<In, Out> {
    /// Erases a statically-typed stage list built with [`chain!`] (or
    /// [`Stage`]/[`ChainEnd`] directly) into a `Chain`.
    pub fn from_link<L>(link: L) -> Self
    where
        L: ChainLink<Input = In, Output = Out>,
    {
        Self {
            link: link.into_dyn(),
            _marker: PhantomData,
        }
    }

    /// Builds the [`Task`] that drives this chain to completion (or to
    /// cancellation, or to a suspend/resume cycle), reporting through
    /// `promise`.
    pub fn into_task(
        self,
        initial: In,
        promise: Promise<Out>,
        handle: SchedulerHandle,
        priority: TaskPriority,
        trace_info: TaskTraceInfo,
    ) -> Task {
        let schedule_offset = handle.now_offset();
        let lifecycle = chain_lifecycle(&promise);
        let body = make_chain_body(
            self.link,
            Box::new(initial),
            0,
            promise,
            handle,
            priority,
            trace_info.clone(),
        );
        Task::new(
            body,
            Box::new(|_elapsed| Readiness::Ready),
            priority,
            trace_info,
            lifecycle,
            schedule_offset,
        )
    }
}

/// Builds the lifecycle hooks (cancel / force-cancel before dispatch) that
/// settle `promise` without ever running the chain's body.
fn chain_lifecycle<Out: Send + Sync + 'static>(promise: &Promise<Out>) -> TaskLifecycle {
    let cancel_promise = promise.clone();
    let force_cancel_promise = promise.clone();
    TaskLifecycle {
        cancel: Box::new(move |token| cancel_promise.notify_canceled(token)),
        force_cancel: Box::new(move || force_cancel_promise.notify_force_canceled()),
    }
}

/// Builds the task body that drives a (possibly already-partial) chain from
/// `link`/`arg`, checking for cancel/suspend between every stage boundary.
/// Used both for a chain's first dispatch and for each resumption after a
/// suspend.
fn make_chain_body<Out: Send + Sync + 'static>(
    mut link: Box<dyn ChainLinkDyn>,
    mut arg: Box<dyn Any + Send>,
    mut stage_index: u32,
    promise: Promise<Out>,
    handle: SchedulerHandle,
    priority: TaskPriority,
    trace_info: TaskTraceInfo,
) -> TaskBody {
    Box::new(move || {
        promise.begin_execution();
        let proxy = promise.request_proxy();
        loop {
            match link.run(arg, &proxy) {
                ChainStep::Completed(out) => {
                    let out = *out
                        .downcast::<Out>()
                        .expect("chain construction invariant violated: final output type mismatch");
                    promise.notify_completed(out);
                    return;
                }
                ChainStep::Continue(next_link, next_arg) => {
                    link = next_link;
                    arg = next_arg;
                    stage_index += 1;
                }
            }

            // Checkpoint between stages, never before the first one: a
            // single-stage chain runs its one stage unconditionally and
            // completes without ever consulting the proxy.
            if proxy.fetch_cancel_request().is_requested() {
                crate::trace::trace_event!(
                    info,
                    "chain_canceled",
                    trace_info,
                    stage_index = stage_index
                );
                promise.notify_canceled(ServiceToken::cancel(RequestSource::UserRequest));
                return;
            }

            if proxy.fetch_suspend_request().is_requested() {
                let token = ServiceToken::suspend(RequestSource::UserRequest);
                crate::trace::trace_event!(
                    info,
                    "chain_suspended",
                    trace_info,
                    stage_index = stage_index
                );
                promise.notify_suspended(token);

                let poll_proxy = promise.request_proxy();
                let resume_link = link;
                let resume_arg = arg;
                let resume_index = stage_index;
                let resume_handle = handle.clone();
                let resume_trace = trace_info.clone();
                let resume_promise = promise.clone();
                let deferred = DeferredTask::new(
                    Box::new(move |_elapsed| {
                        if poll_proxy.fetch_cancel_request().is_requested() {
                            // Wake so the resumed body observes the cancel
                            // request and settles the promise itself.
                            Readiness::Ready
                        } else if poll_proxy.fetch_suspend_request().is_requested() {
                            Readiness::Awaiting
                        } else {
                            Readiness::Ready
                        }
                    }),
                    Box::new(move || {
                        let schedule_offset = resume_handle.now_offset();
                        let lifecycle = chain_lifecycle(&resume_promise);
                        let body = make_chain_body(
                            resume_link,
                            resume_arg,
                            resume_index,
                            resume_promise,
                            resume_handle,
                            priority,
                            resume_trace.clone(),
                        );
                        Task::new(
                            body,
                            Box::new(|_elapsed| Readiness::Ready),
                            priority,
                            resume_trace,
                            lifecycle,
                            schedule_offset,
                        )
                    }),
                    handle.now_offset(),
                );
                handle.submit_deferred(deferred);
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::make_future;
    use crate::scheduler::Scheduler;

    #[test]
    fn a_three_stage_chain_runs_in_order() {
        let chain: Chain<u32, String> = Chain::from_link(crate::chain!(
            |n: u32, _proxy: &RequestProxy| n * 2,
            |n: u32, _proxy: &RequestProxy| n + 1,
            |n: u32, _proxy: &RequestProxy| n.to_string()
        ));

        let scheduler = Scheduler::new(Default::default());
        let handle = scheduler.handle();
        let (promise, future) = make_future::<String>();
        let task = chain.into_task(
            10,
            promise,
            handle,
            TaskPriority::Interactive,
            TaskTraceInfo::default(),
        );
        (task.body)();
        assert_eq!(future.copy_result(), Some("21".to_string()));
    }
}
