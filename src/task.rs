//! Task bodies and the two-token suspension protocol.
//!
//! A task body is represented as a `Future` — the compiler already builds
//! an explicit `Ready`/`Suspended` state machine for any `async fn`, so
//! there is no need to hand-roll one or to embed a host coroutine runtime.
//! The runner polls task bodies manually with a no-op waker; nothing here
//! is ever woken by `Waker::wake` — the runner alone decides when a task
//! is stepped again, driven by the scheduling rules of §4.1.
//!
//! The two suspension tokens the run loop recognizes (`brief-no-cancel`
//! and `indefinite(abort)`) don't fit through a bare `Poll::Pending`, so
//! they're carried across the `poll()` boundary through a pair of
//! task-local cells read immediately after the runner's `poll()` call
//! returns. Since only the loop thread ever polls a task body, this is
//! race-free without further synchronization.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::{Outcome, RunError};
use crate::scope::ScopeId;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Introspection snapshot of a task's scheduling state (invariant 1 of
/// §8: a task is in exactly one of these at any instant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    SuspendedWithAbort,
    Finished,
}

/// Whether an abort callback was able to cancel the blocking operation it
/// was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// The operation was torn down; the runner may reschedule the task
    /// with the cancellation cause.
    Succeeded,
    /// The blocking operation is already committed to completing on its
    /// own terms; the runner must not intervene, and the blocking code
    /// undertakes to reschedule the task itself eventually.
    Failed,
}

/// What an abort callback is being asked to tear down: an ordinary
/// cancellation (carrying the scope it originated from) or a keyboard
/// interrupt delivered to the main task (§4.6).
#[derive(Debug, Clone, Copy)]
pub enum AbortSignal {
    Cancel(crate::error::Cancelled),
    KeyboardInterrupt,
}

/// Negotiates cancellation delivery for an indefinitely-suspended task.
/// See §4.2/§4.3: called with the pending signal; returns whether the
/// suspended operation was torn down. On `Succeeded` the runner resumes
/// the task with the signal translated into its `Outcome::Error`.
pub type AbortFn = Box<dyn FnOnce(AbortSignal) -> Abort>;

pub(crate) type BoxedResult = Box<dyn Any>;
pub(crate) type Resume = Outcome<BoxedResult>;

pub(crate) enum PendingSuspend {
    BriefNoCancel,
    Indefinite(AbortFn),
    /// Like `Indefinite`, but if delivery finds nothing pending against
    /// `abort_fn` the runner reschedules the task immediately instead of
    /// leaving it parked — the suspension exists only to offer a
    /// cancellation point, not to actually wait for anything.
    Checkpoint(AbortFn),
}

thread_local! {
    static PENDING_SUSPEND: RefCell<Option<PendingSuspend>> = RefCell::new(None);
    static CURRENT_RESUME: RefCell<Option<Resume>> = RefCell::new(None);
    static CURRENT_TASK: RefCell<Option<TaskId>> = RefCell::new(None);
}

/// The `TaskId` of the task currently being stepped. Panics if called
/// outside of a task body (there is always exactly one while the loop
/// thread is inside `poll_task`).
pub fn current_task() -> TaskId {
    CURRENT_TASK
        .with(|c| *c.borrow())
        .expect("current_task() called outside of a running task")
}

pub(crate) fn set_current_task(id: Option<TaskId>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = id);
}

pub(crate) fn set_current_resume(resume: Option<Resume>) {
    CURRENT_RESUME.with(|c| *c.borrow_mut() = resume);
}

pub(crate) fn take_pending_suspend() -> Option<PendingSuspend> {
    PENDING_SUSPEND.with(|c| c.borrow_mut().take())
}

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

/// A waker that is never woken: the runner decides when to re-poll a task
/// purely from its own scheduling state, never from `Waker::wake`.
pub(crate) fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

struct CheckpointNoCancel {
    suspended: bool,
}

impl Future for CheckpointNoCancel {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.suspended {
            return Poll::Ready(());
        }
        this.suspended = true;
        PENDING_SUSPEND.with(|c| *c.borrow_mut() = Some(PendingSuspend::BriefNoCancel));
        Poll::Pending
    }
}

/// Suspend and reschedule unconditionally, without offering the runner a
/// cancellation delivery point. Used to build blocking primitives whose
/// own internal bookkeeping must run to completion once started.
pub async fn checkpoint_no_cancel() {
    CheckpointNoCancel { suspended: false }.await
}

enum WtrState {
    NotStarted(Option<AbortFn>),
    Started,
}

struct WaitTaskRescheduled {
    state: WtrState,
}

impl Future for WaitTaskRescheduled {
    type Output = Resume;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Resume> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, WtrState::Started) {
            WtrState::NotStarted(abort_fn) => {
                let abort_fn = abort_fn.expect("abort_fn taken twice");
                PENDING_SUSPEND
                    .with(|c| *c.borrow_mut() = Some(PendingSuspend::Indefinite(abort_fn)));
                Poll::Pending
            }
            WtrState::Started => {
                let resume = CURRENT_RESUME
                    .with(|c| c.borrow_mut().take())
                    .expect("task resumed without a value delivered via reschedule()");
                Poll::Ready(resume)
            }
        }
    }
}

/// The low-level suspension primitive: yield to the runner, registering
/// `abort_fn` to negotiate cancellation delivery while suspended. The only
/// way back is the runner calling `reschedule(current_task(), outcome)`.
pub async fn wait_task_rescheduled(abort_fn: AbortFn) -> Resume {
    WaitTaskRescheduled {
        state: WtrState::NotStarted(Some(abort_fn)),
    }
    .await
}

enum CheckpointState {
    NotStarted,
    Started,
}

struct Checkpoint {
    state: CheckpointState,
}

/// A checkpoint has nothing in flight that could legitimately refuse to be
/// torn down, so it accepts either signal and always reschedules the task
/// (with a cancellation or keyboard-interrupt outcome, respectively).
fn trivial_abort_fn() -> AbortFn {
    Box::new(|_signal| Abort::Succeeded)
}

impl Future for Checkpoint {
    type Output = Resume;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Resume> {
        let this = self.get_mut();
        match this.state {
            CheckpointState::NotStarted => {
                this.state = CheckpointState::Started;
                PENDING_SUSPEND
                    .with(|c| *c.borrow_mut() = Some(PendingSuspend::Checkpoint(trivial_abort_fn())));
                Poll::Pending
            }
            CheckpointState::Started => {
                let resume = CURRENT_RESUME
                    .with(|c| c.borrow_mut().take())
                    .expect("checkpoint resumed without a value delivered via reschedule()");
                Poll::Ready(resume)
            }
        }
    }
}

/// A cancellation checkpoint: offers the runner one chance to deliver a
/// pending cancellation or keyboard interrupt. If neither is pending, the
/// task is rescheduled immediately with `Ok(())` — a checkpoint never
/// blocks waiting for something to happen, unlike [`wait_task_rescheduled`].
pub async fn checkpoint() -> Result<(), RunError> {
    let resume = Checkpoint {
        state: CheckpointState::NotStarted,
    }
    .await;
    match resume {
        Outcome::Value(_) => Ok(()),
        Outcome::Error(e) => Err(e),
    }
}

/// Internal record of a live task, owned by the runner's task table.
///
/// `body` is `Option`-wrapped so the stepping routine can lift it out of
/// the task table before calling `poll`: while a task's own future is
/// executing it is free to call back into the runner (entering scopes,
/// spawning children), and those calls must not find themselves aliasing
/// a `&mut` borrow the stepping routine is still holding into this same
/// record. The field is always `Some` except for the brief window a task
/// is actually being polled.
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    pub(crate) body: Option<Pin<Box<dyn Future<Output = Outcome<BoxedResult>>>>>,
    pub(crate) scope_stack: Vec<ScopeId>,
    pub(crate) next_send: Option<Resume>,
    pub(crate) abort_fn: Option<AbortFn>,
    pub(crate) outcome: Option<Outcome<BoxedResult>>,
    pub(crate) monitors: Vec<TaskId>,
    pub(crate) protected: bool,
    pub(crate) started: bool,
    /// Set once, permanently, by `finish_task`. `outcome` is a take-once
    /// slot a `JoinHandle` may empty long before the record itself is gone,
    /// so liveness checks must consult this flag rather than `outcome`.
    pub(crate) finished: bool,
}

impl TaskRecord {
    pub(crate) fn state(&self) -> TaskState {
        if self.finished {
            TaskState::Finished
        } else if self.abort_fn.is_some() {
            TaskState::SuspendedWithAbort
        } else {
            TaskState::Runnable
        }
    }
}

/// A handle to a spawned task's eventual result. Consumed by `join`,
/// which is the mechanism a nursery uses to wait for each of its
/// children (§4.4); nothing else in this core holds one past first use.
pub struct JoinHandle<T> {
    pub(crate) task: TaskId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.task
    }

    /// Wait for the task to finish and return its outcome. Consumes the
    /// handle: only one waiter may join a given handle.
    pub async fn join(self) -> Outcome<T> {
        let boxed = crate::runner::join_task(self.task).await;
        boxed.map(|b| {
            *b.downcast::<T>()
                .unwrap_or_else(|_| panic!("JoinHandle<T> type mismatch for {}", self.task))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_values_are_unique_and_increasing() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn task_record_state_reflects_fields() {
        let mut record = TaskRecord {
            id: TaskId::new(),
            body: Some(Box::pin(async { Outcome::Value(Box::new(()) as BoxedResult) })),
            scope_stack: Vec::new(),
            next_send: None,
            abort_fn: None,
            outcome: None,
            monitors: Vec::new(),
            protected: false,
            started: false,
            finished: false,
        };
        assert_eq!(record.state(), TaskState::Runnable);
        record.abort_fn = Some(Box::new(|_| Abort::Failed));
        assert_eq!(record.state(), TaskState::SuspendedWithAbort);
        record.abort_fn = None;
        record.outcome = Some(Outcome::Value(Box::new(())));
        record.finished = true;
        assert_eq!(record.state(), TaskState::Finished);
    }
}
