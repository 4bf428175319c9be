//! Nursery: a parent-owned group of child tasks wrapping one [`CancelScope`].
//!
//! Entering a nursery creates a fresh scope and binds the parent task to
//! it; `spawn` registers a child bound to the nursery's (inherited) scope
//! stack. Closing the nursery waits for every child, aggregates failures,
//! and — on the first observed failure — cancels the scope and shields
//! the remaining wait so cleanup finishes even under an outer cancellation
//! (§4.4).

use std::future::Future;
use std::marker::PhantomData;

use crate::clock::Deadline;
use crate::error::{AggregateError, Outcome, RunError};
use crate::scope::CancelScope;
use crate::task::{current_task, Abort, JoinHandle, TaskId};

/// A block-scoped group of child tasks. No child escapes its nursery: the
/// nursery block exits iff all children have exited (invariant 3, §8).
pub struct Nursery {
    scope: CancelScope,
    parent: TaskId,
    children: Vec<TaskId>,
    closed: bool,
}

impl Nursery {
    /// Open a nursery bound to a fresh, deadline-free scope, and bind the
    /// calling task to it. Pair with [`Nursery::close`] (or use
    /// [`with_nursery`], which does both around a body closure).
    pub fn open() -> Self {
        let scope = CancelScope::new(Deadline::INFINITE);
        let parent = current_task();
        crate::runner::with_runner(|r| r.enter_scope(parent, scope.id()));
        Nursery {
            scope,
            parent,
            children: Vec::new(),
            closed: false,
        }
    }

    /// The nursery's own cancel scope. Cancelling it tears down every
    /// child currently bound to the nursery.
    pub fn cancel_scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Spawn a child task bound to the nursery's scope stack (the
    /// parent's inherited stack plus the nursery's own scope).
    pub fn spawn<F, T>(&mut self, body: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T, RunError>> + 'static,
        T: 'static,
    {
        assert!(!self.closed, "cannot spawn into a closed nursery");
        let scope_stack =
            crate::runner::with_runner(|r| r.tasks.get(&self.parent).unwrap().scope_stack.clone());
        let boxed: std::pin::Pin<Box<dyn Future<Output = Outcome<Box<dyn std::any::Any>>>>> =
            Box::pin(async move {
                match body.await {
                    Ok(v) => Outcome::Value(Box::new(v) as Box<dyn std::any::Any>),
                    Err(e) => Outcome::Error(e),
                }
            });
        let id = crate::runner::with_runner(|r| r.spawn_task(boxed, scope_stack));
        self.children.push(id);
        JoinHandle {
            task: id,
            _marker: PhantomData,
        }
    }

    /// How many children have not yet finished.
    pub fn live_children(&self) -> usize {
        crate::runner::with_runner(|r| {
            self.children
                .iter()
                .filter(|c| {
                    r.tasks
                        .get(c)
                        .map(|t| !t.finished)
                        .unwrap_or(false)
                })
                .count()
        })
    }

    /// Wait for every child to finish, aggregate their failures together
    /// with `body_result` (the outcome of the code that ran inside the
    /// nursery block), and exit the nursery's scope. Returns
    /// `AggregateError` collapsed per the usual rules: `Ok(())` if nothing
    /// failed, the sole cause if exactly one did, `Err(Aggregate(..))`
    /// otherwise.
    pub async fn close(mut self, body_result: Result<(), RunError>) -> Result<(), RunError> {
        let mut causes = Vec::new();
        if let Err(e) = body_result {
            causes.push(e);
        }

        let mut remaining = self.children.clone();
        let mut shielded = false;
        while !remaining.is_empty() {
            match wait_for_any_finished(&remaining).await {
                Ok(finished) => {
                    remaining.retain(|&t| t != finished);
                    if let Some(outcome) = crate::runner::with_runner(|r| {
                        r.tasks.get_mut(&finished).and_then(|t| t.outcome.take())
                    }) {
                        if let Outcome::Error(e) = outcome {
                            causes.push(e);
                        }
                    }
                    if !causes.is_empty() && !shielded {
                        self.scope.cancel();
                        self.scope.set_shield(true);
                        shielded = true;
                    }
                }
                Err(e) => {
                    // An outer cancellation interrupted the wait itself.
                    causes.push(e);
                    if !shielded {
                        self.scope.cancel();
                        self.scope.set_shield(true);
                        shielded = true;
                    }
                }
            }
        }
        if shielded {
            self.scope.set_shield(false);
        }

        let parent = self.parent;
        let scope_id = self.scope.id();
        crate::runner::with_runner(|r| r.exit_scope(parent, scope_id));
        self.closed = true;

        let aggregated = match AggregateError::collect(causes) {
            None => Ok(()),
            Some(e) => Err(e),
        };
        // A nursery may cancel its own scope deliberately (e.g. to tear
        // down a sibling once one child fails); that self-inflicted
        // cancellation must be absorbed here rather than surface as a
        // propagating failure, exactly as a `CancelScope::run` block
        // would absorb it.
        crate::scope::filter_result(scope_id, aggregated)
    }
}

/// Suspend until at least one of `children` has finished, returning its
/// id, or propagate a cancellation that interrupted the wait itself. Mirrors
/// the source's `ParkingLot` park/unpark pattern: register as a monitor on
/// each still-running child, then wake on the next reschedule and recheck.
async fn wait_for_any_finished(children: &[TaskId]) -> Result<TaskId, RunError> {
    loop {
        if let Some(found) = crate::runner::with_runner(|r| {
            children
                .iter()
                .copied()
                .find(|c| r.tasks.get(c).map(|t| t.finished).unwrap_or(true))
        }) {
            return Ok(found);
        }

        let me = current_task();
        crate::runner::with_runner(|r| {
            for child in children {
                if let Some(rec) = r.tasks.get_mut(child) {
                    if !rec.monitors.contains(&me) {
                        rec.monitors.push(me);
                    }
                }
            }
        });

        let resume = crate::task::wait_task_rescheduled(Box::new(|_raise| Abort::Succeeded)).await;
        if let Outcome::Error(e) = resume {
            return Err(e);
        }
    }
}

/// Run `body` inside a fresh nursery, aggregating every child's failure
/// together with whatever `body` itself returns. `body` takes the nursery
/// by value and must hand it back alongside its own result: a reference
/// borrowed across an `.await` point can't be threaded through a plain
/// `FnOnce` bound on stable Rust, since nothing ties `Fut`'s borrow to the
/// closure's lifetime. `Nursery::open`/`close` remain available directly
/// for callers that would rather hold the handle across multiple `.await`
/// points of their own.
pub async fn with_nursery<F, Fut>(body: F) -> Result<(), RunError>
where
    F: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = (Nursery, Result<(), RunError>)>,
{
    let nursery = Nursery::open();
    let (nursery, body_result) = body(nursery).await;
    nursery.close(body_result).await
}
