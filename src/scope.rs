//! The cancellation-scope tree: deadlines, shields, and delivery.
//!
//! A [`CancelScope`] is a node in the cancellation tree. Its arena record
//! ([`ScopeRecord`]) lives in the runner's scope table; the public guard
//! type borrows nothing from it directly and instead reaches the arena
//! through the runner's thread-local handle, so scope guards can be moved
//! freely between `async` blocks the way the source tree's own
//! `with_scope`-style helpers are moved.

use std::future::Future;

use rustc_hash::FxHashMap;

use crate::clock::Deadline;
use crate::error::{Cancelled, RunError};
use crate::task::TaskId;

/// Unique identifier for a cancel scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ScopeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scope({})", self.0)
    }
}

/// Arena-resident state for one cancel scope. Owned by the runner; never
/// exposed directly — [`CancelScope`] is the public handle.
pub(crate) struct ScopeRecord {
    pub(crate) deadline: Deadline,
    pub(crate) shield: bool,
    pub(crate) cancel_requested: bool,
    pub(crate) cancel_caught: bool,
    pub(crate) tasks: Vec<TaskId>,
    /// Cached cancellation cause per bound task, so repeated delivery
    /// attempts against the same task see a stable cause (§4.3 step 4).
    pub(crate) causes: FxHashMap<TaskId, Cancelled>,
}

impl ScopeRecord {
    pub(crate) fn new(deadline: Deadline) -> Self {
        ScopeRecord {
            deadline,
            shield: false,
            cancel_requested: false,
            cancel_caught: false,
            tasks: Vec::new(),
            causes: FxHashMap::default(),
        }
    }

    /// The deadline index entry this scope should own: finite only while
    /// it has at least one bound task and isn't already cancel-requested
    /// (§4.3's deadline-index invariant).
    pub(crate) fn effective_deadline(&self) -> Deadline {
        if !self.cancel_requested && !self.tasks.is_empty() && self.deadline.registers_in_deadline_index() {
            self.deadline
        } else {
            Deadline::INFINITE
        }
    }
}

/// A node in the cancellation tree: a deadline, a shield flag, and the set
/// of tasks currently bound to it. Create with [`CancelScope::new`], then
/// drive a body future through it with [`CancelScope::run`].
pub struct CancelScope {
    pub(crate) id: ScopeId,
}

impl CancelScope {
    /// Allocate a new scope with the given deadline. The scope isn't
    /// registered in the deadline index until a task is bound to it via
    /// [`CancelScope::run`] (an empty scope has no effective deadline).
    pub fn new(deadline: Deadline) -> Self {
        let id = crate::runner::with_runner(|r| r.alloc_scope(ScopeRecord::new(deadline)));
        CancelScope { id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Mark the scope cancel-requested and attempt delivery to every task
    /// currently bound to it.
    pub fn cancel(&self) {
        crate::runner::with_runner(|r| r.cancel_scope(self.id));
    }

    pub fn is_cancel_requested(&self) -> bool {
        crate::runner::with_runner(|r| {
            r.scopes
                .get(&self.id)
                .map(|s| s.cancel_requested)
                .unwrap_or(false)
        })
    }

    pub fn cancel_caught(&self) -> bool {
        crate::runner::with_runner(|r| {
            r.scopes
                .get(&self.id)
                .map(|s| s.cancel_caught)
                .unwrap_or(false)
        })
    }

    /// Hide outer cancellations from tasks bound to this scope. Clearing
    /// the shield re-attempts delivery on every bound task immediately,
    /// since an outer cancellation may now land (§4.3).
    pub fn set_shield(&self, shield: bool) {
        crate::runner::with_runner(|r| r.set_shield(self.id, shield));
    }

    pub fn deadline(&self) -> Deadline {
        crate::runner::with_runner(|r| {
            r.scopes
                .get(&self.id)
                .map(|s| s.deadline)
                .unwrap_or(Deadline::INFINITE)
        })
    }

    /// Run `body` bound to this scope: the current task is pushed onto
    /// the scope's task set and onto its own cancel-scope stack for the
    /// duration, and the scope-exit filter (§4.3) runs on the way out,
    /// absorbing a cancellation whose origin is this scope.
    ///
    /// `body` carries no return value, matching the source's `with
    /// open_cancel_scope():` block — a body that completed normally
    /// despite an absorbed cancellation simply returns `Ok(())`; callers
    /// that need data out of the block capture it into a local instead of
    /// threading it through the return type (the scope may legitimately
    /// never reach the body's own final expression). Takes `&self`, not
    /// `self`, since callers need to inspect `cancel_caught()` after the
    /// block exits — the scope's only state is an arena id, so there is
    /// nothing ownership-sensitive to give up by borrowing instead.
    pub async fn run<F>(&self, body: F) -> Result<(), RunError>
    where
        F: Future<Output = Result<(), RunError>>,
    {
        let task = crate::task::current_task();
        crate::runner::with_runner(|r| r.enter_scope(task, self.id));
        let result = body.await;
        crate::runner::with_runner(|r| r.exit_scope(task, self.id));
        filter_result(self.id, result)
    }
}

/// Scope-exit filter: absorb a cancellation cause whose origin is exactly
/// this scope; anything else (including an aggregate with this scope's
/// cause as one of several members) propagates, with the matching cause
/// stripped out of any aggregate so it doesn't escape a second time.
pub(crate) fn filter_result(scope: ScopeId, result: Result<(), RunError>) -> Result<(), RunError> {
    match result {
        Ok(v) => Ok(v),
        Err(RunError::Cancelled(c)) if c.scope == scope => {
            crate::runner::with_runner(|r| {
                if let Some(rec) = r.scopes.get_mut(&scope) {
                    rec.cancel_caught = true;
                }
            });
            Ok(())
        }
        Err(RunError::Aggregate(agg)) => {
            let causes = agg.into_causes();
            let mut remaining = Vec::with_capacity(causes.len());
            let mut caught = false;
            for cause in causes {
                if cause.cancelled_by(scope) {
                    caught = true;
                } else {
                    remaining.push(cause);
                }
            }
            if caught {
                crate::runner::with_runner(|r| {
                    if let Some(rec) = r.scopes.get_mut(&scope) {
                        rec.cancel_caught = true;
                    }
                });
            }
            match crate::error::AggregateError::collect(remaining) {
                None => Ok(()),
                Some(e) => Err(e),
            }
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_deadline_is_infinite_when_no_tasks_bound() {
        let rec = ScopeRecord::new(Deadline::seconds(5.0));
        assert_eq!(rec.effective_deadline(), Deadline::INFINITE);
    }

    #[test]
    fn effective_deadline_is_infinite_once_cancel_requested() {
        let mut rec = ScopeRecord::new(Deadline::seconds(5.0));
        rec.tasks.push(TaskId::new());
        assert_eq!(rec.effective_deadline(), Deadline::seconds(5.0));
        rec.cancel_requested = true;
        assert_eq!(rec.effective_deadline(), Deadline::INFINITE);
    }
}
