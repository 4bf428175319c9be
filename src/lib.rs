//! A single-threaded, structured-concurrency scheduling core.
//!
//! This crate provides the primitives a cooperative scheduler is built
//! from:
//! - [`CancelScope`] — a node in the cancellation tree: deadlines,
//!   shields, explicit cancellation.
//! - [`Nursery`] — a block-scoped group of child tasks; no child
//!   outlives the block that spawned it.
//! - [`JoinHandle`] — a handle to a spawned task's eventual result.
//! - [`Outcome`]/[`AggregateError`] — the sum types that carry a task's
//!   result and collect concurrent failures without losing any of them.
//! - [`Token`] — a thread- and signal-safe way to post work onto the
//!   loop from outside it.
//!
//! # Design goals
//!
//! - Structured concurrency: a task cannot outlive the nursery that
//!   spawned it (or the cancel scope it's bound to).
//! - Single-threaded run loop: no work-stealing, no cross-thread task
//!   migration. All the concurrency is interleaving, not parallelism —
//!   parallel work is the caller's own business, reached through
//!   [`Token::run_sync_soon`] from another thread.
//! - Starvation-freedom: the run queue is shuffled per batch and the
//!   injection queue drains in snapshot-bounded batches, so no backlog
//!   of work can indefinitely starve another.
//! - Level-triggered cancellation: a cancelled scope keeps re-attempting
//!   delivery to every task bound to it until each either finishes or
//!   absorbs the cancellation, not just once at the moment of the call.
//!
//! # Entry point bridging
//!
//! [`run`] and [`run_with_config`] are the only ways to start a loop.
//! Everything else in this crate — spawning, scopes, checkpoints — only
//! makes sense while a loop is actively running on the calling thread;
//! calling them outside of `run()` panics.

mod clock;
mod error;
mod injection;
mod instrument;
mod ki;
mod nursery;
mod reactor;
mod runner;
mod scope;
mod task;
mod wakeup;

pub use clock::{Clock, Deadline, MockClock, MonotonicClock};
pub use error::{AggregateError, Cancelled, InjectionError, Outcome, RunError, combine};
pub use injection::Token;
pub use instrument::{Hook, Instrument, Instruments, TracingInstrument};
pub use ki::{ki_protected, KiProtectionGuard};
pub use nursery::{with_nursery, Nursery};
pub use reactor::{IoReactor, IoStatistics, NullReactor, PollReactor};
pub use runner::{current_statistics, current_token, run, run_with_config, wait_run_loop_idle, RunnerConfig};
pub use scope::{CancelScope, ScopeId};
pub use task::{checkpoint, checkpoint_no_cancel, Abort, AbortFn, AbortSignal, JoinHandle, TaskId, TaskState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_the_main_body_result() {
        let result: Result<i32, RunError> = run(async { Ok(7) });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn run_propagates_a_main_body_error() {
        let result: Result<(), RunError> = run(async { Err(RunError::Internal("boom".into())) });
        assert!(matches!(result, Err(RunError::Internal(_))));
    }
}
