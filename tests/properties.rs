//! The quantified invariants this crate's scheduler is built to hold,
//! exercised directly against the public API (rather than just inferred
//! from scenario behavior).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nursery_runtime::{
    checkpoint, combine, current_token, wait_run_loop_idle, with_nursery, CancelScope, Deadline,
    Instrument, Nursery, Outcome, RunError, RunnerConfig, TaskId,
};

/// Tracks whether two `before_task_step` calls are ever observed without an
/// intervening `after_task_step` — the externally-observable shape of
/// invariant 1 (a task occupies exactly one state at a time) for a
/// single-threaded scheduler: no step ever nests inside another.
struct ExclusivityInstrument {
    currently_stepping: Option<TaskId>,
    violations: Arc<AtomicUsize>,
}

impl Instrument for ExclusivityInstrument {
    fn before_task_step(&mut self, task: TaskId) {
        if self.currently_stepping.is_some() {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.currently_stepping = Some(task);
    }

    fn after_task_step(&mut self, _task: TaskId) {
        self.currently_stepping = None;
    }
}

#[test]
fn p1_task_steps_never_interleave() {
    let violations = Arc::new(AtomicUsize::new(0));
    let instrument = ExclusivityInstrument {
        currently_stepping: None,
        violations: violations.clone(),
    };
    let config = RunnerConfig {
        instruments: vec![Box::new(instrument)],
        ..RunnerConfig::default()
    };
    let result: Result<(), RunError> = nursery_runtime::run_with_config(config, async {
        with_nursery(|mut n| async move {
            for _ in 0..5 {
                n.spawn(async {
                    checkpoint().await?;
                    checkpoint().await?;
                    Ok(())
                });
            }
            (n, Ok(()))
        })
        .await
    });
    assert!(result.is_ok());
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn p2_scope_with_no_bound_task_never_auto_cancels() {
    let result: Result<(), RunError> = nursery_runtime::run(async {
        let scope = CancelScope::new(Deadline::PAST);
        for _ in 0..5 {
            checkpoint().await?;
        }
        assert!(!scope.is_cancel_requested());
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn p3_nursery_children_drain_to_zero_before_close_waits() {
    let result: Result<(), RunError> = nursery_runtime::run(async {
        let mut n = Nursery::open();
        n.spawn(async { Ok::<_, RunError>(1) });
        n.spawn(async { Ok::<_, RunError>(2) });
        wait_run_loop_idle().await?;
        assert_eq!(n.live_children(), 0);
        n.close(Ok(())).await
    });
    assert!(result.is_ok());
}

#[test]
fn p4_cancellation_is_delivered_to_every_task_bound_to_the_scope() {
    // Each child increments this only if it runs to normal completion.
    // Cancellation already being requested before either child's first
    // checkpoint means both should be cut off before that point — if
    // delivery reached only one, the other would still bump the counter.
    let finished_normally = Arc::new(AtomicUsize::new(0));
    let result: Result<(), RunError> = {
        let finished_normally = finished_normally.clone();
        nursery_runtime::run(async move {
            let scope = CancelScope::new(Deadline::INFINITE);
            scope
                .run(async {
                    let mut n = Nursery::open();
                    let f1 = finished_normally.clone();
                    n.spawn(async move {
                        checkpoint().await?;
                        checkpoint().await?;
                        f1.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    let f2 = finished_normally.clone();
                    n.spawn(async move {
                        checkpoint().await?;
                        checkpoint().await?;
                        f2.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    scope.cancel();
                    n.close(Ok(())).await
                })
                .await?;
            assert!(scope.cancel_caught());
            Ok(())
        })
    };
    assert!(result.is_ok());
    assert_eq!(finished_normally.load(Ordering::SeqCst), 0);
}

#[test]
fn p5_a_newly_runnable_task_is_not_starved_by_a_busy_sibling() {
    let busy_steps = Arc::new(AtomicUsize::new(0));
    let result: Result<(), RunError> = nursery_runtime::run(async {
        with_nursery(|mut n| async move {
            let counter = busy_steps.clone();
            n.spawn(async move {
                for _ in 0..50 {
                    counter.fetch_add(1, Ordering::SeqCst);
                    checkpoint().await?;
                }
                Ok(())
            });
            let quiet = n.spawn(async {
                checkpoint().await?;
                Ok(())
            });
            quiet.join().await.unwrap().unwrap();
            (n, Ok(()))
        })
        .await
    });
    assert!(result.is_ok());
    assert!(
        busy_steps.load(Ordering::SeqCst) <= 3,
        "quiet task should finish within the next couple of batches, not after the busy task's whole run"
    );
}

#[test]
fn p6_panicking_instrument_is_evicted_and_stops_receiving_hooks() {
    struct PanicsOnSecondCall {
        calls: Arc<AtomicUsize>,
    }
    impl Instrument for PanicsOnSecondCall {
        fn before_task_step(&mut self, _task: TaskId) {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                panic!("synthetic instrument failure");
            }
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let instrument = PanicsOnSecondCall {
        calls: calls.clone(),
    };
    let config = RunnerConfig {
        instruments: vec![Box::new(instrument)],
        ..RunnerConfig::default()
    };
    let result: Result<(), RunError> = nursery_runtime::run_with_config(config, async {
        for _ in 0..10 {
            checkpoint().await?;
        }
        Ok(())
    });
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn p7_ordered_injected_jobs_each_run_exactly_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let result: Result<(), RunError> = nursery_runtime::run(async {
        let token = current_token();
        for _ in 0..20 {
            let counter = counter.clone();
            token
                .run_sync_soon(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        for _ in 0..5 {
            checkpoint().await?;
        }
        Ok(())
    });
    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

#[test]
fn p8_idempotent_posts_with_the_same_key_collapse_to_one_delivery() {
    let counter = Arc::new(AtomicUsize::new(0));
    let result: Result<(), RunError> = nursery_runtime::run(async {
        let token = current_token();
        for _ in 0..10 {
            let counter = counter.clone();
            token
                .run_sync_soon_idempotent(42, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        for _ in 0..5 {
            checkpoint().await?;
        }
        Ok(())
    });
    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn outcome_capture_roundtrips_with_a_plain_call() {
    let f = || -> Result<i32, RunError> { Ok(42) };
    assert_eq!(Outcome::capture(f).unwrap().unwrap(), 42);
}

#[test]
fn outcome_combine_never_loses_either_error_cause() {
    let a = Outcome::<()>::Error(RunError::Internal("a".into()));
    let b = Outcome::<i32>::Error(RunError::Internal("b".into()));
    match combine(a, b) {
        Outcome::Error(RunError::Aggregate(agg)) => assert_eq!(agg.causes().len(), 2),
        other => panic!("expected an aggregate of both causes, got {other:?}"),
    }
}
