//! The I/O reactor contract (§6) and the two trivial implementations the
//! core ships so `Runner::new` is usable without a caller-supplied one.
//!
//! Real socket/pipe/TLS readiness is explicitly out of scope for this
//! crate (§1): a caller that needs it supplies their own [`IoReactor`].
//! What lives here is only the contract plus a wakeup-channel-aware poll
//! loop, which is enough to make the injection queue and timers work.

use std::sync::Arc;
use std::time::Duration;

use crate::wakeup::WakeupChannel;

/// A snapshot of reactor-internal counters, surfaced through
/// `Runner::current_statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatistics {
    pub tasks_waiting_read: usize,
    pub tasks_waiting_write: usize,
    pub backend_poll_calls: u64,
}

/// The external collaborator the run loop treats as a black box (§1, §6):
/// wait for I/O for up to `timeout`, reschedule whatever tasks' interests
/// fired, and otherwise stay out of the core's way. The one thing every
/// implementation must do is return early when its wakeup handle fires —
/// that's how the injection queue (§4.5) and timers interrupt a blocked
/// wait.
pub trait IoReactor: Send {
    /// Block for up to `timeout`, or return early if the wakeup handle
    /// fires. Must reschedule any task whose registered I/O interest is
    /// now ready. This is the run loop's only blocking point (§4.1 step
    /// 2).
    fn handle_io(&mut self, timeout: Duration);

    fn statistics(&self) -> IoStatistics;

    /// Release kernel resources. Called once, at run end.
    fn close(&mut self) {}
}

/// The runner's default reactor: waits on a shared wakeup channel's
/// readable descriptor via `poll(2)` for up to the requested timeout,
/// registering no other descriptors. Sufficient to make the injection
/// queue and timers responsive; a caller with real sockets/pipes supplies
/// their own `IoReactor`.
///
/// Constructed with the *same* `WakeupChannel` the runner hands to its
/// `InjectionQueue`, so a `run_sync_soon` from another thread reliably
/// interrupts a blocked `handle_io`.
pub struct PollReactor {
    wakeup: Arc<WakeupChannel>,
    poll_calls: u64,
}

impl PollReactor {
    pub fn new(wakeup: Arc<WakeupChannel>) -> Self {
        PollReactor {
            wakeup,
            poll_calls: 0,
        }
    }

    #[cfg(unix)]
    fn wait(&mut self, timeout: Duration) {
        let mut pfd = libc::pollfd {
            fd: self.wakeup.readable_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: `pfd` is a valid single-element array on the stack.
        unsafe {
            libc::poll(&mut pfd as *mut _, 1, millis);
        }
        self.poll_calls += 1;
    }

    #[cfg(not(unix))]
    fn wait(&mut self, timeout: Duration) {
        std::thread::sleep(timeout);
        self.poll_calls += 1;
    }
}

impl IoReactor for PollReactor {
    fn handle_io(&mut self, timeout: Duration) {
        self.wait(timeout);
        // The reactor doesn't drain the channel itself — draining is the
        // injection queue's job, since the wakeup channel only tells us
        // "something happened", not what.
    }

    fn statistics(&self) -> IoStatistics {
        IoStatistics {
            tasks_waiting_read: 0,
            tasks_waiting_write: 0,
            backend_poll_calls: self.poll_calls,
        }
    }
}

/// A reactor that sleeps the full timeout with no wakeup-channel
/// awareness at all — for tests that never touch the injection queue and
/// want the simplest possible stand-in. Never returns early.
pub struct NullReactor {
    calls: u64,
}

impl NullReactor {
    pub fn new() -> Self {
        NullReactor { calls: 0 }
    }
}

impl Default for NullReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl IoReactor for NullReactor {
    fn handle_io(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
        self.calls += 1;
    }

    fn statistics(&self) -> IoStatistics {
        IoStatistics {
            tasks_waiting_read: 0,
            tasks_waiting_write: 0,
            backend_poll_calls: self.calls,
        }
    }
}
