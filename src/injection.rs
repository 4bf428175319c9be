//! Thread- and signal-safe entry point into the run loop (§4.5).
//!
//! A foreign thread, or a signal handler interrupting the main thread,
//! posts a plain closure through a [`Token`]. Two queues back it: an
//! ordered FIFO and a keyed idempotent one whose duplicate keys collapse
//! to a single delivery. Both are guarded by a single reentrant lock —
//! reentrant because a signal handler may interrupt a lock-holder on the
//! main thread and still needs to get in.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::error::InjectionError;
use crate::wakeup::WakeupChannel;

type Job = Box<dyn FnOnce() + Send>;

struct InjectionState {
    ordered: VecDeque<Job>,
    idempotent: IndexMap<u64, Job>,
    closed: bool,
}

/// The shared queue state. Held behind an `Arc` so [`Token`] clones can
/// cross thread boundaries freely.
pub struct InjectionQueue {
    state: ReentrantMutex<RefCell<InjectionState>>,
    wakeup: Arc<WakeupChannel>,
}

impl InjectionQueue {
    /// Build a queue backed by `wakeup`. The channel is shared with the
    /// runner's reactor (constructed first, since both need the same
    /// kernel object) rather than owned privately here.
    pub(crate) fn new(wakeup: Arc<WakeupChannel>) -> Arc<Self> {
        Arc::new(InjectionQueue {
            state: ReentrantMutex::new(RefCell::new(InjectionState {
                ordered: VecDeque::new(),
                idempotent: IndexMap::new(),
                closed: false,
            })),
            wakeup,
        })
    }

    pub(crate) fn wakeup_handle(&self) -> &WakeupChannel {
        &self.wakeup
    }

    fn enqueue(&self, job: Job, idempotent_key: Option<u64>) -> Result<(), InjectionError> {
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if state.closed {
                return Err(InjectionError::RunFinished);
            }
            match idempotent_key {
                Some(key) => {
                    state.idempotent.insert(key, job);
                }
                None => state.ordered.push_back(job),
            }
        }
        self.wakeup.wake();
        Ok(())
    }

    /// Run a bounded batch from each queue, bounded by each queue's length
    /// at the moment the batch is taken — newly posted items wait for the
    /// next pass, which is what keeps this starvation-free under a
    /// constant stream of incoming work. Returns the number of jobs run.
    pub(crate) fn drain_once(&self) -> usize {
        let (ordered_batch, idempotent_batch) = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            let n_ordered = state.ordered.len();
            let ordered_batch: Vec<Job> = state.ordered.drain(..n_ordered).collect();
            let idempotent_batch: Vec<Job> =
                state.idempotent.drain(..).map(|(_, job)| job).collect();
            (ordered_batch, idempotent_batch)
        };
        let n = ordered_batch.len() + idempotent_batch.len();
        for job in ordered_batch.into_iter().chain(idempotent_batch) {
            job();
        }
        n
    }

    pub(crate) fn is_empty(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.ordered.is_empty() && state.idempotent.is_empty()
    }

    /// Close the queue (further enqueues fail with `RunFinished`), then
    /// drain whatever is left once more — items that arrived in the
    /// narrow window between the last drain and the close taking effect.
    pub(crate) fn close_and_drain_remaining(&self) -> usize {
        {
            let guard = self.state.lock();
            guard.borrow_mut().closed = true;
        }
        self.drain_once()
    }
}

/// A cloneable handle foreign threads and signal handlers use to post work
/// onto the run loop. Obtained from [`crate::runner::current_token`] while
/// running on the loop thread, then handed off.
#[derive(Clone)]
pub struct Token {
    pub(crate) queue: Arc<InjectionQueue>,
}

impl Token {
    /// Post `job` to run once, in enqueue order, from the loop thread.
    /// Thread- and signal-safe. Fails with [`InjectionError::RunFinished`]
    /// once the run has closed the queue (invariant 7, §8).
    pub fn run_sync_soon(&self, job: impl FnOnce() + Send + 'static) -> Result<(), InjectionError> {
        self.queue.enqueue(Box::new(job), None)
    }

    /// Post `job` keyed by `key`; repeated calls with the same key before
    /// the next drain collapse to a single delivery (invariant 8, §8).
    pub fn run_sync_soon_idempotent(
        &self,
        key: u64,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), InjectionError> {
        self.queue.enqueue(Box::new(job), Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ordered_jobs_run_in_enqueue_order() {
        let queue = InjectionQueue::new(Arc::new(WakeupChannel::new().unwrap()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            queue.enqueue(Box::new(move || order.lock().unwrap().push(i)), None).unwrap();
        }
        queue.drain_once();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn idempotent_duplicate_keys_collapse() {
        let queue = InjectionQueue::new(Arc::new(WakeupChannel::new().unwrap()));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            queue
                .enqueue(Box::new(move || { count.fetch_add(1, Ordering::SeqCst); }), Some(42))
                .unwrap();
        }
        let ran = queue.drain_once();
        assert_eq!(ran, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_is_bounded_by_snapshot_length() {
        let queue = InjectionQueue::new(Arc::new(WakeupChannel::new().unwrap()));
        let queue2 = queue.clone();
        queue
            .enqueue(
                Box::new(move || {
                    // Posted from inside a running job: must wait for the
                    // *next* drain, not this one.
                    let _ = queue2.enqueue(Box::new(|| {}), None);
                }),
                None,
            )
            .unwrap();
        let first = queue.drain_once();
        assert_eq!(first, 1);
        assert!(!queue.is_empty());
        let second = queue.drain_once();
        assert_eq!(second, 1);
    }

    #[test]
    fn enqueue_after_close_fails() {
        let queue = InjectionQueue::new(Arc::new(WakeupChannel::new().unwrap()));
        queue.close_and_drain_remaining();
        let err = queue.enqueue(Box::new(|| {}), None).unwrap_err();
        assert!(matches!(err, InjectionError::RunFinished));
    }
}
