//! Per-worker FIFO queues multiplexed over the shared pool.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::fatal::FatalSignal;

use super::pool::{Executor, WorkPool};

/// The neutral ordering hint. Scheduling is strictly FIFO per queue; the
/// hint is recorded on submission as a latent extension point for relative
/// scheduling weight and does not reorder items today.
pub const NEUTRAL_HINT: i32 = 0;

/// An error escaping a worker's processing function.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// Contained at the queue: logged, the worker keeps running.
    #[error("recoverable worker error: {0}")]
    Recoverable(#[source] Box<dyn StdError + Send + Sync>),

    /// Routed to the pool's fault boundary, never swallowed.
    #[error(transparent)]
    Fatal(#[from] FatalSignal),
}

impl WorkError {
    pub fn recoverable(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Recoverable(error.into())
    }
}

/// A logical actor processing typed work items one at a time.
///
/// [Worker::process] runs on a pool thread, never on the submitting thread.
/// It may mutate state the worker owns, submit further work items
/// (including to its own queue), or raise a fatal signal.
pub trait Worker: Send + Sync + 'static {
    type Item: Send + 'static;

    fn process(&self, item: Self::Item) -> Result<(), WorkError>;
}

/// A FIFO work queue bound to one [Worker], multiplexed over a [WorkPool].
///
/// Guarantees, regardless of pool thread count:
/// - every submitted item is processed by exactly one call to
///   [Worker::process], exactly once;
/// - items submitted to the same queue are processed in submission order;
/// - no ordering exists across different queues.
///
/// [WorkQueue::submit] never blocks and never runs worker code
/// synchronously.
pub struct WorkQueue<W: Worker> {
    shared: Arc<QueueShared<W>>,
}

impl<W: Worker> Clone for WorkQueue<W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct QueueShared<W: Worker> {
    state: Mutex<QueueState<W::Item>>,
    worker: W,
    pool: WorkPool,
}

struct QueueState<T> {
    items: VecDeque<(T, i32)>,
    /// True while a turn is queued or running on the pool. At most one turn
    /// is ever active per queue; that is what serializes the worker.
    scheduled: bool,
}

impl<W: Worker> WorkQueue<W> {
    pub fn new(pool: &WorkPool, worker: W) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    scheduled: false,
                }),
                worker,
                pool: pool.clone(),
            }),
        }
    }

    /// Enqueues an item for this queue's worker and returns immediately.
    pub fn submit(&self, item: W::Item, hint: i32) {
        let schedule = {
            let mut state = self.shared.lock_state();

            state.items.push_back((item, hint));

            if state.scheduled {
                false
            } else {
                state.scheduled = true;
                true
            }
        };

        if schedule {
            QueueShared::schedule_turn(&self.shared);
        }
    }

    /// Number of items waiting to be processed (excluding one currently in
    /// the worker's hands).
    pub fn pending(&self) -> usize {
        self.shared.lock_state().items.len()
    }

    pub(crate) fn worker(&self) -> &W {
        &self.shared.worker
    }
}

impl<W: Worker> QueueShared<W> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState<W::Item>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn schedule_turn(shared: &Arc<Self>) {
        let clone = shared.clone();

        shared
            .pool
            .execute(Box::new(move || Self::run_turn(&clone)));
    }

    /// One execution turn: processes up to the pool's turn budget, then
    /// either clears the scheduled flag (queue empty) or reschedules.
    fn run_turn(shared: &Arc<Self>) {
        for _ in 0..shared.pool.turn_budget() {
            let item = {
                let mut state = shared.lock_state();

                match state.items.pop_front() {
                    Some((item, _hint)) => item,
                    None => {
                        // Checked under the same lock `submit` pushes
                        // under, so a racing submission either sees
                        // `scheduled == true` or schedules a fresh turn.
                        state.scheduled = false;
                        return;
                    }
                }
            };

            match shared.worker.process(item) {
                Ok(()) => {}
                Err(WorkError::Recoverable(error)) => {
                    warn!(%error, "Worker failed on one item, continuing");
                }
                Err(WorkError::Fatal(signal)) => {
                    shared.pool.route_fatal(signal);
                    break;
                }
            }
        }

        // Budget exhausted (or a fatal signal ended the turn early): yield
        // the pool thread, keep the queue schedulable.
        let reschedule = {
            let mut state = shared.lock_state();

            if state.items.is_empty() {
                state.scheduled = false;
                false
            } else {
                true
            }
        };

        if reschedule {
            Self::schedule_turn(shared);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::pool::PoolConfig;
    use crate::fatal::FaultSink;

    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        executions: AtomicUsize,
    }

    impl Worker for Arc<Recorder> {
        type Item = u64;

        fn process(&self, item: u64) -> Result<(), WorkError> {
            self.executions.fetch_add(1, Ordering::Relaxed);
            self.seen.lock().unwrap().push(item);
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) {
        let end = Instant::now() + deadline;
        while !condition() {
            assert!(Instant::now() < end, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fifo_exactly_once() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(4)).unwrap();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
        });

        let queue = WorkQueue::new(&pool, recorder.clone());

        for i in 0..1000u64 {
            queue.submit(i, NEUTRAL_HINT);
        }

        wait_until(Duration::from_secs(5), || {
            recorder.executions.load(Ordering::Relaxed) == 1000
        });

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(*seen, (0..1000).collect::<Vec<_>>(), "items out of order");

        pool.shutdown();
    }

    #[test]
    fn queues_are_independent_but_internally_ordered() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(4)).unwrap();

        let recorders: Vec<_> = (0..8)
            .map(|_| {
                Arc::new(Recorder {
                    seen: Mutex::new(Vec::new()),
                    executions: AtomicUsize::new(0),
                })
            })
            .collect();

        let queues: Vec<_> = recorders
            .iter()
            .map(|r| WorkQueue::new(&pool, r.clone()))
            .collect();

        for i in 0..200u64 {
            for queue in &queues {
                queue.submit(i, NEUTRAL_HINT);
            }
        }

        wait_until(Duration::from_secs(5), || {
            recorders
                .iter()
                .all(|r| r.executions.load(Ordering::Relaxed) == 200)
        });

        for recorder in &recorders {
            assert_eq!(*recorder.seen.lock().unwrap(), (0..200).collect::<Vec<_>>());
        }

        pool.shutdown();
    }

    #[test]
    fn shutdown_waits_for_items_beyond_one_turn() {
        // One thread and a tiny turn budget force the queue to reschedule
        // continuation turns behind the shutdown call.
        let pool = WorkPool::start(
            PoolConfig::default()
                .with_threads(1)
                .with_turn_budget(2),
        )
        .unwrap();

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
        });
        let queue = WorkQueue::new(&pool, recorder.clone());

        for i in 0..10u64 {
            queue.submit(i, NEUTRAL_HINT);
        }

        pool.shutdown();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            (0..10).collect::<Vec<_>>(),
            "every item submitted before shutdown must be processed"
        );
    }

    #[test]
    fn recoverable_error_does_not_stop_the_worker() {
        struct Flaky {
            processed: Mutex<Vec<u64>>,
        }

        impl Worker for Arc<Flaky> {
            type Item = u64;

            fn process(&self, item: u64) -> Result<(), WorkError> {
                if item == 1 {
                    return Err(WorkError::recoverable(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad message",
                    )));
                }

                self.processed.lock().unwrap().push(item);
                Ok(())
            }
        }

        let pool = WorkPool::start(PoolConfig::default().with_threads(2)).unwrap();
        let flaky = Arc::new(Flaky {
            processed: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::new(&pool, flaky.clone());

        for i in 0..4u64 {
            queue.submit(i, NEUTRAL_HINT);
        }

        wait_until(Duration::from_secs(5), || {
            flaky.processed.lock().unwrap().len() == 3
        });

        assert_eq!(*flaky.processed.lock().unwrap(), vec![0, 2, 3]);

        pool.shutdown();
    }

    #[test]
    fn fatal_signal_reaches_the_boundary_and_queue_survives() {
        struct Panicky {
            processed: Mutex<Vec<u64>>,
        }

        impl Worker for Arc<Panicky> {
            type Item = u64;

            fn process(&self, item: u64) -> Result<(), WorkError> {
                if item == 1 {
                    return Err(FatalSignal::full(
                        "invariant broken",
                        io::Error::new(io::ErrorKind::Other, "underlying"),
                        false,
                        false,
                    )
                    .into());
                }

                self.processed.lock().unwrap().push(item);
                Ok(())
            }
        }

        let (sink, faults) = FaultSink::new();
        let pool = WorkPool::start(
            PoolConfig::default()
                .with_threads(2)
                .with_fault_boundary(Arc::new(sink)),
        )
        .unwrap();

        let panicky = Arc::new(Panicky {
            processed: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::new(&pool, panicky.clone());

        for i in 0..4u64 {
            queue.submit(i, NEUTRAL_HINT);
        }

        // The signal is observed unmodified at the boundary.
        let signal = faults.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(signal.message(), Some("invariant broken"));
        assert_eq!(signal.cause().unwrap().to_string(), "underlying");

        // The queue keeps draining after routing the signal.
        wait_until(Duration::from_secs(5), || {
            panicky.processed.lock().unwrap().len() == 3
        });
        assert_eq!(*panicky.processed.lock().unwrap(), vec![0, 2, 3]);

        pool.shutdown();
    }

    #[test]
    fn workers_can_submit_to_other_queues() {
        struct Forwarder {
            downstream: WorkQueue<Arc<Recorder>>,
        }

        impl Worker for Forwarder {
            type Item = u64;

            fn process(&self, item: u64) -> Result<(), WorkError> {
                self.downstream.submit(item * 2, NEUTRAL_HINT);
                Ok(())
            }
        }

        let pool = WorkPool::start(PoolConfig::default().with_threads(2)).unwrap();

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
        });
        let downstream = WorkQueue::new(&pool, recorder.clone());
        let upstream = WorkQueue::new(&pool, Forwarder {
            downstream: downstream.clone(),
        });

        for i in 0..100u64 {
            upstream.submit(i, NEUTRAL_HINT);
        }

        wait_until(Duration::from_secs(5), || {
            recorder.executions.load(Ordering::Relaxed) == 100
        });

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            (0..100).map(|i| i * 2).collect::<Vec<_>>()
        );

        pool.shutdown();
    }
}
