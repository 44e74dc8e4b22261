//! Shared bounded thread pool executing worker turns.

use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::fatal::{FatalSignal, FaultBoundary, LogFaultBoundary};

/// Default number of items a queue may process in one turn before it has to
/// yield the pool thread back.
pub const DEFAULT_TURN_BUDGET: usize = 16;

const DEFAULT_THREAD_NAME: &str = "meshline-worker";

/// A submit-a-task capability.
///
/// Handed to handlers that need to run blocking work (a credential lookup)
/// off the connection's primary processing resource. The caller owns the
/// underlying resource; [WorkPool] implements this trait.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

enum PoolMessage {
    Run(Box<dyn FnOnce() + Send>),
    Terminate,
}

/// Work pool configuration.
pub struct PoolConfig {
    /// Number of OS threads servicing all worker queues.
    ///
    /// Defaults to [std::thread::available_parallelism], or 4 when that is
    /// unavailable.
    pub threads: NonZeroUsize,
    /// Name prefix for pool threads (suffixed with the thread index).
    pub thread_name: String,
    /// Where fatal signals raised inside workers are routed.
    ///
    /// Defaults to [LogFaultBoundary].
    pub fault_boundary: Arc<dyn FaultBoundary>,
    /// Items one queue may process per turn before rescheduling itself, so
    /// a busy queue cannot starve unrelated queues.
    ///
    /// Defaults to [DEFAULT_TURN_BUDGET].
    pub turn_budget: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism()
                .unwrap_or_else(|_| NonZeroUsize::new(4).expect("4 > 0")),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            fault_boundary: Arc::new(LogFaultBoundary),
            turn_budget: NonZeroUsize::new(DEFAULT_TURN_BUDGET).expect("16 > 0"),
        }
    }
}

impl PoolConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        if let Some(threads) = NonZeroUsize::new(threads) {
            self.threads = threads;
        }
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_fault_boundary(mut self, boundary: Arc<dyn FaultBoundary>) -> Self {
        self.fault_boundary = boundary;
        self
    }

    pub fn with_turn_budget(mut self, budget: usize) -> Self {
        if let Some(budget) = NonZeroUsize::new(budget) {
            self.turn_budget = budget;
        }
        self
    }
}

impl Debug for PoolConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("threads", &self.threads)
            .field("thread_name", &self.thread_name)
            .field("turn_budget", &self.turn_budget)
            .finish_non_exhaustive()
    }
}

/// The shared thread pool all worker queues run on.
///
/// The number of live queues is unbounded and decoupled from the number of
/// pool threads; the pool only executes turns handed to it. Lives for the
/// process lifetime; [WorkPool::shutdown] drains already-queued turns and
/// joins the threads.
#[derive(Clone)]
pub struct WorkPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    injector: flume::Sender<PoolMessage>,
    fault_boundary: Arc<dyn FaultBoundary>,
    turn_budget: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Tasks queued or running. `shutdown` waits for this to reach zero so
    /// a queue's rescheduled continuation turns are never lost.
    outstanding: Arc<AtomicUsize>,
}

impl WorkPool {
    /// Spawns the pool threads.
    pub fn start(config: PoolConfig) -> std::io::Result<Self> {
        let (injector, receiver) = flume::unbounded();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::with_capacity(config.threads.get());

        for index in 0..config.threads.get() {
            let receiver: flume::Receiver<PoolMessage> = receiver.clone();
            let outstanding = outstanding.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || {
                    for message in receiver.iter() {
                        match message {
                            PoolMessage::Run(turn) => {
                                turn();
                                outstanding.fetch_sub(1, Ordering::Release);
                            }
                            PoolMessage::Terminate => break,
                        }
                    }

                    debug!("Pool thread exiting");
                })?;

            threads.push(handle);
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                injector,
                fault_boundary: config.fault_boundary,
                turn_budget: config.turn_budget.get(),
                threads: Mutex::new(threads),
                outstanding,
            }),
        })
    }

    /// Waits for every already-submitted task to finish (including
    /// continuation turns a busy queue reschedules for itself), then stops
    /// and joins the pool threads. Turns submitted after the drain are
    /// dropped with a warning.
    pub fn shutdown(&self) {
        let handles = {
            let mut threads = match self.shared.threads.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            std::mem::take(&mut *threads)
        };

        // A queue holding more items than one turn budget reschedules
        // itself behind whatever is already in the injector, so Terminate
        // can only go out once nothing is queued or running anymore.
        while self.shared.outstanding.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        for _ in &handles {
            let _ = self.shared.injector.send(PoolMessage::Terminate);
        }

        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Routes a fatal signal to the pool's fault boundary. Never swallows.
    pub(crate) fn route_fatal(&self, signal: FatalSignal) {
        self.shared.fault_boundary.on_fatal(signal);
    }

    pub(crate) fn fault_boundary(&self) -> Arc<dyn FaultBoundary> {
        self.shared.fault_boundary.clone()
    }

    pub(crate) fn turn_budget(&self) -> usize {
        self.shared.turn_budget
    }
}

impl Executor for WorkPool {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.shared.outstanding.fetch_add(1, Ordering::Acquire);

        if self.shared.injector.send(PoolMessage::Run(task)).is_err() {
            self.shared.outstanding.fetch_sub(1, Ordering::Release);
            warn!("Task submitted to a work pool that is shut down, dropping it");
        }
    }
}

impl Debug for WorkPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPool")
            .field("turn_budget", &self.shared.turn_budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_tasks_on_pool_threads() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(2)).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let submitter = thread::current().id();

        for _ in 0..64 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                assert_ne!(thread::current().id(), submitter, "must not run on the submitting thread");
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < 64 {
            assert!(std::time::Instant::now() < deadline, "tasks did not finish");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(1)).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        pool.shutdown();

        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }
}
