//! Fan-out notifications built on the work queue framework.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::pool::WorkPool;
use super::queue::{WorkError, WorkQueue, Worker, NEUTRAL_HINT};

/// A broadcaster subscriber.
///
/// A recoverable error from [Listener::notification] is logged and skipped;
/// it does not abort delivery to the remaining listeners. A fatal error
/// aborts the delivery turn and is routed to the pool's fault boundary.
pub trait Listener<T>: Send + Sync {
    fn notification(&self, message: &T) -> Result<(), WorkError>;
}

/// Ordering key of a registered listener. Delivery iterates listeners in
/// ascending key order; a listener appears at most once per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(pub u64);

type Registry<T> = RwLock<BTreeMap<ListenerKey, Arc<dyn Listener<T>>>>;

/// Delivers each submitted notification to every currently registered
/// listener, within the broadcaster's own execution turn.
///
/// Built on [WorkQueue]: [Broadcaster::notify_listeners] only enqueues, so
/// delivery is asynchronous to the caller and notifications on the same
/// broadcaster are serialized in submission order.
pub struct Broadcaster<T: Send + Sync + 'static> {
    queue: WorkQueue<FanOut<T>>,
}

impl<T: Send + Sync + 'static> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

struct FanOut<T> {
    listeners: Arc<Registry<T>>,
}

impl<T: Send + Sync + 'static> Worker for FanOut<T> {
    type Item = T;

    fn process(&self, message: T) -> Result<(), WorkError> {
        // Snapshot taken at the start of the turn: a listener registered
        // while delivery is running sees only subsequent notifications.
        let snapshot: Vec<(ListenerKey, Arc<dyn Listener<T>>)> = {
            let listeners = read(&self.listeners);
            listeners
                .iter()
                .map(|(key, listener)| (*key, listener.clone()))
                .collect()
        };

        for (key, listener) in snapshot {
            match listener.notification(&message) {
                Ok(()) => {}
                Err(WorkError::Recoverable(error)) => {
                    warn!(?key, %error, "Listener failed, skipping it for this notification");
                }
                Err(fatal @ WorkError::Fatal(_)) => return Err(fatal),
            }
        }

        Ok(())
    }
}

impl<T: Send + Sync + 'static> Broadcaster<T> {
    pub fn new(pool: &WorkPool) -> Self {
        Self {
            queue: WorkQueue::new(
                pool,
                FanOut {
                    listeners: Arc::new(RwLock::new(BTreeMap::new())),
                },
            ),
        }
    }

    /// Registers a listener under `key`. Idempotent: re-adding an
    /// already-present key is a no-op and returns `false`.
    pub fn add_listener(&self, key: ListenerKey, listener: Arc<dyn Listener<T>>) -> bool {
        let mut listeners = write(self.registry());

        if listeners.contains_key(&key) {
            return false;
        }

        listeners.insert(key, listener);
        true
    }

    /// Removes the listener registered under `key`, if any.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        write(self.registry()).remove(&key).is_some()
    }

    pub fn listener_count(&self) -> usize {
        read(self.registry()).len()
    }

    /// Submits `message` to this broadcaster's own work queue with the
    /// neutral hint. Does not call any listener directly.
    pub fn notify_listeners(&self, message: T) {
        self.queue.submit(message, NEUTRAL_HINT);
    }

    /// Notifications enqueued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    fn registry(&self) -> &Registry<T> {
        &self.queue.worker().listeners
    }
}

fn read<T>(registry: &Registry<T>) -> std::sync::RwLockReadGuard<'_, BTreeMap<ListenerKey, Arc<dyn Listener<T>>>> {
    match registry.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(registry: &Registry<T>) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ListenerKey, Arc<dyn Listener<T>>>> {
    match registry.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::pool::PoolConfig;

    use std::io;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Log {
        received: Mutex<Vec<u64>>,
    }

    impl Listener<u64> for Log {
        fn notification(&self, message: &u64) -> Result<(), WorkError> {
            self.received.lock().unwrap().push(*message);
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
    fn add_listener_is_idempotent() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(2)).unwrap();
        let broadcaster = Broadcaster::new(&pool);

        let log = Arc::new(Log {
            received: Mutex::new(Vec::new()),
        });

        assert!(broadcaster.add_listener(ListenerKey(7), log.clone()));
        assert!(!broadcaster.add_listener(ListenerKey(7), log.clone()));
        assert_eq!(broadcaster.listener_count(), 1);

        broadcaster.notify_listeners(42);

        wait_until(Duration::from_secs(5), || {
            !log.received.lock().unwrap().is_empty()
        });

        // Single delivery despite the double registration.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(*log.received.lock().unwrap(), vec![42]);

        pool.shutdown();
    }

    #[test]
    fn failing_listener_does_not_block_the_rest() {
        struct Broken;

        impl Listener<u64> for Broken {
            fn notification(&self, _message: &u64) -> Result<(), WorkError> {
                Err(WorkError::recoverable(io::Error::new(
                    io::ErrorKind::Other,
                    "listener bug",
                )))
            }
        }

        let pool = WorkPool::start(PoolConfig::default().with_threads(2)).unwrap();
        let broadcaster = Broadcaster::new(&pool);

        let first = Arc::new(Log {
            received: Mutex::new(Vec::new()),
        });
        let last = Arc::new(Log {
            received: Mutex::new(Vec::new()),
        });

        broadcaster.add_listener(ListenerKey(0), first.clone());
        broadcaster.add_listener(ListenerKey(1), Arc::new(Broken));
        broadcaster.add_listener(ListenerKey(2), last.clone());

        broadcaster.notify_listeners(1);

        wait_until(Duration::from_secs(5), || {
            !last.received.lock().unwrap().is_empty()
        });

        assert_eq!(*first.received.lock().unwrap(), vec![1]);
        assert_eq!(*last.received.lock().unwrap(), vec![1]);

        pool.shutdown();
    }

    #[test]
    fn notifications_are_delivered_in_submission_order() {
        let pool = WorkPool::start(PoolConfig::default().with_threads(4)).unwrap();
        let broadcaster = Broadcaster::new(&pool);

        let logs: Vec<_> = (0..4)
            .map(|i| {
                let log = Arc::new(Log {
                    received: Mutex::new(Vec::new()),
                });
                broadcaster.add_listener(ListenerKey(i), log.clone());
                log
            })
            .collect();

        for i in 0..500u64 {
            broadcaster.notify_listeners(i);
        }

        wait_until(Duration::from_secs(5), || {
            logs.iter().all(|log| log.received.lock().unwrap().len() == 500)
        });

        for log in &logs {
            assert_eq!(*log.received.lock().unwrap(), (0..500).collect::<Vec<_>>());
        }

        pool.shutdown();
    }
}
