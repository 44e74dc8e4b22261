//! Work-dispatch framework: many logical worker queues, few OS threads.
//!
//! Every inter-node operation becomes a work item submitted to a
//! [WorkQueue]; submission is decoupled from execution, which always
//! happens on a thread of the shared [WorkPool]. The [Broadcaster] fans one
//! notification out to an ordered set of listeners using the same
//! machinery.

mod broadcaster;
mod pool;
mod queue;

pub use broadcaster::{Broadcaster, Listener, ListenerKey};
pub use pool::{Executor, PoolConfig, WorkPool, DEFAULT_TURN_BUDGET};
pub use queue::{WorkError, WorkQueue, Worker, NEUTRAL_HINT};
