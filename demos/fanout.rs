//! Fan-out of state-change notifications through a [Broadcaster].

use std::sync::Arc;
use std::time::Duration;

use meshline::dispatch::{Broadcaster, Listener, ListenerKey, PoolConfig, WorkError, WorkPool};

#[derive(Debug, Clone)]
enum RingEvent {
    NodeJoined(String),
    NodeLeft(String),
}

struct MembershipView(&'static str);

impl Listener<RingEvent> for MembershipView {
    fn notification(&self, event: &RingEvent) -> Result<(), WorkError> {
        match event {
            RingEvent::NodeJoined(node) => println!("[{}] {node} joined", self.0),
            RingEvent::NodeLeft(node) => println!("[{}] {node} left", self.0),
        }

        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let pool = WorkPool::start(PoolConfig::default()).expect("spawn pool threads");

    let broadcaster = Broadcaster::new(&pool);
    broadcaster.add_listener(ListenerKey(0), Arc::new(MembershipView("router")));
    broadcaster.add_listener(ListenerKey(1), Arc::new(MembershipView("replicator")));

    broadcaster.notify_listeners(RingEvent::NodeJoined("10.0.0.7:2546".to_string()));
    broadcaster.notify_listeners(RingEvent::NodeJoined("10.0.0.8:2546".to_string()));
    broadcaster.notify_listeners(RingEvent::NodeLeft("10.0.0.7:2546".to_string()));

    // Delivery happens as work items on the pool; wait for it to drain.
    while broadcaster.pending() > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    pool.shutdown();
}
