//! Two secure channels handshaking against each other in memory.
//!
//! Run with `RUST_LOG=debug cargo run --example secure_channel` to watch
//! the credential exchange and version negotiation happen.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use meshline::dispatch::{ListenerKey, PoolConfig, WorkError, WorkPool};
use meshline::transport::{
    Channel, ChannelEvent, ChannelRole, ChannelSink, LocalCredential, SecureChannelHandlerFactory,
};
use meshline::Listener;

/// Captures bytes a channel writes so the demo loop can shuttle them to
/// the other side.
#[derive(Clone, Default)]
struct Wire {
    outbound: Arc<Mutex<Vec<Bytes>>>,
}

impl Wire {
    fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound.lock().unwrap())
    }
}

impl ChannelSink for Wire {
    fn send(&mut self, data: Bytes) -> std::io::Result<()> {
        self.outbound.lock().unwrap().push(data);
        Ok(())
    }

    fn close(&mut self) {}
}

struct Printer(&'static str);

impl Listener<ChannelEvent> for Printer {
    fn notification(&self, event: &ChannelEvent) -> Result<(), WorkError> {
        match event {
            ChannelEvent::AuthenticationCompleted(identity) => {
                println!("[{}] authenticated peer {:?}", self.0, identity.principal);
            }
            ChannelEvent::MessageReceived(payload) => {
                println!("[{}] received {:?}", self.0, payload);
            }
            ChannelEvent::Closed => println!("[{}] closed", self.0),
        }

        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let pool = WorkPool::start(PoolConfig::default()).expect("spawn pool threads");

    let server_factory = SecureChannelHandlerFactory::new(LocalCredential::generate("storage-node-a"))
        .with_supported_versions(&[1, 2]);
    let client_factory = SecureChannelHandlerFactory::new(LocalCredential::generate("storage-node-b"))
        .with_supported_versions(&[2, 3]);

    let server_wire = Wire::default();
    let client_wire = Wire::default();

    let mut server = Channel::secure(
        ChannelRole::Accepting,
        Box::new(server_wire.clone()),
        &server_factory,
        Arc::new(pool.clone()),
        &pool,
    )
    .expect("assemble accepting channel");

    let mut client = Channel::secure(
        ChannelRole::Initiating,
        Box::new(client_wire.clone()),
        &client_factory,
        Arc::new(pool.clone()),
        &pool,
    )
    .expect("assemble initiating channel");

    server.events().add_listener(ListenerKey(0), Arc::new(Printer("server")));
    client.events().add_listener(ListenerKey(0), Arc::new(Printer("client")));

    // Pump both sides until the handshake completes.
    while !(server.is_established() && client.is_established()) {
        for chunk in server_wire.drain() {
            client.bytes_received(chunk);
        }
        for chunk in client_wire.drain() {
            server.bytes_received(chunk);
        }

        let now = Instant::now();
        server.tick(now);
        client.tick(now);

        thread::sleep(Duration::from_millis(1));
    }

    let params = server
        .shared_state()
        .protocol()
        .expect("negotiated parameters");
    println!("negotiated protocol version {}", params.version);

    client
        .send(Bytes::from("hello over the secured channel"))
        .expect("send payload");

    for chunk in client_wire.drain() {
        server.bytes_received(chunk);
    }

    // Give the broadcaster a moment to deliver the events.
    thread::sleep(Duration::from_millis(100));

    pool.shutdown();
}
