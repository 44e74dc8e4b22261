//! Secure channels: the per-connection handler chain and its factory.
//!
//! The owning transport layer accepts or initiates a connection, then calls
//! [Channel::secure] with the connection's write/close capability. That
//! creates the [ChannelSharedState], asks the factory for the two handlers
//! and installs them in the fixed order (authentication first, protocol
//! adaptation second) before any application data flows. The transport
//! layer then pumps the channel: [Channel::bytes_received] for inbound
//! bytes, [Channel::tick] periodically.

mod adaptive;
mod auth;
mod messages;
mod pipeline;
mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::dispatch::{Broadcaster, Executor, WorkPool};
use crate::fatal::FaultBoundary;

use adaptive::AdaptiveHandler;
use auth::KerberosHandler;

pub use auth::{
    AuthError, CredentialVerifier, KeyringVerifier, LocalCredential, DEFAULT_REPLAY_CACHE_SIZE,
};
pub use messages::Credential;
pub use pipeline::{
    ChannelError, ChannelEvent, ChannelHandler, ChannelSink, HandlerContext, NullSink,
};
pub use state::{ChannelRole, ChannelSharedState, PeerIdentity, ProtocolParams};

/// Default bound on the whole handshake (authentication and negotiation
/// each get this budget).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of an issued credential ticket.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(60);

/// Produces the two handlers every secure channel needs.
///
/// Called once per connection, immediately after the connection's
/// [ChannelSharedState] is created. The executor is a capability supplied
/// by the caller; the factory never creates or owns it.
pub trait ChannelHandlerFactory: Send + Sync {
    fn create_kerberos_handler(
        &self,
        server_side: bool,
        executor: Arc<dyn Executor>,
        shared_state: Arc<ChannelSharedState>,
    ) -> Box<dyn ChannelHandler>;

    fn create_adaptive_handler(&self, server_side: bool) -> Box<dyn ChannelHandler>;
}

/// The default factory: ed25519 credential tickets and version/feature
/// negotiation.
pub struct SecureChannelHandlerFactory {
    credential: Arc<LocalCredential>,
    verifier: Arc<dyn CredentialVerifier>,
    supported_versions: Box<[u8]>,
    supported_features: u32,
    handshake_timeout: Duration,
    ticket_ttl: Duration,
}

impl SecureChannelHandlerFactory {
    pub fn new(credential: LocalCredential) -> Self {
        Self {
            credential: Arc::new(credential),
            verifier: Arc::new(KeyringVerifier::new()),
            supported_versions: Box::new([1]),
            supported_features: 0,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ticket_ttl: DEFAULT_TICKET_TTL,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_supported_versions(mut self, versions: &[u8]) -> Self {
        self.supported_versions = versions.into();
        self
    }

    pub fn with_supported_features(mut self, features: u32) -> Self {
        self.supported_features = features;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ticket_ttl(mut self, ttl: Duration) -> Self {
        self.ticket_ttl = ttl;
        self
    }
}

impl ChannelHandlerFactory for SecureChannelHandlerFactory {
    fn create_kerberos_handler(
        &self,
        server_side: bool,
        executor: Arc<dyn Executor>,
        shared_state: Arc<ChannelSharedState>,
    ) -> Box<dyn ChannelHandler> {
        Box::new(KerberosHandler::new(
            ChannelRole::from_server_side(server_side),
            executor,
            shared_state,
            self.verifier.clone(),
            self.credential.clone(),
            self.ticket_ttl,
            self.handshake_timeout,
        ))
    }

    fn create_adaptive_handler(&self, server_side: bool) -> Box<dyn ChannelHandler> {
        Box::new(AdaptiveHandler::new(
            ChannelRole::from_server_side(server_side),
            &self.supported_versions,
            self.supported_features,
            self.handshake_timeout,
        ))
    }
}

/// One secured connection, as seen by the owning transport layer.
///
/// Recoverable errors (bad frames, failed handshakes, timeouts) close this
/// channel and nothing else; fatal signals are routed to the pool's fault
/// boundary.
pub struct Channel {
    pipeline: pipeline::Pipeline,
    state: Arc<ChannelSharedState>,
    events: Broadcaster<ChannelEvent>,
    fault_boundary: Arc<dyn FaultBoundary>,
}

impl Channel {
    /// Assembles a secure channel: shared state, then the factory's
    /// handlers in the fixed order (authentication strictly before
    /// adaptation), then activation. No application data can flow before
    /// this returns.
    pub fn secure(
        role: ChannelRole,
        sink: Box<dyn ChannelSink>,
        factory: &dyn ChannelHandlerFactory,
        executor: Arc<dyn Executor>,
        pool: &WorkPool,
    ) -> Result<Self, ChannelError> {
        let state = Arc::new(ChannelSharedState::new(role));
        let events = Broadcaster::new(pool);

        let mut pipeline = pipeline::Pipeline::new(state.clone(), sink, events.clone());

        pipeline.install(factory.create_kerberos_handler(
            role.is_server_side(),
            executor,
            state.clone(),
        ));
        pipeline.install(factory.create_adaptive_handler(role.is_server_side()));

        pipeline.activate()?;

        Ok(Self {
            pipeline,
            state,
            events,
            fault_boundary: pool.fault_boundary(),
        })
    }

    /// Feeds bytes read from the wire into the handler chain. A
    /// connection-scoped failure closes this channel silently (to other
    /// peers); a fatal signal is routed onward.
    pub fn bytes_received(&mut self, data: Bytes) {
        let result = self.pipeline.bytes_received(data);
        self.contain(result);
    }

    /// Drives deadlines and deferred completions. Call periodically.
    pub fn tick(&mut self, now: Instant) {
        let result = self.pipeline.tick(now);
        self.contain(result);
    }

    /// Sends an application payload through the chain (the adaptive
    /// handler frames it). Fails until the handshake completed.
    pub fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        self.pipeline.send(payload)
    }

    /// Closes the channel and notifies subscribers.
    pub fn close(&mut self) {
        self.pipeline.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pipeline.is_closed()
    }

    /// `true` once both authentication and negotiation completed.
    pub fn is_established(&self) -> bool {
        self.state.peer_identity().is_some() && self.state.protocol().is_some()
    }

    /// The channel's event fan-out; subscribe to observe authentication,
    /// messages and closure as work items.
    pub fn events(&self) -> &Broadcaster<ChannelEvent> {
        &self.events
    }

    pub fn shared_state(&self) -> &Arc<ChannelSharedState> {
        &self.state
    }

    fn contain(&mut self, result: Result<(), ChannelError>) {
        match result {
            Ok(()) => {}
            Err(ChannelError::Fatal(signal)) => {
                self.pipeline.close();
                self.fault_boundary.on_fatal(signal);
            }
            Err(error) => {
                debug!(%error, "Closing channel");
                self.pipeline.close();
            }
        }
    }
}
