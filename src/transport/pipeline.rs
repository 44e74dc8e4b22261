//! The per-connection handler chain.
//!
//! A [Pipeline] owns an ordered sequence of [ChannelHandler]s. Inbound
//! bytes run through the handlers in installation order; outbound writes
//! run in reverse. The underlying byte transport is injected as a
//! [ChannelSink]; application-level events leave the chain as work items
//! through a [Broadcaster], never as synchronous calls into application
//! code.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::dispatch::Broadcaster;
use crate::fatal::FatalSignal;

use super::auth::AuthError;
use super::state::{ChannelSharedState, PeerIdentity};

/// A connection-scoped error. Closes this one connection; other channels
/// and the pool are unaffected. The `Fatal` variant is the exception and is
/// routed to the process fault boundary instead.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode handshake frame: {0}")]
    Codec(#[from] serde_bencode::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("no mutually supported protocol version: local {local:?}, proposed {proposed:?}")]
    NegotiationFailed {
        local: Box<[u8]>,
        proposed: Box<[u8]>,
    },

    #[error("handshake deadline exceeded")]
    HandshakeTimeout,

    #[error("handshake violation: {0}")]
    HandshakeViolation(&'static str),

    #[error(transparent)]
    Fatal(#[from] FatalSignal),
}

/// Events a channel hands to the rest of the node, delivered through the
/// channel's [Broadcaster] on the shared pool.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The peer proved its identity; emitted before any payload is
    /// released.
    AuthenticationCompleted(PeerIdentity),
    /// A decoded application payload.
    MessageReceived(Bytes),
    /// The connection closed (handshake failure, peer close, or teardown).
    Closed,
}

/// The write/close capability of one connection, supplied by the owning
/// transport layer. The pipeline never creates or owns the underlying
/// transport resource.
pub trait ChannelSink: Send {
    fn send(&mut self, data: Bytes) -> std::io::Result<()>;
    fn close(&mut self);
}

/// A sink that discards everything. Placeholder for docs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ChannelSink for NullSink {
    fn send(&mut self, _data: Bytes) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// One stage of the handler chain.
///
/// Handlers run on the transport's pump thread; anything blocking must be
/// offloaded to an executor (see the authentication handler). Default
/// implementations pass data through unchanged.
pub trait ChannelHandler: Send {
    /// Called once, in installation order, before any data flows.
    fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), ChannelError> {
        let _ = ctx;
        Ok(())
    }

    /// Inbound bytes from the previous stage (or the wire, for the first
    /// handler).
    fn data_received(&mut self, ctx: &mut HandlerContext<'_>, data: Bytes)
        -> Result<(), ChannelError>;

    /// Outbound data from the next stage (or the application, for the last
    /// handler).
    fn write(&mut self, ctx: &mut HandlerContext<'_>, data: Bytes) -> Result<(), ChannelError> {
        ctx.forward_outbound(data);
        Ok(())
    }

    /// Periodic pump; deadlines and deferred completions are checked here.
    fn tick(&mut self, ctx: &mut HandlerContext<'_>, now: Instant) -> Result<(), ChannelError> {
        let _ = (ctx, now);
        Ok(())
    }

    fn channel_closed(&mut self) {}
}

/// What a handler can do during one callback.
pub struct HandlerContext<'a> {
    core: &'a mut PipelineCore,
    forwarded: Vec<Bytes>,
    outbound: Vec<Bytes>,
}

impl HandlerContext<'_> {
    pub fn state(&self) -> &ChannelSharedState {
        &self.core.state
    }

    /// Passes data inbound, to the next handler in the chain (or out of
    /// the chain as [ChannelEvent::MessageReceived] after the last one).
    pub fn forward(&mut self, data: Bytes) {
        self.forwarded.push(data);
    }

    /// Passes data outbound, toward the sink through the preceding
    /// handlers. Only meaningful inside [ChannelHandler::write].
    pub fn forward_outbound(&mut self, data: Bytes) {
        self.outbound.push(data);
    }

    /// Writes bytes directly to the sink, bypassing preceding handlers.
    /// Used for handshake frames a handler authors itself.
    pub fn send(&mut self, data: Bytes) -> Result<(), ChannelError> {
        self.core.sink.send(data)?;
        Ok(())
    }

    /// Emits an application-level event as a work item.
    pub fn emit(&mut self, event: ChannelEvent) {
        self.core.events.notify_listeners(event);
    }

    /// Closes the connection. Data still in flight through the chain is
    /// dropped.
    pub fn close(&mut self) {
        self.core.close();
    }
}

struct PipelineCore {
    state: Arc<ChannelSharedState>,
    sink: Box<dyn ChannelSink>,
    events: Broadcaster<ChannelEvent>,
    closed: bool,
}

impl PipelineCore {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sink.close();
            self.events.notify_listeners(ChannelEvent::Closed);
        }
    }
}

/// The ordered handler chain of one connection.
pub struct Pipeline {
    handlers: Vec<Box<dyn ChannelHandler>>,
    core: PipelineCore,
    handlers_notified: bool,
}

impl Pipeline {
    pub(crate) fn new(
        state: Arc<ChannelSharedState>,
        sink: Box<dyn ChannelSink>,
        events: Broadcaster<ChannelEvent>,
    ) -> Self {
        Self {
            handlers: Vec::new(),
            core: PipelineCore {
                state,
                sink,
                events,
                closed: false,
            },
            handlers_notified: false,
        }
    }

    /// Appends a handler. Installation order is processing order for
    /// inbound data; it must be fixed before [Pipeline::activate].
    pub(crate) fn install(&mut self, handler: Box<dyn ChannelHandler>) {
        self.handlers.push(handler);
    }

    pub(crate) fn activate(&mut self) -> Result<(), ChannelError> {
        for i in 0..self.handlers.len() {
            let mut ctx = HandlerContext {
                core: &mut self.core,
                forwarded: Vec::new(),
                outbound: Vec::new(),
            };

            self.handlers[i].channel_active(&mut ctx)?;
        }

        Ok(())
    }

    /// Runs inbound bytes through the chain, starting at the first
    /// handler.
    pub(crate) fn bytes_received(&mut self, data: Bytes) -> Result<(), ChannelError> {
        if self.core.closed {
            return Ok(());
        }

        self.dispatch_inbound_from(0, vec![data])
    }

    /// Gives every handler a chance to check deadlines and drain deferred
    /// completions; data a handler releases from `tick` continues down the
    /// chain.
    pub(crate) fn tick(&mut self, now: Instant) -> Result<(), ChannelError> {
        if self.core.closed {
            return Ok(());
        }

        for i in 0..self.handlers.len() {
            let mut ctx = HandlerContext {
                core: &mut self.core,
                forwarded: Vec::new(),
                outbound: Vec::new(),
            };

            self.handlers[i].tick(&mut ctx, now)?;

            let released = ctx.forwarded;
            self.dispatch_inbound_from(i + 1, released)?;

            if self.core.closed {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Sends an application payload outward through the chain in reverse
    /// order (each handler may encode it).
    pub(crate) fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if self.core.closed {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel is closed",
            )));
        }

        let mut outbound = vec![payload];

        for i in (0..self.handlers.len()).rev() {
            let mut next = Vec::new();

            for chunk in outbound {
                let mut ctx = HandlerContext {
                    core: &mut self.core,
                    forwarded: Vec::new(),
                    outbound: Vec::new(),
                };

                self.handlers[i].write(&mut ctx, chunk)?;
                next.append(&mut ctx.outbound);
            }

            outbound = next;
        }

        for chunk in outbound {
            self.core.sink.send(chunk)?;
        }

        Ok(())
    }

    /// Closes the sink, emits [ChannelEvent::Closed] and notifies the
    /// handlers. Idempotent.
    pub(crate) fn close(&mut self) {
        self.core.close();

        if !self.handlers_notified {
            self.handlers_notified = true;

            for handler in &mut self.handlers {
                handler.channel_closed();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.core.closed
    }

    fn dispatch_inbound_from(
        &mut self,
        start: usize,
        chunks: Vec<Bytes>,
    ) -> Result<(), ChannelError> {
        let mut inbound = chunks;

        for i in start..self.handlers.len() {
            if inbound.is_empty() {
                return Ok(());
            }

            let mut next = Vec::new();

            for chunk in inbound {
                if self.core.closed {
                    return Ok(());
                }

                let mut ctx = HandlerContext {
                    core: &mut self.core,
                    forwarded: Vec::new(),
                    outbound: Vec::new(),
                };

                self.handlers[i].data_received(&mut ctx, chunk)?;
                next.append(&mut ctx.forwarded);
            }

            inbound = next;
        }

        // Whatever cleared the whole chain is an application message.
        for payload in inbound {
            self.core
                .events
                .notify_listeners(ChannelEvent::MessageReceived(payload));
        }

        Ok(())
    }
}
