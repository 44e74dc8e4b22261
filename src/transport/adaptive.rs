//! The adaptive protocol handler: version/feature negotiation and
//! transparent payload framing.
//!
//! Second stage of the chain, strictly after authentication. The
//! initiating side proposes the versions and features it speaks; the
//! accepting side is authoritative for what it is willing to speak and
//! answers with the highest mutually supported version. With no overlap
//! the connection closes before any payload is processed.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_bytes::ByteBuf;
use tracing::debug;

use super::messages::{encode_frame, FrameBuffer, HandshakeMessage, Reject, VersionAccept, VersionProposal};
use super::pipeline::{ChannelError, ChannelHandler, HandlerContext};
use super::state::{ChannelRole, ProtocolParams};

enum NegotiationPhase {
    /// Authentication has not completed yet; no negotiation traffic is
    /// legal.
    AwaitingAuthentication,
    /// Initiating side: proposal sent, waiting for the accepted terms.
    /// Accepting side: waiting for the proposal.
    Negotiating,
    /// Parameters agreed; payloads flow.
    Ready,
}

/// The protocol-adaptation stage.
pub(crate) struct AdaptiveHandler {
    role: ChannelRole,
    /// Versions this end speaks, ascending.
    supported: Box<[u8]>,
    features: u32,
    timeout: Duration,
    deadline: Option<Instant>,
    phase: NegotiationPhase,
    frames: FrameBuffer,
}

impl AdaptiveHandler {
    pub(crate) fn new(role: ChannelRole, supported: &[u8], features: u32, timeout: Duration) -> Self {
        let mut supported: Box<[u8]> = supported.into();
        supported.sort_unstable();

        Self {
            role,
            supported,
            features,
            timeout,
            deadline: None,
            phase: NegotiationPhase::AwaitingAuthentication,
            frames: FrameBuffer::default(),
        }
    }

    /// Highest version present in both sets.
    fn select_version(&self, proposed: &[u8]) -> Option<u8> {
        self.supported
            .iter()
            .rev()
            .find(|version| proposed.contains(version))
            .copied()
    }

    fn negotiation_failed(
        &self,
        ctx: &mut HandlerContext<'_>,
        proposed: &[u8],
    ) -> ChannelError {
        let reject = HandshakeMessage::Reject(Reject {
            code: 1,
            message: "no mutually supported protocol version".to_string(),
        });

        // Best effort; the connection is closing either way.
        if let Ok(body) = reject.to_bytes() {
            if let Ok(frame) = encode_frame(&body) {
                let _ = ctx.send(frame);
            }
        }

        ChannelError::NegotiationFailed {
            local: self.supported.clone(),
            proposed: proposed.into(),
        }
    }

    fn handle_proposal(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        proposal: VersionProposal,
    ) -> Result<(), ChannelError> {
        if !self.role.is_server_side() {
            return Err(ChannelError::HandshakeViolation(
                "initiating side received a proposal",
            ));
        }

        let Some(version) = self.select_version(&proposal.versions) else {
            return Err(self.negotiation_failed(ctx, &proposal.versions));
        };

        let params = ProtocolParams {
            version,
            features: self.features & proposal.features,
        };

        ctx.state().set_protocol(params)?;

        let accept = HandshakeMessage::VersionAccept(VersionAccept {
            version: params.version,
            features: params.features,
        });
        ctx.send(encode_frame(&accept.to_bytes()?)?)?;

        debug!(version = params.version, features = params.features, "Protocol negotiated");
        self.phase = NegotiationPhase::Ready;

        Ok(())
    }

    fn handle_accept(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        accept: VersionAccept,
    ) -> Result<(), ChannelError> {
        if self.role.is_server_side() {
            return Err(ChannelError::HandshakeViolation(
                "accepting side received an accept",
            ));
        }

        if !self.supported.contains(&accept.version) {
            return Err(ChannelError::HandshakeViolation(
                "peer accepted a version we never proposed",
            ));
        }

        let params = ProtocolParams {
            version: accept.version,
            features: self.features & accept.features,
        };

        ctx.state().set_protocol(params)?;

        debug!(version = params.version, features = params.features, "Protocol negotiated");
        self.phase = NegotiationPhase::Ready;

        Ok(())
    }

    /// Releases every complete payload frame to the application.
    fn drain_payload_frames(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), ChannelError> {
        while let Some(frame) = self.frames.next_frame()? {
            ctx.forward(frame);
        }

        Ok(())
    }
}

impl ChannelHandler for AdaptiveHandler {
    fn data_received(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        data: Bytes,
    ) -> Result<(), ChannelError> {
        // The authentication handler gates inbound data, so anything
        // arriving here before the identity is set broke that invariant.
        if ctx.state().peer_identity().is_none() {
            return Err(ChannelError::HandshakeViolation(
                "payload reached the adaptive handler before authentication",
            ));
        }

        self.frames.extend(&data);

        loop {
            match self.phase {
                NegotiationPhase::AwaitingAuthentication => {
                    // Auth completed (identity is set) but our own tick has
                    // not run yet; negotiate from here.
                    self.deadline.get_or_insert(Instant::now() + self.timeout);
                    self.phase = NegotiationPhase::Negotiating;
                }
                NegotiationPhase::Negotiating => {
                    let Some(frame) = self.frames.next_frame()? else {
                        return Ok(());
                    };

                    match HandshakeMessage::from_bytes(&frame)? {
                        HandshakeMessage::VersionProposal(proposal) => {
                            self.handle_proposal(ctx, proposal)?
                        }
                        HandshakeMessage::VersionAccept(accept) => {
                            self.handle_accept(ctx, accept)?
                        }
                        HandshakeMessage::Reject(reject) => {
                            debug!(code = reject.code, message = %reject.message, "Peer rejected negotiation");

                            return Err(ChannelError::NegotiationFailed {
                                local: self.supported.clone(),
                                proposed: Vec::new().into_boxed_slice(),
                            });
                        }
                        HandshakeMessage::Credential(_) => {
                            return Err(ChannelError::HandshakeViolation(
                                "credential received during negotiation",
                            ));
                        }
                    }
                }
                NegotiationPhase::Ready => {
                    return self.drain_payload_frames(ctx);
                }
            }
        }
    }

    fn write(&mut self, ctx: &mut HandlerContext<'_>, data: Bytes) -> Result<(), ChannelError> {
        if !matches!(self.phase, NegotiationPhase::Ready) {
            return Err(ChannelError::HandshakeViolation(
                "application write before protocol negotiation completed",
            ));
        }

        ctx.forward_outbound(encode_frame(&data)?);
        Ok(())
    }

    fn tick(&mut self, ctx: &mut HandlerContext<'_>, now: Instant) -> Result<(), ChannelError> {
        match self.phase {
            NegotiationPhase::Ready => Ok(()),
            NegotiationPhase::AwaitingAuthentication => {
                // Wake up once the authentication handler has written the
                // identity.
                if ctx.state().peer_identity().is_none() {
                    return Ok(());
                }

                self.deadline = Some(now + self.timeout);
                self.phase = NegotiationPhase::Negotiating;

                // The initiating side proposes; the accepting side waits.
                if !self.role.is_server_side() {
                    let proposal = HandshakeMessage::VersionProposal(VersionProposal {
                        versions: ByteBuf::from(self.supported.to_vec()),
                        features: self.features,
                    });

                    ctx.send(encode_frame(&proposal.to_bytes()?)?)?;
                }

                Ok(())
            }
            NegotiationPhase::Negotiating => match self.deadline {
                Some(deadline) if now >= deadline => Err(ChannelError::HandshakeTimeout),
                _ => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handler(role: ChannelRole, supported: &[u8]) -> AdaptiveHandler {
        AdaptiveHandler::new(role, supported, 0, Duration::from_secs(5))
    }

    #[test]
    fn selects_highest_mutually_supported_version() {
        let server = handler(ChannelRole::Accepting, &[1, 2]);

        assert_eq!(server.select_version(&[2, 3]), Some(2));
        assert_eq!(server.select_version(&[1, 2, 3]), Some(2));
        assert_eq!(server.select_version(&[3, 4]), None);
        assert_eq!(server.select_version(&[]), None);
    }

    #[test]
    fn supported_versions_are_sorted_on_construction() {
        let server = handler(ChannelRole::Accepting, &[3, 1, 2]);

        // Highest wins even when configured out of order.
        assert_eq!(server.select_version(&[1, 3]), Some(3));
    }
}
