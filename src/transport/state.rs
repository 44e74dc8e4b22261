//! Per-connection shared state.

use std::sync::OnceLock;

use ed25519_dalek::VerifyingKey;

use crate::fatal::FatalSignal;

/// Which end of the connection this node is.
///
/// The accepting side is authoritative during protocol negotiation and
/// verifies the initiator's credential first during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Accepting,
    Initiating,
}

impl ChannelRole {
    pub fn from_server_side(server_side: bool) -> Self {
        if server_side {
            Self::Accepting
        } else {
            Self::Initiating
        }
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self, Self::Accepting)
    }
}

/// The authenticated identity of the peer, written once by the
/// authentication handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// The peer's principal name.
    pub principal: String,
    /// The key the peer proved possession of.
    pub key: VerifyingKey,
}

/// Wire parameters both ends agreed on, written once by the adaptive
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Highest mutually supported protocol version.
    pub version: u8,
    /// Feature bits supported by both ends.
    pub features: u32,
}

/// Context shared by both handlers of one connection and its owning
/// transport layer.
///
/// The mutable fields are written at most once, during the single-threaded
/// handshake phase, and are immutable afterward; post-handshake reads from
/// any number of threads need no locking. A second write means the
/// handshake invariant broke somewhere and raises a [FatalSignal].
#[derive(Debug)]
pub struct ChannelSharedState {
    role: ChannelRole,
    peer_identity: OnceLock<PeerIdentity>,
    protocol: OnceLock<ProtocolParams>,
}

impl ChannelSharedState {
    pub fn new(role: ChannelRole) -> Self {
        Self {
            role,
            peer_identity: OnceLock::new(),
            protocol: OnceLock::new(),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// `None` until authentication completed successfully.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer_identity.get()
    }

    /// `None` until protocol negotiation completed successfully.
    pub fn protocol(&self) -> Option<&ProtocolParams> {
        self.protocol.get()
    }

    pub(crate) fn set_peer_identity(&self, identity: PeerIdentity) -> Result<(), FatalSignal> {
        self.peer_identity
            .set(identity)
            .map_err(|_| FatalSignal::msg("peer identity written twice on one channel"))
    }

    pub(crate) fn set_protocol(&self, params: ProtocolParams) -> Result<(), FatalSignal> {
        self.protocol
            .set(params)
            .map_err(|_| FatalSignal::msg("protocol parameters written twice on one channel"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    fn test_identity() -> PeerIdentity {
        PeerIdentity {
            principal: "node-a".to_string(),
            key: VerifyingKey::from_bytes(&[
                215, 90, 152, 1, 130, 177, 10, 183, 213, 75, 254, 211, 201, 100, 7, 58, 14, 225,
                114, 243, 218, 166, 35, 37, 175, 2, 26, 104, 247, 7, 81, 26,
            ])
            .unwrap(),
        }
    }

    #[test]
    fn peer_identity_is_write_once() {
        let state = ChannelSharedState::new(ChannelRole::Accepting);

        assert!(state.peer_identity().is_none());
        state.set_peer_identity(test_identity()).unwrap();

        let second = state.set_peer_identity(test_identity());
        assert!(second.is_err(), "second write must fail");

        // First write survives.
        assert_eq!(state.peer_identity().unwrap().principal, "node-a");
    }

    #[test]
    fn concurrent_post_handshake_reads() {
        let state = Arc::new(ChannelSharedState::new(ChannelRole::Initiating));
        state.set_peer_identity(test_identity()).unwrap();
        state
            .set_protocol(ProtocolParams {
                version: 2,
                features: 0,
            })
            .unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(state.peer_identity().unwrap().principal, "node-a");
                        assert_eq!(state.protocol().unwrap().version, 2);
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
