//! Handshake wire messages and framing.
//!
//! Handshake traffic is length-prefixed bencode: a 4-byte big-endian body
//! length followed by one bencoded [HandshakeMessage]. Application payloads
//! reuse the same length-prefix framing after negotiation; their contents
//! are opaque to this crate.

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::auth::AuthError;
use super::pipeline::ChannelError;

pub(crate) const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on one frame's body. Anything larger is a handshake
/// violation; the application codec above this crate can renegotiate its
/// own limits.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024;

pub(crate) const NONCE_LEN: usize = 16;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// === Framing ===

/// Accumulates raw bytes and yields complete frame bodies.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame body, if one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ChannelError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let body_len = u32::from_be_bytes(header) as usize;

        if body_len > MAX_FRAME_LEN {
            return Err(ChannelError::HandshakeViolation("oversized frame"));
        }

        if self.buffer.len() < FRAME_HEADER_LEN + body_len {
            return Ok(None);
        }

        let _ = self.buffer.split_to(FRAME_HEADER_LEN);
        Ok(Some(self.buffer.split_to(body_len).freeze()))
    }

    /// Hands back everything not yet consumed as frames. Used when a
    /// handler completes its handshake stage and must release bytes that
    /// belong to the next stage, unparsed and in arrival order.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

/// Prefixes `body` with its big-endian length.
pub(crate) fn encode_frame(body: &[u8]) -> Result<Bytes, ChannelError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::HandshakeViolation("oversized frame"));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    Ok(frame.freeze())
}

// === Handshake messages ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub(crate) enum HandshakeMessage {
    /// Either side presenting its credential.
    #[serde(rename = "c")]
    Credential(CredentialMessage),

    /// Initiating side proposing the versions and features it speaks.
    #[serde(rename = "p")]
    VersionProposal(VersionProposal),

    /// Accepting side answering with the chosen terms.
    #[serde(rename = "a")]
    VersionAccept(VersionAccept),

    /// Terminal rejection (failed negotiation).
    #[serde(rename = "r")]
    Reject(Reject),
}

impl HandshakeMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct CredentialMessage {
    #[serde(rename = "n")]
    pub principal: String,

    #[serde(rename = "k", with = "serde_bytes")]
    pub key: ByteBuf,

    #[serde(rename = "o", with = "serde_bytes")]
    pub nonce: ByteBuf,

    /// Unix seconds after which the ticket is no longer acceptable.
    #[serde(rename = "e")]
    pub expires_at: u64,

    /// CRC-32/Castagnoli over the ticket body; a cheap integrity check
    /// before the signature is verified.
    #[serde(rename = "x")]
    pub checksum: u32,

    #[serde(rename = "s", with = "serde_bytes")]
    pub signature: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct VersionProposal {
    #[serde(rename = "v", with = "serde_bytes")]
    pub versions: ByteBuf,

    #[serde(rename = "f")]
    pub features: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct VersionAccept {
    #[serde(rename = "v")]
    pub version: u8,

    #[serde(rename = "f")]
    pub features: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Reject {
    #[serde(rename = "c")]
    pub code: i32,

    #[serde(rename = "m")]
    pub message: String,
}

// === Credentials ===

/// A decoded, structurally valid credential. Cryptographic and policy
/// checks happen in the verifier, off the pipeline thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub principal: String,
    pub key: VerifyingKey,
    pub nonce: [u8; NONCE_LEN],
    pub expires_at: u64,
    pub checksum: u32,
    pub signature: Signature,
}

impl Credential {
    /// The byte string the checksum and signature cover.
    pub(crate) fn ticket_body(
        principal: &str,
        key: &VerifyingKey,
        nonce: &[u8; NONCE_LEN],
        expires_at: u64,
    ) -> Vec<u8> {
        let principal = principal.as_bytes();

        let mut body =
            Vec::with_capacity(principal.len() + 1 + PUBLIC_KEY_LENGTH + NONCE_LEN + 8);
        body.extend_from_slice(principal);
        body.push(0);
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(nonce);
        body.extend_from_slice(&expires_at.to_be_bytes());

        body
    }

    pub(crate) fn checksum_of(body: &[u8]) -> u32 {
        CASTAGNOLI.checksum(body)
    }

    pub(crate) fn signed_body(&self) -> Vec<u8> {
        Self::ticket_body(&self.principal, &self.key, &self.nonce, self.expires_at)
    }
}

impl TryFrom<CredentialMessage> for Credential {
    type Error = AuthError;

    fn try_from(message: CredentialMessage) -> Result<Self, AuthError> {
        let key: [u8; PUBLIC_KEY_LENGTH] = message
            .key
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Malformed("credential key length"))?;
        let key = VerifyingKey::from_bytes(&key)
            .map_err(|_| AuthError::Malformed("credential key not a valid point"))?;

        let nonce: [u8; NONCE_LEN] = message
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Malformed("credential nonce length"))?;

        let signature: [u8; SIGNATURE_LENGTH] = message
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Malformed("credential signature length"))?;

        Ok(Credential {
            principal: message.principal,
            key,
            nonce,
            expires_at: message.expires_at,
            checksum: message.checksum,
            signature: Signature::from_bytes(&signature),
        })
    }
}

impl From<&Credential> for CredentialMessage {
    fn from(credential: &Credential) -> Self {
        CredentialMessage {
            principal: credential.principal.clone(),
            key: ByteBuf::from(credential.key.as_bytes().to_vec()),
            nonce: ByteBuf::from(credential.nonce.to_vec()),
            expires_at: credential.expires_at,
            checksum: credential.checksum,
            signature: ByteBuf::from(credential.signature.to_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrip_with_partial_delivery() {
        let frame = encode_frame(b"hello handshake").unwrap();

        let mut buffer = FrameBuffer::default();

        // Feed one byte at a time; no frame until the last byte landed.
        for (i, byte) in frame.iter().enumerate() {
            buffer.extend(&[*byte]);

            if i < frame.len() - 1 {
                assert!(buffer.next_frame().unwrap().is_none());
            }
        }

        let body = buffer.next_frame().unwrap().expect("complete frame");
        assert_eq!(&body[..], b"hello handshake");
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_violation() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        buffer.extend(&[0u8; 8]);

        assert!(matches!(
            buffer.next_frame(),
            Err(ChannelError::HandshakeViolation(_))
        ));

        assert!(encode_frame(&vec![0u8; MAX_FRAME_LEN + 1]).is_err());
    }

    #[test]
    fn take_remaining_preserves_unparsed_bytes() {
        let frame = encode_frame(b"credential").unwrap();

        let mut buffer = FrameBuffer::default();
        buffer.extend(&frame);
        buffer.extend(b"trailing payload for the next stage");

        assert!(buffer.next_frame().unwrap().is_some());
        assert_eq!(
            &buffer.take_remaining()[..],
            b"trailing payload for the next stage"
        );
    }

    #[test]
    fn handshake_message_roundtrip() {
        let proposal = HandshakeMessage::VersionProposal(VersionProposal {
            versions: ByteBuf::from(vec![2, 3]),
            features: 0b101,
        });

        let bytes = proposal.to_bytes().unwrap();
        assert_eq!(HandshakeMessage::from_bytes(&bytes).unwrap(), proposal);
    }

    #[test]
    fn malformed_credential_is_rejected_as_such() {
        let message = CredentialMessage {
            principal: "node-a".to_string(),
            key: ByteBuf::from(vec![1, 2, 3]),
            nonce: ByteBuf::from(vec![0; NONCE_LEN]),
            expires_at: 0,
            checksum: 0,
            signature: ByteBuf::from(vec![0; SIGNATURE_LENGTH]),
        };

        assert!(matches!(
            Credential::try_from(message),
            Err(AuthError::Malformed("credential key length"))
        ));
    }
}
