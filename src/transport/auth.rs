//! The mutual-authentication handler and credential verification.
//!
//! First stage of every channel. The accepting side verifies the
//! initiator's credential and only then presents its own; the initiating
//! side presents first and verifies the answer. Verification may block
//! (a ticket lookup), so it always runs on the caller-supplied executor;
//! the outcome comes back over a channel drained by `tick`.
//!
//! Until authentication succeeds nothing is released downstream; on any
//! failure the connection is closed with the peer-identity field left
//! unset.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use lru::LruCache;
use rand::Rng;
use tracing::debug;

use crate::dispatch::Executor;

use super::messages::{
    encode_frame, Credential, FrameBuffer, HandshakeMessage, FRAME_HEADER_LEN, MAX_FRAME_LEN,
    NONCE_LEN,
};
use super::pipeline::{ChannelError, ChannelEvent, ChannelHandler, HandlerContext};
use super::state::{ChannelRole, ChannelSharedState, PeerIdentity};

/// Default number of recently seen ticket nonces kept for replay defense.
pub const DEFAULT_REPLAY_CACHE_SIZE: usize = 1024;

/// Most bytes a peer may have in flight while its credential sits with the
/// verifier: one full frame for the next stage. The verifier may block for
/// the whole handshake window, so this buffer must stay bounded.
const MAX_VERIFY_BUFFER: usize = FRAME_HEADER_LEN + MAX_FRAME_LEN;

/// Why a credential was not accepted. Connection-scoped and recoverable:
/// the one connection closes, nothing else is affected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed credential: {0}")]
    Malformed(&'static str),

    #[error("credential checksum mismatch")]
    ChecksumMismatch,

    #[error("credential signature invalid")]
    BadSignature,

    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("credential nonce was already used")]
    ReplayedNonce,

    #[error("credential expired")]
    Expired,

    #[error("peer rejected the handshake: {0}")]
    Rejected(String),
}

/// Verifies a presented credential and resolves it to a peer identity.
///
/// May perform blocking I/O; the authentication handler never calls this
/// on the pipeline thread.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &Credential) -> Result<PeerIdentity, AuthError>;
}

/// Default verifier: checksum, expiry, signature and replay checks, with
/// an optional allowlist pinning principals to known keys.
pub struct KeyringVerifier {
    trusted: Option<HashMap<String, VerifyingKey>>,
    seen_nonces: Mutex<LruCache<[u8; NONCE_LEN], ()>>,
}

impl KeyringVerifier {
    /// Accepts any principal whose ticket is internally consistent (the
    /// signature proves possession of the embedded key).
    pub fn new() -> Self {
        Self {
            trusted: None,
            seen_nonces: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_REPLAY_CACHE_SIZE).expect("1024 > 0"),
            )),
        }
    }

    /// Switches to allowlist mode: only pinned principals are accepted,
    /// and the presented key must match the pinned one.
    pub fn with_trusted_principal(mut self, principal: impl Into<String>, key: VerifyingKey) -> Self {
        self.trusted
            .get_or_insert_with(HashMap::new)
            .insert(principal.into(), key);
        self
    }

    pub fn with_replay_cache_size(mut self, size: usize) -> Self {
        if let Some(size) = NonZeroUsize::new(size) {
            self.seen_nonces = Mutex::new(LruCache::new(size));
        }
        self
    }
}

impl Default for KeyringVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVerifier for KeyringVerifier {
    fn verify(&self, credential: &Credential) -> Result<PeerIdentity, AuthError> {
        let body = credential.signed_body();

        if Credential::checksum_of(&body) != credential.checksum {
            return Err(AuthError::ChecksumMismatch);
        }

        if credential.expires_at < unix_now() {
            return Err(AuthError::Expired);
        }

        let key = match &self.trusted {
            Some(trusted) => {
                let pinned = trusted
                    .get(&credential.principal)
                    .ok_or_else(|| AuthError::UnknownPrincipal(credential.principal.clone()))?;

                if *pinned != credential.key {
                    return Err(AuthError::BadSignature);
                }

                pinned
            }
            None => &credential.key,
        };

        key.verify(&body, &credential.signature)
            .map_err(|_| AuthError::BadSignature)?;

        {
            let mut seen = match self.seen_nonces.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if seen.put(credential.nonce, ()).is_some() {
                return Err(AuthError::ReplayedNonce);
            }
        }

        Ok(PeerIdentity {
            principal: credential.principal.clone(),
            key: credential.key,
        })
    }
}

/// This node's own credential material.
pub struct LocalCredential {
    principal: String,
    signing_key: SigningKey,
}

impl LocalCredential {
    pub fn new(principal: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            principal: principal.into(),
            signing_key,
        }
    }

    /// A fresh random identity, mostly useful for tests and demos.
    pub fn generate(principal: impl Into<String>) -> Self {
        let secret: [u8; 32] = rand::thread_rng().gen();

        Self::new(principal, SigningKey::from_bytes(&secret))
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issues a signed single-use ticket valid for `ttl`.
    pub fn issue(&self, ttl: Duration) -> Credential {
        let key = self.signing_key.verifying_key();
        let nonce: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let expires_at = unix_now().saturating_add(ttl.as_secs());

        let body = Credential::ticket_body(&self.principal, &key, &nonce, expires_at);

        Credential {
            principal: self.principal.clone(),
            key,
            nonce,
            expires_at,
            checksum: Credential::checksum_of(&body),
            signature: self.signing_key.sign(&body),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

enum AuthPhase {
    /// Waiting for the peer's credential frame.
    AwaitingCredential,
    /// A credential is with the verifier on the executor.
    Verifying,
    /// Identity written; this handler is a passthrough now.
    Complete,
}

/// The authentication stage. Must be the first handler in the chain.
pub(crate) struct KerberosHandler {
    role: ChannelRole,
    executor: Arc<dyn Executor>,
    state: Arc<ChannelSharedState>,
    verifier: Arc<dyn CredentialVerifier>,
    local: Arc<LocalCredential>,
    ticket_ttl: Duration,
    timeout: Duration,
    deadline: Option<Instant>,
    phase: AuthPhase,
    frames: FrameBuffer,
    outcome: Option<flume::Receiver<Result<PeerIdentity, AuthError>>>,
}

impl KerberosHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: ChannelRole,
        executor: Arc<dyn Executor>,
        state: Arc<ChannelSharedState>,
        verifier: Arc<dyn CredentialVerifier>,
        local: Arc<LocalCredential>,
        ticket_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            role,
            executor,
            state,
            verifier,
            local,
            ticket_ttl,
            timeout,
            deadline: None,
            phase: AuthPhase::AwaitingCredential,
            frames: FrameBuffer::default(),
            outcome: None,
        }
    }

    fn send_own_credential(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ChannelError> {
        let credential = self.local.issue(self.ticket_ttl);
        let message = HandshakeMessage::Credential((&credential).into());

        ctx.send(encode_frame(&message.to_bytes()?)?)
    }

    /// Ships the credential to the verifier on the executor. The result
    /// comes back through `self.outcome`, drained by `tick`.
    fn start_verification(&mut self, credential: Credential) {
        let (sender, receiver) = flume::bounded(1);
        self.outcome = Some(receiver);
        self.phase = AuthPhase::Verifying;

        let verifier = self.verifier.clone();

        self.executor.execute(Box::new(move || {
            let _ = sender.send(verifier.verify(&credential));
        }));
    }

    fn on_verified(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        identity: PeerIdentity,
    ) -> Result<(), ChannelError> {
        self.state.set_peer_identity(identity.clone())?;

        debug!(principal = %identity.principal, role = ?self.role, "Peer authenticated");

        // The accepting side answers with its own credential only after
        // the initiator proved itself.
        if self.role.is_server_side() {
            self.send_own_credential(ctx)?;
        }

        self.phase = AuthPhase::Complete;
        self.outcome = None;

        // Subscribers observe the completion before the first released
        // payload.
        ctx.emit(ChannelEvent::AuthenticationCompleted(identity));

        let remaining = self.frames.take_remaining();
        if !remaining.is_empty() {
            ctx.forward(remaining);
        }

        Ok(())
    }
}

impl ChannelHandler for KerberosHandler {
    fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), ChannelError> {
        self.deadline = Some(Instant::now() + self.timeout);

        // The initiating side presents its credential first.
        if !self.role.is_server_side() {
            self.send_own_credential(ctx)?;
        }

        Ok(())
    }

    fn data_received(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        data: Bytes,
    ) -> Result<(), ChannelError> {
        match self.phase {
            AuthPhase::Complete => {
                ctx.forward(data);
                Ok(())
            }
            AuthPhase::Verifying => {
                // Bytes for the next stage arriving early; released once
                // verification succeeds.
                self.frames.extend(&data);

                if self.frames.len() > MAX_VERIFY_BUFFER {
                    return Err(ChannelError::HandshakeViolation(
                        "pre-authentication buffer overflow",
                    ));
                }

                Ok(())
            }
            AuthPhase::AwaitingCredential => {
                self.frames.extend(&data);

                let Some(frame) = self.frames.next_frame()? else {
                    return Ok(());
                };

                match HandshakeMessage::from_bytes(&frame)? {
                    HandshakeMessage::Credential(message) => {
                        let credential = Credential::try_from(message)?;
                        self.start_verification(credential);
                        Ok(())
                    }
                    HandshakeMessage::Reject(reject) => {
                        Err(AuthError::Rejected(reject.message).into())
                    }
                    _ => Err(ChannelError::HandshakeViolation(
                        "expected a credential before anything else",
                    )),
                }
            }
        }
    }

    fn write(&mut self, ctx: &mut HandlerContext<'_>, data: Bytes) -> Result<(), ChannelError> {
        if matches!(self.phase, AuthPhase::Complete) {
            ctx.forward_outbound(data);
            Ok(())
        } else {
            Err(ChannelError::HandshakeViolation(
                "application write before authentication completed",
            ))
        }
    }

    fn tick(&mut self, ctx: &mut HandlerContext<'_>, now: Instant) -> Result<(), ChannelError> {
        if matches!(self.phase, AuthPhase::Complete) {
            return Ok(());
        }

        if let Some(outcome) = &self.outcome {
            match outcome.try_recv() {
                Ok(Ok(identity)) => return self.on_verified(ctx, identity),
                Ok(Err(error)) => return Err(error.into()),
                Err(flume::TryRecvError::Empty) => {}
                Err(flume::TryRecvError::Disconnected) => {
                    return Err(ChannelError::HandshakeViolation(
                        "credential verification was dropped",
                    ));
                }
            }
        }

        match self.deadline {
            Some(deadline) if now >= deadline => Err(ChannelError::HandshakeTimeout),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn issue_and_verify_roundtrip() {
        let local = LocalCredential::generate("storage-node-1");
        let verifier = KeyringVerifier::new();

        let identity = verifier.verify(&local.issue(Duration::from_secs(60))).unwrap();

        assert_eq!(identity.principal, "storage-node-1");
        assert_eq!(identity.key, local.verifying_key());
    }

    #[test]
    fn tampered_ticket_fails_the_checksum() {
        let local = LocalCredential::generate("storage-node-1");
        let verifier = KeyringVerifier::new();

        let mut credential = local.issue(Duration::from_secs(60));
        credential.principal = "storage-node-2".to_string();

        assert_eq!(
            verifier.verify(&credential),
            Err(AuthError::ChecksumMismatch)
        );
    }

    #[test]
    fn forged_signature_is_rejected() {
        let honest = LocalCredential::generate("storage-node-1");
        let forger = LocalCredential::generate("storage-node-1");
        let verifier = KeyringVerifier::new();

        // Forger copies the honest ticket but signs with its own key while
        // claiming the honest key.
        let honest_ticket = honest.issue(Duration::from_secs(60));
        let body = honest_ticket.signed_body();

        let forged = Credential {
            signature: forger.signing_key.sign(&body),
            ..honest_ticket
        };

        assert_eq!(verifier.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn expired_ticket_is_rejected() {
        let local = LocalCredential::generate("storage-node-1");
        let verifier = KeyringVerifier::new();

        let mut credential = local.issue(Duration::from_secs(0));
        credential.expires_at = unix_now().saturating_sub(10);

        // Re-sign so only the expiry is wrong.
        let body = credential.signed_body();
        credential.checksum = Credential::checksum_of(&body);
        credential.signature = local.signing_key.sign(&body);

        assert_eq!(verifier.verify(&credential), Err(AuthError::Expired));
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let local = LocalCredential::generate("storage-node-1");
        let verifier = KeyringVerifier::new();

        let credential = local.issue(Duration::from_secs(60));

        assert!(verifier.verify(&credential).is_ok());
        assert_eq!(verifier.verify(&credential), Err(AuthError::ReplayedNonce));
    }

    #[test]
    fn allowlist_pins_principals() {
        let known = LocalCredential::generate("storage-node-1");
        let stranger = LocalCredential::generate("storage-node-9");

        let verifier =
            KeyringVerifier::new().with_trusted_principal("storage-node-1", known.verifying_key());

        assert!(verifier.verify(&known.issue(Duration::from_secs(60))).is_ok());
        assert_eq!(
            verifier.verify(&stranger.issue(Duration::from_secs(60))),
            Err(AuthError::UnknownPrincipal("storage-node-9".to_string()))
        );
    }
}
