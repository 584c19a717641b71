//! Secure handshake protocol implementation using Elliptic Curve Diffie-Hellman (ECDH)
//!
//! Three datagrams establish a session:
//!
//! ```text
//! initiator                                   responder
//!   Request  {protocol id, id, eph, nonce, ts, identity}  ──▶
//!            ◀──  Response {id, eph, nonce, H(client nonce), identity, sig}
//!   Confirm  {H(server nonce), sig} (sealed) ──▶
//! ```
//!
//! Both sides derive two directional session keys from the x25519 shared secret and both
//! nonces. The responder derives its keys as soon as it answers, so it can open the sealed
//! confirmation; the initiator derives them when it verifies the response.
//!
//! Handshake state is session-scoped (`ClientHandshakeState`, `ServerHandshakeState`) and
//! zeroized on drop. Replay protection for the plaintext request combines a timestamp
//! window with the [`ReplayCache`].
//!
//! ## Identity
//! An endpoint may carry an ed25519 signing key. Each side signs the handshake transcript
//! under its role label; the peer verifies the signature against the identity key sent in
//! the clear. [`AuthPolicy::Strict`] refuses peers without an identity and a non-empty
//! whitelist restricts which identities are accepted.

use crate::config::AuthPolicy;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{SessionKeys, KEY_SIZE};
use crate::utils::replay_cache::ReplayCache;
use bytes::{Buf, BufMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroize;

use tracing::{debug, instrument, warn};

pub const KIND_REQUEST: u8 = 1;
pub const KIND_RESPONSE: u8 = 2;
pub const KIND_CONFIRM: u8 = 3;

/// Encoded request body length.
pub const REQUEST_LEN: usize = 1 + 4 + 4 + 32 + 16 + 8 + 32;
/// Encoded response body length.
pub const RESPONSE_LEN: usize = 1 + 4 + 32 + 16 + 32 + 32 + 64;
/// Encoded confirmation plaintext length.
pub const CONFIRM_LEN: usize = 1 + 32 + 64;

/// Accepted clock skew for request timestamps from the future.
const FUTURE_TOLERANCE_MS: u64 = 2000;

const LABEL_INITIATOR_KEY: &[u8] = b"udpc initiator->responder";
const LABEL_RESPONDER_KEY: &[u8] = b"udpc responder->initiator";
const LABEL_INITIATOR_SIG: &[u8] = b"udpc initiator signature";
const LABEL_RESPONDER_SIG: &[u8] = b"udpc responder signature";

/// First datagram of a handshake, sent in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol_id: u32,
    /// Identifier the initiator assigned to the connection.
    pub connection_id: u32,
    pub public_key: [u8; 32],
    pub nonce: [u8; 16],
    /// Wall-clock milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Identity key, all zeros when absent.
    pub identity: [u8; 32],
}

/// Responder's answer, sent in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Identifier the responder assigned to the connection.
    pub connection_id: u32,
    pub public_key: [u8; 32],
    pub nonce: [u8; 16],
    /// SHA-256 of the initiator's nonce.
    pub nonce_verification: [u8; 32],
    pub identity: [u8; 32],
    pub signature: [u8; 64],
}

/// Final handshake message, sealed under the new session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfirm {
    /// SHA-256 of the responder's nonce.
    pub nonce_verification: [u8; 32],
    pub signature: [u8; 64],
}

fn body_error() -> ProtocolError {
    ProtocolError::MalformedPacket(constants::ERR_HANDSHAKE_BODY)
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

impl HandshakeRequest {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(KIND_REQUEST);
        buf.put_u32(self.protocol_id);
        buf.put_u32(self.connection_id);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.nonce);
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.identity);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_LEN);
        self.encode(&mut out);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != REQUEST_LEN || body[0] != KIND_REQUEST {
            return Err(body_error());
        }
        let mut buf = &body[1..];
        Ok(Self {
            protocol_id: buf.get_u32(),
            connection_id: buf.get_u32(),
            public_key: read_array(&mut buf),
            nonce: read_array(&mut buf),
            timestamp: buf.get_u64(),
            identity: read_array(&mut buf),
        })
    }
}

impl HandshakeResponse {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(KIND_RESPONSE);
        buf.put_u32(self.connection_id);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.nonce_verification);
        buf.put_slice(&self.identity);
        buf.put_slice(&self.signature);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESPONSE_LEN);
        self.encode(&mut out);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != RESPONSE_LEN || body[0] != KIND_RESPONSE {
            return Err(body_error());
        }
        let mut buf = &body[1..];
        Ok(Self {
            connection_id: buf.get_u32(),
            public_key: read_array(&mut buf),
            nonce: read_array(&mut buf),
            nonce_verification: read_array(&mut buf),
            identity: read_array(&mut buf),
            signature: read_array(&mut buf),
        })
    }
}

impl HandshakeConfirm {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(KIND_CONFIRM);
        buf.put_slice(&self.nonce_verification);
        buf.put_slice(&self.signature);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONFIRM_LEN);
        self.encode(&mut out);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != CONFIRM_LEN || body[0] != KIND_CONFIRM {
            return Err(body_error());
        }
        let mut buf = &body[1..];
        Ok(Self {
            nonce_verification: read_array(&mut buf),
            signature: read_array(&mut buf),
        })
    }
}

/// Local identity and the policy applied to peer identities.
#[derive(Clone)]
pub struct Authenticator {
    protocol_id: u32,
    policy: AuthPolicy,
    signing_key: Option<SigningKey>,
    whitelist: HashSet<[u8; 32]>,
}

impl Authenticator {
    pub fn new(protocol_id: u32, policy: AuthPolicy) -> Self {
        Self {
            protocol_id,
            policy,
            signing_key: None,
            whitelist: HashSet::new(),
        }
    }

    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AuthPolicy) {
        self.policy = policy;
    }

    /// Sign handshakes with `key` from now on.
    pub fn set_identity(&mut self, key: SigningKey) {
        self.signing_key = Some(key);
    }

    pub fn clear_identity(&mut self) {
        self.signing_key = None;
    }

    /// Public identity key, if one is configured.
    pub fn identity(&self) -> Option<[u8; 32]> {
        self.signing_key
            .as_ref()
            .map(|key| key.verifying_key().to_bytes())
    }

    fn identity_or_zero(&self) -> [u8; 32] {
        self.identity().unwrap_or([0u8; 32])
    }

    /// Returns true if the key was not already present.
    pub fn add_to_whitelist(&mut self, identity: [u8; 32]) -> bool {
        self.whitelist.insert(identity)
    }

    /// Returns true if the key was present.
    pub fn remove_from_whitelist(&mut self, identity: &[u8; 32]) -> bool {
        self.whitelist.remove(identity)
    }

    pub fn whitelist_contains(&self, identity: &[u8; 32]) -> bool {
        self.whitelist.contains(identity)
    }

    pub fn clear_whitelist(&mut self) {
        self.whitelist.clear();
    }

    fn sign(&self, label: &[u8], transcript: &[u8]) -> [u8; 64] {
        match &self.signing_key {
            Some(key) => {
                let mut message = Vec::with_capacity(label.len() + transcript.len());
                message.extend_from_slice(label);
                message.extend_from_slice(transcript);
                key.sign(&message).to_bytes()
            }
            None => [0u8; 64],
        }
    }

    /// Apply policy and whitelist to the identity a peer presented.
    fn check_peer_identity(&self, identity: &[u8; 32]) -> Result<()> {
        let absent = identity.iter().all(|&b| b == 0);
        if absent {
            if self.policy == AuthPolicy::Strict || !self.whitelist.is_empty() {
                return Err(ProtocolError::HandshakeRejected(
                    constants::ERR_MISSING_IDENTITY.into(),
                ));
            }
            return Ok(());
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(identity) {
            return Err(ProtocolError::HandshakeRejected(
                constants::ERR_NOT_WHITELISTED.into(),
            ));
        }
        Ok(())
    }

    /// Verify a peer's transcript signature. Peers without identity pass if policy allows.
    fn verify_peer(
        &self,
        identity: &[u8; 32],
        label: &[u8],
        transcript: &[u8],
        signature: &[u8; 64],
    ) -> Result<()> {
        self.check_peer_identity(identity)?;
        if identity.iter().all(|&b| b == 0) {
            return Ok(());
        }
        let key = VerifyingKey::from_bytes(identity).map_err(|_| {
            ProtocolError::HandshakeRejected(constants::ERR_BAD_SIGNATURE.into())
        })?;
        let mut message = Vec::with_capacity(label.len() + transcript.len());
        message.extend_from_slice(label);
        message.extend_from_slice(transcript);
        key.verify(&message, &Signature::from_bytes(signature))
            .map_err(|_| ProtocolError::HandshakeRejected(constants::ERR_BAD_SIGNATURE.into()))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("protocol_id", &self.protocol_id)
            .field("policy", &self.policy)
            .field("identity", &self.identity().is_some())
            .field("whitelist_len", &self.whitelist.len())
            .finish()
    }
}

/// Client-side handshake state - kept until the response arrives
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct ClientHandshakeState {
    secret: Option<EphemeralSecret>,
    public: [u8; 32],
    client_nonce: [u8; 16],
    /// Responder key the caller pinned, if any.
    #[zeroize(skip)]
    expected_identity: Option<[u8; 32]>,
}

/// Server-side handshake state - kept until the confirmation arrives
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct ServerHandshakeState {
    server_nonce: [u8; 16],
    client_identity: [u8; 32],
    transcript: Vec<u8>,
}

impl ServerHandshakeState {
    /// Whether only an explicit confirmation may complete this handshake.
    ///
    /// An initiator that presented an identity must prove it with the confirmation
    /// signature; otherwise any authenticated datagram from it is proof enough.
    pub fn requires_confirmation(&self) -> bool {
        self.client_identity.iter().any(|&b| b != 0)
    }
}

/// Get the current timestamp in milliseconds
fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Internal(constants::ERR_SYSTEM_TIME))
}

/// Generate a cryptographically secure random nonce
fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify that a timestamp is recent enough, with a 2-second future tolerance for skew
pub fn verify_timestamp(timestamp: u64, max_age: Duration) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };

    if timestamp > current.saturating_add(FUTURE_TOLERANCE_MS) {
        return false;
    }

    current.saturating_sub(timestamp) <= max_age.as_millis() as u64
}

/// Compute hash of a nonce for verification
fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

fn transcript(
    protocol_id: u32,
    client_public: &[u8; 32],
    server_public: &[u8; 32],
    client_nonce: &[u8; 16],
    server_nonce: &[u8; 16],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 + 32 + 16 + 16);
    out.extend_from_slice(&protocol_id.to_be_bytes());
    out.extend_from_slice(client_public);
    out.extend_from_slice(server_public);
    out.extend_from_slice(client_nonce);
    out.extend_from_slice(server_nonce);
    out
}

fn derive_directional_key(
    shared_secret: &SharedSecret,
    label: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    protocol_id: u32,
) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(label);
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    hasher.update(protocol_id.to_be_bytes());
    hasher.finalize().into()
}

/// Derive both directional keys; `initiator` selects which one this side sends with.
fn derive_session_keys(
    shared_secret: &SharedSecret,
    client_nonce: &[u8; 16],
    server_nonce: &[u8; 16],
    protocol_id: u32,
    initiator: bool,
) -> Result<SessionKeys> {
    if !shared_secret.was_contributory() {
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_BAD_PUBLIC_KEY.into(),
        ));
    }
    let i2r = derive_directional_key(
        shared_secret,
        LABEL_INITIATOR_KEY,
        client_nonce,
        server_nonce,
        protocol_id,
    );
    let r2i = derive_directional_key(
        shared_secret,
        LABEL_RESPONDER_KEY,
        client_nonce,
        server_nonce,
        protocol_id,
    );
    Ok(if initiator {
        SessionKeys {
            send: i2r,
            recv: r2i,
        }
    } else {
        SessionKeys {
            send: r2i,
            recv: i2r,
        }
    })
}

/// Initiates a handshake: generates the ephemeral key pair and nonce.
///
/// With `expected_identity` set, only a responder signing with exactly that key is
/// accepted, regardless of the authentication policy.
#[instrument(level = "debug", skip(auth, expected_identity))]
pub fn client_handshake_init(
    auth: &Authenticator,
    connection_id: u32,
    expected_identity: Option<[u8; 32]>,
) -> Result<(ClientHandshakeState, HandshakeRequest)> {
    let client_secret = EphemeralSecret::random_from_rng(OsRng);
    let client_public = PublicKey::from(&client_secret).to_bytes();
    let nonce = generate_nonce();
    let timestamp = current_timestamp()?;

    let state = ClientHandshakeState {
        secret: Some(client_secret),
        public: client_public,
        client_nonce: nonce,
        expected_identity,
    };

    debug!("Client initiating handshake");

    Ok((
        state,
        HandshakeRequest {
            protocol_id: auth.protocol_id,
            connection_id,
            public_key: client_public,
            nonce,
            timestamp,
            identity: auth.identity_or_zero(),
        },
    ))
}

/// Validates a request and produces the response plus the responder's session keys.
///
/// Rejects requests for another protocol, stale or future timestamps, replays and
/// identities the local policy refuses.
#[instrument(level = "debug", skip(auth, request, replay_cache, now))]
pub fn server_handshake_response(
    auth: &Authenticator,
    request: &HandshakeRequest,
    connection_id: u32,
    peer: SocketAddr,
    replay_cache: &mut ReplayCache,
    max_age: Duration,
    now: Instant,
) -> Result<(ServerHandshakeState, HandshakeResponse, SessionKeys)> {
    if request.protocol_id != auth.protocol_id {
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_PROTOCOL_MISMATCH.into(),
        ));
    }

    if !verify_timestamp(request.timestamp, max_age) {
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_INVALID_TIMESTAMP.into(),
        ));
    }

    auth.check_peer_identity(&request.identity)?;

    if replay_cache.is_replay(peer, &request.nonce, request.timestamp, now) {
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_REPLAY_ATTACK.into(),
        ));
    }

    let server_secret = EphemeralSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&server_secret).to_bytes();
    let server_nonce = generate_nonce();

    let shared = server_secret.diffie_hellman(&PublicKey::from(request.public_key));
    let keys = derive_session_keys(
        &shared,
        &request.nonce,
        &server_nonce,
        auth.protocol_id,
        false,
    )?;

    let transcript = transcript(
        auth.protocol_id,
        &request.public_key,
        &server_public,
        &request.nonce,
        &server_nonce,
    );
    let signature = auth.sign(LABEL_RESPONDER_SIG, &transcript);

    debug!("Server responding to handshake request");

    Ok((
        ServerHandshakeState {
            server_nonce,
            client_identity: request.identity,
            transcript,
        },
        HandshakeResponse {
            connection_id,
            public_key: server_public,
            nonce: server_nonce,
            nonce_verification: hash_nonce(&request.nonce),
            identity: auth.identity_or_zero(),
            signature,
        },
        keys,
    ))
}

/// Client verifies the response, derives the session keys and builds the confirmation.
#[instrument(level = "debug", skip_all)]
pub fn client_handshake_verify(
    auth: &Authenticator,
    mut state: ClientHandshakeState,
    response: &HandshakeResponse,
) -> Result<(SessionKeys, HandshakeConfirm)> {
    if hash_nonce(&state.client_nonce) != response.nonce_verification {
        warn!("Responder failed nonce verification");
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_NONCE_VERIFICATION_FAILED.into(),
        ));
    }

    if let Some(expected) = state.expected_identity {
        if response.identity != expected {
            warn!("Responder identity does not match the pinned key");
            return Err(ProtocolError::HandshakeRejected(
                constants::ERR_IDENTITY_MISMATCH.into(),
            ));
        }
    }

    let transcript = transcript(
        auth.protocol_id,
        &state.public,
        &response.public_key,
        &state.client_nonce,
        &response.nonce,
    );
    auth.verify_peer(
        &response.identity,
        LABEL_RESPONDER_SIG,
        &transcript,
        &response.signature,
    )?;

    let client_secret = state
        .secret
        .take()
        .ok_or(ProtocolError::Internal(constants::ERR_HANDSHAKE_STATE))?;
    let shared = client_secret.diffie_hellman(&PublicKey::from(response.public_key));
    let keys = derive_session_keys(
        &shared,
        &state.client_nonce,
        &response.nonce,
        auth.protocol_id,
        true,
    )?;

    debug!("Client verified handshake response");

    Ok((
        keys,
        HandshakeConfirm {
            nonce_verification: hash_nonce(&response.nonce),
            signature: auth.sign(LABEL_INITIATOR_SIG, &transcript),
        },
    ))
}

/// Server verifies the initiator's confirmation.
#[instrument(level = "debug", skip_all)]
pub fn server_handshake_finalize(
    auth: &Authenticator,
    state: &ServerHandshakeState,
    confirm: &HandshakeConfirm,
) -> Result<()> {
    if hash_nonce(&state.server_nonce) != confirm.nonce_verification {
        return Err(ProtocolError::HandshakeRejected(
            constants::ERR_NONCE_VERIFICATION_FAILED.into(),
        ));
    }
    auth.verify_peer(
        &state.client_identity,
        LABEL_INITIATOR_SIG,
        &state.transcript,
        &confirm.signature,
    )?;
    debug!("Server finalized handshake");
    Ok(())
}
