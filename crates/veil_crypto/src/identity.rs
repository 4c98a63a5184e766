//! Identity key management
//!
//! Each running client owns exactly one `IdentityKeyPair` (X25519),
//! generated at process start and never persisted or transmitted. Only the
//! public half leaves the process, inside a `public-key` handshake frame.
//! Peers' public keys arrive as `PeerPublicKey` and are only ever used to
//! wrap a session key (see `wrap`).

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand_core::RngCore;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};

use crate::error::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;

// ── Peer public key ───────────────────────────────────────────────────────────

/// A peer's imported public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey(X25519Public);

impl PeerPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(X25519Public::from(arr)))
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&STANDARD.decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    pub(crate) fn inner(&self) -> &X25519Public {
        &self.0
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 16 bytes, hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789"
    pub fn fingerprint(&self) -> String {
        fingerprint(self.as_bytes())
    }
}

fn fingerprint(public: &[u8; PUBLIC_KEY_LEN]) -> String {
    let hash = blake3::hash(public);
    let hex = hex::encode(&hash.as_bytes()[..16]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term (per process) key-agreement key. `StaticSecret` zeroizes itself
/// on drop.
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl IdentityKeyPair {
    /// Generate a fresh keypair from the OS RNG.
    ///
    /// Fails only when the platform entropy source is unavailable, in which
    /// case the client cannot proceed at all.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let secret = StaticSecret::from(seed);
        zeroize::Zeroize::zeroize(&mut seed);
        let public = X25519Public::from(&secret);
        Ok(Self { secret, public })
    }

    /// Raw public key bytes for transport.
    pub fn export_public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(self.public)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }

    pub(crate) fn diffie_hellman(&self, their_public: &X25519Public) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
