//! Session key transport (sealed box).
//!
//! Wire format of a wrapped key:
//!   [ ephemeral X25519 public (32) | iv (12) | AES-256-GCM(session key) + tag (48) ]
//!
//! The wrapping key is HKDF-SHA256(DH(ephemeral, recipient)) salted with both
//! public keys. Only the holder of the recipient's identity secret can unwrap.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroize;

use crate::aead::{self, Iv, SessionKey, IV_LEN, KEY_LEN};
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PeerPublicKey, PUBLIC_KEY_LEN};
use crate::kdf;

const WRAP_AAD: &[u8] = b"veil-session-key";
const TAG_LEN: usize = 16;
pub const WRAPPED_KEY_LEN: usize = PUBLIC_KEY_LEN + IV_LEN + KEY_LEN + TAG_LEN;

/// Encrypt `key` so that only `recipient` can recover it.
pub fn wrap_session_key(key: &SessionKey, recipient: &PeerPublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient.inner());

    let mut wrap_key = kdf::derive_wrap_key(
        shared.as_bytes(),
        ephemeral_pub.as_bytes(),
        recipient.as_bytes(),
    )?;
    let iv = Iv::random()?;
    let sealed = aead::encrypt_with_iv(&wrap_key, &iv, key.as_bytes(), WRAP_AAD);
    wrap_key.zeroize();
    let sealed = sealed?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&iv.0);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Recover a session key wrapped for `identity`.
pub fn unwrap_session_key(wrapped: &[u8], identity: &IdentityKeyPair) -> Result<SessionKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
            wrapped.len()
        )));
    }
    let (eph_bytes, rest) = wrapped.split_at(PUBLIC_KEY_LEN);
    let (iv_bytes, sealed) = rest.split_at(IV_LEN);

    let mut eph_arr = [0u8; PUBLIC_KEY_LEN];
    eph_arr.copy_from_slice(eph_bytes);
    let ephemeral_pub = X25519Public::from(eph_arr);
    let iv = Iv::from_slice(iv_bytes)?;

    let shared = identity.diffie_hellman(&ephemeral_pub);
    let mut wrap_key = kdf::derive_wrap_key(
        shared.as_bytes(),
        ephemeral_pub.as_bytes(),
        &identity.export_public_key(),
    )?;
    let plaintext = aead::decrypt_with_key(&wrap_key, sealed, &iv, WRAP_AAD);
    wrap_key.zeroize();
    SessionKey::from_slice(&plaintext?)
}
