//! HKDF-SHA256, used to turn a DH output into a key-wrapping key.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a 32-byte wrapping key from an X25519 shared secret.
///
/// Both public keys are bound into the salt so a wrapped key cannot be
/// replayed against a different recipient.
pub fn derive_wrap_key(
    shared_secret: &[u8],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pub);
    salt[32..].copy_from_slice(recipient_pub);
    let mut key = [0u8; 32];
    hkdf_expand(shared_secret, Some(&salt), b"veil-key-wrap-v1", &mut key)?;
    Ok(key)
}
