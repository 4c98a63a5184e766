//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM.  
//! Key size: 32 bytes.  Nonce (IV): 12 bytes, drawn from the OS RNG on every
//! call and returned to the caller, who ships it next to the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand_core::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

/// Symmetric session key shared by exactly one pair of identities.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Fresh random key from the OS RNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("session key must be {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// 96-bit GCM nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv(pub [u8; IV_LEN]);

impl Iv {
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::AeadEncrypt)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; IV_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("iv must be {IV_LEN} bytes")))?;
        Ok(Self(arr))
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&STANDARD.decode(s)?)
    }
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
/// `aad`: additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Iv), CryptoError> {
    let iv = Iv::random()?;
    let ciphertext = encrypt_with_iv(key.as_bytes(), &iv, plaintext, aad)?;
    Ok((ciphertext, iv))
}

/// Decrypt `ciphertext` (ct || tag) under `key`.
pub fn decrypt(
    key: &SessionKey,
    ciphertext: &[u8],
    iv: &Iv,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    decrypt_with_key(key.as_bytes(), ciphertext, iv, aad)
}

pub(crate) fn encrypt_with_iv(
    key: &[u8; KEY_LEN],
    iv: &Iv,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(Nonce::from_slice(&iv.0), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

pub(crate) fn decrypt_with_key(
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
    iv: &Iv,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv.0), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = SessionKey::generate().unwrap();
        let (ct, iv) = encrypt(&key, b"hello", b"aad").unwrap();
        let pt = decrypt(&key, &ct, &iv, b"aad").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn iv_is_fresh_per_call() {
        let key = SessionKey::generate().unwrap();
        let (ct1, iv1) = encrypt(&key, b"same", b"").unwrap();
        let (ct2, iv2) = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn wrong_key_fails() {
        let k1 = SessionKey::generate().unwrap();
        let k2 = SessionKey::generate().unwrap();
        let (ct, iv) = encrypt(&k1, b"secret", b"").unwrap();
        assert!(matches!(decrypt(&k2, &ct, &iv, b""), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SessionKey::generate().unwrap();
        let (mut ct, iv) = encrypt(&key, b"secret", b"").unwrap();
        ct[0] ^= 0x01;
        assert!(decrypt(&key, &ct, &iv, b"").is_err());
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = SessionKey::generate().unwrap();
        let (ct, iv) = encrypt(&key, b"secret", b"alice").unwrap();
        assert!(decrypt(&key, &ct, &iv, b"mallory").is_err());
    }

    #[test]
    fn iv_b64_length_checked() {
        assert!(Iv::from_b64("AAAA").is_err());
        let iv = Iv::random().unwrap();
        assert_eq!(Iv::from_b64(&iv.to_b64()).unwrap(), iv);
    }
}
