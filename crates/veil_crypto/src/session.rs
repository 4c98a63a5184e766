//! `CryptoSession`: one per local identity.
//!
//! Holds the identity keypair and the peer-id → session-key table. The table
//! only ever contains keys adopted by the handshake; a key a side generated
//! speculatively (the initiator's discarded key) never enters it.
//!
//! The associated data of every message binds the ordered (sender, recipient)
//! pair so ciphertext cannot be reflected back to its author.

use std::collections::HashMap;

use zeroize::Zeroizing;

use crate::aead::{self, Iv, SessionKey};
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PeerPublicKey};
use crate::wrap;

pub struct CryptoSession {
    local_id: String,
    identity: IdentityKeyPair,
    session_keys: HashMap<String, SessionKey>,
}

impl CryptoSession {
    /// Create a session with a freshly generated identity keypair.
    pub fn new(local_id: impl Into<String>) -> Result<Self, CryptoError> {
        Ok(Self::with_identity(local_id, IdentityKeyPair::generate()?))
    }

    pub fn with_identity(local_id: impl Into<String>, identity: IdentityKeyPair) -> Self {
        Self {
            local_id: local_id.into(),
            identity,
            session_keys: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn export_public_key(&self) -> [u8; 32] {
        self.identity.export_public_key()
    }

    pub fn import_peer_public_key(bytes: &[u8]) -> Result<PeerPublicKey, CryptoError> {
        PeerPublicKey::from_bytes(bytes)
    }

    pub fn generate_session_key() -> Result<SessionKey, CryptoError> {
        SessionKey::generate()
    }

    pub fn wrap_session_key(key: &SessionKey, peer: &PeerPublicKey) -> Result<Vec<u8>, CryptoError> {
        wrap::wrap_session_key(key, peer)
    }

    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, CryptoError> {
        wrap::unwrap_session_key(wrapped, &self.identity)
    }

    // ── Key table ────────────────────────────────────────────────────────────

    pub fn set_session_key(&mut self, peer_id: &str, key: SessionKey) {
        self.session_keys.insert(peer_id.to_string(), key);
    }

    /// Drop the key for `peer_id`. Returns whether one was present.
    pub fn clear_session_key(&mut self, peer_id: &str) -> bool {
        self.session_keys.remove(peer_id).is_some()
    }

    pub fn has_session_key(&self, peer_id: &str) -> bool {
        self.session_keys.contains_key(peer_id)
    }

    fn key_for(&self, peer_id: &str) -> Result<&SessionKey, CryptoError> {
        self.session_keys
            .get(peer_id)
            .ok_or_else(|| CryptoError::NoSessionKey(peer_id.to_string()))
    }

    // ── Payload encryption ───────────────────────────────────────────────────

    /// Encrypt a text message for `peer_id`.
    pub fn encrypt(&self, plaintext: &str, peer_id: &str) -> Result<(Vec<u8>, Iv), CryptoError> {
        self.encrypt_bytes(plaintext.as_bytes(), peer_id)
    }

    /// Decrypt a text message received from `peer_id`.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &Iv, peer_id: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt_bytes(ciphertext, iv, peer_id)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CryptoError::AeadDecrypt)
    }

    /// Encrypt a binary payload (image) for `peer_id`.
    pub fn encrypt_bytes(&self, plaintext: &[u8], peer_id: &str) -> Result<(Vec<u8>, Iv), CryptoError> {
        let key = self.key_for(peer_id)?;
        aead::encrypt(key, plaintext, &pair_aad(&self.local_id, peer_id))
    }

    /// Decrypt a binary payload received from `peer_id`.
    pub fn decrypt_bytes(
        &self,
        ciphertext: &[u8],
        iv: &Iv,
        peer_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self.key_for(peer_id)?;
        aead::decrypt(key, ciphertext, iv, &pair_aad(peer_id, &self.local_id))
    }
}

fn pair_aad(sender: &str, recipient: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(sender.len() + recipient.len() + 1);
    aad.extend_from_slice(sender.as_bytes());
    aad.push(b'>');
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("local_id", &self.local_id)
            .field("peers", &self.session_keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired() -> (CryptoSession, CryptoSession) {
        let mut alice = CryptoSession::new("100001").unwrap();
        let mut bob = CryptoSession::new("100002").unwrap();
        let key = CryptoSession::generate_session_key().unwrap();
        let wrapped = CryptoSession::wrap_session_key(
            &key,
            &CryptoSession::import_peer_public_key(&alice.export_public_key()).unwrap(),
        )
        .unwrap();
        bob.set_session_key("100001", key);
        let unwrapped = alice.unwrap_session_key(&wrapped).unwrap();
        alice.set_session_key("100002", unwrapped);
        (alice, bob)
    }

    #[test]
    fn text_roundtrip() {
        let (alice, bob) = paired();
        let (ct, iv) = alice.encrypt("hi", "100002").unwrap();
        assert_eq!(bob.decrypt(&ct, &iv, "100001").unwrap(), "hi");
    }

    #[test]
    fn bytes_roundtrip() {
        let (alice, bob) = paired();
        let image = vec![0xABu8; 4096];
        let (ct, iv) = bob.encrypt_bytes(&image, "100001").unwrap();
        assert_eq!(alice.decrypt_bytes(&ct, &iv, "100002").unwrap().as_slice(), &image[..]);
    }

    #[test]
    fn missing_key_is_no_session_key() {
        let alice = CryptoSession::new("100001").unwrap();
        assert!(matches!(
            alice.encrypt("hi", "100009"),
            Err(CryptoError::NoSessionKey(ref p)) if p == "100009"
        ));
        let iv = Iv([0u8; 12]);
        assert!(matches!(
            alice.decrypt(b"xxxxxxxxxxxxxxxxxxxx", &iv, "100009"),
            Err(CryptoError::NoSessionKey(_))
        ));
    }

    #[test]
    fn mismatched_key_fails_loudly() {
        let (alice, _bob) = paired();
        let mut carol = CryptoSession::new("100002").unwrap();
        carol.set_session_key("100001", SessionKey::generate().unwrap());
        let (ct, iv) = alice.encrypt("hi", "100002").unwrap();
        assert!(matches!(carol.decrypt(&ct, &iv, "100001"), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn reflected_ciphertext_rejected() {
        let (alice, _bob) = paired();
        let (ct, iv) = alice.encrypt("hi", "100002").unwrap();
        // Alice decrypting her own message as if Bob sent it
        assert!(alice.decrypt(&ct, &iv, "100002").is_err());
    }

    #[test]
    fn clear_session_key() {
        let (mut alice, _bob) = paired();
        assert!(alice.has_session_key("100002"));
        assert!(alice.clear_session_key("100002"));
        assert!(!alice.has_session_key("100002"));
        assert!(!alice.clear_session_key("100002"));
    }
}
