//! veil_crypto: client-side cryptography for Veil
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Keys never leave this crate as raw bytes except in wrapped form.
//!
//! # Module layout
//! - `identity`: per-process X25519 identity keypair + fingerprints
//! - `wrap`: sealed-box transport of a session key to a peer public key
//! - `aead`: AES-256-GCM encrypt/decrypt with caller-visible IV
//! - `kdf`: HKDF-SHA256
//! - `session`: `CryptoSession`: identity + per-peer session key table
//! - `error`: unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod session;
pub mod wrap;

pub use aead::{Iv, SessionKey, IV_LEN, KEY_LEN};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PeerPublicKey};
pub use session::CryptoSession;
