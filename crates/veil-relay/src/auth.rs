//! Collaborators the relay consumes: token authentication and the user
//! directory behind `lookup-user`.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use veil_proto::UserId;

use crate::config::DirectoryUser;
use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// `authenticate(credentialToken) -> userId`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, RelayError>;
}

/// Bearer tokens of the form `<user_id>.<hex hmac-sha256(user_id)>`.
pub struct HmacTokenAuthenticator {
    secret: Vec<u8>,
}

impl HmacTokenAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    fn mac(&self, user_id: &UserId) -> Result<HmacSha256, RelayError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RelayError::Auth(format!("mac init: {e}")))?;
        mac.update(user_id.as_str().as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, user_id: &UserId) -> Result<String, RelayError> {
        let tag = self.mac(user_id)?.finalize().into_bytes();
        Ok(format!("{}.{}", user_id, hex::encode(tag)))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, RelayError> {
        let (user_part, tag_hex) = token
            .split_once('.')
            .ok_or_else(|| RelayError::Auth("malformed token".into()))?;
        let user_id =
            UserId::parse(user_part).map_err(|_| RelayError::Auth("malformed token".into()))?;
        let tag = hex::decode(tag_hex).map_err(|_| RelayError::Auth("malformed token".into()))?;
        self.mac(&user_id)?
            .verify_slice(&tag)
            .map_err(|_| RelayError::Auth("bad signature".into()))?;
        Ok(user_id)
    }
}

#[async_trait]
impl Authenticator for HmacTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, RelayError> {
        self.verify(token)
    }
}

/// `lookupUser(userId) -> displayName`. Presence is layered on top by the
/// relay.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, user_id: &UserId) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: HashMap<UserId, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries, rejecting malformed ids.
    pub fn from_entries(entries: &[DirectoryUser]) -> Result<Self, RelayError> {
        let mut dir = Self::new();
        for entry in entries {
            dir.insert(UserId::parse(&entry.user_id)?, entry.display_name.clone());
        }
        Ok(dir)
    }

    pub fn insert(&mut self, user_id: UserId, display_name: impl Into<String>) {
        self.users.insert(user_id, display_name.into());
    }
}

impl UserDirectory for StaticDirectory {
    fn display_name(&self, user_id: &UserId) -> Option<String> {
        self.users.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> HmacTokenAuthenticator {
        HmacTokenAuthenticator::new(b"0123456789abcdef0123456789abcdef".to_vec())
    }

    #[tokio::test]
    async fn issued_token_authenticates() {
        let auth = auth();
        let alice = UserId::parse("100001").unwrap();
        let token = auth.issue(&alice).unwrap();
        assert_eq!(auth.authenticate(&token).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn token_for_other_user_rejected() {
        let auth = auth();
        let token = auth.issue(&UserId::parse("100001").unwrap()).unwrap();
        let (_, tag) = token.split_once('.').unwrap();
        let forged = format!("200002.{tag}");
        assert!(matches!(auth.authenticate(&forged).await, Err(RelayError::Auth(_))));
        assert!(matches!(auth.authenticate("garbage").await, Err(RelayError::Auth(_))));
    }

    #[test]
    fn directory_from_config() {
        let dir = StaticDirectory::from_entries(&[DirectoryUser {
            user_id: "100001".into(),
            display_name: "alice".into(),
        }])
        .unwrap();
        assert_eq!(dir.display_name(&UserId::parse("100001").unwrap()).as_deref(), Some("alice"));
        assert!(StaticDirectory::from_entries(&[DirectoryUser {
            user_id: "alice".into(),
            display_name: "alice".into(),
        }])
        .is_err());
    }
}
