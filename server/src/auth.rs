//! Wallet login and session management.
//!
//! Signature verification is delegated to the chain seam
//! (`personal_ecRecover` on the signing endpoint); this module only
//! compares the recovered wallet with the claimed one and manages the
//! opaque session tokens.

use std::sync::Arc;

use rand::RngCore;

use arena_chain::ChainT;
use arena_core::error::{Error, Result};
use arena_core::types::{Address, Session, User};
use arena_storage::Store;

const SESSION_TTL_SECS: i64 = 24 * 3600;

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct AuthService {
    store: Arc<Store>,
    chain: Arc<dyn ChainT>,
}

impl AuthService {
    pub fn new(store: Arc<Store>, chain: Arc<dyn ChainT>) -> Self {
        Self { store, chain }
    }

    /// Verify a signed login message and issue a session.
    pub async fn login(&self, wallet: &str, message: &str, signature: &str) -> Result<(User, Session)> {
        let wallet = Address::parse(wallet)?;
        let recovered = self
            .chain
            .recover_signer(message, signature)
            .await
            .map_err(|_| Error::InvalidSession)?;
        if recovered != wallet {
            return Err(Error::InvalidSession);
        }
        let user = self.store.get_or_create_user(&wallet).await?;
        let session = self
            .store
            .create_session(user.id, &generate_token(), SESSION_TTL_SECS)
            .await?;
        Ok((user, session))
    }

    pub async fn authenticate(&self, token: &str) -> Result<(User, Session)> {
        let session = self
            .store
            .get_session_by_token(token)
            .await?
            .ok_or(Error::InvalidSession)?;
        if session.expires_at <= chrono::Utc::now() {
            self.store.delete_session(token).await?;
            return Err(Error::SessionExpired);
        }
        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .ok_or(Error::InvalidSession)?;
        Ok((user, session))
    }

    /// Rotate the token; the old one stops working immediately.
    pub async fn rotate(&self, session: &Session) -> Result<String> {
        let token = generate_token();
        self.store.rotate_session(session.id, &token).await?;
        Ok(token)
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.store.delete_session(token).await
    }
}
