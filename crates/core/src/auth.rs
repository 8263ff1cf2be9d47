//! Authenticator contract and a secure-store backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::Result;
use crate::secrets::SecureStore;

// Storage key prefix for per-connection institution tokens.
const BANK_TOKEN_KEY_PREFIX: &str = "bank_token_";

/// Institution access token issued by a provider handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn is_authenticated(&self) -> Result<bool>;
    async fn get_token(&self, connection_id: &str) -> Result<Option<AccessToken>>;
    async fn set_token(&self, connection_id: &str, token: AccessToken) -> Result<()>;
    async fn clear_token(&self, connection_id: &str) -> Result<()>;
}

/// Keeps institution tokens in the secure store, keyed by connection id.
///
/// The user session flag is owned by whatever signs the user in (biometric
/// gate, password prompt); this type only records it.
pub struct StoreBackedAuthenticator {
    store: Arc<dyn SecureStore>,
    session_active: AtomicBool,
}

impl StoreBackedAuthenticator {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            session_active: AtomicBool::new(false),
        }
    }

    pub fn sign_in(&self) {
        self.session_active.store(true, Ordering::SeqCst);
    }

    pub fn sign_out(&self) {
        self.session_active.store(false, Ordering::SeqCst);
    }

    fn token_key(connection_id: &str) -> String {
        format!("{}{}", BANK_TOKEN_KEY_PREFIX, connection_id)
    }
}

#[async_trait]
impl Authenticator for StoreBackedAuthenticator {
    async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.session_active.load(Ordering::SeqCst))
    }

    async fn get_token(&self, connection_id: &str) -> Result<Option<AccessToken>> {
        match self
            .store
            .get_encrypted(&Self::token_key(connection_id))
            .await?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_token(&self, connection_id: &str, token: AccessToken) -> Result<()> {
        let bytes = serde_json::to_vec(&token)?;
        self.store
            .set_encrypted(&Self::token_key(connection_id), &bytes)
            .await?;
        debug!("[Auth] Stored access token for connection {}", connection_id);
        Ok(())
    }

    async fn clear_token(&self, connection_id: &str) -> Result<()> {
        self.store
            .remove_encrypted(&Self::token_key(connection_id))
            .await?;
        debug!("[Auth] Cleared access token for connection {}", connection_id);
        Ok(())
    }
}
