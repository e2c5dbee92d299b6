//! Durable persistence for the session token pair.
//!
//! The store is the sole source of truth read at process start. Every write
//! is a full overwrite of the whole record so the access and refresh tokens
//! can never disagree on freshness, and every mutation is observable through
//! a watch channel — removal of the tokens by any other holder of the store
//! (another tab or process in the same family) is treated by the session
//! machine as an implicit logout.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::auth::token::AuthTokens;
use crate::error::{CoreError, CoreResult};

/// Capacity of the store watch channel
const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Durable token record. `expires_at_ms` is epoch milliseconds, matching the
/// persisted key contract shared with the other session holders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    /// Bearer token for API requests
    pub access_token: String,
    /// Token used to obtain new access tokens
    pub refresh_token: String,
    /// Access token expiry as epoch milliseconds
    pub expires_at_ms: i64,
    /// Tenant the session is scoped to
    pub tenant_id: String,
}

impl StoredTokens {
    /// Build a durable record from an in-memory token pair
    pub fn from_tokens(tokens: &AuthTokens, tenant_id: impl Into<String>) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at_ms: tokens.expires_at.timestamp_millis(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Expiry as a UTC instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.expires_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// In-memory mirror of this record
    pub fn to_tokens(&self) -> AuthTokens {
        AuthTokens {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at(),
        }
    }

    /// Whether the stored access token is already expired
    pub fn is_expired(&self) -> bool {
        self.expires_at() <= Utc::now()
    }
}

/// Change notification emitted by a token store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A full token record was written
    TokensSaved,
    /// The token record was removed
    TokensCleared,
}

/// Durable local key/value persistence of the session tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Read the stored record, if any
    async fn load(&self) -> CoreResult<Option<StoredTokens>>;

    /// Overwrite the stored record in one write
    async fn save(&self, tokens: &StoredTokens) -> CoreResult<()>;

    /// Remove the stored record
    async fn clear(&self) -> CoreResult<()>;

    /// Subscribe to store mutations, including those made by other holders
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// In-memory store used in tests and by hosts that keep sessions ephemeral
pub struct MemoryTokenStore {
    tokens: RwLock<Option<StoredTokens>>,
    changes: broadcast::Sender<StoreEvent>,
}

impl MemoryTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            tokens: RwLock::new(None),
            changes,
        }
    }

    /// Create a store pre-seeded with a record
    pub fn with_tokens(tokens: StoredTokens) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            tokens: RwLock::new(Some(tokens)),
            changes,
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> CoreResult<Option<StoredTokens>> {
        Ok(self.tokens.read().await.clone())
    }

    async fn save(&self, tokens: &StoredTokens) -> CoreResult<()> {
        *self.tokens.write().await = Some(tokens.clone());
        let _ = self.changes.send(StoreEvent::TokensSaved);
        debug!("Tokens stored in memory");
        Ok(())
    }

    async fn clear(&self) -> CoreResult<()> {
        let removed = self.tokens.write().await.take().is_some();
        if removed {
            let _ = self.changes.send(StoreEvent::TokensCleared);
            debug!("Tokens removed from memory store");
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }
}

/// File-backed store persisting the record as a small JSON document. Writes
/// go through a temp file rename so a crash mid-write never leaves a torn
/// record behind.
pub struct JsonFileTokenStore {
    path: PathBuf,
    // Serializes writers; the file itself is the durable copy
    lock: Arc<RwLock<()>>,
    changes: broadcast::Sender<StoreEvent>,
}

impl JsonFileTokenStore {
    /// Create a store persisting to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            lock: Arc::new(RwLock::new(())),
            changes,
        }
    }
}

#[async_trait]
impl TokenStore for JsonFileTokenStore {
    async fn load(&self) -> CoreResult<Option<StoredTokens>> {
        let _guard = self.lock.read().await;
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::storage_with_source("failed to read token file", e)),
        };
        let tokens = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::storage_with_source("token file is corrupt", e))?;
        debug!(path = %self.path.display(), "Tokens loaded from file store");
        Ok(Some(tokens))
    }

    async fn save(&self, tokens: &StoredTokens) -> CoreResult<()> {
        let _guard = self.lock.write().await;
        let raw = serde_json::to_vec_pretty(tokens)
            .map_err(|e| CoreError::storage_with_source("failed to serialize tokens", e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to write token file", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to replace token file", e))?;
        let _ = self.changes.send(StoreEvent::TokensSaved);
        info!(path = %self.path.display(), "Tokens stored durably");
        Ok(())
    }

    async fn clear(&self) -> CoreResult<()> {
        let _guard = self.lock.write().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                let _ = self.changes.send(StoreEvent::TokensCleared);
                info!(path = %self.path.display(), "Tokens removed from file store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::storage_with_source("failed to remove token file", e)),
        }
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }
}
