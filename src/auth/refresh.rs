//! Single-flight coordination of token refresh calls.
//!
//! Multiple independent triggers can race a refresh (the scheduled renewal
//! check, a 401 retry, a manual call). On a backend that rotates refresh
//! tokens, two concurrent exchanges would consume the same refresh token
//! twice and invalidate one of the results, so at most one network refresh is
//! ever in flight: later callers await the same pending result.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::auth::api::AuthApi;
use crate::auth::storage::{StoredTokens, TokenStore};
use crate::auth::token::AuthTokens;
use crate::error::{CoreError, CoreResult};

/// Deduplicates concurrent refresh attempts into one network call
pub struct TokenRefreshCoordinator {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    // In-flight result slot. Present only while a refresh is running; taken
    // before the settled result is broadcast, so a stale handle can never
    // satisfy a caller that arrives after settlement.
    inflight: Mutex<Option<broadcast::Sender<CoreResult<AuthTokens>>>>,
}

impl TokenRefreshCoordinator {
    /// Create a coordinator over the given collaborators
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            api,
            store,
            inflight: Mutex::new(None),
        }
    }

    /// Exchange the stored refresh token for a new token pair.
    ///
    /// If a refresh is already running the caller receives the same pending
    /// result instead of issuing a duplicate network call. The durable store
    /// is written before the result is released, so a crash never observes
    /// memory ahead of storage.
    pub async fn refresh(&self) -> CoreResult<AuthTokens> {
        let follower = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *slot = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = follower {
            debug!("Refresh already in flight, awaiting shared result");
            return match rx.recv().await {
                Ok(result) => result,
                // The leader dropped without settling; treat as a failure
                Err(_) => Err(CoreError::refresh("in-flight refresh was abandoned")),
            };
        }

        let result = self.perform_refresh().await;

        // Clear the slot before releasing waiters; a new caller arriving now
        // starts a fresh network call instead of reusing this one.
        let settled = self.inflight.lock().await.take();
        if let Some(tx) = settled {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn perform_refresh(&self) -> CoreResult<AuthTokens> {
        let stored = self
            .store
            .load()
            .await?
            .ok_or(CoreError::NoRefreshToken)?;
        if stored.refresh_token.is_empty() {
            return Err(CoreError::NoRefreshToken);
        }

        debug!("Exchanging refresh token for a new access token");
        let response = self
            .api
            .refresh(&stored.refresh_token)
            .await
            .map_err(|e| {
                warn!(error = %e, "Refresh exchange failed");
                CoreError::refresh(e.to_string())
            })?;

        // The server only sometimes rotates the refresh token
        let refresh_token = response
            .refresh_token
            .unwrap_or_else(|| stored.refresh_token.clone());
        let tokens =
            AuthTokens::from_expires_in(response.access_token, refresh_token, response.expires_in);

        self.store
            .save(&StoredTokens::from_tokens(&tokens, stored.tenant_id))
            .await?;

        info!(
            expires_in_secs = tokens.seconds_until_expiration(),
            "Access token refreshed"
        );
        Ok(tokens)
    }
}
