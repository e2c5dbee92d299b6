//! Session lifecycle state machine.
//!
//! `SessionManager` is the single owner of "who is the current user". It
//! orchestrates login, MFA step-up, logout, profile updates and scheduled
//! token renewal, mirrors the durable token store in memory, and reacts to
//! out-of-band token removal by other session holders. Instances are
//! explicitly constructed and disposed so tests can run isolated copies.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::api::{
    AuthApi, AuthenticatedSession, LoginOutcome, MfaSetup, ProfileUpdate, SessionInfo,
};
use crate::auth::permissions;
use crate::auth::refresh::TokenRefreshCoordinator;
use crate::auth::storage::{StoreEvent, StoredTokens, TokenStore};
use crate::auth::token::{AuthTokens, Credentials, SessionState, SessionStateKind, User};
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus, LogoutReason};

/// Orchestrates the authenticated-session lifecycle
pub struct SessionManager {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    coordinator: Arc<TokenRefreshCoordinator>,
    event_bus: Arc<EventBus>,
    config: SessionConfig,
    tenant_id: String,
    state: Arc<RwLock<SessionState>>,
    renewal_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    watcher_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

// All state lives behind Arcs, so clones share one session
impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            event_bus: Arc::clone(&self.event_bus),
            config: self.config.clone(),
            tenant_id: self.tenant_id.clone(),
            state: Arc::clone(&self.state),
            renewal_task: Arc::clone(&self.renewal_task),
            watcher_task: Arc::clone(&self.watcher_task),
        }
    }
}

impl SessionManager {
    /// Create a session manager over the given collaborators
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<dyn TokenStore>,
        event_bus: Arc<EventBus>,
        config: SessionConfig,
        tenant_id: impl Into<String>,
    ) -> Self {
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            Arc::clone(&api),
            Arc::clone(&store),
        ));
        Self {
            api,
            store,
            coordinator,
            event_bus,
            config,
            tenant_id: tenant_id.into(),
            state: Arc::new(RwLock::new(SessionState::Unauthenticated)),
            renewal_task: Arc::new(RwLock::new(None)),
            watcher_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Restore the session from the durable store and start the renewal and
    /// store-watch loops. Called once at process start.
    pub async fn initialize(&self) -> CoreResult<()> {
        info!("Initializing session");

        let stored = match self.store.load().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read token store, starting unauthenticated");
                None
            }
        };

        match stored {
            None => {
                debug!("No stored tokens found");
                self.set_state(SessionState::Unauthenticated).await;
            }
            Some(stored) => {
                let tokens = if stored.is_expired() {
                    debug!("Stored access token is expired, attempting refresh");
                    match self.coordinator.refresh().await {
                        Ok(tokens) => tokens,
                        Err(e) => {
                            warn!(error = %e, "Refresh of expired token failed");
                            self.teardown(LogoutReason::TokenRefreshFailed).await;
                            self.spawn_background_tasks().await;
                            return Ok(());
                        }
                    }
                } else {
                    stored.to_tokens()
                };

                match self.api.fetch_profile(&tokens.access_token).await {
                    Ok(profile) => {
                        info!(user_id = %profile.user.id, "Session restored");
                        self.set_state(SessionState::Authenticated {
                            user: profile.user,
                            tokens,
                            permissions: profile.permissions.into_iter().collect(),
                        })
                        .await;
                    }
                    Err(e) => {
                        // Hard failure even right after a successful refresh:
                        // a session whose profile cannot be read is not
                        // trustworthy.
                        error!(error = %e, "Profile fetch failed during initialization");
                        self.teardown(LogoutReason::ProfileFetchFailed).await;
                    }
                }
            }
        }

        self.spawn_background_tasks().await;
        Ok(())
    }

    /// Attempt a primary-credential login.
    ///
    /// Returns the completed session or the MFA challenge; a failure leaves
    /// the machine in `Unauthenticated`, never in `Authenticating`.
    pub async fn login(&self, credentials: Credentials) -> CoreResult<LoginOutcome> {
        self.set_state(SessionState::Authenticating).await;

        match self.api.login(&credentials).await {
            Ok(LoginOutcome::Completed(session)) => {
                self.persist_and_authenticate(session.clone()).await?;
                info!(user_id = %session.user.id, "Login completed");
                Ok(LoginOutcome::Completed(session))
            }
            Ok(LoginOutcome::MfaRequired(challenge)) => {
                // No tokens exist yet; nothing is persisted for this branch
                info!(user_id = %challenge.user_id, "Login requires MFA step-up");
                self.set_state(SessionState::MfaPending(challenge.clone()))
                    .await;
                Ok(LoginOutcome::MfaRequired(challenge))
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.set_state(SessionState::Unauthenticated).await;
                Err(e)
            }
        }
    }

    /// Submit the one-time code for the pending MFA challenge.
    ///
    /// Valid only while `MfaPending`; on failure the same challenge stays
    /// pending so the caller may retry with a new code.
    pub async fn verify_mfa(&self, code: &str) -> CoreResult<()> {
        let challenge = match &*self.state.read().await {
            SessionState::MfaPending(challenge) => challenge.clone(),
            other => {
                return Err(CoreError::illegal_state(
                    "verify_mfa",
                    other.kind().to_string(),
                ))
            }
        };

        match self.api.verify_mfa(&challenge, code).await {
            Ok(session) => {
                let user_id = session.user.id.clone();
                self.persist_and_authenticate(session).await?;
                info!(user_id = %user_id, "MFA verification completed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "MFA verification failed, challenge remains pending");
                Err(e)
            }
        }
    }

    /// Log out. The server notification is best-effort; local teardown is
    /// unconditional, so local state is never inconsistent with a reachable
    /// backend even under a network partition.
    pub async fn logout(&self, all_devices: bool) -> CoreResult<()> {
        self.logout_with_reason(all_devices, LogoutReason::UserRequested)
            .await;
        Ok(())
    }

    async fn logout_with_reason(&self, all_devices: bool, reason: LogoutReason) {
        if let Some(token) = self.access_token().await {
            if let Err(e) = self.api.logout(&token, all_devices).await {
                warn!(error = %e, "Logout notification failed, proceeding with local teardown");
            }
        }
        self.teardown(reason).await;
    }

    /// Force a coordinated token refresh.
    ///
    /// Terminal failure forces a logout and re-raises, so callers never
    /// observe a silently stale session.
    pub async fn refresh(&self) -> CoreResult<AuthTokens> {
        match self.coordinator.refresh().await {
            Ok(tokens) => {
                {
                    let mut state = self.state.write().await;
                    if let SessionState::Authenticated {
                        tokens: current, ..
                    } = &mut *state
                    {
                        *current = tokens.clone();
                    }
                }
                self.event_bus.publish(CoreEvent::TokenRefreshed).await;
                Ok(tokens)
            }
            Err(e) => {
                error!(error = %e, "Token refresh failed, forcing logout");
                self.logout_with_reason(false, LogoutReason::TokenRefreshFailed)
                    .await;
                Err(e)
            }
        }
    }

    /// Update the profile and replace the local user record with the
    /// server's canonical response (never merged locally).
    pub async fn update_profile(&self, update: ProfileUpdate) -> CoreResult<User> {
        if !self.state.read().await.is_authenticated() {
            return Err(CoreError::illegal_state(
                "update_profile",
                self.state_kind().await.to_string(),
            ));
        }

        let api = Arc::clone(&self.api);
        let profile = self
            .with_auth_retry(move |token| {
                let api = Arc::clone(&api);
                let update = update.clone();
                async move { api.update_profile(&token, &update).await }
            })
            .await?;

        let applied = {
            let mut state = self.state.write().await;
            if let SessionState::Authenticated {
                user, permissions, ..
            } = &mut *state
            {
                *user = profile.user.clone();
                *permissions = profile.permissions.iter().cloned().collect();
                true
            } else {
                false
            }
        };
        if applied {
            self.event_bus
                .publish(CoreEvent::SessionChanged {
                    state: SessionStateKind::Authenticated,
                })
                .await;
        }
        Ok(profile.user)
    }

    /// Begin TOTP enrollment for the current user
    pub async fn mfa_setup(&self) -> CoreResult<MfaSetup> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.mfa_setup(&token).await }
        })
        .await
    }

    /// Confirm enrollment with a code from the authenticator app
    pub async fn mfa_enable(&self, code: &str) -> CoreResult<()> {
        let api = Arc::clone(&self.api);
        let code = code.to_string();
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            let code = code.clone();
            async move { api.mfa_enable(&token, &code).await }
        })
        .await
    }

    /// Turn MFA off for the current user, confirmed with a current code
    pub async fn mfa_disable(&self, code: &str) -> CoreResult<()> {
        let api = Arc::clone(&self.api);
        let code = code.to_string();
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            let code = code.clone();
            async move { api.mfa_disable(&token, &code).await }
        })
        .await
    }

    /// List the active sessions for the current user
    pub async fn sessions(&self) -> CoreResult<Vec<SessionInfo>> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.sessions(&token).await }
        })
        .await
    }

    /// Terminate one of the user's other sessions
    pub async fn terminate_session(&self, session_id: &str) -> CoreResult<()> {
        let api = Arc::clone(&self.api);
        let session_id = session_id.to_string();
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            let session_id = session_id.clone();
            async move { api.terminate_session(&token, &session_id).await }
        })
        .await
    }

    /// Run an authenticated request; on a 401 await one coordinated refresh
    /// and retry exactly once before surfacing the failure.
    pub async fn with_auth_retry<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let token = match self.access_token().await {
            Some(token) => token,
            None => {
                return Err(CoreError::illegal_state(
                    "authenticated_request",
                    self.state_kind().await.to_string(),
                ))
            }
        };

        match op(token).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Request rejected with 401, refreshing once and retrying");
                let tokens = self.refresh().await?;
                op(tokens.access_token).await
            }
            other => other,
        }
    }

    /// Check one permission against the current set; pure and safe to call
    /// in any state (empty set when unauthenticated)
    pub async fn has_permission(&self, required: &str) -> bool {
        permissions::evaluate(&self.permission_set().await, required)
    }

    /// Logical OR over the required permissions
    pub async fn has_any_permission(&self, required: &[&str]) -> bool {
        permissions::has_any(&self.permission_set().await, required)
    }

    /// Logical AND over the required permissions
    pub async fn has_all_permissions(&self, required: &[&str]) -> bool {
        permissions::has_all(&self.permission_set().await, required)
    }

    /// Current state discriminant
    pub async fn state_kind(&self) -> SessionStateKind {
        self.state.read().await.kind()
    }

    /// Current user, if authenticated
    pub async fn current_user(&self) -> Option<User> {
        match &*self.state.read().await {
            SessionState::Authenticated { user, .. } => Some(user.clone()),
            _ => None,
        }
    }

    /// Current access token, if authenticated
    pub async fn access_token(&self) -> Option<String> {
        match &*self.state.read().await {
            SessionState::Authenticated { tokens, .. } => Some(tokens.access_token.clone()),
            _ => None,
        }
    }

    /// Stop the renewal and store-watch loops
    pub async fn shutdown(&self) {
        if let Some(handle) = self.renewal_task.write().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.watcher_task.write().await.take() {
            handle.abort();
        }
        debug!("Session background tasks stopped");
    }

    async fn permission_set(&self) -> HashSet<String> {
        match &*self.state.read().await {
            SessionState::Authenticated { permissions, .. } => permissions.clone(),
            _ => HashSet::new(),
        }
    }

    /// Persist tokens durably, then mirror them in memory. The durable copy
    /// is written first so a crash never observes memory ahead of storage.
    async fn persist_and_authenticate(&self, session: AuthenticatedSession) -> CoreResult<()> {
        let refresh_token = session.tokens.refresh_token.clone().unwrap_or_default();
        let tokens = AuthTokens::from_expires_in(
            session.tokens.access_token.clone(),
            refresh_token,
            session.tokens.expires_in,
        );

        self.store
            .save(&StoredTokens::from_tokens(&tokens, self.tenant_id.clone()))
            .await?;

        self.set_state(SessionState::Authenticated {
            user: session.user,
            tokens,
            permissions: session.permissions.into_iter().collect(),
        })
        .await;
        Ok(())
    }

    /// Unconditional local teardown: clear the durable store, reset state,
    /// announce the logout. The logout is announced if there was anything to
    /// tear down, in memory or in the store; during restore the state is
    /// still `Unauthenticated` while stored tokens exist, and the store
    /// watcher racing an explicit logout finds both already empty, so the
    /// teardown publishes exactly once.
    async fn teardown(&self, reason: LogoutReason) {
        // Store and state are torn down under the state write lock, so the
        // store watcher reacting to this clear blocks until the state is
        // already `Unauthenticated` and backs off
        let (had_tokens, was_active) = {
            let mut state = self.state.write().await;
            let had_tokens = matches!(self.store.load().await, Ok(Some(_)));
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Failed to clear token store during teardown");
            }
            let was_active = !matches!(*state, SessionState::Unauthenticated);
            *state = SessionState::Unauthenticated;
            (had_tokens, was_active)
        };
        if was_active {
            self.event_bus
                .publish(CoreEvent::SessionChanged {
                    state: SessionStateKind::Unauthenticated,
                })
                .await;
        }
        if was_active || had_tokens {
            info!(reason = ?reason, "Session torn down");
            self.event_bus
                .publish(CoreEvent::LoggedOut { reason })
                .await;
        }
    }

    async fn set_state(&self, new_state: SessionState) {
        let kind = new_state.kind();
        {
            let mut state = self.state.write().await;
            *state = new_state;
        }
        debug!(state = %kind, "Session state changed");
        self.event_bus
            .publish(CoreEvent::SessionChanged { state: kind })
            .await;
    }

    async fn spawn_background_tasks(&self) {
        self.spawn_renewal_loop().await;
        self.spawn_store_watcher().await;
    }

    /// Periodic renewal check: while authenticated, refresh once the access
    /// token is within the configured threshold of expiry. Failures are
    /// logged; the loop itself never dies.
    async fn spawn_renewal_loop(&self) {
        let mut slot = self.renewal_task.write().await;
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.renewal_check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; skip it so the first check
            // happens one interval after startup
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let due = match &*manager.state.read().await {
                    SessionState::Authenticated { tokens, .. }
                        if tokens
                            .needs_renewal_at(Utc::now(), manager.config.renewal_threshold_secs) =>
                    {
                        Some(tokens.seconds_until_expiration().max(0) as u64)
                    }
                    _ => None,
                };

                if let Some(expires_in_secs) = due {
                    debug!(expires_in_secs, "Access token within renewal threshold");
                    manager
                        .event_bus
                        .publish(CoreEvent::TokenExpiring { expires_in_secs })
                        .await;
                    if let Err(e) = manager.refresh().await {
                        warn!(error = %e, "Scheduled token renewal failed");
                    }
                }
            }
        });
        *slot = Some(handle);
    }

    /// Watch the durable store so token removal by any other session holder
    /// (another tab or process clearing the shared store) is treated as an
    /// implicit logout, without explicit message passing between holders.
    async fn spawn_store_watcher(&self) {
        let mut slot = self.watcher_task.write().await;
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        let mut watch = self.store.watch();
        let handle = tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(StoreEvent::TokensCleared) => {
                        if manager.state.read().await.is_authenticated() {
                            info!("Stored tokens removed externally, tearing down session");
                            manager.teardown(LogoutReason::ExternalInvalidation).await;
                        }
                    }
                    Ok(StoreEvent::TokensSaved) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store watcher lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *slot = Some(handle);
    }
}
