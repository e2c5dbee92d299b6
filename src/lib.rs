//! Client-side core for the invoice/PO/receipt matching app: session and
//! token lifecycle, permission checks, and the realtime import-progress
//! channel. UI layers embed [`ClientCore`] and react to [`CoreEvent`]s.

pub mod auth;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod realtime;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use tracing::info;

pub use auth::{
    AuthApi, AuthTokens, Credentials, HttpAuthClient, JsonFileTokenStore, LoginOutcome,
    MemoryTokenStore, MfaChallenge, ProfileUpdate, SessionManager, SessionState,
    SessionStateKind, TokenStore, User,
};
pub use config::{ApiConfig, ChannelConfig, CoreConfig, SessionConfig};
pub use error::{CoreError, CoreResult};
pub use event_bus::{CoreEvent, EventBus, LogoutReason};
pub use realtime::{
    ConnectionState, ImportProgress, ProgressHandler, RealtimeChannel, WebSocketTransport,
};

/// Top-level handle wiring the session manager and realtime channel over a
/// shared event bus. Lifecycle is explicit: construct, `initialize`, use,
/// `shutdown`.
pub struct ClientCore {
    event_bus: Arc<EventBus>,
    session: SessionManager,
    channel: RealtimeChannel,
}

impl ClientCore {
    /// Build a core over the production HTTP and WebSocket transports with
    /// an in-memory token store
    pub fn new(config: CoreConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryTokenStore::new()))
    }

    /// Build a core with a caller-provided token store (for example
    /// [`JsonFileTokenStore`] for persistence across restarts)
    pub fn with_store(config: CoreConfig, store: Arc<dyn TokenStore>) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let api = Arc::new(HttpAuthClient::new(config.api.clone()));
        let session = SessionManager::new(
            api,
            store,
            Arc::clone(&event_bus),
            config.session.clone(),
            config.api.tenant_id.clone(),
        );
        let channel = RealtimeChannel::new(
            Arc::new(WebSocketTransport),
            config.channel.clone(),
            config.api.tenant_id.clone(),
            Arc::clone(&event_bus),
        );
        Self {
            event_bus,
            session,
            channel,
        }
    }

    /// Restore any persisted session and start background maintenance
    pub async fn initialize(&self) -> CoreResult<()> {
        self.session.initialize().await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Open the realtime channel using the current session's access token
    pub async fn connect_realtime(&self) -> CoreResult<()> {
        let token = self
            .session
            .access_token()
            .await
            .ok_or_else(|| CoreError::illegal_state("connect_realtime", "unauthenticated"))?;
        self.channel.connect(&token).await
    }

    /// Stop the channel and all session background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down client core");
        self.channel.disconnect().await;
        self.session.shutdown().await;
    }
}
