//! Configuration for the session and realtime-channel core.
//!
//! Everything is plain serde data so a host application can load it from
//! whatever configuration source it uses and hand it to [`crate::ClientCore`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between renewal checks while authenticated
pub const DEFAULT_RENEWAL_CHECK_INTERVAL_SECS: u64 = 60;
/// Access tokens are renewed once they are within this many seconds of expiry
pub const DEFAULT_RENEWAL_THRESHOLD_SECS: i64 = 300;
/// Default heartbeat period while the channel is open
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Default reconnect attempt budget before the channel gives up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Base delay for the exponential reconnect backoff
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Top-level configuration for the core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    /// REST collaborator settings
    pub api: ApiConfig,
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Realtime channel settings
    pub channel: ChannelConfig,
}

/// Settings for the REST collaborator
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Base URL of the auth endpoints, e.g. `https://api.example.com`
    pub base_url: String,
    /// Tenant this client is scoped to
    pub tenant_id: String,
    /// Opaque per-device identifier sent with every request for anomaly
    /// tracking; supplied by the host platform
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds between scheduled renewal checks
    pub renewal_check_interval_secs: u64,
    /// Renewal fires once `expires_at - now` drops to this many seconds
    pub renewal_threshold_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_check_interval_secs: DEFAULT_RENEWAL_CHECK_INTERVAL_SECS,
            renewal_threshold_secs: DEFAULT_RENEWAL_THRESHOLD_SECS,
        }
    }
}

impl SessionConfig {
    /// Interval between renewal checks as a [`Duration`]
    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs)
    }
}

/// Realtime channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. `wss://api.example.com/ws/imports`
    pub url: String,
    /// Seconds between heartbeat pings while open
    pub heartbeat_interval_secs: u64,
    /// Reconnect attempts before the channel transitions to `Failed`
    pub max_reconnect_attempts: u32,
    /// Base delay in milliseconds for the exponential reconnect backoff
    pub reconnect_base_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
        }
    }
}

impl ChannelConfig {
    /// Heartbeat period as a [`Duration`]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Delay before (0-indexed) reconnect attempt `n`: `base * 2^n`,
    /// uncapped because the attempt budget is exhausted first.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms * 2u64.saturating_pow(attempt))
    }
}
