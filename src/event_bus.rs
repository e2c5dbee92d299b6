use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, trace, warn};

use crate::auth::token::SessionStateKind;
use crate::realtime::channel::ConnectionState;

/// Default capacity for the core event bus
pub const EVENT_BUS_CAPACITY: usize = 100;

/// Why the session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    /// The user asked to log out
    UserRequested,
    /// The refresh exchange failed terminally
    TokenRefreshFailed,
    /// The profile fetch failed after a successful refresh
    ProfileFetchFailed,
    /// Another process or tab removed the stored tokens
    ExternalInvalidation,
}

/// Events the core emits for the host application. The core never assumes a
/// particular presentation layer; UI side effects (navigation, toasts) hang
/// off these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// The session state machine moved to a new state
    SessionChanged {
        /// The state that was entered
        state: SessionStateKind,
    },
    /// The session was torn down
    LoggedOut {
        /// Why the teardown happened
        reason: LogoutReason,
    },
    /// A refresh completed and new tokens are in effect
    TokenRefreshed,
    /// The access token is approaching expiry
    TokenExpiring {
        /// Seconds until the access token expires
        expires_in_secs: u64,
    },
    /// The realtime channel changed connection state
    ConnectionChanged {
        /// The state the channel entered
        state: ConnectionState,
    },
    /// The server confirmed a batch subscription
    SubscriptionConfirmed {
        /// Batch the confirmation is for
        batch_id: String,
    },
    /// User-facing error reported over the realtime channel
    ChannelError {
        /// Human-readable message from the server
        message: String,
        /// Batch the error relates to, if any
        batch_id: Option<String>,
    },
}

impl CoreEvent {
    /// Short name used for statistics and logging
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::SessionChanged { .. } => "session_changed",
            CoreEvent::LoggedOut { .. } => "logged_out",
            CoreEvent::TokenRefreshed => "token_refreshed",
            CoreEvent::TokenExpiring { .. } => "token_expiring",
            CoreEvent::ConnectionChanged { .. } => "connection_changed",
            CoreEvent::SubscriptionConfirmed { .. } => "subscription_confirmed",
            CoreEvent::ChannelError { .. } => "channel_error",
        }
    }
}

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events successfully published
    pub events_published: u64,
    /// Number of events dropped (no receivers)
    pub events_dropped: u64,
    /// Count of events by kind
    pub kind_counts: HashMap<String, u64>,
}

/// Central bus distributing [`CoreEvent`]s from the session machine and the
/// realtime channel to any number of host-side subscribers.
pub struct EventBus {
    /// The broadcast channel sender
    sender: broadcast::Sender<CoreEvent>,
    /// Configured capacity of the channel
    capacity: usize,
    /// Statistics about event bus activity
    stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating core event bus");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    /// Get a receiver to subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        trace!("New subscriber registered to event bus");
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. A bus with no receivers is not
    /// an error; the event is counted as dropped.
    pub async fn publish(&self, event: CoreEvent) -> usize {
        let kind = event.kind();
        trace!(kind = %kind, "Publishing core event");

        match self.sender.send(event) {
            Ok(receivers) => {
                let mut stats = self.stats.write().await;
                stats.events_published += 1;
                *stats.kind_counts.entry(kind.to_string()).or_insert(0) += 1;
                receivers
            }
            Err(_) => {
                let mut stats = self.stats.write().await;
                stats.events_dropped += 1;
                warn!(kind = %kind, "No receivers for core event, message dropped");
                0
            }
        }
    }

    /// Get current event bus statistics
    pub async fn stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }

    /// Get the configured capacity of the event bus
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
            stats: Arc::clone(&self.stats),
        }
    }
}
