//! Realtime import-progress channel: wire protocol, subscription registry,
//! transport seam and the reconnecting channel driver.

pub mod channel;
pub mod protocol;
pub mod subscriptions;
pub mod transport;

pub use channel::{ConnectionState, RealtimeChannel};
pub use protocol::{ImportProgress, InboundMessage, OutboundFrame};
pub use subscriptions::{ProgressHandler, SubscriptionRegistry};
pub use transport::{ChannelConnection, ChannelTransport, WebSocketTransport};
