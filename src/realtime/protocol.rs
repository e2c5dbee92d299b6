//! Wire protocol for the realtime channel.
//!
//! Every frame is a JSON object with a `type` discriminator. Unknown inbound
//! types deserialize into `InboundMessage::Unknown` so a newer server never
//! breaks an older client.

use serde::{Deserialize, Serialize};

/// Client-to-server frames
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    SubscribeImport { batch_id: String },
    UnsubscribeImport { batch_id: String },
    GetProgress { batch_id: String },
    Ping,
}

/// Progress snapshot for one import batch.
///
/// The server may omit fields on partial updates; missing values fall back
/// to a fresh "pending" snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportProgress {
    pub batch_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub progress_percentage: f64,
    #[serde(default)]
    pub processed_rows: u64,
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_status() -> String {
    "pending".to_string()
}

impl ImportProgress {
    /// Terminal snapshot synthesized from a server-reported import failure
    pub fn failed(batch_id: String, message: String) -> Self {
        Self {
            batch_id,
            status: "error".to_string(),
            progress_percentage: 100.0,
            processed_rows: 0,
            total_rows: 0,
            message: Some(message),
        }
    }
}

/// Server-to-client frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ConnectionEstablished {
        #[serde(default)]
        connection_id: Option<String>,
    },
    ImportProgress {
        #[serde(flatten)]
        progress: ImportProgress,
    },
    ImportStatusChange {
        #[serde(flatten)]
        progress: ImportProgress,
    },
    ImportError {
        batch_id: String,
        #[serde(default)]
        message: Option<String>,
    },
    SubscriptionConfirmed {
        batch_id: String,
    },
    Pong,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}
