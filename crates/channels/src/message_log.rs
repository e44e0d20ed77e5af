use async_trait::async_trait;

use crate::Result;

/// A single logged inbound message.
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub account_id: String,
    pub channel_type: String,
    pub peer_id: String,
    pub sender_name: Option<String>,
    pub chat_id: String,
    pub chat_type: String,
    pub body: String,
    pub access_granted: bool,
    pub created_at: i64,
}

/// Persistent log of every inbound message, granted or not.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn log(&self, entry: MessageLogEntry) -> Result<()>;
}
