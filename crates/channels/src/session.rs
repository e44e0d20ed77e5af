use async_trait::async_trait;

use crate::{ChannelReplyTarget, ChannelTurn, Result};

/// Conversation-history collaborator. Storage lives in the host.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    /// Record an inbound turn against the conversation's session.
    async fn record_inbound(&self, turn: &ChannelTurn) -> Result<()>;

    /// Epoch seconds of the session's last update, if it exists.
    async fn last_updated(&self, target: &ChannelReplyTarget) -> Result<Option<i64>>;
}
