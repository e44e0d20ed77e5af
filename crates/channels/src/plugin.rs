use {
    async_trait::async_trait,
    moltis_common::types::{ChatType, ReplyPayload},
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::{Result, gating::ToolPolicy};

// ── Channel events (pub/sub) ────────────────────────────────────────────────

/// Events emitted by channel plugins for real-time UI updates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    InboundMessage {
        channel_type: String,
        account_id: String,
        peer_id: String,
        chat_id: String,
        sender_name: Option<String>,
        access_granted: bool,
    },
    /// A pairing code was issued to an unknown DM sender.
    PairingRequested {
        channel_type: String,
        account_id: String,
        peer_id: String,
        sender_name: Option<String>,
        code: String,
    },
    /// A channel account stopped itself after an unrecoverable runtime error.
    AccountDisabled {
        channel_type: String,
        account_id: String,
        reason: String,
    },
}

/// Sender half handed to the reply pipeline for one turn.
pub type ReplySender = mpsc::Sender<ReplyPayload>;

/// Sink for channel events; the gateway provides the concrete implementation.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    /// Broadcast a channel event for real-time UI updates.
    async fn emit(&self, event: ChannelEvent);

    /// Submit an authorized turn to the reply pipeline.
    ///
    /// The pipeline pushes zero or more payloads into `replies` and returns
    /// once it has produced everything for this turn. Dropping `replies`
    /// marks the end of the reply.
    async fn dispatch_turn(&self, turn: ChannelTurn, replies: ReplySender) -> anyhow::Result<()>;
}

/// Where to send the reply back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReplyTarget {
    pub channel_type: String,
    pub account_id: String,
    /// Chat/peer ID to send the reply to.
    pub chat_id: String,
}

/// One authorized logical turn, possibly merged from several messages.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelTurn {
    pub reply_to: ChannelReplyTarget,
    pub chat_type: ChatType,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub mentioned: bool,
    /// Backend message ids folded into this turn, in arrival order.
    pub message_ids: Vec<i64>,
    /// Tool restriction resolved by access policy; `None` means the
    /// agent's defaults apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPolicy>,
    pub timestamp: i64,
    /// When the conversation's session was last updated before this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_turn_at: Option<i64>,
}

/// Converts markdown tables into something the backend can render.
pub trait TableConverter: Send + Sync {
    fn convert_tables(&self, account_id: &str, text: &str) -> String;
}

/// Leaves text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTables;

impl TableConverter for PlainTables {
    fn convert_tables(&self, _account_id: &str, text: &str) -> String {
        text.to_string()
    }
}

/// Core channel plugin trait. Each messaging backend implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "wechat").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start an account connection. Restarts the account if already running.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Stop an account connection.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Operator-facing sends. Implementations fail on missing media metadata
/// instead of degrading.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;
    async fn send_media(&self, account_id: &str, to: &str, payload: &ReplyPayload) -> Result<()>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}
