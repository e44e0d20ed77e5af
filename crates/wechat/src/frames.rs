//! JSON frames exchanged with the robot backend.

use {
    moltis_channels::gating::Mention,
    serde::{Deserialize, Serialize},
};

/// One chat message pushed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundEvent {
    pub msg_id: i64,
    pub msg_type: i64,
    pub content: Option<String>,
    #[serde(alias = "fromWxid")]
    pub sender_wxid: String,
    #[serde(alias = "roomWxid")]
    pub chat_wxid: String,
    pub is_group: bool,
    pub is_at_me: Mention,
    pub sender_name: Option<String>,
    pub timestamp: i64,
}

impl InboundEvent {
    /// Message text, or empty when the backend sent none.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// Where replies to this event go: the room for group messages, the
    /// sender for DMs.
    #[must_use]
    pub fn reply_target(&self) -> &str {
        // DM chat ids are sometimes the robot's own wxid, so DMs always go
        // back to the sender.
        if self.is_group || self.sender_wxid.is_empty() {
            &self.chat_wxid
        } else {
            &self.sender_wxid
        }
    }
}

/// Frames received from the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Message {
        data: InboundEvent,
    },
    Ping,
    Error {
        #[serde(default)]
        message: String,
    },
    Auth {
        #[serde(default)]
        status: serde_json::Value,
        #[serde(default)]
        message: Option<String>,
    },
    SendResult {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        message_id: Option<serde_json::Value>,
    },
}

/// Why a text frame could not be turned into a [`ServerFrame`].
#[derive(Debug)]
pub enum DecodeError {
    /// Not JSON, or a known kind with the wrong shape.
    Malformed(serde_json::Error),
    /// Well-formed JSON with a `type` this bridge does not handle.
    UnknownKind(String),
}

const KNOWN_KINDS: &[&str] = &["message", "ping", "error", "auth", "send_result"];

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        if !KNOWN_KINDS.contains(&kind) {
            return Err(DecodeError::UnknownKind(kind.to_string()));
        }
        serde_json::from_value(value).map_err(DecodeError::Malformed)
    }
}

/// Commands sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Auth {
        robot_wxid: String,
    },
    SendText {
        to_wxid: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        at: Option<Vec<String>>,
    },
    SendImage {
        to_wxid: String,
        image_url: String,
    },
    SendVoice {
        to_wxid: String,
        url: String,
        duration: u32,
    },
    SendVideo {
        to_wxid: String,
        url: String,
        thumb_url: String,
        duration: u32,
    },
    SendFile {
        to_wxid: String,
        url: String,
        file_name: String,
    },
    SendEmoji {
        to_wxid: String,
        md5: String,
        size: u64,
    },
    MarkProcessed {
        message_ids: Vec<i64>,
    },
    QueryContacts {
        contact_type: String,
    },
}
