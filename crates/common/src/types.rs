use serde::{Deserialize, Serialize};

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dm,
    Group,
}

impl ChatType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Group => "group",
        }
    }
}

/// A reply produced by the reply pipeline, ready for channel delivery.
///
/// A payload may carry text, media, or both. Text is delivered first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    /// Member ids to @-mention alongside the text (group chats).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
}

impl ReplyPayload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media.push(media);
        self
    }

    /// True when there is neither non-blank text nor media to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.media.is_empty() && self.text.as_deref().is_none_or(|t| t.trim().is_empty())
    }
}

/// A reference to a piece of outbound media plus the hints used to pick
/// the wire message shape for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Send as a voice note even when the content type says otherwise.
    pub as_voice: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Voice or video length in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticker_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticker_size: Option<u64>,
}

impl MediaRef {
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_payload_is_empty() {
        assert!(ReplyPayload::default().is_empty());
        assert!(ReplyPayload::text("  \n").is_empty());
        assert!(!ReplyPayload::text("hi").is_empty());
        assert!(!ReplyPayload::default().with_media(MediaRef::url("https://x/a.png")).is_empty());
    }

    #[test]
    fn payload_deserializes_with_defaults() {
        let payload: ReplyPayload = serde_json::from_str(
            r#"{"media":[{"url":"https://cdn.example/a.mp3","content_type":"audio/mpeg"}]}"#,
        )
        .unwrap();
        assert!(payload.text.is_none());
        assert_eq!(payload.media.len(), 1);
        assert!(!payload.media[0].as_voice);
        assert_eq!(payload.media[0].content_type.as_deref(), Some("audio/mpeg"));
    }
}
