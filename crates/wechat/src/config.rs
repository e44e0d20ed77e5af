use std::{collections::HashMap, time::Duration};

use {
    moltis_channels::gating::{DmPolicy, GroupPolicy, ToolPolicy, WILDCARD},
    serde::{Deserialize, Serialize},
    url::Url,
};

use crate::{
    chunk::ChunkMode,
    error::{Error, Result},
};

/// Default maximum characters per outbound text frame.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4000;

/// Configuration for a single WeChat robot account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeChatAccountConfig {
    /// Backend base address, e.g. `ws://127.0.0.1:8080`.
    pub server_url: String,

    /// The robot's own wxid on the backend.
    pub robot_wxid: String,

    /// DM access policy.
    pub dm_policy: DmPolicy,

    /// Sender allowlist for DMs.
    pub allowlist: Vec<String>,

    /// Group access policy.
    pub group_policy: GroupPolicy,

    /// Per-group settings keyed by chatroom id (or `*`).
    pub groups: HashMap<String, GroupConfig>,

    /// Per-group member allowlists, consulted when the group itself is not
    /// allowlisted.
    pub group_members: HashMap<String, Vec<String>>,

    /// Account-level mention requirement for groups (default: required).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_mention: Option<bool>,

    /// Maximum characters per outbound text frame.
    pub text_chunk_limit: usize,

    /// How long text is split into frames.
    pub chunk_mode: ChunkMode,

    /// Idle window for merging bursts from one sender; 0 disables it.
    pub debounce_ms: u64,

    /// Deliver reply payloads as soon as the pipeline produces them.
    pub streaming: bool,

    /// Acknowledge dispatched messages with a `mark_processed` frame.
    pub mark_processed: bool,

    pub reconnect: ReconnectConfig,
}

impl Default for WeChatAccountConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            robot_wxid: String::new(),
            dm_policy: DmPolicy::default(),
            allowlist: Vec::new(),
            group_policy: GroupPolicy::default(),
            groups: HashMap::new(),
            group_members: HashMap::new(),
            require_mention: None,
            text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            chunk_mode: ChunkMode::default(),
            debounce_ms: 0,
            streaming: false,
            mark_processed: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Per-group overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GroupConfig {
    /// `false` blocks the group even under an open policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<bool>,
    /// Alias of `allow`; either set to `false` disables the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_mention: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPolicy>,
    /// Tool overrides keyed by sender id.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tools_by_sender: HashMap<String, ToolPolicy>,
}

impl GroupConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.allow != Some(false) && self.enabled != Some(false)
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reconnects attempted before the account gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect number `attempt` (zero-based):
    /// `min(initial * 2^attempt, max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl WeChatAccountConfig {
    /// Check the fields an account cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::config("server_url is required"));
        }
        if self.robot_wxid.trim().is_empty() {
            return Err(Error::config("robot_wxid is required"));
        }
        if self.text_chunk_limit == 0 {
            return Err(Error::config("text_chunk_limit must be greater than 0"));
        }
        self.robot_url().map(drop)
    }

    /// `ws(s)://host:port/ws/robot/{robot_wxid}`.
    pub fn robot_url(&self) -> Result<Url> {
        let mut url = Url::parse(self.server_url.trim())
            .map_err(|e| Error::config(format!("invalid server_url '{}': {e}", self.server_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "server_url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        url.path_segments_mut()
            .map_err(|()| Error::config("server_url cannot be a base"))?
            .pop_if_empty()
            .extend(["ws", "robot", self.robot_wxid.trim()]);
        Ok(url)
    }

    /// Look up a group entry by id, `group:`-prefixed alias, or
    /// case-insensitive id. Does not fall back to the wildcard entry.
    #[must_use]
    pub fn group_entry(&self, chat_id: &str) -> Option<&GroupConfig> {
        lookup(&self.groups, chat_id)
    }

    #[must_use]
    pub fn wildcard_group(&self) -> Option<&GroupConfig> {
        self.groups.get(WILDCARD)
    }

    #[must_use]
    pub fn group_member_allowlist(&self, chat_id: &str) -> Option<&[String]> {
        lookup(&self.group_members, chat_id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectConfig {
        self.reconnect.clone()
    }

    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, chat_id: &str) -> Option<&'a V> {
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        return None;
    }
    let bare = chat_id.strip_prefix("group:").unwrap_or(chat_id);
    map.get(chat_id)
        .or_else(|| map.get(bare))
        .or_else(|| map.get(&format!("group:{bare}")))
        .or_else(|| {
            let wanted = crate::WECHAT_IDS.normalize(bare);
            map.iter()
                .filter(|(k, _)| k.as_str() != WILDCARD)
                .find(|(k, _)| {
                    crate::WECHAT_IDS.normalize(k.strip_prefix("group:").unwrap_or(k)) == wanted
                })
                .map(|(_, v)| v)
        })
}
