use serde::{Deserialize, Deserializer, Serialize};

/// Allowlist entry that matches every identifier.
pub const WILDCARD: &str = "*";

/// Normalizes backend identifiers for allowlist comparison.
///
/// Identifiers are trimmed, lower-cased, and stripped of any of the
/// channel's own scheme prefixes (e.g. `wechat:`), so `WeChat:WXID_a`
/// and `wxid_a` compare equal.
#[derive(Debug, Clone, Copy)]
pub struct IdNormalizer {
    prefixes: &'static [&'static str],
}

impl IdNormalizer {
    /// `prefixes` must be lower-case and include the trailing `:`.
    #[must_use]
    pub const fn new(prefixes: &'static [&'static str]) -> Self {
        Self { prefixes }
    }

    #[must_use]
    pub fn normalize(&self, id: &str) -> String {
        let mut out = id.trim().to_lowercase();
        // Prefixes may be stacked (`wechat:wx:abc`).
        while let Some(rest) = self
            .prefixes
            .iter()
            .find_map(|p| out.strip_prefix(p).map(str::to_owned))
        {
            out = rest.trim_start().to_owned();
        }
        out
    }

    /// Strip scheme prefixes without changing case. Used for outbound
    /// targets, where the backend treats ids case-sensitively.
    #[must_use]
    pub fn strip_prefixes<'a>(&self, id: &'a str) -> &'a str {
        let mut out = id.trim();
        loop {
            let lower = out.to_ascii_lowercase();
            match self.prefixes.iter().find(|p| lower.starts_with(**p)) {
                Some(p) => out = out[p.len()..].trim_start(),
                None => return out,
            }
        }
    }

    /// True when `id` matches an allowlist entry after normalization, or the
    /// list contains [`WILDCARD`].
    ///
    /// An empty list allows nobody. Callers that want "open" semantics must
    /// say so through the policy, not through an empty list.
    #[must_use]
    pub fn is_allowed(&self, id: &str, allowlist: &[String]) -> bool {
        let id = self.normalize(id);
        allowlist.iter().any(|entry| {
            let entry = entry.trim();
            entry == WILDCARD || (!id.is_empty() && self.normalize(entry) == id)
        })
    }
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Unknown senders get a pairing code; paired senders are allowed.
    #[default]
    Pairing,
    /// Only senders on the configured allowlist.
    Allowlist,
    /// Anyone can DM the bot.
    Open,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups (subject to mention gating).
    #[default]
    Open,
    /// Only in groups with an enabled entry, or for allowlisted members.
    Allowlist,
    /// Groups disabled.
    Disabled,
}

/// Tool allow/deny list handed to the agent layer for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPolicy {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Whether the backend flagged the bot as mentioned in a message.
///
/// Backends send this as a boolean, a number, or omit it entirely.
/// [`Mention::Unknown`] gates exactly like [`Mention::NotMentioned`], so a
/// group that requires mentions silently drops messages whose flag is
/// missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mention {
    Mentioned,
    NotMentioned,
    #[default]
    Unknown,
}

impl Mention {
    #[must_use]
    pub fn is_mentioned(self) -> bool {
        matches!(self, Self::Mentioned)
    }

    /// Combine two flags from merged messages: any mention wins.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Mentioned, _) | (_, Self::Mentioned) => Self::Mentioned,
            (Self::NotMentioned, _) | (_, Self::NotMentioned) => Self::NotMentioned,
            _ => Self::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for Mention {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(serde_json::Value::Bool(true)) => Self::Mentioned,
            Some(serde_json::Value::Bool(false)) => Self::NotMentioned,
            Some(serde_json::Value::Number(n)) => {
                if n.as_f64().is_some_and(|v| v != 0.0) {
                    Self::Mentioned
                } else {
                    Self::NotMentioned
                }
            },
            Some(serde_json::Value::String(s)) => match s.trim() {
                "true" | "1" => Self::Mentioned,
                "false" | "0" => Self::NotMentioned,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        })
    }
}
