use moltis_channels::gating::{DmPolicy, GroupPolicy, ToolPolicy};

use crate::{
    WECHAT_IDS,
    config::{GroupConfig, WeChatAccountConfig},
    frames::InboundEvent,
};

/// Outcome of gating one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: Option<AccessDenied>,
    /// Whether this conversation requires an @-mention (always `false` for
    /// DMs).
    pub require_mention: bool,
    /// Tool restriction for the turn; `None` leaves the agent's defaults.
    pub tools: Option<ToolPolicy>,
}

impl PolicyDecision {
    fn allowed(require_mention: bool, tools: Option<ToolPolicy>) -> Self {
        Self {
            allow: true,
            reason: None,
            require_mention,
            tools,
        }
    }

    fn denied(reason: AccessDenied, require_mention: bool) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            require_mention,
            tools: None,
        }
    }
}

/// Decide whether `event` may reach the reply pipeline.
///
/// `paired` holds senders approved through the pairing store; it is only
/// consulted under [`DmPolicy::Pairing`]. The allowlist policy is strict
/// and reads the configured list alone.
pub fn evaluate(
    event: &InboundEvent,
    config: &WeChatAccountConfig,
    paired: &[String],
) -> PolicyDecision {
    let sender = event.sender_wxid.trim();
    if sender.is_empty() {
        return PolicyDecision::denied(AccessDenied::MissingSender, false);
    }
    if event.is_group {
        check_group(event, sender, config)
    } else {
        check_dm(sender, config, paired)
    }
}

fn check_dm(sender: &str, config: &WeChatAccountConfig, paired: &[String]) -> PolicyDecision {
    match config.dm_policy {
        DmPolicy::Disabled => PolicyDecision::denied(AccessDenied::DmsDisabled, false),
        DmPolicy::Open => PolicyDecision::allowed(false, None),
        DmPolicy::Allowlist => {
            if WECHAT_IDS.is_allowed(sender, &config.allowlist) {
                PolicyDecision::allowed(false, None)
            } else {
                PolicyDecision::denied(AccessDenied::NotOnAllowlist, false)
            }
        },
        DmPolicy::Pairing => {
            if WECHAT_IDS.is_allowed(sender, &config.allowlist)
                || WECHAT_IDS.is_allowed(sender, paired)
            {
                PolicyDecision::allowed(false, None)
            } else {
                PolicyDecision::denied(AccessDenied::PairingRequired, false)
            }
        },
    }
}

fn check_group(event: &InboundEvent, sender: &str, config: &WeChatAccountConfig) -> PolicyDecision {
    let chat_id = event.chat_wxid.trim();
    if chat_id.is_empty() {
        return PolicyDecision::denied(AccessDenied::MissingChat, false);
    }

    let entry = config.group_entry(chat_id);
    let wildcard = config.wildcard_group();
    let require_mention = resolve_require_mention(config, entry, wildcard);

    match config.group_policy {
        GroupPolicy::Disabled => {
            return PolicyDecision::denied(AccessDenied::GroupsDisabled, require_mention);
        },
        GroupPolicy::Open => {
            if entry.is_some_and(|e| !e.is_enabled()) {
                return PolicyDecision::denied(AccessDenied::GroupDisabled, require_mention);
            }
        },
        GroupPolicy::Allowlist => {
            let group_allowed = match entry {
                // An explicit entry decides on its own; the wildcard only
                // covers groups without one.
                Some(e) if !e.is_enabled() => {
                    return PolicyDecision::denied(AccessDenied::GroupDisabled, require_mention);
                },
                Some(_) => true,
                None => wildcard.is_some_and(GroupConfig::is_enabled),
            };
            let member_allowed = !group_allowed
                && config
                    .group_member_allowlist(chat_id)
                    .is_some_and(|members| WECHAT_IDS.is_allowed(sender, members));
            if !group_allowed && !member_allowed {
                return PolicyDecision::denied(
                    AccessDenied::GroupNotOnAllowlist,
                    require_mention,
                );
            }
        },
    }

    // Unknown gates like NotMentioned.
    if require_mention && !event.is_at_me.is_mentioned() {
        return PolicyDecision::denied(AccessDenied::NotMentioned, true);
    }

    PolicyDecision::allowed(require_mention, resolve_tools(sender, entry, wildcard))
}

fn resolve_require_mention(
    config: &WeChatAccountConfig,
    entry: Option<&GroupConfig>,
    wildcard: Option<&GroupConfig>,
) -> bool {
    entry
        .and_then(|e| e.require_mention)
        .or_else(|| wildcard.and_then(|w| w.require_mention))
        .or(config.require_mention)
        .unwrap_or(true)
}

/// Per-sender override, then the group's policy, then the wildcard's.
fn resolve_tools(
    sender: &str,
    entry: Option<&GroupConfig>,
    wildcard: Option<&GroupConfig>,
) -> Option<ToolPolicy> {
    let by_sender = |group: &GroupConfig| {
        let wanted = WECHAT_IDS.normalize(sender);
        group
            .tools_by_sender
            .iter()
            .find(|(id, _)| WECHAT_IDS.normalize(id) == wanted)
            .map(|(_, policy)| policy.clone())
    };
    entry
        .and_then(by_sender)
        .or_else(|| entry.and_then(|e| e.tools.clone()))
        .or_else(|| wildcard.and_then(|w| w.tools.clone()))
}

/// Reason an inbound message was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    MissingSender,
    MissingChat,
    DmsDisabled,
    NotOnAllowlist,
    PairingRequired,
    GroupsDisabled,
    GroupDisabled,
    GroupNotOnAllowlist,
    NotMentioned,
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSender => write!(f, "event has no sender id"),
            Self::MissingChat => write!(f, "group event has no chat id"),
            Self::DmsDisabled => write!(f, "DMs are disabled"),
            Self::NotOnAllowlist => write!(f, "user not on allowlist"),
            Self::PairingRequired => write!(f, "sender is not paired"),
            Self::GroupsDisabled => write!(f, "groups are disabled"),
            Self::GroupDisabled => write!(f, "group is disabled"),
            Self::GroupNotOnAllowlist => write!(f, "group not on allowlist"),
            Self::NotMentioned => write!(f, "bot was not mentioned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, moltis_channels::gating::Mention, rstest::rstest};

    fn cfg() -> WeChatAccountConfig {
        WeChatAccountConfig {
            server_url: "ws://127.0.0.1:8080".into(),
            robot_wxid: "wxid_bot".into(),
            ..Default::default()
        }
    }

    fn dm(sender: &str) -> InboundEvent {
        InboundEvent {
            msg_id: 1,
            content: Some("hi".into()),
            sender_wxid: sender.into(),
            chat_wxid: sender.into(),
            ..Default::default()
        }
    }

    fn group(chat: &str, sender: &str, mention: Mention) -> InboundEvent {
        InboundEvent {
            msg_id: 2,
            content: Some("hi".into()),
            sender_wxid: sender.into(),
            chat_wxid: chat.into(),
            is_group: true,
            is_at_me: mention,
            ..Default::default()
        }
    }

    fn group_entry(f: impl FnOnce(&mut GroupConfig)) -> GroupConfig {
        let mut g = GroupConfig::default();
        f(&mut g);
        g
    }

    #[test]
    fn missing_sender_is_denied() {
        let mut c = cfg();
        c.dm_policy = DmPolicy::Open;
        let d = evaluate(&dm(" "), &c, &[]);
        assert_eq!(d.reason, Some(AccessDenied::MissingSender));
    }

    #[rstest]
    #[case(DmPolicy::Open, "wxidB", true)]
    #[case(DmPolicy::Disabled, "wxidA", false)]
    #[case(DmPolicy::Allowlist, "wxidA", true)]
    #[case(DmPolicy::Allowlist, "WECHAT:WXIDA", true)]
    #[case(DmPolicy::Allowlist, "wxidB", false)]
    fn dm_policies(#[case] policy: DmPolicy, #[case] sender: &str, #[case] allowed: bool) {
        let mut c = cfg();
        c.dm_policy = policy;
        c.allowlist = vec!["wxidA".into()];
        assert_eq!(evaluate(&dm(sender), &c, &[]).allow, allowed);
    }

    #[test]
    fn allowlist_ignores_paired_senders() {
        let mut c = cfg();
        c.dm_policy = DmPolicy::Allowlist;
        let paired = vec!["wxid_paired".to_string()];
        let d = evaluate(&dm("wxid_paired"), &c, &paired);
        assert_eq!(d.reason, Some(AccessDenied::NotOnAllowlist));
    }

    #[test]
    fn pairing_merges_config_and_store() {
        let mut c = cfg();
        c.allowlist = vec!["wxid_config".into()];
        let paired = vec!["wxid_paired".to_string()];
        assert!(evaluate(&dm("wxid_config"), &c, &paired).allow);
        assert!(evaluate(&dm("wxid_paired"), &c, &paired).allow);
        assert_eq!(
            evaluate(&dm("wxid_new"), &c, &paired).reason,
            Some(AccessDenied::PairingRequired)
        );
    }

    #[test]
    fn dm_decisions_never_require_mention() {
        let mut c = cfg();
        c.dm_policy = DmPolicy::Open;
        c.require_mention = Some(true);
        let d = evaluate(&dm("wxid_a"), &c, &[]);
        assert!(d.allow);
        assert!(!d.require_mention);
        assert!(d.tools.is_none());
    }

    #[test]
    fn open_groups_default_to_mention_required() {
        let c = cfg();
        let d = evaluate(&group("g@chatroom", "wxid_a", Mention::NotMentioned), &c, &[]);
        assert_eq!(d.reason, Some(AccessDenied::NotMentioned));
        assert!(evaluate(&group("g@chatroom", "wxid_a", Mention::Mentioned), &c, &[]).allow);
    }

    #[test]
    fn unknown_mention_gates_like_not_mentioned() {
        let c = cfg();
        let d = evaluate(&group("g@chatroom", "wxid_a", Mention::Unknown), &c, &[]);
        assert!(!d.allow);

        let mut relaxed = cfg();
        relaxed.require_mention = Some(false);
        assert!(evaluate(&group("g@chatroom", "wxid_a", Mention::Unknown), &relaxed, &[]).allow);
    }

    #[test]
    fn allowlisted_group_still_needs_mention() {
        let mut c = cfg();
        c.group_policy = GroupPolicy::Allowlist;
        c.groups.insert(
            "G1".into(),
            group_entry(|g| g.require_mention = Some(true)),
        );
        let d = evaluate(&group("G1", "wxid_a", Mention::NotMentioned), &c, &[]);
        assert_eq!(d.reason, Some(AccessDenied::NotMentioned));
    }

    #[test]
    fn explicit_entry_beats_wildcard() {
        let mut c = cfg();
        c.group_policy = GroupPolicy::Allowlist;
        c.require_mention = Some(false);
        c.groups.insert("*".into(), GroupConfig::default());
        c.groups
            .insert("blocked@chatroom".into(), group_entry(|g| g.allow = Some(false)));

        assert!(evaluate(&group("other@chatroom", "wxid_a", Mention::Unknown), &c, &[]).allow);
        assert_eq!(
            evaluate(&group("blocked@chatroom", "wxid_a", Mention::Unknown), &c, &[]).reason,
            Some(AccessDenied::GroupDisabled)
        );
    }

    #[test]
    fn explicit_entry_allows_without_wildcard() {
        let mut c = cfg();
        c.group_policy = GroupPolicy::Allowlist;
        c.require_mention = Some(false);
        c.groups
            .insert("group:G2".into(), group_entry(|g| g.enabled = Some(true)));
        c.groups.insert("*".into(), group_entry(|g| g.enabled = Some(false)));
        assert!(evaluate(&group("G2", "wxid_a", Mention::Unknown), &c, &[]).allow);
        assert_eq!(
            evaluate(&group("G3", "wxid_a", Mention::Unknown), &c, &[]).reason,
            Some(AccessDenied::GroupNotOnAllowlist)
        );
    }

    #[test]
    fn member_allowlist_rescues_unlisted_group() {
        let mut c = cfg();
        c.group_policy = GroupPolicy::Allowlist;
        c.require_mention = Some(false);
        c.group_members
            .insert("G4".into(), vec!["wxid_member".into()]);
        assert!(evaluate(&group("G4", "WXID_MEMBER", Mention::Unknown), &c, &[]).allow);
        assert!(!evaluate(&group("G4", "wxid_stranger", Mention::Unknown), &c, &[]).allow);
        // DM allowlist does not apply to groups.
        c.allowlist = vec!["wxid_stranger".into()];
        assert!(!evaluate(&group("G4", "wxid_stranger", Mention::Unknown), &c, &[]).allow);
    }

    #[test]
    fn open_policy_respects_disabled_entry() {
        let mut c = cfg();
        c.require_mention = Some(false);
        c.groups
            .insert("muted@chatroom".into(), group_entry(|g| g.enabled = Some(false)));
        assert!(!evaluate(&group("muted@chatroom", "wxid_a", Mention::Mentioned), &c, &[]).allow);
    }

    #[test]
    fn disabled_groups_and_missing_chat() {
        let mut c = cfg();
        c.group_policy = GroupPolicy::Disabled;
        assert_eq!(
            evaluate(&group("G", "wxid_a", Mention::Mentioned), &c, &[]).reason,
            Some(AccessDenied::GroupsDisabled)
        );
        let c = cfg();
        assert_eq!(
            evaluate(&group("", "wxid_a", Mention::Mentioned), &c, &[]).reason,
            Some(AccessDenied::MissingChat)
        );
    }

    #[test]
    fn require_mention_precedence() {
        let mut c = cfg();
        c.require_mention = Some(true);
        c.groups
            .insert("*".into(), group_entry(|g| g.require_mention = Some(false)));
        c.groups
            .insert("strict".into(), group_entry(|g| g.require_mention = Some(true)));

        assert!(evaluate(&group("loose", "wxid_a", Mention::NotMentioned), &c, &[]).allow);
        assert!(!evaluate(&group("strict", "wxid_a", Mention::NotMentioned), &c, &[]).allow);
    }

    #[test]
    fn tool_policy_resolution_order() {
        let sender_policy = ToolPolicy {
            allow: vec!["web_fetch".into()],
            deny: vec![],
        };
        let group_policy = ToolPolicy {
            allow: vec![],
            deny: vec!["exec".into()],
        };
        let wildcard_policy = ToolPolicy {
            allow: vec![],
            deny: vec!["*".into()],
        };

        let mut c = cfg();
        c.require_mention = Some(false);
        c.groups.insert(
            "G".into(),
            group_entry(|g| {
                g.tools = Some(group_policy.clone());
                g.tools_by_sender
                    .insert("wechat:wxid_vip".into(), sender_policy.clone());
            }),
        );
        c.groups.insert(
            "*".into(),
            group_entry(|g| g.tools = Some(wildcard_policy.clone())),
        );

        let vip = evaluate(&group("G", "wxid_vip", Mention::Unknown), &c, &[]);
        assert_eq!(vip.tools, Some(sender_policy));
        let member = evaluate(&group("G", "wxid_a", Mention::Unknown), &c, &[]);
        assert_eq!(member.tools, Some(group_policy));
        let elsewhere = evaluate(&group("H", "wxid_a", Mention::Unknown), &c, &[]);
        assert_eq!(elsewhere.tools, Some(wildcard_policy));

        c.groups.clear();
        assert_eq!(evaluate(&group("H", "wxid_a", Mention::Unknown), &c, &[]).tools, None);
    }
}
