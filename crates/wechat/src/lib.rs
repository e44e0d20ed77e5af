//! WeChat robot bridge channel plugin for moltis.
//!
//! Implements `ChannelPlugin` on top of a robot backend reachable over a
//! persistent WebSocket. Inbound frames are gated by access policy,
//! optionally coalesced per sender, and handed to the reply pipeline; reply
//! payloads flow back out as chunked text and typed media commands.

pub mod access;
pub mod chunk;
pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod frames;
pub mod handlers;
pub mod media;
pub mod outbound;
pub mod plugin;
pub mod state;

pub use {
    client::{ClientEvent, ConnectionState, ConnectionStatus, WeChatClient},
    config::WeChatAccountConfig,
    error::{Error, Result},
    plugin::WeChatPlugin,
};

/// Channel type identifier used in reply targets and events.
pub const CHANNEL_TYPE: &str = "wechat";

/// Normalizer for WeChat ids: the channel's own scheme tags are stripped.
pub const WECHAT_IDS: moltis_channels::gating::IdNormalizer =
    moltis_channels::gating::IdNormalizer::new(&["wechat:", "weixin:", "wx:"]);
