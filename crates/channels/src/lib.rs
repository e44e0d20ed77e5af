//! Channel plugin system.
//!
//! Each messaging backend implements the [`ChannelPlugin`] trait with
//! sub-traits for outbound messaging and status. The host side of a channel
//! (reply generation, pairing, sessions, status reporting) is reached only
//! through the collaborator traits defined here, so channel crates stay
//! testable without a live host.

pub mod error;
pub mod gating;
pub mod message_log;
pub mod pairing;
pub mod plugin;
pub mod registry;
pub mod session;
pub mod status;

pub use {
    error::{Error, Result},
    plugin::{
        ChannelEvent, ChannelEventSink, ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin,
        ChannelReplyTarget, ChannelStatus, ChannelTurn, PlainTables, ReplySender,
        TableConverter,
    },
    registry::ChannelRegistry,
};
