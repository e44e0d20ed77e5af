use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {tokio::task::JoinHandle, tokio_util::sync::CancellationToken};

use moltis_channels::{
    ChannelEventSink, PlainTables, TableConverter,
    message_log::MessageLog,
    pairing::PairingStore,
    session::SessionRecorder,
    status::{self, AccountRuntimeStatus, StatusSink},
};

use crate::{
    CHANNEL_TYPE, client::WeChatClient, config::WeChatAccountConfig, debounce::InboundDebouncer,
};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: Arc<WeChatAccountConfig>,
    pub client: WeChatClient,
    pub debouncer: InboundDebouncer,
    /// Stops the account's event and turn tasks.
    pub cancel: CancellationToken,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Host-side collaborators shared by every account of the plugin.
#[derive(Clone)]
pub struct HostHandles {
    pub event_sink: Option<Arc<dyn ChannelEventSink>>,
    pub pairing: Option<Arc<dyn PairingStore>>,
    pub sessions: Option<Arc<dyn SessionRecorder>>,
    pub status: Option<Arc<dyn StatusSink>>,
    pub message_log: Option<Arc<dyn MessageLog>>,
    pub tables: Arc<dyn TableConverter>,
}

impl Default for HostHandles {
    fn default() -> Self {
        Self {
            event_sink: None,
            pairing: None,
            sessions: None,
            status: None,
            message_log: None,
            tables: Arc::new(PlainTables),
        }
    }
}

impl HostHandles {
    /// Read-modify-write the account's runtime status, if a sink is wired.
    pub fn update_status(&self, account_id: &str, update: impl FnOnce(&mut AccountRuntimeStatus)) {
        if let Some(sink) = &self.status {
            status::update_status(sink.as_ref(), CHANNEL_TYPE, account_id, update);
        }
    }
}

/// Current wall-clock time in epoch seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
