use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    async_trait::async_trait,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use moltis_channels::{
    ChannelEventSink, Result, TableConverter,
    message_log::MessageLog,
    pairing::PairingStore,
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus},
    session::SessionRecorder,
    status::{AccountRuntimeStatus, StatusSink},
};

use crate::{
    client::WeChatClient,
    config::WeChatAccountConfig,
    debounce::InboundDebouncer,
    error::Error,
    handlers::{self, AccountContext},
    outbound::WeChatOutbound,
    state::{AccountState, AccountStateMap, HostHandles},
};

/// WeChat robot bridge channel plugin.
pub struct WeChatPlugin {
    accounts: AccountStateMap,
    outbound: WeChatOutbound,
    host: HostHandles,
}

impl WeChatPlugin {
    pub fn new() -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let host = HostHandles::default();
        let outbound = WeChatOutbound {
            accounts: Arc::clone(&accounts),
            host: host.clone(),
        };
        Self {
            accounts,
            outbound,
            host,
        }
    }

    /// Receives channel events and turns for the reply pipeline.
    pub fn with_event_sink(mut self, sink: Arc<dyn ChannelEventSink>) -> Self {
        self.host.event_sink = Some(sink);
        self.rewire()
    }

    pub fn with_pairing_store(mut self, store: Arc<dyn PairingStore>) -> Self {
        self.host.pairing = Some(store);
        self.rewire()
    }

    pub fn with_session_recorder(mut self, sessions: Arc<dyn SessionRecorder>) -> Self {
        self.host.sessions = Some(sessions);
        self.rewire()
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.host.status = Some(status);
        self.rewire()
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.host.message_log = Some(log);
        self.rewire()
    }

    pub fn with_table_converter(mut self, tables: Arc<dyn TableConverter>) -> Self {
        self.host.tables = tables;
        self.rewire()
    }

    fn rewire(mut self) -> Self {
        self.outbound.host = self.host.clone();
        self
    }

    /// Get a shared reference to the outbound sender (for use outside the plugin).
    pub fn shared_outbound(&self) -> Arc<dyn ChannelOutbound> {
        Arc::new(self.outbound.clone())
    }

    /// List all active account IDs.
    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.keys().cloned().collect()
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.contains_key(account_id)
    }

    /// Get the config for a specific account (serialized to JSON).
    pub fn account_config(&self, account_id: &str) -> Option<serde_json::Value> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .and_then(|s| serde_json::to_value(s.config.as_ref()).ok())
    }

    /// The live connection client of an account.
    pub fn client(&self, account_id: &str) -> Option<WeChatClient> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).map(|s| s.client.clone())
    }

    /// Flush pending turns and wait for their replies, then close the socket
    /// and drop the account. Returns `false` when the account was not running.
    async fn teardown(&self, account_id: &str) -> bool {
        let running = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.get_mut(account_id).map(|s| {
                (
                    s.debouncer.clone(),
                    s.cancel.clone(),
                    std::mem::take(&mut s.tasks),
                )
            })
        };
        let Some((debouncer, cancel, tasks)) = running else {
            return false;
        };

        // The account stays registered and connected until the turn task
        // has dispatched the flushed turns and delivered their replies.
        debouncer.flush_account(account_id);
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(account_id, error = %e, "wechat account task failed");
            }
        }

        let state = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        if let Some(state) = state {
            state.client.disconnect();
        }
        self.host.update_status(account_id, |s| {
            s.running = false;
            s.connected = false;
        });
        true
    }

    /// Turns buffered by the debouncer for an account.
    pub fn pending_turns(&self, account_id: &str) -> usize {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .map_or(0, |s| s.debouncer.pending())
    }
}

impl Default for WeChatPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelPlugin for WeChatPlugin {
    fn id(&self) -> &str {
        crate::CHANNEL_TYPE
    }

    fn name(&self) -> &str {
        "WeChat"
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: WeChatAccountConfig = serde_json::from_value(config)
            .map_err(|e| Error::config(format!("invalid account config: {e}")))?;
        config.validate()?;

        if self.teardown(account_id).await {
            info!(account_id, "restarting wechat account");
        }

        let (client, events) = WeChatClient::new(account_id, &config)?;
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let debouncer = InboundDebouncer::new(config.debounce_window(), turn_tx);
        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let ctx = AccountContext {
            account_id: account_id.to_string(),
            config: Arc::clone(&config),
            client: client.clone(),
            debouncer: debouncer.clone(),
            outbound: self.outbound.clone(),
            host: self.host.clone(),
        };
        let tasks = vec![
            tokio::spawn(handlers::run_client_events(
                ctx.clone(),
                events,
                cancel.clone(),
            )),
            tokio::spawn(handlers::run_turns(ctx, turn_rx, cancel.clone())),
        ];

        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), AccountState {
                account_id: account_id.to_string(),
                config,
                client: client.clone(),
                debouncer,
                cancel,
                tasks,
            });
        }
        self.host.update_status(account_id, |s| {
            *s = AccountRuntimeStatus::new(account_id);
            s.running = true;
        });

        info!(account_id, url = %client.url(), "starting wechat account");
        // Transport failures are retried in the background.
        if let Err(e) = client.connect().await {
            warn!(account_id, error = %e, "initial wechat connect failed, will retry");
        }
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        if self.teardown(account_id).await {
            info!(account_id, "stopped wechat account");
        } else {
            warn!(account_id, "wechat account not found");
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for WeChatPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let Some(client) = self.client(account_id) else {
            return Ok(ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            });
        };
        let status = client.status();
        let mut details = format!("state: {}", status.state.as_str());
        if status.attempts > 0 {
            details.push_str(&format!(", reconnect attempts: {}", status.attempts));
        }
        if let Some(err) = &status.last_error {
            details.push_str(&format!(", last error: {err}"));
        }
        let pending = self.pending_turns(account_id);
        if pending > 0 {
            details.push_str(&format!(", buffered turns: {pending}"));
        }
        Ok(ChannelHealthSnapshot {
            connected: client.is_connected(),
            account_id: account_id.to_string(),
            details: Some(details),
        })
    }
}
