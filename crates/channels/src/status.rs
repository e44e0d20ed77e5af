use serde::Serialize;

/// Runtime status of one channel account, as shown to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountRuntimeStatus {
    pub account_id: String,
    pub running: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inbound_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outbound_at: Option<i64>,
    pub reconnect_attempts: u32,
}

impl AccountRuntimeStatus {
    #[must_use]
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }
}

/// Status surface owned by the host. Channels read-modify-write through it.
pub trait StatusSink: Send + Sync {
    fn get(&self, channel_type: &str, account_id: &str) -> Option<AccountRuntimeStatus>;
    fn set(&self, channel_type: &str, status: AccountRuntimeStatus);
}

/// Apply `update` to the account's current status (or a fresh one).
pub fn update_status(
    sink: &dyn StatusSink,
    channel_type: &str,
    account_id: &str,
    update: impl FnOnce(&mut AccountRuntimeStatus),
) {
    let mut status = sink
        .get(channel_type, account_id)
        .unwrap_or_else(|| AccountRuntimeStatus::new(account_id));
    update(&mut status);
    sink.set(channel_type, status);
}
