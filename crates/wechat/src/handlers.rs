//! Per-account tasks: client events in, authorized turns out.

use std::sync::Arc;

use {
    moltis_channels::{
        ChannelEvent, ChannelReplyTarget, ChannelTurn,
        gating::DmPolicy,
        message_log::MessageLogEntry,
    },
    moltis_common::types::{ChatType, ReplyPayload},
    tokio::{
        sync::mpsc,
        task::{JoinError, JoinSet},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

use crate::{
    CHANNEL_TYPE, WECHAT_IDS,
    access::{self, AccessDenied},
    client::{ClientEvent, WeChatClient},
    config::WeChatAccountConfig,
    debounce::{AdmittedEvent, DebouncedTurn, InboundDebouncer},
    frames::InboundEvent,
    media::DeliveryMode,
    outbound::WeChatOutbound,
    state::{HostHandles, unix_now},
};

/// Reply payloads buffered per turn before the pipeline blocks.
const REPLY_BUFFER: usize = 16;

/// Everything one account's tasks need. Handlers never look at other
/// accounts.
#[derive(Clone)]
pub(crate) struct AccountContext {
    pub account_id: String,
    pub config: Arc<WeChatAccountConfig>,
    pub client: WeChatClient,
    pub debouncer: InboundDebouncer,
    pub outbound: WeChatOutbound,
    pub host: HostHandles,
}

/// Drain client events until cancelled. Inbound messages are handled one at
/// a time, in arrival order.
pub(crate) async fn run_client_events(
    ctx: AccountContext,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_client_event(&ctx, event).await;
    }
    debug!(account_id = %ctx.account_id, "client event loop stopped");
}

async fn handle_client_event(ctx: &AccountContext, event: ClientEvent) {
    match event {
        ClientEvent::Connected => ctx.host.update_status(&ctx.account_id, |s| {
            s.running = true;
            s.connected = true;
            s.last_error = None;
            s.reconnect_attempts = 0;
        }),
        ClientEvent::Message(inbound) => handle_inbound(ctx, inbound).await,
        ClientEvent::Error(message) => ctx
            .host
            .update_status(&ctx.account_id, |s| s.last_error = Some(message)),
        ClientEvent::Disconnected => {
            let attempts = ctx.client.status().attempts;
            ctx.host.update_status(&ctx.account_id, |s| {
                s.connected = false;
                s.reconnect_attempts = attempts;
            });
        },
        ClientEvent::GaveUp { last_error } => {
            let reason = last_error
                .clone()
                .unwrap_or_else(|| "reconnect attempts exhausted".into());
            ctx.host.update_status(&ctx.account_id, |s| {
                s.running = false;
                s.connected = false;
                s.last_error = Some(reason.clone());
            });
            if let Some(sink) = &ctx.host.event_sink {
                sink.emit(ChannelEvent::AccountDisabled {
                    channel_type: CHANNEL_TYPE.into(),
                    account_id: ctx.account_id.clone(),
                    reason,
                })
                .await;
            }
        },
    }
}

/// Gate one inbound event and hand it to the debouncer if allowed.
pub(crate) async fn handle_inbound(ctx: &AccountContext, event: InboundEvent) {
    let account_id = ctx.account_id.as_str();

    if WECHAT_IDS.normalize(&event.sender_wxid) == WECHAT_IDS.normalize(&ctx.config.robot_wxid) {
        trace!(account_id, msg_id = event.msg_id, "ignoring own message");
        return;
    }

    ctx.host
        .update_status(account_id, |s| s.last_inbound_at = Some(unix_now()));

    let paired = if !event.is_group && ctx.config.dm_policy == DmPolicy::Pairing {
        paired_senders(ctx).await
    } else {
        Vec::new()
    };
    let decision = access::evaluate(&event, &ctx.config, &paired);

    debug!(
        account_id,
        chat_id = %event.chat_wxid,
        sender_id = %event.sender_wxid,
        is_group = event.is_group,
        mention = ?event.is_at_me,
        allow = decision.allow,
        "checked access"
    );

    if let Some(log) = &ctx.host.message_log {
        let entry = MessageLogEntry {
            account_id: account_id.to_string(),
            channel_type: CHANNEL_TYPE.into(),
            peer_id: event.sender_wxid.clone(),
            sender_name: event.sender_name.clone(),
            chat_id: event.chat_wxid.clone(),
            chat_type: chat_type(&event).as_str().into(),
            body: event.text().to_string(),
            access_granted: decision.allow,
            created_at: unix_now(),
        };
        if let Err(e) = log.log(entry).await {
            warn!(account_id, "failed to log message: {e}");
        }
    }

    if let Some(sink) = &ctx.host.event_sink {
        sink.emit(ChannelEvent::InboundMessage {
            channel_type: CHANNEL_TYPE.into(),
            account_id: account_id.to_string(),
            peer_id: event.sender_wxid.clone(),
            chat_id: event.chat_wxid.clone(),
            sender_name: event.sender_name.clone(),
            access_granted: decision.allow,
        })
        .await;
    }

    if let Some(reason) = decision.reason {
        info!(
            account_id,
            %reason,
            sender_id = %event.sender_wxid,
            chat_id = %event.chat_wxid,
            "access denied"
        );
        if reason == AccessDenied::PairingRequired {
            request_pairing(ctx, &event).await;
        }
        return;
    }

    ctx.debouncer.push(account_id, AdmittedEvent {
        event,
        tools: decision.tools,
    });
}

async fn paired_senders(ctx: &AccountContext) -> Vec<String> {
    let Some(store) = &ctx.host.pairing else {
        return Vec::new();
    };
    store
        .allow_list(CHANNEL_TYPE, &ctx.account_id)
        .await
        .unwrap_or_else(|e| {
            warn!(account_id = %ctx.account_id, error = %e, "failed to read pairing allow list");
            Vec::new()
        })
}

/// Issue (or look up) a pairing code. Only a newly created request is
/// answered, so repeat messages do not spam the sender.
async fn request_pairing(ctx: &AccountContext, event: &InboundEvent) {
    let account_id = ctx.account_id.as_str();
    let Some(store) = &ctx.host.pairing else {
        debug!(account_id, "no pairing store configured");
        return;
    };
    let request = match store
        .upsert_request(
            CHANNEL_TYPE,
            account_id,
            &event.sender_wxid,
            event.sender_name.as_deref(),
        )
        .await
    {
        Ok(request) => request,
        Err(e) => {
            warn!(account_id, error = %e, "failed to create pairing request");
            return;
        },
    };
    if !request.created {
        debug!(account_id, sender_id = %event.sender_wxid, "pairing request already pending");
        return;
    }

    info!(account_id, sender_id = %event.sender_wxid, "pairing code issued");
    if let Some(sink) = &ctx.host.event_sink {
        sink.emit(ChannelEvent::PairingRequested {
            channel_type: CHANNEL_TYPE.into(),
            account_id: account_id.to_string(),
            peer_id: event.sender_wxid.clone(),
            sender_name: event.sender_name.clone(),
            code: request.code.clone(),
        })
        .await;
    }

    let reply = ReplyPayload::text(pairing_message(&request.code));
    if let Err(e) = ctx
        .outbound
        .deliver(account_id, &event.sender_wxid, &reply, DeliveryMode::Lenient)
        .await
    {
        warn!(account_id, error = %e, "failed to send pairing code");
    }
}

fn pairing_message(code: &str) -> String {
    format!(
        "This bot only talks to approved contacts.\n\
         Pairing code: {code}\n\
         Ask the bot owner to approve it."
    )
}

fn chat_type(event: &InboundEvent) -> ChatType {
    if event.is_group {
        ChatType::Group
    } else {
        ChatType::Dm
    }
}

/// Drain debounced turns until cancelled, dispatching each concurrently.
///
/// On cancellation, turns already queued (from a teardown flush) are still
/// dispatched, and the loop returns only once every dispatch has finished.
pub(crate) async fn run_turns(
    ctx: AccountContext,
    mut turns: mpsc::UnboundedReceiver<DebouncedTurn>,
    cancel: CancellationToken,
) {
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            turn = turns.recv() => match turn {
                Some(turn) => {
                    inflight.spawn(dispatch_turn(ctx.clone(), turn));
                },
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(turn) = turns.try_recv() {
                    inflight.spawn(dispatch_turn(ctx.clone(), turn));
                }
                break;
            },
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                log_dispatch_failure(&ctx, joined);
            },
        }
    }
    while let Some(joined) = inflight.join_next().await {
        log_dispatch_failure(&ctx, joined);
    }
    debug!(account_id = %ctx.account_id, "turn loop stopped");
}

fn log_dispatch_failure(ctx: &AccountContext, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(account_id = %ctx.account_id, error = %e, "turn dispatch task failed");
    }
}

/// Submit one turn to the reply pipeline and deliver what it produces.
pub(crate) async fn dispatch_turn(ctx: AccountContext, turn: DebouncedTurn) {
    let account_id = ctx.account_id.as_str();
    let Some(sink) = ctx.host.event_sink.clone() else {
        warn!(account_id, "no event sink configured, dropping turn");
        return;
    };

    let event = &turn.event;
    let reply_to = ChannelReplyTarget {
        channel_type: CHANNEL_TYPE.into(),
        account_id: account_id.to_string(),
        chat_id: event.reply_target().to_string(),
    };

    let previous_turn_at = match &ctx.host.sessions {
        Some(sessions) => sessions.last_updated(&reply_to).await.unwrap_or_else(|e| {
            warn!(account_id, error = %e, "failed to read session timestamp");
            None
        }),
        None => None,
    };

    let channel_turn = ChannelTurn {
        reply_to: reply_to.clone(),
        chat_type: chat_type(event),
        sender_id: event.sender_wxid.clone(),
        sender_name: event.sender_name.clone(),
        text: event.text().to_string(),
        mentioned: event.is_at_me.is_mentioned(),
        message_ids: turn.message_ids.clone(),
        tools: turn.tools.clone(),
        timestamp: if event.timestamp > 0 {
            event.timestamp
        } else {
            unix_now()
        },
        previous_turn_at,
    };

    if let Some(sessions) = &ctx.host.sessions
        && let Err(e) = sessions.record_inbound(&channel_turn).await
    {
        warn!(account_id, error = %e, "failed to record inbound turn");
    }

    let (tx, mut rx) = mpsc::channel::<ReplyPayload>(REPLY_BUFFER);
    let streaming = ctx.config.streaming;
    let target = reply_to.chat_id.as_str();
    let delivery = async {
        let mut held = Vec::new();
        while let Some(payload) = rx.recv().await {
            if streaming {
                deliver_reply(&ctx, target, &payload).await;
            } else {
                held.push(payload);
            }
        }
        for payload in &held {
            deliver_reply(&ctx, target, payload).await;
        }
    };

    let (dispatched, ()) = tokio::join!(sink.dispatch_turn(channel_turn, tx), delivery);
    if let Err(e) = dispatched {
        warn!(account_id, chat_id = target, error = %e, "reply pipeline failed");
        return;
    }

    if ctx.config.mark_processed
        && let Err(e) = ctx.client.mark_processed(&turn.message_ids)
    {
        warn!(account_id, error = %e, "failed to acknowledge processed messages");
    }
}

async fn deliver_reply(ctx: &AccountContext, target: &str, payload: &ReplyPayload) {
    if payload.is_empty() {
        return;
    }
    if let Err(e) = ctx
        .outbound
        .deliver(&ctx.account_id, target, payload, DeliveryMode::Lenient)
        .await
    {
        warn!(account_id = %ctx.account_id, chat_id = target, error = %e, "reply delivery failed");
        ctx.host
            .update_status(&ctx.account_id, |s| s.last_error = Some(e.to_string()));
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        moltis_channels::{
            ChannelEventSink, ReplySender,
            gating::{GroupPolicy, Mention},
            pairing::InMemoryPairingStore,
            session::SessionRecorder,
            status::{AccountRuntimeStatus, StatusSink},
        },
        std::{
            collections::HashMap,
            sync::{Mutex, RwLock},
            time::Duration,
        },
    };

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChannelEvent>>,
        turns: Mutex<Vec<ChannelTurn>>,
    }

    impl RecordingSink {
        fn pairing_requests(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, ChannelEvent::PairingRequested { .. }))
                .count()
        }
    }

    #[async_trait]
    impl ChannelEventSink for RecordingSink {
        async fn emit(&self, event: ChannelEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn dispatch_turn(&self, turn: ChannelTurn, replies: ReplySender) -> anyhow::Result<()> {
            self.turns.lock().unwrap().push(turn);
            replies.send(ReplyPayload::text("ok")).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSessions {
        recorded: Mutex<Vec<ChannelTurn>>,
    }

    #[async_trait]
    impl SessionRecorder for RecordingSessions {
        async fn record_inbound(&self, turn: &ChannelTurn) -> moltis_channels::Result<()> {
            self.recorded.lock().unwrap().push(turn.clone());
            Ok(())
        }

        async fn last_updated(
            &self,
            _target: &ChannelReplyTarget,
        ) -> moltis_channels::Result<Option<i64>> {
            Ok(Some(1_700_000_000))
        }
    }

    #[derive(Default)]
    struct MapStatus(Mutex<HashMap<String, AccountRuntimeStatus>>);

    impl StatusSink for MapStatus {
        fn get(&self, _: &str, account_id: &str) -> Option<AccountRuntimeStatus> {
            self.0.lock().unwrap().get(account_id).cloned()
        }

        fn set(&self, _: &str, status: AccountRuntimeStatus) {
            self.0
                .lock()
                .unwrap()
                .insert(status.account_id.clone(), status);
        }
    }

    struct Harness {
        ctx: AccountContext,
        turns: mpsc::UnboundedReceiver<DebouncedTurn>,
        sink: Arc<RecordingSink>,
        sessions: Arc<RecordingSessions>,
        status: Arc<MapStatus>,
        pairing: Arc<InMemoryPairingStore>,
    }

    fn harness(config: WeChatAccountConfig) -> Harness {
        let (client, _events) = WeChatClient::new("main", &config).unwrap();
        let (turn_tx, turns) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::default());
        let sessions = Arc::new(RecordingSessions::default());
        let status = Arc::new(MapStatus::default());
        let pairing = Arc::new(InMemoryPairingStore::new());
        let host = HostHandles {
            event_sink: Some(sink.clone()),
            pairing: Some(pairing.clone()),
            sessions: Some(sessions.clone()),
            status: Some(status.clone()),
            ..Default::default()
        };
        let outbound = WeChatOutbound {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            host: host.clone(),
        };
        let ctx = AccountContext {
            account_id: "main".into(),
            config: Arc::new(config),
            client,
            debouncer: InboundDebouncer::new(Duration::ZERO, turn_tx),
            outbound,
            host,
        };
        Harness {
            ctx,
            turns,
            sink,
            sessions,
            status,
            pairing,
        }
    }

    fn config() -> WeChatAccountConfig {
        WeChatAccountConfig {
            server_url: "ws://127.0.0.1:9".into(),
            robot_wxid: "wxid_bot".into(),
            ..Default::default()
        }
    }

    fn dm(sender: &str, text: &str) -> InboundEvent {
        InboundEvent {
            msg_id: 10,
            content: Some(text.into()),
            sender_wxid: sender.into(),
            chat_wxid: "wxid_bot".into(),
            sender_name: Some("Alice".into()),
            timestamp: 1_700_000_100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn own_messages_are_dropped_silently() {
        let mut h = harness(WeChatAccountConfig {
            dm_policy: DmPolicy::Open,
            ..config()
        });
        handle_inbound(&h.ctx, dm("WeChat:wxid_bot", "echo")).await;
        assert!(h.turns.try_recv().is_err());
        assert!(h.sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allowed_dm_reaches_debouncer() {
        let mut h = harness(WeChatAccountConfig {
            dm_policy: DmPolicy::Open,
            ..config()
        });
        handle_inbound(&h.ctx, dm("wxid_a", "hello")).await;
        let turn = h.turns.try_recv().unwrap();
        assert_eq!(turn.event.text(), "hello");
        assert_eq!(turn.message_ids, vec![10]);

        let events = h.sink.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::InboundMessage { access_granted: true, .. }]
        ));
        let status = h.status.get(CHANNEL_TYPE, "main").unwrap();
        assert!(status.last_inbound_at.is_some());
    }

    #[tokio::test]
    async fn unpaired_dm_requests_pairing_once() {
        let mut h = harness(config());
        handle_inbound(&h.ctx, dm("wxid_new", "hi")).await;
        handle_inbound(&h.ctx, dm("wxid_new", "hello?")).await;
        assert!(h.turns.try_recv().is_err());
        assert_eq!(h.sink.pairing_requests(), 1);

        let code = h
            .sink
            .events
            .lock()
            .unwrap()
            .iter()
            .find_map(|e| match e {
                ChannelEvent::PairingRequested { code, .. } => Some(code.clone()),
                _ => None,
            })
            .unwrap();
        h.pairing.approve(CHANNEL_TYPE, "main", &code).unwrap();

        handle_inbound(&h.ctx, dm("wxid_new", "now?")).await;
        assert_eq!(h.turns.try_recv().unwrap().event.text(), "now?");
    }

    #[tokio::test]
    async fn group_denial_does_not_trigger_pairing() {
        let mut h = harness(WeChatAccountConfig {
            group_policy: GroupPolicy::Allowlist,
            ..config()
        });
        let event = InboundEvent {
            is_group: true,
            chat_wxid: "g@chatroom".into(),
            is_at_me: Mention::Mentioned,
            ..dm("wxid_a", "hi")
        };
        handle_inbound(&h.ctx, event).await;
        assert!(h.turns.try_recv().is_err());
        assert_eq!(h.sink.pairing_requests(), 0);
    }

    #[tokio::test]
    async fn dispatch_attaches_session_timestamp_and_records_turn() {
        let h = harness(config());
        let turn = DebouncedTurn {
            account_id: "main".into(),
            event: dm("wxid_a", "hello"),
            tools: None,
            message_ids: vec![10, 11],
        };
        dispatch_turn(h.ctx.clone(), turn).await;

        let dispatched = h.sink.turns.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        let turn = &dispatched[0];
        assert_eq!(turn.previous_turn_at, Some(1_700_000_000));
        assert_eq!(turn.reply_to.chat_id, "wxid_a");
        assert_eq!(turn.chat_type, ChatType::Dm);
        assert_eq!(turn.message_ids, vec![10, 11]);
        assert_eq!(turn.timestamp, 1_700_000_100);
        assert_eq!(h.sessions.recorded.lock().unwrap().len(), 1);

        // Delivery failed (no live account), which is surfaced in status.
        let status = h.status.get(CHANNEL_TYPE, "main").unwrap();
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn give_up_disables_account() {
        let h = harness(config());
        handle_client_event(&h.ctx, ClientEvent::Connected).await;
        assert!(h.status.get(CHANNEL_TYPE, "main").unwrap().running);

        handle_client_event(&h.ctx, ClientEvent::GaveUp {
            last_error: Some("connection refused".into()),
        })
        .await;
        let status = h.status.get(CHANNEL_TYPE, "main").unwrap();
        assert!(!status.running);
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("connection refused"));
        assert!(h.sink.events.lock().unwrap().iter().any(|e| matches!(
            e,
            ChannelEvent::AccountDisabled { reason, .. } if reason == "connection refused"
        )));
    }
}
