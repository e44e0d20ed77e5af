//! Persistent WebSocket connection to the robot backend.
//!
//! One [`WeChatClient`] owns at most one live socket. A background task
//! performs the auth handshake, decodes inbound frames into
//! [`ClientEvent`]s and reconnects with capped exponential backoff until
//! [`ReconnectConfig::max_attempts`] is exhausted.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

use {
    futures::{SinkExt, StreamExt},
    serde::Serialize,
    tokio::{
        net::TcpStream,
        sync::{mpsc, oneshot},
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, trace, warn},
    url::Url,
};

use crate::{
    config::{ReconnectConfig, WeChatAccountConfig},
    error::{Context, Error, Result},
    frames::{ClientFrame, DecodeError, InboundEvent, ServerFrame},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

/// Snapshot of a client's connection bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnects scheduled since the last successful handshake.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_ping_at: Option<Instant>,
}

/// Events published by the connection task.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Message(InboundEvent),
    /// Backend `error` frame or transport failure.
    Error(String),
    Disconnected,
    /// Reconnect attempts exhausted; the client stays disconnected until
    /// [`WeChatClient::connect`] is called again.
    GaveUp { last_error: Option<String> },
}

struct Inner {
    account_id: String,
    url: Url,
    robot_wxid: String,
    policy: ReconnectConfig,
    status: RwLock<ConnectionStatus>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    cancel: Mutex<Option<CancellationToken>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Cheaply cloneable handle to one account's connection.
#[derive(Clone)]
pub struct WeChatClient {
    inner: Arc<Inner>,
}

impl WeChatClient {
    /// Build a client for `config`. Nothing connects until [`Self::connect`].
    pub fn new(
        account_id: &str,
        config: &WeChatAccountConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let url = config.robot_url()?;
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            account_id: account_id.to_string(),
            url,
            robot_wxid: config.robot_wxid.trim().to_string(),
            policy: config.reconnect_policy(),
            status: RwLock::new(ConnectionStatus::default()),
            writer: Mutex::new(None),
            cancel: Mutex::new(None),
            events,
        };
        Ok((Self {
            inner: Arc::new(inner),
        }, rx))
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Open the connection and wait for the first handshake to finish.
    ///
    /// Cancels any previous connection task. If the first attempt fails the
    /// error is returned, but the task keeps reconnecting in the background.
    pub async fn connect(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let previous = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.inner.update_status(|s| s.state = ConnectionState::Connecting);

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run(Arc::clone(&self.inner), cancel, ready_tx));
        ready_rx
            .await
            .context("connection task stopped before handshake")?
    }

    /// Cancel any pending reconnect and close the socket. Idempotent.
    pub fn disconnect(&self) {
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
        self.inner
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut previous = ConnectionState::Disconnected;
        self.inner.update_status(|s| {
            previous = s.state;
            s.state = ConnectionState::Disconnected;
        });
        if previous != ConnectionState::Disconnected {
            info!(account_id = %self.inner.account_id, "wechat client disconnected");
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner
            .status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn send_text(&self, to: &str, content: &str, mentions: &[String]) -> Result<()> {
        self.send_frame(&ClientFrame::SendText {
            to_wxid: to.to_string(),
            content: content.to_string(),
            at: (!mentions.is_empty()).then(|| mentions.to_vec()),
        })
    }

    pub fn send_image(&self, to: &str, image_url: &str) -> Result<()> {
        self.send_frame(&ClientFrame::SendImage {
            to_wxid: to.to_string(),
            image_url: image_url.to_string(),
        })
    }

    pub fn send_voice(&self, to: &str, url: &str, duration: u32) -> Result<()> {
        self.send_frame(&ClientFrame::SendVoice {
            to_wxid: to.to_string(),
            url: url.to_string(),
            duration,
        })
    }

    pub fn send_video(&self, to: &str, url: &str, thumb_url: &str, duration: u32) -> Result<()> {
        self.send_frame(&ClientFrame::SendVideo {
            to_wxid: to.to_string(),
            url: url.to_string(),
            thumb_url: thumb_url.to_string(),
            duration,
        })
    }

    pub fn send_file(&self, to: &str, url: &str, file_name: &str) -> Result<()> {
        self.send_frame(&ClientFrame::SendFile {
            to_wxid: to.to_string(),
            url: url.to_string(),
            file_name: file_name.to_string(),
        })
    }

    pub fn send_emoji(&self, to: &str, md5: &str, size: u64) -> Result<()> {
        self.send_frame(&ClientFrame::SendEmoji {
            to_wxid: to.to_string(),
            md5: md5.to_string(),
            size,
        })
    }

    /// Acknowledge backend messages so they are not redelivered.
    pub fn mark_processed(&self, message_ids: &[i64]) -> Result<()> {
        self.send_frame(&ClientFrame::MarkProcessed {
            message_ids: message_ids.to_vec(),
        })
    }

    pub fn query_contacts(&self, contact_type: &str) -> Result<()> {
        self.send_frame(&ClientFrame::QueryContacts {
            contact_type: contact_type.to_string(),
        })
    }

    /// Queue a frame on the live socket. Never buffers across reconnects.
    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::not_connected(&self.inner.account_id));
        }
        let json = serde_json::to_string(frame)?;
        let writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            Some(tx) => tx
                .send(Message::Text(json.into()))
                .map_err(|_| Error::not_connected(&self.inner.account_id)),
            None => Err(Error::not_connected(&self.inner.account_id)),
        }
    }
}

impl Inner {
    fn update_status(&self, update: impl FnOnce(&mut ConnectionStatus)) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        update(&mut status);
    }

    fn emit(&self, event: ClientEvent) {
        // Ignore send error: the account is being torn down.
        let _ = self.events.send(event);
    }

    fn record_error(&self, message: String) {
        self.update_status(|s| s.last_error = Some(message.clone()));
        self.emit(ClientEvent::Error(message));
    }

    /// One connected session: auth, then pump frames until close or cancel.
    async fn session(
        &self,
        ws: WsStream,
        cancel: &CancellationToken,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        let auth = serde_json::to_string(&ClientFrame::Auth {
            robot_wxid: self.robot_wxid.clone(),
        })?;
        sink.send(Message::Text(auth.into())).await?;

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        {
            // `disconnect()` cancels before it publishes `Disconnected`, so
            // checking under the status lock keeps a late handshake from
            // overwriting it.
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if cancel.is_cancelled() {
                return Ok(());
            }
            *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(write_tx.clone());
            status.state = ConnectionState::Connected;
            status.attempts = 0;
            status.last_error = None;
        }
        info!(account_id = %self.account_id, url = %self.url, "wechat connected");
        self.emit(ClientEvent::Connected);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Frames queued before the disconnect still go out.
                    while let Ok(msg) = write_rx.try_recv() {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(account_id = %self.account_id, "socket closed by server");
                        break Ok(());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break Err(e.into()),
                },
                out = write_rx.recv() => {
                    if let Some(msg) = out
                        && let Err(e) = sink.send(msg).await
                    {
                        break Err(e.into());
                    }
                },
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if writer.as_ref().is_some_and(|w| w.same_channel(&write_tx)) {
            writer.take();
        }
        result
    }

    /// Called by a cancelled connection task on its way out. Publishes
    /// `Disconnected` unless a newer `connect()` already owns the client.
    fn settle_cancelled(&self) {
        let current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_none_or(CancellationToken::is_cancelled) {
            self.update_status(|s| s.state = ConnectionState::Disconnected);
        }
    }

    fn handle_frame(&self, text: &str) {
        match ServerFrame::decode(text) {
            Ok(ServerFrame::Message { data }) => {
                trace!(account_id = %self.account_id, msg_id = data.msg_id, "inbound message");
                self.emit(ClientEvent::Message(data));
            },
            Ok(ServerFrame::Ping) => {
                self.update_status(|s| s.last_ping_at = Some(Instant::now()));
            },
            Ok(ServerFrame::Error { message }) => {
                warn!(account_id = %self.account_id, error = %message, "backend error frame");
                self.record_error(message);
            },
            Ok(ServerFrame::Auth { status, message }) => {
                info!(account_id = %self.account_id, %status, ?message, "auth acknowledged");
            },
            Ok(ServerFrame::SendResult {
                success,
                message_id,
            }) => {
                if success {
                    debug!(account_id = %self.account_id, ?message_id, "send confirmed");
                } else {
                    warn!(account_id = %self.account_id, ?message_id, "backend rejected send");
                }
            },
            Err(DecodeError::UnknownKind(kind)) => {
                debug!(account_id = %self.account_id, %kind, "ignoring unknown frame kind");
            },
            Err(DecodeError::Malformed(e)) => {
                warn!(account_id = %self.account_id, error = %e, "dropping malformed frame");
            },
        }
    }
}

/// Connection loop with auto-reconnect.
async fn run(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);

    loop {
        inner.update_status(|s| s.state = ConnectionState::Connecting);
        info!(account_id = %inner.account_id, url = %inner.url, "connecting to wechat backend");

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                inner.settle_cancelled();
                return;
            },
            opened = connect_async(inner.url.as_str()) => opened,
        };

        let failure = match opened {
            Ok((ws, _response)) => {
                let result = inner.session(ws, &cancel, &mut ready).await;
                if cancel.is_cancelled() {
                    inner.settle_cancelled();
                    return;
                }
                let failure = result.err();
                if let Some(e) = &failure {
                    error!(account_id = %inner.account_id, error = %e, "wechat connection error");
                    inner.record_error(e.to_string());
                }
                inner.emit(ClientEvent::Disconnected);
                failure
            },
            Err(e) => {
                let e = Error::from(e);
                warn!(account_id = %inner.account_id, error = %e, "wechat connect failed");
                inner.record_error(e.to_string());
                Some(e)
            },
        };

        // Only the very first attempt reports back to `connect()`.
        if let Some(ready) = ready.take() {
            let _ = ready.send(Err(
                failure.unwrap_or_else(|| Error::message("connection closed during handshake"))
            ));
        }

        let attempts = inner
            .status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .attempts;
        if attempts >= inner.policy.max_attempts {
            let mut last_error = None;
            inner.update_status(|s| {
                s.state = ConnectionState::Disconnected;
                last_error = s.last_error.clone();
            });
            error!(
                account_id = %inner.account_id,
                attempts,
                last_error = ?last_error,
                "giving up on wechat reconnects"
            );
            inner.emit(ClientEvent::GaveUp { last_error });
            return;
        }

        let delay = inner.policy.delay_for(attempts);
        inner.update_status(|s| {
            s.attempts = attempts + 1;
            s.state = ConnectionState::ReconnectScheduled;
        });
        info!(
            account_id = %inner.account_id,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after delay"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                inner.settle_cancelled();
                return;
            },
            _ = tokio::time::sleep(delay) => {},
        }
    }
}
