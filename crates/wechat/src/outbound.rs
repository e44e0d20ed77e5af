use {
    async_trait::async_trait,
    moltis_channels::{ChannelOutbound, Error as ChannelError},
    moltis_common::types::ReplyPayload,
    tracing::debug,
};

use crate::{
    WECHAT_IDS,
    chunk::{ChunkMode, chunk_text},
    client::WeChatClient,
    error::{Error, Result},
    media::{DeliveryMode, MediaSend, plan_media},
    state::{AccountStateMap, HostHandles, unix_now},
};

/// Outbound message sender for WeChat.
#[derive(Clone)]
pub struct WeChatOutbound {
    pub(crate) accounts: AccountStateMap,
    pub(crate) host: HostHandles,
}

impl WeChatOutbound {
    fn account(&self, account_id: &str) -> Result<(WeChatClient, usize, ChunkMode)> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .map(|s| {
                (
                    s.client.clone(),
                    s.config.text_chunk_limit,
                    s.config.chunk_mode,
                )
            })
            .ok_or_else(|| ChannelError::unknown_account(account_id).into())
    }

    /// Send a reply payload: text chunks first, then each media reference.
    pub async fn deliver(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
        mode: DeliveryMode,
    ) -> Result<()> {
        let to = WECHAT_IDS.strip_prefixes(to);
        if to.is_empty() {
            return Err(Error::delivery("empty target"));
        }
        let (client, limit, chunk_mode) = self.account(account_id)?;

        if let Some(text) = payload.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let text = self.host.tables.convert_tables(account_id, text);
            let chunks = chunk_text(&text, limit, chunk_mode);
            let total = chunks.len();
            for (i, chunk) in chunks.iter().enumerate() {
                // Mentions ride on the first chunk only.
                let mentions: &[String] = if i == 0 {
                    &payload.mentions
                } else {
                    &[]
                };
                client.send_text(to, chunk, mentions)?;
                self.touch_outbound(account_id);
                debug!(account_id, to, chunk = i + 1, total, "sent text chunk");
            }
        }

        for media in &payload.media {
            let Some(plan) = plan_media(media, mode)? else {
                continue;
            };
            send_media(&client, to, &plan)?;
            self.touch_outbound(account_id);
            debug!(account_id, to, kind = plan.kind(), "sent media");
        }
        Ok(())
    }

    fn touch_outbound(&self, account_id: &str) {
        self.host
            .update_status(account_id, |s| s.last_outbound_at = Some(unix_now()));
    }
}

fn send_media(client: &WeChatClient, to: &str, plan: &MediaSend) -> Result<()> {
    match plan {
        MediaSend::Sticker { md5, size } => client.send_emoji(to, md5, *size),
        MediaSend::Voice { url, duration } => client.send_voice(to, url, *duration),
        MediaSend::Video {
            url,
            thumb_url,
            duration,
        } => client.send_video(to, url, thumb_url, *duration),
        MediaSend::Image { url } => client.send_image(to, url),
        MediaSend::File { url, file_name } => client.send_file(to, url, file_name),
    }
}

#[async_trait]
impl ChannelOutbound for WeChatOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> moltis_channels::Result<()> {
        self.deliver(account_id, to, &ReplyPayload::text(text), DeliveryMode::Strict)
            .await
            .map_err(Into::into)
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> moltis_channels::Result<()> {
        self.deliver(account_id, to, payload, DeliveryMode::Strict)
            .await
            .map_err(Into::into)
    }
}
