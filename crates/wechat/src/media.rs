//! Routing generic media references to the backend's typed send commands.

use {moltis_common::types::MediaRef, tracing::warn, url::Url};

use crate::error::{Error, Result};

const STICKER_SCHEMES: &[&str] = &["emoji:", "sticker:"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "amr", "silk", "m4a", "aac", "ogg", "opus", "flac"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "heic"];

/// What to do when a media reference lacks metadata its wire shape needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Operator-triggered sends: missing metadata is an error.
    Strict,
    /// Automatic replies: degrade to a file send or skip with a warning.
    Lenient,
}

/// A concrete send command for one media reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSend {
    Sticker { md5: String, size: u64 },
    Voice { url: String, duration: u32 },
    Video { url: String, thumb_url: String, duration: u32 },
    Image { url: String },
    File { url: String, file_name: String },
}

impl MediaSend {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sticker { .. } => "sticker",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::Image { .. } => "image",
            Self::File { .. } => "file",
        }
    }
}

/// Pick the send command for `media`.
///
/// `Ok(None)` means the reference was skipped (lenient mode only).
pub fn plan_media(media: &MediaRef, mode: DeliveryMode) -> Result<Option<MediaSend>> {
    let url = media.url.trim();

    if let Some(sticker) = sticker_ref(media) {
        return match sticker {
            (md5, Some(size)) => Ok(Some(MediaSend::Sticker { md5, size })),
            (_, None) => degrade(mode, url, "sticker is missing its size"),
        };
    }

    if url.is_empty() {
        return degrade(mode, url, "media url is empty");
    }

    let content_type = media
        .content_type
        .as_deref()
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let ext = extension(url);
    let ext_in = |list: &[&str]| ext.as_deref().is_some_and(|e| list.contains(&e));

    if media.as_voice || content_type.starts_with("audio/") || ext_in(AUDIO_EXTENSIONS) {
        return match media.duration_secs {
            Some(duration) => Ok(Some(MediaSend::Voice {
                url: url.to_string(),
                duration,
            })),
            None => degrade_to_file(media, mode, "voice is missing its duration"),
        };
    }

    if content_type.starts_with("video/") || ext_in(VIDEO_EXTENSIONS) {
        let thumb = media
            .thumbnail_url
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        return match (thumb, media.duration_secs) {
            (Some(thumb), Some(duration)) => Ok(Some(MediaSend::Video {
                url: url.to_string(),
                thumb_url: thumb.to_string(),
                duration,
            })),
            (None, _) => degrade_to_file(media, mode, "video is missing its thumbnail"),
            (_, None) => degrade_to_file(media, mode, "video is missing its duration"),
        };
    }

    if content_type.starts_with("image/") || ext_in(IMAGE_EXTENSIONS) {
        return Ok(Some(MediaSend::Image {
            url: url.to_string(),
        }));
    }

    match file_name(media) {
        Some(file_name) => Ok(Some(MediaSend::File {
            url: url.to_string(),
            file_name,
        })),
        None => degrade(mode, url, "cannot infer a file name"),
    }
}

/// `(md5, size)` when the reference is a sticker, by scheme or by hints.
fn sticker_ref(media: &MediaRef) -> Option<(String, Option<u64>)> {
    let url = media.url.trim();
    let lower = url.to_ascii_lowercase();
    if let Some(scheme) = STICKER_SCHEMES.iter().find(|s| lower.starts_with(**s)) {
        // `emoji:<md5>` or `emoji:<md5>:<size>`
        let rest = &url[scheme.len()..];
        let (md5, inline_size) = match rest.split_once(':') {
            Some((md5, size)) => (md5, size.trim().parse().ok()),
            None => (rest, None),
        };
        let md5 = media
            .sticker_md5
            .clone()
            .unwrap_or_else(|| md5.trim().to_string());
        return Some((md5, media.sticker_size.or(inline_size)));
    }
    match (&media.sticker_md5, media.sticker_size) {
        (Some(md5), Some(size)) if !md5.trim().is_empty() => {
            Some((md5.trim().to_string(), Some(size)))
        },
        _ => None,
    }
}

fn degrade(mode: DeliveryMode, url: &str, reason: &str) -> Result<Option<MediaSend>> {
    match mode {
        DeliveryMode::Strict => Err(Error::delivery(format!("{reason}: {url}"))),
        DeliveryMode::Lenient => {
            warn!(url, reason, "skipping media send");
            Ok(None)
        },
    }
}

fn degrade_to_file(media: &MediaRef, mode: DeliveryMode, reason: &str) -> Result<Option<MediaSend>> {
    let url = media.url.trim();
    if mode == DeliveryMode::Strict {
        return Err(Error::delivery(format!("{reason}: {url}")));
    }
    match file_name(media) {
        Some(file_name) => {
            warn!(url, reason, %file_name, "falling back to file send");
            Ok(Some(MediaSend::File {
                url: url.to_string(),
                file_name,
            }))
        },
        None => degrade(mode, url, reason),
    }
}

/// Lower-cased extension of the URL's last path segment.
fn extension(url: &str) -> Option<String> {
    let name = last_segment(url)?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// Explicit file name hint, else the URL's last path segment.
fn file_name(media: &MediaRef) -> Option<String> {
    media
        .file_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| last_segment(media.url.trim()))
}

fn last_segment(url: &str) -> Option<String> {
    let segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string)),
        Err(_) => {
            let path = url.split(['?', '#']).next().unwrap_or_default();
            path.rsplit('/').next().map(str::to_string)
        },
    }?;
    (!segment.is_empty()).then_some(segment)
}
