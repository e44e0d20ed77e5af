use serde::{Deserialize, Serialize};

/// How outbound text is split into frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Hard slicing every `limit` characters.
    #[default]
    Length,
    /// Prefer line (then word) boundaries, never exceeding `limit`.
    ///
    /// Newlines at a split point are consumed, so blank lines between two
    /// chunks do not survive. Concatenating the chunks does not reproduce
    /// the input in this mode.
    Newline,
}

/// Split `text` into chunks of at most `limit` characters.
///
/// Limits count chars, not bytes. A `limit` of 0 disables splitting.
#[must_use]
pub fn chunk_text(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    match mode {
        ChunkMode::Length => chunk_by_length(text, limit),
        ChunkMode::Newline => chunk_by_newline(text, limit),
    }
}

fn chunk_by_length(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(limit).map(|c| c.iter().collect()).collect()
}

/// Byte offset just past the first `limit` chars of `s`.
fn char_window(s: &str, limit: usize) -> usize {
    s.char_indices().nth(limit).map_or(s.len(), |(i, _)| i)
}

fn chunk_by_newline(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let window_end = char_window(remaining, limit);
        if window_end == remaining.len() {
            chunks.push(remaining.to_string());
            break;
        }

        let slice = &remaining[..window_end];
        let split_at = slice
            .rfind('\n')
            .or_else(|| slice.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
        if let Some(rest) = remaining.strip_prefix(' ') {
            remaining = rest;
        }
    }

    chunks
}
