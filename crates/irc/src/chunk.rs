//! Split outbound text into wire-sized chunks.
//!
//! Limits count chars, so a chunk never ends inside a code point. Joining
//! the chunks (text plus separator, in order) gives back the input exactly.

use crate::config::ChunkMode;

/// One piece of outbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Payload, at most `limit` chars.
    pub text: String,
    /// Line break run consumed after this chunk in newline mode. Not sent,
    /// kept so the split is lossless.
    pub separator: String,
}

impl Chunk {
    fn new(text: &str, separator: &str) -> Self {
        Self {
            text: text.to_string(),
            separator: separator.to_string(),
        }
    }
}

/// Split `text` into chunks of at most `limit` chars.
///
/// Empty input yields a single empty chunk. A zero limit is treated as one.
pub fn split(text: &str, limit: usize, mode: ChunkMode) -> Vec<Chunk> {
    let limit = limit.max(1);
    if text.is_empty() {
        return vec![Chunk::new("", "")];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = byte_offset(rest, limit);
        if cut == rest.len() {
            chunks.push(Chunk::new(rest, ""));
            break;
        }
        if mode == ChunkMode::Newline
            && let Some((start, end)) = newline_break(rest, limit)
        {
            chunks.push(Chunk::new(&rest[..start], &rest[start..end]));
            rest = &rest[end..];
            continue;
        }
        chunks.push(Chunk::new(&rest[..cut], ""));
        rest = &rest[cut..];
    }
    chunks
}

/// Re-split any chunk whose text is longer than `max_bytes` UTF-8 bytes,
/// cutting at char boundaries. The separator stays on the last piece, so
/// [`join`] gives the same text as before.
pub fn cap_bytes(chunks: Vec<Chunk>, max_bytes: usize) -> Vec<Chunk> {
    let max_bytes = max_bytes.max(4);
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.text.len() <= max_bytes {
            out.push(chunk);
            continue;
        }
        let mut rest = chunk.text.as_str();
        while rest.len() > max_bytes {
            let mut cut = max_bytes;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push(Chunk::new(&rest[..cut], ""));
            rest = &rest[cut..];
        }
        out.push(Chunk::new(rest, &chunk.separator));
    }
    out
}

/// Concatenate chunks back into the original text.
pub fn join(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&chunk.text);
        out.push_str(&chunk.separator);
    }
    out
}

/// Byte offset of the `n`th char, or the length when there are fewer.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// The CR/LF run containing the last `\n` that leaves at most `limit` chars
/// before it, as a byte range. `None` when there is no such newline or the
/// run starts the text.
fn newline_break(s: &str, limit: usize) -> Option<(usize, usize)> {
    let window = &s[..byte_offset(s, limit + 1)];
    let newline = window.rfind('\n')?;
    let bytes = s.as_bytes();

    let mut start = newline;
    while start > 0 && matches!(bytes[start - 1], b'\r' | b'\n') {
        start -= 1;
    }
    if start == 0 {
        return None;
    }
    let mut end = newline + 1;
    while end < bytes.len() && matches!(bytes[end], b'\r' | b'\n') {
        end += 1;
    }
    Some((start, end))
}
