//! Outbound delivery: coalesce, chunk and write responses in order.

use {
    async_trait::async_trait,
    moltis_channels::plugin::{ChannelOutbound, ChannelStreamOutbound, StreamReceiver},
    moltis_common::types::ReplyPayload,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use moltis_metrics::{counter, irc as irc_metrics, labels};

use crate::{
    chunk,
    coalesce::StreamCoalescer,
    config::{ChunkMode, CoalesceConfig, IrcAccountConfig},
    error::{Error, Result},
    protocol::{self, Command},
    state::{AccountStateMap, LiveSession, live_session},
    transport::IrcWriter,
};

/// A wire-sized piece of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    /// Position within the response, starting at 0.
    pub index: usize,
    pub text: String,
    /// Last chunk of the response.
    pub is_final: bool,
}

/// Per-account delivery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    pub text_chunk_limit: usize,
    pub chunk_mode: ChunkMode,
    pub block_streaming: bool,
    pub coalesce: CoalesceConfig,
    pub response_prefix: Option<String>,
    pub media_max_bytes: u64,
}

impl DeliverySettings {
    pub fn from_config(config: &IrcAccountConfig) -> Self {
        Self {
            text_chunk_limit: config.text_chunk_limit,
            chunk_mode: config.chunk_mode,
            block_streaming: config.block_streaming,
            coalesce: config.block_streaming_coalesce,
            response_prefix: config.response_prefix.clone().filter(|p| !p.is_empty()),
            media_max_bytes: config.media_max_bytes(),
        }
    }
}

/// Numbers chunks across a response and applies the response prefix to
/// the first non-empty block only.
///
/// The last chunk seen is held back until the next block or the end of
/// the response, so exactly one emitted chunk carries `is_final` even when
/// the final block itself is empty.
#[derive(Debug)]
pub struct ChunkSequencer {
    limit: usize,
    max_bytes: usize,
    mode: ChunkMode,
    prefix: Option<String>,
    next_index: usize,
    held: Option<OutboundChunk>,
}

impl ChunkSequencer {
    pub fn new(settings: &DeliverySettings, target: &str) -> Self {
        Self {
            limit: settings.text_chunk_limit,
            max_bytes: protocol::privmsg_text_budget(target),
            mode: settings.chunk_mode,
            prefix: settings.response_prefix.clone(),
            next_index: 0,
            held: None,
        }
    }

    /// Chunks ready to send after one block.
    pub fn chunks(&mut self, text: &str, is_final: bool) -> Vec<OutboundChunk> {
        let mut ready = Vec::new();
        if !text.is_empty() {
            let text = match self.prefix.take() {
                Some(prefix) => format!("{prefix}{text}"),
                None => text.to_string(),
            };
            let pieces =
                chunk::cap_bytes(chunk::split(&text, self.limit, self.mode), self.max_bytes);
            for piece in pieces {
                let next = OutboundChunk {
                    index: self.next_index,
                    text: piece.text,
                    is_final: false,
                };
                self.next_index += 1;
                ready.extend(self.held.replace(next));
            }
        }
        if is_final && let Some(mut last) = self.held.take() {
            last.is_final = true;
            ready.push(last);
        }
        ready
    }
}

/// Lines a chunk occupies on the wire. IRC messages cannot carry line
/// breaks, so each line becomes its own PRIVMSG; blank lines are skipped.
pub fn wire_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
}

/// Writes one response to one target.
///
/// Chunks go out one at a time in index order. A failed write stops the
/// response: what was already sent stays sent and nothing is retried.
pub struct Delivery<'a> {
    pub account_id: &'a str,
    pub writer: &'a IrcWriter,
    pub target: &'a str,
    pub settings: &'a DeliverySettings,
}

impl Delivery<'_> {
    /// Send a complete text response. Returns the number of chunks sent.
    pub async fn text(&self, text: &str) -> Result<usize> {
        let mut sequencer = ChunkSequencer::new(self.settings, self.target);
        let mut sent = 0;
        for chunk in sequencer.chunks(text, true) {
            self.send_chunk(&chunk).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Send a streamed response as it is coalesced.
    pub async fn stream(&self, mut stream: StreamReceiver, cancel: &CancellationToken) -> Result<usize> {
        let mut coalescer = StreamCoalescer::new(self.settings.coalesce, self.settings.block_streaming);
        let mut sequencer = ChunkSequencer::new(self.settings, self.target);
        let mut sent = 0;
        while let Some(block) = coalescer.next_block(&mut stream, cancel).await {
            debug!(
                account_id = self.account_id,
                target = self.target,
                block = block.index,
                chars = block.text.chars().count(),
                is_final = block.is_final,
                "irc flushing block"
            );
            for chunk in sequencer.chunks(&block.text, block.is_final) {
                self.send_chunk(&chunk).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Send text with an optional media link, enforcing the media cap.
    pub async fn payload(&self, payload: &ReplyPayload) -> Result<usize> {
        let Some(media) = &payload.media else {
            return self.text(&payload.text).await;
        };
        if let Some(size) = media.size_bytes
            && size > self.settings.media_max_bytes
        {
            return Err(Error::MediaTooLarge {
                size,
                limit: self.settings.media_max_bytes,
            });
        }
        let caption = payload.text.trim();
        let line = if caption.is_empty() {
            media.url.clone()
        } else {
            format!("{caption} {}", media.url)
        };
        self.text(&line).await
    }

    async fn send_chunk(&self, chunk: &OutboundChunk) -> Result<()> {
        let lines: Vec<Command> = wire_lines(&chunk.text)
            .map(|line| Command::privmsg(self.target, line))
            .collect();
        if let Err(e) = self.writer.send_batch(&lines).await {
            warn!(
                account_id = self.account_id,
                target = self.target,
                chunk = chunk.index,
                error = %e,
                "irc send failed"
            );
            #[cfg(feature = "metrics")]
            counter!(irc_metrics::SEND_ERRORS_TOTAL, labels::ACCOUNT_ID => self.account_id.to_string())
                .increment(1);
            return Err(e);
        }
        #[cfg(feature = "metrics")]
        counter!(irc_metrics::CHUNKS_SENT_TOTAL, labels::ACCOUNT_ID => self.account_id.to_string())
            .increment(1);
        Ok(())
    }
}

/// Outbound sender for IRC accounts managed by [`crate::IrcPlugin`].
pub struct IrcOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl IrcOutbound {
    fn resolve(&self, account_id: &str) -> Result<(LiveSession, DeliverySettings)> {
        let (live, config) = live_session(&self.accounts, account_id)?;
        Ok((live, DeliverySettings::from_config(&config)))
    }
}

/// A transport failure drops the session so the connector reconnects.
fn settle(live: &LiveSession, sent: Result<usize>) -> moltis_channels::Result<()> {
    match sent {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.is_transport() {
                live.cancel.cancel();
            }
            Err(e.into())
        },
    }
}

#[async_trait]
impl ChannelOutbound for IrcOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> moltis_channels::Result<()> {
        let (live, settings) = self.resolve(account_id)?;
        let _lane = live.writer.lane(to).await;
        let sent = Delivery {
            account_id,
            writer: &live.writer,
            target: to,
            settings: &settings,
        }
        .text(text)
        .await;
        settle(&live, sent)
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> moltis_channels::Result<()> {
        let (live, settings) = self.resolve(account_id)?;
        let _lane = live.writer.lane(to).await;
        let sent = Delivery {
            account_id,
            writer: &live.writer,
            target: to,
            settings: &settings,
        }
        .payload(payload)
        .await;
        settle(&live, sent)
    }
}

#[async_trait]
impl ChannelStreamOutbound for IrcOutbound {
    async fn send_stream(
        &self,
        account_id: &str,
        to: &str,
        stream: StreamReceiver,
    ) -> moltis_channels::Result<()> {
        let (live, settings) = self.resolve(account_id)?;
        let _lane = live.writer.lane(to).await;
        let sent = Delivery {
            account_id,
            writer: &live.writer,
            target: to,
            settings: &settings,
        }
        .stream(stream, &live.cancel)
        .await;
        settle(&live, sent)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        futures::{SinkExt, channel::mpsc},
        moltis_channels::plugin::{StreamEvent, stream_channel},
        moltis_common::types::MediaAttachment,
    };

    fn settings(limit: usize, mode: ChunkMode) -> DeliverySettings {
        DeliverySettings {
            text_chunk_limit: limit,
            chunk_mode: mode,
            block_streaming: true,
            coalesce: CoalesceConfig {
                min_chars: 10,
                idle_ms: 1000,
            },
            response_prefix: None,
            media_max_bytes: 1024,
        }
    }

    fn capture() -> (IrcWriter, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded::<String>();
        let sink = tx.sink_map_err(|e| Error::transport("test sink", e));
        (IrcWriter::new(Box::pin(sink)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = rx.try_next() {
            out.push(line);
        }
        out
    }

    #[test]
    fn prefix_applies_to_first_block_only() {
        let mut s = settings(50, ChunkMode::Length);
        s.response_prefix = Some("[bot] ".into());
        let mut seq = ChunkSequencer::new(&s, "#c");
        assert!(seq.chunks("", false).is_empty());
        assert!(seq.chunks("hello", false).is_empty());
        let chunks = seq.chunks("world", true);
        assert_eq!(chunks[0].text, "[bot] hello");
        assert_eq!(chunks[1].text, "world");
        assert_eq!((chunks[0].index, chunks[1].index), (0, 1));
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
    }

    #[test]
    fn empty_final_block_marks_last_sent_chunk_final() {
        let mut seq = ChunkSequencer::new(&settings(10, ChunkMode::Length), "#c");
        let mut emitted = seq.chunks("twenty chars of text", false);
        emitted.extend(seq.chunks("", true));
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted.iter().filter(|c| c.is_final).count(), 1);
        assert!(emitted[1].is_final);
        assert!(seq.chunks("", true).is_empty());
    }

    #[test]
    fn multibyte_chunks_fit_the_line_limit() {
        let s = settings(350, ChunkMode::Length);
        let chunks = ChunkSequencer::new(&s, "#moltis").chunks(&"日".repeat(350), true);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let line = Command::privmsg("#moltis", chunk.text.clone()).to_line();
            assert!(line.len() + 2 <= protocol::MAX_LINE_BYTES);
        }
        assert_eq!(chunks.iter().map(|c| c.text.as_str()).collect::<String>(), "日".repeat(350));
    }

    #[test]
    fn prefix_counts_against_chunk_limit() {
        let mut s = settings(8, ChunkMode::Length);
        s.response_prefix = Some(">> ".into());
        let chunks = ChunkSequencer::new(&s, "#c").chunks("abcdefgh", true);
        assert_eq!(chunks[0].text, ">> abcde");
        assert_eq!(chunks[1].text, "fgh");
        assert!(chunks[1].is_final);
    }

    #[test]
    fn wire_lines_drop_breaks_and_blanks() {
        let lines: Vec<&str> = wire_lines("one\r\n\ntwo\n").collect();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(wire_lines("").count(), 0);
    }

    #[tokio::test]
    async fn text_is_chunked_into_privmsgs() {
        let (writer, mut rx) = capture();
        let s = settings(10, ChunkMode::Newline);
        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "#moltis",
            settings: &s,
        };
        let sent = delivery.text("hello\nworld!!").await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(drain(&mut rx), vec![
            "PRIVMSG #moltis :hello",
            "PRIVMSG #moltis :world!!",
        ]);
    }

    #[tokio::test]
    async fn empty_response_sends_nothing() {
        let (writer, mut rx) = capture();
        let s = settings(10, ChunkMode::Length);
        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "alice",
            settings: &s,
        };
        assert_eq!(delivery.text("").await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn stream_is_coalesced_then_chunked() {
        let (writer, mut rx) = capture();
        let s = settings(6, ChunkMode::Length);
        let (tx, stream) = stream_channel(8);
        for f in ["abc", "defgh", "ij", "k"] {
            tx.send(StreamEvent::Delta(f.into())).await.unwrap();
        }
        tx.send(StreamEvent::Done).await.unwrap();

        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "#c",
            settings: &s,
        };
        let sent = delivery.stream(stream, &CancellationToken::new()).await.unwrap();
        // "abcdefghij" flushes on size (10 chars) as two chunks, "k" is final.
        assert_eq!(sent, 3);
        assert_eq!(drain(&mut rx), vec!["PRIVMSG #c :abcdef", "PRIVMSG #c :ghij", "PRIVMSG #c :k"]);
    }

    #[tokio::test]
    async fn stream_ending_on_size_flush_still_sends_everything() {
        let (writer, mut rx) = capture();
        let s = settings(20, ChunkMode::Length);
        let (tx, stream) = stream_channel(8);
        for f in ["hello", " worl"] {
            tx.send(StreamEvent::Delta(f.into())).await.unwrap();
        }
        tx.send(StreamEvent::Done).await.unwrap();

        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "#c",
            settings: &s,
        };
        let sent = delivery.stream(stream, &CancellationToken::new()).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut rx), vec!["PRIVMSG #c :hello worl"]);
    }

    #[tokio::test]
    async fn failed_write_stops_the_response() {
        let (writer, rx) = capture();
        drop(rx);
        let s = settings(3, ChunkMode::Length);
        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "#c",
            settings: &s,
        };
        let err = delivery.text("abcdefghi").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn media_over_cap_is_rejected() {
        let (writer, mut rx) = capture();
        let s = settings(100, ChunkMode::Length);
        let delivery = Delivery {
            account_id: "main",
            writer: &writer,
            target: "#c",
            settings: &s,
        };
        let big = ReplyPayload {
            text: "look".into(),
            media: Some(MediaAttachment {
                url: "https://example.org/a.png".into(),
                mime_type: "image/png".into(),
                size_bytes: Some(4096),
            }),
        };
        assert!(matches!(
            delivery.payload(&big).await,
            Err(Error::MediaTooLarge { size: 4096, limit: 1024 })
        ));
        assert!(drain(&mut rx).is_empty());

        let small = ReplyPayload {
            media: big.media.clone().map(|m| MediaAttachment {
                size_bytes: Some(10),
                ..m
            }),
            ..big
        };
        delivery.payload(&small).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["PRIVMSG #c :look https://example.org/a.png"]);
    }

    #[test]
    fn settings_from_config() {
        let config = IrcAccountConfig {
            response_prefix: Some(String::new()),
            media_max_mb: 1.0,
            ..IrcAccountConfig::default()
        };
        let s = DeliverySettings::from_config(&config);
        assert!(s.response_prefix.is_none());
        assert_eq!(s.media_max_bytes, 1024 * 1024);
        assert_eq!(s.text_chunk_limit, 350);
    }
}
