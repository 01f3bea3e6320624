use {async_trait::async_trait, moltis_common::types::ReplyPayload, tokio::sync::mpsc};

use crate::Result;

// ── Channel events (pub/sub) ────────────────────────────────────────────────

/// Events emitted by channel plugins for observers (UI, audit, supervisors).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    InboundMessage {
        channel_type: String,
        account_id: String,
        peer_id: String,
        chat_id: String,
        access_granted: bool,
    },
    /// The connection state of an account changed.
    AccountStateChanged {
        channel_type: String,
        account_id: String,
        state: String,
    },
    /// An account kept failing and was restarted; it stays configured.
    AccountDegraded {
        channel_type: String,
        account_id: String,
        reason: String,
        restarts: u32,
    },
}

/// Sink for channel events. The host provides the concrete implementation.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    async fn emit(&self, event: ChannelEvent);
}

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "irc").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start an account connection.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Stop an account connection.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;
    async fn send_media(&self, account_id: &str, to: &str, payload: &ReplyPayload) -> Result<()>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}

/// One message on an incremental response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of text to append.
    Delta(String),
    /// The response is complete.
    Done,
    /// The response was aborted; nothing not yet sent may be emitted.
    Cancelled,
}

/// Receiver end of a stream channel.
pub type StreamReceiver = mpsc::Receiver<StreamEvent>;

/// Sender end of a stream channel.
pub type StreamSender = mpsc::Sender<StreamEvent>;

/// Streaming outbound: deliver a response as it is produced.
#[async_trait]
pub trait ChannelStreamOutbound: Send + Sync {
    async fn send_stream(&self, account_id: &str, to: &str, stream: StreamReceiver) -> Result<()>;
}

/// Create a bounded stream channel for incremental responses.
#[must_use]
pub fn stream_channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    mpsc::channel(capacity.max(1))
}
