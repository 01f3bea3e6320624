use {
    async_trait::async_trait,
    moltis_channels::plugin::StreamReceiver,
    moltis_common::types::ReplyPayload,
};

use crate::types::{InboundContext, IrcInboundMessage};

/// What the agent sends back for one inbound message.
#[derive(Debug)]
pub enum AgentReply {
    /// A complete response.
    Text(String),
    /// Text with an optional media attachment.
    Payload(ReplyPayload),
    /// Incremental fragments, terminated by `Done` or `Cancelled`.
    Stream(StreamReceiver),
    /// Nothing to say.
    Silent,
}

/// The agent behind an IRC account. Each accepted message is handed over
/// exactly once.
#[async_trait]
pub trait IrcAgent: Send + Sync {
    async fn handle(
        &self,
        account_id: &str,
        message: IrcInboundMessage,
        context: InboundContext,
    ) -> anyhow::Result<AgentReply>;
}
