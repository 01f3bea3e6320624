//! Agents for running the bridge without an LLM behind it.

use {
    async_trait::async_trait,
    moltis_irc::{AgentReply, InboundContext, IrcAgent, IrcInboundMessage},
    tracing::info,
};

/// Answers every message with its own text.
pub struct EchoAgent;

#[async_trait]
impl IrcAgent for EchoAgent {
    async fn handle(
        &self,
        _account_id: &str,
        message: IrcInboundMessage,
        _context: InboundContext,
    ) -> anyhow::Result<AgentReply> {
        Ok(AgentReply::Text(message.text))
    }
}

/// Logs every message and stays silent.
pub struct LogAgent;

#[async_trait]
impl IrcAgent for LogAgent {
    async fn handle(
        &self,
        account_id: &str,
        message: IrcInboundMessage,
        context: InboundContext,
    ) -> anyhow::Result<AgentReply> {
        info!(
            account_id,
            target = %message.target,
            from = %message.sender_nick,
            history = context.history.len(),
            text = %message.text,
            "irc message"
        );
        Ok(AgentReply::Silent)
    }
}
