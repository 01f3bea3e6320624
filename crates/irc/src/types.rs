use {
    moltis_channels::message_log::MessageLogEntry,
    serde::{Deserialize, Serialize},
};

use crate::{mention::Mention, protocol::Prefix, scope::EffectiveConfig};

/// Who sent an inbound line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrcSender {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl IrcSender {
    pub fn from_prefix(prefix: &Prefix) -> Self {
        Self {
            nick: prefix.nick.clone(),
            user: prefix.user.clone(),
            host: prefix.host.clone(),
        }
    }

    /// Forms an allowlist entry may match: `nick`, `nick!user@host` and
    /// `user@host`.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = vec![self.nick.clone()];
        if let (Some(user), Some(host)) = (&self.user, &self.host) {
            ids.push(format!("{}!{user}@{host}", self.nick));
            ids.push(format!("{user}@{host}"));
        }
        ids
    }
}

/// A normalized inbound chat message, handed to the agent exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrcInboundMessage {
    pub message_id: String,
    /// Conversation id: channel for groups, sender nick for DMs.
    pub target: String,
    /// Destination as it appeared on the wire (our own nick for DMs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_target: Option<String>,
    pub sender_nick: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_host: Option<String>,
    pub text: String,
    /// Receipt time, ms since the Unix epoch.
    pub timestamp: i64,
    pub is_group: bool,
}

/// Everything the agent gets alongside a message.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub account_id: String,
    pub effective: EffectiveConfig,
    /// What addressed the bot, for group messages.
    pub mention: Option<Mention>,
    /// Recent messages from the same conversation, oldest first, bounded by
    /// the scope's history limit.
    pub history: Vec<MessageLogEntry>,
}

/// Result of a one-shot connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrcProbe {
    pub ok: bool,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub nick: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
