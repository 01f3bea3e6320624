use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

use {async_trait::async_trait, moltis_common::types::ChatType};

use crate::Result;

/// A single logged inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLogEntry {
    pub account_id: String,
    pub channel_type: String,
    /// Sender identity as seen by the channel (IRC nick).
    pub peer_id: String,
    /// Conversation the message belongs to (channel name, or sender for DMs).
    pub chat_id: String,
    pub chat_type: ChatType,
    pub body: String,
    /// Whether the message passed access control and was addressed to the bot.
    pub access_granted: bool,
    pub created_at: i64,
}

/// Log of inbound messages kept outside the channel plugin.
///
/// Plugins record every message they see, including ones they drop, and
/// may read back the most recent entries of a conversation as context.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn log(&self, entry: MessageLogEntry) -> Result<()>;

    /// The newest `limit` entries of a conversation, oldest first.
    async fn recent(
        &self,
        account_id: &str,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>>;
}

/// In-memory log keeping the newest `capacity` entries per conversation.
#[derive(Debug)]
pub struct MemoryMessageLog {
    capacity: usize,
    entries: RwLock<HashMap<(String, String), VecDeque<MessageLogEntry>>>,
}

impl MemoryMessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Every retained entry of an account, oldest first per conversation.
    pub fn entries(&self, account_id: &str) -> Vec<MessageLogEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<MessageLogEntry> = entries
            .iter()
            .filter(|((account, _), _)| account == account_id)
            .flat_map(|(_, log)| log.iter().cloned())
            .collect();
        out.sort_by_key(|e| e.created_at);
        out
    }
}

impl Default for MemoryMessageLog {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn log(&self, entry: MessageLogEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let log = entries
            .entry((entry.account_id.clone(), entry.chat_id.clone()))
            .or_default();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(entry);
        Ok(())
    }

    async fn recent(
        &self,
        account_id: &str,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let Some(log) = entries.get(&(account_id.to_string(), chat_id.to_string())) else {
            return Ok(Vec::new());
        };
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }
}
