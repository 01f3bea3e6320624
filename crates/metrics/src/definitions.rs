//! Metric name and label definitions.
//!
//! Centralizing names keeps dashboards and the emitting code in agreement.

/// Cross-channel metrics
pub mod channels {
    /// Number of running channel accounts
    pub const ACTIVE_ACCOUNTS: &str = "moltis_channel_active_accounts";
}

/// IRC channel metrics
pub mod irc {
    /// Raw PRIVMSG/NOTICE lines received
    pub const MESSAGES_RECEIVED_TOTAL: &str = "moltis_irc_messages_received_total";
    /// Inbound messages forwarded to the agent
    pub const MESSAGES_DISPATCHED_TOTAL: &str = "moltis_irc_messages_dispatched_total";
    /// Access control denials (labelled by reason)
    pub const ACCESS_CONTROL_DENIALS_TOTAL: &str = "moltis_irc_access_control_denials_total";
    /// Group messages dropped because the bot was not addressed
    pub const UNADDRESSED_TOTAL: &str = "moltis_irc_unaddressed_total";
    /// Outbound chunks written to the wire
    pub const CHUNKS_SENT_TOTAL: &str = "moltis_irc_chunks_sent_total";
    /// Outbound send failures
    pub const SEND_ERRORS_TOTAL: &str = "moltis_irc_send_errors_total";
    /// Connection attempts that ended in backoff
    pub const BACKOFF_CYCLES_TOTAL: &str = "moltis_irc_backoff_cycles_total";
    /// Authentication failures (bad NickServ/server password)
    pub const AUTH_FAILURES_TOTAL: &str = "moltis_irc_auth_failures_total";
    /// Time from dial to ready, in seconds
    pub const CONNECT_DURATION_SECONDS: &str = "moltis_irc_connect_duration_seconds";
    /// Accounts currently in the ready state
    pub const READY_ACCOUNTS: &str = "moltis_irc_ready_accounts";
}

/// Common label keys
pub mod labels {
    pub const ACCOUNT_ID: &str = "account_id";
    pub const CHANNEL: &str = "channel";
    pub const REASON: &str = "reason";
    pub const CHAT_TYPE: &str = "chat_type";
}
