//! IRC channel plugin for moltis.
//!
//! Implements `ChannelPlugin` over plain IRC (TCP or TLS): registration and
//! NickServ identification with reconnect backoff, per-scope access policy,
//! mention detection for channels, and chunked delivery of complete or
//! streamed agent replies.

pub mod access;
pub mod agent;
pub mod auth;
pub mod chunk;
pub mod coalesce;
pub mod config;
pub mod connector;
pub mod error;
pub mod mention;
pub mod outbound;
pub mod plugin;
pub mod probe;
pub mod protocol;
pub mod scope;
pub mod state;
pub mod transport;
pub mod types;

/// Channel type recorded in events and the message log.
pub const CHANNEL_TYPE: &str = "irc";

pub use {
    agent::{AgentReply, IrcAgent},
    auth::{AuthSession, AuthState},
    config::{IrcAccountConfig, resolve_accounts, validate_irc_config},
    connector::{AccountConnector, ConnectorDeps},
    error::{Error, Result},
    plugin::IrcPlugin,
    probe::probe_account,
    transport::{Dialer, TcpDialer},
    types::{InboundContext, IrcInboundMessage, IrcProbe},
};
