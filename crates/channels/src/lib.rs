//! Channel plugin system.
//!
//! Each messaging network (IRC, Telegram, ...) implements [`ChannelPlugin`]
//! plus the outbound, streaming and status sub-traits. Access gating helpers,
//! the pairing lookup and the inbound message log are shared here so every
//! channel applies the same policy vocabulary.

pub mod error;
pub mod gating;
pub mod message_log;
pub mod plugin;
pub mod store;

pub use {
    error::{Error, Result},
    plugin::{
        ChannelEvent, ChannelEventSink, ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin,
        ChannelStatus, ChannelStreamOutbound, StreamEvent, StreamReceiver, StreamSender,
        stream_channel,
    },
    message_log::{MemoryMessageLog, MessageLog, MessageLogEntry},
    store::{MemoryPairingStore, NoPairings, PairingStore},
};
