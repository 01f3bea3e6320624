//! Top-level config schema.
//!
//! Channel sections are kept as raw JSON values; each channel crate owns the
//! typed model for its own section.

use serde::{Deserialize, Serialize};

/// Root of a moltis config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoltisConfig {
    pub channels: ChannelsConfig,
}

/// Channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// IRC section: account defaults plus an optional `accounts` map.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub irc: serde_json::Value,
}
