//! Metric definitions for moltis channels.
//!
//! Emitting crates record through the `metrics` facade, so nothing is
//! collected unless the host installs a recorder.
//!
//! ```rust,ignore
//! use moltis_metrics::{counter, irc};
//!
//! counter!(irc::CHUNKS_SENT_TOTAL, "account_id" => "main").increment(1);
//! ```

mod definitions;

pub use definitions::*;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
