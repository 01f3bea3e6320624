//! Shared types and error helpers used across the moltis channel crates.

pub mod error;
pub mod types;

pub use error::FromMessage;
