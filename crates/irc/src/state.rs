use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Instant,
};

use {tokio::sync::watch, tokio_util::sync::CancellationToken};

use crate::{
    auth::AuthState,
    config::IrcAccountConfig,
    error::{Error, Result},
    transport::IrcWriter,
};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// The write side of a ready connection, published by the connector and
/// cleared when the connection drops.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub nick: String,
    pub writer: IrcWriter,
    pub connected_at: Instant,
    /// Cancelling drops this connection and makes the connector reconnect.
    pub cancel: CancellationToken,
}

/// Slot holding the current [`LiveSession`], if any.
pub type SessionSlot = Arc<RwLock<Option<LiveSession>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: Arc<IrcAccountConfig>,
    pub cancel: CancellationToken,
    /// Latest [`AuthState`] of the account's connector.
    pub status: watch::Receiver<AuthState>,
    pub session: SessionSlot,
}

impl AccountState {
    pub fn live(&self) -> Option<LiveSession> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Look up the live session and config of `account_id`.
pub(crate) fn live_session(
    accounts: &AccountStateMap,
    account_id: &str,
) -> Result<(LiveSession, Arc<IrcAccountConfig>)> {
    let accounts = accounts.read().unwrap_or_else(|e| e.into_inner());
    let state = accounts.get(account_id).ok_or_else(|| Error::UnknownAccount {
        account_id: account_id.to_string(),
    })?;
    let live = state.live().ok_or_else(|| Error::NotConnected {
        account_id: account_id.to_string(),
    })?;
    Ok((live, Arc::clone(&state.config)))
}
