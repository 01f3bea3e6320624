//! One-shot connectivity check.

use std::{sync::Arc, time::Instant};

use tracing::{debug, info};

use crate::{
    auth::AuthSession,
    config::IrcAccountConfig,
    protocol::Command,
    transport::Dialer,
    types::IrcProbe,
};

/// Connect, register (and identify when configured), then QUIT.
///
/// Never fails: problems are reported in [`IrcProbe::error`].
pub async fn probe_account(
    dialer: &dyn Dialer,
    account_id: &str,
    config: Arc<IrcAccountConfig>,
) -> IrcProbe {
    let mut probe = IrcProbe {
        ok: false,
        host: config.host.clone(),
        port: config.effective_port(),
        tls: config.tls,
        nick: config.nick.clone(),
        latency_ms: None,
        error: None,
    };

    let started = Instant::now();
    let session = AuthSession::new(account_id, config);
    match session.attempt(dialer).await {
        Ok(ready) => {
            probe.ok = true;
            probe.latency_ms = Some(started.elapsed().as_millis() as u64);
            probe.nick = ready.nick;
            if let Err(e) = ready.writer.send(&Command::Quit(Some("probe".into()))).await {
                debug!(account_id, error = %e, "irc probe quit failed");
            }
            let _ = ready.writer.close().await;
            info!(
                account_id,
                host = %probe.host,
                latency_ms = probe.latency_ms,
                "irc probe succeeded"
            );
        },
        Err(e) => {
            info!(account_id, host = %probe.host, error = %e, "irc probe failed");
            probe.error = Some(e.to_string());
        },
    }
    probe
}
