use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    async_trait::async_trait,
    moltis_channels::{
        ChannelEvent, ChannelEventSink,
        message_log::MessageLog,
        plugin::{
            ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus,
            ChannelStreamOutbound,
        },
        store::{NoPairings, PairingStore},
    },
    moltis_config::Severity,
    serde_json::Value,
    tokio::{sync::watch, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use moltis_metrics::{channels as channel_metrics, gauge, labels};

use crate::{
    CHANNEL_TYPE,
    agent::IrcAgent,
    auth::AuthState,
    config::{IrcAccountConfig, resolve_accounts, validate_account},
    connector::{AccountConnector, ConnectorDeps},
    error::{Context, Error, Result},
    outbound::IrcOutbound,
    probe::probe_account,
    state::{AccountState, AccountStateMap, SessionSlot},
    transport::{Dialer, TcpDialer},
    types::IrcProbe,
};

/// How long `stop` waits for a connector to send QUIT and exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// IRC channel plugin. Supervises one [`AccountConnector`] per account.
pub struct IrcPlugin {
    accounts: AccountStateMap,
    outbound: IrcOutbound,
    deps: ConnectorDeps,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl IrcPlugin {
    pub fn new(agent: Arc<dyn IrcAgent>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = IrcOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            deps: ConnectorDeps {
                dialer: Arc::new(TcpDialer::default()),
                agent,
                pairings: Arc::new(NoPairings),
                message_log: None,
                event_sink: None,
            },
            tasks: HashMap::new(),
        }
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.deps.message_log = Some(log);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn ChannelEventSink>) -> Self {
        self.deps.event_sink = Some(sink);
        self
    }

    pub fn with_pairings(mut self, pairings: Arc<dyn PairingStore>) -> Self {
        self.deps.pairings = pairings;
        self
    }

    /// Replace the TCP/TLS dialer, e.g. with an in-memory transport in tests.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.deps.dialer = dialer;
        self
    }

    /// Get a shared reference to the outbound sender (for use outside the plugin).
    pub fn shared_outbound(&self) -> Arc<dyn ChannelOutbound> {
        Arc::new(IrcOutbound {
            accounts: Arc::clone(&self.accounts),
        })
    }

    pub fn shared_stream_outbound(&self) -> Arc<dyn ChannelStreamOutbound> {
        Arc::new(IrcOutbound {
            accounts: Arc::clone(&self.accounts),
        })
    }

    /// List all active account IDs.
    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current connection state of an account.
    pub fn account_state(&self, account_id: &str) -> Option<AuthState> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).map(|s| s.status.borrow().clone())
    }

    /// Watch the connection state of an account.
    pub fn subscribe(&self, account_id: &str) -> Option<watch::Receiver<AuthState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).map(|s| s.status.clone())
    }

    /// Start a parsed account. A running account with the same id is
    /// stopped first.
    pub async fn start(&mut self, account_id: &str, config: IrcAccountConfig) -> Result<()> {
        let errors: Vec<String> = validate_account(account_id, &config)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| format!("{}: {}", d.path, d.message))
            .collect();
        if !errors.is_empty() {
            return Err(Error::config(errors.join("; ")));
        }

        if self.contains(account_id) {
            self.stop(account_id).await;
        }
        if !config.enabled {
            info!(account_id, "irc account disabled, not starting");
            return Ok(());
        }

        info!(
            account_id,
            host = %config.host,
            port = config.effective_port(),
            tls = config.tls,
            nick = %config.nick,
            "starting irc account"
        );

        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let session = SessionSlot::default();
        let (state_tx, state_rx) = watch::channel(AuthState::Disconnected);
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), AccountState {
                account_id: account_id.to_string(),
                config: Arc::clone(&config),
                cancel: cancel.clone(),
                status: state_rx,
                session: Arc::clone(&session),
            });
        }

        let supervisor = Supervisor {
            account_id: account_id.to_string(),
            config,
            deps: self.deps.clone(),
            session,
            state: state_tx,
        };
        self.tasks
            .insert(account_id.to_string(), tokio::spawn(supervisor.run(cancel)));

        #[cfg(feature = "metrics")]
        gauge!(channel_metrics::ACTIVE_ACCOUNTS, labels::CHANNEL => CHANNEL_TYPE).increment(1.0);
        Ok(())
    }

    /// Stop an account and wait for its connector to wind down. Returns
    /// whether the account was running.
    pub async fn stop(&mut self, account_id: &str) -> bool {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        let Some(state) = removed else {
            return false;
        };
        info!(account_id, "stopping irc account");
        state.cancel.cancel();
        if let Some(mut task) = self.tasks.remove(account_id)
            && tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err()
        {
            warn!(account_id, "irc connector did not stop in time, aborting");
            task.abort();
        }
        #[cfg(feature = "metrics")]
        gauge!(channel_metrics::ACTIVE_ACCOUNTS, labels::CHANNEL => CHANNEL_TYPE).decrement(1.0);
        true
    }

    /// Stop every running account.
    pub async fn stop_all(&mut self) {
        for account_id in self.account_ids() {
            self.stop(&account_id).await;
        }
    }

    /// Reconcile running accounts with a `channels.irc` section: start or
    /// restart every enabled account and stop the rest.
    pub async fn apply_config(&mut self, section: &Value) -> Result<()> {
        let resolved = resolve_accounts(section)?;

        let wanted: BTreeSet<&str> = resolved
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(id, _)| id.as_str())
            .collect();
        for account_id in self.account_ids() {
            if !wanted.contains(account_id.as_str()) {
                self.stop(&account_id).await;
            }
        }

        let mut failed = Vec::new();
        for (account_id, cfg) in resolved {
            if !cfg.enabled {
                continue;
            }
            if let Err(e) = self.start(&account_id, cfg).await {
                warn!(account_id = %account_id, error = %e, "irc account not started");
                failed.push(format!("{account_id}: {e}"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::config(failed.join("; ")))
        }
    }

    /// Run a one-shot connectivity check with a running account's config.
    pub async fn probe_connectivity(&self, account_id: &str) -> Result<IrcProbe> {
        let config = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts
                .get(account_id)
                .map(|s| Arc::clone(&s.config))
                .ok_or_else(|| Error::UnknownAccount {
                    account_id: account_id.to_string(),
                })?
        };
        Ok(probe_account(self.deps.dialer.as_ref(), account_id, config).await)
    }

    fn contains(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.contains_key(account_id)
    }
}

#[async_trait]
impl ChannelPlugin for IrcPlugin {
    fn id(&self) -> &str {
        CHANNEL_TYPE
    }

    fn name(&self) -> &str {
        "IRC"
    }

    async fn start_account(
        &mut self,
        account_id: &str,
        config: Value,
    ) -> moltis_channels::Result<()> {
        let config: IrcAccountConfig =
            serde_json::from_value(config).context("invalid irc account config")?;
        self.start(account_id, config).await?;
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> moltis_channels::Result<()> {
        if !self.stop(account_id).await {
            warn!(account_id, "irc account not found");
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for IrcPlugin {
    async fn probe(&self, account_id: &str) -> moltis_channels::Result<ChannelHealthSnapshot> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let Some(state) = accounts.get(account_id) else {
            return Ok(ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            });
        };

        let status = state.status.borrow().clone();
        let details = match (state.live(), &status) {
            (Some(live), AuthState::Ready) => format!(
                "{} on {}:{} for {}s",
                live.nick,
                state.config.host,
                state.config.effective_port(),
                live.connected_at.elapsed().as_secs()
            ),
            (_, AuthState::Backoff { attempt, delay }) => format!(
                "reconnecting (attempt {attempt}, next in {}ms)",
                delay.as_millis()
            ),
            (_, other) => other.to_string(),
        };
        Ok(ChannelHealthSnapshot {
            connected: status.is_ready(),
            account_id: account_id.to_string(),
            details: Some(details),
        })
    }
}

/// Restarts an account's connector whenever it gives up, reporting the
/// account as degraded each time.
struct Supervisor {
    account_id: String,
    config: Arc<IrcAccountConfig>,
    deps: ConnectorDeps,
    session: SessionSlot,
    state: watch::Sender<AuthState>,
}

impl Supervisor {
    async fn run(self, cancel: CancellationToken) {
        let mut restarts: u32 = 0;
        loop {
            let connector = AccountConnector::new(
                self.account_id.clone(),
                Arc::clone(&self.config),
                self.deps.clone(),
            )
            .with_shared(Arc::clone(&self.session), self.state.clone());

            let err = match connector.run(cancel.clone()).await {
                Ok(()) => break,
                Err(e) => e,
            };

            restarts += 1;
            let pause = Duration::from_millis(self.config.reconnect.max_delay_ms);
            warn!(
                account_id = %self.account_id,
                restarts,
                error = %err,
                pause_ms = pause.as_millis() as u64,
                "irc account degraded, restarting connector"
            );
            if let Some(sink) = &self.deps.event_sink {
                sink.emit(ChannelEvent::AccountDegraded {
                    channel_type: CHANNEL_TYPE.into(),
                    account_id: self.account_id.clone(),
                    reason: err.to_string(),
                    restarts,
                })
                .await;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {},
            }
        }
        info!(account_id = %self.account_id, "irc account stopped");
    }
}
