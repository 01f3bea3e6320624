//! Per-account connector: keeps a session up, classifies inbound traffic
//! and delivers agent replies.

use std::{io, sync::Arc, time::Instant};

use {
    futures::StreamExt,
    moltis_channels::{
        ChannelEvent, ChannelEventSink,
        message_log::{MessageLog, MessageLogEntry},
        store::PairingStore,
    },
    moltis_common::types::{ChatType, now_ms},
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use moltis_metrics::{counter, gauge, irc as irc_metrics, labels};

use crate::{
    CHANNEL_TYPE,
    access::{AccessDenied, check_access},
    agent::{AgentReply, IrcAgent},
    auth::{AuthSession, AuthState, ReadySession},
    config::IrcAccountConfig,
    error::{Error, Result},
    mention::{Mention, MentionMatcher, strip_leading_address},
    outbound::{Delivery, DeliverySettings},
    protocol::{Command, IrcMessage, Prefix, irc_eq},
    scope::{self, ChannelScope, EffectiveConfig},
    state::{LiveSession, SessionSlot},
    transport::{Dialer, IrcWriter, LineStream},
    types::{InboundContext, IrcInboundMessage, IrcSender},
};

/// Collaborators shared by every connector of a manager.
#[derive(Clone)]
pub struct ConnectorDeps {
    pub dialer: Arc<dyn Dialer>,
    pub agent: Arc<dyn IrcAgent>,
    pub pairings: Arc<dyn PairingStore>,
    pub message_log: Option<Arc<dyn MessageLog>>,
    pub event_sink: Option<Arc<dyn ChannelEventSink>>,
}

/// What to do with one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Hand to the agent.
    Dispatch(Mention),
    /// Policy said no. Recorded to history, not forwarded.
    Denied(AccessDenied),
    /// Allowed but the bot was not addressed. Recorded, not forwarded.
    Unaddressed,
    /// The channel is disabled. Neither recorded nor forwarded.
    Disabled,
}

/// An inbound message after normalization and policy.
#[derive(Debug, Clone)]
pub struct Classified {
    pub message: IrcInboundMessage,
    pub effective: EffectiveConfig,
    pub disposition: Disposition,
}

impl Classified {
    pub fn chat_type(&self) -> ChatType {
        if self.message.is_group {
            ChatType::Group
        } else {
            ChatType::Dm
        }
    }

    fn log_entry(&self, account_id: &str) -> MessageLogEntry {
        MessageLogEntry {
            account_id: account_id.to_string(),
            channel_type: CHANNEL_TYPE.to_string(),
            peer_id: self.message.sender_nick.clone(),
            chat_id: self.message.target.clone(),
            chat_type: self.chat_type(),
            body: self.message.text.clone(),
            access_granted: !matches!(self.disposition, Disposition::Denied(_)),
            created_at: self.message.timestamp,
        }
    }
}

/// Normalize a PRIVMSG and decide its fate. Does no I/O beyond the pairing
/// lookup.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    account_id: &str,
    config: &IrcAccountConfig,
    pairings: &dyn PairingStore,
    matcher: &MentionMatcher,
    own_nick: &str,
    prefix: &Prefix,
    raw_target: &str,
    text: &str,
) -> Classified {
    let sender = IrcSender::from_prefix(prefix);
    let scope = ChannelScope::classify(raw_target, &sender.nick);
    let effective = scope::resolve(config, &scope, &sender);
    let is_group = scope.is_group();

    let disposition = match check_access(account_id, config, &effective, &sender, pairings) {
        Err(AccessDenied::ScopeDisabled) => Disposition::Disabled,
        Err(reason) => Disposition::Denied(reason),
        Ok(()) => match matcher.addressed(is_group, effective.require_mention, text) {
            Some(mention) => Disposition::Dispatch(mention),
            None => Disposition::Unaddressed,
        },
    };

    let text = if is_group && matches!(disposition, Disposition::Dispatch(_)) {
        strip_leading_address(text, own_nick)
    } else {
        text
    };

    let message = IrcInboundMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        target: scope.id().to_string(),
        raw_target: Some(raw_target.to_string()),
        sender_nick: sender.nick,
        sender_user: sender.user,
        sender_host: sender.host,
        text: text.to_string(),
        timestamp: now_ms(),
        is_group,
    };
    Classified {
        message,
        effective,
        disposition,
    }
}

/// Owns the connection of one account.
pub struct AccountConnector {
    account_id: String,
    config: Arc<IrcAccountConfig>,
    deps: ConnectorDeps,
    session: SessionSlot,
    state: watch::Sender<AuthState>,
}

impl AccountConnector {
    pub fn new(
        account_id: impl Into<String>,
        config: Arc<IrcAccountConfig>,
        deps: ConnectorDeps,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Disconnected);
        Self {
            account_id: account_id.into(),
            config,
            deps,
            session: SessionSlot::default(),
            state,
        }
    }

    /// Share state with an existing account entry.
    #[must_use]
    pub fn with_shared(mut self, session: SessionSlot, state: watch::Sender<AuthState>) -> Self {
        self.session = session;
        self.state = state;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn session_slot(&self) -> SessionSlot {
        Arc::clone(&self.session)
    }

    /// Keep the account connected until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation and [`Error::Exhausted`] when the
    /// session gave up after too many consecutive failures.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut auth = AuthSession::with_state(
            self.account_id.clone(),
            Arc::clone(&self.config),
            self.state.clone(),
        );
        let forwarder = self.spawn_state_forwarder();

        let outcome = loop {
            let ready = match auth.establish(self.deps.dialer.as_ref(), &cancel).await {
                Ok(ready) => ready,
                Err(Error::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            };

            let up_since = tokio::time::Instant::now();
            let result = self.serve(ready, &cancel).await;
            self.publish(None);
            match result {
                Ok(()) => {
                    auth.disconnected();
                    break Ok(());
                },
                Err(e) => {
                    warn!(account_id = %self.account_id, error = %e, "irc connection lost");
                    if auth.connection_lost(up_since.elapsed(), &cancel).await.is_err() {
                        break Ok(());
                    }
                },
            }
        };

        if let Some(task) = forwarder {
            task.abort();
        }
        outcome
    }

    fn spawn_state_forwarder(&self) -> Option<tokio::task::JoinHandle<()>> {
        let sink = self.deps.event_sink.clone()?;
        let mut rx = self.state.subscribe();
        let account_id = self.account_id.clone();
        Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().to_string();
                sink.emit(ChannelEvent::AccountStateChanged {
                    channel_type: CHANNEL_TYPE.into(),
                    account_id: account_id.clone(),
                    state,
                })
                .await;
            }
        }))
    }

    fn publish(&self, live: Option<LiveSession>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = live;
    }

    /// Run one ready session until it drops. `Ok(())` means we were asked
    /// to stop.
    async fn serve(&self, ready: ReadySession, cancel: &CancellationToken) -> Result<()> {
        let ReadySession {
            nick,
            writer,
            mut stream,
        } = ready;
        let session_cancel = cancel.child_token();
        self.publish(Some(LiveSession {
            nick: nick.clone(),
            writer: writer.clone(),
            connected_at: Instant::now(),
            cancel: session_cancel.clone(),
        }));

        let joins: Vec<Command> = self
            .config
            .channels
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Command::Join(c.trim().to_string()))
            .collect();
        if !joins.is_empty() {
            writer.send_batch(&joins).await?;
            info!(account_id = %self.account_id, channels = ?self.config.channels, "irc joined channels");
        }

        #[cfg(feature = "metrics")]
        gauge!(irc_metrics::READY_ACCOUNTS).increment(1.0);
        let result = self.read_loop(&mut stream, &writer, nick, &session_cancel, cancel).await;
        session_cancel.cancel();
        #[cfg(feature = "metrics")]
        gauge!(irc_metrics::READY_ACCOUNTS).decrement(1.0);
        result
    }

    async fn read_loop(
        &self,
        stream: &mut LineStream,
        writer: &IrcWriter,
        mut nick: String,
        session_cancel: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut matcher =
            MentionMatcher::new(&self.config.nick, &self.config.mention_patterns).with_nick(&nick);

        loop {
            let line = tokio::select! {
                biased;
                () = session_cancel.cancelled() => {
                    if cancel.is_cancelled() {
                        let _ = writer.send(&Command::Quit(Some("shutting down".into()))).await;
                        return Ok(());
                    }
                    return Err(Error::transport(
                        "outbound",
                        io::Error::new(io::ErrorKind::BrokenPipe, "send failed, reconnecting"),
                    ));
                },
                line = stream.next() => line,
            };
            let line = match line {
                Some(line) => line?,
                None => {
                    return Err(Error::transport(
                        "read line",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
                    ));
                },
            };
            let msg = match IrcMessage::parse(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(account_id = %self.account_id, error = %e, "skipping unparseable line");
                    continue;
                },
            };

            match msg.command.as_str() {
                "PING" => {
                    writer
                        .send(&Command::Pong(msg.trailing().unwrap_or_default().to_string()))
                        .await?;
                },
                "ERROR" => {
                    return Err(Error::transport(
                        "server error",
                        io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            msg.trailing().unwrap_or("closed by server").to_string(),
                        ),
                    ));
                },
                "NICK" => {
                    if msg.source_nick().is_some_and(|n| irc_eq(n, &nick))
                        && let Some(new_nick) = msg.trailing()
                    {
                        info!(account_id = %self.account_id, old = %nick, new = %new_nick, "irc nick changed");
                        nick = new_nick.to_string();
                        matcher = matcher.with_nick(&nick);
                        if let Some(live) = self.session.write().unwrap_or_else(|e| e.into_inner()).as_mut() {
                            live.nick = nick.clone();
                        }
                    }
                },
                "PRIVMSG" => {
                    self.on_privmsg(&msg, &nick, &matcher, writer, session_cancel)
                        .await;
                },
                _ => {},
            }
        }
    }

    async fn on_privmsg(
        &self,
        msg: &IrcMessage,
        nick: &str,
        matcher: &MentionMatcher,
        writer: &IrcWriter,
        session_cancel: &CancellationToken,
    ) {
        let (Some(prefix), Some(raw_target), Some(text)) =
            (msg.prefix.as_ref(), msg.param(0), msg.param(1))
        else {
            return;
        };
        if irc_eq(&prefix.nick, nick) {
            return;
        }
        if text.starts_with('\u{1}') {
            debug!(account_id = %self.account_id, from = %prefix.nick, "ignoring ctcp");
            return;
        }

        #[cfg(feature = "metrics")]
        counter!(irc_metrics::MESSAGES_RECEIVED_TOTAL, labels::ACCOUNT_ID => self.account_id.clone())
            .increment(1);

        let classified = classify(
            &self.account_id,
            &self.config,
            self.deps.pairings.as_ref(),
            matcher,
            nick,
            prefix,
            raw_target,
            text,
        );
        let chat_type = classified.chat_type();

        match &classified.disposition {
            Disposition::Disabled => {
                debug!(account_id = %self.account_id, target = %classified.message.target, "irc channel disabled, dropping");
                return;
            },
            Disposition::Denied(reason) => {
                debug!(
                    account_id = %self.account_id,
                    target = %classified.message.target,
                    from = %classified.message.sender_nick,
                    reason = reason.code(),
                    "irc access denied"
                );
                #[cfg(feature = "metrics")]
                counter!(
                    irc_metrics::ACCESS_CONTROL_DENIALS_TOTAL,
                    labels::ACCOUNT_ID => self.account_id.clone(),
                    labels::REASON => reason.code()
                )
                .increment(1);
            },
            Disposition::Unaddressed => {
                debug!(account_id = %self.account_id, target = %classified.message.target, "irc message not addressed to bot");
                #[cfg(feature = "metrics")]
                counter!(irc_metrics::UNADDRESSED_TOTAL, labels::ACCOUNT_ID => self.account_id.clone())
                    .increment(1);
            },
            Disposition::Dispatch(_) => {},
        }

        let history = self.history_for(&classified).await;
        self.record(&classified).await;
        if let Some(sink) = &self.deps.event_sink {
            sink.emit(ChannelEvent::InboundMessage {
                channel_type: CHANNEL_TYPE.into(),
                account_id: self.account_id.clone(),
                peer_id: classified.message.sender_nick.clone(),
                chat_id: classified.message.target.clone(),
                access_granted: !matches!(classified.disposition, Disposition::Denied(_)),
            })
            .await;
        }

        let Disposition::Dispatch(mention) = classified.disposition else {
            return;
        };
        #[cfg(feature = "metrics")]
        counter!(
            irc_metrics::MESSAGES_DISPATCHED_TOTAL,
            labels::ACCOUNT_ID => self.account_id.clone(),
            labels::CHAT_TYPE => chat_type.as_str()
        )
        .increment(1);
        debug!(
            account_id = %self.account_id,
            target = %classified.message.target,
            chat_type = %chat_type,
            "irc dispatching message to agent"
        );

        let context = InboundContext {
            account_id: self.account_id.clone(),
            effective: classified.effective,
            mention: Some(mention),
            history,
        };
        tokio::spawn(respond(
            self.account_id.clone(),
            Arc::clone(&self.deps.agent),
            writer.clone(),
            DeliverySettings::from_config(&self.config),
            classified.message,
            context,
            session_cancel.clone(),
        ));
    }

    async fn history_for(&self, classified: &Classified) -> Vec<MessageLogEntry> {
        let (Some(log), Some(limit)) = (&self.deps.message_log, classified.effective.history_limit)
        else {
            return Vec::new();
        };
        if limit == 0 || !matches!(classified.disposition, Disposition::Dispatch(_)) {
            return Vec::new();
        }
        match log
            .recent(&self.account_id, &classified.message.target, limit)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "irc history lookup failed");
                Vec::new()
            },
        }
    }

    async fn record(&self, classified: &Classified) {
        let Some(log) = &self.deps.message_log else {
            return;
        };
        if let Err(e) = log.log(classified.log_entry(&self.account_id)).await {
            warn!(account_id = %self.account_id, error = %e, "irc message log write failed");
        }
    }
}

/// Ask the agent and deliver its reply. A transport failure while sending
/// tears the session down so the connector reconnects.
async fn respond(
    account_id: String,
    agent: Arc<dyn IrcAgent>,
    writer: IrcWriter,
    settings: DeliverySettings,
    message: IrcInboundMessage,
    context: InboundContext,
    session_cancel: CancellationToken,
) {
    let target = message.target.clone();
    let reply = tokio::select! {
        () = session_cancel.cancelled() => return,
        reply = agent.handle(&account_id, message, context) => reply,
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            warn!(account_id = %account_id, target = %target, error = %e, "irc agent failed");
            return;
        },
    };

    let _lane = writer.lane(&target).await;
    let delivery = Delivery {
        account_id: &account_id,
        writer: &writer,
        target: &target,
        settings: &settings,
    };
    let sent = match reply {
        AgentReply::Text(text) => delivery.text(&text).await,
        AgentReply::Payload(payload) => delivery.payload(&payload).await,
        AgentReply::Stream(stream) => delivery.stream(stream, &session_cancel).await,
        AgentReply::Silent => Ok(0),
    };
    match sent {
        Ok(chunks) => debug!(account_id = %account_id, target = %target, chunks, "irc reply delivered"),
        Err(e) if e.is_transport() => {
            warn!(account_id = %account_id, target = %target, error = %e, "irc reply interrupted");
            session_cancel.cancel();
        },
        Err(e) => warn!(account_id = %account_id, target = %target, error = %e, "irc reply rejected"),
    }
}
