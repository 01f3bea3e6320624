//! Connection and authentication state machine.
//!
//! One [`AuthSession`] per account drives dial → registration → NickServ
//! identification, and loops through exponential backoff on any failure
//! until a session is ready, the caller cancels, or the configured number
//! of consecutive failures is reached.

use std::{fmt, io, sync::Arc, time::Duration};

use {
    futures::StreamExt,
    rand::Rng,
    secrecy::ExposeSecret,
    tokio::{sync::watch, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use moltis_metrics::{counter, histogram, irc as irc_metrics, labels};

use crate::{
    config::{IrcAccountConfig, ReconnectConfig},
    error::{Error, Result},
    protocol::{self, Command, IrcMessage},
    transport::{Connection, Dialer, IrcWriter, LineStream},
};

/// Alternate nicks tried after a collision before the cycle fails.
pub const MAX_NICK_RETRIES: u32 = 3;

/// RPL_LOGGEDIN, sent by services-aware servers after identification.
const RPL_LOGGEDIN: &str = "900";

/// Uptime after which a dropped session no longer counts toward the
/// reconnect backoff.
pub const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Connection lifecycle of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Connecting,
    Registering,
    Identifying,
    Ready,
    /// Waiting `delay` before connection attempt number `attempt + 1`.
    Backoff { attempt: u32, delay: Duration },
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Backoff { .. } => "backoff",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Each call doubles the base delay up
    /// to the cap; jitter never pushes it past the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt.min(31)));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A registered (and identified, when configured) connection.
pub struct ReadySession {
    /// Nick the server accepted, which may differ from the configured one
    /// after a collision.
    pub nick: String,
    pub writer: IrcWriter,
    pub stream: LineStream,
}

impl fmt::Debug for ReadySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySession")
            .field("nick", &self.nick)
            .finish_non_exhaustive()
    }
}

/// What a NickServ notice tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NickServReply {
    Identified,
    Rejected,
    NotRegistered,
    Other,
}

/// Classify NickServ notice text across the common services packages
/// (Atheme, Anope, ...).
pub fn classify_nickserv_notice(text: &str) -> NickServReply {
    let text = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&["is not registered", "isn't registered", "not a registered", "is not a registered"]) {
        NickServReply::NotRegistered
    } else if any(&[
        "invalid password",
        "incorrect password",
        "password incorrect",
        "wrong password",
        "authentication failed",
        "access denied",
    ]) {
        NickServReply::Rejected
    } else if any(&[
        "you are now identified",
        "you are successfully identified",
        "password accepted",
        "you are now logged in",
        "is now registered",
        "registered under your account",
    ]) {
        NickServReply::Identified
    } else {
        NickServReply::Other
    }
}

/// Per-account connection state machine.
pub struct AuthSession {
    account_id: String,
    config: Arc<IrcAccountConfig>,
    state: watch::Sender<AuthState>,
    backoff: Backoff,
    failures: u32,
}

impl AuthSession {
    pub fn new(account_id: impl Into<String>, config: Arc<IrcAccountConfig>) -> Self {
        let (state, _) = watch::channel(AuthState::Disconnected);
        Self::with_state(account_id, config, state)
    }

    /// Publish state transitions on an existing channel, so observers keep
    /// their receiver across session restarts.
    pub fn with_state(
        account_id: impl Into<String>,
        config: Arc<IrcAccountConfig>,
        state: watch::Sender<AuthState>,
    ) -> Self {
        let backoff = Backoff::new(&config.reconnect);
        state.send_replace(AuthState::Disconnected);
        Self {
            account_id: account_id.into(),
            config,
            state,
            backoff,
            failures: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Failed cycles since the last ready session.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Record that a ready session was closed on request.
    pub fn disconnected(&self) {
        self.set_state(AuthState::Disconnected);
    }

    /// Record that a ready session dropped after `uptime` and wait out the
    /// reconnect delay.
    ///
    /// Sessions shorter than [`STABLE_SESSION`] keep growing the delay, so
    /// a server that welcomes and then drops us is not redialed in a loop.
    pub async fn connection_lost(
        &mut self,
        uptime: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if uptime >= STABLE_SESSION {
            self.backoff.reset();
        }
        let delay = self.backoff.next_delay();
        self.set_state(AuthState::Backoff {
            attempt: self.backoff.attempt(),
            delay,
        });
        info!(
            account_id = %self.account_id,
            uptime_ms = uptime.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "irc session lost, reconnecting after delay"
        );
        self.wait(delay, cancel).await
    }

    async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.set_state(AuthState::Disconnected);
                Err(Error::Cancelled)
            },
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn set_state(&self, next: AuthState) {
        debug!(account_id = %self.account_id, state = %next, "irc auth state");
        self.state.send_replace(next);
    }

    /// Connect and authenticate, retrying with backoff until ready.
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires (including during a
    /// backoff wait) and [`Error::Exhausted`] after
    /// `reconnect.maxConsecutiveFailures` failed cycles in a row (0 means
    /// never give up).
    pub async fn establish(
        &mut self,
        dialer: &dyn Dialer,
        cancel: &CancellationToken,
    ) -> Result<ReadySession> {
        loop {
            if cancel.is_cancelled() {
                self.set_state(AuthState::Disconnected);
                return Err(Error::Cancelled);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Cancelled),
                outcome = self.attempt(dialer) => outcome,
            };

            let err = match outcome {
                Ok(session) => {
                    self.failures = 0;
                    self.set_state(AuthState::Ready);
                    info!(
                        account_id = %self.account_id,
                        nick = %session.nick,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "irc session ready"
                    );
                    #[cfg(feature = "metrics")]
                    histogram!(irc_metrics::CONNECT_DURATION_SECONDS, labels::ACCOUNT_ID => self.account_id.clone())
                        .record(started.elapsed().as_secs_f64());
                    return Ok(session);
                },
                Err(Error::Cancelled) => {
                    self.set_state(AuthState::Disconnected);
                    return Err(Error::Cancelled);
                },
                Err(e) => e,
            };

            self.failures += 1;
            if err.is_auth() {
                error!(
                    account_id = %self.account_id,
                    attempt = self.failures,
                    error = %err,
                    "irc authentication failed; check the configured credentials"
                );
                #[cfg(feature = "metrics")]
                counter!(irc_metrics::AUTH_FAILURES_TOTAL, labels::ACCOUNT_ID => self.account_id.clone())
                    .increment(1);
            } else {
                warn!(
                    account_id = %self.account_id,
                    attempt = self.failures,
                    error = %err,
                    "irc connection attempt failed"
                );
            }

            let limit = self.config.reconnect.max_consecutive_failures;
            if limit > 0 && self.failures >= limit {
                self.set_state(AuthState::Disconnected);
                return Err(Error::Exhausted {
                    failures: self.failures,
                });
            }

            let delay = self.backoff.next_delay();
            self.set_state(AuthState::Backoff {
                attempt: self.failures,
                delay,
            });
            #[cfg(feature = "metrics")]
            counter!(irc_metrics::BACKOFF_CYCLES_TOTAL, labels::ACCOUNT_ID => self.account_id.clone())
                .increment(1);
            info!(
                account_id = %self.account_id,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                "irc reconnecting after delay"
            );

            self.wait(delay, cancel).await?;
        }
    }

    /// One connection cycle: dial, register, identify. No retry and no
    /// backoff bookkeeping.
    pub async fn attempt(&self, dialer: &dyn Dialer) -> Result<ReadySession> {
        let cfg = &self.config;
        self.set_state(AuthState::Connecting);
        let Connection { sink, mut stream } = dialer
            .dial(&cfg.host, cfg.effective_port(), cfg.tls)
            .await?;
        let writer = IrcWriter::new(sink);

        self.set_state(AuthState::Registering);
        let nick = tokio::time::timeout(
            cfg.registration_timeout(),
            self.register(&writer, &mut stream),
        )
        .await
        .map_err(|_| Error::Timeout {
            phase: "registration",
        })??;

        if cfg.nickserv.is_enabled() {
            self.set_state(AuthState::Identifying);
            self.identify(&writer, &mut stream, &nick).await?;
        }

        Ok(ReadySession {
            nick,
            writer,
            stream,
        })
    }

    /// Send PASS/NICK/USER and wait for RPL_WELCOME.
    async fn register(&self, writer: &IrcWriter, stream: &mut LineStream) -> Result<String> {
        let cfg = &self.config;
        let mut commands = Vec::with_capacity(3);
        if let Some(source) = cfg.credential() {
            let password = source.resolve().await?;
            commands.push(Command::Pass(password.expose_secret().clone()));
        }
        let mut nick = cfg.nick.clone();
        commands.push(Command::Nick(nick.clone()));
        commands.push(Command::User {
            username: cfg.username().to_string(),
            realname: cfg.realname().to_string(),
        });
        writer.send_batch(&commands).await?;

        let mut collisions = 0;
        loop {
            let Some(msg) = next_message(stream, writer).await? else {
                continue;
            };
            match msg.command.as_str() {
                protocol::RPL_WELCOME => {
                    if let Some(accepted) = msg.param(0).filter(|n| !n.is_empty() && *n != "*") {
                        nick = accepted.to_string();
                    }
                    return Ok(nick);
                },
                protocol::ERR_NICKNAMEINUSE | protocol::ERR_NICKCOLLISION => {
                    collisions += 1;
                    if collisions > MAX_NICK_RETRIES {
                        return Err(Error::Registration {
                            message: format!("nick {} and alternates are in use", cfg.nick),
                        });
                    }
                    nick.push('_');
                    info!(account_id = %self.account_id, %nick, "irc nick in use, trying alternate");
                    writer.send(&Command::Nick(nick.clone())).await?;
                },
                protocol::ERR_ERRONEUSNICKNAME | protocol::ERR_NONICKNAMEGIVEN => {
                    return Err(Error::Registration {
                        message: format!("server rejected nick {nick}"),
                    });
                },
                protocol::ERR_PASSWDMISMATCH => {
                    return Err(Error::auth("server password rejected"));
                },
                protocol::ERR_YOUREBANNEDCREEP | "ERROR" => {
                    return Err(Error::Registration {
                        message: msg.trailing().unwrap_or("closed by server").to_string(),
                    });
                },
                _ => {},
            }
        }
    }

    /// Identify (or register) with NickServ and wait for its verdict.
    ///
    /// No reply within `identifyWaitMs` counts as success: many networks
    /// stay silent on a correct password.
    async fn identify(&self, writer: &IrcWriter, stream: &mut LineStream, nick: &str) -> Result<()> {
        let cfg = &self.config;
        let service = cfg.nickserv.service.as_str();
        let Some(source) = cfg.nickserv_credential() else {
            warn!(account_id = %self.account_id, "nickserv enabled without a password, skipping identify");
            return Ok(());
        };
        let password = source.resolve().await?;
        writer
            .send(&Command::privmsg(
                service,
                format!("IDENTIFY {}", password.expose_secret()),
            ))
            .await?;

        let deadline = Instant::now() + cfg.identify_wait();
        let mut register_sent = false;
        loop {
            let msg = tokio::select! {
                msg = next_message(stream, writer) => msg?,
                () = tokio::time::sleep_until(deadline) => {
                    debug!(account_id = %self.account_id, "no nickserv verdict, assuming identified");
                    return Ok(());
                },
            };
            let Some(msg) = msg else { continue };

            if msg.command == RPL_LOGGEDIN {
                return Ok(());
            }
            if msg.command == "ERROR" {
                return Err(Error::transport(
                    "identify",
                    io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        msg.trailing().unwrap_or("closed by server").to_string(),
                    ),
                ));
            }
            let from_service = msg
                .source_nick()
                .is_some_and(|source| protocol::irc_eq(source, service));
            if msg.command != "NOTICE" || !from_service {
                continue;
            }

            let text = msg.trailing().unwrap_or_default();
            match classify_nickserv_notice(text) {
                NickServReply::Identified => {
                    info!(account_id = %self.account_id, %nick, "identified with nickserv");
                    return Ok(());
                },
                NickServReply::Rejected => return Err(Error::auth(format!("{service}: {text}"))),
                NickServReply::NotRegistered if cfg.nickserv.register && !register_sent => {
                    let email = cfg.nickserv.register_email.as_deref().unwrap_or_default();
                    info!(account_id = %self.account_id, %nick, "registering nick with nickserv");
                    writer
                        .send(&Command::privmsg(
                            service,
                            format!("REGISTER {} {email}", password.expose_secret()),
                        ))
                        .await?;
                    register_sent = true;
                },
                NickServReply::NotRegistered => {
                    if !register_sent {
                        warn!(
                            account_id = %self.account_id,
                            %nick,
                            "nick is not registered with nickserv and register is off"
                        );
                        return Ok(());
                    }
                },
                NickServReply::Other => {},
            }
        }
    }
}

/// Read the next parseable line, answering PINGs on the way. Returns
/// `None` for lines that were consumed or unparseable.
async fn next_message(stream: &mut LineStream, writer: &IrcWriter) -> Result<Option<IrcMessage>> {
    let line = stream.next().await.ok_or_else(|| {
        Error::transport(
            "read line",
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        )
    })??;
    let msg = match IrcMessage::parse(&line) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "skipping unparseable line");
            return Ok(None);
        },
    };
    if msg.command == "PING" {
        writer
            .send(&Command::Pong(msg.trailing().unwrap_or_default().to_string()))
            .await?;
        return Ok(None);
    }
    Ok(Some(msg))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn reconnect(base: u64, max: u64, jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            max_consecutive_failures: 10,
            jitter,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(&reconnect(100, 1000, 0.0));
        let delays: Vec<u128> = (0..6).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_jitter_stays_in_band_and_under_cap() {
        let mut b = Backoff::new(&reconnect(1000, 4000, 0.2));
        for expected in [1000.0, 2000.0, 4000.0, 4000.0] {
            let ms = b.next_delay().as_millis() as f64;
            assert!(ms >= expected * 0.8 - 1.0, "{ms} vs {expected}");
            assert!(ms <= 4000.0);
        }
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut b = Backoff::new(&reconnect(2000, 300_000, 0.0));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_millis(300_000));
        }
        assert_eq!(b.attempt(), 100);
    }

    #[rstest]
    #[case("You are now identified for moltbot.", NickServReply::Identified)]
    #[case("Password accepted - you are now recognized.", NickServReply::Identified)]
    #[case("moltbot is now registered to bot@example.org.", NickServReply::Identified)]
    #[case("Invalid password for moltbot.", NickServReply::Rejected)]
    #[case("Password incorrect.", NickServReply::Rejected)]
    #[case("moltbot is not a registered nickname.", NickServReply::NotRegistered)]
    #[case("Nick moltbot isn't registered.", NickServReply::NotRegistered)]
    #[case("This nickname is registered. Please choose a different nickname.", NickServReply::Other)]
    fn nickserv_notices(#[case] text: &str, #[case] expected: NickServReply) {
        assert_eq!(classify_nickserv_notice(text), expected);
    }

    #[test]
    fn state_names() {
        assert_eq!(AuthState::Ready.to_string(), "ready");
        let backoff = AuthState::Backoff {
            attempt: 2,
            delay: Duration::from_secs(1),
        };
        assert_eq!(backoff.as_str(), "backoff");
        assert!(!backoff.is_ready());
    }
}
