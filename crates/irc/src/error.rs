use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Channel(#[from] moltis_channels::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("tls error: {0}")]
    Tls(String),

    /// Connect, read or write failure on the transport.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The server or NickServ rejected our credentials.
    #[error("authentication rejected: {message}")]
    Auth { message: String },

    /// The server refused or aborted registration.
    #[error("registration failed: {message}")]
    Registration { message: String },

    #[error("timed out during {phase}")]
    Timeout { phase: &'static str },

    #[error("failed to read credential file {path}: {source}")]
    Credential {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("invalid irc config: {message}")]
    Config { message: String },

    /// Too many consecutive failed connection cycles.
    #[error("gave up after {failures} consecutive failed connection attempts")]
    Exhausted { failures: u32 },

    #[error("irc account {account_id} is not connected")]
    NotConnected { account_id: String },

    #[error("unknown irc account: {account_id}")]
    UnknownAccount { account_id: String },

    #[error("media is {size} bytes, limit is {limit}")]
    MediaTooLarge { size: u64, limit: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn transport(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Credential problems that likely need an operator to fix.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Credential { .. })
    }

    /// Connection-level failures that are retried silently.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Tls(_) | Self::Transport { .. } | Self::Timeout { .. }
        )
    }
}

impl moltis_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<Error> for moltis_channels::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Channel(inner) => inner,
            Error::UnknownAccount { account_id } => Self::unknown_account(account_id),
            Error::NotConnected { .. } => Self::unavailable(err),
            Error::Config { message } => Self::invalid_input(message),
            other => Self::external("irc", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

moltis_common::impl_context!();
