//! Minimal IRC line model: parsing of server lines and builders for the
//! handful of commands the connector sends.
//!
//! Only what registration, identification and messaging need is modelled.
//! IRCv3 tags are skipped, numeric replies are kept as their three-digit
//! command string.

use std::fmt;

use crate::error::{Error, Result};

/// Longest line a server relays, CRLF included.
pub const MAX_LINE_BYTES: usize = 512;

/// Room left for the `:nick!user@host ` source the server prepends when it
/// relays our messages.
const SOURCE_RESERVE_BYTES: usize = 100;

/// UTF-8 bytes a PRIVMSG to `target` can carry without the relayed line
/// exceeding [`MAX_LINE_BYTES`].
pub fn privmsg_text_budget(target: &str) -> usize {
    let overhead = SOURCE_RESERVE_BYTES + "PRIVMSG  :\r\n".len() + target.len();
    MAX_LINE_BYTES.saturating_sub(overhead).max(4)
}

pub const RPL_WELCOME: &str = "001";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_NICKCOLLISION: &str = "436";
pub const ERR_PASSWDMISMATCH: &str = "464";
pub const ERR_YOUREBANNEDCREEP: &str = "465";

/// Lowercase a character with the RFC 1459 case mapping.
#[inline]
pub const fn irc_lower_char(c: char) -> char {
    match c {
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        'A'..='Z' => (c as u8 + 32) as char,
        _ => c,
    }
}

/// Lowercase a nick or channel name with the RFC 1459 case mapping.
pub fn irc_to_lower(s: &str) -> String {
    s.chars().map(irc_lower_char).collect()
}

/// Case-insensitive nick/channel comparison.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .chars()
            .zip(b.chars())
            .all(|(x, y)| irc_lower_char(x) == irc_lower_char(y))
}

/// Whether `target` names a channel rather than a nick.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// Whether `c` may appear in a nickname.
pub fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}' | '-'
        )
}

/// Origin of a server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    /// Nick, or the server name for server-originated lines.
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    pub fn parse(raw: &str) -> Self {
        let (nick_user, host) = match raw.split_once('@') {
            Some((left, host)) => (left, Some(host.to_string())),
            None => (raw, None),
        };
        let (nick, user) = match nick_user.split_once('!') {
            Some((nick, user)) => (nick, Some(user.to_string())),
            None => (nick_user, None),
        };
        Self {
            nick: nick.to_string(),
            user,
            host,
        }
    }

    /// `user@host`, when both parts are known.
    pub fn user_host(&self) -> Option<String> {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => Some(format!("{user}@{host}")),
            _ => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nick)?;
        if let Some(user) = &self.user {
            write!(f, "!{user}")?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// A parsed server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    pub prefix: Option<Prefix>,
    /// Uppercased command or three-digit numeric.
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse one line, with or without its trailing CRLF.
    pub fn parse(line: &str) -> Result<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if let Some(tagged) = rest.strip_prefix('@') {
            rest = tagged.split_once(' ').map(|(_, r)| r).unwrap_or("");
        }
        rest = rest.trim_start_matches(' ');

        let prefix = match rest.strip_prefix(':') {
            Some(p) => {
                let (raw, r) = p.split_once(' ').unwrap_or((p, ""));
                rest = r.trim_start_matches(' ');
                Some(Prefix::parse(raw))
            },
            None => None,
        };

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(Error::protocol(format!("empty command in line: {line:?}")));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, r)) => {
                    params.push(param.to_string());
                    rest = r;
                },
                None => {
                    params.push(rest.to_string());
                    break;
                },
            }
        }

        Ok(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// The last parameter, which carries free text for most commands.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().map(|p| p.nick.as_str())
    }
}

/// Outgoing commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pass(String),
    Nick(String),
    User { username: String, realname: String },
    Join(String),
    Privmsg { target: String, text: String },
    Notice { target: String, text: String },
    Pong(String),
    Quit(Option<String>),
}

impl Command {
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Privmsg {
            target: target.into(),
            text: text.into(),
        }
    }

    /// Serialize to a wire line without the trailing CRLF.
    ///
    /// CR, LF and NUL are removed from every argument so one command can
    /// never turn into two lines.
    pub fn to_line(&self) -> String {
        match self {
            Self::Pass(pass) => format!("PASS {}", clean(pass)),
            Self::Nick(nick) => format!("NICK {}", clean(nick)),
            Self::User { username, realname } => {
                format!("USER {} 0 * :{}", clean(username), clean(realname))
            },
            Self::Join(channel) => format!("JOIN {}", clean(channel)),
            Self::Privmsg { target, text } => format!("PRIVMSG {} :{}", clean(target), clean(text)),
            Self::Notice { target, text } => format!("NOTICE {} :{}", clean(target), clean(text)),
            Self::Pong(token) => format!("PONG :{}", clean(token)),
            Self::Quit(Some(reason)) => format!("QUIT :{}", clean(reason)),
            Self::Quit(None) => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Keep secrets out of logs.
            Self::Pass(_) => f.write_str("PASS ****"),
            Self::Privmsg { target, text } if carries_secret(text) => {
                write!(f, "PRIVMSG {target} :****")
            },
            other => f.write_str(&other.to_line()),
        }
    }
}

fn carries_secret(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.starts_with("IDENTIFY ") || upper.starts_with("REGISTER ")
}

fn clean(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, '\r' | '\n' | '\0')).collect()
}
