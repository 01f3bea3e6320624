use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    time::Duration,
};

use {
    moltis_channels::gating::{DmPolicy, GroupPolicy},
    moltis_config::Diagnostic,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Map, Value},
};

use crate::error::{Error, Result};

/// Default outbound chunk size, in characters.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 350;

/// Account used when the config has no `accounts` map.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Nested objects merged key-by-key when an account inherits top-level
/// settings. Every other key is replaced wholesale.
const DEEP_MERGED_KEYS: &[&str] = &["nickserv", "blockStreamingCoalesce", "reconnect"];

/// How outbound text is cut into wire-sized chunks.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Hard split at the limit.
    #[default]
    Length,
    /// Prefer the last line break within the limit.
    Newline,
}

/// Where a secret comes from. A file reference wins over an inline value.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Inline(Secret<String>),
    File(PathBuf),
}

impl CredentialSource {
    fn pick(inline: Option<&Secret<String>>, file: Option<&PathBuf>) -> Option<Self> {
        match (file, inline) {
            (Some(path), _) => Some(Self::File(path.clone())),
            (None, Some(secret)) if !secret.expose_secret().is_empty() => {
                Some(Self::Inline(secret.clone()))
            },
            _ => None,
        }
    }

    /// Read the secret. Files are read on every call so a rotated password
    /// is picked up on the next connection attempt.
    pub async fn resolve(&self) -> Result<Secret<String>> {
        match self {
            Self::Inline(secret) => Ok(secret.clone()),
            Self::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| Error::Credential {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(Secret::new(raw.trim_end_matches(['\r', '\n']).to_string()))
            },
        }
    }
}

/// NickServ identification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NickServConfig {
    /// Defaults to on when a NickServ credential is configured.
    pub enabled: Option<bool>,
    pub service: String,
    pub password: Option<Secret<String>>,
    pub password_file: Option<PathBuf>,
    /// Register the nick when NickServ reports it unclaimed.
    pub register: bool,
    pub register_email: Option<String>,
}

impl Default for NickServConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            service: "NickServ".into(),
            password: None,
            password_file: None,
            register: false,
            register_email: None,
        }
    }
}

impl NickServConfig {
    #[must_use]
    pub fn credential(&self) -> Option<CredentialSource> {
        CredentialSource::pick(self.password.as_ref(), self.password_file.as_ref())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or_else(|| self.credential().is_some())
    }
}

/// Per-channel overrides, keyed by channel name (or `*` for every channel).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IrcChannelConfig {
    pub require_mention: Option<bool>,
    pub tools: Option<Value>,
    /// Tool overrides keyed by sender pattern (nick or user@host glob).
    pub tools_by_sender: HashMap<String, Value>,
    pub skills: Option<Vec<String>>,
    pub enabled: Option<bool>,
    /// Extra senders allowed in this channel, on top of `groupAllowFrom`.
    pub allow_from: Vec<String>,
    pub system_prompt: Option<String>,
}

/// Per-DM-peer overrides, keyed by nick.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IrcDmConfig {
    pub tools: Option<Value>,
    pub skills: Option<Vec<String>>,
    pub system_prompt: Option<String>,
}

/// Size and idle triggers for streamed responses.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CoalesceConfig {
    pub min_chars: usize,
    pub idle_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            min_chars: 200,
            idle_ms: 1000,
        }
    }
}

impl CoalesceConfig {
    #[must_use]
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failed cycles in a row before the account is restarted and reported
    /// degraded.
    pub max_consecutive_failures: u32,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            max_consecutive_failures: 10,
            jitter: 0.2,
        }
    }
}

/// Configuration for a single IRC account.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IrcAccountConfig {
    /// Display name.
    pub name: Option<String>,
    pub enabled: bool,
    pub host: String,
    /// Defaults to 6697 with TLS, 6667 without.
    pub port: Option<u16>,
    pub tls: bool,
    pub nick: String,
    pub username: Option<String>,
    pub realname: Option<String>,
    /// Server password (`PASS`). Also used for NickServ when the NickServ
    /// block has no credential of its own.
    pub password: Option<Secret<String>>,
    pub password_file: Option<PathBuf>,
    pub nickserv: NickServConfig,

    pub dm_policy: DmPolicy,
    pub allow_from: Vec<String>,
    pub group_policy: GroupPolicy,
    pub group_allow_from: Vec<String>,
    pub groups: HashMap<String, IrcChannelConfig>,
    /// Channels joined once the session is ready.
    pub channels: Vec<String>,
    pub require_mention: bool,
    pub mention_patterns: Vec<String>,

    pub history_limit: Option<usize>,
    pub dm_history_limit: Option<usize>,
    pub dms: HashMap<String, IrcDmConfig>,

    pub text_chunk_limit: usize,
    pub chunk_mode: ChunkMode,
    pub block_streaming: bool,
    pub block_streaming_coalesce: CoalesceConfig,
    pub response_prefix: Option<String>,
    pub media_max_mb: f64,

    pub reconnect: ReconnectConfig,
    pub registration_timeout_ms: u64,
    pub identify_wait_ms: u64,
}

impl Default for IrcAccountConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            host: String::new(),
            port: None,
            tls: true,
            nick: String::new(),
            username: None,
            realname: None,
            password: None,
            password_file: None,
            nickserv: NickServConfig::default(),
            dm_policy: DmPolicy::default(),
            allow_from: Vec::new(),
            group_policy: GroupPolicy::default(),
            group_allow_from: Vec::new(),
            groups: HashMap::new(),
            channels: Vec::new(),
            require_mention: true,
            mention_patterns: Vec::new(),
            history_limit: None,
            dm_history_limit: None,
            dms: HashMap::new(),
            text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            chunk_mode: ChunkMode::default(),
            block_streaming: false,
            block_streaming_coalesce: CoalesceConfig::default(),
            response_prefix: None,
            media_max_mb: 5.0,
            reconnect: ReconnectConfig::default(),
            registration_timeout_ms: 30_000,
            identify_wait_ms: 10_000,
        }
    }
}

impl IrcAccountConfig {
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 6697 } else { 6667 })
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nick)
    }

    #[must_use]
    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or("moltis")
    }

    /// Server password source.
    #[must_use]
    pub fn credential(&self) -> Option<CredentialSource> {
        CredentialSource::pick(self.password.as_ref(), self.password_file.as_ref())
    }

    /// NickServ password source, falling back to the server password.
    #[must_use]
    pub fn nickserv_credential(&self) -> Option<CredentialSource> {
        self.nickserv.credential().or_else(|| self.credential())
    }

    #[must_use]
    pub fn media_max_bytes(&self) -> u64 {
        (self.media_max_mb.max(0.0) * 1024.0 * 1024.0) as u64
    }

    #[must_use]
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    #[must_use]
    pub fn identify_wait(&self) -> Duration {
        Duration::from_millis(self.identify_wait_ms)
    }
}

/// Split the `channels.irc` section into per-account configs.
///
/// Named accounts inherit every top-level key they leave unset. Without an
/// `accounts` map the top-level block is the single `default` account.
pub fn resolve_accounts(section: &Value) -> Result<BTreeMap<String, IrcAccountConfig>> {
    let mut out = BTreeMap::new();
    let Some(root) = section.as_object() else {
        if section.is_null() {
            return Ok(out);
        }
        return Err(Error::config("channels.irc must be an object"));
    };

    let mut base = root.clone();
    let accounts = base.remove("accounts");

    match accounts.as_ref().and_then(Value::as_object) {
        Some(accounts) if !accounts.is_empty() => {
            for (id, overlay) in accounts {
                let overlay = overlay.as_object().ok_or_else(|| {
                    Error::config(format!("channels.irc.accounts.{id} must be an object"))
                })?;
                let merged = merge_account(&base, overlay);
                out.insert(id.clone(), serde_json::from_value(Value::Object(merged))?);
            }
        },
        _ => {
            out.insert(
                DEFAULT_ACCOUNT_ID.to_string(),
                serde_json::from_value(Value::Object(base))?,
            );
        },
    }
    Ok(out)
}

fn merge_account(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let nested = DEEP_MERGED_KEYS.contains(&key.as_str());
        match (nested, merged.get_mut(key), value) {
            (true, Some(Value::Object(into)), Value::Object(from)) => {
                for (k, v) in from {
                    into.insert(k.clone(), v.clone());
                }
            },
            _ => {
                merged.insert(key.clone(), value.clone());
            },
        }
    }
    merged
}

/// Validate the `channels.irc` section.
pub fn validate_irc_config(section: &Value) -> Vec<Diagnostic> {
    match resolve_accounts(section) {
        Ok(accounts) => accounts
            .iter()
            .flat_map(|(id, cfg)| validate_account(id, cfg))
            .collect(),
        Err(e) => vec![Diagnostic::error("type-error", "channels.irc", e.to_string())],
    }
}

/// Validate one resolved account.
pub fn validate_account(account_id: &str, cfg: &IrcAccountConfig) -> Vec<Diagnostic> {
    let path = |field: &str| format!("channels.irc.accounts.{account_id}.{field}");
    let mut out = Vec::new();

    if cfg.enabled && cfg.host.trim().is_empty() {
        out.push(Diagnostic::error("missing-field", path("host"), "host is required"));
    }
    if cfg.enabled && cfg.nick.trim().is_empty() {
        out.push(Diagnostic::error("missing-field", path("nick"), "nick is required"));
    }
    if cfg.nick.contains(char::is_whitespace) {
        out.push(Diagnostic::error("range", path("nick"), "nick must not contain whitespace"));
    }
    if cfg.text_chunk_limit == 0 {
        out.push(Diagnostic::error(
            "range",
            path("textChunkLimit"),
            "textChunkLimit must be positive",
        ));
    }
    if cfg.block_streaming_coalesce.min_chars == 0 {
        out.push(Diagnostic::error(
            "range",
            path("blockStreamingCoalesce.minChars"),
            "minChars must be positive",
        ));
    }
    if cfg.media_max_mb <= 0.0 {
        out.push(Diagnostic::error(
            "range",
            path("mediaMaxMb"),
            "mediaMaxMb must be positive",
        ));
    }
    if !(0.0..=1.0).contains(&cfg.reconnect.jitter) {
        out.push(Diagnostic::error(
            "range",
            path("reconnect.jitter"),
            "jitter must be between 0 and 1",
        ));
    }
    if cfg.nickserv.is_enabled()
        && cfg.nickserv.register
        && cfg
            .nickserv
            .register_email
            .as_deref()
            .is_none_or(|e| e.trim().is_empty())
    {
        out.push(Diagnostic::error(
            "missing-field",
            path("nickserv.registerEmail"),
            "registerEmail is required when register is enabled",
        ));
    }
    if cfg.nickserv.is_enabled() && cfg.nickserv_credential().is_none() {
        out.push(Diagnostic::error(
            "missing-field",
            path("nickserv.password"),
            "nickserv is enabled but no password or passwordFile is set",
        ));
    }

    if cfg.password.is_some() && cfg.password_file.is_some() {
        out.push(Diagnostic::warning(
            "conflict",
            path("passwordFile"),
            "both password and passwordFile are set; passwordFile is used",
        ));
    }
    if cfg.nickserv.password.is_some() && cfg.nickserv.password_file.is_some() {
        out.push(Diagnostic::warning(
            "conflict",
            path("nickserv.passwordFile"),
            "both password and passwordFile are set; passwordFile is used",
        ));
    }
    if cfg.password.is_some() || cfg.nickserv.password.is_some() {
        out.push(Diagnostic::warning(
            "security",
            path("password"),
            "inline secret in config; prefer passwordFile or ${ENV} substitution",
        ));
    }
    if !cfg.tls {
        out.push(Diagnostic::warning(
            "security",
            path("tls"),
            "TLS is disabled; credentials are sent in clear text",
        ));
    }
    if cfg.dm_policy == DmPolicy::Open {
        out.push(Diagnostic::warning(
            "security",
            path("dmPolicy"),
            "open DM policy lets anyone on the network talk to the agent",
        ));
    }
    out
}
