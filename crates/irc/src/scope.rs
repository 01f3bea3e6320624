//! Layered per-scope settings.
//!
//! Account fields are the base layer, the `groups["*"]` (or `dms["*"]`)
//! wildcard entry sits above it, and an explicit entry for the channel or
//! peer wins over both. The account config is only ever read.

use std::collections::HashMap;

use {moltis_channels::gating, serde_json::Value};

use crate::{
    config::{IrcAccountConfig, IrcChannelConfig, IrcDmConfig},
    protocol::{irc_eq, is_channel_name},
    types::IrcSender,
};

const WILDCARD: &str = "*";

/// The conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelScope {
    /// A channel, by name.
    Group(String),
    /// A direct conversation, keyed by the peer's nick.
    Direct(String),
}

impl ChannelScope {
    /// Classify a PRIVMSG destination. DMs arrive addressed to our own
    /// nick, so the peer is the sender.
    pub fn classify(raw_target: &str, sender_nick: &str) -> Self {
        if is_channel_name(raw_target) {
            Self::Group(raw_target.to_string())
        } else {
            Self::Direct(sender_nick.to_string())
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Conversation id: channel name for groups, peer nick for DMs.
    pub fn id(&self) -> &str {
        match self {
            Self::Group(name) | Self::Direct(name) => name,
        }
    }
}

/// Settings in force for one message in one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub scope: ChannelScope,
    pub enabled: bool,
    pub require_mention: bool,
    pub tools: Option<Value>,
    pub skills: Option<Vec<String>>,
    /// Account-level list plus the scope's own additions.
    pub allow_from: Vec<String>,
    pub system_prompt: Option<String>,
    pub history_limit: Option<usize>,
}

/// Resolve the effective settings for `scope` as seen by `sender`.
pub fn resolve(
    account: &IrcAccountConfig,
    scope: &ChannelScope,
    sender: &IrcSender,
) -> EffectiveConfig {
    match scope {
        ChannelScope::Group(name) => resolve_group(account, scope, name, sender),
        ChannelScope::Direct(nick) => resolve_dm(account, scope, nick),
    }
}

fn resolve_group(
    account: &IrcAccountConfig,
    scope: &ChannelScope,
    name: &str,
    sender: &IrcSender,
) -> EffectiveConfig {
    let explicit = lookup(&account.groups, name);
    let wildcard = account.groups.get(WILDCARD);
    let layer = |f: fn(&IrcChannelConfig) -> Option<_>| {
        explicit.and_then(f).or_else(|| wildcard.and_then(f))
    };

    let mut allow_from = account.group_allow_from.clone();
    let scoped = explicit
        .filter(|c| !c.allow_from.is_empty())
        .or(wildcard)
        .map(|c| c.allow_from.as_slice())
        .unwrap_or_default();
    for entry in scoped {
        if !allow_from.contains(entry) {
            allow_from.push(entry.clone());
        }
    }

    let tools = [explicit, wildcard]
        .into_iter()
        .flatten()
        .find_map(|c| tools_for_sender(c, sender))
        .or_else(|| {
            explicit
                .and_then(|c| c.tools.clone())
                .or_else(|| wildcard.and_then(|c| c.tools.clone()))
        });

    EffectiveConfig {
        scope: scope.clone(),
        enabled: layer(|c| c.enabled).unwrap_or(true),
        require_mention: layer(|c| c.require_mention).unwrap_or(account.require_mention),
        tools,
        skills: explicit
            .and_then(|c| c.skills.clone())
            .or_else(|| wildcard.and_then(|c| c.skills.clone())),
        allow_from,
        system_prompt: explicit
            .and_then(|c| c.system_prompt.clone())
            .or_else(|| wildcard.and_then(|c| c.system_prompt.clone())),
        history_limit: account.history_limit,
    }
}

fn resolve_dm(account: &IrcAccountConfig, scope: &ChannelScope, nick: &str) -> EffectiveConfig {
    let explicit = lookup(&account.dms, nick);
    let wildcard = account.dms.get(WILDCARD);
    let pick = |f: fn(&IrcDmConfig) -> Option<Value>| {
        explicit.and_then(f).or_else(|| wildcard.and_then(f))
    };

    EffectiveConfig {
        scope: scope.clone(),
        enabled: true,
        require_mention: false,
        tools: pick(|c| c.tools.clone()),
        skills: explicit
            .and_then(|c| c.skills.clone())
            .or_else(|| wildcard.and_then(|c| c.skills.clone())),
        allow_from: account.allow_from.clone(),
        system_prompt: explicit
            .and_then(|c| c.system_prompt.clone())
            .or_else(|| wildcard.and_then(|c| c.system_prompt.clone())),
        history_limit: account.dm_history_limit,
    }
}

/// Find an entry by IRC-casefolded key, ignoring the wildcard.
fn lookup<'a, T>(map: &'a HashMap<String, T>, name: &str) -> Option<&'a T> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.as_str() != WILDCARD && irc_eq(key, name))
            .map(|(_, v)| v)
    })
}

fn tools_for_sender(channel: &IrcChannelConfig, sender: &IrcSender) -> Option<Value> {
    if channel.tools_by_sender.is_empty() {
        return None;
    }
    let identities = sender.identities();
    let ids: Vec<&str> = identities.iter().map(String::as_str).collect();
    // Deterministic: most specific (longest) pattern first.
    let mut keys: Vec<&String> = channel.tools_by_sender.keys().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    keys.into_iter()
        .find(|key| gating::is_allowed(&ids, std::slice::from_ref(*key)))
        .and_then(|key| channel.tools_by_sender.get(key).cloned())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn account(value: Value) -> IrcAccountConfig {
        serde_json::from_value(value).unwrap()
    }

    fn alice() -> IrcSender {
        IrcSender {
            nick: "alice".into(),
            user: Some("~al".into()),
            host: Some("example.org".into()),
        }
    }

    #[test]
    fn classify_group_and_dm() {
        assert_eq!(
            ChannelScope::classify("#moltis", "alice"),
            ChannelScope::Group("#moltis".into())
        );
        assert_eq!(
            ChannelScope::classify("moltbot", "alice"),
            ChannelScope::Direct("alice".into())
        );
    }

    #[test]
    fn group_entry_overrides_account_defaults() {
        let cfg = account(json!({
            "requireMention": true,
            "groupAllowFrom": ["bob"],
            "historyLimit": 20,
            "groups": {
                "#Moltis": { "requireMention": false, "allowFrom": ["carol"], "systemPrompt": "be brief" },
            },
        }));
        let eff = resolve(&cfg, &ChannelScope::Group("#moltis".into()), &alice());
        assert!(!eff.require_mention);
        assert!(eff.enabled);
        assert_eq!(eff.allow_from, vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(eff.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(eff.history_limit, Some(20));
    }

    #[test]
    fn unknown_group_inherits_account() {
        let cfg = account(json!({ "requireMention": false }));
        let eff = resolve(&cfg, &ChannelScope::Group("#other".into()), &alice());
        assert!(!eff.require_mention);
        assert!(eff.enabled);
        assert!(eff.tools.is_none());
    }

    #[test]
    fn wildcard_group_fills_gaps_field_by_field() {
        let cfg = account(json!({
            "groups": {
                "*": { "enabled": false, "skills": ["search"], "requireMention": false },
                "#open": { "enabled": true },
            },
        }));
        let other = resolve(&cfg, &ChannelScope::Group("#random".into()), &alice());
        assert!(!other.enabled);
        let open = resolve(&cfg, &ChannelScope::Group("#open".into()), &alice());
        assert!(open.enabled);
        assert!(!open.require_mention);
        assert_eq!(open.skills, Some(vec!["search".to_string()]));
    }

    #[test]
    fn tools_by_sender_wins_over_scope_tools() {
        let cfg = account(json!({
            "groups": {
                "#dev": {
                    "tools": { "allow": ["read"] },
                    "toolsBySender": { "*@example.org": { "allow": ["read", "write"] } },
                },
            },
        }));
        let scope = ChannelScope::Group("#dev".into());
        let eff = resolve(&cfg, &scope, &alice());
        assert_eq!(eff.tools, Some(json!({ "allow": ["read", "write"] })));

        let stranger = IrcSender {
            nick: "mallory".into(),
            user: Some("m".into()),
            host: Some("evil.test".into()),
        };
        let eff = resolve(&cfg, &scope, &stranger);
        assert_eq!(eff.tools, Some(json!({ "allow": ["read"] })));
    }

    #[test]
    fn dm_scope_never_requires_mention() {
        let cfg = account(json!({
            "requireMention": true,
            "allowFrom": ["alice"],
            "dmHistoryLimit": 5,
            "dms": { "Alice": { "systemPrompt": "hi alice" } },
        }));
        let eff = resolve(&cfg, &ChannelScope::Direct("alice".into()), &alice());
        assert!(!eff.require_mention);
        assert_eq!(eff.allow_from, vec!["alice".to_string()]);
        assert_eq!(eff.system_prompt.as_deref(), Some("hi alice"));
        assert_eq!(eff.history_limit, Some(5));
    }

    #[test]
    fn resolution_does_not_touch_account() {
        let cfg = account(json!({ "groupAllowFrom": ["bob"], "groups": { "#a": { "allowFrom": ["x"] } } }));
        let before = cfg.group_allow_from.clone();
        let _ = resolve(&cfg, &ChannelScope::Group("#a".into()), &alice());
        assert_eq!(cfg.group_allow_from, before);
    }
}
