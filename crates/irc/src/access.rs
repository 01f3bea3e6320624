use moltis_channels::{
    gating::{self, DmPolicy, GroupPolicy},
    store::PairingStore,
};

use crate::{
    CHANNEL_TYPE,
    config::IrcAccountConfig,
    scope::{ChannelScope, EffectiveConfig},
    types::IrcSender,
};

/// Outcome of an access check: `Ok(())` to process the message.
pub type AccessDecision = Result<(), AccessDenied>;

/// Decide whether a message from `sender` may reach the agent.
///
/// Pure apart from the pairing lookup, which is delegated to `pairings`.
/// Nothing is cached: every message is checked against the config as it is.
pub fn check_access(
    account_id: &str,
    account: &IrcAccountConfig,
    effective: &EffectiveConfig,
    sender: &IrcSender,
    pairings: &dyn PairingStore,
) -> AccessDecision {
    match effective.scope {
        ChannelScope::Direct(_) => check_dm_access(account_id, account, effective, sender, pairings),
        ChannelScope::Group(_) => check_group_access(account, effective, sender),
    }
}

fn check_dm_access(
    account_id: &str,
    account: &IrcAccountConfig,
    effective: &EffectiveConfig,
    sender: &IrcSender,
    pairings: &dyn PairingStore,
) -> AccessDecision {
    match account.dm_policy {
        DmPolicy::Disabled => Err(AccessDenied::DmsDisabled),
        DmPolicy::Open => Ok(()),
        DmPolicy::Allowlist => {
            if matches_any(sender, &effective.allow_from) {
                Ok(())
            } else {
                Err(AccessDenied::NotOnAllowlist)
            }
        },
        // The store owns nick folding.
        DmPolicy::Pairing => {
            if pairings.is_paired(CHANNEL_TYPE, account_id, &sender.nick) {
                Ok(())
            } else {
                Err(AccessDenied::NotPaired)
            }
        },
    }
}

fn check_group_access(
    account: &IrcAccountConfig,
    effective: &EffectiveConfig,
    sender: &IrcSender,
) -> AccessDecision {
    if !effective.enabled {
        return Err(AccessDenied::ScopeDisabled);
    }
    match account.group_policy {
        GroupPolicy::Disabled => Err(AccessDenied::GroupsDisabled),
        GroupPolicy::Open => Ok(()),
        GroupPolicy::Allowlist => {
            if matches_any(sender, &effective.allow_from) {
                Ok(())
            } else {
                Err(AccessDenied::NotOnGroupAllowlist)
            }
        },
    }
}

fn matches_any(sender: &IrcSender, allowlist: &[String]) -> bool {
    let identities = sender.identities();
    let ids: Vec<&str> = identities.iter().map(String::as_str).collect();
    gating::is_allowed(&ids, allowlist)
}

/// Reason an inbound message was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    DmsDisabled,
    NotOnAllowlist,
    NotPaired,
    GroupsDisabled,
    NotOnGroupAllowlist,
    /// The channel's own `enabled` flag is off.
    ScopeDisabled,
}

impl AccessDenied {
    /// Stable reason code for logs, events and metrics labels.
    pub fn code(self) -> &'static str {
        match self {
            Self::DmsDisabled => "dm-disabled",
            Self::NotOnAllowlist => "allowlist-miss",
            Self::NotPaired => "not-paired",
            Self::GroupsDisabled => "group-disabled",
            Self::NotOnGroupAllowlist => "group-allowlist-miss",
            Self::ScopeDisabled => "scope-disabled",
        }
    }
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DmsDisabled => write!(f, "DMs are disabled"),
            Self::NotOnAllowlist => write!(f, "sender not on allowlist"),
            Self::NotPaired => write!(f, "sender is not paired"),
            Self::GroupsDisabled => write!(f, "groups are disabled"),
            Self::NotOnGroupAllowlist => write!(f, "sender not on group allowlist"),
            Self::ScopeDisabled => write!(f, "channel is disabled"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::scope::resolve,
        moltis_channels::store::{MemoryPairingStore, NoPairings},
        serde_json::json,
    };

    fn cfg(value: serde_json::Value) -> IrcAccountConfig {
        serde_json::from_value(value).unwrap()
    }

    fn sender(nick: &str) -> IrcSender {
        IrcSender {
            nick: nick.into(),
            user: Some(format!("~{nick}")),
            host: Some("users.example".into()),
        }
    }

    fn decide(account: &IrcAccountConfig, scope: ChannelScope, from: &IrcSender) -> AccessDecision {
        let effective = resolve(account, &scope, from);
        check_access("main", account, &effective, from, &NoPairings)
    }

    fn dm(nick: &str) -> ChannelScope {
        ChannelScope::Direct(nick.into())
    }

    #[test]
    fn dm_allowlist_miss_is_denied() {
        let account = cfg(json!({ "dmPolicy": "allowlist", "allowFrom": ["alice"] }));
        assert_eq!(
            decide(&account, dm("bob"), &sender("bob")),
            Err(AccessDenied::NotOnAllowlist)
        );
        assert_eq!(AccessDenied::NotOnAllowlist.code(), "allowlist-miss");
        assert!(decide(&account, dm("alice"), &sender("alice")).is_ok());
    }

    #[test]
    fn dm_allowlist_matches_hostmask() {
        let account = cfg(json!({ "dmPolicy": "allowlist", "allowFrom": ["*@users.example"] }));
        assert!(decide(&account, dm("carol"), &sender("carol")).is_ok());
    }

    #[test]
    fn dm_allowlist_empty_denies_everyone() {
        let account = cfg(json!({ "dmPolicy": "allowlist" }));
        assert_eq!(
            decide(&account, dm("alice"), &sender("alice")),
            Err(AccessDenied::NotOnAllowlist)
        );
    }

    #[test]
    fn dm_open_and_disabled() {
        let open = cfg(json!({ "dmPolicy": "open" }));
        assert!(decide(&open, dm("anyone"), &sender("anyone")).is_ok());
        let disabled = cfg(json!({ "dmPolicy": "disabled", "allowFrom": ["alice"] }));
        assert_eq!(
            decide(&disabled, dm("alice"), &sender("alice")),
            Err(AccessDenied::DmsDisabled)
        );
    }

    #[test]
    fn dm_pairing_consults_store() {
        let account = cfg(json!({ "dmPolicy": "pairing" }));
        let store = MemoryPairingStore::new();
        let from = sender("Alice");
        let effective = resolve(&account, &dm("Alice"), &from);
        assert_eq!(
            check_access("main", &account, &effective, &from, &store),
            Err(AccessDenied::NotPaired)
        );
        store.approve("irc", "main", "alice");
        assert!(check_access("main", &account, &effective, &from, &store).is_ok());
        assert_eq!(
            check_access("other", &account, &effective, &from, &store),
            Err(AccessDenied::NotPaired)
        );
    }

    #[test]
    fn dm_pairing_ignores_allowlist() {
        let account = cfg(json!({ "dmPolicy": "pairing", "allowFrom": ["alice"] }));
        assert_eq!(
            decide(&account, dm("alice"), &sender("alice")),
            Err(AccessDenied::NotPaired)
        );
    }

    #[test]
    fn dm_pairing_matches_nick_with_brackets() {
        let account = cfg(json!({ "dmPolicy": "pairing" }));
        let store = MemoryPairingStore::new();
        store.approve("irc", "main", "Bot[1]");
        for nick in ["Bot[1]", "bot[1]"] {
            let from = sender(nick);
            let effective = resolve(&account, &dm(nick), &from);
            assert!(check_access("main", &account, &effective, &from, &store).is_ok());
        }
    }

    #[test]
    fn group_allowlist_unions_account_and_channel_entries() {
        let account = cfg(json!({
            "groupPolicy": "allowlist",
            "groupAllowFrom": ["alice"],
            "groups": { "#dev": { "allowFrom": ["bob"] } },
        }));
        let dev = || ChannelScope::Group("#dev".into());
        assert!(decide(&account, dev(), &sender("alice")).is_ok());
        assert!(decide(&account, dev(), &sender("bob")).is_ok());
        assert_eq!(
            decide(&account, dev(), &sender("eve")),
            Err(AccessDenied::NotOnGroupAllowlist)
        );
        assert_eq!(
            decide(&account, ChannelScope::Group("#other".into()), &sender("bob")),
            Err(AccessDenied::NotOnGroupAllowlist)
        );
    }

    #[test]
    fn disabled_channel_denies_even_when_open() {
        let account = cfg(json!({
            "groupPolicy": "open",
            "groups": { "#quiet": { "enabled": false } },
        }));
        assert_eq!(
            decide(&account, ChannelScope::Group("#quiet".into()), &sender("alice")),
            Err(AccessDenied::ScopeDisabled)
        );
        assert!(decide(&account, ChannelScope::Group("#loud".into()), &sender("alice")).is_ok());
    }

    #[test]
    fn groups_disabled() {
        let account = cfg(json!({ "groupPolicy": "disabled", "groupAllowFrom": ["alice"] }));
        assert_eq!(
            decide(&account, ChannelScope::Group("#x".into()), &sender("alice")),
            Err(AccessDenied::GroupsDisabled)
        );
    }

    #[test]
    fn decisions_are_repeatable() {
        let account = cfg(json!({ "dmPolicy": "allowlist", "allowFrom": ["alice"] }));
        let from = sender("bob");
        let first = decide(&account, dm("bob"), &from);
        for _ in 0..3 {
            assert_eq!(decide(&account, dm("bob"), &from), first);
        }
    }
}
