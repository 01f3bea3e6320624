use serde::{Deserialize, Serialize};

/// Check whether any of a peer's identities matches an allowlist entry.
///
/// Entries are matched case-insensitively and may contain `*` wildcards.
/// An empty allowlist matches nobody; callers that want "open" access
/// express it through the policy, not through an empty list.
pub fn is_allowed(identities: &[&str], allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return false;
    }
    identities.iter().any(|id| {
        let id = id.to_lowercase();
        allowlist.iter().any(|entry| matches_entry(&entry.to_lowercase(), &id))
    })
}

fn matches_entry(pattern: &str, text: &str) -> bool {
    if pattern.contains('*') {
        glob_match(pattern, text)
    } else {
        pattern == text
    }
}

/// Glob matching where `*` matches any (possibly empty) run of characters.
///
/// Matching is anchored at both ends and case-sensitive; lowercase both
/// sides first for case-insensitive use.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if p < pat.len() && pat[p] == txt[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            // Let the last star swallow one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pat[p..].iter().all(|c| *c == '*')
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Only senders with an established pairing record.
    #[default]
    Pairing,
    /// Anyone can DM the bot.
    Open,
    /// Only senders on the allowlist.
    Allowlist,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Anyone in a joined group may address the bot.
    Open,
    /// Only senders on the group allowlist.
    #[default]
    Allowlist,
    /// Groups disabled.
    Disabled,
}
