//! Detect whether a channel message is addressed to the bot.

use moltis_channels::gating;

use crate::protocol::{irc_eq, irc_to_lower, is_nick_char};

/// What addressed the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mention {
    /// The bot's nick appeared as a whole word.
    Nick,
    /// A configured mention pattern matched.
    Pattern(String),
    /// Direct messages are always addressed.
    Direct,
}

/// Matches the bot's nick (always) and configured `mentionPatterns`.
///
/// Patterns without `*` are case-insensitive substring matches. Patterns
/// with `*` are case-insensitive globs anchored at the start of the text.
#[derive(Debug, Clone)]
pub struct MentionMatcher {
    nicks: Vec<String>,
    patterns: Vec<String>,
}

impl MentionMatcher {
    pub fn new(nick: &str, patterns: &[String]) -> Self {
        Self {
            nicks: vec![irc_to_lower(nick)],
            patterns: patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Also answer to `nick`, e.g. the alternate nick taken after a
    /// collision.
    #[must_use]
    pub fn with_nick(mut self, nick: &str) -> Self {
        let lowered = irc_to_lower(nick);
        if !lowered.is_empty() && !self.nicks.contains(&lowered) {
            self.nicks.push(lowered);
        }
        self
    }

    /// First match wins: nicks are tried before patterns, patterns in
    /// configured order.
    pub fn find(&self, text: &str) -> Option<Mention> {
        let folded = irc_to_lower(text);
        if self.nicks.iter().any(|nick| contains_word(&folded, nick)) {
            return Some(Mention::Nick);
        }
        let lowered = text.to_lowercase();
        self.patterns
            .iter()
            .find(|pattern| pattern_matches(pattern, &lowered))
            .map(|pattern| Mention::Pattern(pattern.clone()))
    }

    /// Whether a message should be forwarded. DMs and scopes that do not
    /// require a mention are always addressed.
    pub fn addressed(&self, is_group: bool, require_mention: bool, text: &str) -> Option<Mention> {
        if !is_group {
            return Some(Mention::Direct);
        }
        match self.find(text) {
            Some(mention) => Some(mention),
            None if !require_mention => Some(Mention::Direct),
            None => None,
        }
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern.contains('*') {
        gating::glob_match(&format!("{pattern}*"), text)
    } else {
        text.contains(pattern)
    }
}

/// Whole-word occurrence of `word` in `text`, both already casefolded.
fn contains_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.is_some_and(is_nick_char) && !after.is_some_and(is_nick_char)
    })
}

/// Remove a leading `nick:` or `nick,` address from channel text.
pub fn strip_leading_address<'a>(text: &'a str, nick: &str) -> &'a str {
    let trimmed = text.trim_start();
    let Some(end) = trimmed.find([':', ',']) else {
        return text;
    };
    if irc_eq(&trimmed[..end], nick) {
        trimmed[end + 1..].trim_start()
    } else {
        text
    }
}
