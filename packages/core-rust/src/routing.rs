//! Routing keys, exchange kinds, and topic pattern matching.
//!
//! A routing key is a dot-separated hierarchical string (`domain.verb`, e.g.
//! `stats.persist_and_calculate`). It selects the destination queue binding on
//! the broker side and the handler on the worker side.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum routing key length in bytes (AMQP short-string limit).
pub const MAX_ROUTING_KEY_LEN: usize = 255;

// ---------------------------------------------------------------------------
// RoutingKey
// ---------------------------------------------------------------------------

/// Validated routing key. Immutable once constructed.
///
/// Binding patterns for topic exchanges (`grades.*`, `stats.#`) are also
/// represented as `RoutingKey` values; the wildcard characters carry no
/// special meaning outside of [`topic_matches`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

/// Reasons a string cannot be used as a routing key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingKeyError {
    #[error("routing key must not be empty")]
    Empty,
    #[error("routing key is {len} bytes, maximum is {MAX_ROUTING_KEY_LEN}")]
    TooLong { len: usize },
    #[error("routing key must not contain whitespace: {key:?}")]
    Whitespace { key: String },
}

impl RoutingKey {
    /// Validates and wraps a routing key.
    ///
    /// # Errors
    ///
    /// Returns `RoutingKeyError` if the key is empty, longer than 255 bytes,
    /// or contains whitespace.
    pub fn new(key: impl Into<String>) -> Result<Self, RoutingKeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(RoutingKeyError::Empty);
        }
        if key.len() > MAX_ROUTING_KEY_LEN {
            return Err(RoutingKeyError::TooLong { len: key.len() });
        }
        if key.chars().any(char::is_whitespace) {
            return Err(RoutingKeyError::Whitespace { key });
        }
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first dot-separated word (`stats` for `stats.get_distributions`).
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// Whether this key is matched by the given topic binding pattern.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        topic_matches(pattern, &self.0)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoutingKey {
    type Err = RoutingKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// ExchangeKind
// ---------------------------------------------------------------------------

/// Broker exchange type. Determines how routing keys select bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing key equality.
    Direct,
    /// Dot-separated pattern matching with `*` and `#` wildcards.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

impl ExchangeKind {
    /// Whether a message published with `key` reaches a binding with `pattern`.
    #[must_use]
    pub fn routes(self, pattern: &str, key: &str) -> bool {
        match self {
            ExchangeKind::Direct => pattern == key,
            ExchangeKind::Topic => topic_matches(pattern, key),
            ExchangeKind::Fanout => true,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Topic matching
// ---------------------------------------------------------------------------

/// AMQP topic matching: `*` matches exactly one word, `#` matches zero or
/// more words. Words are separated by `.`.
#[must_use]
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

/// Two-pointer match. On a mismatch, the most recent `#` absorbs one more key
/// word and matching resumes after it; earlier `#`s never need revisiting, so
/// this is `O(pattern * key)` regardless of how many `#` words the pattern has.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let (mut p, mut k) = (0, 0);
    // Position of the last `#` and the key index it currently absorbs up to.
    let mut backtrack: Option<(usize, usize)> = None;
    while k < key.len() {
        match pattern.get(p) {
            Some(&"#") => {
                backtrack = Some((p, k));
                p += 1;
            }
            Some(&word) if word == "*" || word == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match backtrack {
                Some((hash, absorbed)) => {
                    backtrack = Some((hash, absorbed + 1));
                    p = hash + 1;
                    k = absorbed + 1;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|word| *word == "#")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert_eq!(RoutingKey::new(""), Err(RoutingKeyError::Empty));
    }

    #[test]
    fn rejects_whitespace() {
        assert!(matches!(
            RoutingKey::new("stats. get"),
            Err(RoutingKeyError::Whitespace { .. })
        ));
    }

    #[test]
    fn rejects_overlong_key() {
        let long = "a".repeat(MAX_ROUTING_KEY_LEN + 1);
        assert_eq!(
            RoutingKey::new(long),
            Err(RoutingKeyError::TooLong {
                len: MAX_ROUTING_KEY_LEN + 1
            })
        );
    }

    #[test]
    fn domain_is_first_word() {
        let key = RoutingKey::new("stats.persist_and_calculate").unwrap();
        assert_eq!(key.domain(), "stats");
        assert_eq!(RoutingKey::new("ping").unwrap().domain(), "ping");
    }

    #[test]
    fn serde_rejects_invalid_key() {
        let err = serde_json::from_str::<RoutingKey>("\"\"");
        assert!(err.is_err());
        let ok: RoutingKey = serde_json::from_str("\"credits.avail\"").unwrap();
        assert_eq!(ok.as_str(), "credits.avail");
    }

    #[test]
    fn topic_star_matches_one_word() {
        assert!(topic_matches("grades.*", "grades.init"));
        assert!(!topic_matches("grades.*", "grades"));
        assert!(!topic_matches("grades.*", "grades.init.extra"));
    }

    #[test]
    fn topic_hash_matches_zero_or_more_words() {
        assert!(topic_matches("stats.#", "stats"));
        assert!(topic_matches("stats.#", "stats.get_distributions"));
        assert!(topic_matches("#.created", "user.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("stats.#", "credits.spent"));
    }

    #[test]
    fn many_hash_words_match_long_keys_quickly() {
        let pattern = ["#"; 16].join(".") + ".x";
        let miss = ["a"; 64].join(".");
        let hit = format!("{miss}.x");
        let started = std::time::Instant::now();
        assert!(!topic_matches(&pattern, &miss));
        assert!(topic_matches(&pattern, &hit));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(topic_matches("#.*.b.#", "a.b"));
        assert!(!topic_matches("#.*.b.#", "b"));
        assert!(topic_matches("a.#.b.*", "a.b.b.c"));
        assert!(topic_matches("a.#.#", "a"));
        assert!(!topic_matches("a.#.c", "a.b.d"));
    }

    /// Exhaustive recursive matcher used as the oracle for small inputs.
    fn naive_match(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| naive_match(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && naive_match(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && naive_match(rest, &key[1..]),
        }
    }

    #[test]
    fn exchange_kind_routing() {
        assert!(ExchangeKind::Direct.routes("a.b", "a.b"));
        assert!(!ExchangeKind::Direct.routes("a.*", "a.b"));
        assert!(ExchangeKind::Topic.routes("a.*", "a.b"));
        assert!(ExchangeKind::Fanout.routes("ignored", "a.b"));
    }

    proptest! {
        #[test]
        fn literal_pattern_matches_itself(words in proptest::collection::vec("[a-z_]{1,8}", 1..5)) {
            let key = words.join(".");
            prop_assert!(topic_matches(&key, &key));
            prop_assert!(topic_matches("#", &key));
        }

        #[test]
        fn agrees_with_exhaustive_matcher(
            pattern in proptest::collection::vec(prop_oneof!["a", "b", Just("*".to_string()), Just("#".to_string())], 1..7),
            key in proptest::collection::vec(prop_oneof!["a", "b"], 1..7),
        ) {
            let words: Vec<&str> = pattern.iter().map(String::as_str).collect();
            let key_words: Vec<&str> = key.iter().map(String::as_str).collect();
            prop_assert_eq!(
                topic_matches(&pattern.join("."), &key.join(".")),
                naive_match(&words, &key_words)
            );
        }
    }
}
