//! Host environment capture and filtering.
//!
//! Entries are forwarded into the container as `-e KEY=VALUE`. Which entries
//! get forwarded is decided on the key alone:
//!
//! 1. Everything is included by default.
//! 2. A non-empty whitelist flips the default: only keys matching one of its
//!    patterns are included.
//! 3. A key matching any blacklist pattern is excluded, whitelisted or not.
//!
//! Patterns are unanchored regular expressions, so `ENV` matches `ENV1` and
//! `MY_ENV`.

use regex::Regex;
use tracing::debug;

use crate::error::{LopeError, LopeResult};

/// Capture the host process environment as `KEY=VALUE` entries.
pub fn capture() -> Vec<String> {
    std::env::vars_os()
        .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
        .collect()
}

/// The key portion of an entry: text before the first `=`, or the whole entry.
pub fn env_key(entry: &str) -> &str {
    match entry.split_once('=') {
        Some((key, _)) => key,
        None => entry,
    }
}

/// Whether a key is a POSIX shell identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_shell_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Drop entries whose key is not a shell identifier.
///
/// Environments inherited from other shells (Windows in particular) contain
/// keys such as `=C:` or `ProgramFiles(x86)` that would break the invocation.
pub fn sanitize(entries: &mut Vec<String>) {
    entries.retain(|entry| {
        let keep = is_shell_identifier(env_key(entry));
        if !keep {
            debug!("Dropping non-portable environment entry {:?}", env_key(entry));
        }
        keep
    });
}

/// A compiled set of key patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    /// Compile a set of patterns. Fails on the first invalid expression.
    pub fn new<I, S>(patterns: I) -> LopeResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref();
                Regex::new(pattern).map_err(|source| LopeError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<LopeResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True when any pattern matches somewhere in `key`.
    pub fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(key))
    }
}

/// Blacklist and whitelist applied to the host environment.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    pub blacklist: PatternSet,
    pub whitelist: PatternSet,
}

impl EnvPolicy {
    pub fn new(blacklist: PatternSet, whitelist: PatternSet) -> Self {
        Self {
            blacklist,
            whitelist,
        }
    }
}

/// Outcome of the admission rule for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No whitelist in effect and not blacklisted.
    Default,
    /// Matched the whitelist and not blacklisted.
    Whitelisted,
    /// A whitelist is in effect and the key matched none of it.
    Unlisted,
    /// Matched the blacklist.
    Blacklisted,
}

impl Admission {
    pub fn is_included(&self) -> bool {
        matches!(self, Admission::Default | Admission::Whitelisted)
    }
}

/// Decide whether `key` is forwarded. The blacklist always wins.
pub fn admit(policy: &EnvPolicy, key: &str) -> Admission {
    if policy.blacklist.matches(key) {
        return Admission::Blacklisted;
    }
    if policy.whitelist.is_empty() {
        return Admission::Default;
    }
    if policy.whitelist.matches(key) {
        Admission::Whitelisted
    } else {
        Admission::Unlisted
    }
}

/// Entries admitted by the policy, in their original order.
pub fn filter<'a>(policy: &EnvPolicy, entries: &'a [String]) -> Vec<&'a str> {
    entries
        .iter()
        .map(String::as_str)
        .filter(|entry| admit(policy, env_key(entry)).is_included())
        .collect()
}
