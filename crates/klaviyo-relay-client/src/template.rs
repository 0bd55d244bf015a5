//! Token replacement for template payloads.
//!
//! A [`TokenMap`] is an ordered list of `{pattern, replacement}` pairs plus the
//! set of keys a template is expected to fill. Replacements run in insertion
//! order over every string leaf of a JSON document; object keys are left alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub pattern: String,
    pub replacement: String,
}

/// Declared keys and their substitutions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenMap {
    keys: Vec<String>,
    pairs: Vec<TokenPair>,
}

impl TokenMap {
    /// A map expecting values for `keys`.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            pairs: Vec::new(),
        }
    }

    /// Set the replacement for `pattern`, replacing an earlier one in place.
    pub fn set(&mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> &mut Self {
        let pattern = pattern.into();
        let replacement = replacement.into();
        match self.pairs.iter_mut().find(|p| p.pattern == pattern) {
            Some(pair) => pair.replacement = replacement,
            None => self.pairs.push(TokenPair {
                pattern,
                replacement,
            }),
        }
        self
    }

    pub fn with(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.set(pattern, replacement);
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn pairs(&self) -> &[TokenPair] {
        &self.pairs
    }

    /// Declared keys with no replacement set.
    pub fn missing_keys(&self) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|k| !self.pairs.iter().any(|p| &p.pattern == *k))
            .map(String::as_str)
            .collect()
    }

    /// Substitute in every string leaf of `value`. Returns the number of
    /// occurrences replaced.
    pub fn apply(&self, value: &mut Value) -> usize {
        match value {
            Value::String(text) => self.apply_str(text),
            Value::Array(items) => items.iter_mut().map(|v| self.apply(v)).sum(),
            Value::Object(map) => map.values_mut().map(|v| self.apply(v)).sum(),
            _ => 0,
        }
    }

    fn apply_str(&self, text: &mut String) -> usize {
        let mut count = 0;
        for pair in &self.pairs {
            if pair.pattern.is_empty() {
                continue;
            }
            let hits = text.matches(pair.pattern.as_str()).count();
            if hits > 0 {
                *text = text.replace(pair.pattern.as_str(), &pair.replacement);
                count += hits;
            }
        }
        count
    }
}
