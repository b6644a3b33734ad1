//! A case-insensitive, insertion-ordered header map used by the AMI parser.
//!
//! AGI header names are lower-case by server convention, so the AGI side
//! uses a plain `HashMap<String, String>` instead of this type; see
//! [`crate::agi::AgiParser::env`].
use std::collections::HashMap;

/// Either a single header value or a list of values sharing one header
/// name, matching how AMI represents repeated headers (e.g. multiple
/// `Variable:` lines on one action).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// The first (or only) value, if any.
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s.as_str()),
            Self::Multi(v) => v.first().map(String::as_str),
        }
    }

    /// All values as a slice-like iterator.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Multi(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Single(s)
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Single(s.to_owned())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(v: Vec<String>) -> Self {
        Self::Multi(v)
    }
}

/// An insertion-ordered mapping from header name to [`HeaderValue`], where
/// all lookups fold the key to lower-case but the original casing is kept
/// for iteration and display.
///
/// Two maps compare equal if their case-folded keys and values match,
/// regardless of original casing or insertion order.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    // Insertion order of the case-folded keys.
    order: Vec<String>,
    // case-folded key => (original-case key, value)
    entries: HashMap<String, (String, HeaderValue)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`'s value. Preserves the casing of `key`
    /// as given on first insertion; later insertions under a different
    /// casing overwrite the value but keep the original-case key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let folded = key.to_lowercase();
        if !self.entries.contains_key(&folded) {
            self.order.push(folded.clone());
        }
        self.entries
            .entry(folded)
            .and_modify(|(_, v)| *v = value.into())
            .or_insert_with(|| (key, value.into()));
    }

    /// Looks up `key` case-insensitively, returning the first value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).and_then(|(_, v)| v.first())
    }

    /// Looks up `key` case-insensitively, returning the full
    /// [`HeaderValue`] (preserving multi-value headers).
    pub fn get_all(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.get(&key.to_lowercase()).map(|(_, v)| v)
    }

    /// Whether `key` is present, case-insensitively.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    /// Removes `key` case-insensitively, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let folded = key.to_lowercase();
        let removed = self.entries.remove(&folded).map(|(_, v)| v);
        if removed.is_some() {
            self.order.retain(|k| k != &folded);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order, yielding original-case keys.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.order.iter().map(move |folded| {
            let (orig, value) = &self.entries[folded];
            (orig.as_str(), value)
        })
    }
}

impl PartialEq for HeaderMap {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries
            .iter()
            .all(|(k, (_, v))| other.entries.get(k).map(|(_, ov)| ov) == Some(v))
    }
}

impl Eq for HeaderMap {}

impl FromIterator<(String, HeaderValue)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
