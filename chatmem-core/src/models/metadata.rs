use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata: string keys, arbitrary JSON values.
pub type Metadata = serde_json::Map<String, Value>;

pub const TOOL_NAMESPACE: &str = "tool";
pub const APPLICATION_NAMESPACE: &str = "application";

/// Namespaced metadata stored flat as `"{namespace}:{key}" -> value`.
///
/// `%` and `:` inside the namespace are stored as `%25` and `%3A`, so the
/// first `:` of a flat key always ends the namespace. Keys are stored as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagedMetadata(BTreeMap<String, String>);

impl ManagedMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flat_key(namespace: &str, key: &str) -> String {
        format!("{}:{key}", escape_namespace(namespace))
    }

    /// Split a persisted key into `(namespace, key)`. `None` when the key
    /// carries no namespace separator.
    pub fn split_flat_key(flat: &str) -> Option<(String, &str)> {
        let (namespace, key) = flat.split_once(':')?;
        Some((unescape_namespace(namespace), key))
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&str> {
        self.0
            .get(&Self::flat_key(namespace, key))
            .map(String::as_str)
    }

    pub fn set(&mut self, namespace: &str, key: &str, value: impl Into<String>) {
        self.0.insert(Self::flat_key(namespace, key), value.into());
    }

    pub fn remove(&mut self, namespace: &str, key: &str) -> Option<String> {
        self.0.remove(&Self::flat_key(namespace, key))
    }

    /// All `(key, value)` pairs of one namespace, keys without the prefix.
    pub fn namespace<'a>(&'a self, namespace: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let prefix = format!("{}:", escape_namespace(namespace));
        self.0.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix.as_str())
                .map(|key| (key, v.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The flat view, as persisted.
    pub fn as_flat(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for ManagedMetadata {
    fn from(flat: BTreeMap<String, String>) -> Self {
        Self(flat)
    }
}

fn escape_namespace(namespace: &str) -> Cow<'_, str> {
    if namespace.contains(['%', ':']) {
        Cow::Owned(namespace.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(namespace)
    }
}

// Every `%` in an escaped namespace starts `%25` or `%3A`, so `%3A` goes first.
fn unescape_namespace(namespace: &str) -> String {
    namespace.replace("%3A", ":").replace("%25", "%")
}

pub(crate) fn tool_key(tool_name: &str, key: &str) -> String {
    format!("{tool_name}.{key}")
}
