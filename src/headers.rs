//! Case-insensitive header multi-map.
//!
//! Headers may legally repeat (`Set-Cookie`, `Via`, …), so this map keeps
//! every value in insertion order and exposes both "first value" and "all
//! values" accessors. Names are lowercased on insert; lookups accept any
//! case.
//!
//! The map also owns the incidental parse of the `Cookie` header into a
//! name → value side structure. The parse is lazy and memoized; any mutation
//! of the `cookie` header drops the memo so the next lookup rebuilds it.

use std::collections::HashMap;
use std::sync::OnceLock;

/// An ordered, case-insensitive multi-map of header name → values.
#[derive(Debug, Default)]
pub struct HeaderMultiMap {
    entries: Vec<(String, String)>,
    cookies: OnceLock<HashMap<String, String>>,
}

impl Clone for HeaderMultiMap {
    fn clone(&self) -> Self {
        // The cookie memo is cheap to rebuild; a clone starts cold.
        Self { entries: self.entries.clone(), cookies: OnceLock::new() }
    }
}

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from an `http` header map, preserving repeated headers
    /// in order. Values that are not valid UTF-8 are skipped.
    pub fn from_http(headers: &http::HeaderMap) -> Self {
        let mut map = Self::new();
        for (name, value) in headers {
            if let Ok(v) = value.to_str() {
                map.append(name.as_str(), v);
            }
        }
        map
    }

    /// First value for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Replaces every existing value for `name` with a single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != name);
        self.entries.push((name.clone(), value.into()));
        self.invalidate_cookies(&name);
    }

    /// Adds a value for `name`, keeping any existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.entries.push((name.clone(), value.into()));
        self.invalidate_cookies(&name);
    }

    /// Removes every value for `name`.
    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != name);
        self.invalidate_cookies(&name);
    }

    /// `(name, value)` pairs in insertion order. Names are lowercase.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A named cookie from the `Cookie` header, parsed on first use.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookie_map().get(name).map(String::as_str)
    }

    /// The full cookie name → value map.
    pub fn cookie_map(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            let mut map = HashMap::new();
            for header in self.all("cookie") {
                for pair in header.split(';') {
                    if let Some((k, v)) = pair.split_once('=') {
                        map.insert(k.trim().to_owned(), v.trim().to_owned());
                    }
                }
            }
            map
        })
    }

    /// One JSON object of first values, for the validation params record.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (name, value) in &self.entries {
            obj.entry(name.clone())
                .or_insert_with(|| serde_json::Value::String(value.clone()));
        }
        serde_json::Value::Object(obj)
    }

    fn invalidate_cookies(&mut self, name: &str) {
        if name == "cookie" {
            self.cookies = OnceLock::new();
        }
    }
}
