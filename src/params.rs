//! Ordered route parameters.
//!
//! A [`Params`] is an ordered list of `(key, value)` pairs that always starts
//! with the reserved `route` entry. Keys may repeat: [`Params::add`] appends,
//! [`Params::set`] rewrites the last occurrence, [`Params::get`] reads it.
//!
//! The textual form is the route pattern followed by space-separated
//! `key=value` defaults, which is exactly what route registration accepts:
//!
//! ```rust
//! use keel::Params;
//!
//! let p: Params = "/api/v1 version=v1 action=list".parse().unwrap();
//! assert_eq!(p.route(), "/api/v1");
//! assert_eq!(p.get("version"), Some("v1"));
//! assert_eq!(p.to_string(), "/api/v1 version=v1 action=list");
//! ```

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Reserved key holding the matched route pattern.
pub const PARAM_ROUTE: &str = "route";
/// Set by the router on a 405 with the methods bound at the matched node.
pub const PARAM_ALLOW: &str = "allow";
/// Authorization action; defaults to the route.
pub const PARAM_ACTION: &str = "action";
/// Authorization resource; defaults to the request path.
pub const PARAM_RESOURCE: &str = "resource";
/// Authenticated user id, written by auth middleware and PBAC.
pub const PARAM_USERID: &str = "Userid";
/// HTML template name used by render.
pub const PARAM_TEMPLATE: &str = "template";
/// Opt a route out of default logger fields with `~all`.
pub const PARAM_LOGGER_KIND: &str = "loggerkind";
/// `valid=1` makes bind also validate.
pub const PARAM_VALID: &str = "valid";
/// Marks controller routes registered for every Any method.
pub const PARAM_ISANY: &str = "isany";
/// Marker consumed by file-serving handlers.
pub const PARAM_AUTOINDEX: &str = "autoindex";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    /// Creates params holding only `route=<route>`.
    pub fn new(route: impl Into<String>) -> Self {
        Self { entries: vec![(PARAM_ROUTE.to_owned(), route.into())] }
    }

    /// Parses `"<route> k=v k=v"`. Spaces inside `{…}` do not separate tokens.
    pub fn parse_route(s: &str) -> Self {
        let mut tokens = split_unbraced(s.trim(), ' ').into_iter().filter(|t| !t.is_empty());
        let mut params = Self::new(tokens.next().unwrap_or_default());
        for token in tokens {
            match token.split_once('=') {
                Some((k, v)) => params.add(k, v),
                None => params.add(token, ""),
            };
        }
        params
    }

    pub fn route(&self) -> &str {
        &self.entries[0].1
    }

    /// Returns the value bound last to `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Overwrites the last value bound to `key`, appending when absent.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().rev().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Appends a pair; duplicate keys are kept.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Appends every pair from `kvs`.
    pub fn extend<K, V>(&mut self, kvs: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in kvs {
            self.add(k, v);
        }
        self
    }

    /// Removes every occurrence of `key`. The route entry is only cleared.
    pub fn del(&mut self, key: &str) {
        if key == PARAM_ROUTE {
            self.entries[0].1.clear();
            return;
        }
        let mut first = true;
        self.entries.retain(|(k, _)| std::mem::take(&mut first) || k != key);
    }

    /// Concatenates `other`'s route onto this route and `set`s its other keys.
    ///
    /// Used to join a group prefix with a leaf route.
    pub fn combine_with_route(&self, other: &Params) -> Params {
        let mut combined = self.clone();
        combined.entries[0].1.push_str(other.route());
        for (k, v) in other.entries.iter().skip(1) {
            combined.set(k.as_str(), v.as_str());
        }
        combined
    }

    /// `set`s every non-route pair of `other` into `self`.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in other.entries.iter().skip(1) {
            self.set(k.as_str(), v.as_str());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs including the route entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when only the route entry is present.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }

    /// Truncates back to an empty route entry, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.entries.truncate(1);
        self.entries[0].1.clear();
    }

    /// Drops every pair past `len`, used to undo speculative captures.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.entries.truncate(len.max(1));
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())?;
        for (k, v) in self.entries.iter().skip(1) {
            if !v.is_empty() {
                write!(f, " {k}={v}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Params {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_route(s))
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(PARAM_ROUTE, self.route())?;
        for (k, v) in self.entries.iter().skip(1) {
            if !v.is_empty() {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}

/// Splits on `sep` at brace depth zero. Unbalanced closing braces are literal.
pub(crate) fn split_unbraced(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_route() {
        let p = Params::default();
        assert_eq!(p.len(), 1);
        assert_eq!(p.route(), "");
        assert!(p.is_empty());
    }

    #[test]
    fn set_rewrites_last_and_get_reads_last() {
        let mut p = Params::new("/x");
        p.add("a", "1").add("a", "2");
        assert_eq!(p.get("a"), Some("2"));
        p.set("a", "3");
        assert_eq!(p.iter().filter(|(k, _)| *k == "a").map(|(_, v)| v).collect::<Vec<_>>(), ["1", "3"]);
        p.set("b", "4");
        assert_eq!(p.get("b"), Some("4"));
        assert_eq!(p.get("missing"), None);
    }

    #[test]
    fn del_keeps_route_slot() {
        let mut p = Params::new("/x");
        p.add("a", "1").add("b", "2").add("a", "3");
        p.del("a");
        assert_eq!(p.get("a"), None);
        assert_eq!(p.get("b"), Some("2"));
        p.del(PARAM_ROUTE);
        assert_eq!(p.route(), "");
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn display_skips_empty_values() {
        let mut p = Params::new("/a");
        p.add("x", "").add("y", "1");
        assert_eq!(p.to_string(), "/a y=1");
    }

    #[test]
    fn string_round_trip_preserves_get() {
        let mut p = Params::new("/u/:id|{^[0-9]{2} [a-z]$}");
        p.add("k", "v").add("k", "w").add("z", "1");
        let back: Params = p.to_string().parse().unwrap();
        for key in ["route", "k", "z"] {
            assert_eq!(back.get(key), p.get(key), "key {key}");
        }
    }

    #[test]
    fn combine_with_route_concatenates() {
        let group = Params::parse_route("/api/v1 version=v1 zone=a");
        let leaf = Params::parse_route("/u zone=b");
        let combined = group.combine_with_route(&leaf);
        assert_eq!(combined.route(), "/api/v1/u");
        assert_eq!(combined.get("version"), Some("v1"));
        assert_eq!(combined.get("zone"), Some("b"));
    }

    #[test]
    fn json_puts_route_first() {
        let mut p = Params::new("/x");
        p.add("empty", "").add("id", "7");
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"route":"/x","id":"7"}"#);
    }

    #[test]
    fn reset_truncates() {
        let mut p = Params::new("/x");
        p.add("a", "1");
        p.reset();
        assert_eq!(p, Params::default());
    }
}
