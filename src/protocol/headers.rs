//! Request header store and response header views.
//!
//! Header names are matched case-insensitively everywhere, while the spelling
//! the caller (or the server) first used is preserved for display.
//!
//! # Request side
//!
//! [`RequestHeaders`] keeps outgoing headers in insertion order and holds at
//! most one entry per case-insensitive name: the engine cannot carry two
//! headers with the same name. Once the request starts, the store is frozen.
//!
//! ```
//! use url_connection::protocol::RequestHeaders;
//!
//! let mut headers = RequestHeaders::new();
//! headers.set("Accept", "text/plain").unwrap();
//! headers.set("accept", "application/json").unwrap();
//! assert_eq!(headers.get("ACCEPT"), Some("application/json"));
//! assert!(headers.add("Accept", "*/*").is_err());
//! ```
//!
//! # Response side
//!
//! [`ResponseHeaders`] is built once from the engine's header list. It drops
//! `Content-Encoding` (the engine already decoded the body) and offers an
//! ordinal list view plus a lazily folded name → values view.

use crate::error::{ConnectionError, Result};
use crate::protocol::constants::headers::CONTENT_ENCODING;
use std::cmp::Ordering;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::sync::OnceLock;

/// A header name compared and ordered without regard to ASCII case.
#[derive(Debug, Clone)]
pub struct HeaderKey(String);

impl HeaderKey {
    /// Wrap a header name.
    pub fn new(name: impl Into<String>) -> Self {
        HeaderKey(name.into())
    }

    /// The name as originally spelled.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for HeaderKey {}

impl PartialOrd for HeaderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeaderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable mapping from header name to its values, ordered by
/// case-insensitive name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: BTreeMap<HeaderKey, Vec<String>>,
}

static EMPTY_FIELDS: HeaderFields = HeaderFields::empty();

impl HeaderFields {
    /// A mapping with no entries.
    pub const fn empty() -> Self {
        HeaderFields {
            fields: BTreeMap::new(),
        }
    }

    /// A shared empty mapping, handed out when no response is available.
    pub(crate) fn empty_ref() -> &'static HeaderFields {
        &EMPTY_FIELDS
    }

    /// All values recorded for `name`, in arrival order.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.fields.get(&HeaderKey::new(name)).map(Vec::as_slice)
    }

    /// The last value recorded for `name`.
    pub fn last(&self, name: &str) -> Option<&str> {
        self.get(name)?.last().map(String::as_str)
    }

    /// Whether `name` has at least one value.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(&HeaderKey::new(name))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(name, values)` in case-insensitive name order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.fields.iter(),
        }
    }

    fn push(&mut self, name: &str, value: &str) {
        self.fields
            .entry(HeaderKey::new(name))
            .or_default()
            .push(value.to_string());
    }
}

impl<'a> IntoIterator for &'a HeaderFields {
    type Item = (&'a str, &'a [String]);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [`HeaderFields`].
pub struct Iter<'a> {
    inner: btree_map::Iter<'a, HeaderKey, Vec<String>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a [String]);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Outgoing request headers.
///
/// # Invariants
///
/// - No two entries share a case-insensitive name
/// - Insertion order is preserved; overwriting moves the entry to the end
/// - After [`freeze`](Self::freeze) every mutation fails with
///   [`ConnectionError::IllegalState`]
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    entries: Vec<(String, String)>,
    frozen: bool,
}

impl RequestHeaders {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing any existing entry of that name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.set_or_add(name, value, true)
    }

    /// Add `name: value`; fails if the name is already present.
    pub fn add(&mut self, name: &str, value: &str) -> Result<()> {
        self.set_or_add(name, value, false)
    }

    /// Insert a header.
    ///
    /// With `overwrite`, an existing case-insensitive match is removed and the
    /// new pair is appended. Without it, a match is rejected with
    /// [`ConnectionError::Unsupported`].
    pub fn set_or_add(&mut self, name: &str, value: &str, overwrite: bool) -> Result<()> {
        if self.frozen {
            return Err(ConnectionError::illegal_state(
                "cannot modify request property after connection is made",
            ));
        }
        if let Some(index) = self.position(name) {
            if !overwrite {
                return Err(ConnectionError::Unsupported(format!(
                    "cannot add multiple headers of the same key, {name}"
                )));
            }
            self.entries.remove(index);
        }
        self.entries.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// The value of the case-insensitive match for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|index| self.entries[index].1.as_str())
    }

    /// Immutable name → value mapping ordered by case-insensitive name.
    ///
    /// Fails once the store is frozen.
    pub fn snapshot(&self) -> Result<HeaderFields> {
        if self.frozen {
            return Err(ConnectionError::illegal_state(
                "cannot access request headers after connection is set",
            ));
        }
        let mut fields = HeaderFields::empty();
        for (name, value) in &self.entries {
            if fields.contains(name) {
                return Err(ConnectionError::Invariant(
                    "request header store holds a duplicate name",
                ));
            }
            fields.push(name, value);
        }
        Ok(fields)
    }

    /// Iterate over `(name, value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject further mutation; called when the request starts.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether [`freeze`](Self::freeze) has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

/// Response headers as seen by the caller.
///
/// Built once per connection from the engine's ordered header list. The
/// name → values view is folded on first use and then cached.
#[derive(Debug, Default)]
pub struct ResponseHeaders {
    list: Vec<(String, String)>,
    map: OnceLock<HeaderFields>,
}

impl ResponseHeaders {
    /// Build the list view, stripping `Content-Encoding`.
    pub fn new<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let list = headers
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(CONTENT_ENCODING.as_str()))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        ResponseHeaders {
            list,
            map: OnceLock::new(),
        }
    }

    /// The `(name, value)` pair at ordinal position `pos`.
    pub fn indexed_entry(&self, pos: usize) -> Option<(&str, &str)> {
        self.list
            .get(pos)
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether there are no header lines.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The name → values view, values kept in arrival order per name.
    pub fn map_view(&self) -> &HeaderFields {
        self.map.get_or_init(|| {
            let mut fields = HeaderFields::empty();
            for (name, value) in &self.list {
                fields.push(name, value);
            }
            fields
        })
    }
}
