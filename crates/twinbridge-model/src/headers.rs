//! String headers shared by external messages and internal signals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carrying the correlation id of a request/response exchange.
pub const CORRELATION_ID: &str = "correlation-id";
/// Header carrying the declared content type of a payload.
pub const CONTENT_TYPE: &str = "content-type";
/// Header naming the address replies should be published to.
pub const REPLY_TO: &str = "reply-to";
/// Header signalling whether the sender expects a response.
pub const RESPONSE_REQUIRED: &str = "response-required";
/// Header recording the first authorization subject a signal was mapped with.
pub const SOURCE_SUBJECT: &str = "source";
/// Header recording which payload mapper produced an inbound signal.
pub const INBOUND_PAYLOAD_MAPPER: &str = "inbound-payload-mapper";
/// Internal header carrying the thing id for error reporting.
pub const THING_ID: &str = "thing-id";

/// An ordered-irrelevant string→string header map.
///
/// Headers are treated as opaque strings; the typed accessors below cover
/// the keys the runtime itself interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a header value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Inserts a header, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a header.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Whether a header is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies all entries of `other` into `self`, overwriting on conflict.
    pub fn extend_from(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    /// The correlation id, if set.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID)
    }

    /// The content type, if set.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    /// The reply-to address, if set.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.get(REPLY_TO)
    }

    /// Whether the sender expects a response. Defaults to `true`.
    #[must_use]
    pub fn response_required(&self) -> bool {
        self.get(RESPONSE_REQUIRED) != Some("false")
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
