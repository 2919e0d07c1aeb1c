//! Thing identifiers of the form `namespace:name`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectivityError;

/// Identifier of a digital twin, split into namespace and name.
///
/// The namespace is a reverse-domain style prefix (`org.example`), the name
/// identifies the twin within it. The wire form joins both with `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThingId {
    namespace: String,
    name: String,
}

impl ThingId {
    /// Parses a `namespace:name` identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ThingIdInvalid`] when the separator is
    /// missing or the name part is empty.
    pub fn parse(s: &str) -> Result<Self, ConnectivityError> {
        let invalid = || ConnectivityError::ThingIdInvalid { given: s.into() };
        let (namespace, name) = s.split_once(':').ok_or_else(invalid)?;
        if name.is_empty() || name.contains(':') || namespace.contains('/') || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// The namespace part.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for ThingId {
    type Err = ConnectivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ThingId {
    type Error = ConnectivityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ThingId> for String {
    fn from(id: ThingId) -> Self {
        id.to_string()
    }
}
