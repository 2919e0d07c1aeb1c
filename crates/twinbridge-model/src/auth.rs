//! Authorization subjects attached to sources, targets and signals.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single authorization subject, e.g. `integration:solution-A:hub`.
///
/// Subjects configured on sources may contain `{{ header:* }}` placeholders
/// which the mapping processor resolves per inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationSubject(pub String);

impl AuthorizationSubject {
    /// The subject id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorizationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuthorizationSubject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An ordered list of authorization subjects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationContext(pub Vec<AuthorizationSubject>);

impl AuthorizationContext {
    /// Creates a context from subject strings.
    #[must_use]
    pub fn of<S: Into<String>, I: IntoIterator<Item = S>>(subjects: I) -> Self {
        Self(
            subjects
                .into_iter()
                .map(|s| AuthorizationSubject(s.into()))
                .collect(),
        )
    }

    /// The first subject, used as the `source` header of mapped signals.
    #[must_use]
    pub fn first(&self) -> Option<&AuthorizationSubject> {
        self.0.first()
    }

    /// Whether the context carries no subjects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the subjects.
    pub fn iter(&self) -> impl Iterator<Item = &AuthorizationSubject> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_subject() {
        let ctx = AuthorizationContext::of(["integration:a", "integration:b"]);
        assert_eq!(ctx.first().unwrap().as_str(), "integration:a");
    }

    #[test]
    fn test_empty() {
        assert!(AuthorizationContext::default().is_empty());
    }
}
