//! Placeholder templates: `{{ ns:name }}` tokens resolved by
//! namespace-scoped lookups.
//!
//! Resolvers are injected per call; there is no global registry. A
//! [`Placeholder`] exposes its namespace prefix, which names it supports,
//! and a resolver over whatever data it was constructed with.

use crate::envelope::TopicPath;
use crate::error::ConnectivityError;
use crate::headers::Headers;
use crate::things::ThingId;

/// One placeholder namespace bound to its backing data.
pub trait Placeholder {
    /// Namespace prefix, e.g. `header`.
    fn prefix(&self) -> &str;

    /// Whether `name` is a supported name in this namespace. Open
    /// namespaces (like `header:*`) accept any name.
    fn supports(&self, name: &str) -> bool;

    /// Resolves `name` to a value, if the backing data has one.
    fn resolve(&self, name: &str) -> Option<String>;
}

/// How unresolvable placeholders are treated during template application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Any unresolved placeholder fails the whole template.
    Strict,
    /// Unresolved placeholders are kept as literal text.
    Lenient,
    /// Placeholders of unknown namespaces are kept literal; known
    /// namespaces that fail to resolve still fail the template. Used for
    /// outbound target addresses.
    KeepUnknown,
}

/// Resolves templates against an injected set of placeholders.
pub struct ExpressionResolver<'a> {
    placeholders: Vec<&'a dyn Placeholder>,
}

impl<'a> ExpressionResolver<'a> {
    /// Creates a resolver over the given placeholders.
    #[must_use]
    pub fn new(placeholders: Vec<&'a dyn Placeholder>) -> Self {
        Self { placeholders }
    }

    /// Applies `template`, replacing each `{{ ns:name }}` token according
    /// to `mode`. Whitespace inside the braces is insignificant.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::UnresolvedPlaceholder`] naming the
    /// offending `ns:name` when `mode` requires resolution.
    pub fn resolve(&self, template: &str, mode: ResolveMode) -> Result<String, ConnectivityError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                // Unclosed token: treat the remainder as one placeholder.
                let inner = after_open.trim();
                match mode {
                    ResolveMode::Strict => {
                        return Err(ConnectivityError::UnresolvedPlaceholder {
                            placeholder: inner.to_string(),
                        })
                    }
                    ResolveMode::Lenient | ResolveMode::KeepUnknown => {
                        out.push_str(&rest[start..]);
                        return Ok(out);
                    }
                }
            };
            let inner = after_open[..end].trim();
            let literal = &rest[start..start + 2 + end + 2];

            match self.resolve_token(inner) {
                TokenResolution::Resolved(value) => out.push_str(&value),
                TokenResolution::KnownUnresolved | TokenResolution::UnknownNamespace
                    if mode == ResolveMode::Strict =>
                {
                    return Err(ConnectivityError::UnresolvedPlaceholder {
                        placeholder: inner.to_string(),
                    })
                }
                TokenResolution::KnownUnresolved if mode == ResolveMode::KeepUnknown => {
                    return Err(ConnectivityError::UnresolvedPlaceholder {
                        placeholder: inner.to_string(),
                    })
                }
                TokenResolution::KnownUnresolved | TokenResolution::UnknownNamespace => {
                    out.push_str(literal);
                }
            }
            rest = &rest[start + 2 + end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve_token(&self, inner: &str) -> TokenResolution {
        let Some((prefix, name)) = inner.split_once(':') else {
            return TokenResolution::UnknownNamespace;
        };
        let (prefix, name) = (prefix.trim(), name.trim());
        let mut known = false;
        for placeholder in &self.placeholders {
            if placeholder.prefix() != prefix {
                continue;
            }
            known = true;
            if placeholder.supports(name) {
                if let Some(value) = placeholder.resolve(name) {
                    return TokenResolution::Resolved(value);
                }
            }
        }
        if known {
            TokenResolution::KnownUnresolved
        } else {
            TokenResolution::UnknownNamespace
        }
    }

    /// Checks that every placeholder in `template` belongs to one of the
    /// injected namespaces and uses a supported name. Values are not
    /// resolved; use this from configuration validators.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::UnresolvedPlaceholder`] for the first
    /// unsupported token.
    pub fn validate(&self, template: &str) -> Result<(), ConnectivityError> {
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                return Err(ConnectivityError::UnresolvedPlaceholder {
                    placeholder: after_open.trim().to_string(),
                });
            };
            let inner = after_open[..end].trim();
            let supported = inner.split_once(':').is_some_and(|(prefix, name)| {
                self.placeholders
                    .iter()
                    .any(|p| p.prefix() == prefix.trim() && p.supports(name.trim()))
            });
            if !supported {
                return Err(ConnectivityError::UnresolvedPlaceholder {
                    placeholder: inner.to_string(),
                });
            }
            rest = &rest[start + 2 + end + 2..];
        }
        Ok(())
    }
}

enum TokenResolution {
    Resolved(String),
    KnownUnresolved,
    UnknownNamespace,
}

/// Whether `s` contains at least one `{{ ... }}` token.
#[must_use]
pub fn contains_placeholder(s: &str) -> bool {
    s.find("{{")
        .is_some_and(|start| s[start..].contains("}}"))
}

// ── Built-in namespaces ─────────────────────────────────────────────

/// `header:<name>` over the headers of the current message.
pub struct HeadersPlaceholder<'a> {
    headers: &'a Headers,
}

impl<'a> HeadersPlaceholder<'a> {
    /// Creates the placeholder over `headers`.
    #[must_use]
    pub fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Placeholder for HeadersPlaceholder<'_> {
    fn prefix(&self) -> &str {
        "header"
    }

    fn supports(&self, _name: &str) -> bool {
        true
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.headers.get(name).map(str::to_string)
    }
}

/// `thing:namespace|name|id` over a thing identity.
pub struct ThingPlaceholder<'a> {
    thing_id: &'a ThingId,
}

impl<'a> ThingPlaceholder<'a> {
    /// Creates the placeholder over `thing_id`.
    #[must_use]
    pub fn new(thing_id: &'a ThingId) -> Self {
        Self { thing_id }
    }
}

impl Placeholder for ThingPlaceholder<'_> {
    fn prefix(&self) -> &str {
        "thing"
    }

    fn supports(&self, name: &str) -> bool {
        matches!(name, "namespace" | "name" | "id")
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "namespace" => Some(self.thing_id.namespace().to_string()),
            "name" => Some(self.thing_id.name().to_string()),
            "id" => Some(self.thing_id.to_string()),
            _ => None,
        }
    }
}

/// `topic:<segment>` over the topic path of the current signal.
pub struct TopicPathPlaceholder<'a> {
    topic: &'a TopicPath,
}

impl<'a> TopicPathPlaceholder<'a> {
    /// Creates the placeholder over `topic`.
    #[must_use]
    pub fn new(topic: &'a TopicPath) -> Self {
        Self { topic }
    }
}

impl Placeholder for TopicPathPlaceholder<'_> {
    fn prefix(&self) -> &str {
        "topic"
    }

    fn supports(&self, name: &str) -> bool {
        matches!(
            name,
            "full"
                | "namespace"
                | "entity-name"
                | "group"
                | "channel"
                | "criterion"
                | "action"
                | "subject"
                | "action-subject"
        )
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "full" => Some(self.topic.to_string()),
            "namespace" => Some(self.topic.namespace.clone()),
            "entity-name" => Some(self.topic.entity_name.clone()),
            "group" => Some("things".to_string()),
            "channel" => Some(self.topic.channel.to_string()),
            "criterion" => Some(self.topic.criterion.to_string()),
            "action" | "subject" | "action-subject" => {
                self.topic.action_subject().map(str::to_string)
            }
            _ => None,
        }
    }
}

/// `source:address` over the wire address a message arrived on.
pub struct SourceAddressPlaceholder<'a> {
    address: &'a str,
}

impl<'a> SourceAddressPlaceholder<'a> {
    /// Creates the placeholder over `address`.
    #[must_use]
    pub fn new(address: &'a str) -> Self {
        Self { address }
    }
}

impl Placeholder for SourceAddressPlaceholder<'_> {
    fn prefix(&self) -> &str {
        "source"
    }

    fn supports(&self, name: &str) -> bool {
        name == "address"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        (name == "address").then(|| self.address.to_string())
    }
}
