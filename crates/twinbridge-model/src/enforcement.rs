//! Identity enforcement: gate inbound messages by requiring that a wire
//! property (e.g. the MQTT topic) matches the thing identity of the mapped
//! signal.

use crate::connection::Enforcement;
use crate::error::ConnectivityError;
use crate::placeholder::{
    ExpressionResolver, Placeholder, ResolveMode, SourceAddressPlaceholder, ThingPlaceholder,
};
use crate::things::ThingId;

/// How resolved filters are compared against the enforcement input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMatching {
    /// Plain string equality.
    Exact,
    /// MQTT topic matching; filters may contain `+` and `#` wildcards.
    MqttTopic,
}

/// Builds [`EnforcementFilter`]s by resolving the configured input template
/// against per-message wire data.
#[derive(Debug, Clone)]
pub struct EnforcementFilterFactory {
    enforcement: Enforcement,
    matching: FilterMatching,
}

impl EnforcementFilterFactory {
    /// Creates a factory comparing filters with plain equality.
    #[must_use]
    pub fn new(enforcement: Enforcement) -> Self {
        Self {
            enforcement,
            matching: FilterMatching::Exact,
        }
    }

    /// Creates a factory using MQTT topic matching for its filters.
    #[must_use]
    pub fn with_mqtt_matching(enforcement: Enforcement) -> Self {
        Self {
            enforcement,
            matching: FilterMatching::MqttTopic,
        }
    }

    /// Resolves the input template with the given placeholder and returns
    /// the filter to evaluate once the thing identity is known.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::UnresolvedPlaceholder`] when the input
    /// template does not resolve.
    pub fn filter_with(
        &self,
        placeholder: &dyn Placeholder,
    ) -> Result<EnforcementFilter, ConnectivityError> {
        let resolver = ExpressionResolver::new(vec![placeholder]);
        let input = resolver.resolve(&self.enforcement.input, ResolveMode::Strict)?;
        Ok(EnforcementFilter {
            input,
            filters: self.enforcement.filters.clone(),
            matching: self.matching,
        })
    }

    /// Resolves the input template over a wire address via `source:address`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::UnresolvedPlaceholder`] when the input
    /// template does not resolve.
    pub fn filter_for_address(
        &self,
        address: &str,
    ) -> Result<EnforcementFilter, ConnectivityError> {
        self.filter_with(&SourceAddressPlaceholder::new(address))
    }
}

/// A precomputed enforcement input plus the filter templates to check it
/// against once the signal's thing identity is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementFilter {
    input: String,
    filters: Vec<String>,
    matching: FilterMatching,
}

impl EnforcementFilter {
    /// The resolved input value.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Accepts iff some filter, resolved over `thing_id`, matches the
    /// input.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::IdEnforcementFailed`] when no filter
    /// matches, or [`ConnectivityError::UnresolvedPlaceholder`] when a
    /// filter template does not resolve.
    pub fn match_thing(&self, thing_id: &ThingId) -> Result<(), ConnectivityError> {
        let placeholder = ThingPlaceholder::new(thing_id);
        let resolver = ExpressionResolver::new(vec![&placeholder]);
        for filter in &self.filters {
            let resolved = resolver.resolve(filter, ResolveMode::Strict)?;
            let matched = match self.matching {
                FilterMatching::Exact => resolved == self.input,
                FilterMatching::MqttTopic => mqtt_topic_matches(&resolved, &self.input),
            };
            if matched {
                return Ok(());
            }
        }
        Err(ConnectivityError::IdEnforcementFailed {
            input: self.input.clone(),
        })
    }
}

/// MQTT topic-filter matching: `+` matches one level, `#` matches the
/// remainder and must be the last level.
#[must_use]
pub(crate) fn mqtt_topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPlaceholder<'a>(&'a str);

    impl Placeholder for TestPlaceholder<'_> {
        fn prefix(&self) -> &str {
            "test"
        }

        fn supports(&self, _name: &str) -> bool {
            true
        }

        fn resolve(&self, _name: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn mqtt_enforcement() -> Enforcement {
        Enforcement::new(
            "{{ test:placeholder }}",
            ["mqtt/topic/{{ thing:namespace }}/{{ thing:name }}"],
        )
    }

    #[test]
    fn test_enforcement_accepts_matching_thing() {
        let factory = EnforcementFilterFactory::with_mqtt_matching(mqtt_enforcement());
        let filter = factory
            .filter_with(&TestPlaceholder("mqtt/topic/my/thing"))
            .unwrap();
        let thing = ThingId::parse("my:thing").unwrap();
        assert!(filter.match_thing(&thing).is_ok());
    }

    #[test]
    fn test_enforcement_rejects_foreign_input() {
        let factory = EnforcementFilterFactory::with_mqtt_matching(mqtt_enforcement());
        let filter = factory
            .filter_with(&TestPlaceholder("some/invalid/target"))
            .unwrap();
        let thing = ThingId::parse("my:thing").unwrap();
        let err = filter.match_thing(&thing).unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::IdEnforcementFailed { .. }
        ));
    }

    #[test]
    fn test_filter_for_address_uses_source_namespace() {
        let enforcement = Enforcement::new("{{ source:address }}", ["telemetry/{{ thing:id }}"]);
        let factory = EnforcementFilterFactory::new(enforcement);
        let filter = factory.filter_for_address("telemetry/my:thing").unwrap();
        assert_eq!(filter.input(), "telemetry/my:thing");
        let thing = ThingId::parse("my:thing").unwrap();
        assert!(filter.match_thing(&thing).is_ok());
    }

    #[test]
    fn test_exact_matching_ignores_wildcards() {
        let enforcement = Enforcement::new("{{ source:address }}", ["things/+"]);
        let factory = EnforcementFilterFactory::new(enforcement);
        let filter = factory.filter_for_address("things/x").unwrap();
        let thing = ThingId::parse("my:thing").unwrap();
        assert!(filter.match_thing(&thing).is_err());
    }

    #[test]
    fn test_mqtt_wildcard_filters() {
        let enforcement = Enforcement::new(
            "{{ source:address }}",
            ["devices/{{ thing:namespace }}/+/state", "backup/#"],
        );
        let factory = EnforcementFilterFactory::with_mqtt_matching(enforcement);
        let thing = ThingId::parse("my:thing").unwrap();

        let filter = factory.filter_for_address("devices/my/anything/state").unwrap();
        assert!(filter.match_thing(&thing).is_ok());

        let filter = factory.filter_for_address("backup/a/b/c").unwrap();
        assert!(filter.match_thing(&thing).is_ok());

        let filter = factory.filter_for_address("devices/other/x/state").unwrap();
        assert!(filter.match_thing(&thing).is_err());
    }

    #[test]
    fn test_mqtt_topic_matching_rules() {
        assert!(mqtt_topic_matches("a/b/c", "a/b/c"));
        assert!(mqtt_topic_matches("a/+/c", "a/b/c"));
        assert!(mqtt_topic_matches("a/#", "a/b/c"));
        assert!(mqtt_topic_matches("#", "a"));
        assert!(!mqtt_topic_matches("a/+", "a/b/c"));
        assert!(!mqtt_topic_matches("a/b", "a/b/c"));
        assert!(!mqtt_topic_matches("a/#/b", "a/x/b"));
    }
}
