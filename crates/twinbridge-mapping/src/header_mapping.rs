//! Applies a configured header mapping with the placeholder engine.

use tracing::debug;

use twinbridge_model::{ExpressionResolver, HeaderMapping, Headers, Placeholder, ResolveMode};

/// Evaluates `mapping` against the given placeholder namespaces and
/// returns the produced headers.
///
/// Unresolved placeholders are non-fatal here: the target header is
/// omitted and the remaining mappings still apply.
#[must_use]
pub fn apply_header_mapping(
    mapping: &HeaderMapping,
    placeholders: Vec<&dyn Placeholder>,
) -> Headers {
    let resolver = ExpressionResolver::new(placeholders);
    let mut produced = Headers::new();
    for (name, template) in mapping.iter() {
        match resolver.resolve(template, ResolveMode::Strict) {
            Ok(value) => {
                produced.insert(name, value);
            }
            Err(e) => {
                debug!(header = %name, template = %template, error = %e, "header mapping entry omitted");
            }
        }
    }
    produced
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_model::{HeadersPlaceholder, ThingId, ThingPlaceholder};

    #[test]
    fn test_renames_and_injects() {
        let mapping = HeaderMapping::from([
            ("device_id", "{{ thing:id }}"),
            ("correlation", "{{ header:correlation-id }}"),
            ("fixed", "constant"),
        ]);
        let headers = Headers::new().with("correlation-id", "c-3");
        let thing = ThingId::parse("my:thing").unwrap();
        let hp = HeadersPlaceholder::new(&headers);
        let tp = ThingPlaceholder::new(&thing);

        let produced = apply_header_mapping(&mapping, vec![&hp, &tp]);
        assert_eq!(produced.get("device_id"), Some("my:thing"));
        assert_eq!(produced.get("correlation"), Some("c-3"));
        assert_eq!(produced.get("fixed"), Some("constant"));
    }

    #[test]
    fn test_unresolved_entry_omitted_not_fatal() {
        let mapping = HeaderMapping::from([
            ("missing", "{{ header:absent }}"),
            ("present", "{{ header:there }}"),
        ]);
        let headers = Headers::new().with("there", "yes");
        let hp = HeadersPlaceholder::new(&headers);

        let produced = apply_header_mapping(&mapping, vec![&hp]);
        assert!(!produced.contains("missing"));
        assert_eq!(produced.get("present"), Some("yes"));
    }
}
