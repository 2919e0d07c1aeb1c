//! Mapper registry: the per-connection catalogue of configured payload
//! mappers, keyed by alias.

use std::collections::BTreeMap;
use std::sync::Arc;

use twinbridge_model::{ConnectivityError, MappingContext};

use crate::add_header::AddHeaderMapper;
use crate::connection_status::ConnectionStatusMapper;
use crate::mapper::{MapperLimits, MessageMapper};
use crate::twin::TwinProtocolMapper;
use crate::wrapping::WrappingMapper;

/// Alias under which the twin-protocol mapper is always present.
pub const DEFAULT_MAPPER_ALIAS: &str = "default";

/// Factory for host-supplied mapping engines; returns `None` for engine
/// names it does not provide.
pub type MapperInstantiator =
    dyn Fn(&MappingContext) -> Option<Box<dyn MessageMapper>> + Send + Sync;

/// Immutable catalogue of wrapped mappers built from a connection's
/// mapping definitions. Aliases are unique by construction; the
/// twin-protocol mapper is always registered under
/// [`DEFAULT_MAPPER_ALIAS`].
pub struct MapperRegistry {
    mappers: BTreeMap<String, Arc<WrappingMapper>>,
}

impl MapperRegistry {
    /// Builds the registry from mapping definitions.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ConfigurationInvalid`] for unknown
    /// engines, or the configuration error of a mapper that rejected its
    /// options.
    pub fn from_definitions(
        definitions: &BTreeMap<String, MappingContext>,
        limits: MapperLimits,
        custom: Option<&MapperInstantiator>,
    ) -> Result<Self, ConnectivityError> {
        let mut mappers = BTreeMap::new();
        mappers.insert(
            DEFAULT_MAPPER_ALIAS.to_string(),
            Arc::new(WrappingMapper::wrap(
                DEFAULT_MAPPER_ALIAS,
                Box::new(TwinProtocolMapper),
                limits,
            )),
        );

        for (alias, context) in definitions {
            let delegate: Box<dyn MessageMapper> = match context.mapping_engine.as_str() {
                "Ditto" => Box::new(TwinProtocolMapper),
                "AddHeader" => Box::new(AddHeaderMapper::default()),
                "ConnectionStatus" => Box::new(ConnectionStatusMapper::default()),
                engine => match custom.and_then(|instantiate| instantiate(context)) {
                    Some(mapper) => mapper,
                    None => {
                        return Err(ConnectivityError::config(format!(
                            "unknown mapping engine '{engine}' for alias '{alias}'"
                        )))
                    }
                },
            };
            let mut wrapped = WrappingMapper::wrap(alias.clone(), delegate, limits);
            wrapped.configure(context)?;
            mappers.insert(alias.clone(), Arc::new(wrapped));
        }

        Ok(Self { mappers })
    }

    /// A registry containing only the default mapper.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches [`Self::from_definitions`] for
    /// callers threading results.
    pub fn default_only(limits: MapperLimits) -> Result<Self, ConnectivityError> {
        Self::from_definitions(&BTreeMap::new(), limits, None)
    }

    /// Looks up a mapper by alias.
    #[must_use]
    pub fn get(&self, alias: &str) -> Option<Arc<WrappingMapper>> {
        self.mappers.get(alias).cloned()
    }

    /// Resolves an ordered alias list to mappers, substituting
    /// `[default]` for an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ConfigurationInvalid`] for aliases
    /// with no definition.
    pub fn mappers_for(
        &self,
        aliases: &[String],
    ) -> Result<Vec<Arc<WrappingMapper>>, ConnectivityError> {
        if aliases.is_empty() {
            return Ok(vec![self.mappers[DEFAULT_MAPPER_ALIAS].clone()]);
        }
        aliases
            .iter()
            .map(|alias| {
                self.get(alias).ok_or_else(|| {
                    ConnectivityError::config(format!("payload mapping alias '{alias}' is not defined"))
                })
            })
            .collect()
    }

    /// Checks that every alias resolves, without instantiating anything
    /// new. Used by the protocol validators.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ConfigurationInvalid`] for undefined
    /// aliases.
    pub fn validate_aliases(&self, aliases: &[String]) -> Result<(), ConnectivityError> {
        self.mappers_for(aliases).map(|_| ())
    }
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("aliases", &self.mappers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_model::{Envelope, ExternalMessage, Headers};

    fn definitions() -> BTreeMap<String, MappingContext> {
        let mut definitions = BTreeMap::new();
        definitions.insert(
            "status".to_string(),
            MappingContext::new("ConnectionStatus").with_option("thingId", "the:thing"),
        );
        definitions.insert(
            "header".to_string(),
            MappingContext::new("AddHeader")
                .with_option("inboundHeaders", r#"{"injected": "yes"}"#),
        );
        definitions
    }

    #[test]
    fn test_default_mapper_always_present() {
        let registry = MapperRegistry::default_only(MapperLimits::default()).unwrap();
        assert!(registry.get(DEFAULT_MAPPER_ALIAS).is_some());
    }

    #[test]
    fn test_builds_configured_mappers() {
        let registry =
            MapperRegistry::from_definitions(&definitions(), MapperLimits::default(), None)
                .unwrap();
        assert!(registry.get("status").is_some());
        assert!(registry.get("header").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let mut definitions = BTreeMap::new();
        definitions.insert("x".to_string(), MappingContext::new("NoSuchEngine"));
        let err =
            MapperRegistry::from_definitions(&definitions, MapperLimits::default(), None)
                .unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::ConfigurationInvalid { .. }
        ));
    }

    #[test]
    fn test_custom_instantiator_consulted() {
        struct NullMapper;
        impl MessageMapper for NullMapper {
            fn map_inbound(
                &self,
                _message: &ExternalMessage,
            ) -> Result<Vec<Envelope>, ConnectivityError> {
                Ok(Vec::new())
            }
            fn map_outbound(
                &self,
                _envelope: &Envelope,
            ) -> Result<Vec<ExternalMessage>, ConnectivityError> {
                Ok(Vec::new())
            }
        }

        let mut definitions = BTreeMap::new();
        definitions.insert("custom".to_string(), MappingContext::new("host-transformer"));
        let instantiate: Box<MapperInstantiator> = Box::new(|context: &MappingContext| {
            (context.mapping_engine == "host-transformer")
                .then(|| Box::new(NullMapper) as Box<dyn MessageMapper>)
        });
        let registry = MapperRegistry::from_definitions(
            &definitions,
            MapperLimits::default(),
            Some(&instantiate),
        )
        .unwrap();
        assert!(registry.get("custom").is_some());

        let message = ExternalMessage::builder(Headers::new()).build();
        assert!(registry
            .get("custom")
            .unwrap()
            .map_inbound(&message)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_misconfigured_mapper_fails_build() {
        let mut definitions = BTreeMap::new();
        // ConnectionStatus without the mandatory thingId option
        definitions.insert("status".to_string(), MappingContext::new("ConnectionStatus"));
        assert!(
            MapperRegistry::from_definitions(&definitions, MapperLimits::default(), None).is_err()
        );
    }

    #[test]
    fn test_empty_alias_list_yields_default() {
        let registry = MapperRegistry::default_only(MapperLimits::default()).unwrap();
        let mappers = registry.mappers_for(&[]).unwrap();
        assert_eq!(mappers.len(), 1);
        assert_eq!(mappers[0].alias(), DEFAULT_MAPPER_ALIAS);
    }

    #[test]
    fn test_undefined_alias_rejected() {
        let registry = MapperRegistry::default_only(MapperLimits::default()).unwrap();
        assert!(registry.validate_aliases(&["missing".to_string()]).is_err());
        assert!(registry.validate_aliases(&[]).is_ok());
    }
}
