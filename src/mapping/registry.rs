//! Mapper registry: alias-to-factory resolution.
//!
//! Descriptors reference mappers by alias; the registry turns an alias plus
//! its property bag into a configured instance. Unknown aliases are
//! configuration errors raised when a pipeline is built, never at message
//! time.

use std::collections::HashMap;

use crate::mapping::builtin::{
    DroppingMapper, DuplicatingMapper, FaultyMapper, HeaderNormalizingMapper, PassThroughMapper,
};
use crate::mapping::{MappingContext, MappingError, MessageMapper};

/// Factory producing configured mapper instances.
pub trait MapperFactory: Send + Sync {
    fn create(&self, context: &MappingContext) -> Result<Box<dyn MessageMapper>, MappingError>;
}

impl<F> MapperFactory for F
where
    F: Fn(&MappingContext) -> Result<Box<dyn MessageMapper>, MappingError> + Send + Sync,
{
    fn create(&self, context: &MappingContext) -> Result<Box<dyn MessageMapper>, MappingError> {
        self(context)
    }
}

/// Registry of mapper factories keyed by alias.
#[derive(Default)]
pub struct MapperRegistry {
    factories: HashMap<String, Box<dyn MapperFactory>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the builtin mappers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("passthrough", |ctx: &MappingContext| {
            Ok(Box::new(PassThroughMapper::from_context(ctx)) as Box<dyn MessageMapper>)
        });
        registry.register("duplicating", |ctx: &MappingContext| {
            DuplicatingMapper::from_context(ctx).map(|m| Box::new(m) as Box<dyn MessageMapper>)
        });
        registry.register("dropping", |_ctx: &MappingContext| {
            Ok(Box::new(DroppingMapper) as Box<dyn MessageMapper>)
        });
        registry.register("faulty", |ctx: &MappingContext| {
            Ok(Box::new(FaultyMapper::from_context(ctx)) as Box<dyn MessageMapper>)
        });
        registry.register("normalize-headers", |ctx: &MappingContext| {
            Ok(Box::new(HeaderNormalizingMapper::from_context(ctx)) as Box<dyn MessageMapper>)
        });
        registry
    }

    /// Register a factory under an alias, replacing any previous entry.
    pub fn register<F: MapperFactory + 'static>(&mut self, alias: &str, factory: F) {
        self.factories.insert(alias.to_string(), Box::new(factory));
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.factories.contains_key(alias)
    }

    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    /// Instantiate a configured mapper for the given context.
    pub fn create(
        &self,
        alias: &str,
        context: &MappingContext,
    ) -> Result<Box<dyn MessageMapper>, MappingError> {
        let factory = self
            .factories
            .get(alias)
            .ok_or_else(|| MappingError::UnknownAlias {
                alias: alias.to_string(),
            })?;
        factory.create(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MapperSpec;

    #[test]
    fn test_builtin_aliases_registered() {
        let registry = MapperRegistry::with_builtins();
        for alias in [
            "passthrough",
            "duplicating",
            "dropping",
            "faulty",
            "normalize-headers",
        ] {
            assert!(registry.contains(alias), "missing builtin {alias}");
        }
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_unknown_alias_is_error() {
        let registry = MapperRegistry::with_builtins();
        let context = MappingContext::from_spec(&MapperSpec::new("ghost")).unwrap();
        let err = registry.create("ghost", &context).unwrap_err();
        assert_eq!(
            err,
            MappingError::UnknownAlias {
                alias: "ghost".into()
            }
        );
    }

    #[test]
    fn test_custom_factory_registration() {
        let mut registry = MapperRegistry::new();
        registry.register("custom-drop", |_ctx: &MappingContext| {
            Ok(Box::new(crate::mapping::builtin::DroppingMapper) as Box<dyn MessageMapper>)
        });
        let context = MappingContext::from_spec(&MapperSpec::new("custom-drop")).unwrap();
        let mapper = registry.create("custom-drop", &context).unwrap();
        assert_eq!(mapper.name(), "dropping");
    }
}
