//! Converter registry - converters selectable by name

use std::collections::HashMap;
use vasbridge_core::{Error, Result};

use crate::converter::{Converter, ConverterContext, ConverterSettings};
use crate::event::FullConverter;
use crate::feature::FeatureConverter;
use crate::filtered::FilteredConverter;

/// Builds a converter for one sink
pub type ConverterFactory = fn(&ConverterSettings, ConverterContext) -> Box<dyn Converter>;

fn full(_: &ConverterSettings, context: ConverterContext) -> Box<dyn Converter> {
    Box::new(FullConverter::new(context))
}

fn filtered(settings: &ConverterSettings, context: ConverterContext) -> Box<dyn Converter> {
    Box::new(FilteredConverter::new(context, settings))
}

fn feature(_: &ConverterSettings, context: ConverterContext) -> Box<dyn Converter> {
    Box::new(FeatureConverter::new(context))
}

/// Registry of converter factories, indexed by lower-case name
pub struct ConverterRegistry {
    factories: HashMap<String, ConverterFactory>,
}

impl ConverterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in converters and their aliases
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("full", full);
        registry.register("event", full);
        registry.register("filtered", filtered);
        registry.register("filter", filtered);
        registry.register("feature", feature);
        registry.register("esukom", feature);
        registry
    }

    /// Register a factory; a previous one with the same name is replaced
    pub fn register(&mut self, name: &str, factory: ConverterFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    /// Build the converter registered as `name`
    pub fn resolve(
        &self,
        name: &str,
        settings: &ConverterSettings,
        context: ConverterContext,
    ) -> Result<Box<dyn Converter>> {
        let factory = self
            .factories
            .get(&name.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::UnknownConverter {
                name: name.to_string(),
            })?;
        Ok(factory(settings, context))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.trim().to_ascii_lowercase())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ConverterContext {
        ConverterContext::new("pub-1", "openvas@scanner")
    }

    #[test]
    fn test_defaults_and_aliases() {
        let registry = ConverterRegistry::with_defaults();
        let settings = ConverterSettings::default();

        for (name, expected) in [
            ("full", "full"),
            ("event", "full"),
            ("filtered", "filtered"),
            ("FILTER", "filtered"),
            ("feature", "feature"),
            ("esukom", "feature"),
        ] {
            let converter = registry.resolve(name, &settings, context()).unwrap();
            assert_eq!(converter.name(), expected);
            assert_eq!(converter.context().publisher_id, "pub-1");
        }
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_unknown_converter() {
        let registry = ConverterRegistry::with_defaults();
        let err = registry
            .resolve("sql", &ConverterSettings::default(), context())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownConverter { ref name } if name == "sql"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_empty_registry() {
        let mut registry = ConverterRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains("full"));

        registry.register("Full", full);
        assert!(registry.contains("full"));
        assert_eq!(registry.names(), vec!["full"]);
    }
}
