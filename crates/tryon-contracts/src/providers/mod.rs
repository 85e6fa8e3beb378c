use std::sync::Arc;

use indexmap::IndexMap;

pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl<T: NamedProvider + ?Sized> NamedProvider for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: NamedProvider + ?Sized> NamedProvider for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Lookup table keyed by provider id. Registration order is the default
/// priority order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: IndexMap<String, T>,
}

impl<T: NamedProvider> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self {
            providers: IndexMap::new(),
        }
    }
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            registry.register(provider);
        }
        registry
    }

    /// Re-registering an id replaces the provider but keeps its position.
    pub fn register(&mut self, provider: T) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self.providers.keys().cloned().collect::<Vec<String>>();
        names.sort();
        names
    }

    pub fn providers(&self) -> impl Iterator<Item = &T> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolves `names` in the given order; every unknown id is reported.
    pub fn select(&self, names: &[String]) -> Result<Vec<&T>, Vec<String>> {
        let mut selected = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.providers.get(name.as_str()) {
                Some(provider) => selected.push(provider),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(selected)
        } else {
            Err(missing)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{NamedProvider, ProviderRegistry};

    #[derive(Clone, Debug)]
    struct DummyProvider {
        name: String,
        tag: u8,
    }

    impl NamedProvider for DummyProvider {
        fn name(&self) -> &str {
            self.name.as_str()
        }
    }

    fn dummy(name: &str, tag: u8) -> DummyProvider {
        DummyProvider {
            name: name.to_string(),
            tag,
        }
    }

    #[test]
    fn registry_keeps_registration_order_and_sorted_listing() {
        let registry = ProviderRegistry::new(vec![dummy("z", 0), dummy("a", 0), dummy("m", 0)]);
        assert_eq!(registry.list(), vec!["a", "m", "z"]);
        assert_eq!(
            registry
                .providers()
                .map(|provider| provider.name().to_string())
                .collect::<Vec<String>>(),
            vec!["z", "a", "m"]
        );
    }

    #[test]
    fn re_register_replaces_in_place() {
        let mut registry = ProviderRegistry::new(vec![dummy("fal", 1), dummy("replicate", 1)]);
        registry.register(dummy("fal", 2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("fal").map(|provider| provider.tag), Some(2));
        assert_eq!(
            registry.providers().next().map(|provider| provider.name()),
            Some("fal")
        );
    }

    #[test]
    fn select_follows_requested_order_and_reports_unknown() {
        let registry = ProviderRegistry::new(vec![dummy("fal", 0), dummy("replicate", 0)]);
        let picked = registry
            .select(&["replicate".to_string(), "fal".to_string()])
            .unwrap_or_default();
        assert_eq!(
            picked
                .iter()
                .map(|provider| provider.name())
                .collect::<Vec<&str>>(),
            vec!["replicate", "fal"]
        );
        let missing = registry
            .select(&["fal".to_string(), "nope".to_string(), "gone".to_string()])
            .err()
            .unwrap_or_default();
        assert_eq!(missing, vec!["nope", "gone"]);
    }

    #[test]
    fn shared_providers_are_named_through_arc() {
        let registry: ProviderRegistry<Arc<DummyProvider>> =
            ProviderRegistry::new(vec![Arc::new(dummy("vertex", 0))]);
        assert!(registry.contains("vertex"));
    }
}
