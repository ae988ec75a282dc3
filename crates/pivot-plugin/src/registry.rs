use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::builtins::{AppendHeadersPlugin, UrlFilterPlugin};
use crate::{PluginChain, PluginError, ProxyPlugin};

type PluginBuilder =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn ProxyPlugin>, PluginError> + Send + Sync>;

/// Maps plugin identifiers to constructors. Built once at startup (and again
/// on reload); the resulting chain template is shared by every work unit.
pub struct PluginRegistry {
    builders: HashMap<String, PluginBuilder>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("url_filter", |settings| {
            Ok(Arc::new(UrlFilterPlugin::from_settings(settings)?) as Arc<dyn ProxyPlugin>)
        });
        registry.register("append_headers", |settings| {
            Ok(Arc::new(AppendHeadersPlugin::from_settings(settings)?) as Arc<dyn ProxyPlugin>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn ProxyPlugin>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(builder));
    }

    /// Instantiate the configured plugins, in order.
    pub fn build_chain(
        &self,
        names: &[String],
        settings: &BTreeMap<String, serde_json::Value>,
    ) -> Result<PluginChain, PluginError> {
        let mut plugins = Vec::with_capacity(names.len());
        for name in names {
            let builder = self
                .builders
                .get(name)
                .ok_or_else(|| PluginError(format!("unknown plugin: {name}")))?;
            let plugin_settings = settings
                .get(name)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            plugins.push(builder(&plugin_settings)?);
        }
        Ok(PluginChain::new(plugins))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_chain_from_builtin_names_in_order() {
        let registry = PluginRegistry::with_builtins();
        let mut settings = BTreeMap::new();
        settings.insert("append_headers".to_string(), json!({"headers": []}));

        let chain = registry
            .build_chain(
                &["url_filter".to_string(), "append_headers".to_string()],
                &settings,
            )
            .expect("build chain");
        assert!(!chain.is_empty());
    }

    #[test]
    fn unknown_plugin_names_are_rejected() {
        let registry = PluginRegistry::with_builtins();
        let error = registry
            .build_chain(&["no_such_plugin".to_string()], &BTreeMap::new())
            .expect_err("must fail");
        assert!(error.0.contains("unknown plugin"));
    }
}
