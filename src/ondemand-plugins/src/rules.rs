//! Activation rules: which plugin owns a file or a view kind.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::config::{ConfigHandle, PluginMode};
use crate::host::FileRef;

/// Pure lookups from a trigger to its owning plugin.
#[async_trait]
pub trait ActivationRules: Send + Sync {
    async fn resolve_plugin_for_file(&self, file: &FileRef) -> Option<String>;

    fn resolve_plugin_for_view_kind(&self, view_kind: &str) -> Option<String>;

    /// Every plugin claiming `view_kind`.
    fn plugins_for_view_kind(&self, view_kind: &str) -> Vec<String> {
        self.resolve_plugin_for_view_kind(view_kind)
            .into_iter()
            .collect()
    }
}

/// Learned plugin → view kinds mapping.
///
/// Written by the startup policy run that observes view registrations, read
/// by the view activator.
#[derive(Debug, Clone, Default)]
pub struct ViewKindMap {
    inner: Arc<RwLock<BTreeMap<String, Vec<String>>>>,
}

impl ViewKindMap {
    pub fn new(initial: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Record that `plugin_id` registered `view_kind`. Returns false if known.
    pub fn record(&self, plugin_id: &str, view_kind: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let kinds = map.entry(plugin_id.to_string()).or_default();
        if kinds.iter().any(|k| k == view_kind) {
            return false;
        }
        kinds.push(view_kind.to_string());
        true
    }

    pub fn view_kinds(&self, plugin_id: &str) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(plugin_id).cloned().unwrap_or_default()
    }

    /// Plugins that registered `view_kind`, by plugin id.
    pub fn plugins_for(&self, view_kind: &str) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|(_, kinds)| kinds.iter().any(|k| k == view_kind))
            .map(|(plugin_id, _)| plugin_id.clone())
            .collect()
    }

    /// Keep only plugins for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|plugin_id, _| keep(plugin_id));
    }

    pub fn replace(&self, next: BTreeMap<String, Vec<String>>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *map = next;
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Rules driven by [`crate::config::FileRules`], per-plugin lazy options and
/// the learned view kinds.
pub struct StaticActivationRules {
    config: ConfigHandle,
    learned: ViewKindMap,
}

impl StaticActivationRules {
    pub fn new(config: ConfigHandle, learned: ViewKindMap) -> Self {
        Self { config, learned }
    }

    fn accepts_file_trigger(&self, plugin_id: &str) -> bool {
        let policy = self.config.policy(plugin_id);
        match policy.mode {
            PluginMode::LazyOnView => true,
            PluginMode::Lazy => policy.lazy_options.is_some_and(|o| o.use_file),
            PluginMode::KeepEnabled | PluginMode::Disabled => false,
        }
    }

    fn declared_plugins_for(&self, view_kind: &str) -> Vec<String> {
        self.config.read(|c| {
            c.plugins
                .iter()
                .filter(|(_, policy)| {
                    policy
                        .lazy_options
                        .as_ref()
                        .is_some_and(|o| o.view_kinds.iter().any(|k| k == view_kind))
                })
                .map(|(plugin_id, _)| plugin_id.clone())
                .collect()
        })
    }
}

#[async_trait]
impl ActivationRules for StaticActivationRules {
    async fn resolve_plugin_for_file(&self, file: &FileRef) -> Option<String> {
        let rules = self.config.read(|c| c.file_rules.clone());

        let by_extension = file
            .extension()
            .and_then(|ext| rules.extensions.get(ext).cloned());
        let by_frontmatter = || {
            file.frontmatter_keys
                .iter()
                .find_map(|key| rules.frontmatter_keys.get(key).cloned())
        };

        by_extension
            .or_else(by_frontmatter)
            .filter(|plugin_id| self.accepts_file_trigger(plugin_id))
    }

    /// First view-eligible claimer; an ineligible claimer is only returned
    /// when nobody eligible claims the kind.
    fn resolve_plugin_for_view_kind(&self, view_kind: &str) -> Option<String> {
        let claimers = self.plugins_for_view_kind(view_kind);
        claimers
            .iter()
            .find(|plugin_id| self.config.is_view_eligible(plugin_id))
            .or_else(|| claimers.first())
            .cloned()
    }

    fn plugins_for_view_kind(&self, view_kind: &str) -> Vec<String> {
        if view_kind.is_empty() {
            return Vec::new();
        }
        let mut plugins = self.learned.plugins_for(view_kind);
        plugins.extend(self.declared_plugins_for(view_kind));
        plugins.sort();
        plugins.dedup();
        plugins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LazyOptions, OnDemandConfig, PluginPolicy};

    fn rules() -> (StaticActivationRules, ConfigHandle, ViewKindMap) {
        let mut config = OnDemandConfig::default();
        config.set_mode("excalidraw", PluginMode::LazyOnView);
        config.set_mode("kanban", PluginMode::Lazy);
        config.plugins.insert(
            "brat".to_string(),
            PluginPolicy {
                mode: PluginMode::Lazy,
                lazy_options: Some(LazyOptions {
                    use_view: true,
                    view_kinds: vec!["brat-view".to_string()],
                    use_file: false,
                }),
            },
        );
        config
            .file_rules
            .extensions
            .insert("excalidraw".to_string(), "excalidraw".to_string());
        config
            .file_rules
            .frontmatter_keys
            .insert("excalidraw-plugin".to_string(), "excalidraw".to_string());
        config
            .file_rules
            .frontmatter_keys
            .insert("kanban-plugin".to_string(), "kanban".to_string());

        let handle = ConfigHandle::new(config);
        let learned = ViewKindMap::default();
        (
            StaticActivationRules::new(handle.clone(), learned.clone()),
            handle,
            learned,
        )
    }

    #[tokio::test]
    async fn test_file_by_extension_and_frontmatter() {
        let (rules, _, _) = rules();

        let drawing = FileRef::new("art/sketch.excalidraw");
        let note = FileRef::new("art/sketch.md").with_frontmatter_key("excalidraw-plugin");
        let plain = FileRef::new("daily/today.md");

        assert_eq!(
            rules.resolve_plugin_for_file(&drawing).await.as_deref(),
            Some("excalidraw")
        );
        assert_eq!(
            rules.resolve_plugin_for_file(&note).await.as_deref(),
            Some("excalidraw")
        );
        assert_eq!(rules.resolve_plugin_for_file(&plain).await, None);
    }

    #[tokio::test]
    async fn test_lazy_plugin_needs_file_opt_in() {
        let (rules, config, _) = rules();
        let board = FileRef::new("boards/todo.md").with_frontmatter_key("kanban-plugin");

        assert_eq!(rules.resolve_plugin_for_file(&board).await, None);

        config.update(|c| {
            c.plugins.get_mut("kanban").unwrap().lazy_options = Some(LazyOptions {
                use_file: true,
                ..Default::default()
            });
        });
        assert_eq!(
            rules.resolve_plugin_for_file(&board).await.as_deref(),
            Some("kanban")
        );
    }

    #[test]
    fn test_view_kind_learned_and_declared() {
        let (rules, _, learned) = rules();

        assert_eq!(rules.resolve_plugin_for_view_kind("excalidraw"), None);
        assert!(learned.record("excalidraw", "excalidraw"));
        assert!(!learned.record("excalidraw", "excalidraw"));

        assert_eq!(
            rules.resolve_plugin_for_view_kind("excalidraw").as_deref(),
            Some("excalidraw")
        );
        assert_eq!(
            rules.resolve_plugin_for_view_kind("brat-view").as_deref(),
            Some("brat")
        );
        // exact, case-sensitive match
        assert_eq!(rules.resolve_plugin_for_view_kind("Excalidraw"), None);
    }

    #[test]
    fn test_view_kind_prefers_eligible_claimer() {
        let (rules, config, learned) = rules();
        config.update(|c| {
            c.plugins.insert(
                "aardvark".to_string(),
                PluginPolicy {
                    mode: PluginMode::KeepEnabled,
                    lazy_options: Some(LazyOptions {
                        view_kinds: vec!["excalidraw".to_string()],
                        ..Default::default()
                    }),
                },
            );
        });
        learned.record("excalidraw", "excalidraw");

        assert_eq!(
            rules.plugins_for_view_kind("excalidraw"),
            vec!["aardvark".to_string(), "excalidraw".to_string()]
        );
        assert_eq!(
            rules.resolve_plugin_for_view_kind("excalidraw").as_deref(),
            Some("excalidraw")
        );

        // nobody eligible: the claimer is still reported
        config.update(|c| c.set_mode("excalidraw", PluginMode::KeepEnabled));
        assert_eq!(
            rules.resolve_plugin_for_view_kind("excalidraw").as_deref(),
            Some("aardvark")
        );
    }

    #[test]
    fn test_view_kind_map_retain() {
        let map = ViewKindMap::default();
        map.record("a", "x");
        map.record("b", "x");

        assert_eq!(map.plugins_for("x"), vec!["a".to_string(), "b".to_string()]);
        map.retain(|id| id != "a");
        assert_eq!(map.plugins_for("x"), vec!["b".to_string()]);
    }
}
