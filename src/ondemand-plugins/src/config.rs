//! On-demand loading configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::{OnDemandError, Result};

/// How a plugin is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PluginMode {
    /// Loaded at startup, never deferred.
    #[default]
    #[serde(alias = "alwaysEnabled")]
    KeepEnabled,

    /// Deferred until one of its commands runs (or an opted-in trigger fires).
    Lazy,

    /// Deferred until a pane shows one of its view kinds.
    LazyOnView,

    /// Never loaded.
    Disabled,
}

impl PluginMode {
    /// Whether this mode postpones loading.
    pub fn is_deferred(self) -> bool {
        matches!(self, Self::Lazy | Self::LazyOnView)
    }
}

/// Extra triggers for plugins in [`PluginMode::Lazy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyOptions {
    /// Load when a pane shows one of the plugin's view kinds.
    #[serde(default)]
    pub use_view: bool,

    /// View kinds declared by hand, merged with learned ones.
    #[serde(default)]
    pub view_kinds: Vec<String>,

    /// Load when a file matching the file rules opens.
    #[serde(default)]
    pub use_file: bool,
}

/// Per-plugin startup policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPolicy {
    #[serde(default)]
    pub mode: PluginMode,

    #[serde(default)]
    pub lazy_options: Option<LazyOptions>,
}

/// Which plugins get their view kinds learned and which react to view triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViewCollectionPolicy {
    /// Only `lazyOnView` plugins.
    LazyOnViewOnly,

    /// `lazyOnView` plugins plus `lazy` plugins with `use_view` set.
    #[default]
    IncludeLazyWithViewOptIn,
}

impl ViewCollectionPolicy {
    /// Whether a plugin with this policy takes part in view-based activation.
    pub fn is_eligible(self, policy: &PluginPolicy) -> bool {
        match policy.mode {
            PluginMode::LazyOnView => true,
            PluginMode::Lazy => {
                self == Self::IncludeLazyWithViewOptIn
                    && policy.lazy_options.as_ref().is_some_and(|o| o.use_view)
            }
            PluginMode::KeepEnabled | PluginMode::Disabled => false,
        }
    }
}

/// Static file-to-plugin rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRules {
    /// File extension (without dot) to owning plugin.
    #[serde(default)]
    pub extensions: HashMap<String, String>,

    /// Frontmatter key to owning plugin.
    #[serde(default)]
    pub frontmatter_keys: HashMap<String, String>,
}

/// On-demand loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandConfig {
    /// Id of the plugin hosting this core; always kept enabled.
    #[serde(default = "default_core_plugin_id")]
    pub core_plugin_id: String,

    /// Window during which an already processed pane+view is ignored.
    #[serde(default = "default_reentry_window_ms")]
    pub reentry_window_ms: u64,

    /// Debounce window for "pane became active" bursts.
    #[serde(default = "default_view_debounce_ms")]
    pub view_debounce_ms: u64,

    /// Delay after "file opened" before panes are inspected.
    #[serde(default = "default_file_open_settle_ms")]
    pub file_open_settle_ms: u64,

    /// Debounce window batching startup policy requests.
    #[serde(default = "default_apply_debounce_ms")]
    pub apply_debounce_ms: u64,

    /// Deadline for a batch of plugins to finish loading.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Poll interval while waiting for plugins to load.
    #[serde(default = "default_load_poll_interval_ms")]
    pub load_poll_interval_ms: u64,

    /// Pause after a batch load so plugins can finish registering.
    #[serde(default = "default_post_load_settle_ms")]
    pub post_load_settle_ms: u64,

    /// How long a manual disable suppresses automatic activation.
    #[serde(default = "default_manual_disable_window_ms")]
    pub manual_disable_window_ms: u64,

    /// Keep wrapper commands around for deferred plugins that get disabled.
    #[serde(default = "default_true")]
    pub re_register_commands_on_disable: bool,

    /// View kind the host falls back to when no plugin claims a file.
    #[serde(default = "default_generic_view_kind")]
    pub generic_view_kind: String,

    #[serde(default)]
    pub view_collection: ViewCollectionPolicy,

    /// Per-plugin policies; plugins not listed are kept enabled.
    #[serde(default)]
    pub plugins: HashMap<String, PluginPolicy>,

    #[serde(default)]
    pub file_rules: FileRules,
}

impl Default for OnDemandConfig {
    fn default() -> Self {
        Self {
            core_plugin_id: default_core_plugin_id(),
            reentry_window_ms: default_reentry_window_ms(),
            view_debounce_ms: default_view_debounce_ms(),
            file_open_settle_ms: default_file_open_settle_ms(),
            apply_debounce_ms: default_apply_debounce_ms(),
            load_timeout_ms: default_load_timeout_ms(),
            load_poll_interval_ms: default_load_poll_interval_ms(),
            post_load_settle_ms: default_post_load_settle_ms(),
            manual_disable_window_ms: default_manual_disable_window_ms(),
            re_register_commands_on_disable: true,
            generic_view_kind: default_generic_view_kind(),
            view_collection: ViewCollectionPolicy::default(),
            plugins: HashMap::new(),
            file_rules: FileRules::default(),
        }
    }
}

impl OnDemandConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would make the timing loops degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.core_plugin_id.trim().is_empty() {
            return Err(OnDemandError::Config(
                "core_plugin_id must not be empty".to_string(),
            ));
        }
        if self.load_poll_interval_ms == 0 {
            return Err(OnDemandError::Config(
                "load_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Policy for a plugin, defaulting to kept-enabled.
    pub fn policy(&self, plugin_id: &str) -> PluginPolicy {
        self.plugins.get(plugin_id).cloned().unwrap_or_default()
    }

    /// Mode for a plugin.
    pub fn mode(&self, plugin_id: &str) -> PluginMode {
        self.plugins
            .get(plugin_id)
            .map(|p| p.mode)
            .unwrap_or_default()
    }

    /// Set the mode for a plugin, keeping its lazy options.
    pub fn set_mode(&mut self, plugin_id: &str, mode: PluginMode) {
        self.plugins.entry(plugin_id.to_string()).or_default().mode = mode;
    }

    /// Whether the plugin takes part in view-based activation.
    pub fn is_view_eligible(&self, plugin_id: &str) -> bool {
        self.view_collection.is_eligible(&self.policy(plugin_id))
    }

    pub fn reentry_window(&self) -> Duration {
        Duration::from_millis(self.reentry_window_ms)
    }

    pub fn view_debounce(&self) -> Duration {
        Duration::from_millis(self.view_debounce_ms)
    }

    pub fn file_open_settle(&self) -> Duration {
        Duration::from_millis(self.file_open_settle_ms)
    }

    pub fn apply_debounce(&self) -> Duration {
        Duration::from_millis(self.apply_debounce_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn load_poll_interval(&self) -> Duration {
        Duration::from_millis(self.load_poll_interval_ms)
    }

    pub fn post_load_settle(&self) -> Duration {
        Duration::from_millis(self.post_load_settle_ms)
    }

    pub fn manual_disable_window(&self) -> Duration {
        Duration::from_millis(self.manual_disable_window_ms)
    }
}

/// Shared, externally updatable view of the configuration.
///
/// The core only reads through this handle; the host updates it when the user
/// changes a plugin's mode.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<OnDemandConfig>>,
}

impl ConfigHandle {
    pub fn new(config: OnDemandConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Run `f` against the current configuration.
    pub fn read<T>(&self, f: impl FnOnce(&OnDemandConfig) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Replace parts of the configuration.
    pub fn update(&self, f: impl FnOnce(&mut OnDemandConfig)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn get(&self) -> OnDemandConfig {
        self.read(Clone::clone)
    }

    pub fn mode(&self, plugin_id: &str) -> PluginMode {
        self.read(|c| c.mode(plugin_id))
    }

    pub fn policy(&self, plugin_id: &str) -> PluginPolicy {
        self.read(|c| c.policy(plugin_id))
    }

    pub fn is_view_eligible(&self, plugin_id: &str) -> bool {
        self.read(|c| c.is_view_eligible(plugin_id))
    }
}

fn default_core_plugin_id() -> String {
    "on-demand-plugins".to_string()
}

fn default_reentry_window_ms() -> u64 {
    1500
}

fn default_view_debounce_ms() -> u64 {
    100
}

fn default_file_open_settle_ms() -> u64 {
    50
}

fn default_apply_debounce_ms() -> u64 {
    100
}

fn default_load_timeout_ms() -> u64 {
    60_000 // 60 seconds
}

fn default_load_poll_interval_ms() -> u64 {
    100
}

fn default_post_load_settle_ms() -> u64 {
    2500
}

fn default_manual_disable_window_ms() -> u64 {
    5000
}

fn default_generic_view_kind() -> String {
    "markdown".to_string()
}

fn default_true() -> bool {
    true
}
