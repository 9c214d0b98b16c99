//! Contracts the core consumes from the host application.
//!
//! The host owns panes, files, the command palette and the actual plugin
//! loader. The core only talks to it through the traits below, which keeps
//! every activator testable against a scripted host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Result;
use crate::commands::{CachedCommand, CommandExecutor, CommandOutput};

/// Declared identity of an installed plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A file as seen by the activation rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRef {
    /// Vault-relative path.
    pub path: String,

    /// Top-level frontmatter keys, if the host parsed any.
    pub frontmatter_keys: Vec<String>,
}

impl FileRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            frontmatter_keys: Vec::new(),
        }
    }

    pub fn with_frontmatter_key(mut self, key: impl Into<String>) -> Self {
        self.frontmatter_keys.push(key.into());
        self
    }

    /// Extension without the dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

/// Plugin lifecycle operations provided by the host.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Every installed plugin.
    fn manifests(&self) -> Vec<PluginManifest>;

    /// Manifest of one plugin.
    fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.manifests().into_iter().find(|m| m.id == plugin_id)
    }

    fn is_loaded(&self, plugin_id: &str) -> bool;

    fn is_enabled(&self, plugin_id: &str) -> bool;

    /// Load a plugin, returning whether it ended up loaded.
    ///
    /// Must tolerate duplicate concurrent calls for the same plugin.
    async fn request_load(&self, plugin_id: &str) -> bool;

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()>;

    /// Enable or disable a plugin according to its configured startup policy.
    async fn apply_declared_enable_state(&self, plugin_id: &str) -> Result<()>;

    /// Persist the set of plugins the host should enable on next start.
    async fn persist_enabled_set(&self, plugin_ids: &[String]) -> Result<()>;

    /// Restart the host application.
    async fn request_restart(&self) -> Result<()>;
}

/// A host UI slot showing one view at a time.
#[async_trait]
pub trait Pane: Send + Sync {
    /// Stable identifier, used for logging only.
    fn id(&self) -> String;

    /// Kind of view currently shown.
    fn view_kind(&self) -> String;

    /// File shown by the view, if any.
    fn file(&self) -> Option<FileRef>;

    fn is_visible(&self) -> bool;

    /// Tear down and recreate the view so newly registered factories apply.
    async fn reconstruct_view(&self) -> Result<()>;

    /// Re-apply the pane's current view state.
    async fn reapply_view_state(&self) -> Result<()>;
}

/// Shared pane handle. Identity is the allocation, not [`Pane::id`].
pub type PaneRef = Arc<dyn Pane>;

/// Workspace queries used by the activators.
pub trait Workspace: Send + Sync {
    /// Whether the initial layout restore finished.
    fn is_layout_ready(&self) -> bool;

    /// All panes, in host order.
    fn panes(&self) -> Vec<PaneRef>;
}

/// A command registered into the host palette.
#[derive(Clone)]
pub struct HostCommand {
    pub descriptor: CachedCommand,
    pub executor: CommandExecutor,
}

impl std::fmt::Debug for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCommand")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Host command palette.
#[async_trait]
pub trait CommandHost: Send + Sync {
    /// Register or replace a command.
    fn register_command(&self, command: HostCommand);

    fn remove_command(&self, command_id: &str);

    fn has_command(&self, command_id: &str) -> bool;

    /// Real commands currently registered by a loaded plugin.
    fn plugin_commands(&self, plugin_id: &str) -> Vec<CachedCommand>;

    /// Run whatever is registered under `command_id`.
    async fn execute_command(&self, command_id: &str) -> Result<CommandOutput>;
}

/// Receives view-kind registrations while installed.
pub trait ViewRegistrationObserver: Send + Sync {
    /// `loading_plugin_id` is the plugin whose load is running, if any.
    fn view_registered(&self, loading_plugin_id: Option<&str>, view_kind: &str);
}

/// Host view registry with a single observation hook.
pub trait ViewRegistry: Send + Sync {
    /// Install `observer`, returning the one previously installed.
    fn set_registration_observer(
        &self,
        observer: Option<Arc<dyn ViewRegistrationObserver>>,
    ) -> Option<Arc<dyn ViewRegistrationObserver>>;
}

/// Progress reporting for long policy runs.
pub trait ProgressSink: Send + Sync {
    fn open(&self, _title: &str, _total: usize) {}

    fn set_status(&self, status: &str);

    fn set_progress(&self, done: usize);

    fn close(&self) {}
}

/// Progress sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn set_status(&self, _status: &str) {}

    fn set_progress(&self, _done: usize) {}
}
