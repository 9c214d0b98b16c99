//! File-triggered activation.
//!
//! When a pane shows a file owned by a deferred plugin, load the plugin and
//! rebuild the pane so the plugin's own view replaces the generic fallback.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{ActivationOutcome, reconstruct};
use crate::commands::CommandCache;
use crate::config::ConfigHandle;
use crate::host::{FileRef, Pane, PaneRef, Workspace};
use crate::loader::PluginLoader;
use crate::lock::LockStrategy;
use crate::manual_disable::ManualDisableTracker;
use crate::rules::ActivationRules;
use crate::weak_map::WeakKeyMap;

type InFlightChecks = Mutex<WeakKeyMap<dyn Pane, HashSet<String>>>;

/// Marks a (pane, file) check as running until dropped.
struct InFlightGuard<'a> {
    checks: &'a InFlightChecks,
    pane: PaneRef,
    path: String,
}

impl<'a> InFlightGuard<'a> {
    fn enter(checks: &'a InFlightChecks, pane: &PaneRef, path: &str) -> Option<Self> {
        let mut map = checks.lock().unwrap_or_else(|e| e.into_inner());
        map.prune();
        if !map.get_or_insert_with(pane, HashSet::new).insert(path.to_string()) {
            return None;
        }
        Some(Self {
            checks,
            pane: pane.clone(),
            path: path.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        let paths = map.get_or_insert_with(&self.pane, HashSet::new);
        paths.remove(&self.path);
        if paths.is_empty() {
            map.remove(&self.pane);
        }
    }
}

pub struct FileLazyActivator {
    workspace: Arc<dyn Workspace>,
    rules: Arc<dyn ActivationRules>,
    loader: Arc<PluginLoader>,
    commands: Arc<CommandCache>,
    lock: Arc<dyn LockStrategy<PaneRef>>,
    manual_disable: Arc<ManualDisableTracker>,
    config: ConfigHandle,
    in_flight: InFlightChecks,
}

impl FileLazyActivator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace: Arc<dyn Workspace>,
        rules: Arc<dyn ActivationRules>,
        loader: Arc<PluginLoader>,
        commands: Arc<CommandCache>,
        lock: Arc<dyn LockStrategy<PaneRef>>,
        manual_disable: Arc<ManualDisableTracker>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            workspace,
            rules,
            loader,
            commands,
            lock,
            manual_disable,
            config,
            in_flight: Mutex::new(WeakKeyMap::new()),
        }
    }

    /// A file was opened: after a short settle delay, check every pane now
    /// showing it.
    pub async fn on_file_open(&self, file: &FileRef) -> Vec<ActivationOutcome> {
        tokio::time::sleep(self.config.read(|c| c.file_open_settle())).await;

        let panes: Vec<PaneRef> = self
            .workspace
            .panes()
            .into_iter()
            .filter(|pane| pane.file().is_some_and(|f| f.path == file.path))
            .collect();

        join_all(panes.iter().map(|pane| self.check_file(file, pane))).await
    }

    /// Initial scan once the layout has been restored.
    pub async fn on_layout_ready(&self) -> Vec<ActivationOutcome> {
        let targets: Vec<(FileRef, PaneRef)> = self
            .workspace
            .panes()
            .into_iter()
            .filter_map(|pane| pane.file().map(|file| (file, pane)))
            .collect();

        join_all(targets.iter().map(|(file, pane)| self.check_file(file, pane))).await
    }

    /// Activate the plugin owning `file` for `pane`.
    pub async fn check_file(&self, file: &FileRef, pane: &PaneRef) -> ActivationOutcome {
        let Some(_in_flight) = InFlightGuard::enter(&self.in_flight, pane, &file.path) else {
            debug!(pane = %pane.id(), path = %file.path, "File check already running");
            return ActivationOutcome::Busy;
        };

        let _lock = self.lock.lock(pane).await;

        let Some(plugin_id) = self.rules.resolve_plugin_for_file(file).await else {
            debug!(path = %file.path, "No plugin resolved for file");
            return ActivationOutcome::Unresolved;
        };

        if self.loader.is_loaded(&plugin_id) {
            return ActivationOutcome::AlreadyLoaded { plugin_id };
        }
        if self.manual_disable.was_disabled_recently(&plugin_id) {
            debug!(plugin_id = %plugin_id, "Plugin was disabled by hand, not activating");
            return ActivationOutcome::ManuallyDisabled { plugin_id };
        }

        let timeout = self.config.read(|c| c.load_timeout());
        if let Err(e) = self.loader.load_within(&plugin_id, timeout).await {
            warn!(plugin_id = %plugin_id, path = %file.path, error = %e, "Could not load plugin for file");
            return ActivationOutcome::LoadFailed { plugin_id };
        }

        let previous_kind = pane.view_kind();
        reconstruct(pane, &plugin_id).await;
        self.commands.sync_command_wrappers_for_plugin(&plugin_id);

        let generic = self.config.read(|c| c.generic_view_kind.clone());
        if pane.view_kind() == previous_kind && previous_kind == generic {
            debug!(pane = %pane.id(), view_kind = %previous_kind, "View unchanged, re-applying view state");
            if let Err(e) = pane.reapply_view_state().await {
                warn!(pane = %pane.id(), error = %e, "Failed to re-apply view state");
            }
        }

        debug!(plugin_id = %plugin_id, pane = %pane.id(), view_kind = %pane.view_kind(), "File activation done");
        ActivationOutcome::Activated { plugin_id }
    }
}
