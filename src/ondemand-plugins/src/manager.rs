//! On-demand manager - the main interface of the crate.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::activation::{ActivationOutcome, FileLazyActivator, ViewLazyActivator};
use crate::commands::{CachedCommand, CommandCache, CommandOutput, SyncReport};
use crate::config::{ConfigHandle, OnDemandConfig};
use crate::host::{
    CommandHost, FileRef, PaneRef, PluginHost, ProgressSink, ViewRegistry, Workspace,
};
use crate::intercept::InterceptedHost;
use crate::loader::PluginLoader;
use crate::lock::{PaneLockStrategy, PaneViewLockStrategy, ResourceLockTable};
use crate::manual_disable::ManualDisableTracker;
use crate::policy::{ApplyOutcome, ApplyRequest, StartupPolicyCoordinator};
use crate::rules::{ActivationRules, StaticActivationRules, ViewKindMap};
use crate::storage::{SnapshotBoundary, SnapshotStore};
use crate::Result;

/// Everything the manager needs from the host application.
#[derive(Clone)]
pub struct HostBindings {
    pub plugins: Arc<dyn PluginHost>,
    pub workspace: Arc<dyn Workspace>,
    pub commands: Arc<dyn CommandHost>,
    pub views: Arc<dyn ViewRegistry>,
    pub progress: Arc<dyn ProgressSink>,
    pub store: Arc<dyn SnapshotStore>,
}

/// On-demand manager - wires the activators, the command cache and the
/// startup policy coordinator around one host.
///
/// The host feeds events in (`on_file_open`, `on_active_pane_changed`,
/// `on_layout_ready`) and routes manual enable/disable through
/// [`OnDemandManager::plugin_host`].
pub struct OnDemandManager {
    config: ConfigHandle,

    /// Host with enable/disable interception
    host: Arc<InterceptedHost>,

    loader: Arc<PluginLoader>,
    commands: Arc<CommandCache>,
    learned: ViewKindMap,
    files: FileLazyActivator,
    views: ViewLazyActivator,
    policy: StartupPolicyCoordinator,
}

impl OnDemandManager {
    /// Create a manager using rules built from the configuration.
    pub async fn new(config: OnDemandConfig, bindings: HostBindings) -> Result<Self> {
        Self::build(config, bindings, None).await
    }

    /// Create a manager with custom activation rules.
    pub async fn with_rules(
        config: OnDemandConfig,
        bindings: HostBindings,
        rules: Arc<dyn ActivationRules>,
    ) -> Result<Self> {
        Self::build(config, bindings, Some(rules)).await
    }

    async fn build(
        config: OnDemandConfig,
        bindings: HostBindings,
        rules: Option<Arc<dyn ActivationRules>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = ConfigHandle::new(config);

        let snapshot = Arc::new(SnapshotBoundary::open(bindings.store.clone()).await);
        let restored = snapshot.read().await;
        let learned = ViewKindMap::new(restored.lazy_on_views.clone());

        let loader = Arc::new(PluginLoader::new(
            bindings.plugins.clone(),
            config.read(|c| c.load_poll_interval()),
        ));
        let commands = CommandCache::new(
            bindings.plugins.clone(),
            bindings.commands.clone(),
            loader.clone(),
            config.clone(),
            snapshot.clone(),
        );
        commands.load_from_snapshot(&restored);

        let manual_disable = Arc::new(ManualDisableTracker::new(config.clone()));
        let host = Arc::new(InterceptedHost::new(
            bindings.plugins.clone(),
            commands.clone(),
            manual_disable.clone(),
            config.clone(),
        ));

        let rules = rules.unwrap_or_else(|| {
            Arc::new(StaticActivationRules::new(config.clone(), learned.clone()))
                as Arc<dyn ActivationRules>
        });
        let locks = Arc::new(ResourceLockTable::new());

        let files = FileLazyActivator::new(
            bindings.workspace.clone(),
            rules.clone(),
            loader.clone(),
            commands.clone(),
            Arc::new(PaneLockStrategy::new(locks.clone())),
            manual_disable,
            config.clone(),
        );
        let views = ViewLazyActivator::new(
            bindings.workspace.clone(),
            rules,
            loader.clone(),
            commands.clone(),
            Arc::new(PaneViewLockStrategy::new(locks)),
            config.clone(),
        );
        let policy = StartupPolicyCoordinator::new(
            host.clone(),
            loader.clone(),
            commands.clone(),
            bindings.views.clone(),
            bindings.progress.clone(),
            learned.clone(),
            snapshot,
            config.clone(),
        );

        let report = commands.sync_all_command_wrappers();
        tracing::info!(
            wrappers = report.registered.len(),
            learned_plugins = learned.snapshot().len(),
            "On-demand plugin manager ready"
        );

        Ok(Self {
            config,
            host,
            loader,
            commands,
            learned,
            files,
            views,
            policy,
        })
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Host view with enable/disable interception. Manual enables and
    /// disables should go through it.
    pub fn plugin_host(&self) -> Arc<dyn PluginHost> {
        self.host.clone()
    }

    pub fn command_cache(&self) -> &Arc<CommandCache> {
        &self.commands
    }

    pub fn policy(&self) -> &StartupPolicyCoordinator {
        &self.policy
    }

    /// Learned plugin → view kinds mapping.
    pub fn learned_view_kinds(&self) -> BTreeMap<String, Vec<String>> {
        self.learned.snapshot()
    }

    // ========== Events ==========

    pub async fn on_file_open(&self, file: &FileRef) -> Vec<ActivationOutcome> {
        self.files.on_file_open(file).await
    }

    pub fn on_active_pane_changed(&self, pane: PaneRef) -> Option<JoinHandle<()>> {
        self.views.on_active_pane_changed(pane)
    }

    /// View activation for one pane, bypassing the debouncer.
    pub async fn initialize_for_pane(&self, pane: &PaneRef) -> ActivationOutcome {
        self.views.initialize_for_pane(pane).await
    }

    /// File activation for one pane, bypassing the settle delay.
    pub async fn check_file(&self, file: &FileRef, pane: &PaneRef) -> ActivationOutcome {
        self.files.check_file(file, pane).await
    }

    /// Initial scan of every pane by both activators.
    pub async fn on_layout_ready(&self) -> Vec<ActivationOutcome> {
        let (mut files, views) =
            tokio::join!(self.files.on_layout_ready(), self.views.on_layout_ready());
        files.extend(views);
        files
    }

    pub async fn check_view_kind_for_lazy_loading(&self, view_kind: &str) -> Vec<String> {
        self.views.check_view_kind_for_lazy_loading(view_kind).await
    }

    // ========== Plugins ==========

    pub async fn ensure_plugin_loaded(&self, plugin_id: &str) -> bool {
        self.loader.ensure_plugin_loaded(plugin_id).await
    }

    pub async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.host.enable_plugin(plugin_id).await
    }

    pub async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.host.disable_plugin(plugin_id).await
    }

    pub async fn apply_startup_policy(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        self.policy.apply(request).await
    }

    // ========== Commands ==========

    pub fn get_cached_command(&self, command_id: &str) -> Option<CachedCommand> {
        self.commands.get_cached_command(command_id)
    }

    pub fn is_wrapper_command(&self, command_id: &str) -> bool {
        self.commands.is_wrapper_command(command_id)
    }

    pub fn sync_command_wrappers_for_plugin(&self, plugin_id: &str) -> SyncReport {
        self.commands.sync_command_wrappers_for_plugin(plugin_id)
    }

    pub fn register_cached_commands_for_plugin(&self, plugin_id: &str) -> usize {
        self.commands.register_cached_commands_for_plugin(plugin_id)
    }

    pub async fn ensure_commands_cached(&self, plugin_id: &str) -> Result<Vec<CachedCommand>> {
        self.commands.ensure_commands_cached(plugin_id).await
    }

    pub async fn remove_cached_commands_for_plugin(&self, plugin_id: &str) {
        self.commands.remove_cached_commands_for_plugin(plugin_id).await
    }

    pub async fn rebuild_and_apply_command_cache(&self, force: bool) -> usize {
        self.commands.rebuild_and_apply_command_cache(force, None).await
    }

    pub async fn run_wrapper_command(&self, command_id: &str) -> Result<CommandOutput> {
        self.commands.run_wrapper_command(command_id).await
    }
}
