//! Command cache and wrapper commands.
//!
//! A deferred plugin's commands are captured once (by loading the plugin
//! transiently if needed) and replayed into the host palette as wrapper
//! commands. Invoking a wrapper loads the owning plugin and forwards to the
//! real command it registers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::host::{CommandHost, HostCommand, PluginHost};
use crate::loader::PluginLoader;
use crate::storage::{Snapshot, SnapshotBoundary};
use crate::{OnDemandError, Result};

/// Value returned by a command invocation.
pub type CommandOutput = serde_json::Value;

/// Command executor function type.
pub type CommandExecutor = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<CommandOutput>> + Send>> + Send + Sync,
>;

/// Descriptor of a plugin command, as captured from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCommand {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub plugin_id: String,
}

impl CachedCommand {
    pub fn new(id: impl Into<String>, name: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            plugin_id: plugin_id.into(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// What a wrapper sync changed, by command id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Wrappers newly registered into the host.
    pub registered: Vec<String>,

    /// Wrappers removed from the host.
    pub removed: Vec<String>,

    /// Wrappers now shadowed by the plugin's real command.
    pub promoted: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.removed.is_empty() && self.promoted.is_empty()
    }

    fn merge(&mut self, other: SyncReport) {
        self.registered.extend(other.registered);
        self.removed.extend(other.removed);
        self.promoted.extend(other.promoted);
    }
}

#[derive(Default)]
struct CacheState {
    commands: BTreeMap<String, Vec<CachedCommand>>,
    versions: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,

    /// Live wrapper command id → owning plugin id.
    wrappers: HashMap<String, String>,
}

/// Cached command descriptors plus the wrappers registered from them.
pub struct CommandCache {
    me: Weak<CommandCache>,
    host: Arc<dyn PluginHost>,
    commands: Arc<dyn CommandHost>,
    loader: Arc<PluginLoader>,
    config: ConfigHandle,
    snapshot: Arc<SnapshotBoundary>,
    state: RwLock<CacheState>,
}

impl CommandCache {
    /// `host` must be the undecorated host: transient loads disable the
    /// plugin again without counting as a manual disable.
    pub fn new(
        host: Arc<dyn PluginHost>,
        commands: Arc<dyn CommandHost>,
        loader: Arc<PluginLoader>,
        config: ConfigHandle,
        snapshot: Arc<SnapshotBoundary>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host,
            commands,
            loader,
            config,
            snapshot,
            state: RwLock::new(CacheState::default()),
        })
    }

    /// Seed the cache from a persisted snapshot.
    pub fn load_from_snapshot(&self, snapshot: &Snapshot) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.commands = snapshot.command_cache.clone();
        state.versions = snapshot.command_cache_versions.clone();
        state.updated_at = snapshot.command_cache_updated_at;
        debug!(plugins = state.commands.len(), "Command cache restored");
    }

    pub fn get_cached_command(&self, command_id: &str) -> Option<CachedCommand> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .commands
            .values()
            .flatten()
            .find(|c| c.id == command_id)
            .cloned()
    }

    /// Cached descriptors of one plugin.
    pub fn cached_commands(&self, plugin_id: &str) -> Vec<CachedCommand> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.commands.get(plugin_id).cloned().unwrap_or_default()
    }

    pub fn cached_version(&self, plugin_id: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.versions.get(plugin_id).cloned()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).updated_at
    }

    pub fn is_wrapper_command(&self, command_id: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.wrappers.contains_key(command_id)
    }

    /// Bring the host palette in line with the plugin's state.
    ///
    /// A loaded plugin gets its wrappers promoted (or dropped if it no longer
    /// registers them). An unloaded deferred plugin gets a wrapper per cached
    /// descriptor. Anything else loses its wrappers. Calling it again without
    /// a state change reports nothing.
    pub fn sync_command_wrappers_for_plugin(&self, plugin_id: &str) -> SyncReport {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let report = if self.host.is_loaded(plugin_id) {
            self.promote_wrappers(&mut state, plugin_id)
        } else if self.config.mode(plugin_id).is_deferred() {
            self.register_wrappers(&mut state, plugin_id)
        } else {
            let removed = self.remove_wrappers(&mut state, plugin_id, |_| true);
            SyncReport {
                removed,
                ..Default::default()
            }
        };

        if !report.is_empty() {
            debug!(
                plugin_id = %plugin_id,
                registered = report.registered.len(),
                removed = report.removed.len(),
                promoted = report.promoted.len(),
                "Synced wrapper commands"
            );
        }
        report
    }

    /// Sync every plugin that has cached descriptors or live wrappers.
    pub fn sync_all_command_wrappers(&self) -> SyncReport {
        let plugin_ids: HashSet<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state
                .commands
                .keys()
                .cloned()
                .chain(state.wrappers.values().cloned())
                .collect()
        };

        let mut report = SyncReport::default();
        for plugin_id in plugin_ids {
            report.merge(self.sync_command_wrappers_for_plugin(&plugin_id));
        }
        report
    }

    /// Register wrappers for the plugin's cached descriptors regardless of
    /// its mode. Does nothing while the plugin is loaded.
    pub fn register_cached_commands_for_plugin(&self, plugin_id: &str) -> usize {
        if self.host.is_loaded(plugin_id) {
            return 0;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.register_wrappers(&mut state, plugin_id).registered.len()
    }

    /// Forget a plugin: drop its wrappers, descriptors and version marker.
    pub async fn remove_cached_commands_for_plugin(&self, plugin_id: &str) {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let removed = self.remove_wrappers(&mut state, plugin_id, |_| true);
            let had_entry = state.commands.remove(plugin_id).is_some();
            state.versions.remove(plugin_id);
            had_entry || !removed.is_empty()
        };

        if removed {
            debug!(plugin_id = %plugin_id, "Removed cached commands");
            self.persist().await;
        }
    }

    /// Make sure the plugin's descriptors are cached for its current version.
    pub async fn ensure_commands_cached(&self, plugin_id: &str) -> Result<Vec<CachedCommand>> {
        let commands = self.refresh_plugin(plugin_id, false).await?;
        self.persist().await;
        Ok(commands)
    }

    /// Rebuild the cache for every deferred plugin (or only `targets`) and
    /// re-sync their wrappers. Returns how many plugins were cached.
    pub async fn rebuild_and_apply_command_cache(
        &self,
        force: bool,
        targets: Option<&[String]>,
    ) -> usize {
        let deferred: Vec<String> = self
            .host
            .manifests()
            .into_iter()
            .map(|m| m.id)
            .filter(|id| self.config.mode(id).is_deferred())
            .filter(|id| targets.is_none_or(|t| t.contains(id)))
            .collect();

        let mut rebuilt = 0;
        for plugin_id in &deferred {
            match self.refresh_plugin(plugin_id, force).await {
                Ok(_) => rebuilt += 1,
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "Failed to cache plugin commands")
                }
            }
            self.sync_command_wrappers_for_plugin(plugin_id);
        }

        if targets.is_none() {
            self.drop_stale_plugins(&deferred);
        }

        self.persist().await;
        info!(rebuilt, force, "Command cache rebuilt");
        rebuilt
    }

    /// Execute a wrapper: load its plugin, then forward to the real command.
    pub async fn run_wrapper_command(&self, command_id: &str) -> Result<CommandOutput> {
        let descriptor = self
            .get_cached_command(command_id)
            .ok_or_else(|| OnDemandError::CommandNotFound(command_id.to_string()))?;
        let plugin_id = descriptor.plugin_id;

        let timeout = self.config.read(|c| c.load_timeout());
        self.loader.load_within(&plugin_id, timeout).await?;

        self.sync_command_wrappers_for_plugin(&plugin_id);

        let registered = self
            .commands
            .plugin_commands(&plugin_id)
            .iter()
            .any(|c| c.id == command_id);
        if !registered || self.is_wrapper_command(command_id) {
            return Err(OnDemandError::command_unavailable(command_id, &plugin_id));
        }

        debug!(command_id = %command_id, plugin_id = %plugin_id, "Forwarding wrapper command");
        self.commands.execute_command(command_id).await
    }

    /// Write the cache into the persisted snapshot.
    pub async fn persist(&self) {
        let (commands, versions, updated_at) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (
                state.commands.clone(),
                state.versions.clone(),
                state.updated_at,
            )
        };
        self.snapshot
            .commit(move |s| {
                s.command_cache = commands;
                s.command_cache_versions = versions;
                s.command_cache_updated_at = updated_at;
            })
            .await;
    }

    async fn refresh_plugin(&self, plugin_id: &str, force: bool) -> Result<Vec<CachedCommand>> {
        let manifest = self
            .host
            .manifest(plugin_id)
            .ok_or_else(|| OnDemandError::host(format!("plugin '{}' is not installed", plugin_id)))?;

        if !force {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = state.commands.get(plugin_id)
                && state.versions.get(plugin_id) == Some(&manifest.version)
            {
                return Ok(cached.clone());
            }
        }

        let was_loaded = self.host.is_loaded(plugin_id);
        let demand = self.loader.demand(plugin_id);
        if !was_loaded && !self.loader.load_unclaimed(plugin_id).await {
            return Err(OnDemandError::load_failed(plugin_id, "transient load for command capture"));
        }

        let commands = self.commands.plugin_commands(plugin_id);

        if !was_loaded {
            if self.loader.demand(plugin_id) != demand {
                debug!(plugin_id = %plugin_id, "Plugin requested during command capture, keeping it loaded");
                self.sync_command_wrappers_for_plugin(plugin_id);
            } else if let Err(e) = self.host.disable_plugin(plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to unload plugin after command capture");
            }
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state
                .commands
                .insert(plugin_id.to_string(), commands.clone());
            state
                .versions
                .insert(plugin_id.to_string(), manifest.version.clone());
            state.updated_at = Some(Utc::now());
        }

        debug!(
            plugin_id = %plugin_id,
            version = %manifest.version,
            commands = commands.len(),
            transient = !was_loaded,
            "Captured plugin commands"
        );
        Ok(commands)
    }

    fn drop_stale_plugins(&self, keep: &[String]) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = state
            .commands
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for plugin_id in stale {
            self.remove_wrappers(&mut state, &plugin_id, |_| true);
            state.commands.remove(&plugin_id);
            state.versions.remove(&plugin_id);
            debug!(plugin_id = %plugin_id, "Dropped stale command cache entry");
        }
    }

    fn promote_wrappers(&self, state: &mut CacheState, plugin_id: &str) -> SyncReport {
        let real: HashSet<String> = self
            .commands
            .plugin_commands(plugin_id)
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut report = SyncReport::default();
        let owned: Vec<String> = wrapper_ids(state, plugin_id);
        for command_id in owned {
            state.wrappers.remove(&command_id);
            if real.contains(&command_id) {
                report.promoted.push(command_id);
            } else {
                self.commands.remove_command(&command_id);
                report.removed.push(command_id);
            }
        }
        report
    }

    fn register_wrappers(&self, state: &mut CacheState, plugin_id: &str) -> SyncReport {
        let cached = state.commands.get(plugin_id).cloned().unwrap_or_default();
        let cached_ids: HashSet<&str> = cached.iter().map(|c| c.id.as_str()).collect();

        let removed = self.remove_wrappers(state, plugin_id, |id| !cached_ids.contains(id));

        let mut registered = Vec::new();
        for descriptor in cached {
            let live = state.wrappers.contains_key(&descriptor.id)
                && self.commands.has_command(&descriptor.id);
            if live {
                continue;
            }
            state
                .wrappers
                .insert(descriptor.id.clone(), plugin_id.to_string());
            registered.push(descriptor.id.clone());
            self.commands.register_command(HostCommand {
                executor: self.wrapper_executor(&descriptor.id),
                descriptor,
            });
        }

        SyncReport {
            registered,
            removed,
            ..Default::default()
        }
    }

    fn remove_wrappers(
        &self,
        state: &mut CacheState,
        plugin_id: &str,
        mut select: impl FnMut(&str) -> bool,
    ) -> Vec<String> {
        let doomed: Vec<String> = wrapper_ids(state, plugin_id)
            .into_iter()
            .filter(|id| select(id))
            .collect();
        for command_id in &doomed {
            state.wrappers.remove(command_id);
            self.commands.remove_command(command_id);
        }
        doomed
    }

    fn wrapper_executor(&self, command_id: &str) -> CommandExecutor {
        let cache = self.me.clone();
        let command_id = command_id.to_string();
        Arc::new(move || {
            let cache = cache.clone();
            let command_id = command_id.clone();
            Box::pin(async move {
                match cache.upgrade() {
                    Some(cache) => cache.run_wrapper_command(&command_id).await,
                    None => Err(OnDemandError::CommandNotFound(command_id)),
                }
            })
        })
    }
}

fn wrapper_ids(state: &CacheState, plugin_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = state
        .wrappers
        .iter()
        .filter(|(_, owner)| owner.as_str() == plugin_id)
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}
