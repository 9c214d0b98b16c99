//! Scripted host used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ondemand_plugins::{
    CachedCommand, CommandHost, CommandOutput, FileRef, HostBindings, HostCommand, MemoryStore,
    OnDemandConfig, OnDemandError, OnDemandManager, Pane, PaneRef, PluginHost, PluginManifest,
    ProgressSink, Result, ViewRegistrationObserver, ViewRegistry, Workspace,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ========== Command palette ==========

#[derive(Default)]
pub struct FakeCommands {
    palette: Mutex<HashMap<String, HostCommand>>,
    real: Mutex<HashMap<String, Vec<CachedCommand>>>,
    executed: Mutex<Vec<String>>,
}

impl FakeCommands {
    /// A plugin registers its own commands on load.
    pub fn register_real(&self, plugin_id: &str, commands: &[CachedCommand]) {
        let mut palette = self.palette.lock().unwrap();
        for command in commands {
            let id = command.id.clone();
            let plugin = plugin_id.to_string();
            palette.insert(
                command.id.clone(),
                HostCommand {
                    descriptor: command.clone(),
                    executor: Arc::new(move || {
                        let id = id.clone();
                        let plugin = plugin.clone();
                        Box::pin(async move { Ok(serde_json::json!({ "ran": id, "by": plugin })) })
                    }),
                },
            );
        }
        self.real
            .lock()
            .unwrap()
            .insert(plugin_id.to_string(), commands.to_vec());
    }

    /// A plugin's commands go away on unload.
    pub fn unregister_real(&self, plugin_id: &str) {
        let commands = self.real.lock().unwrap().remove(plugin_id).unwrap_or_default();
        let mut palette = self.palette.lock().unwrap();
        for command in commands {
            palette.remove(&command.id);
        }
    }

    pub fn palette_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.palette.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHost for FakeCommands {
    fn register_command(&self, command: HostCommand) {
        self.palette
            .lock()
            .unwrap()
            .insert(command.descriptor.id.clone(), command);
    }

    fn remove_command(&self, command_id: &str) {
        self.palette.lock().unwrap().remove(command_id);
    }

    fn has_command(&self, command_id: &str) -> bool {
        self.palette.lock().unwrap().contains_key(command_id)
    }

    fn plugin_commands(&self, plugin_id: &str) -> Vec<CachedCommand> {
        self.real
            .lock()
            .unwrap()
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn execute_command(&self, command_id: &str) -> Result<CommandOutput> {
        let executor = self
            .palette
            .lock()
            .unwrap()
            .get(command_id)
            .map(|c| c.executor.clone())
            .ok_or_else(|| OnDemandError::CommandNotFound(command_id.to_string()))?;
        self.executed.lock().unwrap().push(command_id.to_string());
        executor().await
    }
}

// ========== View registry ==========

#[derive(Default)]
pub struct FakeViewRegistry {
    observer: Mutex<Option<Arc<dyn ViewRegistrationObserver>>>,
    registered: Mutex<Vec<(Option<String>, String)>>,
}

impl FakeViewRegistry {
    pub fn register_view(&self, loading_plugin_id: Option<&str>, view_kind: &str) {
        self.registered
            .lock()
            .unwrap()
            .push((loading_plugin_id.map(String::from), view_kind.to_string()));
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.view_registered(loading_plugin_id, view_kind);
        }
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().unwrap().is_some()
    }
}

impl ViewRegistry for FakeViewRegistry {
    fn set_registration_observer(
        &self,
        observer: Option<Arc<dyn ViewRegistrationObserver>>,
    ) -> Option<Arc<dyn ViewRegistrationObserver>> {
        std::mem::replace(&mut *self.observer.lock().unwrap(), observer)
    }
}

// ========== Plugin host ==========

pub struct FakeHost {
    pub commands: Arc<FakeCommands>,
    pub views: Arc<FakeViewRegistry>,
    manifests: Vec<PluginManifest>,
    plugin_commands: HashMap<String, Vec<CachedCommand>>,
    plugin_views: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    load_delay: Duration,
    loaded: Mutex<HashSet<String>>,
    enabled: Mutex<HashSet<String>>,
    load_requests: Mutex<Vec<String>>,
    enable_calls: Mutex<Vec<String>>,
    disable_calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    enabled_sets: Mutex<Vec<Vec<String>>>,
    restarts: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            commands: Arc::new(FakeCommands::default()),
            views: Arc::new(FakeViewRegistry::default()),
            manifests: Vec::new(),
            plugin_commands: HashMap::new(),
            plugin_views: HashMap::new(),
            failing: HashSet::new(),
            load_delay: Duration::from_millis(20),
            loaded: Mutex::new(HashSet::new()),
            enabled: Mutex::new(HashSet::new()),
            load_requests: Mutex::new(Vec::new()),
            enable_calls: Mutex::new(Vec::new()),
            disable_calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            enabled_sets: Mutex::new(Vec::new()),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn with_plugin(mut self, id: &str, version: &str) -> Self {
        self.manifests
            .push(PluginManifest::new(id, id.to_uppercase(), version));
        self
    }

    /// Commands the plugin registers when it loads.
    pub fn with_commands(mut self, id: &str, command_ids: &[&str]) -> Self {
        let commands = command_ids
            .iter()
            .map(|c| CachedCommand::new(*c, format!("{} command", c), id))
            .collect();
        self.plugin_commands.insert(id.to_string(), commands);
        self
    }

    /// View kinds the plugin registers when it loads.
    pub fn with_views(mut self, id: &str, view_kinds: &[&str]) -> Self {
        self.plugin_views.insert(
            id.to_string(),
            view_kinds.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Mark a plugin loaded without going through a load request.
    pub fn preload(&self, id: &str) {
        self.do_load(id);
    }

    fn do_load(&self, id: &str) {
        self.loaded.lock().unwrap().insert(id.to_string());
        self.enabled.lock().unwrap().insert(id.to_string());
        for view_kind in self.plugin_views.get(id).into_iter().flatten() {
            self.views.register_view(Some(id), view_kind);
        }
        if let Some(commands) = self.plugin_commands.get(id) {
            self.commands.register_real(id, commands);
        }
    }

    pub fn load_requests(&self) -> Vec<String> {
        self.load_requests.lock().unwrap().clone()
    }

    pub fn load_requests_for(&self, id: &str) -> usize {
        self.load_requests().iter().filter(|r| *r == id).count()
    }

    pub fn enable_calls(&self) -> Vec<String> {
        self.enable_calls.lock().unwrap().clone()
    }

    pub fn disable_calls(&self) -> Vec<String> {
        self.disable_calls.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn enabled_sets(&self) -> Vec<Vec<String>> {
        self.enabled_sets.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginHost for FakeHost {
    fn manifests(&self) -> Vec<PluginManifest> {
        self.manifests.clone()
    }

    fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.lock().unwrap().contains(plugin_id)
    }

    fn is_enabled(&self, plugin_id: &str) -> bool {
        self.enabled.lock().unwrap().contains(plugin_id)
    }

    async fn request_load(&self, plugin_id: &str) -> bool {
        self.load_requests
            .lock()
            .unwrap()
            .push(plugin_id.to_string());
        tokio::time::sleep(self.load_delay).await;
        if self.failing.contains(plugin_id) {
            return false;
        }
        self.do_load(plugin_id);
        true
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.enable_calls
            .lock()
            .unwrap()
            .push(plugin_id.to_string());
        if self.failing.contains(plugin_id) {
            return Err(OnDemandError::host(format!("{} refused to load", plugin_id)));
        }
        tokio::time::sleep(self.load_delay).await;
        self.do_load(plugin_id);
        Ok(())
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.disable_calls
            .lock()
            .unwrap()
            .push(plugin_id.to_string());
        self.loaded.lock().unwrap().remove(plugin_id);
        self.enabled.lock().unwrap().remove(plugin_id);
        self.commands.unregister_real(plugin_id);
        Ok(())
    }

    async fn apply_declared_enable_state(&self, plugin_id: &str) -> Result<()> {
        self.applied.lock().unwrap().push(plugin_id.to_string());
        Ok(())
    }

    async fn persist_enabled_set(&self, plugin_ids: &[String]) -> Result<()> {
        self.enabled_sets.lock().unwrap().push(plugin_ids.to_vec());
        Ok(())
    }

    async fn request_restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========== Workspace ==========

pub struct FakePane {
    id: String,
    view_kind: Mutex<String>,
    file: Option<FileRef>,
    visible: AtomicBool,
    view_after_reconstruct: Mutex<Option<String>>,
    reconstruct_delay: Duration,
    fail_reconstruct: bool,
    reconstructs: AtomicUsize,
    reapplies: AtomicUsize,
}

impl FakePane {
    pub fn new(id: &str, view_kind: &str) -> Self {
        Self {
            id: id.to_string(),
            view_kind: Mutex::new(view_kind.to_string()),
            file: None,
            visible: AtomicBool::new(true),
            view_after_reconstruct: Mutex::new(None),
            reconstruct_delay: Duration::from_millis(10),
            fail_reconstruct: false,
            reconstructs: AtomicUsize::new(0),
            reapplies: AtomicUsize::new(0),
        }
    }

    pub fn with_file(mut self, file: FileRef) -> Self {
        self.file = Some(file);
        self
    }

    /// View kind shown once the view has been rebuilt.
    pub fn becomes(self, view_kind: &str) -> Self {
        *self.view_after_reconstruct.lock().unwrap() = Some(view_kind.to_string());
        self
    }

    pub fn failing_reconstruct(mut self) -> Self {
        self.fail_reconstruct = true;
        self
    }

    pub fn hidden(self) -> Self {
        self.visible.store(false, Ordering::SeqCst);
        self
    }

    pub fn into_ref(self) -> (Arc<FakePane>, PaneRef) {
        let pane = Arc::new(self);
        let pane_ref: PaneRef = pane.clone();
        (pane, pane_ref)
    }

    pub fn reconstructs(&self) -> usize {
        self.reconstructs.load(Ordering::SeqCst)
    }

    pub fn reapplies(&self) -> usize {
        self.reapplies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pane for FakePane {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn view_kind(&self) -> String {
        self.view_kind.lock().unwrap().clone()
    }

    fn file(&self) -> Option<FileRef> {
        self.file.clone()
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    async fn reconstruct_view(&self) -> Result<()> {
        self.reconstructs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.reconstruct_delay).await;
        if self.fail_reconstruct {
            return Err(OnDemandError::reconstruct(&self.id, "view factory crashed"));
        }
        if let Some(next) = self.view_after_reconstruct.lock().unwrap().clone() {
            *self.view_kind.lock().unwrap() = next;
        }
        Ok(())
    }

    async fn reapply_view_state(&self) -> Result<()> {
        self.reapplies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeWorkspace {
    layout_ready: AtomicBool,
    panes: Mutex<Vec<PaneRef>>,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        Self {
            layout_ready: AtomicBool::new(true),
            panes: Mutex::new(Vec::new()),
        }
    }

    pub fn add_pane(&self, pane: PaneRef) {
        self.panes.lock().unwrap().push(pane);
    }

    pub fn set_layout_ready(&self, ready: bool) {
        self.layout_ready.store(ready, Ordering::SeqCst);
    }
}

impl Workspace for FakeWorkspace {
    fn is_layout_ready(&self) -> bool {
        self.layout_ready.load(Ordering::SeqCst)
    }

    fn panes(&self) -> Vec<PaneRef> {
        self.panes.lock().unwrap().clone()
    }
}

// ========== Progress ==========

#[derive(Default)]
pub struct RecordingProgress {
    pub opened: Mutex<Vec<(String, usize)>>,
    pub statuses: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<usize>>,
    pub closed: AtomicUsize,
}

impl ProgressSink for RecordingProgress {
    fn open(&self, title: &str, total: usize) {
        self.opened.lock().unwrap().push((title.to_string(), total));
    }

    fn set_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }

    fn set_progress(&self, done: usize) {
        self.progress.lock().unwrap().push(done);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ========== Harness ==========

pub struct Harness {
    pub host: Arc<FakeHost>,
    pub commands: Arc<FakeCommands>,
    pub views: Arc<FakeViewRegistry>,
    pub workspace: Arc<FakeWorkspace>,
    pub progress: Arc<RecordingProgress>,
    pub store: Arc<MemoryStore>,
    pub manager: OnDemandManager,
}

impl Harness {
    pub async fn start(config: OnDemandConfig, host: FakeHost) -> Self {
        Self::start_with_store(config, host, Arc::new(MemoryStore::new())).await
    }

    pub async fn start_with_store(
        config: OnDemandConfig,
        host: FakeHost,
        store: Arc<MemoryStore>,
    ) -> Self {
        init_tracing();
        let host = Arc::new(host);
        let workspace = Arc::new(FakeWorkspace::new());
        let progress = Arc::new(RecordingProgress::default());

        let bindings = HostBindings {
            plugins: host.clone(),
            workspace: workspace.clone(),
            commands: host.commands.clone(),
            views: host.views.clone(),
            progress: progress.clone(),
            store: store.clone(),
        };
        let manager = OnDemandManager::new(config, bindings).await.unwrap();

        Self {
            commands: host.commands.clone(),
            views: host.views.clone(),
            host,
            workspace,
            progress,
            store,
            manager,
        }
    }

    /// Add a pane to the workspace, returning both handles.
    pub fn pane(&self, pane: FakePane) -> (Arc<FakePane>, PaneRef) {
        let (pane, pane_ref) = pane.into_ref();
        self.workspace.add_pane(pane_ref.clone());
        (pane, pane_ref)
    }
}
