//! View-triggered activation.
//!
//! When a pane becomes active showing a view kind learned for a deferred
//! plugin, load that plugin and rebuild the pane. Work is serialized per
//! (pane, view kind) and a pane that was just handled for the same kind is
//! left alone for the re-entry window.

use futures::FutureExt;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ActivationOutcome, reconstruct};
use crate::commands::CommandCache;
use crate::config::ConfigHandle;
use crate::debounce::{DebounceHandler, Debouncer};
use crate::host::{Pane, PaneRef, Workspace};
use crate::loader::PluginLoader;
use crate::lock::LockStrategy;
use crate::rules::ActivationRules;
use crate::weak_map::WeakKeyMap;

struct LastProcessed {
    view_kind: String,
    at: Instant,
}

struct ViewActivation {
    workspace: Arc<dyn Workspace>,
    rules: Arc<dyn ActivationRules>,
    loader: Arc<PluginLoader>,
    commands: Arc<CommandCache>,
    lock: Arc<dyn LockStrategy<(PaneRef, String)>>,
    config: ConfigHandle,
    last_processed: Mutex<WeakKeyMap<dyn Pane, LastProcessed>>,
}

impl ViewActivation {
    fn recently_handled(&self, pane: &PaneRef, view_kind: &str) -> bool {
        let window = self.config.read(|c| c.reentry_window());
        let markers = self.last_processed.lock().unwrap_or_else(|e| e.into_inner());
        markers
            .get(pane)
            .is_some_and(|last| last.view_kind == view_kind && last.at.elapsed() < window)
    }

    fn stamp(&self, pane: &PaneRef, view_kind: String) {
        let mut markers = self.last_processed.lock().unwrap_or_else(|e| e.into_inner());
        markers.prune();
        markers.insert(
            pane,
            LastProcessed {
                view_kind,
                at: Instant::now(),
            },
        );
    }

    async fn initialize_for_pane(&self, pane: &PaneRef) -> ActivationOutcome {
        if !self.workspace.is_layout_ready() {
            return ActivationOutcome::NotReady;
        }
        let view_kind = pane.view_kind();

        let target = (pane.clone(), view_kind.clone());
        let _lock = self.lock.lock(&target).await;

        if !self.workspace.is_layout_ready() || !pane.is_visible() {
            return ActivationOutcome::NotReady;
        }
        if self.recently_handled(pane, &view_kind) {
            debug!(pane = %pane.id(), view_kind = %view_kind, "Pane handled moments ago");
            return ActivationOutcome::RecentlyHandled;
        }

        let Some(plugin_id) = self.rules.resolve_plugin_for_view_kind(&view_kind) else {
            return ActivationOutcome::Unresolved;
        };
        if !self.config.is_view_eligible(&plugin_id) {
            return ActivationOutcome::Ineligible { plugin_id };
        }

        let was_loaded = self.loader.is_loaded(&plugin_id);
        let timeout = self.config.read(|c| c.load_timeout());
        if let Err(e) = self.loader.load_within(&plugin_id, timeout).await {
            warn!(plugin_id = %plugin_id, view_kind = %view_kind, error = %e, "Could not load plugin for view");
            return ActivationOutcome::LoadFailed { plugin_id };
        }
        if !was_loaded {
            reconstruct(pane, &plugin_id).await;
        }

        self.commands.sync_command_wrappers_for_plugin(&plugin_id);
        self.stamp(pane, view_kind.clone());

        debug!(
            plugin_id = %plugin_id,
            pane = %pane.id(),
            view_kind = %view_kind,
            was_loaded,
            "View activation done"
        );
        if was_loaded {
            ActivationOutcome::AlreadyLoaded { plugin_id }
        } else {
            ActivationOutcome::Activated { plugin_id }
        }
    }
}

pub struct ViewLazyActivator {
    inner: Arc<ViewActivation>,
    debouncer: Debouncer<PaneRef>,
}

impl ViewLazyActivator {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        rules: Arc<dyn ActivationRules>,
        loader: Arc<PluginLoader>,
        commands: Arc<CommandCache>,
        lock: Arc<dyn LockStrategy<(PaneRef, String)>>,
        config: ConfigHandle,
    ) -> Self {
        let debounce = config.read(|c| c.view_debounce());
        let inner = Arc::new(ViewActivation {
            workspace,
            rules,
            loader,
            commands,
            lock,
            config,
            last_processed: Mutex::new(WeakKeyMap::new()),
        });

        let activation = inner.clone();
        let handler: DebounceHandler<PaneRef> = Arc::new(move |pane: PaneRef| {
            let activation = activation.clone();
            async move {
                activation.initialize_for_pane(&pane).await;
            }
            .boxed()
        });

        Self {
            inner,
            debouncer: Debouncer::new(debounce, handler),
        }
    }

    /// Active pane changed. Debounced; returns the dispatch handle when this
    /// event was handled immediately.
    pub fn on_active_pane_changed(&self, pane: PaneRef) -> Option<JoinHandle<()>> {
        self.debouncer.call(pane)
    }

    /// Undebounced activation for one pane.
    pub async fn initialize_for_pane(&self, pane: &PaneRef) -> ActivationOutcome {
        self.inner.initialize_for_pane(pane).await
    }

    /// Process every pane once the layout has been restored.
    pub async fn on_layout_ready(&self) -> Vec<ActivationOutcome> {
        let panes = self.inner.workspace.panes();
        join_all(panes.iter().map(|pane| self.inner.initialize_for_pane(pane))).await
    }

    /// Load every eligible plugin claiming `view_kind`. Returns the plugins
    /// that ended up loaded.
    pub async fn check_view_kind_for_lazy_loading(&self, view_kind: &str) -> Vec<String> {
        if view_kind.is_empty() || !self.inner.workspace.is_layout_ready() {
            return Vec::new();
        }

        let timeout = self.inner.config.read(|c| c.load_timeout());
        let mut loaded = Vec::new();
        for plugin_id in self.inner.rules.plugins_for_view_kind(view_kind) {
            if !self.inner.config.is_view_eligible(&plugin_id) {
                continue;
            }
            match self.inner.loader.load_within(&plugin_id, timeout).await {
                Ok(()) => loaded.push(plugin_id),
                Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Could not load plugin for view kind"),
            }
        }
        loaded
    }
}
