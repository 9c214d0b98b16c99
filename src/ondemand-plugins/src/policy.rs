//! Startup policy coordinator.
//!
//! Applying the startup policy walks every plugin, so it is single-flight:
//! at most one run body executes at a time and every request that arrives
//! while a run is past its debounce window merges into one follow-up run.
//!
//! While a run executes, a [`ViewRegistrationObserver`] records which view
//! kinds each loading plugin registers. That is how the view activator learns
//! which plugin owns a view kind.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::CommandCache;
use crate::config::{ConfigHandle, PluginMode};
use crate::host::{
    NoopProgress, PluginHost, PluginManifest, ProgressSink, ViewRegistrationObserver,
    ViewRegistry,
};
use crate::loader::PluginLoader;
use crate::rules::ViewKindMap;
use crate::storage::SnapshotBoundary;
use crate::{OnDemandError, Result};

/// One call to [`StartupPolicyCoordinator::apply`].
#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    /// Take the progress path: enable every deferred plugin, rebuild the
    /// command cache and restart the host.
    pub show_progress: bool,

    /// Restrict the run to these plugins. `None` or empty means all.
    pub plugin_ids: Option<Vec<String>>,

    /// Checked between plugins on the progress path.
    pub cancel: CancellationToken,
}

impl ApplyRequest {
    pub fn new(show_progress: bool) -> Self {
        Self {
            show_progress,
            ..Default::default()
        }
    }

    pub fn with_plugins(mut self, plugin_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.plugin_ids = Some(plugin_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Requests merged into one run.
#[derive(Debug, Clone, Default)]
struct MergedRequest {
    show_progress: bool,

    /// `None` targets every plugin and absorbs any subset.
    plugin_ids: Option<BTreeSet<String>>,

    cancels: Vec<CancellationToken>,
}

impl MergedRequest {
    fn from_request(request: ApplyRequest) -> Self {
        Self {
            show_progress: request.show_progress,
            plugin_ids: request
                .plugin_ids
                .filter(|ids| !ids.is_empty())
                .map(|ids| ids.into_iter().collect()),
            cancels: vec![request.cancel],
        }
    }

    fn merge(&mut self, other: MergedRequest) {
        self.show_progress |= other.show_progress;
        self.plugin_ids = match (self.plugin_ids.take(), other.plugin_ids) {
            (Some(mut mine), Some(theirs)) => {
                mine.extend(theirs);
                Some(mine)
            }
            _ => None,
        };
        self.cancels.extend(other.cancels);
    }

    /// Cancelled as soon as any merged caller cancels.
    fn is_cancelled(&self) -> bool {
        self.cancels.iter().any(CancellationToken::is_cancelled)
    }

    fn targets(&self, manifests: Vec<PluginManifest>) -> Vec<PluginManifest> {
        match &self.plugin_ids {
            Some(ids) => manifests.into_iter().filter(|m| ids.contains(&m.id)).collect(),
            None => manifests,
        }
    }
}

/// Result of one run, shared by every caller merged into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Sequence number of the run, starting at 1.
    pub run_id: u64,

    pub show_progress: bool,

    /// Plugins the run walked.
    pub targets: Vec<String>,

    /// Targets in a deferred mode.
    pub deferred: Vec<String>,

    pub cancelled: bool,

    /// Outcome of the batch load wait; `None` when no wait happened.
    pub all_loaded: Option<bool>,

    /// Enabled set persisted for the next start, sorted.
    pub enabled_set: Vec<String>,

    pub restart_requested: bool,
}

type RunHandle = Shared<BoxFuture<'static, Option<ApplyOutcome>>>;

struct Run {
    id: u64,
    request: MergedRequest,

    /// Set once the debounce window closed; the request is frozen from then on.
    started: bool,

    handle: RunHandle,
}

#[derive(Default)]
struct RunState {
    active: Option<Run>,
    pending: Option<Run>,
}

/// Forwards registrations to the previously installed observer and records
/// view kinds registered by eligible loading plugins.
struct LearningObserver {
    learned: ViewKindMap,
    config: ConfigHandle,
    previous: Option<Arc<dyn ViewRegistrationObserver>>,
}

impl ViewRegistrationObserver for LearningObserver {
    fn view_registered(&self, loading_plugin_id: Option<&str>, view_kind: &str) {
        if let Some(plugin_id) = loading_plugin_id
            && !view_kind.is_empty()
            && self.config.is_view_eligible(plugin_id)
            && self.learned.record(plugin_id, view_kind)
        {
            debug!(plugin_id = %plugin_id, view_kind = %view_kind, "Learned view kind");
        }
        if let Some(previous) = &self.previous {
            previous.view_registered(loading_plugin_id, view_kind);
        }
    }
}

/// Restores the previous observer when dropped.
struct ObserverGuard {
    registry: Arc<dyn ViewRegistry>,
    previous: Option<Arc<dyn ViewRegistrationObserver>>,
}

impl ObserverGuard {
    fn install(registry: Arc<dyn ViewRegistry>, learned: ViewKindMap, config: ConfigHandle) -> Self {
        let previous = registry.set_registration_observer(None);
        let observer: Arc<dyn ViewRegistrationObserver> = Arc::new(LearningObserver {
            learned,
            config,
            previous: previous.clone(),
        });
        registry.set_registration_observer(Some(observer));
        Self { registry, previous }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.registry
            .set_registration_observer(self.previous.take());
    }
}

struct RunCompletion {
    inner: Arc<PolicyInner>,
    id: u64,
}

impl Drop for RunCompletion {
    fn drop(&mut self) {
        self.inner.finish(self.id);
    }
}

struct PolicyInner {
    host: Arc<dyn PluginHost>,
    loader: Arc<PluginLoader>,
    commands: Arc<CommandCache>,
    views: Arc<dyn ViewRegistry>,
    progress: Arc<dyn ProgressSink>,
    learned: ViewKindMap,
    snapshot: Arc<SnapshotBoundary>,
    config: ConfigHandle,
    state: Mutex<RunState>,
    runs: AtomicU64,
}

impl PolicyInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close the debounce window and freeze the request.
    fn begin(&self, id: u64) -> MergedRequest {
        let mut state = self.lock_state();
        let RunState { active, pending } = &mut *state;
        match [active, pending]
            .into_iter()
            .flatten()
            .find(|run| run.id == id)
        {
            Some(run) => {
                run.started = true;
                run.request.clone()
            }
            None => {
                warn!(run_id = id, "Startup policy run lost its request");
                MergedRequest::default()
            }
        }
    }

    /// Promote the pending follow-up once the active run is done.
    fn finish(&self, id: u64) {
        let mut state = self.lock_state();
        if state.active.as_ref().is_some_and(|run| run.id == id) {
            state.active = state.pending.take();
        }
    }

    async fn execute(self: &Arc<Self>, id: u64, request: MergedRequest) -> ApplyOutcome {
        let manifests = self.host.manifests();
        let targets = request.targets(manifests);
        let deferred: Vec<PluginManifest> = targets
            .iter()
            .filter(|m| self.config.mode(&m.id).is_deferred())
            .cloned()
            .collect();

        info!(
            run_id = id,
            show_progress = request.show_progress,
            targets = targets.len(),
            deferred = deferred.len(),
            "Applying startup policy"
        );

        let progress: Arc<dyn ProgressSink> = if request.show_progress {
            self.progress.clone()
        } else {
            Arc::new(NoopProgress)
        };
        progress.open("Applying plugin startup policy", deferred.len() + 2);

        let observer = ObserverGuard::install(
            self.views.clone(),
            self.learned.clone(),
            self.config.clone(),
        );

        let mut cancelled = false;
        let mut all_loaded = None;

        if !request.show_progress {
            for (index, plugin) in targets.iter().enumerate() {
                progress.set_status(&format!("Applying {}", plugin.name));
                progress.set_progress(index + 1);
                if self.config.is_view_eligible(&plugin.id) {
                    self.loader.ensure_plugin_loaded(&plugin.id).await;
                }
                if let Err(e) = self.host.apply_declared_enable_state(&plugin.id).await {
                    warn!(plugin_id = %plugin.id, error = %e, "Failed to apply plugin state");
                }
            }
        } else {
            for (index, plugin) in deferred.iter().enumerate() {
                if request.is_cancelled() {
                    cancelled = true;
                    break;
                }
                progress.set_status(&format!("Loading {}", plugin.name));
                progress.set_progress(index + 1);

                let ready = self.host.is_enabled(&plugin.id) && self.host.is_loaded(&plugin.id);
                if !ready && let Err(e) = self.host.enable_plugin(&plugin.id).await {
                    warn!(plugin_id = %plugin.id, error = %e, "Failed to load plugin");
                }
            }

            if !cancelled {
                progress.set_status("Waiting for plugins to finish registering…");
                let ids: Vec<String> = deferred.iter().map(|m| m.id.clone()).collect();
                let (timeout, settle) =
                    self.config.read(|c| (c.load_timeout(), c.post_load_settle()));
                all_loaded = Some(self.loader.wait_for_all_loaded(&ids, timeout).await);
                progress.set_progress(deferred.len() + 1);
                tokio::time::sleep(settle).await;
                cancelled = request.is_cancelled();
            }

            if !cancelled {
                progress.set_status("Rebuilding command cache…");
                let subset: Option<Vec<String>> = request
                    .plugin_ids
                    .as_ref()
                    .map(|ids| ids.iter().cloned().collect());
                self.commands
                    .rebuild_and_apply_command_cache(true, subset.as_deref())
                    .await;
                progress.set_progress(deferred.len() + 2);
            }
        }

        drop(observer);
        let enabled_set = self.cleanup().await;

        let restart_requested = request.show_progress && !cancelled;
        if restart_requested && let Err(e) = self.host.request_restart().await {
            warn!(error = %e, "Failed to restart after applying startup policy");
        }
        progress.close();

        info!(run_id = id, cancelled, restart_requested, "Startup policy applied");
        ApplyOutcome {
            run_id: id,
            show_progress: request.show_progress,
            targets: targets.into_iter().map(|m| m.id).collect(),
            deferred: deferred.into_iter().map(|m| m.id).collect(),
            cancelled,
            all_loaded,
            enabled_set,
            restart_requested,
        }
    }

    /// Persist learned view kinds and the enabled set. Returns the enabled set.
    async fn cleanup(&self) -> Vec<String> {
        self.learned.retain(|plugin_id| self.config.is_view_eligible(plugin_id));
        let lazy_on_views = self.learned.snapshot();
        self.snapshot
            .commit(move |s| s.lazy_on_views = lazy_on_views)
            .await;

        let core_plugin_id = self.config.read(|c| c.core_plugin_id.clone());
        let mut enabled_set: Vec<String> = self
            .host
            .manifests()
            .into_iter()
            .filter(|m| self.config.mode(&m.id) == PluginMode::KeepEnabled)
            .map(|m| m.id)
            .chain(std::iter::once(core_plugin_id))
            .collect();
        enabled_set.sort();
        enabled_set.dedup();

        if let Err(e) = self.host.persist_enabled_set(&enabled_set).await {
            warn!(error = %e, "Failed to persist enabled plugin set");
        }
        enabled_set
    }
}

/// Single-flight, merging front for startup policy runs.
pub struct StartupPolicyCoordinator {
    inner: Arc<PolicyInner>,
}

impl StartupPolicyCoordinator {
    /// `host` should be the intercepted host so enables made by a run keep
    /// wrapper commands in sync.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Arc<dyn PluginHost>,
        loader: Arc<PluginLoader>,
        commands: Arc<CommandCache>,
        views: Arc<dyn ViewRegistry>,
        progress: Arc<dyn ProgressSink>,
        learned: ViewKindMap,
        snapshot: Arc<SnapshotBoundary>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            inner: Arc::new(PolicyInner {
                host,
                loader,
                commands,
                views,
                progress,
                learned,
                snapshot,
                config,
                state: Mutex::new(RunState::default()),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Apply the startup policy, merging with any run already in flight.
    ///
    /// Resolves with the outcome of the run this request ended up in.
    pub async fn apply(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        let request = MergedRequest::from_request(request);

        let handle = {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;
            if let Some(run) = state.active.as_mut().filter(|run| !run.started) {
                run.request.merge(request);
                debug!(run_id = run.id, "Merged into debouncing run");
                run.handle.clone()
            } else if let Some(run) = state.pending.as_mut() {
                run.request.merge(request);
                debug!(run_id = run.id, "Merged into pending follow-up");
                run.handle.clone()
            } else if let Some(previous) = state.active.as_ref().map(|run| run.handle.clone()) {
                let follow_up = self.spawn_run(request, Some(previous));
                debug!(run_id = follow_up.id, "Queued follow-up run");
                let handle = follow_up.handle.clone();
                state.pending = Some(follow_up);
                handle
            } else {
                let run = self.spawn_run(request, None);
                let handle = run.handle.clone();
                state.active = Some(run);
                handle
            }
        };

        handle
            .await
            .ok_or_else(|| OnDemandError::host("startup policy run aborted"))
    }

    /// Whether a run is active or queued.
    pub fn is_running(&self) -> bool {
        let state = self.inner.lock_state();
        state.active.is_some() || state.pending.is_some()
    }

    /// Number of runs created so far.
    pub fn runs_started(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    fn spawn_run(&self, request: MergedRequest, previous: Option<RunHandle>) -> Run {
        let id = self.inner.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();

        let body = async move {
            let _completion = RunCompletion {
                inner: inner.clone(),
                id,
            };
            if let Some(previous) = previous {
                previous.await;
            }
            let debounce = inner.config.read(|c| c.apply_debounce());
            tokio::time::sleep(debounce).await;

            let request = inner.begin(id);
            inner.execute(id, request).await
        };

        let handle = tokio::spawn(body)
            .map(move |joined| match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(run_id = id, error = %e, "Startup policy run aborted");
                    None
                }
            })
            .boxed()
            .shared();

        Run {
            id,
            request,
            started: false,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> Option<BTreeSet<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_merge_unions_subsets() {
        let mut merged =
            MergedRequest::from_request(ApplyRequest::new(false).with_plugins(["a", "b"]));
        merged.merge(MergedRequest::from_request(
            ApplyRequest::new(true).with_plugins(["c"]),
        ));

        assert!(merged.show_progress);
        assert_eq!(merged.plugin_ids, ids(&["a", "b", "c"]));
        assert_eq!(merged.cancels.len(), 2);
    }

    #[test]
    fn test_merge_all_absorbs_subset() {
        let mut merged = MergedRequest::from_request(ApplyRequest::new(false).with_plugins(["a"]));
        merged.merge(MergedRequest::from_request(ApplyRequest::new(false)));
        assert_eq!(merged.plugin_ids, None);

        let mut merged = MergedRequest::from_request(ApplyRequest::new(false));
        merged.merge(MergedRequest::from_request(
            ApplyRequest::new(false).with_plugins(["a"]),
        ));
        assert_eq!(merged.plugin_ids, None);
    }

    #[test]
    fn test_empty_subset_means_all() {
        let merged = MergedRequest::from_request(
            ApplyRequest::new(false).with_plugins(Vec::<String>::new()),
        );
        assert_eq!(merged.plugin_ids, None);
    }

    #[test]
    fn test_any_cancel_cancels_merged_run() {
        let token = CancellationToken::new();
        let mut merged = MergedRequest::from_request(ApplyRequest::new(true));
        merged.merge(MergedRequest::from_request(
            ApplyRequest::new(true).with_cancel(token.clone()),
        ));

        assert!(!merged.is_cancelled());
        token.cancel();
        assert!(merged.is_cancelled());
    }

    #[test]
    fn test_targets_filter() {
        let manifests = vec![
            PluginManifest::new("a", "A", "1.0.0"),
            PluginManifest::new("b", "B", "1.0.0"),
        ];
        let merged = MergedRequest::from_request(ApplyRequest::new(false).with_plugins(["b", "zz"]));

        let targets: Vec<String> = merged.targets(manifests).into_iter().map(|m| m.id).collect();
        assert_eq!(targets, vec!["b".to_string()]);
    }
}
