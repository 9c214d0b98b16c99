//! Plugin load requests.
//!
//! `ensure_plugin_loaded` collapses concurrent requests for the same plugin
//! into one host load, so the file activator, the view activator, wrapper
//! commands and the policy coordinator can all ask at once.
//!
//! Every `ensure_plugin_loaded` call also counts as demand for the plugin.
//! A transient load (command capture) goes through `load_unclaimed` and must
//! only unload the plugin again if no demand was recorded meanwhile.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::host::PluginHost;
use crate::{OnDemandError, Result};

type InFlightLoad = Shared<BoxFuture<'static, bool>>;

/// Single-flight front for [`PluginHost::request_load`].
pub struct PluginLoader {
    host: Arc<dyn PluginHost>,
    poll_interval: Duration,
    in_flight: Mutex<HashMap<String, (u64, InFlightLoad)>>,
    next_ticket: Mutex<u64>,

    /// Demand counter per plugin, bumped by every claiming load.
    demand: Mutex<HashMap<String, u64>>,
}

impl PluginLoader {
    pub fn new(host: Arc<dyn PluginHost>, poll_interval: Duration) -> Self {
        Self {
            host,
            poll_interval,
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: Mutex::new(0),
            demand: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn PluginHost> {
        &self.host
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.host.is_loaded(plugin_id)
    }

    /// Load `plugin_id` unless it already is. Returns whether it is loaded.
    pub async fn ensure_plugin_loaded(&self, plugin_id: &str) -> bool {
        self.claim(plugin_id);
        self.load(plugin_id).await
    }

    /// Load without recording demand. Joins an in-flight load like any
    /// other caller.
    pub async fn load_unclaimed(&self, plugin_id: &str) -> bool {
        self.load(plugin_id).await
    }

    /// Demand recorded for `plugin_id` so far. Compare two readings to tell
    /// whether anyone else needed the plugin in between.
    pub fn demand(&self, plugin_id: &str) -> u64 {
        let demand = self.demand.lock().unwrap_or_else(|e| e.into_inner());
        demand.get(plugin_id).copied().unwrap_or(0)
    }

    fn claim(&self, plugin_id: &str) {
        let mut demand = self.demand.lock().unwrap_or_else(|e| e.into_inner());
        *demand.entry(plugin_id.to_string()).or_insert(0) += 1;
    }

    async fn load(&self, plugin_id: &str) -> bool {
        if self.host.is_loaded(plugin_id) {
            return true;
        }

        let (ticket, load) = self.join_or_start(plugin_id);
        let loaded = load.await;

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.get(plugin_id).is_some_and(|(t, _)| *t == ticket) {
                in_flight.remove(plugin_id);
            }
        }

        if loaded {
            tracing::debug!(plugin_id = %plugin_id, "Plugin loaded on demand");
        } else {
            tracing::warn!(plugin_id = %plugin_id, "Plugin failed to load on demand");
        }
        loaded
    }

    /// Like [`Self::ensure_plugin_loaded`], bounded by `timeout` and
    /// reporting why the plugin is not available.
    pub async fn load_within(&self, plugin_id: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.ensure_plugin_loaded(plugin_id)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(OnDemandError::load_failed(plugin_id, "host reported failure")),
            Err(_) => Err(OnDemandError::Timeout(plugin_id.to_string())),
        }
    }

    fn join_or_start(&self, plugin_id: &str) -> (u64, InFlightLoad) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((ticket, load)) = in_flight.get(plugin_id) {
            return (*ticket, load.clone());
        }

        let ticket = {
            let mut next = self.next_ticket.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        let host = self.host.clone();
        let id = plugin_id.to_string();
        let load = async move { host.request_load(&id).await }.boxed().shared();
        in_flight.insert(plugin_id.to_string(), (ticket, load.clone()));
        (ticket, load)
    }

    /// Poll until `plugin_id` is loaded or `timeout` elapses.
    pub async fn wait_for_plugin_loaded(&self, plugin_id: &str, timeout: Duration) -> bool {
        self.wait_for_all_loaded(&[plugin_id.to_string()], timeout)
            .await
    }

    /// Poll until every plugin in `plugin_ids` is loaded or `timeout` elapses.
    ///
    /// Returns false on timeout instead of failing; callers decide whether
    /// that is fatal.
    pub async fn wait_for_all_loaded(&self, plugin_ids: &[String], timeout: Duration) -> bool {
        if plugin_ids.is_empty() {
            return true;
        }

        let started_at = Instant::now();
        loop {
            if plugin_ids.iter().all(|id| self.host.is_loaded(id)) {
                return true;
            }
            if started_at.elapsed() >= timeout {
                let missing: Vec<&str> = plugin_ids
                    .iter()
                    .filter(|id| !self.host.is_loaded(id))
                    .map(String::as_str)
                    .collect();
                tracing::warn!(?missing, "Timed out waiting for plugins to load");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
