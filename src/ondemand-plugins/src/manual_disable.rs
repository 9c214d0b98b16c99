//! Tracks plugins the user disabled by hand.
//!
//! An activator that races a manual disable would otherwise load the plugin
//! straight back.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;

use crate::config::ConfigHandle;

pub struct ManualDisableTracker {
    config: ConfigHandle,
    recent: Mutex<HashMap<String, Instant>>,
}

impl ManualDisableTracker {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, plugin_id: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.insert(plugin_id.to_string(), Instant::now());
    }

    /// Whether `plugin_id` was disabled within the window. Expired marks are dropped.
    pub fn was_disabled_recently(&self, plugin_id: &str) -> bool {
        let window = self.config.read(|c| c.manual_disable_window());
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        match recent.get(plugin_id) {
            Some(at) if at.elapsed() <= window => true,
            Some(_) => {
                recent.remove(plugin_id);
                false
            }
            None => false,
        }
    }

    /// Forget a mark, e.g. after the user re-enables the plugin.
    pub fn clear(&self, plugin_id: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.remove(plugin_id);
    }
}
