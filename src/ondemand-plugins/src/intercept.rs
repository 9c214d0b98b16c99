//! Enable/disable interception.
//!
//! [`InterceptedHost`] wraps the host's plugin lifecycle so that enabling a
//! plugin by any route keeps its wrapper commands in sync, and disabling a
//! deferred plugin immediately puts its wrappers back.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::commands::CommandCache;
use crate::config::ConfigHandle;
use crate::host::{PluginHost, PluginManifest};
use crate::manual_disable::ManualDisableTracker;

/// Decorator over a [`PluginHost`].
pub struct InterceptedHost {
    inner: Arc<dyn PluginHost>,
    commands: Arc<CommandCache>,
    manual_disable: Arc<ManualDisableTracker>,
    config: ConfigHandle,
}

impl InterceptedHost {
    pub fn new(
        inner: Arc<dyn PluginHost>,
        commands: Arc<CommandCache>,
        manual_disable: Arc<ManualDisableTracker>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            inner,
            commands,
            manual_disable,
            config,
        }
    }

    pub fn inner(&self) -> &Arc<dyn PluginHost> {
        &self.inner
    }

    async fn restore_wrappers(&self, plugin_id: &str) {
        if let Err(e) = self.commands.ensure_commands_cached(plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to cache commands after disable");
        }
        let registered = self.commands.register_cached_commands_for_plugin(plugin_id);
        debug!(plugin_id = %plugin_id, registered, "Wrapper commands restored after disable");
    }
}

#[async_trait]
impl PluginHost for InterceptedHost {
    fn manifests(&self) -> Vec<PluginManifest> {
        self.inner.manifests()
    }

    fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.inner.manifest(plugin_id)
    }

    fn is_loaded(&self, plugin_id: &str) -> bool {
        self.inner.is_loaded(plugin_id)
    }

    fn is_enabled(&self, plugin_id: &str) -> bool {
        self.inner.is_enabled(plugin_id)
    }

    async fn request_load(&self, plugin_id: &str) -> bool {
        self.inner.request_load(plugin_id).await
    }

    async fn enable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.inner.enable_plugin(plugin_id).await?;
        self.manual_disable.clear(plugin_id);
        self.commands.sync_command_wrappers_for_plugin(plugin_id);
        Ok(())
    }

    async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        self.inner.disable_plugin(plugin_id).await?;
        self.manual_disable.mark(plugin_id);

        let (re_register, deferred) = self.config.read(|c| {
            (
                c.re_register_commands_on_disable,
                c.mode(plugin_id).is_deferred(),
            )
        });
        if re_register && deferred {
            self.restore_wrappers(plugin_id).await;
        }
        Ok(())
    }

    async fn apply_declared_enable_state(&self, plugin_id: &str) -> Result<()> {
        self.inner.apply_declared_enable_state(plugin_id).await
    }

    async fn persist_enabled_set(&self, plugin_ids: &[String]) -> Result<()> {
        self.inner.persist_enabled_set(plugin_ids).await
    }

    async fn request_restart(&self) -> Result<()> {
        self.inner.request_restart().await
    }
}
