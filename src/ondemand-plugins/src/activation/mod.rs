//! Trigger-driven activators.
//!
//! Both activators are event handlers: they never return errors, they log and
//! report what happened through [`ActivationOutcome`].

pub mod file;
pub mod view;

pub use file::FileLazyActivator;
pub use view::ViewLazyActivator;

use tracing::warn;

use crate::host::PaneRef;

/// Result of one activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Layout still restoring or pane hidden.
    NotReady,

    /// The same target is already being checked.
    Busy,

    /// Handled moments ago; dropped by the re-entry window.
    RecentlyHandled,

    /// No plugin owns the trigger.
    Unresolved,

    /// The owning plugin's mode does not allow this trigger.
    Ineligible { plugin_id: String },

    /// The user disabled the plugin moments ago.
    ManuallyDisabled { plugin_id: String },

    /// Nothing to do, the plugin was already loaded.
    AlreadyLoaded { plugin_id: String },

    /// The load failed or did not finish within the load timeout.
    LoadFailed { plugin_id: String },

    /// The plugin was loaded by this attempt.
    Activated { plugin_id: String },
}

impl ActivationOutcome {
    /// Plugin loaded by this attempt, if any.
    pub fn activated_plugin(&self) -> Option<&str> {
        match self {
            Self::Activated { plugin_id } => Some(plugin_id),
            _ => None,
        }
    }
}

/// Rebuild the pane's view, logging instead of failing.
async fn reconstruct(pane: &PaneRef, plugin_id: &str) -> bool {
    match pane.reconstruct_view().await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                pane = %pane.id(),
                plugin_id = %plugin_id,
                error = %e,
                "Failed to reconstruct view after loading plugin"
            );
            false
        }
    }
}
