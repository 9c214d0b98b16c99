//! On-demand plugin loading error types.

use thiserror::Error;

/// Errors surfaced by the on-demand loading core.
///
/// Most of the core never returns these to the host: event handlers log and
/// swallow them. They reach callers only through wrapper command invocation,
/// configuration loading and the storage layer.
#[derive(Error, Debug)]
pub enum OnDemandError {
    /// The plugin could not be loaded.
    #[error("Failed to load plugin '{plugin}': {message}")]
    LoadFailed { plugin: String, message: String },

    /// A wait on a plugin load exceeded its deadline.
    #[error("Timed out waiting for plugin '{0}'")]
    Timeout(String),

    /// No cached descriptor exists for the command.
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// The plugin loaded but never registered the real command.
    #[error("Command '{command}' was not registered by plugin '{plugin}'")]
    CommandUnavailable { command: String, plugin: String },

    /// Rebuilding a pane's view failed.
    #[error("Failed to reconstruct view for pane '{pane}': {message}")]
    Reconstruct { pane: String, message: String },

    /// A host operation failed.
    #[error("Host error: {0}")]
    Host(String),

    /// Persisted snapshot could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OnDemandError {
    /// Create a load failure.
    pub fn load_failed(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadFailed {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a command-unavailable error.
    pub fn command_unavailable(command: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self::CommandUnavailable {
            command: command.into(),
            plugin: plugin.into(),
        }
    }

    /// Create a reconstruction error.
    pub fn reconstruct(pane: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reconstruct {
            pane: pane.into(),
            message: message.into(),
        }
    }

    /// Create a host error.
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }
}

impl From<toml::de::Error> for OnDemandError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for OnDemandError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for on-demand operations.
pub type Result<T> = std::result::Result<T, OnDemandError>;
