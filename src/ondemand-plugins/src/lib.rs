//! # On-demand plugin activation
//!
//! Keeps optional plugins of a long-running host unloaded until they are
//! needed, then activates them without racing the host's own event flow.
//!
//! ## Features
//!
//! - **File triggers**: opening a file owned by a deferred plugin loads it and rebuilds the pane
//! - **View triggers**: activating a pane whose view kind belongs to a deferred plugin loads it
//! - **Wrapper commands**: cached commands stay in the palette and load their plugin on first use
//! - **Startup policy**: single-flight, merging application of the keep/lazy/disabled policy
//! - **Per-pane locking**: activations on the same pane and view kind never interleave
//!
//! ## Plugin modes
//!
//! ```toml
//! [plugins.excalidraw]
//! mode = "lazyOnView"
//!
//! [plugins.kanban]
//! mode = "lazy"
//! lazy_options = { use_file = true }
//!
//! [file_rules.frontmatter_keys]
//! "kanban-plugin" = "kanban"
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use ondemand_plugins::{ApplyRequest, HostBindings, OnDemandConfig, OnDemandManager};
//!
//! async fn start(bindings: HostBindings) -> ondemand_plugins::Result<()> {
//!     let config = OnDemandConfig::load(std::path::Path::new("on-demand.toml"))?;
//!     let manager = OnDemandManager::new(config, bindings).await?;
//!
//!     manager.on_layout_ready().await;
//!     manager.apply_startup_policy(ApplyRequest::new(false)).await?;
//!     Ok(())
//! }
//! ```

pub mod activation;
pub mod commands;
pub mod config;
pub mod debounce;
pub mod error;
pub mod host;
pub mod intercept;
pub mod loader;
pub mod lock;
pub mod manager;
pub mod manual_disable;
pub mod policy;
pub mod rules;
pub mod storage;
pub mod weak_map;

pub use activation::{ActivationOutcome, FileLazyActivator, ViewLazyActivator};
pub use commands::{CachedCommand, CommandCache, CommandExecutor, CommandOutput, SyncReport};
pub use config::{
    ConfigHandle, FileRules, LazyOptions, OnDemandConfig, PluginMode, PluginPolicy,
    ViewCollectionPolicy,
};
pub use error::{OnDemandError, Result};
pub use host::{
    CommandHost, FileRef, HostCommand, NoopProgress, Pane, PaneRef, PluginHost, PluginManifest,
    ProgressSink, ViewRegistrationObserver, ViewRegistry, Workspace,
};
pub use intercept::InterceptedHost;
pub use loader::PluginLoader;
pub use lock::{LockRelease, LockStrategy, ResourceLockTable};
pub use manager::{HostBindings, OnDemandManager};
pub use policy::{ApplyOutcome, ApplyRequest, StartupPolicyCoordinator};
pub use rules::{ActivationRules, StaticActivationRules, ViewKindMap};
pub use storage::{JsonFileStore, MemoryStore, Snapshot, SnapshotStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
