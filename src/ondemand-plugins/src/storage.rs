//! Persisted snapshot of learned state.
//!
//! The snapshot is read once at startup and written whole at commit points.
//! Storage failures never reach the activators: [`SnapshotBoundary`] logs and
//! keeps serving the in-memory copy for the rest of the session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::commands::CachedCommand;
use crate::{OnDemandError, Result};

/// Everything persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Wrapper command descriptors by plugin id.
    #[serde(default)]
    pub command_cache: BTreeMap<String, Vec<CachedCommand>>,

    /// Plugin version each cached list was built against.
    #[serde(default)]
    pub command_cache_versions: BTreeMap<String, String>,

    #[serde(default)]
    pub command_cache_updated_at: Option<DateTime<Utc>>,

    /// Learned plugin → view kinds mapping.
    #[serde(default)]
    pub lazy_on_views: BTreeMap<String, Vec<String>>,
}

/// Durable key-value storage for the snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Storage key for one install.
pub fn storage_key(prefix: &str, install_id: &str) -> String {
    format!("on-demand:{}:{}", prefix, install_id)
}

/// Snapshot stored as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store for `install_id` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, install_id: &str) -> Self {
        let file_name = format!("{}.json", storage_key("snapshot", install_id).replace(':', "-"));
        Self {
            path: dir.as_ref().join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).await?;
        let snapshot = serde_json::from_str(&content)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| OnDemandError::Storage(format!("no parent for {}", self.path.display())))?;
        fs::create_dir_all(parent).await?;

        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "Snapshot saved");
        Ok(())
    }
}

/// In-memory store, mostly for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Option<Snapshot>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn stored(&self) -> Option<Snapshot> {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Failure boundary around a [`SnapshotStore`].
pub struct SnapshotBoundary {
    store: Arc<dyn SnapshotStore>,
    current: Mutex<Snapshot>,
}

impl SnapshotBoundary {
    /// Read the persisted snapshot once. A missing or unreadable snapshot
    /// starts the session empty.
    pub async fn open(store: Arc<dyn SnapshotStore>) -> Self {
        let current = match store.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => Snapshot::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted snapshot, starting empty");
                Snapshot::default()
            }
        };
        Self {
            store,
            current: Mutex::new(current),
        }
    }

    /// Current in-memory snapshot.
    pub async fn read(&self) -> Snapshot {
        self.current.lock().await.clone()
    }

    /// Apply `update` and write the whole snapshot.
    ///
    /// Returns whether the write succeeded; the in-memory copy is updated
    /// either way.
    pub async fn commit(&self, update: impl FnOnce(&mut Snapshot) + Send) -> bool {
        let mut current = self.current.lock().await;
        update(&mut current);
        match self.store.save(&current).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist snapshot, keeping in-memory state");
                false
            }
        }
    }
}
