//! Active-Run Registry: the durable index of runs believed to be in flight.
//!
//! The in-memory map is mirrored to a [`RegistryStore`] on every mutation so
//! a closed tab or crashed process can find its runs again on the next load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::types::{ActiveRunInfo, ConversationMessage, RunId};

/// Durable storage for the registry document.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Result<HashMap<RunId, ActiveRunInfo>, TetherError>;
    fn save(&self, runs: &HashMap<RunId, ActiveRunInfo>) -> Result<(), TetherError>;
}

/// Single namespaced JSON document on disk mapping run id to resume info.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    runs: HashMap<RunId, ActiveRunInfo>,
    saved_at: DateTime<Utc>,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location under the user's home directory.
    pub fn new_default() -> Self {
        Self {
            path: default_tether_dir().join("active_runs.json"),
        }
    }

    fn ensure_parent(path: &Path) -> Result<(), TetherError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl RegistryStore for FileRegistryStore {
    fn load(&self) -> Result<HashMap<RunId, ActiveRunInfo>, TetherError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new())
            }
            Err(err) => return Err(err.into()),
        };
        let file: RegistryFile = serde_json::from_str(&raw)?;
        Ok(file.runs)
    }

    fn save(&self, runs: &HashMap<RunId, ActiveRunInfo>) -> Result<(), TetherError> {
        Self::ensure_parent(&self.path)?;
        let file = RegistryFile {
            version: 1,
            runs: runs.clone(),
            saved_at: Utc::now(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// In-memory store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    runs: Mutex<HashMap<RunId, ActiveRunInfo>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load(&self) -> Result<HashMap<RunId, ActiveRunInfo>, TetherError> {
        Ok(self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, runs: &HashMap<RunId, ActiveRunInfo>) -> Result<(), TetherError> {
        *self.runs.lock().unwrap_or_else(|e| e.into_inner()) = runs.clone();
        Ok(())
    }
}

/// Process-wide index of `{run_id -> ActiveRunInfo}`, mirrored to durable
/// storage on every mutation.
pub struct ActiveRunRegistry {
    runs: Mutex<HashMap<RunId, ActiveRunInfo>>,
    store: Arc<dyn RegistryStore>,
}

impl ActiveRunRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Read the durable document once at startup.
    pub fn load(&self) -> Result<(), TetherError> {
        let loaded = self.store.load()?;
        *self.runs.lock().unwrap_or_else(|e| e.into_inner()) = loaded;
        Ok(())
    }

    pub fn register(&self, info: ActiveRunInfo) {
        let snapshot = {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.insert(info.run_id, info);
            runs.clone()
        };
        self.persist(&snapshot);
    }

    pub fn remove(&self, run_id: RunId) -> Option<ActiveRunInfo> {
        let (removed, snapshot) = {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            let removed = runs.remove(&run_id);
            (removed, runs.clone())
        };
        if removed.is_some() {
            self.persist(&snapshot);
        }
        removed
    }

    pub fn get(&self, run_id: RunId) -> Option<ActiveRunInfo> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<ActiveRunInfo> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Find the registered run for a conversation, verifying that a message
    /// with the matching placeholder (or run metadata) still exists. A record
    /// whose message is gone is stale and removed as a side effect; storage
    /// can outlive a manual history deletion.
    pub fn get_for_conversation(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
    ) -> Option<ActiveRunInfo> {
        let candidate = {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.values()
                .find(|info| info.conversation_id == conversation_id)
                .cloned()
        }?;
        let alive = messages.iter().any(|message| {
            message.id == candidate.placeholder_id || message.run() == Some(candidate.run_id)
        });
        if alive {
            Some(candidate)
        } else {
            tracing::debug!(
                run_id = %candidate.run_id,
                conversation_id,
                "dropping stale registry record with no surviving message"
            );
            self.remove(candidate.run_id);
            None
        }
    }

    fn persist(&self, snapshot: &HashMap<RunId, ActiveRunInfo>) {
        if let Err(err) = self.store.save(snapshot) {
            tracing::warn!(%err, "failed to persist active-run registry");
        }
    }
}

fn default_tether_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{placeholder_id, RunStatus};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn info(conversation_id: &str) -> ActiveRunInfo {
        let run_id = Uuid::new_v4();
        ActiveRunInfo {
            run_id,
            conversation_id: conversation_id.to_string(),
            workspace_id: "ws-1".to_string(),
            persona: "analyst".to_string(),
            turn_id: Uuid::new_v4(),
            placeholder_id: placeholder_id(run_id),
            status: RunStatus::Running,
        }
    }

    #[test]
    fn file_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistryStore::new(dir.path().join("active_runs.json"));
        let run = info("conv-1");
        let mut runs = HashMap::new();
        runs.insert(run.run_id, run.clone());

        store.save(&runs).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.get(&run.run_id), Some(&run));
    }

    #[test]
    fn file_store_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistryStore::new(dir.path().join("missing.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn register_mirrors_to_store() {
        let store = Arc::new(MemoryRegistryStore::new());
        let registry = ActiveRunRegistry::new(store.clone());
        let run = info("conv-1");
        registry.register(run.clone());

        let mirrored = store.load().unwrap();
        assert_eq!(mirrored.get(&run.run_id), Some(&run));

        registry.remove(run.run_id);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn stale_record_is_removed_when_message_is_gone() {
        let registry = ActiveRunRegistry::new(Arc::new(MemoryRegistryStore::new()));
        let run = info("conv-1");
        registry.register(run.clone());

        // No messages at all: the record is stale.
        assert!(registry.get_for_conversation("conv-1", &[]).is_none());
        assert!(registry.get(run.run_id).is_none());
    }

    #[test]
    fn record_survives_when_placeholder_exists() {
        let registry = ActiveRunRegistry::new(Arc::new(MemoryRegistryStore::new()));
        let run = info("conv-1");
        registry.register(run.clone());

        let message =
            ConversationMessage::agent_placeholder("conv-1", run.run_id, run.turn_id);
        let found = registry
            .get_for_conversation("conv-1", std::slice::from_ref(&message))
            .unwrap();
        assert_eq!(found.run_id, run.run_id);
    }

    #[test]
    fn record_survives_by_run_metadata_after_id_reconciliation() {
        let registry = ActiveRunRegistry::new(Arc::new(MemoryRegistryStore::new()));
        let run = info("conv-1");
        registry.register(run.clone());

        let mut message =
            ConversationMessage::agent_placeholder("conv-1", run.run_id, run.turn_id);
        message.id = "m-42".to_string(); // durable id after persistence
        assert!(registry
            .get_for_conversation("conv-1", std::slice::from_ref(&message))
            .is_some());
    }
}
