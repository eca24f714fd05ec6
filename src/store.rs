//! Durable per-target status records and the store they live in.
//!
//! The store is the only state that survives a host restart. It is owned by
//! the embedding application; Foundry reads and writes it through
//! [`StatusStore`] and never assumes anything beyond get/put/remove/list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FoundryError;

/// Lifecycle state of a target's generated service, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostingStatus {
    #[default]
    Inactive,
    Generating,
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
}

impl HostingStatus {
    /// States in which the record claims a process exists.
    pub fn claims_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Generating => "generating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for HostingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record for one hosted target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedTargetRecord {
    pub status: HostingStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub server_directory: Option<PathBuf>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hosted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl HostedTargetRecord {
    /// Drop all process-bound fields and mark the record stopped.
    pub fn mark_stopped(&mut self) {
        self.status = HostingStatus::Stopped;
        self.port = None;
        self.url = None;
        self.pid = None;
    }

    /// Mark the record failed with a message. Process-bound fields are cleared.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = HostingStatus::Error;
        self.port = None;
        self.url = None;
        self.pid = None;
        self.error_message = Some(message.into());
    }
}

/// Key-value store for [`HostedTargetRecord`]s, keyed by target id.
pub trait StatusStore: Send + Sync {
    fn load(&self, id: &str) -> crate::Result<Option<HostedTargetRecord>>;
    fn save(&self, id: &str, record: &HostedTargetRecord) -> crate::Result<()>;
    fn remove(&self, id: &str) -> crate::Result<()>;
    /// All records, sorted by id.
    fn list(&self) -> crate::Result<Vec<(String, HostedTargetRecord)>>;
}

/// Read-modify-write helper. Creates a default record when none exists.
pub fn update_record<F>(
    store: &dyn StatusStore,
    id: &str,
    mutate: F,
) -> crate::Result<HostedTargetRecord>
where
    F: FnOnce(&mut HostedTargetRecord),
{
    let mut record = store.load(id)?.unwrap_or_default();
    mutate(&mut record);
    store.save(id, &record)?;
    Ok(record)
}

/// In-memory store, for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, HostedTargetRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> FoundryError {
    FoundryError::Store("status store lock poisoned".to_string())
}

impl StatusStore for MemoryStatusStore {
    fn load(&self, id: &str) -> crate::Result<Option<HostedTargetRecord>> {
        Ok(self.records.read().map_err(poisoned)?.get(id).cloned())
    }

    fn save(&self, id: &str, record: &HostedTargetRecord) -> crate::Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> crate::Result<()> {
        self.records.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    fn list(&self) -> crate::Result<Vec<(String, HostedTargetRecord)>> {
        let mut all: Vec<(String, HostedTargetRecord)> = self
            .records
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

/// One pretty-printed JSON file per target under a directory.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write never leaves a truncated record behind.
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> crate::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl StatusStore for FileStatusStore {
    fn load(&self, id: &str) -> crate::Result<Option<HostedTargetRecord>> {
        let path = self.path_for(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&content).map_err(|e| {
            FoundryError::Store(format!("corrupt record {}: {}", path.display(), e))
        })?;
        Ok(Some(record))
    }

    fn save(&self, id: &str, record: &HostedTargetRecord) -> crate::Result<()> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| FoundryError::Store(e.to_string()))?;
        let tmp = self.dir.join(format!(".{id}.json.tmp"));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.path_for(id))?;
        Ok(())
    }

    fn remove(&self, id: &str) -> crate::Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> crate::Result<Vec<(String, HostedTargetRecord)>> {
        let mut all = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|n| !n.starts_with('.'))
            else {
                continue;
            };
            if let Some(record) = self.load(id)? {
                all.push((id.to_string(), record));
            }
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_camel_case() {
        let record = HostedTargetRecord {
            status: HostingStatus::Running,
            port: Some(4100),
            server_directory: Some(PathBuf::from("/srv/petstore")),
            error_message: None,
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["port"], 4100);
        assert_eq!(json["serverDirectory"], "/srv/petstore");
        assert!(json.get("errorMessage").is_some());
    }

    #[test]
    fn test_mark_stopped_clears_process_fields() {
        let mut record = HostedTargetRecord {
            status: HostingStatus::Running,
            port: Some(4100),
            url: Some("http://localhost:4100".to_string()),
            pid: Some(42),
            ..Default::default()
        };
        record.mark_stopped();
        assert_eq!(record.status, HostingStatus::Stopped);
        assert!(record.port.is_none() && record.url.is_none() && record.pid.is_none());
    }

    #[test]
    fn test_update_record_creates_default() {
        let store = MemoryStatusStore::new();
        let record = update_record(&store, "petstore", |r| {
            r.status = HostingStatus::Generating;
        })
        .unwrap();
        assert_eq!(record.status, HostingStatus::Generating);
        assert_eq!(
            store.load("petstore").unwrap().unwrap().status,
            HostingStatus::Generating
        );
    }

    #[test]
    fn test_memory_store_list_sorted() {
        let store = MemoryStatusStore::new();
        store.save("zeta", &HostedTargetRecord::default()).unwrap();
        store.save("alpha", &HostedTargetRecord::default()).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
        store.remove("alpha").unwrap();
        assert!(store.load("alpha").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let record = HostedTargetRecord {
            status: HostingStatus::Error,
            error_message: Some("process exited with code 1".to_string()),
            ..Default::default()
        };
        FileStatusStore::open(dir.path())
            .unwrap()
            .save("petstore", &record)
            .unwrap();

        let reopened = FileStatusStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load("petstore").unwrap(), Some(record));
        assert_eq!(reopened.list().unwrap().len(), 1);
        assert!(!dir.path().join(".petstore.json.tmp").exists());
    }

    #[test]
    fn test_file_store_missing_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
        store.remove("nope").unwrap();
        store.save("a", &HostedTargetRecord::default()).unwrap();
        store.remove("a").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_corrupt_record_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileStatusStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("bad"), Err(FoundryError::Store(_))));
    }
}
