// ABOUTME: Change-cursor persistence, one ModificationTimestamp watermark per resource kind
// ABOUTME: Cursors only move forward and are durable before the driver fetches the next page

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ReplicationError, Result};
use crate::resource::ResourceKind;

pub const CURSOR_FILE_NAME: &str = "cursors.json";
const STATE_VERSION: u32 = 1;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored cursor for `resource`, or `None` when it was never set.
    async fn load(&self, resource: ResourceKind) -> Result<Option<String>>;

    /// Advance the cursor. Must be durable when this returns.
    ///
    /// A timestamp older than the stored one is ignored.
    async fn save(&self, resource: ResourceKind, timestamp: &str) -> Result<()>;

    /// Forget every cursor. Reset/test use only.
    async fn clear(&self) -> Result<()>;
}

/// Order two ModificationTimestamp values.
///
/// RFC 3339 values are compared as instants so differing precision or offsets
/// order correctly; anything else falls back to string order.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Cursor for a single resource kind as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationCursor {
    pub resource: ResourceKind,
    /// ModificationTimestamp of the last persisted record
    pub last_modification_timestamp: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationCursor {
    pub fn new(resource: ResourceKind) -> Self {
        Self {
            resource,
            last_modification_timestamp: None,
            updated_at: Utc::now(),
        }
    }

    /// Move forward to `timestamp`. Returns false if that would move backwards.
    pub fn advance(&mut self, timestamp: &str) -> bool {
        if let Some(current) = &self.last_modification_timestamp {
            if compare_timestamps(timestamp, current) == Ordering::Less {
                return false;
            }
        }
        self.last_modification_timestamp = Some(timestamp.to_string());
        self.updated_at = Utc::now();
        true
    }
}

/// Contents of `cursors.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorState {
    pub version: u32,
    /// Originating system the cursors belong to
    pub system: String,
    pub cursors: BTreeMap<String, ReplicationCursor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CursorState {
    pub fn new(system: &str) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            system: system.to_string(),
            cursors: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, resource: ResourceKind) -> Option<&ReplicationCursor> {
        self.cursors.get(resource.as_str())
    }

    pub fn get_or_create(&mut self, resource: ResourceKind) -> &mut ReplicationCursor {
        self.cursors
            .entry(resource.as_str().to_string())
            .or_insert_with(|| ReplicationCursor::new(resource))
    }
}

/// All cursors of one system in a single JSON file.
///
/// Saves go through a temp file that is fsynced and renamed over the old state.
pub struct FileCursorStore {
    path: PathBuf,
    system: String,
    state: Mutex<Option<CursorState>>,
}

impl FileCursorStore {
    pub fn new(state_dir: &Path, system: &str) -> Self {
        Self {
            path: state_dir.join(CURSOR_FILE_NAME),
            system: system.to_string(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_state(&self) -> Result<CursorState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let state: CursorState = serde_json::from_str(&contents)
                    .map_err(|e| ReplicationError::serialization(&self.path, e))?;
                if state.system != self.system {
                    return Err(ReplicationError::Configuration(format!(
                        "cursor state at {:?} belongs to system '{}', not '{}'",
                        self.path, state.system, self.system
                    )));
                }
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(CursorState::new(&self.system))
            }
            Err(e) => Err(ReplicationError::persistence(&self.path, e)),
        }
    }

    async fn write_state(&self, state: &CursorState) -> Result<()> {
        let contents = serde_json::to_vec_pretty(state)
            .map_err(|e| ReplicationError::serialization(&self.path, e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
            .await
            .map_err(|e| {
                ReplicationError::persistence(&self.path, std::io::Error::other(e.to_string()))
            })?
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, resource: ResourceKind) -> Result<Option<String>> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_state().await?);
        }
        Ok(guard
            .as_ref()
            .and_then(|state| state.get(resource))
            .and_then(|cursor| cursor.last_modification_timestamp.clone()))
    }

    async fn save(&self, resource: ResourceKind, timestamp: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut state = match guard.take() {
            Some(state) => state,
            None => self.read_state().await?,
        };

        let cursor = state.get_or_create(resource);
        if !cursor.advance(timestamp) {
            tracing::warn!(
                "Ignoring cursor regression for {}: {} is older than {}",
                resource,
                timestamp,
                cursor
                    .last_modification_timestamp
                    .as_deref()
                    .unwrap_or("unset")
            );
            *guard = Some(state);
            return Ok(());
        }
        state.updated_at = Utc::now();

        // Only cache what made it to disk
        self.write_state(&state).await?;
        tracing::debug!("Persisted {} cursor {} to {:?}", resource, timestamp, self.path);
        *guard = Some(state);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        *guard = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReplicationError::persistence(&self.path, e)),
        }
    }
}

/// Replace `path` with `contents` so readers see the old or the new file, never a torn one.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ReplicationError::persistence(dir, e))?;

    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| ReplicationError::persistence(dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| ReplicationError::persistence(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| ReplicationError::persistence(path, e.error))?;
    Ok(())
}

/// In-memory store, mostly for tests. Records every accepted save.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: StdMutex<HashMap<ResourceKind, String>>,
    history: StdMutex<Vec<(ResourceKind, String)>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(resource: ResourceKind, timestamp: &str) -> Self {
        let store = Self::default();
        store
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource, timestamp.to_string());
        store
    }

    /// Accepted saves, in order.
    pub fn history(&self) -> Vec<(ResourceKind, String)> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, resource: ResourceKind) -> Result<Option<String>> {
        Ok(self
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&resource)
            .cloned())
    }

    async fn save(&self, resource: ResourceKind, timestamp: &str) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = cursors.get(&resource) {
            if compare_timestamps(timestamp, current) == Ordering::Less {
                return Ok(());
            }
        }
        cursors.insert(resource, timestamp.to_string());
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((resource, timestamp.to_string()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_compare_timestamps_uses_instants() {
        assert_eq!(
            compare_timestamps("2024-01-01T00:00:00.5Z", "2024-01-01T00:00:00.25Z"),
            Ordering::Greater
        );
        assert_eq!(
            compare_timestamps("2024-01-01T01:00:00+01:00", "2024-01-01T00:00:00Z"),
            Ordering::Equal
        );
        assert_eq!(compare_timestamps("b", "a"), Ordering::Greater);
    }

    #[test]
    fn test_cursor_advance_is_monotonic() {
        let mut cursor = ReplicationCursor::new(ResourceKind::Property);
        assert!(cursor.advance("2024-01-02T00:00:00Z"));
        assert!(!cursor.advance("2024-01-01T00:00:00Z"));
        assert_eq!(
            cursor.last_modification_timestamp.as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
        assert!(cursor.advance("2024-01-02T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_file_store_unset_then_saved() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path(), "mred");

        assert_eq!(store.load(ResourceKind::Member).await.unwrap(), None);

        store
            .save(ResourceKind::Member, "2024-03-01T10:00:00.000Z")
            .await
            .unwrap();
        assert_eq!(
            store.load(ResourceKind::Member).await.unwrap().as_deref(),
            Some("2024-03-01T10:00:00.000Z")
        );
        assert_eq!(store.load(ResourceKind::Office).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileCursorStore::new(dir.path(), "mred");
            store
                .save(ResourceKind::Property, "2024-03-01T10:00:00Z")
                .await
                .unwrap();
            store
                .save(ResourceKind::OpenHouse, "2024-02-01T10:00:00Z")
                .await
                .unwrap();
        }

        let reopened = FileCursorStore::new(dir.path(), "mred");
        assert_eq!(
            reopened
                .load(ResourceKind::Property)
                .await
                .unwrap()
                .as_deref(),
            Some("2024-03-01T10:00:00Z")
        );
        assert_eq!(
            reopened
                .load(ResourceKind::OpenHouse)
                .await
                .unwrap()
                .as_deref(),
            Some("2024-02-01T10:00:00Z")
        );

        let raw = std::fs::read_to_string(dir.path().join(CURSOR_FILE_NAME)).unwrap();
        let state: CursorState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.system, "mred");
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_file_store_never_moves_backwards() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path(), "mred");
        store
            .save(ResourceKind::Office, "2024-05-01T00:00:00Z")
            .await
            .unwrap();
        store
            .save(ResourceKind::Office, "2023-05-01T00:00:00Z")
            .await
            .unwrap();

        let reopened = FileCursorStore::new(dir.path(), "mred");
        assert_eq!(
            reopened.load(ResourceKind::Office).await.unwrap().as_deref(),
            Some("2024-05-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_other_system() {
        let dir = tempdir().unwrap();
        FileCursorStore::new(dir.path(), "mred")
            .save(ResourceKind::Office, "2024-05-01T00:00:00Z")
            .await
            .unwrap();

        let other = FileCursorStore::new(dir.path(), "actris");
        assert!(matches!(
            other.load(ResourceKind::Office).await,
            Err(ReplicationError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_state_is_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CURSOR_FILE_NAME), "{not json").unwrap();
        let store = FileCursorStore::new(dir.path(), "mred");
        assert!(matches!(
            store.load(ResourceKind::Property).await,
            Err(ReplicationError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_clear() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path(), "mred");
        store
            .save(ResourceKind::Property, "2024-03-01T10:00:00Z")
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.load(ResourceKind::Property).await.unwrap(), None);
        // Clearing twice is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_history() {
        let store = MemoryCursorStore::new();
        store
            .save(ResourceKind::Property, "2024-01-01T00:00:00Z")
            .await
            .unwrap();
        store
            .save(ResourceKind::Property, "2023-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(store.history().len(), 1);
    }
}
