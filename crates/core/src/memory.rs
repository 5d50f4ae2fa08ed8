//! History Persistence
//!
//! Histories are stored as serialized JSON strings in a flat key-value store,
//! one live entry per voice plus any number of timestamp-keyed snapshots:
//!
//! - `chatHistory_<voice>` holds the live history.
//! - `chatHistory_<voice>_memory_<timestamp>` holds one snapshot.
//!
//! Timestamps are RFC 3339 UTC with millisecond precision, so sorting the keys
//! lexicographically sorts the snapshots chronologically.

use crate::history::RawHistory;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const HISTORY_KEY_PREFIX: &str = "chatHistory_";
const SNAPSHOT_INFIX: &str = "_memory_";

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Stored history under '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),
    #[error("Voice name '{0}' must not contain '_memory_'")]
    InvalidVoiceName(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// The key of the live history for `voice_name`.
pub fn history_key(voice_name: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{voice_name}")
}

/// The key of the snapshot of `voice_name` taken at `timestamp`.
pub fn snapshot_key(voice_name: &str, timestamp: &str) -> String {
    format!("{}{SNAPSHOT_INFIX}{timestamp}", history_key(voice_name))
}

/// Rejects voice names whose live key would read as another voice's snapshot.
pub fn check_voice_name(voice_name: &str) -> Result<(), MemoryError> {
    if voice_name.contains(SNAPSHOT_INFIX) {
        return Err(MemoryError::InvalidVoiceName(voice_name.to_string()));
    }
    Ok(())
}

/// A flat, string-valued key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, MemoryError>;
    fn set(&self, key: &str, value: String) -> Result<(), MemoryError>;
    fn remove(&self, key: &str) -> Result<(), MemoryError>;
    fn keys(&self) -> Result<Vec<String>, MemoryError>;
}

/// A store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, MemoryError> {
        let entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, MemoryError> {
        let entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        Ok(entries.keys().cloned().collect())
    }
}

/// A store persisted as a single JSON object on disk.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// A file that does not decode is moved aside to `<path>.corrupt` and the
    /// store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    let aside = corrupt_path(&path);
                    warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "History store is corrupt, starting empty"
                    );
                    std::fs::rename(&path, &aside)?;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "Opened history store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, MemoryError> {
        let entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, MemoryError> {
        let entries = self.entries.lock().map_err(|_| MemoryError::Poisoned)?;
        Ok(entries.keys().cloned().collect())
    }
}

/// Voice-scoped history persistence and snapshotting on top of a [`KeyValueStore`].
///
/// Access is assumed to be single-writer per voice; nothing here locks
/// across store instances.
#[derive(Clone)]
pub struct MemoryStore {
    store: Arc<dyn KeyValueStore>,
}

impl MemoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Serializes `history` as the live history of `voice_name`.
    pub fn save(&self, voice_name: &str, history: &RawHistory) -> Result<(), MemoryError> {
        check_voice_name(voice_name)?;
        let serialized = serde_json::to_string(history)?;
        self.store.set(&history_key(voice_name), serialized)
    }

    /// Loads the live history of `voice_name`.
    ///
    /// A missing, unreadable or corrupt entry yields an empty history.
    pub fn load(&self, voice_name: &str) -> RawHistory {
        if let Err(e) = check_voice_name(voice_name) {
            warn!(error = %e, "Not loading history");
            return RawHistory::new();
        }
        let key = history_key(voice_name);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return RawHistory::new(),
            Err(e) => {
                warn!(error = %e, %key, "Failed to read stored history, starting empty");
                return RawHistory::new();
            }
        };
        match decode(&key, &raw) {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Discarding corrupt stored history");
                RawHistory::new()
            }
        }
    }

    /// Removes the live history. Snapshots are left alone.
    pub fn clear(&self, voice_name: &str) -> Result<(), MemoryError> {
        check_voice_name(voice_name)?;
        self.store.remove(&history_key(voice_name))
    }

    /// Copies the live history of `voice_name` into a new snapshot and returns its timestamp.
    pub fn snapshot(&self, voice_name: &str) -> Result<String, MemoryError> {
        self.snapshot_at(voice_name, Utc::now())
    }

    /// Like [`MemoryStore::snapshot`] with an explicit clock reading.
    ///
    /// If `now` is not later than the newest existing snapshot, the timestamp
    /// is moved one millisecond past it so keys stay unique and ordered.
    pub fn snapshot_at(&self, voice_name: &str, now: DateTime<Utc>) -> Result<String, MemoryError> {
        check_voice_name(voice_name)?;
        let live = self
            .store
            .get(&history_key(voice_name))?
            .unwrap_or_else(|| "[]".to_string());

        let mut taken_at = now;
        if let Some(newest) = self.list(voice_name)?.first() {
            if let Ok(newest) = DateTime::parse_from_rfc3339(newest) {
                let newest = newest.with_timezone(&Utc);
                if taken_at <= newest {
                    taken_at = newest + Duration::milliseconds(1);
                }
            }
        }

        let timestamp = format_timestamp(taken_at);
        self.store.set(&snapshot_key(voice_name, &timestamp), live)?;
        info!(voice = %voice_name, %timestamp, "Snapshot taken");
        Ok(timestamp)
    }

    /// All snapshot timestamps of `voice_name`, newest first.
    pub fn list(&self, voice_name: &str) -> Result<Vec<String>, MemoryError> {
        check_voice_name(voice_name)?;
        let prefix = snapshot_key(voice_name, "");
        let mut timestamps: Vec<String> = self
            .store
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|ts| !ts.is_empty())
            .collect();
        timestamps.sort_unstable_by(|a, b| b.cmp(a));
        Ok(timestamps)
    }

    /// Overwrites the live history with the snapshot taken at `timestamp`.
    ///
    /// Other snapshots are untouched. Callers must reload their in-memory
    /// history afterwards.
    pub fn restore(&self, voice_name: &str, timestamp: &str) -> Result<(), MemoryError> {
        let content = self
            .read_snapshot(voice_name, timestamp)?
            .ok_or_else(|| MemoryError::SnapshotNotFound(timestamp.to_string()))?;
        self.store.set(&history_key(voice_name), content)?;
        info!(voice = %voice_name, %timestamp, "Snapshot restored");
        Ok(())
    }

    /// The raw serialized content of one snapshot.
    pub fn read_snapshot(
        &self,
        voice_name: &str,
        timestamp: &str,
    ) -> Result<Option<String>, MemoryError> {
        check_voice_name(voice_name)?;
        self.store.get(&snapshot_key(voice_name, timestamp))
    }

    /// Writes or overwrites one snapshot slot with raw serialized content.
    pub fn write_snapshot(
        &self,
        voice_name: &str,
        timestamp: &str,
        content: String,
    ) -> Result<(), MemoryError> {
        check_voice_name(voice_name)?;
        self.store.set(&snapshot_key(voice_name, timestamp), content)
    }
}

fn decode(key: &str, raw: &str) -> Result<RawHistory, MemoryError> {
    serde_json::from_str(raw).map_err(|source| MemoryError::Decode {
        key: key.to_string(),
        source,
    })
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    PathBuf::from(aside)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{ToolCall, Turn};
    use chrono::TimeZone;

    fn memory() -> (Arc<InMemoryStore>, MemoryStore) {
        let kv = Arc::new(InMemoryStore::new());
        (kv.clone(), MemoryStore::new(kv))
    }

    fn sample_history() -> RawHistory {
        RawHistory::from(vec![
            Turn::user("what's the weather in Paris?"),
            Turn::tool_request(vec![ToolCall::function(
                "c1",
                "get_weather",
                r#"{"location":"Paris"}"#,
            )]),
            Turn::tool_result("c1", r#"{"temperature":18}"#),
            Turn::assistant("It's 18 degrees."),
        ])
    }

    #[test]
    fn test_keys_are_scoped_by_voice() {
        assert_eq!(history_key("Watercooler"), "chatHistory_Watercooler");
        assert_eq!(
            snapshot_key("Watercooler", "2025-01-01T00:00:00.000Z"),
            "chatHistory_Watercooler_memory_2025-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let (_, memory) = memory();
        let history = sample_history();
        memory.save("Dev", &history).unwrap();
        assert_eq!(memory.load("Dev"), history);
        assert!(memory.load("Other").is_empty());
    }

    #[test]
    fn test_load_corrupt_entry_returns_empty() {
        let (kv, memory) = memory();
        kv.set(&history_key("Dev"), "{not json".to_string()).unwrap();
        assert!(memory.load("Dev").is_empty());
    }

    #[test]
    fn test_clear_keeps_snapshots() {
        let (_, memory) = memory();
        memory.save("Dev", &sample_history()).unwrap();
        let ts = memory.snapshot("Dev").unwrap();
        memory.clear("Dev").unwrap();
        assert!(memory.load("Dev").is_empty());
        assert_eq!(memory.list("Dev").unwrap(), vec![ts]);
    }

    #[test]
    fn test_snapshot_is_listed_newest_first() {
        let (_, memory) = memory();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        memory.save("Dev", &sample_history()).unwrap();
        let first = memory.snapshot_at("Dev", t0).unwrap();
        let second = memory
            .snapshot_at("Dev", t0 + Duration::seconds(5))
            .unwrap();
        assert_eq!(first, "2025-03-01T12:00:00.000Z");
        assert_eq!(memory.list("Dev").unwrap(), vec![second, first]);
    }

    #[test]
    fn test_snapshot_within_same_millisecond_stays_unique() {
        let (_, memory) = memory();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let a = memory.snapshot_at("Dev", t0).unwrap();
        let b = memory.snapshot_at("Dev", t0).unwrap();
        assert_ne!(a, b);
        assert_eq!(memory.list("Dev").unwrap()[0], b);
    }

    #[test]
    fn test_restore_brings_back_captured_state() {
        let (_, memory) = memory();
        let captured = sample_history();
        memory.save("Dev", &captured).unwrap();
        let ts = memory.snapshot("Dev").unwrap();

        let mut later = captured.clone();
        later.push(Turn::user("and tomorrow?"));
        memory.save("Dev", &later).unwrap();

        memory.restore("Dev", &ts).unwrap();
        assert_eq!(memory.load("Dev"), captured);
        assert_eq!(memory.list("Dev").unwrap().len(), 1);
    }

    #[test]
    fn test_restore_unknown_snapshot_fails() {
        let (_, memory) = memory();
        let err = memory.restore("Dev", "1999-01-01T00:00:00.000Z").unwrap_err();
        assert!(matches!(err, MemoryError::SnapshotNotFound(_)));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        {
            let memory = MemoryStore::new(Arc::new(FileStore::open(&path).unwrap()));
            memory.save("Dev", &sample_history()).unwrap();
            memory.snapshot("Dev").unwrap();
        }
        let memory = MemoryStore::new(Arc::new(FileStore::open(&path).unwrap()));
        assert_eq!(memory.load("Dev"), sample_history());
        assert_eq!(memory.list("Dev").unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_sets_corrupt_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("history.json.corrupt")).unwrap(),
            "garbage"
        );

        let memory = MemoryStore::new(Arc::new(store));
        memory.save("Dev", &sample_history()).unwrap();
        let reopened = MemoryStore::new(Arc::new(FileStore::open(&path).unwrap()));
        assert_eq!(reopened.load("Dev"), sample_history());
    }

    #[test]
    fn test_voice_names_cannot_alias_snapshots() {
        let (_, memory) = memory();
        let err = memory
            .save("A_memory_x", &sample_history())
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidVoiceName(_)));
        assert!(memory.load("A_memory_x").is_empty());
        assert!(memory.list("A").unwrap().is_empty());
        assert!(matches!(
            memory.snapshot("A_memory_x"),
            Err(MemoryError::InvalidVoiceName(_))
        ));
    }
}
