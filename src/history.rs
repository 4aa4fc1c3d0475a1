use crate::errors::{EngineError, EngineResult};
use crate::models::OperationKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Samples kept per operation key; older ones are evicted first.
pub const MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSamples {
    #[serde(default)]
    pub lines: VecDeque<u32>,
    #[serde(default)]
    pub durations: VecDeque<f64>,
}

impl OperationSamples {
    pub fn push(&mut self, total_lines: u32, duration_secs: f64) {
        self.lines.push_back(total_lines);
        self.durations.push_back((duration_secs * 100.0).round() / 100.0);
        self.trim();
    }

    fn trim(&mut self) {
        while self.lines.len() > MAX_SAMPLES {
            self.lines.pop_front();
        }
        while self.durations.len() > MAX_SAMPLES {
            self.durations.pop_front();
        }
    }
}

pub type HistoryDocument = BTreeMap<OperationKey, OperationSamples>;

/// Persistence boundary for the history document.
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> EngineResult<HistoryDocument>;
    fn save(&self, document: &HistoryDocument) -> EngineResult<()>;
}

/// Pretty-printed JSON document at a per-user path.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> EngineResult<HistoryDocument> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryDocument::new())
            }
            Err(error) => return Err(error.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, document: &HistoryDocument) -> EngineResult<()> {
        let persist = || -> EngineResult<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(document)?;
            let staging = self.path.with_extension("json.tmp");
            std::fs::write(&staging, content)?;
            std::fs::rename(&staging, &self.path)?;
            Ok(())
        };
        persist().map_err(|error| {
            EngineError::Persistence(format!("{}: {}", self.path.display(), error))
        })
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<HistoryDocument>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: HistoryDocument) -> Self {
        Self {
            document: Mutex::new(document),
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn document(&self) -> HistoryDocument {
        lock(&self.document).clone()
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> EngineResult<HistoryDocument> {
        Ok(lock(&self.document).clone())
    }

    fn save(&self, document: &HistoryDocument) -> EngineResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("memory store is read-only".to_string()));
        }
        *lock(&self.document) = document.clone();
        Ok(())
    }
}

/// Per-operation-kind samples, loaded lazily and written back on every append.
///
/// A single mutex covers load-mutate-persist so concurrent sessions finishing
/// the same operation kind never lose a sample.
pub struct OperationHistory {
    store: Arc<dyn HistoryStore>,
    cache: Mutex<Option<HistoryDocument>>,
}

impl OperationHistory {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    pub fn samples(&self, key: &OperationKey) -> OperationSamples {
        let mut cache = lock(&self.cache);
        self.loaded(&mut cache).get(key).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HistoryDocument {
        let mut cache = lock(&self.cache);
        self.loaded(&mut cache).clone()
    }

    /// Appends one observation and persists the whole document. The in-memory
    /// copy keeps the sample even when the save fails.
    pub fn append(&self, key: &OperationKey, total_lines: u32, duration_secs: f64) -> EngineResult<()> {
        let mut cache = lock(&self.cache);
        let document = self.loaded(&mut cache);
        document
            .entry(key.clone())
            .or_default()
            .push(total_lines, duration_secs);
        self.store.save(document)
    }

    fn loaded<'a>(&self, cache: &'a mut MutexGuard<'_, Option<HistoryDocument>>) -> &'a mut HistoryDocument {
        cache.get_or_insert_with(|| match self.store.load() {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(error = %error, "operation history unreadable; starting empty");
                HistoryDocument::new()
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{
        HistoryDocument, HistoryStore, JsonFileStore, MemoryStore, OperationHistory, OperationSamples,
        MAX_SAMPLES,
    };
    use crate::models::OperationKey;
    use std::sync::Arc;

    #[test]
    fn samples_evict_oldest_past_capacity() {
        let mut samples = OperationSamples::default();
        for index in 0..=MAX_SAMPLES as u32 {
            samples.push(index, f64::from(index));
        }
        assert_eq!(samples.lines.len(), MAX_SAMPLES);
        assert_eq!(samples.durations.len(), MAX_SAMPLES);
        assert_eq!(samples.lines.front(), Some(&1));
        assert_eq!(samples.lines.back(), Some(&(MAX_SAMPLES as u32)));
    }

    #[test]
    fn durations_are_rounded_to_hundredths() {
        let mut samples = OperationSamples::default();
        samples.push(10, 1.23456);
        assert_eq!(samples.durations.front(), Some(&1.23));
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("nested").join("eta_history.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn corrupt_file_is_treated_as_no_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("eta_history.json");
        std::fs::write(&path, "[[[").expect("write");
        let history = OperationHistory::new(Arc::new(JsonFileStore::new(&path)));
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg").join("eta_history.json");
        let key = OperationKey::from("pacman_-S");

        let history = OperationHistory::new(Arc::new(JsonFileStore::new(&path)));
        history.append(&key, 42, 3.5).expect("append");

        let reloaded = OperationHistory::new(Arc::new(JsonFileStore::new(&path)));
        let samples = reloaded.samples(&key);
        assert_eq!(samples.lines, vec![42]);
        assert_eq!(samples.durations, vec![3.5]);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["pacman_-S"]["lines"][0], 42);
    }

    #[test]
    fn failed_save_keeps_sample_in_memory() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_saves(true);
        let history = OperationHistory::new(store.clone());
        let key = OperationKey::from("paru_-S");

        assert!(history.append(&key, 7, 1.0).is_err());
        assert_eq!(history.samples(&key).lines, vec![7]);
        assert!(store.document().is_empty());
    }

    #[test]
    fn concurrent_appends_do_not_lose_samples() {
        let store = Arc::new(MemoryStore::with_document(HistoryDocument::new()));
        let history = Arc::new(OperationHistory::new(store.clone()));
        let key = OperationKey::from("pacman_-S");

        let handles = (0..8)
            .map(|index| {
                let history = history.clone();
                let key = key.clone();
                std::thread::spawn(move || history.append(&key, index, 1.0))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join").expect("append");
        }

        assert_eq!(history.samples(&key).lines.len(), 8);
        assert_eq!(store.document()[&key].lines.len(), 8);
        assert_eq!(store.save_count(), 8);
    }
}
