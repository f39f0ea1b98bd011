//! JSONL-based storage implementation with in-memory caching.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Serialize, de::DeserializeOwned};

use super::traits::{Filter, HasId, Storage};
use crate::error::{Result, ToolMeisterError};

/// JSONL-based storage with in-memory caching.
///
/// One `<collection>.jsonl` file per collection, one record per line. Creates
/// append; updates rewrite the file through a temporary and a rename.
pub struct JsonlStorage {
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

fn lock_err(e: impl std::fmt::Display) -> ToolMeisterError {
    ToolMeisterError::Storage(e.to_string())
}

fn record_id(record: &serde_json::Value) -> Option<&str> {
    record.get("id").and_then(|v| v.as_str())
}

impl JsonlStorage {
    /// Create a new JsonlStorage at the given path.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            ToolMeisterError::Storage(format!("Cannot create state dir {}: {}", base_path.display(), e))
        })?;
        Ok(Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", collection))
    }

    /// Load a collection into cache if not already loaded.
    fn ensure_loaded(&self, collection: &str) -> Result<()> {
        {
            let cache = self.cache.read().map_err(lock_err)?;
            if cache.contains_key(collection) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().map_err(lock_err)?;
        if cache.contains_key(collection) {
            return Ok(());
        }

        let path = self.collection_path(collection);
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: serde_json::Value = serde_json::from_str(&line).map_err(|e| {
                    ToolMeisterError::Storage(format!("{}:{}: {}", path.display(), lineno + 1, e))
                })?;
                records.push(record);
            }
        }

        cache.insert(collection.to_string(), records);
        Ok(())
    }

    fn append_to_file(&self, collection: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.collection_path(collection);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Rewrite the entire collection file from cache.
    fn rewrite_file(&self, collection: &str) -> Result<()> {
        let cache = self.cache.read().map_err(lock_err)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| ToolMeisterError::Storage(format!("Collection not loaded: {}", collection)))?;

        let path = self.collection_path(collection);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in records {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Replace the cached record with `id`; false if absent.
    fn replace_cached(&self, collection: &str, id: &str, value: &serde_json::Value) -> Result<bool> {
        let mut cache = self.cache.write().map_err(lock_err)?;
        let records = cache
            .get_mut(collection)
            .ok_or_else(|| ToolMeisterError::Storage(format!("Collection not loaded: {}", collection)))?;
        match records.iter_mut().find(|r| record_id(r) == Some(id)) {
            Some(r) => {
                *r = value.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Storage for JsonlStorage {
    fn create<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        self.ensure_loaded(collection)?;
        if self.get::<serde_json::Value>(collection, record.id())?.is_some() {
            return Err(ToolMeisterError::Storage(format!(
                "Record {} already exists in {}",
                record.id(),
                collection
            )));
        }

        let value = serde_json::to_value(record)?;

        // Append to file first (source of truth)
        self.append_to_file(collection, &value)?;

        let mut cache = self.cache.write().map_err(lock_err)?;
        cache.entry(collection.to_string()).or_default().push(value);

        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(lock_err)?;
        let found = cache
            .get(collection)
            .and_then(|records| records.iter().find(|r| record_id(r) == Some(id)));

        match found {
            Some(record) => Ok(Some(serde_json::from_value(record.clone())?)),
            None => Ok(None),
        }
    }

    fn update<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        self.ensure_loaded(collection)?;

        let value = serde_json::to_value(record)?;
        if !self.replace_cached(collection, record.id(), &value)? {
            return Err(ToolMeisterError::NotFound(format!("{} in {}", record.id(), collection)));
        }

        self.rewrite_file(collection)
    }

    fn upsert<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        self.ensure_loaded(collection)?;

        let value = serde_json::to_value(record)?;
        if self.replace_cached(collection, record.id(), &value)? {
            self.rewrite_file(collection)
        } else {
            self.create(collection, record)
        }
    }

    fn query<T: DeserializeOwned>(&self, collection: &str, filters: &[Filter]) -> Result<Vec<T>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(lock_err)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| ToolMeisterError::Storage(format!("Collection not loaded: {}", collection)))?;

        let mut results = Vec::new();
        for record in records {
            if filters.iter().all(|f| f.matches(record)) {
                results.push(serde_json::from_value(record.clone())?);
            }
        }

        Ok(results)
    }

    fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.query(collection, &[])
    }

    fn reload(&self, collection: &str) -> Result<()> {
        let mut cache = self.cache.write().map_err(lock_err)?;
        cache.remove(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: String,
        group: String,
        status: String,
    }

    impl HasId for TestRecord {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn record(id: &str, status: &str) -> TestRecord {
        TestRecord {
            id: id.to_string(),
            group: "default".to_string(),
            status: status.to_string(),
        }
    }

    fn create_test_storage() -> (JsonlStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonlStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_create_and_get() {
        let (storage, _temp) = create_test_storage();
        storage.create("runs", &record("r1", "active")).unwrap();
        let retrieved: Option<TestRecord> = storage.get("runs", "r1").unwrap();
        assert_eq!(retrieved, Some(record("r1", "active")));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let (storage, _temp) = create_test_storage();
        storage.create("runs", &record("r1", "active")).unwrap();
        assert!(storage.create("runs", &record("r1", "active")).is_err());
    }

    #[test]
    fn test_get_not_found() {
        let (storage, _temp) = create_test_storage();
        let retrieved: Option<TestRecord> = storage.get("runs", "nonexistent").unwrap();
        assert_eq!(retrieved, None);
    }

    #[test]
    fn test_update() {
        let (storage, _temp) = create_test_storage();
        storage.create("runs", &record("r1", "active")).unwrap();
        storage.update("runs", &record("r1", "finished")).unwrap();
        let retrieved: TestRecord = storage.get("runs", "r1").unwrap().unwrap();
        assert_eq!(retrieved.status, "finished");
    }

    #[test]
    fn test_update_not_found() {
        let (storage, _temp) = create_test_storage();
        let result = storage.update("runs", &record("r1", "active"));
        assert!(matches!(result, Err(ToolMeisterError::NotFound(_))));
    }

    #[test]
    fn test_upsert_creates_then_replaces() {
        let (storage, _temp) = create_test_storage();
        storage.upsert("samples", &record("r1/1/1", "tools_starting")).unwrap();
        storage.upsert("samples", &record("r1/1/1", "tools_running")).unwrap();
        let all: Vec<TestRecord> = storage.list("samples").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "tools_running");
    }

    #[test]
    fn test_query_with_filters() {
        let (storage, _temp) = create_test_storage();
        storage.create("runs", &record("r1", "active")).unwrap();
        storage.create("runs", &record("r2", "finished")).unwrap();
        storage.create("runs", &record("r3", "active")).unwrap();

        let active: Vec<TestRecord> = storage.query("runs", &[Filter::eq("status", "active")]).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|r| r.status == "active"));
    }

    #[test]
    fn test_persistence_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = JsonlStorage::new(temp_dir.path()).unwrap();
            storage.create("runs", &record("r1", "active")).unwrap();
            storage.update("runs", &record("r1", "finished")).unwrap();
        }
        let storage = JsonlStorage::new(temp_dir.path()).unwrap();
        let retrieved: TestRecord = storage.get("runs", "r1").unwrap().unwrap();
        assert_eq!(retrieved.status, "finished");
    }

    #[test]
    fn test_reload_sees_other_writer() {
        let temp_dir = TempDir::new().unwrap();
        let reader = JsonlStorage::new(temp_dir.path()).unwrap();
        let writer = JsonlStorage::new(temp_dir.path()).unwrap();

        writer.create("samples", &record("r1/1/1", "tools_starting")).unwrap();
        let before: TestRecord = reader.get("samples", "r1/1/1").unwrap().unwrap();
        assert_eq!(before.status, "tools_starting");

        writer.update("samples", &record("r1/1/1", "tools_stopping")).unwrap();
        let cached: TestRecord = reader.get("samples", "r1/1/1").unwrap().unwrap();
        assert_eq!(cached.status, "tools_starting");

        reader.reload("samples").unwrap();
        let fresh: TestRecord = reader.get("samples", "r1/1/1").unwrap().unwrap();
        assert_eq!(fresh.status, "tools_stopping");
    }

    #[test]
    fn test_corrupt_line_reports_location() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("runs.jsonl"), "{\"id\":\"r1\"}\nnot json\n").unwrap();
        let storage = JsonlStorage::new(temp_dir.path()).unwrap();
        let err = storage.list::<serde_json::Value>("runs").unwrap_err();
        assert!(err.to_string().contains("runs.jsonl:2"));
    }

    #[test]
    fn test_empty_collection() {
        let (storage, _temp) = create_test_storage();
        let all: Vec<TestRecord> = storage.list("empty").unwrap();
        assert!(all.is_empty());
    }
}
