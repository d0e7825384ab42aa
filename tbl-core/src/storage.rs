use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::TreeStore;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// File is locked by another process
    #[error("Timeout waiting for file lock - another process may be writing: {0:?}")]
    FileLocked(PathBuf),
    /// The document breaks a uniqueness rule
    #[error("Invalid tree document: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Loads and saves a [`TreeStore`] as one YAML file, guarded by a lock file
pub struct Storage {
    file_path: PathBuf,
    lock_file_path: PathBuf,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        let lock_file_path = file_path.with_extension("yaml.lock");
        Self {
            file_path,
            lock_file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Polls for the lock until it is granted or the timeout expires
    fn wait_for_lock(&self, lock_file: &File, mode: LockMode) -> Result<()> {
        let start = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(lock_file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(lock_file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(StorageError::FileLocked(self.file_path.clone()).into());
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire lock on {:?}", self.lock_file_path)
                    });
                }
            }
        }
    }

    /// Exclusive lock, held for as long as the returned handle lives
    fn acquire_write_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.lock_file_path)
            .with_context(|| format!("Failed to create lock file: {:?}", self.lock_file_path))?;
        self.wait_for_lock(&lock_file, LockMode::Exclusive)?;

        let _ = writeln!(
            lock_file,
            "Locked by PID {} at {}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        Ok(lock_file)
    }

    fn acquire_read_lock(&self) -> Result<Option<File>> {
        if !self.lock_file_path.exists() {
            return Ok(None);
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .open(&self.lock_file_path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.lock_file_path))?;
        self.wait_for_lock(&lock_file, LockMode::Shared)?;
        Ok(Some(lock_file))
    }

    fn read_document(&self) -> Result<TreeStore> {
        let file = File::open(&self.file_path)
            .with_context(|| format!("Failed to open file: {:?}", self.file_path))?;
        let store: TreeStore = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse YAML from {:?}", self.file_path))?;
        Ok(store)
    }

    fn write_document(&self, store: &TreeStore) -> Result<()> {
        let yaml = serde_yaml::to_string(store)?;
        fs::write(&self.file_path, yaml)
            .with_context(|| format!("Failed to write {:?}", self.file_path))?;
        Ok(())
    }

    /// Loads the document, creating an empty one when the file is missing
    pub fn load(&self) -> Result<TreeStore> {
        if !self.file_path.exists() {
            let store = TreeStore::new();
            self.save(&store)?;
            return Ok(store);
        }

        let _lock = self.acquire_read_lock()?;
        let store = self.read_document()?;
        validate_store(&store)?;
        Ok(store)
    }

    pub fn save(&self, store: &TreeStore) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = self.acquire_write_lock()?;
        self.write_document(store)
    }

    /// Reloads, applies `update_fn` and writes back under one exclusive lock
    pub fn update_atomically<F>(&self, update_fn: F) -> Result<TreeStore>
    where
        F: FnOnce(&mut TreeStore),
    {
        if !self.file_path.exists() {
            self.save(&TreeStore::new())?;
        }
        let _lock = self.acquire_write_lock()?;
        let mut store = self.read_document()?;
        update_fn(&mut store);
        self.write_document(&store)?;
        Ok(store)
    }
}

/// Rejects documents with duplicate ids or duplicate variable exposed keys
pub fn validate_store(store: &TreeStore) -> Result<()> {
    fn check_unique<'a>(kind: &str, keys: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut seen = HashSet::new();
        for key in keys {
            if !seen.insert(key) {
                return Err(StorageError::Invalid(format!("duplicate {} {}", kind, key)).into());
            }
        }
        Ok(())
    }

    check_unique("node id", store.nodes.iter().map(|n| n.id.as_str()))?;
    check_unique("formula id", store.formulas.iter().map(|f| f.id.as_str()))?;
    check_unique("condition id", store.conditions.iter().map(|c| c.id.as_str()))?;
    check_unique("table id", store.tables.iter().map(|t| t.id.as_str()))?;
    check_unique("variable id", store.variables.iter().map(|v| v.id.as_str()))?;
    check_unique("exposed key", store.variables.iter().map(|v| v.exposed_key.as_str()))?;
    Ok(())
}
