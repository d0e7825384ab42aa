//! YAML file storage backend
//!
//! Stores the whole tree document in one YAML file through [`Storage`], which
//! guards reads and writes with a lock file.

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::traits::{BackendType, TreeBackend};
use crate::models::TreeStore;
use crate::storage::Storage;

pub struct YamlBackend {
    storage: Storage,
    path: PathBuf,
}

impl YamlBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            storage: Storage::new(&path),
            path,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl TreeBackend for YamlBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Yaml
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TreeStore> {
        self.storage.load()
    }

    fn save(&self, store: &TreeStore) -> Result<()> {
        self.storage.save(store)
    }

    fn update_atomically<F>(&self, update_fn: F) -> Result<TreeStore>
    where
        F: FnOnce(&mut TreeStore),
    {
        self.storage.update_atomically(update_fn)
    }
}
