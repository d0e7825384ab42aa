//! Migration utilities for converting between storage backends
//!
//! Moves a whole [`TreeStore`] between YAML and SQLite, and to/from JSON for
//! backups and interchange.

use anyhow::{Context, Result};
use std::path::Path;

use super::traits::{DatabaseStats, TreeBackend};
use super::{SqliteBackend, YamlBackend};
use crate::models::TreeStore;
use crate::storage::validate_store;

/// Copies every collection from `source` into `target`
pub fn copy_store(source: &dyn TreeBackend, target: &dyn TreeBackend) -> Result<DatabaseStats> {
    let store = source
        .load()
        .with_context(|| format!("Failed to load {} database", source.backend_type()))?;
    target
        .save(&store)
        .with_context(|| format!("Failed to save to {} database", target.backend_type()))?;
    target.stats()
}

/// Migrates a YAML file into a SQLite database
pub fn migrate_yaml_to_sqlite<P1: AsRef<Path>, P2: AsRef<Path>>(
    yaml_path: P1,
    sqlite_path: P2,
) -> Result<DatabaseStats> {
    let yaml_backend = YamlBackend::new(yaml_path);
    let sqlite_backend = SqliteBackend::new(sqlite_path)?;
    copy_store(&yaml_backend, &sqlite_backend)
}

/// Migrates a SQLite database into a YAML file
pub fn migrate_sqlite_to_yaml<P1: AsRef<Path>, P2: AsRef<Path>>(
    sqlite_path: P1,
    yaml_path: P2,
) -> Result<DatabaseStats> {
    let sqlite_backend = SqliteBackend::new(sqlite_path)?;
    let yaml_backend = YamlBackend::new(yaml_path);
    copy_store(&sqlite_backend, &yaml_backend)
}

pub fn export_to_json<P: AsRef<Path>>(store: &TreeStore, json_path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(store).context("Failed to serialize to JSON")?;
    std::fs::write(json_path, json).context("Failed to write JSON file")?;
    Ok(())
}

/// Reads and validates a JSON export
pub fn import_from_json<P: AsRef<Path>>(json_path: P) -> Result<TreeStore> {
    let json = std::fs::read_to_string(json_path).context("Failed to read JSON file")?;
    let store: TreeStore = serde_json::from_str(&json).context("Failed to parse JSON")?;
    validate_store(&store)?;
    Ok(store)
}

pub fn export_backend_to_json<P: AsRef<Path>>(
    backend: &dyn TreeBackend,
    json_path: P,
) -> Result<()> {
    let store = backend.load()?;
    export_to_json(&store, json_path)
}

/// Replaces the contents of `backend` with a JSON export
pub fn import_json_to_backend<P: AsRef<Path>>(
    json_path: P,
    backend: &dyn TreeBackend,
) -> Result<DatabaseStats> {
    let store = import_from_json(json_path)?;
    backend.save(&store)?;
    backend.stats()
}
