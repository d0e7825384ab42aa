//! Database abstraction layer for tree documents
//!
//! A trait-based abstraction over storage backends (in-memory, a single YAML
//! file, SQLite) so the duplication engine only ever sees [`TreeBackend`].

mod memory_backend;
mod migration;
mod sqlite_backend;
mod traits;
mod yaml_backend;

pub use memory_backend::MemoryBackend;
pub use migration::{
    copy_store, export_backend_to_json, export_to_json, import_from_json, import_json_to_backend,
    migrate_sqlite_to_yaml, migrate_yaml_to_sqlite,
};
pub use sqlite_backend::SqliteBackend;
pub use traits::{BackendType, DatabaseStats, StoreConflict, TreeBackend};
pub use yaml_backend::YamlBackend;

use anyhow::Result;
use std::path::Path;

/// Infers the backend from the file extension unless one is given
pub fn backend_type_for(path: &Path, backend_type: Option<BackendType>) -> BackendType {
    backend_type.unwrap_or_else(|| match path.extension().and_then(|e| e.to_str()) {
        Some("db") | Some("sqlite") | Some("sqlite3") => BackendType::Sqlite,
        _ => BackendType::Yaml,
    })
}

/// Creates a database backend based on the file extension or explicit type
pub fn create_backend(
    path: &Path,
    backend_type: Option<BackendType>,
) -> Result<Box<dyn TreeBackend>> {
    match backend_type_for(path, backend_type) {
        BackendType::Memory => Ok(Box::new(MemoryBackend::new())),
        BackendType::Yaml => Ok(Box::new(YamlBackend::new(path))),
        BackendType::Sqlite => Ok(Box::new(SqliteBackend::new(path)?)),
    }
}

/// Opens an existing database or creates an empty one
pub fn open_or_create(
    path: &Path,
    backend_type: Option<BackendType>,
) -> Result<Box<dyn TreeBackend>> {
    let backend = create_backend(path, backend_type)?;
    backend.create_if_not_exists()?;
    Ok(backend)
}
