pub mod cloner;
pub mod config;
pub mod copy;
pub mod db;
pub mod deep_copy;
pub mod error;
pub mod events;
pub mod links;
pub mod models;
pub mod rewrite;
pub mod storage;
pub mod suffix;
pub mod walker;

// Re-export commonly used types
pub use cloner::{build_clone_payload, rewrite_node_blobs, CloneContext};
pub use config::{get_config_path, CopyConfig};
pub use copy::{
    parse_source_ref, CapacityCopy, CoordinatorOptions, CopyCoordinator, CopyFailure, CopyOutcome,
    SourceKind, SourceRef,
};
pub use db::{
    create_backend, open_or_create, BackendType, DatabaseStats, MemoryBackend, TreeBackend,
};
pub use deep_copy::{
    deep_copy, deep_copy_atomically, CopiedRoot, DeepCopyOptions, DeepCopyResult, RootParent,
};
pub use error::{CopyError, CopyResult};
pub use events::{CopyEvent, EventSink, RecordingSink, TeeSink, TracingSink};
pub use links::{direct_references, LinkIndexMaintainer, PayloadRefs};
pub use models::{
    clone_with, CapacityKind, CapacityRef, Condition, Formula, LinkedField, Node, NodeFilter, Table,
    TableColumn, TableRow, TreeStore, Variable,
};
pub use rewrite::{rewrite_str, rewrite_value, RewriteMaps};
pub use storage::{Storage, StorageError};
pub use suffix::{apply_once, derive_next_suffix, strip_trailing_suffix, DisambiguationCounter};
pub use walker::{collect_subtree_ids, order_creation, CreationOrder};
