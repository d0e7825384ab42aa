//! Structured events emitted during a duplication pass
//!
//! Every notable step (a capacity copied, a link added, a recovered failure)
//! is reported as a [`CopyEvent`] to an [`EventSink`]. The default sink
//! forwards to `tracing`; tests and the CLI summary use [`RecordingSink`].

use std::sync::Mutex;

use crate::models::{CapacityKind, LinkedField};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEvent {
    NodeCloned {
        source_id: String,
        new_id: String,
        parent_id: Option<String>,
    },
    CapacityCopied {
        kind: CapacityKind,
        source_id: String,
        new_id: String,
        owner_id: String,
    },
    VariableCopied {
        source_id: String,
        new_id: String,
        owner_id: String,
        exposed_key: String,
    },
    DisplayNodeCreated {
        variable_id: String,
        node_id: String,
        template_id: String,
    },
    LinkAdded {
        node_id: String,
        field: LinkedField,
        ids: Vec<String>,
    },
    LinkMaintenanceFailed {
        node_id: String,
        field: LinkedField,
        reason: String,
    },
    DependencyCopyFailed {
        parent_id: String,
        reference: String,
        reason: String,
    },
    ConflictResolved {
        entity: &'static str,
        key: String,
        resolved: String,
    },
    /// A capacity was requested while its own copy was still in progress
    CycleGuarded {
        reference: String,
        reserved_id: String,
    },
    /// Creation ordering had to fall back to depth ordering for these ids
    OrderingAnomaly {
        ids: Vec<String>,
    },
}

impl CopyEvent {
    /// Recoveries and anomalies; everything else is routine
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            CopyEvent::LinkMaintenanceFailed { .. }
                | CopyEvent::DependencyCopyFailed { .. }
                | CopyEvent::ConflictResolved { .. }
                | CopyEvent::CycleGuarded { .. }
                | CopyEvent::OrderingAnomaly { .. }
        )
    }
}

/// Receives the events of a duplication pass
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CopyEvent);
}

/// Forwards events to `tracing` under the `tbl::copy` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CopyEvent) {
        match &event {
            CopyEvent::NodeCloned {
                source_id,
                new_id,
                parent_id,
            } => {
                tracing::info!(
                    target: "tbl::copy",
                    source = %source_id,
                    new = %new_id,
                    parent = ?parent_id,
                    "node cloned"
                );
            }
            CopyEvent::CapacityCopied {
                kind,
                source_id,
                new_id,
                owner_id,
            } => {
                tracing::info!(
                    target: "tbl::copy",
                    %kind,
                    source = %source_id,
                    new = %new_id,
                    owner = %owner_id,
                    "capacity copied"
                );
            }
            CopyEvent::VariableCopied {
                source_id,
                new_id,
                owner_id,
                exposed_key,
            } => {
                tracing::info!(
                    target: "tbl::copy",
                    source = %source_id,
                    new = %new_id,
                    owner = %owner_id,
                    exposed_key = %exposed_key,
                    "variable copied"
                );
            }
            CopyEvent::DisplayNodeCreated {
                variable_id,
                node_id,
                template_id,
            } => {
                tracing::info!(
                    target: "tbl::copy",
                    variable = %variable_id,
                    node = %node_id,
                    template = %template_id,
                    "display node created"
                );
            }
            CopyEvent::LinkAdded { node_id, field, ids } => {
                tracing::debug!(
                    target: "tbl::copy",
                    node = %node_id,
                    %field,
                    ids = ?ids,
                    "link added"
                );
            }
            CopyEvent::LinkMaintenanceFailed { node_id, field, reason } => {
                tracing::warn!(
                    target: "tbl::copy",
                    node = %node_id,
                    %field,
                    reason = %reason,
                    "link maintenance failed"
                );
            }
            CopyEvent::DependencyCopyFailed {
                parent_id,
                reference,
                reason,
            } => {
                tracing::warn!(
                    target: "tbl::copy",
                    parent = %parent_id,
                    reference = %reference,
                    reason = %reason,
                    "dependency copy failed, falling back to suffix"
                );
            }
            CopyEvent::ConflictResolved { entity, key, resolved } => {
                tracing::warn!(
                    target: "tbl::copy",
                    entity,
                    key = %key,
                    resolved = %resolved,
                    "conflict resolved"
                );
            }
            CopyEvent::CycleGuarded {
                reference,
                reserved_id,
            } => {
                tracing::warn!(
                    target: "tbl::copy",
                    reference = %reference,
                    reserved = %reserved_id,
                    "cyclic capacity reference"
                );
            }
            CopyEvent::OrderingAnomaly { ids } => {
                tracing::warn!(
                    target: "tbl::copy",
                    ids = ?ids,
                    "creation order fell back to depth ordering"
                );
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CopyEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<CopyEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CopyEvent) -> bool,
    {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CopyEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Records events and forwards them to `tracing`
#[derive(Debug, Default)]
pub struct TeeSink {
    pub recording: RecordingSink,
}

impl EventSink for TeeSink {
    fn emit(&self, event: CopyEvent) {
        TracingSink.emit(event.clone());
        self.recording.emit(event);
    }
}
