//! Capacity copiers
//!
//! Formulas, conditions and tables can reference each other, so their copiers
//! recurse into one another. All of them run on one [`CopyCoordinator`], which
//! owns the id maps of the pass, the variable cache and the set of capacities
//! currently being copied. A capacity requested while it is still in progress
//! resolves to its reserved id instead of recursing again.

mod condition;
mod formula;
mod table;
mod variable;

pub use variable::{parse_source_ref, SourceKind, SourceRef};

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::db::{StoreConflict, TreeBackend};
use crate::error::{CopyError, CopyResult};
use crate::events::{CopyEvent, EventSink};
use crate::links::LinkIndexMaintainer;
use crate::models::{CapacityKind, CapacityRef};
use crate::rewrite::{RefTarget, RewriteMaps};
use crate::suffix::{apply_once, strip_trailing_suffix, DisambiguationCounter};

/// Result of one successful capacity copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityCopy {
    pub new_id: String,
    pub owner_id: String,
    /// The copy already existed in this pass or in the store
    pub reused: bool,
}

/// Outcome reported to callers of the public copy operations.
///
/// Copy failures are values here, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub source_id: String,
    pub new_id: Option<String>,
    pub error: Option<String>,
}

impl CopyOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    fn from_result(source_id: &str, result: CopyResult<CapacityCopy>) -> Self {
        match result {
            Ok(copy) => Self {
                source_id: source_id.to_string(),
                new_id: Some(copy.new_id),
                error: None,
            },
            Err(err) => Self {
                source_id: source_id.to_string(),
                new_id: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// A recovered failure recorded during the pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub create_display_nodes: bool,
    pub preserve_shared_references: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            create_display_nodes: true,
            preserve_shared_references: false,
        }
    }
}

/// Shared state of one duplication pass
pub struct CopyCoordinator<'a> {
    pub(crate) store: &'a dyn TreeBackend,
    pub(crate) sink: &'a dyn EventSink,
    pub(crate) suffix: String,
    pub(crate) maps: RewriteMaps,
    pub(crate) options: CoordinatorOptions,
    variable_cache: HashMap<String, String>,
    in_progress: HashSet<CapacityRef>,
    counter: DisambiguationCounter,
    display_node_ids: Vec<String>,
    failures: Vec<CopyFailure>,
}

impl<'a> CopyCoordinator<'a> {
    pub fn new(
        store: &'a dyn TreeBackend,
        sink: &'a dyn EventSink,
        suffix: impl Into<String>,
    ) -> Self {
        Self::with_maps(store, sink, suffix, RewriteMaps::new(), CoordinatorOptions::default())
    }

    pub fn with_maps(
        store: &'a dyn TreeBackend,
        sink: &'a dyn EventSink,
        suffix: impl Into<String>,
        maps: RewriteMaps,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            sink,
            suffix: suffix.into(),
            maps,
            options,
            variable_cache: HashMap::new(),
            in_progress: HashSet::new(),
            counter: DisambiguationCounter::default(),
            display_node_ids: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn maps(&self) -> &RewriteMaps {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut RewriteMaps {
        &mut self.maps
    }

    pub fn display_node_ids(&self) -> &[String] {
        &self.display_node_ids
    }

    pub fn failures(&self) -> &[CopyFailure] {
        &self.failures
    }

    pub fn into_parts(self) -> (RewriteMaps, Vec<String>, Vec<CopyFailure>) {
        (self.maps, self.display_node_ids, self.failures)
    }

    pub fn copy_formula(&mut self, source_id: &str, target_owner_id: &str) -> CopyOutcome {
        let result = self.try_copy_formula(source_id, target_owner_id);
        CopyOutcome::from_result(source_id, result)
    }

    pub fn copy_condition(&mut self, source_id: &str, target_owner_id: &str) -> CopyOutcome {
        let result = self.try_copy_condition(source_id, target_owner_id);
        CopyOutcome::from_result(source_id, result)
    }

    pub fn copy_table(&mut self, source_id: &str, target_owner_id: &str) -> CopyOutcome {
        let result = self.try_copy_table(source_id, target_owner_id);
        CopyOutcome::from_result(source_id, result)
    }

    /// Copies any capacity reference onto `target_owner_id`
    pub fn try_copy_capacity(
        &mut self,
        reference: &CapacityRef,
        target_owner_id: &str,
    ) -> CopyResult<CapacityCopy> {
        match reference {
            CapacityRef::Formula(id) => self.try_copy_formula(id, target_owner_id),
            CapacityRef::Condition(id) => self.try_copy_condition(id, target_owner_id),
            CapacityRef::Table(id) => self.try_copy_table(id, target_owner_id),
        }
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    pub(crate) fn links(&self) -> LinkIndexMaintainer<'a> {
        LinkIndexMaintainer::new(self.store, self.sink)
    }

    fn row_exists(&self, reference: &CapacityRef) -> CopyResult<bool> {
        Ok(match reference {
            CapacityRef::Formula(id) => self.store.find_formula(id)?.is_some(),
            CapacityRef::Condition(id) => self.store.find_condition(id)?.is_some(),
            CapacityRef::Table(id) => self.store.find_table(id)?.is_some(),
        })
    }

    /// Returns the copy when the capacity was already handled in this pass.
    ///
    /// A capacity still being copied resolves to its reserved id. A cached id
    /// whose row has disappeared is dropped so the capacity gets copied again.
    fn reuse_or_guard(
        &mut self,
        reference: &CapacityRef,
        target_owner_id: &str,
    ) -> CopyResult<Option<CapacityCopy>> {
        let target = ref_target(reference);
        let Some(new_id) = self.maps.get(target).get(reference.id()).cloned() else {
            return Ok(None);
        };

        if self.in_progress.contains(reference) {
            self.sink.emit(CopyEvent::CycleGuarded {
                reference: reference.to_string(),
                reserved_id: new_id.clone(),
            });
            return Ok(Some(CapacityCopy {
                new_id,
                owner_id: target_owner_id.to_string(),
                reused: true,
            }));
        }

        let copied = rebuild_ref(reference, &new_id);
        if self.row_exists(&copied)? {
            return Ok(Some(CapacityCopy {
                new_id,
                owner_id: target_owner_id.to_string(),
                reused: true,
            }));
        }
        self.maps.get_mut(target).remove(reference.id());
        Ok(None)
    }

    /// Looks a source row up by its clean id, falling back to the id as given
    fn lookup_source<T, F>(&self, entity: &'static str, raw_id: &str, find: F) -> CopyResult<T>
    where
        F: Fn(&str) -> anyhow::Result<Option<T>>,
    {
        let clean = strip_trailing_suffix(raw_id);
        if let Some(row) = find(clean)? {
            return Ok(row);
        }
        if clean != raw_id {
            if let Some(row) = find(raw_id)? {
                return Ok(row);
            }
        }
        Err(CopyError::not_found(entity, raw_id))
    }

    /// Prefers the suffixed original owner when it already exists
    pub(crate) fn resolve_owner(
        &self,
        original_owner_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<String> {
        if let Some(mapped) = self.maps.nodes.get(original_owner_id) {
            if self.store.find_node(mapped)?.is_some() {
                return Ok(mapped.clone());
            }
        }
        let candidate = apply_once(original_owner_id, &self.suffix);
        if self.store.find_node(&candidate)?.is_some() {
            return Ok(candidate);
        }
        Ok(target_owner_id.to_string())
    }

    /// Reserves the new id and marks the capacity in progress
    fn reserve(&mut self, reference: &CapacityRef, new_id: &str) {
        self.maps
            .get_mut(ref_target(reference))
            .insert(reference.id().to_string(), new_id.to_string());
        self.in_progress.insert(reference.clone());
    }

    /// Clears the in-progress mark, dropping the reservation on failure
    fn release<T>(&mut self, reference: &CapacityRef, result: &CopyResult<T>) {
        self.in_progress.remove(reference);
        if result.is_err() {
            self.maps.get_mut(ref_target(reference)).remove(reference.id());
        }
    }

    /// Copies nested capacities before the payload that references them.
    ///
    /// A failed dependency is recorded and the parent carries on; its
    /// reference then falls back to plain suffixing.
    fn copy_dependencies(
        &mut self,
        parent: &CapacityRef,
        nested: BTreeSet<CapacityRef>,
        owner_id: &str,
    ) {
        for reference in nested {
            if reference == *parent {
                continue;
            }
            if let Err(err) = self.try_copy_capacity(&reference, owner_id) {
                self.record_dependency_failure(parent.id(), &reference.to_string(), &err);
            }
        }
    }

    pub(crate) fn record_dependency_failure(
        &mut self,
        parent_id: &str,
        reference: &str,
        err: &CopyError,
    ) {
        self.sink.emit(CopyEvent::DependencyCopyFailed {
            parent_id: parent_id.to_string(),
            reference: reference.to_string(),
            reason: err.to_string(),
        });
        self.failures.push(CopyFailure {
            reference: reference.to_string(),
            reason: err.to_string(),
        });
    }

    /// Links a fresh capacity into the nodes it references
    fn link_new_capacity(&mut self, reference: &CapacityRef, owner_id: &str) {
        if let Err(err) = self.links().link_capacity(reference) {
            self.sink.emit(CopyEvent::LinkMaintenanceFailed {
                node_id: owner_id.to_string(),
                field: reference.kind().linked_field(),
                reason: err.to_string(),
            });
        }
    }

    /// Adds the copy to its owner's link index and moves the owner's active
    /// pointer when it pointed at the source
    fn attach_to_owner(&self, kind: CapacityKind, owner_id: &str, source_id: &str, new_id: &str) {
        let field = kind.linked_field();
        self.links().add_ids_best_effort(owner_id, field, &[new_id.to_string()]);

        if let Err(err) = self.point_owner_at(kind, owner_id, source_id, new_id) {
            self.sink.emit(CopyEvent::LinkMaintenanceFailed {
                node_id: owner_id.to_string(),
                field,
                reason: err.to_string(),
            });
        }
    }

    fn point_owner_at(
        &self,
        kind: CapacityKind,
        owner_id: &str,
        source_id: &str,
        new_id: &str,
    ) -> anyhow::Result<()> {
        let Some(mut owner) = self.store.find_node(owner_id)? else {
            return Ok(());
        };
        let before = owner.clone();
        let (active, flag) = match kind {
            CapacityKind::Formula => (Some(&mut owner.formula_active_id), &mut owner.has_formula),
            CapacityKind::Condition => {
                (Some(&mut owner.condition_active_id), &mut owner.has_condition)
            }
            CapacityKind::Table => (Some(&mut owner.table_active_id), &mut owner.has_table),
            CapacityKind::Variable => (None, &mut owner.has_data),
        };
        *flag = true;
        if let Some(active) = active {
            if active.as_deref() == Some(source_id) {
                *active = Some(new_id.to_string());
            }
        }
        if owner != before {
            self.store.update_node(&owner)?;
        }
        Ok(())
    }

    fn record_display_node(&mut self, node_id: &str) {
        if !self.display_node_ids.iter().any(|id| id == node_id) {
            self.display_node_ids.push(node_id.to_string());
        }
    }

    pub(crate) fn emit_copied(&self, kind: CapacityKind, source_id: &str, copy: &CapacityCopy) {
        self.sink.emit(CopyEvent::CapacityCopied {
            kind,
            source_id: source_id.to_string(),
            new_id: copy.new_id.clone(),
            owner_id: copy.owner_id.clone(),
        });
    }
}

fn ref_target(reference: &CapacityRef) -> RefTarget {
    match reference {
        CapacityRef::Formula(_) => RefTarget::Formula,
        CapacityRef::Condition(_) => RefTarget::Condition,
        CapacityRef::Table(_) => RefTarget::Table,
    }
}

fn rebuild_ref(reference: &CapacityRef, id: &str) -> CapacityRef {
    match reference {
        CapacityRef::Formula(_) => CapacityRef::Formula(id.to_string()),
        CapacityRef::Condition(_) => CapacityRef::Condition(id.to_string()),
        CapacityRef::Table(_) => CapacityRef::Table(id.to_string()),
    }
}

/// Turns an insert collision into [`CopyError::ConflictOnCreate`]
pub(crate) fn store_error(err: anyhow::Error) -> CopyError {
    match err.downcast_ref::<StoreConflict>() {
        Some(conflict) => CopyError::ConflictOnCreate {
            entity: conflict.entity,
            key: conflict.key.clone(),
        },
        None => CopyError::Store(err),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::db::TreeBackend;
    use crate::events::RecordingSink;
    use crate::models::{Condition, Formula, LinkedField};
    use serde_json::json;

    #[test]
    fn test_resolve_owner_prefers_suffixed_original() {
        let backend = store_with_nodes(&["N1", "N1-2", "target"]);
        let sink = RecordingSink::new();
        let coordinator = CopyCoordinator::new(&backend, &sink, "2");

        assert_eq!(coordinator.resolve_owner("N1", "target").unwrap(), "N1-2");
        assert_eq!(coordinator.resolve_owner("N9", "target").unwrap(), "target");
    }

    #[test]
    fn test_link_failure_does_not_abort_copy() {
        let backend = RejectingNodeUpdates {
            inner: store_with_nodes(&["N1", "N2", "N1-2", "N2-2"]),
            node_id: "N2-2".into(),
        };
        backend
            .inner
            .create_formula(Formula::new("F1", "N1", json!(["@value.N2", "+", "5"])))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");
        coordinator.maps_mut().nodes.insert("N2".into(), "N2-2".into());

        let outcome = coordinator.copy_formula("F1", "N1-2");

        assert!(outcome.success());
        assert_eq!(outcome.new_id.as_deref(), Some("F1-2"));
        assert!(backend.find_formula("F1-2").unwrap().is_some());
        assert_eq!(backend.find_node("N1-2").unwrap().unwrap().linked_formula_ids, vec!["F1-2"]);
        assert!(backend.find_node("N2-2").unwrap().unwrap().linked_formula_ids.is_empty());

        let failures: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, CopyEvent::LinkMaintenanceFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            CopyEvent::LinkMaintenanceFailed { node_id, field, .. } => {
                assert_eq!(node_id, "N2-2");
                assert_eq!(*field, LinkedField::Formula);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_at_most_one_copy_per_pass() {
        let backend = store_with_nodes(&["N1", "N1-2"]);
        backend
            .create_formula(Formula::new("F1", "N1", json!(["1", "+", "2"])))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");

        let first = coordinator.copy_formula("F1", "N1-2");
        let second = coordinator.copy_formula("F1", "N1-2");

        assert!(first.success());
        assert_eq!(first.new_id, second.new_id);
        assert_eq!(first.new_id.as_deref(), Some("F1-2"));
        assert_eq!(backend.find_formulas("N1-2").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_capacity_is_reported_not_raised() {
        let backend = store_with_nodes(&["N1"]);
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");

        let outcome = coordinator.copy_condition("nope", "N1");
        assert!(!outcome.success());
        assert_eq!(outcome.new_id, None);
        assert!(outcome.error.unwrap().contains("Condition not found: nope"));
    }

    #[test]
    fn test_mutual_recursion_terminates() {
        let backend = store_with_nodes(&["N1", "N1-2"]);
        backend
            .create_formula(Formula::new("F1", "N1", json!(["@value.condition:C1", "+", "1"])))
            .unwrap();
        backend
            .create_condition(Condition::new(
                "C1",
                "N1",
                json!({"branches": [{"when": {"ref": "@value.node-formula:F1"}, "actions": []}]}),
            ))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");

        let outcome = coordinator.copy_formula("F1", "N1-2");
        assert!(outcome.success());

        let formula = backend.find_formula("F1-2").unwrap().unwrap();
        assert_eq!(formula.tokens, json!(["@value.condition:C1-2", "+", "1"]));
        let condition = backend.find_condition("C1-2").unwrap().unwrap();
        assert_eq!(
            condition.condition_set["branches"][0]["when"]["ref"],
            json!("@value.node-formula:F1-2")
        );
        assert_eq!(sink.count_where(|e| matches!(e, CopyEvent::CycleGuarded { .. })), 1);
    }

    #[test]
    fn test_store_error_maps_conflicts() {
        let err: anyhow::Error = StoreConflict {
            entity: "Variable",
            key: "width".into(),
        }
        .into();
        assert!(matches!(store_error(err), CopyError::ConflictOnCreate { entity: "Variable", .. }));
        assert!(matches!(store_error(anyhow::anyhow!("io")), CopyError::Store(_)));
    }
}
