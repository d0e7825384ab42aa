use super::{store_error, CapacityCopy, CopyCoordinator};
use crate::error::CopyResult;
use crate::links::direct_references;
use crate::models::{clone_with, CapacityKind, CapacityRef, Formula};
use crate::rewrite::rewrite_value;
use crate::suffix::{apply_once, strip_trailing_suffix};

impl CopyCoordinator<'_> {
    /// Copies a formula onto `target_owner_id`, nested capacities first
    pub fn try_copy_formula(
        &mut self,
        source_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<CapacityCopy> {
        let requested = CapacityRef::Formula(strip_trailing_suffix(source_id).to_string());
        if let Some(copy) = self.reuse_or_guard(&requested, target_owner_id)? {
            return Ok(copy);
        }

        let store = self.store;
        let source = self.lookup_source("Formula", source_id, |id| store.find_formula(id))?;
        let reference = CapacityRef::Formula(source.id.clone());
        let new_id = apply_once(&source.id, &self.suffix);
        let owner_id = self.resolve_owner(&source.node_id, target_owner_id)?;

        self.reserve(&reference, &new_id);
        let result = self.write_formula_copy(&source, &reference, new_id, owner_id);
        self.release(&reference, &result);
        let copy = result?;

        self.link_new_capacity(&CapacityRef::Formula(copy.new_id.clone()), &copy.owner_id);
        self.attach_to_owner(CapacityKind::Formula, &copy.owner_id, &source.id, &copy.new_id);
        self.emit_copied(CapacityKind::Formula, &source.id, &copy);
        Ok(copy)
    }

    fn write_formula_copy(
        &mut self,
        source: &Formula,
        reference: &CapacityRef,
        new_id: String,
        owner_id: String,
    ) -> CopyResult<CapacityCopy> {
        let nested = direct_references(CapacityKind::Formula, &source.tokens).capacity_refs;
        self.copy_dependencies(reference, nested, &owner_id);

        let suffix = self.suffix.as_str();
        let tokens = rewrite_value(&source.tokens, &self.maps, Some(suffix));
        let copy = clone_with(source, new_id.as_str(), |formula| {
            formula.node_id = owner_id.clone();
            formula.tokens = tokens;
            formula.name = source.name.as_deref().map(|name| apply_once(name, suffix));
        });

        let reused = match self.store.find_formula(&copy.id)? {
            Some(_) => {
                self.store.update_formula(&copy)?;
                true
            }
            None => {
                self.store.create_formula(copy).map_err(store_error)?;
                false
            }
        };
        Ok(CapacityCopy {
            new_id,
            owner_id,
            reused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::db::TreeBackend;
    use crate::events::{CopyEvent, RecordingSink};
    use crate::models::LinkedField;
    use serde_json::json;

    #[test]
    fn test_formula_copy_rewrites_and_links() {
        let backend = store_with_nodes(&["N1", "N2", "N1-2", "N2-2"]);
        let mut owner = backend.find_node("N1").unwrap().unwrap();
        owner.formula_active_id = Some("F1".into());
        backend.update_node(&owner).unwrap();
        let mut copied_owner = backend.find_node("N1-2").unwrap().unwrap();
        copied_owner.formula_active_id = Some("F1".into());
        backend.update_node(&copied_owner).unwrap();

        let mut formula = Formula::new("F1", "N1", json!(["@value.N2", "+", "5"]));
        formula.name = Some("Total".into());
        backend.create_formula(formula).unwrap();

        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");
        coordinator.maps_mut().nodes.insert("N2".into(), "N2-2".into());

        let outcome = coordinator.copy_formula("F1", "N1-2");
        assert_eq!(outcome.new_id.as_deref(), Some("F1-2"));

        let copy = backend.find_formula("F1-2").unwrap().unwrap();
        assert_eq!(copy.node_id, "N1-2");
        assert_eq!(copy.tokens, json!(["@value.N2-2", "+", "5"]));
        assert_eq!(copy.name.as_deref(), Some("Total-2"));

        let owner = backend.find_node("N1-2").unwrap().unwrap();
        assert_eq!(owner.linked_formula_ids, vec!["F1-2"]);
        assert_eq!(owner.formula_active_id.as_deref(), Some("F1-2"));
        assert!(owner.has_formula);
        assert_eq!(
            backend.find_node("N2-2").unwrap().unwrap().linked(LinkedField::Formula),
            &vec!["F1-2".to_string()]
        );
        assert_eq!(
            sink.count_where(|e| matches!(e, CopyEvent::CapacityCopied { .. })),
            1
        );
    }

    #[test]
    fn test_formula_owner_falls_back_to_target() {
        let backend = store_with_nodes(&["N1", "elsewhere"]);
        backend
            .create_formula(Formula::new("F1", "N1", json!(["1"])))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "4");

        let outcome = coordinator.copy_formula("F1-4", "elsewhere");
        assert_eq!(outcome.new_id.as_deref(), Some("F1-4"));
        assert_eq!(backend.find_formula("F1-4").unwrap().unwrap().node_id, "elsewhere");
    }

    #[test]
    fn test_failed_dependency_falls_back_to_suffix() {
        let backend = store_with_nodes(&["N1", "N1-2"]);
        backend
            .create_formula(Formula::new(
                "F1",
                "N1",
                json!(["@value.node-formula:ghost", "*", "2"]),
            ))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");

        let outcome = coordinator.copy_formula("F1", "N1-2");
        assert!(outcome.success());
        assert_eq!(
            backend.find_formula("F1-2").unwrap().unwrap().tokens,
            json!(["@value.node-formula:ghost-2", "*", "2"])
        );
        assert_eq!(coordinator.failures().len(), 1);
        assert_eq!(
            sink.count_where(|e| matches!(e, CopyEvent::DependencyCopyFailed { .. })),
            1
        );
    }

    #[test]
    fn test_existing_copy_is_updated() {
        let backend = store_with_nodes(&["N1", "N1-1"]);
        backend
            .create_formula(Formula::new("F1", "N1", json!(["@value.N1", "+", "1"])))
            .unwrap();
        backend
            .create_formula(Formula::new("F1-1", "N1-1", json!(["stale"])))
            .unwrap();
        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "1");
        coordinator.maps_mut().nodes.insert("N1".into(), "N1-1".into());

        let copy = coordinator.try_copy_formula("F1", "N1-1").unwrap();
        assert!(copy.reused);
        assert_eq!(
            backend.find_formula("F1-1").unwrap().unwrap().tokens,
            json!(["@value.N1-1", "+", "1"])
        );
        assert_eq!(backend.find_formulas("N1-1").unwrap().len(), 1);
    }
}
