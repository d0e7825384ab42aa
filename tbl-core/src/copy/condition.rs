use std::collections::HashMap;

use serde_json::Value;

use super::{store_error, CapacityCopy, CopyCoordinator};
use crate::error::CopyResult;
use crate::links::direct_references;
use crate::models::{clone_with, CapacityKind, CapacityRef, Condition};
use crate::rewrite::{force_shared_ref_suffixes, regenerate_internal_ids, rewrite_value};
use crate::suffix::{apply_once, strip_trailing_suffix};

/// Maps plain node ids listed in `nodeIds` arrays through the node map.
///
/// Action targets are often written without any tag, so the tag rewriter
/// alone would miss ids that are not UUID, `node_*` or `shared-ref-*` shaped.
fn remap_action_targets(value: &Value, nodes: &HashMap<String, String>) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| {
                    let field = match field {
                        Value::Array(ids) if key == "nodeIds" => Value::Array(
                            ids.iter()
                                .map(|id| match id.as_str().and_then(|id| nodes.get(id)) {
                                    Some(mapped) => Value::String(mapped.clone()),
                                    None => id.clone(),
                                })
                                .collect(),
                        ),
                        other => remap_action_targets(other, nodes),
                    };
                    (key.clone(), field)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| remap_action_targets(item, nodes))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl CopyCoordinator<'_> {
    /// Copies a condition onto `target_owner_id`, nested capacities first
    pub fn try_copy_condition(
        &mut self,
        source_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<CapacityCopy> {
        let requested = CapacityRef::Condition(strip_trailing_suffix(source_id).to_string());
        if let Some(copy) = self.reuse_or_guard(&requested, target_owner_id)? {
            return Ok(copy);
        }

        let store = self.store;
        let source = self.lookup_source("Condition", source_id, |id| store.find_condition(id))?;
        let reference = CapacityRef::Condition(source.id.clone());
        let new_id = apply_once(&source.id, &self.suffix);
        let owner_id = self.resolve_owner(&source.node_id, target_owner_id)?;

        self.reserve(&reference, &new_id);
        let result = self.write_condition_copy(&source, &reference, new_id, owner_id);
        self.release(&reference, &result);
        let copy = result?;

        self.link_new_capacity(&CapacityRef::Condition(copy.new_id.clone()), &copy.owner_id);
        self.attach_to_owner(CapacityKind::Condition, &copy.owner_id, &source.id, &copy.new_id);
        self.emit_copied(CapacityKind::Condition, &source.id, &copy);
        Ok(copy)
    }

    fn write_condition_copy(
        &mut self,
        source: &Condition,
        reference: &CapacityRef,
        new_id: String,
        owner_id: String,
    ) -> CopyResult<CapacityCopy> {
        let nested =
            direct_references(CapacityKind::Condition, &source.condition_set).capacity_refs;
        self.copy_dependencies(reference, nested, &owner_id);

        let suffix = self.suffix.as_str();
        let condition_set = regenerate_internal_ids(&source.condition_set, suffix);
        let condition_set = remap_action_targets(&condition_set, &self.maps.nodes);
        let condition_set = force_shared_ref_suffixes(&condition_set, suffix, &self.maps.nodes);
        let condition_set = rewrite_value(&condition_set, &self.maps, Some(suffix));

        let copy = clone_with(source, new_id.as_str(), |condition| {
            condition.node_id = owner_id.clone();
            condition.condition_set = condition_set;
            condition.name = source.name.as_deref().map(|name| apply_once(name, suffix));
        });

        let reused = match self.store.find_condition(&copy.id)? {
            Some(_) => {
                self.store.update_condition(&copy)?;
                true
            }
            None => {
                self.store.create_condition(copy).map_err(store_error)?;
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
