//! Builds the payload of a duplicated node
//!
//! Every field is copied verbatim through [`clone_with`], then a fixed set of
//! overrides is applied. `repeater_templateNodeIds` is never touched: it keeps
//! pointing at the original template nodes.

use serde_json::{json, Map, Value};

use crate::models::{clone_with, Node};
use crate::rewrite::{rewrite_str, rewrite_value, RewriteMaps};
use crate::suffix::apply_once;

const SHARED_REF_PREFIX: &str = "shared-ref-";

/// Per-pass settings used while cloning nodes
#[derive(Debug, Clone, Copy)]
pub struct CloneContext<'a> {
    pub suffix: &'a str,
    pub preserve_shared_references: bool,
}

/// Suffixes `table_instances` keys and the `tableId` inside each entry.
///
/// Instances stored as a JSON-encoded string are decoded first; anything that
/// is not an object is returned unchanged.
pub fn suffix_table_instances(instances: &Value, suffix: &str) -> Value {
    let decoded = match instances {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(_) => return instances.clone(),
        },
        other => other.clone(),
    };
    let Value::Object(entries) = decoded else {
        return instances.clone();
    };

    let mut out = Map::with_capacity(entries.len());
    for (key, mut entry) in entries {
        if let Some(table_id) = entry.get("tableId").and_then(Value::as_str).map(str::to_string) {
            entry["tableId"] = json!(apply_once(&table_id, suffix));
        }
        out.insert(apply_once(&key, suffix), entry);
    }
    Value::Object(out)
}

/// Rewrites the JSON blobs of a node (`select_*`, `link_params`).
///
/// Runs without a suffix so references outside the copied set stay as they
/// are. Returns true when anything changed.
pub fn rewrite_node_blobs(node: &mut Node, maps: &RewriteMaps) -> bool {
    let select_source = node.select_source.as_deref().map(|s| rewrite_str(s, maps, None));
    let select_options = node.select_options.as_ref().map(|v| rewrite_value(v, maps, None));
    let link_params = node.link_params.as_ref().map(|v| rewrite_value(v, maps, None));

    let changed = select_source != node.select_source
        || select_options != node.select_options
        || link_params != node.link_params;
    node.select_source = select_source;
    node.select_options = select_options;
    node.link_params = link_params;
    changed
}

/// Builds the duplicate of `old` under `new_parent_id`
pub fn build_clone_payload(
    old: &Node,
    new_id: &str,
    new_parent_id: Option<&str>,
    maps: &RewriteMaps,
    ctx: &CloneContext<'_>,
) -> Node {
    let suffix = ctx.suffix;
    clone_with(old, new_id, |node| {
        node.parent_id = new_parent_id.map(str::to_string);
        node.label = old.label.as_deref().map(|label| apply_once(label, suffix));

        node.metadata.insert("copiedFromNodeId".into(), json!(old.id));
        node.metadata.insert("copySuffix".into(), json!(suffix));

        if old.has_formula || old.has_condition || old.has_table {
            node.calculated_value = None;
        }

        node.link_target_node_id = old
            .link_target_node_id
            .as_ref()
            .map(|id| maps.nodes.get(id).cloned().unwrap_or_else(|| id.clone()));
        rewrite_node_blobs(node, maps);

        node.table_instances = old
            .table_instances
            .as_ref()
            .map(|instances| suffix_table_instances(instances, suffix));
        node.table_active_id = old.table_active_id.as_deref().map(|id| apply_once(id, suffix));

        // Real capacity ids are reconciled once the capacities are copied
        node.linked_table_ids = old
            .linked_table_ids
            .iter()
            .map(|id| apply_once(id, suffix))
            .collect();
        node.linked_variable_ids = old
            .linked_variable_ids
            .iter()
            .map(|id| {
                if id.starts_with(SHARED_REF_PREFIX) {
                    id.clone()
                } else {
                    apply_once(id, suffix)
                }
            })
            .collect();
        node.linked_formula_ids.clear();
        node.linked_condition_ids.clear();
        node.data_active_id = None;

        if !ctx.preserve_shared_references {
            node.is_shared_reference = false;
            node.shared_reference_id = None;
            node.shared_reference_ids.clear();
            node.shared_reference_name = None;
        }
    })
}
