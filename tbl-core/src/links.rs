//! Link index maintenance
//!
//! Nodes carry `linkedFormulaIds`, `linkedConditionIds`, `linkedTableIds` and
//! `linkedVariableIds`, recording which capacities reference them. These
//! indexes are best-effort: a failed update is reported as an event and never
//! aborts the caller.

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};

use crate::db::TreeBackend;
use crate::events::{CopyEvent, EventSink};
use crate::models::{CapacityKind, CapacityRef, LinkedField, Table};
use crate::rewrite::{collect_capacity_refs, collect_node_refs};

/// References found directly in one payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadRefs {
    pub node_ids: BTreeSet<String>,
    pub capacity_refs: BTreeSet<CapacityRef>,
}

/// The JSON scanned for a table: meta, rows and columns together
pub fn table_payload(table: &Table) -> Value {
    json!({
        "meta": table.meta,
        "rows": table.rows,
        "columns": table.columns,
    })
}

/// Formula tokens are sometimes stored as a JSON-encoded string
fn decoded_tokens(tokens: &Value) -> Value {
    match tokens {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| tokens.clone()),
        other => other.clone(),
    }
}

fn collect_action_node_ids(actions: Option<&Value>, refs: &mut PayloadRefs) {
    let Some(Value::Array(actions)) = actions else {
        return;
    };
    for action in actions {
        let Some(Value::Array(node_ids)) = action.get("nodeIds") else {
            continue;
        };
        for id in node_ids.iter().filter_map(Value::as_str) {
            match CapacityRef::parse(id) {
                Some(reference) => {
                    refs.capacity_refs.insert(reference);
                }
                None if !id.is_empty() => {
                    refs.node_ids.insert(id.to_string());
                }
                None => {}
            }
        }
    }
}

/// Node ids and nested capacity references a payload mentions directly
pub fn direct_references(kind: CapacityKind, payload: &Value) -> PayloadRefs {
    let payload = match kind {
        CapacityKind::Formula => decoded_tokens(payload),
        _ => payload.clone(),
    };
    let mut refs = PayloadRefs {
        node_ids: collect_node_refs(&payload),
        capacity_refs: collect_capacity_refs(&payload),
    };

    match kind {
        CapacityKind::Condition => {
            if let Some(Value::Array(branches)) = payload.get("branches") {
                for branch in branches {
                    collect_action_node_ids(branch.get("actions"), &mut refs);
                }
            }
            if let Some(fallback) = payload.get("fallback") {
                collect_action_node_ids(fallback.get("actions"), &mut refs);
            }
        }
        CapacityKind::Formula => {
            if let Value::Array(tokens) = &payload {
                for token in tokens {
                    let field = match token.get("type").and_then(Value::as_str) {
                        Some("field") => token.get("fieldId"),
                        Some("nodeValue") => token.get("nodeId"),
                        _ => None,
                    };
                    if let Some(id) = field.and_then(Value::as_str).filter(|id| !id.is_empty()) {
                        refs.node_ids.insert(id.to_string());
                    }
                }
            }
        }
        CapacityKind::Table | CapacityKind::Variable => {}
    }
    refs
}

/// Updates link indexes through a [`TreeBackend`]
pub struct LinkIndexMaintainer<'a> {
    store: &'a dyn TreeBackend,
    sink: &'a dyn EventSink,
}

impl<'a> LinkIndexMaintainer<'a> {
    pub fn new(store: &'a dyn TreeBackend, sink: &'a dyn EventSink) -> Self {
        Self { store, sink }
    }

    /// Unions `ids` into a link index, keeping first-occurrence order.
    ///
    /// Returns `false` when the node is missing or nothing changed.
    pub fn add_ids(&self, node_id: &str, field: LinkedField, ids: &[String]) -> Result<bool> {
        let Some(mut node) = self.store.find_node(node_id)? else {
            return Ok(false);
        };

        let current = node.linked(field).clone();
        let mut seen = HashSet::new();
        let merged: Vec<String> = current
            .iter()
            .chain(ids.iter())
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect();
        if merged == current {
            return Ok(false);
        }

        let added: Vec<String> = merged
            .iter()
            .filter(|id| !current.contains(id))
            .cloned()
            .collect();
        *node.linked_mut(field) = merged;
        self.store.update_node(&node)?;
        self.sink.emit(CopyEvent::LinkAdded {
            node_id: node_id.to_string(),
            field,
            ids: added,
        });
        Ok(true)
    }

    /// Removes `ids` from a link index
    pub fn remove_ids(&self, node_id: &str, field: LinkedField, ids: &[String]) -> Result<bool> {
        let Some(mut node) = self.store.find_node(node_id)? else {
            return Ok(false);
        };
        let list = node.linked_mut(field);
        let before = list.len();
        list.retain(|id| !ids.contains(id));
        if list.len() == before {
            return Ok(false);
        }
        self.store.update_node(&node)?;
        Ok(true)
    }

    /// Adds ids and reports a failure as an event instead of an error
    pub fn add_ids_best_effort(&self, node_id: &str, field: LinkedField, ids: &[String]) -> bool {
        match self.add_ids(node_id, field, ids) {
            Ok(changed) => changed,
            Err(err) => {
                self.sink.emit(CopyEvent::LinkMaintenanceFailed {
                    node_id: node_id.to_string(),
                    field,
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    fn load_payload(&self, reference: &CapacityRef) -> Result<Option<Value>> {
        Ok(match reference {
            CapacityRef::Formula(id) => self.store.find_formula(id)?.map(|f| f.tokens),
            CapacityRef::Condition(id) => self.store.find_condition(id)?.map(|c| c.condition_set),
            CapacityRef::Table(id) => self.store.find_table(id)?.map(|t| table_payload(&t)),
        })
    }

    /// Node ids reachable from a capacity, following nested capacity references.
    ///
    /// `visited` guards against cyclic capacity graphs.
    pub fn gather_node_ids(
        &self,
        reference: &CapacityRef,
        visited: &mut HashSet<CapacityRef>,
    ) -> Result<BTreeSet<String>> {
        if !visited.insert(reference.clone()) {
            return Ok(BTreeSet::new());
        }
        let Some(payload) = self.load_payload(reference)? else {
            return Ok(BTreeSet::new());
        };
        self.closure_of(reference.kind(), &payload, visited)
    }

    fn closure_of(
        &self,
        kind: CapacityKind,
        payload: &Value,
        visited: &mut HashSet<CapacityRef>,
    ) -> Result<BTreeSet<String>> {
        let refs = direct_references(kind, payload);
        let mut ids = refs.node_ids;
        for nested in &refs.capacity_refs {
            ids.extend(self.gather_node_ids(nested, visited)?);
        }
        Ok(ids)
    }

    /// Transitive node-id closure of a payload of the given kind
    pub fn extract_referenced_node_ids(
        &self,
        kind: CapacityKind,
        payload: &Value,
    ) -> Result<BTreeSet<String>> {
        self.closure_of(kind, payload, &mut HashSet::new())
    }

    /// Links a capacity id into every node of its transitive closure.
    ///
    /// Tables are never linked into pure input nodes. Returns the nodes whose
    /// index changed.
    pub fn link_capacity(&self, reference: &CapacityRef) -> Result<Vec<String>> {
        let node_ids = self.gather_node_ids(reference, &mut HashSet::new())?;
        let field = reference.kind().linked_field();
        let id = [reference.id().to_string()];

        let mut linked = Vec::new();
        for node_id in node_ids {
            if reference.kind() == CapacityKind::Table {
                match self.store.find_node(&node_id) {
                    Ok(Some(node)) if !node.is_input_field() => {}
                    _ => continue,
                }
            }
            if self.add_ids_best_effort(&node_id, field, &id) {
                linked.push(node_id);
            }
        }
        Ok(linked)
    }

    /// Removes a capacity id from every node of its closure
    pub fn unlink_capacity(&self, reference: &CapacityRef) -> Result<Vec<String>> {
        let node_ids = self.gather_node_ids(reference, &mut HashSet::new())?;
        let field = reference.kind().linked_field();
        let id = [reference.id().to_string()];

        let mut unlinked = Vec::new();
        for node_id in node_ids {
            if self.remove_ids(&node_id, field, &id)? {
                unlinked.push(node_id);
            }
        }
        Ok(unlinked)
    }

    /// Links a variable into every node its `sourceRef` reaches
    pub fn link_variable_to_capacity_nodes(
        &self,
        variable_id: &str,
        source_ref: &str,
    ) -> Result<Vec<String>> {
        let node_ids = match CapacityRef::parse(source_ref) {
            Some(reference) => self.gather_node_ids(&reference, &mut HashSet::new())?,
            None => {
                let field_id = source_ref.trim().trim_start_matches("@value.");
                BTreeSet::from_iter((!field_id.is_empty()).then(|| field_id.to_string()))
            }
        };

        let id = [variable_id.to_string()];
        Ok(node_ids
            .into_iter()
            .filter(|node_id| self.add_ids_best_effort(node_id, LinkedField::Variable, &id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;
    use crate::events::RecordingSink;
    use crate::models::{Condition, Formula, Node, TreeStore};

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn store_with_nodes(node_ids: &[&str]) -> MemoryBackend {
        let mut store = TreeStore::new();
        for id in node_ids {
            let mut node = Node::new(*id, "t1", None);
            node.field_type = Some("NUMBER".into());
            store.nodes.push(node);
        }
        MemoryBackend::from_store(store)
    }

    #[test]
    fn test_add_ids_unions_in_order() {
        let backend = store_with_nodes(&["n1"]);
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);

        assert!(links
            .add_ids("n1", LinkedField::Formula, &["f1".into(), "f2".into()])
            .unwrap());
        assert!(links
            .add_ids("n1", LinkedField::Formula, &["f2".into(), "f3".into(), "f1".into()])
            .unwrap());
        assert!(!links.add_ids("n1", LinkedField::Formula, &["f3".into()]).unwrap());
        assert!(!links.add_ids("missing", LinkedField::Formula, &["f3".into()]).unwrap());

        let node = backend.find_node("n1").unwrap().unwrap();
        assert_eq!(node.linked_formula_ids, vec!["f1", "f2", "f3"]);
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn test_remove_ids() {
        let backend = store_with_nodes(&["n1"]);
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);

        links
            .add_ids("n1", LinkedField::Table, &["t1".into(), "t2".into()])
            .unwrap();
        assert!(links.remove_ids("n1", LinkedField::Table, &["t1".into()]).unwrap());
        assert!(!links.remove_ids("n1", LinkedField::Table, &["t9".into()]).unwrap());
        assert_eq!(backend.find_node("n1").unwrap().unwrap().linked_table_ids, vec!["t2"]);
    }

    #[test]
    fn test_direct_condition_references() {
        let payload = json!({
            "branches": [{
                "id": "b_1",
                "when": {"left": {"ref": "@value.A"}},
                "actions": [{"type": "SHOW", "nodeIds": ["B", "node-formula:f1"]}]
            }],
            "fallback": {"actions": [{"nodeIds": ["D"]}]}
        });
        let refs = direct_references(CapacityKind::Condition, &payload);
        assert_eq!(refs.node_ids, ids(&["A", "B", "D"]));
        assert_eq!(refs.capacity_refs, BTreeSet::from([CapacityRef::Formula("f1".into())]));
    }

    #[test]
    fn test_direct_formula_references() {
        let tokens = json!([
            {"type": "field", "fieldId": "F"},
            {"type": "nodeValue", "nodeId": "G"},
            "+",
            "@value.H"
        ]);
        let refs = direct_references(CapacityKind::Formula, &tokens);
        assert_eq!(refs.node_ids, ids(&["F", "G", "H"]));

        let encoded = Value::String(tokens.to_string());
        assert_eq!(
            direct_references(CapacityKind::Formula, &encoded).node_ids,
            ids(&["F", "G", "H"])
        );
    }

    #[test]
    fn test_transitive_closure_through_nested_capacity() {
        let backend = store_with_nodes(&["A", "B", "C", "owner"]);
        backend
            .create_formula(Formula::new("f1", "owner", json!(["@value.C", "*", "2"])))
            .unwrap();
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);

        let payload = json!({
            "branches": [{
                "when": {"left": {"ref": "@value.A"}, "right": {"ref": "@value.node-formula:f1"}},
                "actions": [{"nodeIds": ["B"]}]
            }]
        });
        let closure = links.extract_referenced_node_ids(CapacityKind::Condition, &payload).unwrap();
        assert_eq!(closure, ids(&["A", "B", "C"]));
    }

    #[test]
    fn test_cyclic_capacities_terminate() {
        let backend = store_with_nodes(&["X", "Y"]);
        backend
            .create_formula(Formula::new(
                "f1",
                "X",
                json!(["@value.X", "+", "@value.condition:c1"]),
            ))
            .unwrap();
        backend
            .create_condition(Condition::new(
                "c1",
                "Y",
                json!({"branches": [{
                    "when": {"ref": "@value.node-formula:f1"},
                    "actions": [{"nodeIds": ["Y"]}]
                }]}),
            ))
            .unwrap();
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);

        let linked = links.link_capacity(&CapacityRef::Formula("f1".into())).unwrap();
        assert_eq!(linked, vec!["X", "Y"]);
        assert_eq!(backend.find_node("Y").unwrap().unwrap().linked_formula_ids, vec!["f1"]);
    }

    #[test]
    fn test_table_links_skip_input_nodes() {
        let backend = store_with_nodes(&["select"]);
        backend.create_node(Node::new("input", "t1", None)).unwrap();
        let mut table = Table::new("tab", "select");
        table.meta = json!({"lookup": {"rowSource": "@value.select", "colSource": "@value.input"}});
        backend.create_table(table).unwrap();

        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);
        let linked = links.link_capacity(&CapacityRef::Table("tab".into())).unwrap();

        assert_eq!(linked, vec!["select"]);
        assert!(backend.find_node("input").unwrap().unwrap().linked_table_ids.is_empty());
    }

    #[test]
    fn test_link_variable_to_capacity_nodes() {
        let backend = store_with_nodes(&["A", "B"]);
        backend
            .create_formula(Formula::new("f1", "A", json!(["@value.A", "+", "@value.B"])))
            .unwrap();
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);

        let linked = links.link_variable_to_capacity_nodes("v1", "node-formula:f1").unwrap();
        assert_eq!(linked, vec!["A", "B"]);

        let field = links.link_variable_to_capacity_nodes("v2", "B").unwrap();
        assert_eq!(field, vec!["B"]);
        assert_eq!(backend.find_node("B").unwrap().unwrap().linked_variable_ids, vec!["v1", "v2"]);
    }

    #[test]
    fn test_unlink_capacity() {
        let backend = store_with_nodes(&["A"]);
        backend
            .create_formula(Formula::new("f1", "A", json!(["@value.A"])))
            .unwrap();
        let sink = RecordingSink::new();
        let links = LinkIndexMaintainer::new(&backend, &sink);
        let reference = CapacityRef::Formula("f1".into());

        links.link_capacity(&reference).unwrap();
        assert_eq!(links.unlink_capacity(&reference).unwrap(), vec!["A"]);
        assert!(backend.find_node("A").unwrap().unwrap().linked_formula_ids.is_empty());
    }
}
