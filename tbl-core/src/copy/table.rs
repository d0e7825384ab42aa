use std::collections::HashMap;

use super::{store_error, CapacityCopy, CopyCoordinator};
use crate::error::CopyResult;
use crate::models::{clone_with, CapacityKind, CapacityRef, Table, TableColumn, TableRow};
use crate::rewrite::{remap_exact_strings, rewrite_value};
use crate::suffix::{apply_once, strip_trailing_suffix};

/// `"10-1"` -> `"10"`; any other name is kept
fn normalise_numeric_name(name: &str) -> &str {
    let base = strip_trailing_suffix(name);
    if base.len() != name.len() && !base.is_empty() && base.bytes().all(|b| b.is_ascii_digit()) {
        base
    } else {
        name
    }
}

impl CopyCoordinator<'_> {
    /// Copies a table with its columns and rows onto `target_owner_id`
    pub fn try_copy_table(
        &mut self,
        source_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<CapacityCopy> {
        let requested = CapacityRef::Table(strip_trailing_suffix(source_id).to_string());
        if let Some(copy) = self.reuse_or_guard(&requested, target_owner_id)? {
            return Ok(copy);
        }

        let store = self.store;
        let source = self.lookup_source("Table", source_id, |id| store.find_table(id))?;
        let reference = CapacityRef::Table(source.id.clone());
        let new_id = apply_once(&source.id, &self.suffix);
        let owner_id = self.resolve_owner(&source.node_id, target_owner_id)?;

        self.reserve(&reference, &new_id);
        let result = self.write_table_copy(&source, new_id, owner_id);
        self.release(&reference, &result);
        let copy = result?;

        self.link_new_capacity(&CapacityRef::Table(copy.new_id.clone()), &copy.owner_id);
        self.attach_to_owner(CapacityKind::Table, &copy.owner_id, &source.id, &copy.new_id);
        self.emit_copied(CapacityKind::Table, &source.id, &copy);
        Ok(copy)
    }

    fn write_table_copy(
        &mut self,
        source: &Table,
        new_id: String,
        owner_id: String,
    ) -> CopyResult<CapacityCopy> {
        let suffix = self.suffix.as_str();
        // Column ids, row ids and renamed column names, old -> new
        let mut renames: HashMap<String, String> = HashMap::new();

        let columns: Vec<TableColumn> = source
            .columns
            .iter()
            .map(|column| {
                let id = apply_once(&column.id, suffix);
                renames.insert(column.id.clone(), id.clone());
                let name = column.name.as_deref().map(|name| {
                    let normalised = normalise_numeric_name(name);
                    if normalised != name {
                        renames.insert(name.to_string(), normalised.to_string());
                    }
                    normalised.to_string()
                });
                TableColumn {
                    id,
                    name,
                    ..column.clone()
                }
            })
            .collect();

        let rows: Vec<TableRow> = source
            .rows
            .iter()
            .map(|row| {
                let id = apply_once(&row.id, suffix);
                renames.insert(row.id.clone(), id.clone());
                TableRow { id, ..row.clone() }
            })
            .collect();

        let meta = rewrite_value(&source.meta, &self.maps, Some(suffix));
        let meta = remap_exact_strings(&meta, &renames);

        let copy = clone_with(source, new_id.as_str(), |table| {
            table.node_id = owner_id.clone();
            table.name = source.name.as_deref().map(|name| apply_once(name, suffix));
            table.meta = meta;
            table.column_count = columns.len();
            table.row_count = rows.len();
            table.columns = columns;
            table.rows = rows;
        });

        let reused = match self.store.find_table(&copy.id)? {
            Some(_) => {
                self.store.update_table(&copy)?;
                true
            }
            None => {
                self.store.create_table(copy).map_err(store_error)?;
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
    use crate::events::RecordingSink;
    use crate::models::Node;
    use serde_json::json;

    fn sample_table() -> Table {
        let mut table = Table::new("T1", "N1");
        table.name = Some("Prices".into());
        table.columns = vec![
            TableColumn {
                id: "col_a".into(),
                column_index: 0,
                name: Some("10-1".into()),
                column_type: "number".into(),
                width: None,
                format: None,
                metadata: json!({}),
            },
            TableColumn {
                id: "col_b".into(),
                column_index: 1,
                name: Some("Label".into()),
                column_type: "text".into(),
                width: Some(120),
                format: None,
                metadata: json!({}),
            },
        ];
        table.rows = vec![TableRow {
            id: "row_1".into(),
            row_index: 0,
            cells: json!(["a", 1]),
        }];
        table.meta = json!({
            "lookup": {
                "selectors": {"rowFieldId": "@value.SEL", "columnFieldId": "@value.INPUT"},
                "displayColumn": "10-1",
                "valueColumnId": "col_b"
            }
        });
        table
    }

    #[test]
    fn test_table_copy_columns_rows_and_meta() {
        let backend = store_with_nodes(&["N1", "N1-2", "SEL", "SEL-2"]);
        backend.create_node(Node::new("INPUT", "t1", None)).unwrap();
        backend.create_node(Node::new("INPUT-2", "t1", None)).unwrap();
        backend.create_table(sample_table()).unwrap();

        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");
        coordinator.maps_mut().nodes.insert("SEL".into(), "SEL-2".into());
        coordinator.maps_mut().nodes.insert("INPUT".into(), "INPUT-2".into());

        let outcome = coordinator.copy_table("T1", "N1-2");
        assert_eq!(outcome.new_id.as_deref(), Some("T1-2"));

        let copy = backend.find_table("T1-2").unwrap().unwrap();
        assert_eq!(copy.node_id, "N1-2");
        assert_eq!(copy.name.as_deref(), Some("Prices-2"));
        assert_eq!(copy.columns[0].id, "col_a-2");
        assert_eq!(copy.columns[0].name.as_deref(), Some("10"));
        assert_eq!(copy.columns[1].width, Some(120));
        assert_eq!(copy.rows[0].id, "row_1-2");
        assert_eq!(copy.rows[0].cells, json!(["a", 1]));
        assert_eq!((copy.column_count, copy.row_count), (2, 1));
        assert_eq!(
            copy.meta,
            json!({
                "lookup": {
                    "selectors": {"rowFieldId": "@value.SEL-2", "columnFieldId": "@value.INPUT-2"},
                    "displayColumn": "10",
                    "valueColumnId": "col_b-2"
                }
            })
        );

        assert_eq!(backend.find_node("SEL-2").unwrap().unwrap().linked_table_ids, vec!["T1-2"]);
        assert!(backend.find_node("INPUT-2").unwrap().unwrap().linked_table_ids.is_empty());
        let owner = backend.find_node("N1-2").unwrap().unwrap();
        assert_eq!(owner.linked_table_ids, vec!["T1-2"]);
        assert!(owner.has_table);
    }

    #[test]
    fn test_normalise_numeric_name() {
        assert_eq!(normalise_numeric_name("10-1"), "10");
        assert_eq!(normalise_numeric_name("10"), "10");
        assert_eq!(normalise_numeric_name("Width-1"), "Width-1");
    }

    #[test]
    fn test_table_active_pointer_follows_copy() {
        let backend = store_with_nodes(&["N1", "N1-2"]);
        let mut owner = backend.find_node("N1-2").unwrap().unwrap();
        owner.table_active_id = Some("T1".into());
        backend.update_node(&owner).unwrap();
        backend.create_table(Table::new("T1", "N1")).unwrap();

        let sink = RecordingSink::new();
        let mut coordinator = CopyCoordinator::new(&backend, &sink, "2");
        coordinator.try_copy_table("T1", "N1-2").unwrap();

        let owner = backend.find_node("N1-2").unwrap().unwrap();
        assert_eq!(owner.table_active_id.as_deref(), Some("T1-2"));
    }
}
