//! Deep copy of a node subtree
//!
//! One call to [`deep_copy`] is one duplication pass. The pass walks the
//! subtree under the root, creates every node parents-first, copies the
//! formulas, conditions and tables each node owns, copies the variables it
//! links, and finally synchronizes data pointers and node blobs against the
//! complete id maps.
//!
//! [`deep_copy`] writes straight into the given backend and leaves whatever it
//! created when it fails. [`deep_copy_atomically`] runs the same pass against
//! an in-memory copy of the store and saves it back only on success.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::cloner::{build_clone_payload, rewrite_node_blobs, CloneContext};
use crate::copy::{store_error, CoordinatorOptions, CopyCoordinator, CopyFailure};
use crate::db::{MemoryBackend, TreeBackend};
use crate::error::{CopyError, CopyResult};
use crate::events::{CopyEvent, EventSink};
use crate::models::{CapacityRef, Node, NodeFilter};
use crate::rewrite::RewriteMaps;
use crate::suffix::{apply_once, derive_next_suffix, strip_trailing_suffix};
use crate::walker::{collect_subtree_ids, order_creation};

const SHARED_REF_PREFIX: &str = "shared-ref-";

/// Where the copy of the root node is attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RootParent {
    /// Resolved like any other external parent
    #[default]
    Source,
    Under(String),
    TopLevel,
}

#[derive(Debug, Clone)]
pub struct DeepCopyOptions {
    /// Explicit suffix; derived from existing copies of the root when absent
    pub suffix: Option<String>,
    pub root_parent: RootParent,
    /// Clone parents outside the subtree instead of referencing them
    pub clone_external_parents: bool,
    pub preserve_shared_references: bool,
    pub create_display_nodes: bool,
}

impl Default for DeepCopyOptions {
    fn default() -> Self {
        Self {
            suffix: None,
            root_parent: RootParent::Source,
            clone_external_parents: false,
            preserve_shared_references: false,
            create_display_nodes: true,
        }
    }
}

impl DeepCopyOptions {
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: Some(suffix.into()),
            ..Default::default()
        }
    }
}

/// Old and new id of the copied root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedRoot {
    pub old_id: String,
    pub new_id: String,
}

/// Everything a finished pass produced
#[derive(Debug, Clone)]
pub struct DeepCopyResult {
    pub pass_id: Uuid,
    pub suffix: String,
    pub root: CopiedRoot,
    pub node_id_map: HashMap<String, String>,
    pub formula_id_map: HashMap<String, String>,
    pub condition_id_map: HashMap<String, String>,
    pub table_id_map: HashMap<String, String>,
    pub display_node_ids: Vec<String>,
    /// Capacity copies that failed and were recovered from
    pub failures: Vec<CopyFailure>,
}

impl DeepCopyResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Suffix for the next copy of `root`: one above the highest `{base}-{n}` in the tree
pub fn next_suffix(root: &Node, tree_nodes: &[Node]) -> String {
    let base = strip_trailing_suffix(&root.id);
    let ids: Vec<&str> = tree_nodes.iter().map(|node| node.id.as_str()).collect();
    derive_next_suffix(&ids, base).to_string()
}

/// Owned ids in declared link order, then the remaining owned ids in store order
fn linked_first(linked: &[String], owned: Vec<String>) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(owned.len());
    for id in linked {
        if owned.contains(id) && !ordered.contains(id) {
            ordered.push(id.clone());
        }
    }
    for id in owned {
        if !ordered.contains(&id) {
            ordered.push(id);
        }
    }
    ordered
}

/// Duplicates the subtree rooted at `root_id` into `store`.
///
/// A missing root and any variable copy failure abort the pass. Failed
/// formula, condition and table copies are recovered from and listed in
/// [`DeepCopyResult::failures`].
pub fn deep_copy(
    store: &dyn TreeBackend,
    sink: &dyn EventSink,
    root_id: &str,
    options: &DeepCopyOptions,
) -> CopyResult<DeepCopyResult> {
    let root = store
        .find_node(root_id)?
        .ok_or_else(|| CopyError::not_found("Node", root_id))?;
    let tree_nodes = store.find_nodes(&NodeFilter::in_tree(root.tree_id.as_str()))?;

    let suffix = match options.suffix.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(explicit) => explicit.to_string(),
        None => next_suffix(&root, &tree_nodes),
    };
    let pass_id = Uuid::new_v4();
    tracing::info!(target: "tbl::copy", %pass_id, root = %root.id, %suffix, "deep copy started");

    let ids = collect_subtree_ids(&root.id, &tree_nodes);
    let by_id: HashMap<String, Node> = tree_nodes
        .into_iter()
        .map(|node| (node.id.clone(), node))
        .collect();

    let mut maps = RewriteMaps::new();
    for id in &ids {
        maps.nodes.insert(id.clone(), apply_once(id, &suffix));
    }

    let order = order_creation(&ids, &by_id);
    if !order.is_clean() {
        sink.emit(CopyEvent::OrderingAnomaly {
            ids: order.anomalies.clone(),
        });
    }

    let coordinator_options = CoordinatorOptions {
        create_display_nodes: options.create_display_nodes,
        preserve_shared_references: options.preserve_shared_references,
    };
    let mut pass = DeepCopyPass {
        coordinator: CopyCoordinator::with_maps(
            store,
            sink,
            suffix.clone(),
            maps,
            coordinator_options,
        ),
        options,
        subtree: ids.iter().cloned().collect(),
        by_id,
        resolved_parents: HashMap::new(),
        created: Vec::new(),
    };

    for old_id in &order.ids {
        pass.create_node(old_id, old_id == &root.id)?;
    }
    for (old_id, new_id) in pass.created.clone() {
        pass.copy_capacities(&old_id, &new_id)?;
    }
    for old_id in &order.ids {
        pass.copy_variables(old_id)?;
    }
    pass.synchronize()?;

    let new_root_id = pass
        .coordinator
        .maps()
        .nodes
        .get(&root.id)
        .cloned()
        .unwrap_or_else(|| apply_once(&root.id, &suffix));
    let (maps, display_node_ids, failures) = pass.coordinator.into_parts();

    tracing::info!(
        target: "tbl::copy",
        %pass_id,
        new_root = %new_root_id,
        nodes = maps.nodes.len(),
        failures = failures.len(),
        "deep copy finished"
    );

    Ok(DeepCopyResult {
        pass_id,
        suffix,
        root: CopiedRoot {
            old_id: root.id,
            new_id: new_root_id,
        },
        node_id_map: maps.nodes,
        formula_id_map: maps.formulas,
        condition_id_map: maps.conditions,
        table_id_map: maps.tables,
        display_node_ids,
        failures,
    })
}

/// Runs [`deep_copy`] on an in-memory copy of `backend` and saves the result
/// in one write. A failed pass leaves `backend` untouched.
pub fn deep_copy_atomically(
    backend: &dyn TreeBackend,
    sink: &dyn EventSink,
    root_id: &str,
    options: &DeepCopyOptions,
) -> CopyResult<DeepCopyResult> {
    let scratch = MemoryBackend::from_store(backend.load()?);
    let result = deep_copy(&scratch, sink, root_id, options)?;
    backend.save(&scratch.snapshot()?)?;
    Ok(result)
}

// ============================================================================
// Pass state
// ============================================================================

struct DeepCopyPass<'a> {
    coordinator: CopyCoordinator<'a>,
    options: &'a DeepCopyOptions,
    /// Every node of the tree, by id
    by_id: HashMap<String, Node>,
    subtree: HashSet<String>,
    /// External parent id -> the parent its copies hang under
    resolved_parents: HashMap<String, Option<String>>,
    /// Old and new ids of every node written, in creation order
    created: Vec<(String, String)>,
}

impl DeepCopyPass<'_> {
    fn source_node(&self, id: &str) -> CopyResult<Node> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CopyError::not_found("Node", id))
    }

    fn create_node(&mut self, old_id: &str, is_root: bool) -> CopyResult<()> {
        let old = self.source_node(old_id)?;
        let new_id = self
            .coordinator
            .maps()
            .nodes
            .get(old_id)
            .cloned()
            .unwrap_or_else(|| apply_once(old_id, self.coordinator.suffix()));
        let parent_id = self.resolve_parent(&old, is_root)?;
        self.write_node(&old, &new_id, parent_id)
    }

    /// Creates the clone, or overwrites the copy left by an earlier pass
    fn write_node(
        &mut self,
        old: &Node,
        new_id: &str,
        parent_id: Option<String>,
    ) -> CopyResult<()> {
        let ctx = CloneContext {
            suffix: self.coordinator.suffix(),
            preserve_shared_references: self.options.preserve_shared_references,
        };
        let node =
            build_clone_payload(old, new_id, parent_id.as_deref(), self.coordinator.maps(), &ctx);

        let store = self.coordinator.store;
        match store.find_node(new_id)? {
            Some(_) => store.update_node(&node)?,
            None => {
                store.create_node(node).map_err(store_error)?;
            }
        }
        self.coordinator.sink.emit(CopyEvent::NodeCloned {
            source_id: old.id.clone(),
            new_id: new_id.to_string(),
            parent_id,
        });
        self.created.push((old.id.clone(), new_id.to_string()));
        Ok(())
    }

    fn resolve_parent(&mut self, old: &Node, is_root: bool) -> CopyResult<Option<String>> {
        if let Some(parent_id) = old.parent_id.as_deref() {
            if self.subtree.contains(parent_id) {
                return Ok(self.coordinator.maps().nodes.get(parent_id).cloned());
            }
        }
        if is_root {
            match &self.options.root_parent {
                RootParent::Under(parent_id) => return Ok(Some(parent_id.clone())),
                RootParent::TopLevel => return Ok(None),
                RootParent::Source => {}
            }
        }
        self.external_parent(old.parent_id.as_deref())
    }

    /// Resolves a parent outside the subtree.
    ///
    /// An existing suffixed copy of the parent is reused. Otherwise the parent
    /// is referenced as is, or cloned along with its own parent chain when
    /// `clone_external_parents` is set.
    fn external_parent(&mut self, parent_id: Option<&str>) -> CopyResult<Option<String>> {
        let Some(parent_id) = parent_id else {
            return Ok(None);
        };
        if let Some(resolved) = self.resolved_parents.get(parent_id) {
            return Ok(resolved.clone());
        }
        if self.subtree.contains(parent_id) {
            return Ok(self.coordinator.maps().nodes.get(parent_id).cloned());
        }

        let suffixed = apply_once(parent_id, self.coordinator.suffix());
        let resolved = if self.coordinator.store.find_node(&suffixed)?.is_some() {
            self.coordinator
                .maps_mut()
                .nodes
                .insert(parent_id.to_string(), suffixed.clone());
            Some(suffixed)
        } else if self.options.clone_external_parents && self.by_id.contains_key(parent_id) {
            let parent = self.source_node(parent_id)?;
            // Placeholder entry stops a corrupt parent cycle
            self.resolved_parents
                .insert(parent_id.to_string(), Some(parent_id.to_string()));
            let grandparent_id = self.external_parent(parent.parent_id.as_deref())?;
            self.coordinator
                .maps_mut()
                .nodes
                .insert(parent_id.to_string(), suffixed.clone());
            self.write_node(&parent, &suffixed, grandparent_id)?;
            Some(suffixed)
        } else {
            Some(parent_id.to_string())
        };

        self.resolved_parents.insert(parent_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Copies the formulas, conditions and tables of one created node
    fn copy_capacities(&mut self, old_id: &str, new_id: &str) -> CopyResult<()> {
        let old = self.source_node(old_id)?;
        let store = self.coordinator.store;

        let owned_formulas: Vec<String> = store
            .find_formulas(old_id)?
            .into_iter()
            .map(|f| f.id)
            .collect();
        let owned_conditions: Vec<String> = store
            .find_conditions(old_id)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let owned_tables: Vec<String> = store
            .find_tables(old_id)?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut references: Vec<CapacityRef> = Vec::new();
        references.extend(
            linked_first(&old.linked_formula_ids, owned_formulas)
                .into_iter()
                .map(CapacityRef::Formula),
        );
        references.extend(
            linked_first(&old.linked_condition_ids, owned_conditions)
                .into_iter()
                .map(CapacityRef::Condition),
        );

        // Lookup tables referenced through the active pointer or the link
        // index can belong to another node
        let mut table_ids = linked_first(&old.linked_table_ids, owned_tables);
        let extra = old.table_active_id.iter().chain(old.linked_table_ids.iter());
        for table_id in extra {
            if !table_ids.contains(table_id) && store.find_table(table_id)?.is_some() {
                table_ids.push(table_id.clone());
            }
        }
        references.extend(table_ids.into_iter().map(CapacityRef::Table));

        for reference in references {
            if let Err(err) = self.coordinator.try_copy_capacity(&reference, new_id) {
                self.coordinator
                    .record_dependency_failure(new_id, &reference.to_string(), &err);
            }
        }

        self.sync_active_pointers(&old, new_id)
    }

    /// Points the copy's formula and condition selectors at the copied capacities
    fn sync_active_pointers(&self, old: &Node, new_id: &str) -> CopyResult<()> {
        let store = self.coordinator.store;
        let Some(mut node) = store.find_node(new_id)? else {
            return Ok(());
        };
        let maps = self.coordinator.maps();
        let before = node.clone();
        if let Some(mapped) = old
            .formula_active_id
            .as_ref()
            .and_then(|id| maps.formulas.get(id))
        {
            node.formula_active_id = Some(mapped.clone());
        }
        if let Some(mapped) = old
            .condition_active_id
            .as_ref()
            .and_then(|id| maps.conditions.get(id))
        {
            node.condition_active_id = Some(mapped.clone());
        }
        if node != before {
            store.update_node(&node)?;
        }
        Ok(())
    }

    /// Copies the variables a subtree node owns or links.
    ///
    /// `linkedVariableIds` of the copy was already suffixed when the node was
    /// cloned and is not rewritten here.
    fn copy_variables(&mut self, old_id: &str) -> CopyResult<()> {
        let old = self.source_node(old_id)?;
        let Some(new_id) = self.coordinator.maps().nodes.get(old_id).cloned() else {
            return Ok(());
        };

        let mut variable_ids: Vec<String> = Vec::new();
        let linked = old.linked_variable_ids.iter().cloned();
        let owned = self.coordinator.store.find_variables(old_id)?.into_iter().map(|v| v.id);
        for id in linked.chain(owned) {
            if !id.starts_with(SHARED_REF_PREFIX) && !variable_ids.contains(&id) {
                variable_ids.push(id);
            }
        }

        for variable_id in variable_ids {
            self.coordinator.copy_variable(&variable_id, &new_id)?;
        }
        Ok(())
    }

    /// Post-pass over every node written in this pass.
    ///
    /// Nodes that own a copied variable but have no data pointer get one, and
    /// node blobs are rewritten now that every capacity map is complete.
    fn synchronize(&self) -> CopyResult<()> {
        let store = self.coordinator.store;
        let mut node_ids: Vec<String> = self
            .created
            .iter()
            .map(|(_, new_id)| new_id.clone())
            .collect();
        for display_id in self.coordinator.display_node_ids() {
            if !node_ids.contains(display_id) {
                node_ids.push(display_id.clone());
            }
        }

        for node_id in node_ids {
            let Some(mut node) = store.find_node(&node_id)? else {
                continue;
            };
            let before = node.clone();

            if node.data_active_id.is_none() {
                if let Some(variable) = store.find_variables(&node_id)?.into_iter().next() {
                    node.has_data = true;
                    node.data_active_id = Some(variable.id.clone());
                    node.data_exposed_key = Some(variable.exposed_key.clone());
                    node.data_display_format = variable.display_format.clone();
                    node.data_unit = variable.unit.clone();
                    node.data_precision = variable.precision;
                    node.data_visible_to_user = variable.visible_to_user;
                }
            }
            rewrite_node_blobs(&mut node, self.coordinator.maps());

            if node != before {
                store.update_node(&node)?;
            }
        }
        Ok(())
    }
}
