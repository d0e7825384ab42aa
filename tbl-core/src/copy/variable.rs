use std::collections::HashSet;

use serde_json::json;

use super::{store_error, CopyCoordinator};
use crate::cloner::{build_clone_payload, CloneContext};
use crate::error::{CopyError, CopyResult};
use crate::events::CopyEvent;
use crate::models::{clone_with, CapacityRef, LinkedField, Node, NodeFilter, Variable};
use crate::suffix::{apply_once, strip_trailing_suffix};

const SHARED_REF_PREFIX: &str = "shared-ref-";

/// What a variable's `sourceRef` points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Formula,
    Condition,
    Table,
    /// A plain node value
    Field,
}

/// A parsed `sourceRef`, keeping the prefix exactly as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub id: String,
    pub prefix: String,
}

impl SourceRef {
    /// The same reference pointing at another id
    pub fn with_id(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn capacity_ref(&self) -> Option<CapacityRef> {
        let id = self.id.clone();
        match self.kind {
            SourceKind::Formula => Some(CapacityRef::Formula(id)),
            SourceKind::Condition => Some(CapacityRef::Condition(id)),
            SourceKind::Table => Some(CapacityRef::Table(id)),
            SourceKind::Field => None,
        }
    }
}

const SOURCE_PREFIXES: [(&str, SourceKind); 12] = [
    ("@value.node-formula:", SourceKind::Formula),
    ("@value.node-condition:", SourceKind::Condition),
    ("@value.condition:", SourceKind::Condition),
    ("@value.node-table:", SourceKind::Table),
    ("node-formula:", SourceKind::Formula),
    ("formula:", SourceKind::Formula),
    ("node-condition:", SourceKind::Condition),
    ("condition:", SourceKind::Condition),
    ("node-table:", SourceKind::Table),
    ("@table.", SourceKind::Table),
    ("table:", SourceKind::Table),
    ("@value.", SourceKind::Field),
];

/// Parses a `sourceRef`; anything without a known prefix is a field id
pub fn parse_source_ref(raw: &str) -> Option<SourceRef> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for (prefix, kind) in SOURCE_PREFIXES {
        if let Some(id) = raw.strip_prefix(prefix) {
            if id.is_empty() {
                return None;
            }
            return Some(SourceRef {
                kind,
                id: id.to_string(),
                prefix: prefix.to_string(),
            });
        }
    }
    Some(SourceRef {
        kind: SourceKind::Field,
        id: raw.to_string(),
        prefix: String::new(),
    })
}

impl CopyCoordinator<'_> {
    /// Copies a variable for `target_owner_id` and returns the new variable id.
    ///
    /// Unlike capacity copies, every failure here is returned as
    /// [`CopyError::FatalVariableCopy`].
    pub fn copy_variable(
        &mut self,
        source_variable_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<String> {
        self.try_copy_variable(source_variable_id, target_owner_id)
            .map_err(|err| CopyError::fatal_variable(source_variable_id, err))
    }

    fn try_copy_variable(
        &mut self,
        source_variable_id: &str,
        target_owner_id: &str,
    ) -> CopyResult<String> {
        let cache_key = format!(
            "{}|{}",
            strip_trailing_suffix(source_variable_id),
            target_owner_id
        );
        if let Some(cached) = self.variable_cache.get(&cache_key).cloned() {
            if self.store.find_variable(&cached)?.is_some() {
                return Ok(cached);
            }
            self.variable_cache.remove(&cache_key);
        }

        let store = self.store;
        let source =
            self.lookup_source("Variable", source_variable_id, |id| store.find_variable(id))?;
        let owner_id = self.variable_owner(&source, target_owner_id)?;

        let source_ref = match source.source_ref.as_deref().and_then(parse_source_ref) {
            Some(parsed) => Some(self.copy_source_ref(&source.id, &parsed, &owner_id)),
            None => source.source_ref.clone(),
        };
        let selected_node_id = source
            .selected_node_id
            .as_ref()
            .map(|id| self.maps.nodes.get(id).cloned().unwrap_or_else(|| id.clone()));

        let existing = self
            .store
            .find_variables(&owner_id)?
            .into_iter()
            .find(|v| v.id != source.id && strip_trailing_suffix(&v.id) == source.id);

        let variable = match existing {
            Some(mut reused) => {
                reused.source_ref = source_ref;
                reused.selected_node_id = selected_node_id;
                self.store.update_variable(&reused)?;
                reused
            }
            None => {
                let suffix = self.suffix.clone();
                let id = self.free_variable_id(apply_once(&source.id, &suffix))?;
                let exposed_key = self.free_exposed_key(apply_once(&source.exposed_key, &suffix))?;
                let copy = clone_with(&source, id, |v| {
                    v.node_id = owner_id.clone();
                    v.exposed_key = exposed_key;
                    v.source_ref = source_ref;
                    v.selected_node_id = selected_node_id;
                    v.display_name = source
                        .display_name
                        .as_deref()
                        .map(|name| apply_once(name, &suffix));
                });
                self.store.create_variable(copy).map_err(store_error)?
            }
        };

        self.backfill_owner(&owner_id, &source, &variable);
        if let Some(source_ref) = variable.source_ref.as_deref() {
            if let Err(err) = self
                .links()
                .link_variable_to_capacity_nodes(&variable.id, source_ref)
            {
                self.sink.emit(CopyEvent::LinkMaintenanceFailed {
                    node_id: owner_id.clone(),
                    field: LinkedField::Variable,
                    reason: err.to_string(),
                });
            }
        }

        self.variable_cache.insert(cache_key, variable.id.clone());
        self.sink.emit(CopyEvent::VariableCopied {
            source_id: source.id.clone(),
            new_id: variable.id.clone(),
            owner_id,
            exposed_key: variable.exposed_key.clone(),
        });
        Ok(variable.id)
    }

    /// Copies whatever the `sourceRef` points at and returns the rewritten ref
    fn copy_source_ref(&mut self, variable_id: &str, parsed: &SourceRef, owner_id: &str) -> String {
        if let Some(reference) = parsed.capacity_ref() {
            return match self.try_copy_capacity(&reference, owner_id) {
                Ok(copy) => parsed.with_id(&copy.new_id),
                Err(err) => {
                    self.record_dependency_failure(variable_id, &reference.to_string(), &err);
                    parsed.with_id(&apply_once(&parsed.id, &self.suffix))
                }
            };
        }

        let clean = strip_trailing_suffix(&parsed.id);
        if let Some(mapped) = self.maps.nodes.get(clean) {
            parsed.with_id(mapped)
        } else if parsed.id.starts_with(SHARED_REF_PREFIX) {
            parsed.with_id(&parsed.id)
        } else {
            parsed.with_id(&apply_once(&parsed.id, &self.suffix))
        }
    }

    fn free_variable_id(&mut self, wanted: String) -> CopyResult<String> {
        if self.store.find_variable(&wanted)?.is_none() {
            return Ok(wanted);
        }
        let store = self.store;
        let resolved = self
            .counter
            .disambiguate("Variable", &wanted, |candidate| {
                Ok(store.find_variable(candidate)?.is_some())
            })?;
        self.sink.emit(CopyEvent::ConflictResolved {
            entity: "Variable",
            key: wanted,
            resolved: resolved.clone(),
        });
        Ok(resolved)
    }

    fn free_exposed_key(&mut self, wanted: String) -> CopyResult<String> {
        if self.store.find_variable_by_exposed_key(&wanted)?.is_none() {
            return Ok(wanted);
        }
        let store = self.store;
        let resolved = self.counter.disambiguate("exposedKey", &wanted, |candidate| {
            Ok(store.find_variable_by_exposed_key(candidate)?.is_some())
        })?;
        self.sink.emit(CopyEvent::ConflictResolved {
            entity: "exposedKey",
            key: wanted,
            resolved: resolved.clone(),
        });
        Ok(resolved)
    }

    /// Points the owner's data fields at the copied variable
    fn backfill_owner(&self, owner_id: &str, source: &Variable, variable: &Variable) {
        if let Err(err) = self.write_owner_data(owner_id, source, variable) {
            self.sink.emit(CopyEvent::LinkMaintenanceFailed {
                node_id: owner_id.to_string(),
                field: LinkedField::Variable,
                reason: err.to_string(),
            });
        }
    }

    fn write_owner_data(
        &self,
        owner_id: &str,
        source: &Variable,
        variable: &Variable,
    ) -> anyhow::Result<()> {
        let Some(mut owner) = self.store.find_node(owner_id)? else {
            return Ok(());
        };
        // The eagerly suffixed id is stale when the variable id was disambiguated
        let stale_id = apply_once(&source.id, &self.suffix);
        owner.linked_variable_ids.retain(|id| id != &stale_id || id == &variable.id);
        if !owner.linked_variable_ids.contains(&variable.id) {
            owner.linked_variable_ids.push(variable.id.clone());
        }

        let points_elsewhere = owner
            .data_active_id
            .as_deref()
            .map_or(false, |id| id != source.id && id != stale_id && id != variable.id);
        if !points_elsewhere {
            owner.has_data = true;
            owner.data_active_id = Some(variable.id.clone());
            owner.data_exposed_key = Some(variable.exposed_key.clone());
            owner.data_display_format = variable.display_format.clone();
            owner.data_unit = variable.unit.clone();
            owner.data_precision = variable.precision;
            owner.data_visible_to_user = variable.visible_to_user;
        }
        if owner.metadata.get("autoCreatedDisplayNode") == Some(&json!(true)) {
            owner.metadata.insert("fromVariableId".into(), json!(variable.id));
        }
        self.store.update_node(&owner)
    }

    // ========================================================================
    // Display nodes
    // ========================================================================

    /// The node the copied variable belongs to
    fn variable_owner(&mut self, source: &Variable, target_owner_id: &str) -> CopyResult<String> {
        if let Some(mapped) = self.maps.nodes.get(&source.node_id) {
            if self.store.find_node(mapped)?.is_some() {
                return Ok(mapped.clone());
            }
        }
        if self.options.create_display_nodes {
            if let Some(display_id) = self.ensure_display_node(source, target_owner_id)? {
                return Ok(display_id);
            }
        }
        self.resolve_owner(&source.node_id, target_owner_id)
    }

    /// Nodes that only link the variable and so can never display it: the
    /// nodes linking the original, their copies, and repeater templates
    fn template_node_ids(&self, source: &Variable, tree_id: &str) -> CopyResult<HashSet<String>> {
        let mut templates: HashSet<String> = self
            .store
            .find_nodes(&NodeFilter::linking_variable(source.id.as_str()))?
            .into_iter()
            .map(|node| node.id)
            .filter(|id| id != &source.node_id)
            .collect();
        let mut copies: Vec<String> = Vec::new();
        for node in self.store.find_nodes(&NodeFilter::in_tree(tree_id))? {
            if node
                .metadata_str("copiedFromNodeId")
                .map_or(false, |id| templates.contains(id))
            {
                copies.push(node.id.clone());
            }
            copies.extend(node.repeater_template_node_ids);
        }
        templates.extend(copies);
        Ok(templates)
    }

    /// Finds or synthesizes the display node for the copy of `source`.
    ///
    /// Returns `None` when the original owner no longer exists.
    fn ensure_display_node(
        &mut self,
        source: &Variable,
        target_owner_id: &str,
    ) -> CopyResult<Option<String>> {
        let copy_id = apply_once(&source.id, &self.suffix);
        if let Some(node) = self
            .store
            .find_nodes(&NodeFilter::displaying_variable(copy_id.as_str()))?
            .into_iter()
            .next()
        {
            return Ok(Some(node.id));
        }

        let Some(original_owner) = self.store.find_node(&source.node_id)? else {
            return Ok(None);
        };
        let templates = self.template_node_ids(source, &original_owner.tree_id)?;
        if let Some(node) = self
            .store
            .find_nodes(&NodeFilter::linking_variable(copy_id.as_str()))?
            .into_iter()
            .find(|node| !templates.contains(&node.id))
        {
            return Ok(Some(node.id));
        }

        let display_source = self
            .store
            .find_nodes(&NodeFilter::displaying_variable(source.id.as_str()))?
            .into_iter()
            .find(|node| !templates.contains(&node.id))
            .unwrap_or(original_owner);
        let display_id =
            self.create_display_node(source, &copy_id, &display_source, target_owner_id)?;
        Ok(Some(display_id))
    }

    fn create_display_node(
        &mut self,
        source: &Variable,
        copy_id: &str,
        display_source: &Node,
        target_owner_id: &str,
    ) -> CopyResult<String> {
        let display_id = apply_once(&display_source.id, &self.suffix);
        let mapped_parent = display_source
            .parent_id
            .as_ref()
            .and_then(|parent| self.maps.nodes.get(parent).cloned());
        let source_parent = match display_source.parent_id.as_deref() {
            Some(parent) => self.store.find_node(parent)?.map(|node| node.id),
            None => None,
        };
        let parent_id = match mapped_parent.or(source_parent) {
            Some(parent) => Some(parent),
            None => self
                .store
                .find_node(target_owner_id)?
                .and_then(|target| target.parent_id),
        };

        let ctx = CloneContext {
            suffix: &self.suffix,
            preserve_shared_references: self.options.preserve_shared_references,
        };
        let mut node = build_clone_payload(
            display_source,
            &display_id,
            parent_id.as_deref(),
            &self.maps,
            &ctx,
        );
        node.linked_variable_ids.clear();
        node.metadata.insert("fromVariableId".into(), json!(copy_id));
        node.metadata.insert("autoCreatedDisplayNode".into(), json!(true));

        match self.store.find_node(&display_id)? {
            Some(_) => self.store.update_node(&node)?,
            None => {
                self.store.create_node(node).map_err(store_error)?;
            }
        }
        self.maps
            .nodes
            .entry(display_source.id.clone())
            .or_insert_with(|| display_id.clone());
        self.record_display_node(&display_id);
        self.sink.emit(CopyEvent::DisplayNodeCreated {
            variable_id: source.id.clone(),
            node_id: display_id.clone(),
            template_id: display_source.id.clone(),
        });

        self.copy_display_capacities(&display_source.id, &display_id)?;
        Ok(display_id)
    }

    /// Copies the display source's own formulas, conditions and tables
    fn copy_display_capacities(
        &mut self,
        display_source_id: &str,
        display_id: &str,
    ) -> CopyResult<()> {
        let mut references: Vec<CapacityRef> = Vec::new();
        references.extend(
            self.store
                .find_formulas(display_source_id)?
                .into_iter()
                .map(|f| CapacityRef::Formula(f.id)),
        );
        references.extend(
            self.store
                .find_conditions(display_source_id)?
                .into_iter()
                .map(|c| CapacityRef::Condition(c.id)),
        );
        references.extend(
            self.store
                .find_tables(display_source_id)?
                .into_iter()
                .map(|t| CapacityRef::Table(t.id)),
        );

        for reference in references {
            if let Err(err) = self.try_copy_capacity(&reference, display_id) {
                self.record_dependency_failure(display_id, &reference.to_string(), &err);
            }
        }
        Ok(())
    }
}
