//! Database abstraction traits
//!
//! Every storage backend implements [`TreeBackend`]. The per-collection
//! operations have default implementations over `load()`/`save()`; backends
//! with cheaper row access override them.

use anyhow::Result;
use thiserror::Error;

use crate::models::{Condition, Entity, Formula, Node, NodeFilter, Table, TreeStore, Variable};

/// Types of database backends available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// In-process store, nothing persisted
    Memory,
    /// YAML file storage (single file)
    Yaml,
    /// SQLite database storage
    Sqlite,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Memory => write!(f, "Memory"),
            BackendType::Yaml => write!(f, "YAML"),
            BackendType::Sqlite => write!(f, "SQLite"),
        }
    }
}

/// An insert collided with an existing id or unique key
///
/// Returned through `anyhow`; callers that resolve collisions use
/// `err.downcast_ref::<StoreConflict>()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity} already exists: {key}")]
pub struct StoreConflict {
    pub entity: &'static str,
    pub key: String,
}

pub(crate) fn insert_unique<T: Entity>(rows: &mut Vec<T>, row: T) -> Result<()> {
    if rows.iter().any(|r| r.id() == row.id()) {
        return Err(StoreConflict {
            entity: T::KIND,
            key: row.id().to_string(),
        }
        .into());
    }
    rows.push(row);
    Ok(())
}

pub(crate) fn replace_existing<T: Entity>(rows: &mut [T], row: &T) -> Result<()> {
    match rows.iter().position(|r| r.id() == row.id()) {
        Some(pos) => {
            rows[pos] = row.clone();
            Ok(())
        }
        None => anyhow::bail!("{} not found: {}", T::KIND, row.id()),
    }
}

pub(crate) fn check_exposed_key(store: &TreeStore, variable: &Variable) -> Result<()> {
    if store.variables.iter().any(|v| v.exposed_key == variable.exposed_key) {
        return Err(StoreConflict {
            entity: Variable::KIND,
            key: variable.exposed_key.clone(),
        }
        .into());
    }
    Ok(())
}

/// Core trait for tree storage backends
///
/// `load()` and `save()` move the whole [`TreeStore`]; the row operations are
/// the `findUnique`/`findMany`/`create`/`update` shapes the duplication engine
/// consumes.
pub trait TreeBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    fn path(&self) -> &std::path::Path;

    // =========================================================================
    // Full Store Operations
    // =========================================================================

    fn load(&self) -> Result<TreeStore>;

    fn save(&self, store: &TreeStore) -> Result<()>;

    /// Loads, applies changes and saves
    fn update_atomically<F>(&self, update_fn: F) -> Result<TreeStore>
    where
        F: FnOnce(&mut TreeStore),
        Self: Sized,
    {
        let mut store = self.load()?;
        update_fn(&mut store);
        self.save(&store)?;
        Ok(store)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    fn find_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.load()?.get_node(id).cloned())
    }

    fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let store = self.load()?;
        Ok(store.nodes.into_iter().filter(|n| filter.matches(n)).collect())
    }

    fn create_node(&self, node: Node) -> Result<Node> {
        let mut store = self.load()?;
        insert_unique(&mut store.nodes, node.clone())?;
        self.save(&store)?;
        Ok(node)
    }

    fn update_node(&self, node: &Node) -> Result<()> {
        let mut store = self.load()?;
        replace_existing(&mut store.nodes, node)?;
        self.save(&store)
    }

    // =========================================================================
    // Formulas
    // =========================================================================

    fn find_formula(&self, id: &str) -> Result<Option<Formula>> {
        Ok(self.load()?.get_formula(id).cloned())
    }

    /// Formulas owned by `node_id`, in stored order
    fn find_formulas(&self, node_id: &str) -> Result<Vec<Formula>> {
        let store = self.load()?;
        Ok(store.formulas.into_iter().filter(|f| f.node_id == node_id).collect())
    }

    fn create_formula(&self, formula: Formula) -> Result<Formula> {
        let mut store = self.load()?;
        insert_unique(&mut store.formulas, formula.clone())?;
        self.save(&store)?;
        Ok(formula)
    }

    fn update_formula(&self, formula: &Formula) -> Result<()> {
        let mut store = self.load()?;
        replace_existing(&mut store.formulas, formula)?;
        self.save(&store)
    }

    // =========================================================================
    // Conditions
    // =========================================================================

    fn find_condition(&self, id: &str) -> Result<Option<Condition>> {
        Ok(self.load()?.get_condition(id).cloned())
    }

    fn find_conditions(&self, node_id: &str) -> Result<Vec<Condition>> {
        let store = self.load()?;
        Ok(store.conditions.into_iter().filter(|c| c.node_id == node_id).collect())
    }

    fn create_condition(&self, condition: Condition) -> Result<Condition> {
        let mut store = self.load()?;
        insert_unique(&mut store.conditions, condition.clone())?;
        self.save(&store)?;
        Ok(condition)
    }

    fn update_condition(&self, condition: &Condition) -> Result<()> {
        let mut store = self.load()?;
        replace_existing(&mut store.conditions, condition)?;
        self.save(&store)
    }

    // =========================================================================
    // Tables (columns and rows travel with their table)
    // =========================================================================

    fn find_table(&self, id: &str) -> Result<Option<Table>> {
        Ok(self.load()?.get_table(id).cloned())
    }

    fn find_tables(&self, node_id: &str) -> Result<Vec<Table>> {
        let store = self.load()?;
        Ok(store.tables.into_iter().filter(|t| t.node_id == node_id).collect())
    }

    fn create_table(&self, table: Table) -> Result<Table> {
        let mut store = self.load()?;
        insert_unique(&mut store.tables, table.clone())?;
        self.save(&store)?;
        Ok(table)
    }

    fn update_table(&self, table: &Table) -> Result<()> {
        let mut store = self.load()?;
        replace_existing(&mut store.tables, table)?;
        self.save(&store)
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn find_variable(&self, id: &str) -> Result<Option<Variable>> {
        Ok(self.load()?.get_variable(id).cloned())
    }

    fn find_variables(&self, node_id: &str) -> Result<Vec<Variable>> {
        let store = self.load()?;
        Ok(store.variables.into_iter().filter(|v| v.node_id == node_id).collect())
    }

    fn find_variable_by_exposed_key(&self, exposed_key: &str) -> Result<Option<Variable>> {
        let store = self.load()?;
        Ok(store.variables.into_iter().find(|v| v.exposed_key == exposed_key))
    }

    /// Fails with [`StoreConflict`] on a duplicate id or exposed key
    fn create_variable(&self, variable: Variable) -> Result<Variable> {
        let mut store = self.load()?;
        check_exposed_key(&store, &variable)?;
        insert_unique(&mut store.variables, variable.clone())?;
        self.save(&store)?;
        Ok(variable)
    }

    fn update_variable(&self, variable: &Variable) -> Result<()> {
        let mut store = self.load()?;
        replace_existing(&mut store.variables, variable)?;
        self.save(&store)
    }

    // =========================================================================
    // Utility Operations
    // =========================================================================

    fn exists(&self) -> bool {
        self.path().exists()
    }

    fn create_if_not_exists(&self) -> Result<()> {
        if !self.exists() {
            self.save(&TreeStore::new())?;
        }
        Ok(())
    }

    fn stats(&self) -> Result<DatabaseStats> {
        let store = self.load()?;
        Ok(DatabaseStats {
            node_count: store.nodes.len(),
            formula_count: store.formulas.len(),
            condition_count: store.conditions.len(),
            table_count: store.tables.len(),
            variable_count: store.variables.len(),
            backend_type: self.backend_type(),
        })
    }
}

/// Row counts of a database
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub node_count: usize,
    pub formula_count: usize,
    pub condition_count: usize,
    pub table_count: usize,
    pub variable_count: usize,
    pub backend_type: BackendType,
}
