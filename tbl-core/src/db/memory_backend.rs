//! In-process storage backend
//!
//! Holds a [`TreeStore`] behind a mutex. Used by tests and as the scratch
//! store of an atomic duplication pass, whose result is written back to the
//! real backend in one `save`.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::models::{Condition, Formula, Node, NodeFilter, Table, TreeStore, Variable};

use super::traits::{check_exposed_key, insert_unique, replace_existing, BackendType, TreeBackend};

pub struct MemoryBackend {
    path: PathBuf,
    store: Mutex<TreeStore>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::from_store(TreeStore::new())
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_store(store: TreeStore) -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            store: Mutex::new(store),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Result<TreeStore> {
        Ok(self.lock()?.clone())
    }

    pub fn into_store(self) -> Result<TreeStore> {
        self.store.into_inner().map_err(|_| anyhow!("Memory store lock poisoned"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, TreeStore>> {
        self.store.lock().map_err(|_| anyhow!("Memory store lock poisoned"))
    }
}

impl TreeBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TreeStore> {
        self.snapshot()
    }

    fn save(&self, store: &TreeStore) -> Result<()> {
        *self.lock()? = store.clone();
        Ok(())
    }

    fn update_atomically<F>(&self, update_fn: F) -> Result<TreeStore>
    where
        F: FnOnce(&mut TreeStore),
    {
        let mut store = self.lock()?;
        update_fn(&mut *store);
        Ok(store.clone())
    }

    fn exists(&self) -> bool {
        true
    }

    // Row operations work on the locked store directly instead of cloning it

    fn find_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.lock()?.get_node(id).cloned())
    }

    fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self.lock()?.nodes.iter().filter(|n| filter.matches(n)).cloned().collect())
    }

    fn create_node(&self, node: Node) -> Result<Node> {
        insert_unique(&mut self.lock()?.nodes, node.clone())?;
        Ok(node)
    }

    fn update_node(&self, node: &Node) -> Result<()> {
        replace_existing(&mut self.lock()?.nodes, node)
    }

    fn find_formula(&self, id: &str) -> Result<Option<Formula>> {
        Ok(self.lock()?.get_formula(id).cloned())
    }

    fn find_formulas(&self, node_id: &str) -> Result<Vec<Formula>> {
        Ok(self.lock()?.formulas.iter().filter(|f| f.node_id == node_id).cloned().collect())
    }

    fn create_formula(&self, formula: Formula) -> Result<Formula> {
        insert_unique(&mut self.lock()?.formulas, formula.clone())?;
        Ok(formula)
    }

    fn update_formula(&self, formula: &Formula) -> Result<()> {
        replace_existing(&mut self.lock()?.formulas, formula)
    }

    fn find_condition(&self, id: &str) -> Result<Option<Condition>> {
        Ok(self.lock()?.get_condition(id).cloned())
    }

    fn find_conditions(&self, node_id: &str) -> Result<Vec<Condition>> {
        Ok(self.lock()?.conditions.iter().filter(|c| c.node_id == node_id).cloned().collect())
    }

    fn create_condition(&self, condition: Condition) -> Result<Condition> {
        insert_unique(&mut self.lock()?.conditions, condition.clone())?;
        Ok(condition)
    }

    fn update_condition(&self, condition: &Condition) -> Result<()> {
        replace_existing(&mut self.lock()?.conditions, condition)
    }

    fn find_table(&self, id: &str) -> Result<Option<Table>> {
        Ok(self.lock()?.get_table(id).cloned())
    }

    fn find_tables(&self, node_id: &str) -> Result<Vec<Table>> {
        Ok(self.lock()?.tables.iter().filter(|t| t.node_id == node_id).cloned().collect())
    }

    fn create_table(&self, table: Table) -> Result<Table> {
        insert_unique(&mut self.lock()?.tables, table.clone())?;
        Ok(table)
    }

    fn update_table(&self, table: &Table) -> Result<()> {
        replace_existing(&mut self.lock()?.tables, table)
    }

    fn find_variable(&self, id: &str) -> Result<Option<Variable>> {
        Ok(self.lock()?.get_variable(id).cloned())
    }

    fn find_variables(&self, node_id: &str) -> Result<Vec<Variable>> {
        Ok(self.lock()?.variables.iter().filter(|v| v.node_id == node_id).cloned().collect())
    }

    fn find_variable_by_exposed_key(&self, exposed_key: &str) -> Result<Option<Variable>> {
        Ok(self.lock()?.variables.iter().find(|v| v.exposed_key == exposed_key).cloned())
    }

    fn create_variable(&self, variable: Variable) -> Result<Variable> {
        let mut store = self.lock()?;
        check_exposed_key(&store, &variable)?;
        insert_unique(&mut store.variables, variable.clone())?;
        Ok(variable)
    }

    fn update_variable(&self, variable: &Variable) -> Result<()> {
        replace_existing(&mut self.lock()?.variables, variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreConflict;

    #[test]
    fn test_memory_backend_node_crud() {
        let backend = MemoryBackend::new();
        backend.create_node(Node::new("n1", "t1", None)).unwrap();
        backend.create_node(Node::new("n2", "t1", Some("n1"))).unwrap();

        let mut node = backend.find_node("n2").unwrap().unwrap();
        node.label = Some("Width".into());
        backend.update_node(&node).unwrap();

        let loaded = backend.find_node("n2").unwrap().unwrap();
        assert_eq!(loaded.label.as_deref(), Some("Width"));
        assert_eq!(backend.find_nodes(&NodeFilter::in_tree("t1")).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_backend_conflicts() {
        let backend = MemoryBackend::new();
        backend.create_node(Node::new("n1", "t1", None)).unwrap();
        let err = backend.create_node(Node::new("n1", "t1", None)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreConflict>(),
            Some(&StoreConflict {
                entity: "Node",
                key: "n1".into()
            })
        );

        backend.create_variable(Variable::new("v1", "n1", "width", None)).unwrap();
        let err = backend.create_variable(Variable::new("v2", "n1", "width", None)).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreConflict>().map(|c| c.key.as_str()), Some("width"));
    }

    #[test]
    fn test_update_missing_row_fails() {
        let backend = MemoryBackend::new();
        let result = backend.update_formula(&Formula::new("f1", "n1", serde_json::Value::Null));
        assert!(result.unwrap_err().to_string().contains("Formula not found: f1"));
    }

    #[test]
    fn test_snapshot_and_save_round_trip() {
        let backend = MemoryBackend::new();
        let mut store = TreeStore::new();
        store.name = "forms".into();
        store.nodes.push(Node::new("n1", "t1", None));
        backend.save(&store).unwrap();
        assert_eq!(backend.snapshot().unwrap(), store);
        assert_eq!(backend.stats().unwrap().node_count, 1);
    }
}
