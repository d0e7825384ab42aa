//! SQLite database storage backend
//!
//! Every collection lives in its own table. Rows are stored as JSON documents
//! next to an indexed `owner` column (the tree id for nodes, the owning node
//! id for capacities), so row lookups never load the whole store.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::models::{Condition, Entity, Formula, Node, NodeFilter, Table, TreeStore, Variable};

use super::traits::{BackendType, StoreConflict, TreeBackend};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS nodes (id TEXT PRIMARY KEY, owner TEXT NOT NULL, data TEXT NOT NULL);
CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes(owner);
CREATE TABLE IF NOT EXISTS formulas (id TEXT PRIMARY KEY, owner TEXT NOT NULL, data TEXT NOT NULL);
CREATE INDEX IF NOT EXISTS idx_formulas_owner ON formulas(owner);
CREATE TABLE IF NOT EXISTS conditions (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conditions_owner ON conditions(owner);
CREATE TABLE IF NOT EXISTS tables (id TEXT PRIMARY KEY, owner TEXT NOT NULL, data TEXT NOT NULL);
CREATE INDEX IF NOT EXISTS idx_tables_owner ON tables(owner);
CREATE TABLE IF NOT EXISTS variables (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    exposed_key TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_variables_owner ON variables(owner);
";

/// An entity stored as one row of a collection table
trait SqlRow: Entity + Serialize + DeserializeOwned {
    const TABLE: &'static str;

    fn owner(&self) -> &str;

    /// Value of the `exposed_key` column, for tables that have one
    fn unique_key(&self) -> Option<&str> {
        None
    }
}

impl SqlRow for Node {
    const TABLE: &'static str = "nodes";

    fn owner(&self) -> &str {
        &self.tree_id
    }
}

impl SqlRow for Formula {
    const TABLE: &'static str = "formulas";

    fn owner(&self) -> &str {
        &self.node_id
    }
}

impl SqlRow for Condition {
    const TABLE: &'static str = "conditions";

    fn owner(&self) -> &str {
        &self.node_id
    }
}

impl SqlRow for Table {
    const TABLE: &'static str = "tables";

    fn owner(&self) -> &str {
        &self.node_id
    }
}

impl SqlRow for Variable {
    const TABLE: &'static str = "variables";

    fn owner(&self) -> &str {
        &self.node_id
    }

    fn unique_key(&self) -> Option<&str> {
        Some(&self.exposed_key)
    }
}

pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open SQLite database {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let backend = Self {
            path,
            conn: Mutex::new(conn),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        // A fresh database has no schema_version table yet
        let current_version: i32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .unwrap_or(0);

        if current_version == 0 {
            conn.execute_batch(SCHEMA)?;
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
        } else if current_version < SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is outdated, expected {}",
                current_version,
                SCHEMA_VERSION
            );
        }
        Ok(())
    }

    fn to_json<T: Serialize>(value: &T) -> Result<String> {
        serde_json::to_string(value).context("Failed to serialize to JSON")
    }

    fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
        serde_json::from_str(json).context("Failed to deserialize from JSON")
    }

    fn row_exists(conn: &Connection, table: &str, column: &str, value: &str) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1", table, column),
                [value],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_row<T: SqlRow>(conn: &Connection, id: &str) -> Result<Option<T>> {
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {} WHERE id = ?1", T::TABLE),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|json| Self::from_json(&json)).transpose()
    }

    fn query_rows<T: SqlRow>(conn: &Connection, sql: &str, args: &[&str]) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for json in rows {
            out.push(Self::from_json(&json?)?);
        }
        Ok(out)
    }

    fn rows_by_owner<T: SqlRow>(conn: &Connection, owner: &str) -> Result<Vec<T>> {
        let sql = format!("SELECT data FROM {} WHERE owner = ?1 ORDER BY rowid", T::TABLE);
        Self::query_rows(conn, &sql, &[owner])
    }

    fn all_rows<T: SqlRow>(conn: &Connection) -> Result<Vec<T>> {
        let sql = format!("SELECT data FROM {} ORDER BY rowid", T::TABLE);
        Self::query_rows(conn, &sql, &[])
    }

    /// Inserts a new row, reporting id and unique key collisions as [`StoreConflict`]
    fn insert_row<T: SqlRow>(conn: &Connection, row: &T) -> Result<()> {
        if Self::row_exists(conn, T::TABLE, "id", row.id())? {
            return Err(StoreConflict {
                entity: T::KIND,
                key: row.id().to_string(),
            }
            .into());
        }
        if let Some(key) = row.unique_key() {
            if Self::row_exists(conn, T::TABLE, "exposed_key", key)? {
                return Err(StoreConflict {
                    entity: T::KIND,
                    key: key.to_string(),
                }
                .into());
            }
        }
        Self::write_row(conn, row)
    }

    fn write_row<T: SqlRow>(conn: &Connection, row: &T) -> Result<()> {
        let data = Self::to_json(row)?;
        match row.unique_key() {
            Some(key) => conn.execute(
                &format!(
                    "INSERT INTO {} (id, owner, exposed_key, data) VALUES (?1, ?2, ?3, ?4)",
                    T::TABLE
                ),
                params![row.id(), row.owner(), key, data],
            )?,
            None => conn.execute(
                &format!("INSERT INTO {} (id, owner, data) VALUES (?1, ?2, ?3)", T::TABLE),
                params![row.id(), row.owner(), data],
            )?,
        };
        Ok(())
    }

    fn update_row<T: SqlRow>(conn: &Connection, row: &T) -> Result<()> {
        let data = Self::to_json(row)?;
        let rows_affected = match row.unique_key() {
            Some(key) => conn.execute(
                &format!(
                    "UPDATE {} SET owner = ?2, exposed_key = ?3, data = ?4 WHERE id = ?1",
                    T::TABLE
                ),
                params![row.id(), row.owner(), key, data],
            )?,
            None => conn.execute(
                &format!("UPDATE {} SET owner = ?2, data = ?3 WHERE id = ?1", T::TABLE),
                params![row.id(), row.owner(), data],
            )?,
        };
        if rows_affected == 0 {
            anyhow::bail!("{} not found: {}", T::KIND, row.id())
        }
        Ok(())
    }

    fn load_store(conn: &Connection) -> Result<TreeStore> {
        let name: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = 'name'", [], |row| row.get(0))
            .optional()?;

        Ok(TreeStore {
            name: name.unwrap_or_default(),
            nodes: Self::all_rows(conn)?,
            formulas: Self::all_rows(conn)?,
            conditions: Self::all_rows(conn)?,
            tables: Self::all_rows(conn)?,
            variables: Self::all_rows(conn)?,
        })
    }

    /// Replaces every row; callers wrap this in a transaction
    fn write_store(conn: &Connection, store: &TreeStore) -> Result<()> {
        for table in ["nodes", "formulas", "conditions", "tables", "variables"] {
            conn.execute(&format!("DELETE FROM {}", table), [])?;
        }
        for node in &store.nodes {
            Self::write_row(conn, node)?;
        }
        for formula in &store.formulas {
            Self::write_row(conn, formula)?;
        }
        for condition in &store.conditions {
            Self::write_row(conn, condition)?;
        }
        for table in &store.tables {
            Self::write_row(conn, table)?;
        }
        for variable in &store.variables {
            Self::write_row(conn, variable)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('name', ?1)",
            [&store.name],
        )?;
        Ok(())
    }
}

impl TreeBackend for SqliteBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Sqlite
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TreeStore> {
        let conn = self.lock()?;
        Self::load_store(&conn)
    }

    fn save(&self, store: &TreeStore) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::write_store(&tx, store)?;
        tx.commit()?;
        Ok(())
    }

    fn update_atomically<F>(&self, update_fn: F) -> Result<TreeStore>
    where
        F: FnOnce(&mut TreeStore),
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
        let mut store = Self::load_store(&tx)?;
        update_fn(&mut store);
        Self::write_store(&tx, &store)?;
        tx.commit()?;
        Ok(store)
    }

    // Row-level overrides

    fn find_node(&self, id: &str) -> Result<Option<Node>> {
        Self::get_row(&*self.lock()?, id)
    }

    fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        let nodes: Vec<Node> = match &filter.tree_id {
            Some(tree_id) => Self::rows_by_owner(&conn, tree_id)?,
            None => Self::all_rows(&conn)?,
        };
        Ok(nodes.into_iter().filter(|n| filter.matches(n)).collect())
    }

    fn create_node(&self, node: Node) -> Result<Node> {
        Self::insert_row(&*self.lock()?, &node)?;
        Ok(node)
    }

    fn update_node(&self, node: &Node) -> Result<()> {
        Self::update_row(&*self.lock()?, node)
    }

    fn find_formula(&self, id: &str) -> Result<Option<Formula>> {
        Self::get_row(&*self.lock()?, id)
    }

    fn find_formulas(&self, node_id: &str) -> Result<Vec<Formula>> {
        Self::rows_by_owner(&*self.lock()?, node_id)
    }

    fn create_formula(&self, formula: Formula) -> Result<Formula> {
        Self::insert_row(&*self.lock()?, &formula)?;
        Ok(formula)
    }

    fn update_formula(&self, formula: &Formula) -> Result<()> {
        Self::update_row(&*self.lock()?, formula)
    }

    fn find_condition(&self, id: &str) -> Result<Option<Condition>> {
        Self::get_row(&*self.lock()?, id)
    }

    fn find_conditions(&self, node_id: &str) -> Result<Vec<Condition>> {
        Self::rows_by_owner(&*self.lock()?, node_id)
    }

    fn create_condition(&self, condition: Condition) -> Result<Condition> {
        Self::insert_row(&*self.lock()?, &condition)?;
        Ok(condition)
    }

    fn update_condition(&self, condition: &Condition) -> Result<()> {
        Self::update_row(&*self.lock()?, condition)
    }

    fn find_table(&self, id: &str) -> Result<Option<Table>> {
        Self::get_row(&*self.lock()?, id)
    }

    fn find_tables(&self, node_id: &str) -> Result<Vec<Table>> {
        Self::rows_by_owner(&*self.lock()?, node_id)
    }

    fn create_table(&self, table: Table) -> Result<Table> {
        Self::insert_row(&*self.lock()?, &table)?;
        Ok(table)
    }

    fn update_table(&self, table: &Table) -> Result<()> {
        Self::update_row(&*self.lock()?, table)
    }

    fn find_variable(&self, id: &str) -> Result<Option<Variable>> {
        Self::get_row(&*self.lock()?, id)
    }

    fn find_variables(&self, node_id: &str) -> Result<Vec<Variable>> {
        Self::rows_by_owner(&*self.lock()?, node_id)
    }

    fn find_variable_by_exposed_key(&self, exposed_key: &str) -> Result<Option<Variable>> {
        let conn = self.lock()?;
        let mut found = Self::query_rows::<Variable>(
            &conn,
            "SELECT data FROM variables WHERE exposed_key = ?1",
            &[exposed_key],
        )?;
        Ok(found.pop())
    }

    fn create_variable(&self, variable: Variable) -> Result<Variable> {
        Self::insert_row(&*self.lock()?, &variable)?;
        Ok(variable)
    }

    fn update_variable(&self, variable: &Variable) -> Result<()> {
        Self::update_row(&*self.lock()?, variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sqlite_backend_create_and_load() {
        let temp_file = NamedTempFile::with_suffix(".db").unwrap();
        let backend = SqliteBackend::new(temp_file.path()).unwrap();

        backend.create_if_not_exists().unwrap();

        let store = backend.load().unwrap();
        assert!(store.nodes.is_empty());
        assert!(store.variables.is_empty());
    }

    #[test]
    fn test_sqlite_backend_save_and_load() {
        let temp_file = NamedTempFile::with_suffix(".db").unwrap();
        let backend = SqliteBackend::new(temp_file.path()).unwrap();

        let mut store = TreeStore::new();
        store.name = "Forms".to_string();
        store.nodes.push(Node::new("root", "t1", None));
        store.nodes.push(Node::new("child", "t1", Some("root")));
        store.tables.push(Table::new("tab1", "root"));

        backend.save(&store).unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded.name, "Forms");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.nodes[1].parent_id.as_deref(), Some("root"));
        assert_eq!(loaded.tables[0].id, "tab1");
    }

    #[test]
    fn test_sqlite_backend_row_crud() {
        let temp_file = NamedTempFile::with_suffix(".db").unwrap();
        let backend = SqliteBackend::new(temp_file.path()).unwrap();

        backend.create_node(Node::new("n1", "t1", None)).unwrap();
        let mut condition = Condition::new("c1", "n1", json!({"branches": []}));
        backend.create_condition(condition.clone()).unwrap();

        condition.name = Some("Visible when wide".into());
        backend.update_condition(&condition).unwrap();

        let loaded = backend.find_condition("c1").unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("Visible when wide"));
        assert_eq!(backend.find_conditions("n1").unwrap().len(), 1);
        assert!(backend.find_condition("missing").unwrap().is_none());

        let missing = backend.update_node(&Node::new("ghost", "t1", None));
        assert!(missing.unwrap_err().to_string().contains("Node not found: ghost"));
    }

    #[test]
    fn test_sqlite_backend_exposed_key_conflict() {
        let temp_file = NamedTempFile::with_suffix(".db").unwrap();
        let backend = SqliteBackend::new(temp_file.path()).unwrap();

        backend.create_variable(Variable::new("v1", "n1", "width", None)).unwrap();
        let err = backend.create_variable(Variable::new("v2", "n2", "width", None)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreConflict>(),
            Some(&StoreConflict {
                entity: "Variable",
                key: "width".into()
            })
        );

        let found = backend.find_variable_by_exposed_key("width").unwrap().unwrap();
        assert_eq!(found.id, "v1");
    }

    #[test]
    fn test_sqlite_update_atomically() {
        let temp_file = NamedTempFile::with_suffix(".db").unwrap();
        let backend = SqliteBackend::new(temp_file.path()).unwrap();

        backend
            .update_atomically(|store| store.nodes.push(Node::new("n1", "t1", None)))
            .unwrap();
        assert!(backend.find_node("n1").unwrap().is_some());
    }
}
