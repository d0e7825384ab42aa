use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// The kinds of capacity a node can carry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CapacityKind {
    Formula,
    Condition,
    Table,
    Variable,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityKind::Formula => write!(f, "formula"),
            CapacityKind::Condition => write!(f, "condition"),
            CapacityKind::Table => write!(f, "table"),
            CapacityKind::Variable => write!(f, "variable"),
        }
    }
}

impl CapacityKind {
    /// The link index on a node that records capacities of this kind
    pub fn linked_field(&self) -> LinkedField {
        match self {
            CapacityKind::Formula => LinkedField::Formula,
            CapacityKind::Condition => LinkedField::Condition,
            CapacityKind::Table => LinkedField::Table,
            CapacityKind::Variable => LinkedField::Variable,
        }
    }
}

/// The `linkedXxxIds` set fields of a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LinkedField {
    Formula,
    Condition,
    Table,
    Variable,
}

impl LinkedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkedField::Formula => "linkedFormulaIds",
            LinkedField::Condition => "linkedConditionIds",
            LinkedField::Table => "linkedTableIds",
            LinkedField::Variable => "linkedVariableIds",
        }
    }
}

impl fmt::Display for LinkedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical reference to a formula, condition or table
///
/// Payloads spell capacity references in several ways (`node-formula:<id>`,
/// `@value.condition:<id>`, `@table.<id>` ...). They all normalise to one of
/// `formula:<id>`, `condition:<id>` or `table:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapacityRef {
    Formula(String),
    Condition(String),
    Table(String),
}

impl CapacityRef {
    /// Parses any accepted spelling of a capacity reference
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let body = trimmed.strip_prefix("@value.").unwrap_or(trimmed);

        let prefixes: [(&str, fn(String) -> CapacityRef); 7] = [
            ("node-formula:", CapacityRef::Formula),
            ("formula:", CapacityRef::Formula),
            ("node-condition:", CapacityRef::Condition),
            ("condition:", CapacityRef::Condition),
            ("node-table:", CapacityRef::Table),
            ("@table.", CapacityRef::Table),
            ("table:", CapacityRef::Table),
        ];

        prefixes.iter().find_map(|(prefix, build)| {
            let id = body.strip_prefix(prefix)?;
            if id.is_empty() {
                return None;
            }
            Some(build(id.to_string()))
        })
    }

    pub fn kind(&self) -> CapacityKind {
        match self {
            CapacityRef::Formula(_) => CapacityKind::Formula,
            CapacityRef::Condition(_) => CapacityKind::Condition,
            CapacityRef::Table(_) => CapacityKind::Table,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CapacityRef::Formula(id) | CapacityRef::Condition(id) | CapacityRef::Table(id) => id,
        }
    }
}

impl fmt::Display for CapacityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A tree element (tree, branch or leaf)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub tree_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Sibling sort key
    #[serde(default)]
    pub order: i64,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    /// `None` (or empty) marks a pure input field
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value: Option<String>,

    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_required: bool,

    #[serde(default)]
    pub has_data: bool,
    #[serde(default)]
    pub has_formula: bool,
    #[serde(default)]
    pub has_condition: bool,
    #[serde(default)]
    pub has_table: bool,
    #[serde(default)]
    pub has_link: bool,

    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub calculated_value: Option<String>,

    #[serde(rename = "formula_activeId", default)]
    pub formula_active_id: Option<String>,
    #[serde(rename = "condition_activeId", default)]
    pub condition_active_id: Option<String>,
    #[serde(rename = "table_activeId", default)]
    pub table_active_id: Option<String>,
    #[serde(rename = "data_activeId", default)]
    pub data_active_id: Option<String>,

    #[serde(rename = "data_exposedKey", default)]
    pub data_exposed_key: Option<String>,
    #[serde(rename = "data_displayFormat", default)]
    pub data_display_format: Option<String>,
    #[serde(rename = "data_unit", default)]
    pub data_unit: Option<String>,
    #[serde(rename = "data_precision", default)]
    pub data_precision: Option<i64>,
    #[serde(rename = "data_visibleToUser", default)]
    pub data_visible_to_user: bool,

    #[serde(rename = "link_targetNodeId", default)]
    pub link_target_node_id: Option<String>,
    #[serde(rename = "link_targetTreeId", default)]
    pub link_target_tree_id: Option<String>,
    #[serde(rename = "link_params", default)]
    pub link_params: Option<Value>,

    #[serde(rename = "select_source", default)]
    pub select_source: Option<String>,
    #[serde(rename = "select_options", default)]
    pub select_options: Option<Value>,

    #[serde(rename = "table_name", default)]
    pub table_name: Option<String>,
    /// Keyed by instance id; each entry may carry a `tableId`
    #[serde(rename = "table_instances", default)]
    pub table_instances: Option<Value>,

    /// Always points at the original, immutable template nodes
    #[serde(rename = "repeater_templateNodeIds", default)]
    pub repeater_template_node_ids: Vec<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub is_shared_reference: bool,
    #[serde(default)]
    pub shared_reference_id: Option<String>,
    #[serde(default)]
    pub shared_reference_ids: Vec<String>,
    #[serde(default)]
    pub shared_reference_name: Option<String>,

    #[serde(default)]
    pub linked_formula_ids: Vec<String>,
    #[serde(default)]
    pub linked_condition_ids: Vec<String>,
    #[serde(default)]
    pub linked_table_ids: Vec<String>,
    #[serde(default)]
    pub linked_variable_ids: Vec<String>,

    /// Every other per-type setting (text_*, number_*, appearance_* ...)
    #[serde(flatten)]
    pub config: BTreeMap<String, Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_node_type() -> String {
    "leaf_field".to_string()
}

fn default_true() -> bool {
    true
}

impl Node {
    /// Creates a node with default settings
    pub fn new(id: impl Into<String>, tree_id: impl Into<String>, parent_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tree_id: tree_id.into(),
            parent_id: parent_id.map(str::to_string),
            order: 0,
            node_type: default_node_type(),
            sub_type: None,
            field_type: None,
            label: None,
            description: None,
            value: None,
            is_visible: true,
            is_active: true,
            is_required: false,
            has_data: false,
            has_formula: false,
            has_condition: false,
            has_table: false,
            has_link: false,
            default_value: None,
            calculated_value: None,
            formula_active_id: None,
            condition_active_id: None,
            table_active_id: None,
            data_active_id: None,
            data_exposed_key: None,
            data_display_format: None,
            data_unit: None,
            data_precision: None,
            data_visible_to_user: false,
            link_target_node_id: None,
            link_target_tree_id: None,
            link_params: None,
            select_source: None,
            select_options: None,
            table_name: None,
            table_instances: None,
            repeater_template_node_ids: Vec::new(),
            metadata: Map::new(),
            is_shared_reference: false,
            shared_reference_id: None,
            shared_reference_ids: Vec::new(),
            shared_reference_name: None,
            linked_formula_ids: Vec::new(),
            linked_condition_ids: Vec::new(),
            linked_table_ids: Vec::new(),
            linked_variable_ids: Vec::new(),
            config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the ids stored in one of the link indexes
    pub fn linked(&self, field: LinkedField) -> &Vec<String> {
        match field {
            LinkedField::Formula => &self.linked_formula_ids,
            LinkedField::Condition => &self.linked_condition_ids,
            LinkedField::Table => &self.linked_table_ids,
            LinkedField::Variable => &self.linked_variable_ids,
        }
    }

    pub fn linked_mut(&mut self, field: LinkedField) -> &mut Vec<String> {
        match field {
            LinkedField::Formula => &mut self.linked_formula_ids,
            LinkedField::Condition => &mut self.linked_condition_ids,
            LinkedField::Table => &mut self.linked_table_ids,
            LinkedField::Variable => &mut self.linked_variable_ids,
        }
    }

    /// Pure input fields have no field type and never carry table links
    pub fn is_input_field(&self) -> bool {
        self.field_type.as_deref().map_or(true, |t| t.trim().is_empty())
    }

    /// Reads a string entry from the metadata blob
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// A formula owned by a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Formula {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered token list, may embed reference tags
    #[serde(default)]
    pub tokens: Value,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Formula {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, tokens: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_id: node_id.into(),
            name: None,
            description: None,
            tokens,
            order: 0,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A condition owned by a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Branches of `when` expressions and `actions`, plus an optional `fallback`
    #[serde(default)]
    pub condition_set: Value,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Condition {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, condition_set: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_id: node_id.into(),
            name: None,
            description: None,
            condition_set,
            order: 0,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableColumn {
    pub id: String,
    pub column_index: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: String,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

fn default_column_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub id: String,
    pub row_index: i64,
    /// Cell data keyed by column (object) or positional (array)
    #[serde(default)]
    pub cells: Value,
}

/// A lookup table owned by a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub table_type: Option<String>,
    /// Lookup configuration; references fields and columns
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub columns: Vec<TableColumn>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub column_count: usize,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Table {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_id: node_id.into(),
            name: None,
            description: None,
            table_type: None,
            meta: Value::Null,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            column_count: 0,
            order: 0,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total number of cells across all rows
    pub fn cell_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| match &row.cells {
                Value::Array(cells) => cells.len(),
                Value::Object(cells) => cells.len(),
                _ => 0,
            })
            .sum()
    }
}

/// A variable exposing a value of its owner node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub node_id: String,
    /// Unique across the store
    pub exposed_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display_format: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub precision: Option<i64>,
    #[serde(default = "default_true")]
    pub visible_to_user: bool,
    #[serde(default)]
    pub is_readonly: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub fixed_value: Option<String>,
    #[serde(default)]
    pub selected_node_id: Option<String>,
    /// `node-formula:<id>`, `condition:<id>`, `@table.<id>`, or a bare field id
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        exposed_key: impl Into<String>,
        source_ref: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_id: node_id.into(),
            exposed_key: exposed_key.into(),
            display_name: None,
            display_format: None,
            unit: None,
            precision: None,
            visible_to_user: true,
            is_readonly: false,
            default_value: None,
            fixed_value: None,
            selected_node_id: None,
            source_ref: source_ref.map(str::to_string),
            source_type: None,
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Common identity behaviour used by [`clone_with`]
pub trait Entity: Clone {
    /// Human readable collection name
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn set_timestamps(&mut self, now: DateTime<Utc>);
}

macro_rules! impl_entity {
    ($ty:ty, $kind:literal) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn set_timestamps(&mut self, now: DateTime<Utc>) {
                self.created_at = now;
                self.updated_at = now;
            }
        }
    };
}

impl_entity!(Node, "Node");
impl_entity!(Formula, "Formula");
impl_entity!(Condition, "Condition");
impl_entity!(Table, "Table");
impl_entity!(Variable, "Variable");

/// Copies every field of `source`, assigns `new_id`, then applies `overrides`
pub fn clone_with<T, F>(source: &T, new_id: impl Into<String>, overrides: F) -> T
where
    T: Entity,
    F: FnOnce(&mut T),
{
    let mut copy = source.clone();
    copy.set_id(new_id.into());
    copy.set_timestamps(Utc::now());
    overrides(&mut copy);
    copy
}

/// Filter for node listings
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub tree_id: Option<String>,
    pub parent_id: Option<String>,
    /// Nodes whose `linkedVariableIds` contains this id
    pub linked_variable_id: Option<String>,
    /// Nodes whose `metadata.fromVariableId` equals this id
    pub from_variable_id: Option<String>,
}

impl NodeFilter {
    pub fn in_tree(tree_id: impl Into<String>) -> Self {
        Self {
            tree_id: Some(tree_id.into()),
            ..Default::default()
        }
    }

    pub fn linking_variable(variable_id: impl Into<String>) -> Self {
        Self {
            linked_variable_id: Some(variable_id.into()),
            ..Default::default()
        }
    }

    pub fn displaying_variable(variable_id: impl Into<String>) -> Self {
        Self {
            from_variable_id: Some(variable_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(tree_id) = &self.tree_id {
            if &node.tree_id != tree_id {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if node.parent_id.as_ref() != Some(parent_id) {
                return false;
            }
        }
        if let Some(variable_id) = &self.linked_variable_id {
            if !node.linked_variable_ids.contains(variable_id) {
                return false;
            }
        }
        if let Some(variable_id) = &self.from_variable_id {
            if node.metadata_str("fromVariableId") != Some(variable_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The whole persisted document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TreeStore {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub formulas: Vec<Formula>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn get_formula(&self, id: &str) -> Option<&Formula> {
        self.formulas.iter().find(|f| f.id == id)
    }

    pub fn get_condition(&self, id: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    pub fn get_table(&self, id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn get_variable(&self, id: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Children of a node sorted by their `order`
    pub fn children_of(&self, parent_id: &str) -> Vec<&Node> {
        let mut children: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by_key(|n| n.order);
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capacity_ref_normalisation() {
        let cases = [
            ("node-formula:f1", CapacityRef::Formula("f1".into())),
            ("@value.node-formula:f1", CapacityRef::Formula("f1".into())),
            ("formula:f1", CapacityRef::Formula("f1".into())),
            ("condition:c1", CapacityRef::Condition("c1".into())),
            ("node-condition:c1", CapacityRef::Condition("c1".into())),
            ("@value.condition:c1", CapacityRef::Condition("c1".into())),
            ("@table.t1", CapacityRef::Table("t1".into())),
            ("node-table:t1", CapacityRef::Table("t1".into())),
            ("table:t1", CapacityRef::Table("t1".into())),
        ];
        for (raw, expected) in cases {
            assert_eq!(CapacityRef::parse(raw), Some(expected), "raw={raw}");
        }
        assert_eq!(CapacityRef::parse("node-formula:"), None);
        assert_eq!(CapacityRef::parse("plain-node-id"), None);
    }

    #[test]
    fn test_capacity_ref_display_is_canonical() {
        let reference = CapacityRef::parse("@value.node-condition:c9").unwrap();
        assert_eq!(reference.to_string(), "condition:c9");
        assert_eq!(CapacityRef::parse(&reference.to_string()), Some(reference));
    }

    #[test]
    fn test_node_serializes_wire_names() {
        let mut node = Node::new("n1", "t1", None);
        node.formula_active_id = Some("f1".into());
        node.linked_formula_ids = vec!["f1".into()];
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["formula_activeId"], json!("f1"));
        assert_eq!(value["linkedFormulaIds"], json!(["f1"]));
        assert_eq!(value["type"], json!("leaf_field"));
    }

    #[test]
    fn test_node_keeps_unknown_settings() {
        let raw = json!({
            "id": "n1",
            "treeId": "t1",
            "text_placeholder": "Width",
            "number_max": 40
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.config.get("text_placeholder"), Some(&json!("Width")));

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["number_max"], json!(40));
    }

    #[test]
    fn test_clone_with_applies_overrides() {
        let mut formula = Formula::new("f1", "n1", json!(["@value.n2"]));
        formula.name = Some("Total".into());
        let copy = clone_with(&formula, "f1-2", |f| f.node_id = "n1-2".into());
        assert_eq!(copy.id, "f1-2");
        assert_eq!(copy.node_id, "n1-2");
        assert_eq!(copy.name.as_deref(), Some("Total"));
        assert_eq!(copy.tokens, formula.tokens);
    }

    #[test]
    fn test_node_filter() {
        let mut node = Node::new("n1", "t1", Some("root"));
        node.linked_variable_ids.push("v1".into());
        node.metadata.insert("fromVariableId".into(), json!("v1-2"));

        assert!(NodeFilter::in_tree("t1").matches(&node));
        assert!(!NodeFilter::in_tree("t2").matches(&node));
        assert!(NodeFilter::linking_variable("v1").matches(&node));
        assert!(NodeFilter::displaying_variable("v1-2").matches(&node));
        assert!(!NodeFilter::displaying_variable("v1").matches(&node));
    }

    #[test]
    fn test_input_field_detection() {
        let mut node = Node::new("n1", "t1", None);
        assert!(node.is_input_field());
        node.field_type = Some("SELECT".into());
        assert!(!node.is_input_field());
    }

    #[test]
    fn test_table_cell_count() {
        let mut table = Table::new("t1", "n1");
        table.rows.push(TableRow {
            id: "r1".into(),
            row_index: 0,
            cells: json!(["a", "b"]),
        });
        table.rows.push(TableRow {
            id: "r2".into(),
            row_index: 1,
            cells: json!({"c1": 1}),
        });
        assert_eq!(table.cell_count(), 3);
    }
}
