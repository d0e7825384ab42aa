//! Subtree traversal and creation ordering

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::Node;

/// Ids of `root_id` and all its descendants, in breadth-first order.
///
/// The parent index is built once; a node reachable twice (corrupt parent
/// links) is visited only once.
pub fn collect_subtree_ids(root_id: &str, nodes: &[Node]) -> Vec<String> {
    let mut children: HashMap<&str, Vec<&Node>> = HashMap::new();
    for node in nodes {
        if let Some(parent_id) = node.parent_id.as_deref() {
            children.entry(parent_id).or_default().push(node);
        }
    }
    for list in children.values_mut() {
        list.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    }

    let mut visited: HashSet<&str> = HashSet::from([root_id]);
    let mut ordered = vec![root_id.to_string()];
    let mut queue = VecDeque::from([root_id]);
    while let Some(current) = queue.pop_front() {
        for child in children.get(current).into_iter().flatten() {
            if visited.insert(child.id.as_str()) {
                ordered.push(child.id.clone());
                queue.push_back(child.id.as_str());
            }
        }
    }
    ordered
}

/// Parents-first creation sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationOrder {
    pub ids: Vec<String>,
    /// Ids that could not be placed topologically and were appended by depth
    pub anomalies: Vec<String>,
}

impl CreationOrder {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

fn sort_key<'a>(by_id: &'a HashMap<String, Node>, id: &'a str) -> (i64, &'a str) {
    (by_id.get(id).map_or(0, |node| node.order), id)
}

fn in_set_parent<'a>(
    id: &str,
    id_set: &HashSet<&str>,
    by_id: &'a HashMap<String,
    Node>,
) -> Option<&'a str> {
    by_id
        .get(id)
        .and_then(|node| node.parent_id.as_deref())
        .filter(|parent| id_set.contains(parent))
}

/// Number of in-set ancestors above `id`, stopping on a cycle
fn in_set_depth(id: &str, ids: &HashSet<&str>, by_id: &HashMap<String, Node>) -> usize {
    let mut seen = HashSet::from([id]);
    let mut depth = 0;
    let mut current = id;
    while let Some(parent) = by_id.get(current).and_then(|n| n.parent_id.as_deref()) {
        if !ids.contains(parent) || !seen.insert(parent) {
            break;
        }
        depth += 1;
        current = parent;
    }
    depth
}

/// Orders `ids` so that every node comes after its in-set parent.
///
/// Roots (no parent inside the set) are sorted by `order`, and so are the
/// children of each expanded node. Ids left over by a cycle are appended
/// shallowest first and reported in [`CreationOrder::anomalies`].
pub fn order_creation(ids: &[String], by_id: &HashMap<String, Node>) -> CreationOrder {
    let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<&str> = Vec::new();
    for &id in &id_set {
        match in_set_parent(id, &id_set, by_id) {
            Some(parent) => children.entry(parent).or_default().push(id),
            None => roots.push(id),
        }
    }
    roots.sort_by_key(|id| sort_key(by_id, *id));
    for list in children.values_mut() {
        list.sort_by_key(|id| sort_key(by_id, *id));
    }

    let mut placed: HashSet<&str> = HashSet::with_capacity(id_set.len());
    let mut ordered: Vec<String> = Vec::with_capacity(id_set.len());
    let mut queue: VecDeque<&str> = roots.into_iter().collect();
    while let Some(current) = queue.pop_front() {
        if !placed.insert(current) {
            continue;
        }
        ordered.push(current.to_string());
        for child in children.get(current).into_iter().flatten() {
            queue.push_back(*child);
        }
    }

    let mut leftovers: Vec<&str> = id_set
        .iter()
        .copied()
        .filter(|id| !placed.contains(id))
        .collect();
    leftovers.sort_by_key(|id| (in_set_depth(id, &id_set, by_id), sort_key(by_id, *id)));
    let anomalies: Vec<String> = leftovers.iter().map(|id| id.to_string()).collect();
    ordered.extend(anomalies.iter().cloned());

    CreationOrder { ids: ordered, anomalies }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>, order: i64) -> Node {
        let mut node = Node::new(id, "t1", parent);
        node.order = order;
        node
    }

    fn index(nodes: &[Node]) -> HashMap<String, Node> {
        nodes.iter().map(|n| (n.id.clone(), n.clone())).collect()
    }

    fn sample_tree() -> Vec<Node> {
        vec![
            node("root", None, 0),
            node("b", Some("root"), 2),
            node("a", Some("root"), 1),
            node("a1", Some("a"), 0),
            node("b1", Some("b"), 0),
            node("a1x", Some("a1"), 0),
            node("other", None, 5),
        ]
    }

    #[test]
    fn test_collect_subtree_ids_breadth_first() {
        let nodes = sample_tree();
        assert_eq!(collect_subtree_ids("a", &nodes), vec!["a", "a1", "a1x"]);
        assert_eq!(
            collect_subtree_ids("root", &nodes),
            vec!["root", "a", "b", "a1", "b1", "a1x"]
        );
    }

    #[test]
    fn test_collect_subtree_ids_survives_cycles() {
        let nodes = vec![node("x", Some("y"), 0), node("y", Some("x"), 0)];
        assert_eq!(collect_subtree_ids("x", &nodes), vec!["x", "y"]);
    }

    #[test]
    fn test_order_creation_parents_first() {
        let nodes = sample_tree();
        let by_id = index(&nodes);
        // Deliberately reversed input
        let mut ids = collect_subtree_ids("root", &nodes);
        ids.reverse();

        let order = order_creation(&ids, &by_id);
        assert!(order.is_clean());
        assert_eq!(order.ids, vec!["root", "a", "b", "a1", "b1", "a1x"]);

        let position: HashMap<&str, usize> =
            order.ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for id in &order.ids {
            if let Some(parent) = by_id[id].parent_id.as_deref() {
                if let Some(parent_pos) = position.get(parent) {
                    assert!(*parent_pos < position[id.as_str()], "{parent} after {id}");
                }
            }
        }
    }

    #[test]
    fn test_order_creation_roots_sorted_by_order() {
        let nodes = vec![node("late", Some("out"), 9), node("early", Some("out"), 1)];
        let ids = vec!["late".to_string(), "early".to_string()];
        let order = order_creation(&ids, &index(&nodes));
        assert_eq!(order.ids, vec!["early", "late"]);
    }

    #[test]
    fn test_order_creation_reports_cycles() {
        let nodes = vec![
            node("ok", None, 0),
            node("c1", Some("c2"), 0),
            node("c2", Some("c1"), 1),
        ];
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let order = order_creation(&ids, &index(&nodes));
        assert_eq!(order.ids.len(), 3);
        assert_eq!(order.ids[0], "ok");
        assert_eq!(order.anomalies.len(), 2);
        assert!(!order.is_clean());
    }
}
