//! Reference rewriting for embedded JSON payloads
//!
//! Formula tokens, condition sets, table meta and a few node blobs embed ids
//! through a small tag grammar (`@value.<id>`, `@table.<id>`,
//! `node-formula:<id>` ...). Each string leaf is tokenized into literal text
//! and typed references, and every reference is resolved through the maps of
//! the current duplication pass. Object keys and non-string leaves are never
//! touched.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::models::CapacityRef;
use crate::suffix::{apply_once, has_numeric_suffix, starts_with_uuid, strip_trailing_suffix};

const SHARED_REF: &str = "shared-ref-";
const NODE_ID: &str = "node_";

/// Which id map a reference resolves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefTarget {
    Node,
    Formula,
    Condition,
    Table,
}

/// Old -> new id maps of one duplication pass
#[derive(Debug, Clone, Default)]
pub struct RewriteMaps {
    pub nodes: HashMap<String, String>,
    pub formulas: HashMap<String, String>,
    pub conditions: HashMap<String, String>,
    pub tables: HashMap<String, String>,
}

impl RewriteMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: RefTarget) -> &HashMap<String, String> {
        match target {
            RefTarget::Node => &self.nodes,
            RefTarget::Formula => &self.formulas,
            RefTarget::Condition => &self.conditions,
            RefTarget::Table => &self.tables,
        }
    }

    pub fn get_mut(&mut self, target: RefTarget) -> &mut HashMap<String, String> {
        match target {
            RefTarget::Node => &mut self.nodes,
            RefTarget::Formula => &mut self.formulas,
            RefTarget::Condition => &mut self.conditions,
            RefTarget::Table => &mut self.tables,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum IdChars {
    /// `[A-Za-z0-9_-]`
    Plain,
    /// `[A-Za-z0-9_:-]`
    Scoped,
}

struct TagRule {
    prefix: &'static str,
    target: RefTarget,
    chars: IdChars,
}

// Order matters: the typed `@value.` forms must win over the generic one, and
// `node-condition:` over `condition:`.
const TAG_RULES: [TagRule; 10] = [
    TagRule {
        prefix: "@value.node-formula:",
        target: RefTarget::Formula,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "@value.node-condition:",
        target: RefTarget::Condition,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "@value.condition:",
        target: RefTarget::Condition,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "@value.node-table:",
        target: RefTarget::Table,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "@value.",
        target: RefTarget::Node,
        chars: IdChars::Scoped,
    },
    TagRule {
        prefix: "@table.",
        target: RefTarget::Table,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "node-formula:",
        target: RefTarget::Formula,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "node-condition:",
        target: RefTarget::Condition,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "condition:",
        target: RefTarget::Condition,
        chars: IdChars::Plain,
    },
    TagRule {
        prefix: "node-table:",
        target: RefTarget::Table,
        chars: IdChars::Plain,
    },
];

/// A reference recognised inside a string leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefToken<'a> {
    /// Tag prefix exactly as written, empty for bare ids
    pub prefix: &'static str,
    pub id: &'a str,
    pub target: RefTarget,
}

impl RefToken<'_> {
    pub fn is_bare(&self) -> bool {
        self.prefix.is_empty()
    }

    pub fn is_shared_ref(&self) -> bool {
        self.target == RefTarget::Node && self.id.starts_with(SHARED_REF)
    }

    /// The canonical capacity reference, `None` for node references
    pub fn capacity_ref(&self) -> Option<CapacityRef> {
        let id = self.id.to_string();
        match self.target {
            RefTarget::Node => None,
            RefTarget::Formula => Some(CapacityRef::Formula(id)),
            RefTarget::Condition => Some(CapacityRef::Condition(id)),
            RefTarget::Table => Some(CapacityRef::Table(id)),
        }
    }
}

/// A string leaf split into literal text and references
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Ref(RefToken<'a>),
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn id_len(text: &str, chars: IdChars) -> usize {
    text.bytes()
        .take_while(|&b| {
            b.is_ascii_alphanumeric()
                || b == b'_'
                || b == b'-'
                || (matches!(chars, IdChars::Scoped) && b == b':')
        })
        .count()
}

/// Length of a bare UUID plus any `-{token}` suffix groups at the start of `text`
fn bare_uuid_len(text: &str) -> Option<usize> {
    if !starts_with_uuid(text) {
        return None;
    }
    let mut end = 36;
    loop {
        let group = text[end..]
            .strip_prefix('-')
            .map_or(0, |tail| tail.bytes().take_while(|&b| is_word_char(b as char)).count());
        if group == 0 {
            break;
        }
        end += 1 + group;
    }
    if text[end..].chars().next().map_or(false, is_word_char) {
        return None;
    }
    Some(end)
}

/// Length of a bare `node_*` / `shared-ref-*` id; the id must end alphanumeric
fn bare_prefixed_len(text: &str, prefix: &str) -> Option<usize> {
    if !text.starts_with(prefix) {
        return None;
    }
    let bytes = text.as_bytes();
    let mut len = id_len(text, IdChars::Plain);
    while len > prefix.len() && !bytes[len - 1].is_ascii_alphanumeric() {
        len -= 1;
    }
    (len > prefix.len()).then_some(len)
}

fn match_at(text: &str, pos: usize) -> Option<(RefToken<'_>, usize)> {
    let rest = &text[pos..];
    let at_boundary = text[..pos].chars().next_back().map_or(true, |c| !is_word_char(c));

    for rule in TAG_RULES.iter() {
        if !rest.starts_with(rule.prefix) {
            continue;
        }
        if !rule.prefix.starts_with('@') && !at_boundary {
            continue;
        }
        let id_start = pos + rule.prefix.len();
        let len = id_len(&text[id_start..], rule.chars);
        if len == 0 {
            continue;
        }
        let token = RefToken {
            prefix: rule.prefix,
            id: &text[id_start..id_start + len],
            target: rule.target,
        };
        return Some((token, id_start + len));
    }

    if !at_boundary {
        return None;
    }
    let len = bare_uuid_len(rest)
        .or_else(|| bare_prefixed_len(rest, NODE_ID))
        .or_else(|| bare_prefixed_len(rest, SHARED_REF))?;
    let token = RefToken {
        prefix: "",
        id: &rest[..len],
        target: RefTarget::Node,
    };
    Some((token, pos + len))
}

/// Splits a string into literal text and references, left to right
pub fn tokenize(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;

    while pos < text.len() {
        match match_at(text, pos) {
            Some((token, end)) => {
                if literal_start < pos {
                    segments.push(Segment::Text(&text[literal_start..pos]));
                }
                segments.push(Segment::Ref(token));
                pos = end;
                literal_start = end;
            }
            None => pos += text[pos..].chars().next().map_or(1, char::len_utf8),
        }
    }
    if literal_start < text.len() {
        segments.push(Segment::Text(&text[literal_start..]));
    }
    segments
}

/// Resolves one reference, `None` meaning "leave as written"
fn resolve(token: &RefToken<'_>, maps: &RewriteMaps, suffix: Option<&str>) -> Option<String> {
    let map = maps.get(token.target);
    if let Some(mapped) = map.get(token.id) {
        return Some(mapped.clone());
    }

    let clean = strip_trailing_suffix(token.id);
    // A bare id that already carries a suffix was produced by an earlier pass
    if token.is_bare() && clean.len() != token.id.len() {
        return None;
    }
    if let Some(mapped) = map.get(clean) {
        return Some(mapped.clone());
    }
    suffix.map(|s| apply_once(clean, s))
}

/// Rewrites every reference inside one string
pub fn rewrite_str(text: &str, maps: &RewriteMaps, suffix: Option<&str>) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for segment in tokenize(text) {
        match segment {
            Segment::Text(literal) => out.push_str(literal),
            Segment::Ref(token) => {
                out.push_str(token.prefix);
                match resolve(&token, maps, suffix) {
                    Some(id) => out.push_str(&id),
                    None => out.push_str(token.id),
                }
            }
        }
    }
    out
}

/// Rebuilds `value` with every string leaf passed through `f`
fn map_strings<F>(value: &Value, f: &mut F) -> Value
where
    F: FnMut(&str) -> String,
{
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| map_strings(item, f)).collect())
        }
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), map_strings(field, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Calls `f` for every string leaf of `value`
pub fn visit_strings<F>(value: &Value, f: &mut F)
where
    F: FnMut(&str),
{
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|item| visit_strings(item, f)),
        Value::Object(fields) => fields.values().for_each(|field| visit_strings(field, f)),
        _ => {}
    }
}

/// Rewrites every reference in a JSON payload.
///
/// Applying it twice with the same maps and suffix gives the same result as
/// applying it once.
pub fn rewrite_value(value: &Value, maps: &RewriteMaps, suffix: Option<&str>) -> Value {
    map_strings(value, &mut |s| rewrite_str(s, maps, suffix))
}

/// Suffixes strings that are exactly `@value.shared-ref-*` and not yet suffixed.
///
/// Used inside repeat contexts where shared references must be duplicated too.
/// Ids with an entry in `node_map` are left for [`rewrite_value`] to resolve.
pub fn force_shared_ref_suffixes(
    value: &Value,
    suffix: &str,
    node_map: &HashMap<String, String>,
) -> Value {
    map_strings(value, &mut |s| match s.strip_prefix("@value.") {
        Some(id)
            if id.len() > SHARED_REF.len()
                && id.starts_with(SHARED_REF)
                && id_len(id, IdChars::Plain) == id.len()
                && !has_numeric_suffix(id)
                && !node_map.contains_key(id) =>
        {
            format!("@value.{}", apply_once(id, suffix))
        }
        _ => s.to_string(),
    })
}

const INTERNAL_ID_PREFIXES: [&str; 5] = ["b_", "a_", "bin_", "fb_", "cond_"];

/// Condition-internal structural ids (`b_*`, `a_*`, `bin_*`, `fb_*`, `cond_*`)
pub fn is_internal_id(id: &str) -> bool {
    INTERNAL_ID_PREFIXES.iter().any(|prefix| {
        id.strip_prefix(prefix)
            .map_or(false, |rest| !rest.is_empty() && id_len(rest, IdChars::Plain) == rest.len())
    })
}

/// Suffixes internal ids stored under `id` keys, leaving external references alone
pub fn regenerate_internal_ids(value: &Value, suffix: &str) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| {
                    let field = match field {
                        Value::String(id) if key == "id" && is_internal_id(id) => {
                            Value::String(apply_once(id, suffix))
                        }
                        other => regenerate_internal_ids(other, suffix),
                    };
                    (key.clone(), field)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| regenerate_internal_ids(item, suffix))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replaces string leaves that exactly equal a key of `map`
pub fn remap_exact_strings(value: &Value, map: &HashMap<String, String>) -> Value {
    if map.is_empty() {
        return value.clone();
    }
    map_strings(value, &mut |s| map.get(s).cloned().unwrap_or_else(|| s.to_string()))
}

/// Capacity references embedded anywhere in a payload
pub fn collect_capacity_refs(value: &Value) -> BTreeSet<CapacityRef> {
    let mut refs = BTreeSet::new();
    visit_strings(value, &mut |s| {
        let before = refs.len();
        for segment in tokenize(s) {
            if let Segment::Ref(token) = segment {
                refs.extend(token.capacity_ref());
            }
        }
        // Canonical `formula:<id>` / `table:<id>` spellings only appear as whole strings
        if refs.len() == before {
            refs.extend(CapacityRef::parse(s));
        }
    });
    refs
}

/// Node ids referenced anywhere in a payload, as written
pub fn collect_node_refs(value: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    visit_strings(value, &mut |s| {
        for segment in tokenize(s) {
            if let Segment::Ref(token) = segment {
                if token.target == RefTarget::Node {
                    ids.insert(token.id.to_string());
                }
            }
        }
    });
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const UUID_A: &str = "702d1b09-abc9-4096-9aaa-771550000001";

    fn maps_with_nodes(pairs: &[(&str, &str)]) -> RewriteMaps {
        let mut maps = RewriteMaps::new();
        for (old, new) in pairs {
            maps.nodes.insert(old.to_string(), new.to_string());
        }
        maps
    }

    #[test]
    fn test_rewrite_formula_tokens() {
        let maps = maps_with_nodes(&[("N2", "N2-2")]);
        let tokens = json!(["@value.N2", "+", "5"]);
        assert_eq!(rewrite_value(&tokens, &maps, Some("2")), json!(["@value.N2-2", "+", "5"]));
    }

    #[test]
    fn test_typed_prefixes_take_precedence() {
        let mut maps = RewriteMaps::new();
        maps.formulas.insert("f1".into(), "f1-9".into());
        maps.conditions.insert("c1".into(), "c1-9".into());
        maps.tables.insert("t1".into(), "t1-9".into());

        let cases = [
            ("@value.node-formula:f1", "@value.node-formula:f1-9"),
            ("@value.node-condition:c1", "@value.node-condition:c1-9"),
            ("@value.condition:c1", "@value.condition:c1-9"),
            ("@value.node-table:t1", "@value.node-table:t1-9"),
            ("@table.t1", "@table.t1-9"),
            ("node-formula:f1", "node-formula:f1-9"),
            ("node-condition:c1", "node-condition:c1-9"),
            ("condition:c1", "condition:c1-9"),
            ("node-table:t1", "node-table:t1-9"),
        ];
        for (input, expected) in cases {
            assert_eq!(rewrite_str(input, &maps, None), expected, "input={input}");
        }
    }

    #[test]
    fn test_shared_ref_exemption() {
        let maps = RewriteMaps::new();
        assert_eq!(rewrite_str("@value.shared-ref-abc", &maps, None), "@value.shared-ref-abc");
        assert_eq!(
            rewrite_str("@value.shared-ref-abc", &maps, Some("2")),
            "@value.shared-ref-abc-2"
        );

        let mapped = maps_with_nodes(&[("shared-ref-abc", "shared-ref-abc-7")]);
        assert_eq!(rewrite_str("@value.shared-ref-abc", &mapped, None), "@value.shared-ref-abc-7");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let maps = maps_with_nodes(&[("N1", "N1-2"), ("node_abc", "node_abc-2")]);
        let payload = json!({
            "tokens": ["@value.N1", "*", "@value.other", "@table.t5"],
            "branches": [{
                "when": {"left": {"ref": "@value.node-formula:f1"}, "op": "gt", "right": 3},
                "actions": [{"nodeIds": [UUID_A, "node_abc", "shared-ref-x1", "node_q-"]}]
            }],
            "text": "sum(@value.N1, node-condition:c2)"
        });
        let once = rewrite_value(&payload, &maps, Some("2"));
        let twice = rewrite_value(&once, &maps, Some("2"));
        assert_eq!(once, twice);

        assert_eq!(once["tokens"], json!(["@value.N1-2", "*", "@value.other-2", "@table.t5-2"]));
        assert_eq!(
            once["branches"][0]["actions"][0]["nodeIds"],
            json!([format!("{UUID_A}-2"), "node_abc-2", "shared-ref-x1-2", "node_q-2-"])
        );
        assert_eq!(once["text"], json!("sum(@value.N1-2, node-condition:c2-2)"));
        assert_eq!(once["branches"][0]["when"]["right"], json!(3));
    }

    #[test]
    fn test_prefixed_ids_are_restripped() {
        let maps = RewriteMaps::new();
        assert_eq!(rewrite_str("@value.N7-1-1", &maps, Some("3")), "@value.N7-3");
        assert_eq!(rewrite_str("@value.N7-1", &maps, None), "@value.N7-1");
    }

    #[test]
    fn test_bare_ids_with_suffix_are_left_alone() {
        let maps = RewriteMaps::new();
        let suffixed = format!("{UUID_A}-4");
        assert_eq!(rewrite_str(&suffixed, &maps, Some("2")), suffixed);
        assert_eq!(rewrite_str("node_x-4", &maps, Some("2")), "node_x-4");

        let mapped = maps_with_nodes(&[("node_x-4", "node_x-9")]);
        assert_eq!(rewrite_str("node_x-4", &mapped, Some("2")), "node_x-9");
    }

    #[test]
    fn test_uuid_with_opaque_suffix_is_idempotent() {
        const UUID_B: &str = "702d1b09-abc9-4096-9aaa-771550000002";
        let maps = maps_with_nodes(&[(UUID_B, &format!("{UUID_B}-copy"))]);
        let payload = json!({"nodeIds": [UUID_A, UUID_B], "ref": format!("@value.{UUID_A}")});

        let once = rewrite_value(&payload, &maps, Some("copy"));
        let twice = rewrite_value(&once, &maps, Some("copy"));

        assert_eq!(once, twice);
        assert_eq!(
            once["nodeIds"],
            json!([format!("{UUID_A}-copy"), format!("{UUID_B}-copy")])
        );
        assert_eq!(once["ref"], json!(format!("@value.{UUID_A}-copy")));

        let copied = format!("{UUID_A}-copy");
        let text = format!("{copied} x");
        assert_eq!(
            tokenize(&text)[0],
            Segment::Ref(RefToken {
                prefix: "",
                id: copied.as_str(),
                target: RefTarget::Node,
            })
        );
    }

    #[test]
    fn test_word_boundaries() {
        let maps = RewriteMaps::new();
        assert_eq!(rewrite_str("xnode_abc", &maps, Some("2")), "xnode_abc");
        assert_eq!(rewrite_str("mycondition:c1", &maps, Some("2")), "mycondition:c1");
        assert_eq!(rewrite_str("(node_abc)", &maps, Some("2")), "(node_abc-2)");
        assert_eq!(rewrite_str("plain text", &maps, Some("2")), "plain text");
    }

    #[test]
    fn test_keys_and_scalars_untouched() {
        let maps = maps_with_nodes(&[("node_k", "node_k-2")]);
        let payload = json!({"node_k": 1, "flag": true, "none": null});
        assert_eq!(rewrite_value(&payload, &maps, Some("2")), payload);
    }

    #[test]
    fn test_tokenize_segments() {
        let segments = tokenize("a @table.t1 b");
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Ref(RefToken {
                    prefix: "@table.",
                    id: "t1",
                    target: RefTarget::Table
                }),
                Segment::Text(" b"),
            ]
        );
    }

    #[test]
    fn test_regenerate_internal_ids() {
        let set = json!({
            "branches": [{"id": "b_1", "actions": [{"id": "a_x", "nodeIds": ["node_n"]}]}],
            "fallback": {"id": "fb_z"},
            "id": "cond_9",
            "ref": "b_not_an_id_key",
            "other": {"id": "node_keep"}
        });
        let regenerated = regenerate_internal_ids(&set, "2");
        assert_eq!(regenerated["branches"][0]["id"], json!("b_1-2"));
        assert_eq!(regenerated["branches"][0]["actions"][0]["id"], json!("a_x-2"));
        assert_eq!(regenerated["fallback"]["id"], json!("fb_z-2"));
        assert_eq!(regenerated["id"], json!("cond_9-2"));
        assert_eq!(regenerated["ref"], json!("b_not_an_id_key"));
        assert_eq!(regenerated["other"]["id"], json!("node_keep"));
        assert_eq!(regenerate_internal_ids(&regenerated, "2"), regenerated);
    }

    #[test]
    fn test_force_shared_ref_suffixes() {
        let payload = json!([
            "@value.shared-ref-a",
            "@value.shared-ref-b-1",
            "x @value.shared-ref-c",
            "@value.n1",
            "@value.shared-ref-kept"
        ]);
        let node_map = HashMap::from([(
            "shared-ref-kept".to_string(),
            "shared-ref-kept".to_string(),
        )]);
        assert_eq!(
            force_shared_ref_suffixes(&payload, "3", &node_map),
            json!([
                "@value.shared-ref-a-3",
                "@value.shared-ref-b-1",
                "x @value.shared-ref-c",
                "@value.n1",
                "@value.shared-ref-kept"
            ])
        );
    }

    #[test]
    fn test_remap_exact_strings() {
        let map = HashMap::from([("col_1".to_string(), "col_1-2".to_string())]);
        let meta = json!({"lookup": {"column": "col_1", "label": "col_1 total"}});
        assert_eq!(
            remap_exact_strings(&meta, &map),
            json!({"lookup": {"column": "col_1-2", "label": "col_1 total"}})
        );
    }

    #[test]
    fn test_collect_refs() {
        let payload = json!({
            "tokens": ["@value.n1", "@value.node-formula:f1", {"ref": "formula:f2"}],
            "actions": [{"nodeIds": ["shared-ref-s", UUID_A]}],
            "lookup": "@table.t1"
        });
        let capacities = collect_capacity_refs(&payload);
        assert!(capacities.contains(&CapacityRef::Formula("f1".into())));
        assert!(capacities.contains(&CapacityRef::Formula("f2".into())));
        assert!(capacities.contains(&CapacityRef::Table("t1".into())));
        assert_eq!(capacities.len(), 3);

        let nodes = collect_node_refs(&payload);
        let expected: BTreeSet<String> = ["n1", "shared-ref-s", UUID_A]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(nodes, expected);
    }
}
