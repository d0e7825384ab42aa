//! Suffix policy for duplicated identifiers
//!
//! A duplicated id has the shape `{originalId}-{suffix}`. Everything in this
//! module keeps ids at a single suffix segment, no matter how often the
//! helpers are applied.

use uuid::Uuid;

use crate::error::{CopyError, CopyResult};

/// Upper bound for the disambiguation counter of one duplication pass
pub const DEFAULT_DISAMBIGUATION_LIMIT: u32 = 1000;

/// Ids starting with this prefix keep it intact when suffixes are stripped
const SHARED_REF_PREFIX: &str = "shared-ref-";

/// Returns true when `text` starts with a hyphenated UUID
pub fn starts_with_uuid(text: &str) -> bool {
    text.get(..36).map_or(false, |head| {
        let bytes = head.as_bytes();
        [8, 13, 18, 23].iter().all(|&i| bytes[i] == b'-') && Uuid::try_parse(head).is_ok()
    })
}

/// Index below which no dash may be treated as a suffix separator
fn protected_floor(id: &str) -> usize {
    if id.starts_with(SHARED_REF_PREFIX) {
        SHARED_REF_PREFIX.len() + 1
    } else if starts_with_uuid(id) {
        37
    } else {
        1
    }
}

/// Removes one or more trailing `-{digits}` groups (`"a-1-2"` -> `"a"`).
///
/// The leading `shared-ref-` marker and a leading UUID are never eaten, and an
/// id made only of a suffix group (`"-1"`) is returned unchanged.
pub fn strip_trailing_suffix(id: &str) -> &str {
    let floor = protected_floor(id);
    let mut end = id.len();
    while let Some(dash) = id[..end].rfind('-') {
        let tail = &id[dash + 1..end];
        if dash < floor || tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        end = dash;
    }
    &id[..end]
}

/// Returns true when `id` ends with at least one `-{digits}` group
pub fn has_numeric_suffix(id: &str) -> bool {
    strip_trailing_suffix(id).len() != id.len()
}

/// Strips any existing suffix chain and appends exactly one `-{suffix}`.
///
/// Opaque (non numeric) suffix tokens are stripped too when already present,
/// so `apply_once(apply_once(x, s), s) == apply_once(x, s)` for every `s`.
pub fn apply_once(id: &str, suffix: &str) -> String {
    let token = format!("-{}", suffix);
    let base = id.strip_suffix(token.as_str()).unwrap_or(id);
    format!("{}-{}", strip_trailing_suffix(base), suffix)
}

/// Returns `max(n) + 1` over sibling ids shaped `{base_id}-{n}`, or 1.
///
/// Composite suffixes (`{base_id}-1-2`) are ignored.
pub fn derive_next_suffix<S: AsRef<str>>(sibling_ids: &[S], base_id: &str) -> u32 {
    let prefix = format!("{}-", base_id);
    sibling_ids
        .iter()
        .filter_map(|id| id.as_ref().strip_prefix(prefix.as_str()))
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|rest| rest.parse::<u32>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

/// Monotonic counter used to disambiguate unique-key collisions within one pass
#[derive(Debug, Clone)]
pub struct DisambiguationCounter {
    next: u32,
    limit: u32,
}

impl Default for DisambiguationCounter {
    fn default() -> Self {
        Self::new(DEFAULT_DISAMBIGUATION_LIMIT)
    }
}

impl DisambiguationCounter {
    pub fn new(limit: u32) -> Self {
        Self { next: 1, limit }
    }

    /// Hands out the next counter value, or `None` once the limit is reached
    pub fn next_value(&mut self) -> Option<u32> {
        if self.next > self.limit {
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(value)
    }

    /// Finds the first `{base}-{n}` candidate for which `is_taken` returns false
    pub fn disambiguate<F>(
        &mut self,
        entity: &'static str,
        base: &str,
        mut is_taken: F,
    ) -> CopyResult<String>
    where
        F: FnMut(&str) -> anyhow::Result<bool>,
    {
        while let Some(n) = self.next_value() {
            let candidate = format!("{}-{}", base, n);
            if !is_taken(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(CopyError::DisambiguationExhausted {
            entity,
            key: base.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_trailing_suffix() {
        assert_eq!(strip_trailing_suffix("node-1"), "node");
        assert_eq!(strip_trailing_suffix("node-1-2"), "node");
        assert_eq!(strip_trailing_suffix("node"), "node");
        assert_eq!(strip_trailing_suffix("node-a1"), "node-a1");
        assert_eq!(strip_trailing_suffix("node-"), "node-");
        assert_eq!(strip_trailing_suffix("-1"), "-1");
    }

    #[test]
    fn test_strip_keeps_protected_prefixes() {
        assert_eq!(strip_trailing_suffix("shared-ref-1699"), "shared-ref-1699");
        assert_eq!(strip_trailing_suffix("shared-ref-1699-2"), "shared-ref-1699");
        let uuid = "702d1b09-abc9-4096-9aaa-771550000001";
        assert_eq!(strip_trailing_suffix(uuid), uuid);
        assert_eq!(strip_trailing_suffix(&format!("{uuid}-3")), uuid);
        assert!(starts_with_uuid(uuid));
        assert!(!starts_with_uuid("node_abc"));
    }

    #[test]
    fn test_has_numeric_suffix() {
        assert!(has_numeric_suffix("f1-3"));
        assert!(!has_numeric_suffix("f1"));
        assert!(!has_numeric_suffix("shared-ref-abc"));
    }

    #[test]
    fn test_apply_once_never_doubles() {
        let ids = ["x", "x-1", "x-1-2", "node_abc", "shared-ref-q"];
        for id in ids {
            for suffix in ["1", "2", "copy"] {
                let once = apply_once(id, suffix);
                assert_eq!(apply_once(&once, suffix), once, "id={id} suffix={suffix}");
            }
        }
        assert_eq!(apply_once("x-1-2", "3"), "x-3");
        assert_eq!(apply_once("x-copy", "copy"), "x-copy");
    }

    #[test]
    fn test_derive_next_suffix() {
        let ids = vec!["root", "root-1", "root-3", "root-1-2", "root-x", "other-9"];
        assert_eq!(derive_next_suffix(&ids, "root"), 4);

        let none: Vec<String> = Vec::new();
        assert_eq!(derive_next_suffix(&none, "root"), 1);
    }

    #[test]
    fn test_disambiguation_counter_is_monotonic() {
        let mut counter = DisambiguationCounter::default();
        let first = counter.disambiguate("Variable", "key-2", |_| Ok(false)).unwrap();
        let second = counter.disambiguate("Variable", "key-2", |_| Ok(false)).unwrap();
        assert_eq!(first, "key-2-1");
        assert_eq!(second, "key-2-2");
    }

    #[test]
    fn test_disambiguation_counter_skips_taken() {
        let mut counter = DisambiguationCounter::default();
        let taken = ["key-1", "key-2"];
        let resolved = counter
            .disambiguate("Variable", "key", |c| Ok(taken.contains(&c)))
            .unwrap();
        assert_eq!(resolved, "key-3");
    }

    #[test]
    fn test_disambiguation_counter_exhausts() {
        let mut counter = DisambiguationCounter::new(2);
        let result = counter.disambiguate("Variable", "key", |_| Ok(true));
        assert!(matches!(result, Err(CopyError::DisambiguationExhausted { .. })));
    }
}
