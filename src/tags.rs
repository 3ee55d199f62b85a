//! Step tags and tag-query filtering.
//!
//! Tags are the only addressing mechanism the operator has for steps beyond
//! raw ids: every API operation that targets a subset of steps does so
//! through a tag query, and the match rule is always the same subset test.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Arbitrary key/value labels attached to a step.
///
/// Every step's tags always contain `name` (the step's human-readable name)
/// and `n` (its [`crate::types::StepId`] as a JSON number), set by
/// [`crate::step::StepRegistry::add_step`].
pub type Tags = FxHashMap<String, Value>;

/// A filter supplied by an API caller: a (possibly empty) set of key/value
/// pairs a step's tags must contain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagQuery(pub FxHashMap<String, Value>);

impl TagQuery {
    #[must_use]
    pub fn empty() -> Self {
        TagQuery(FxHashMap::default())
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut map = FxHashMap::default();
        for (k, v) in obj {
            map.insert(k.clone(), v.clone());
        }
        Some(TagQuery(map))
    }

    /// A step matches iff every key in the query appears in its tags with
    /// the same value. An empty query matches every step.
    #[must_use]
    pub fn matches(&self, tags: &Tags) -> bool {
        self.0
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(pairs: &[(&str, Value)]) -> Tags {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn empty_query_matches_everything() {
        let query = TagQuery::empty();
        assert!(query.matches(&tags(&[("name", json!("a"))])));
        assert!(query.matches(&Tags::default()));
    }

    #[test]
    fn query_is_pure_subset_test() {
        let query = TagQuery::from_json(&json!({"group": "etl"})).unwrap();
        assert!(query.matches(&tags(&[("group", json!("etl")), ("name", json!("a"))])));
        assert!(!query.matches(&tags(&[("group", json!("other"))])));
        assert!(!query.matches(&tags(&[("name", json!("a"))])));
    }
}
