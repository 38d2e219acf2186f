//! Label sets, aggregation groups and results.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sue_du::StorageUsage;

/// Reserved label carrying the row's soft-delete state.
pub const DELETED: &str = "deleted";

/// Label name → value. Ordered, so serialization is canonical.
pub type Labels = BTreeMap<String, String>;

/// Deserialize a label map whose values may be written as scalars.
///
/// Config files often say `year: 2024` or `archived: true`; those values are
/// kept as their text form. `null` becomes the empty string. Lists and maps
/// are rejected.
pub fn deserialize_labels<'de, D>(deserializer: D) -> Result<Labels, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(de::Error::custom(format!(
                        "label '{name}' must be a scalar value"
                    )))
                }
            };
            Ok((name, text))
        })
        .collect()
}

/// The resolved identity rows are merged under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationGroup {
    pub labels: Labels,
    pub deleted: bool,
}

impl AggregationGroup {
    pub fn new(labels: Labels, deleted: bool) -> Self {
        Self { labels, deleted }
    }

    /// Stable string form used as merge key.
    ///
    /// Structurally equal groups always produce the same key: fields are
    /// emitted in declaration order and label keys lexicographically.
    pub fn canonical_key(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_canonical_key(key: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(key)
    }

    /// All labels of this group including [`DELETED`], as published.
    pub fn metric_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert(DELETED.to_string(), self.deleted.to_string());
        labels
    }
}

/// A group plus its summed usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub group: AggregationGroup,
    pub storage_usage: StorageUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn canonical_key_ignores_insertion_order() {
        let mut a = Labels::new();
        a.insert("zeta".into(), "1".into());
        a.insert("alpha".into(), "2".into());
        let mut b = Labels::new();
        b.insert("alpha".into(), "2".into());
        b.insert("zeta".into(), "1".into());

        let ka = AggregationGroup::new(a, false).canonical_key().unwrap();
        let kb = AggregationGroup::new(b, false).canonical_key().unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka, r#"{"labels":{"alpha":"2","zeta":"1"},"deleted":false}"#);
    }

    #[test]
    fn deleted_flag_is_part_of_identity() {
        let l = labels(&[("level1", "dir1")]);
        let live = AggregationGroup::new(l.clone(), false);
        let gone = AggregationGroup::new(l, true);
        assert_ne!(
            live.canonical_key().unwrap(),
            gone.canonical_key().unwrap()
        );
    }

    #[test]
    fn canonical_key_decodes_to_same_group() {
        let g = AggregationGroup::new(labels(&[("a", "x/y"), ("b", "\"quoted\"")]), true);
        let back = AggregationGroup::from_canonical_key(&g.canonical_key().unwrap()).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn metric_labels_include_deleted() {
        let g = AggregationGroup::new(labels(&[("owner", "me")]), true);
        assert_eq!(
            g.metric_labels(),
            labels(&[("deleted", "true"), ("owner", "me")])
        );
    }
}
