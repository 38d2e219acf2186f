//! Aggregation rules as read from configuration.
//!
//! ```yaml
//! - pattern: '^(?P<container>[^/]+)/(?P<owner>[^/]+)'
//!   labels:
//!     dataset: misc
//! ```

use std::fmt;

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::labels::Labels;

/// A compiled regex that (de)serializes as its source string.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }

    /// Names of all named capture groups.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.0.capture_names().flatten()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source)
            .map_err(|e| de::Error::custom(format!("invalid rule pattern '{source}': {e}")))
    }
}

/// One classification rule. Named groups in `pattern` become label values;
/// a label not found as named group is looked up in `static_labels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationRule {
    pub pattern: Pattern,
    #[serde(
        rename = "labels",
        default,
        deserialize_with = "crate::labels::deserialize_labels"
    )]
    pub static_labels: Labels,
}

impl AggregationRule {
    pub fn new(pattern: Pattern, static_labels: Labels) -> Self {
        Self {
            pattern,
            static_labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_list_deserializes_from_yaml() {
        let yaml = r#"
- pattern: '^(?P<level1>special)(/|$)'
  labels:
    level2: sauce
- pattern: '^(?<level1>[^/]+)/(?<level2>[^/]+)'
"#;
        let rules: Vec<AggregationRule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern.as_str(), "^(?P<level1>special)(/|$)");
        assert_eq!(rules[0].static_labels["level2"], "sauce");
        assert!(rules[1].static_labels.is_empty());
        assert_eq!(
            rules[1].pattern.group_names().collect::<Vec<_>>(),
            vec!["level1", "level2"]
        );
    }

    #[test]
    fn scalar_label_values_are_kept_as_text() {
        let yaml = r#"
- pattern: '^(?<level1>archive)/'
  labels:
    year: 2024
    ratio: 0.5
    frozen: true
    note: ~
"#;
        let rules: Vec<AggregationRule> = serde_yaml::from_str(yaml).unwrap();
        let labels = &rules[0].static_labels;
        assert_eq!(labels["year"], "2024");
        assert_eq!(labels["ratio"], "0.5");
        assert_eq!(labels["frozen"], "true");
        assert_eq!(labels["note"], "");
    }

    #[test]
    fn nested_label_value_is_rejected() {
        let yaml = "- pattern: '^x'\n  labels:\n    level2: [a, b]\n";
        let err = serde_yaml::from_str::<Vec<AggregationRule>>(yaml).unwrap_err();
        assert!(err.to_string().contains("must be a scalar"), "{err}");
    }

    #[test]
    fn invalid_regex_is_rejected_at_load() {
        let err = serde_yaml::from_str::<Vec<AggregationRule>>("- pattern: '^(unclosed'\n")
            .unwrap_err();
        assert!(err.to_string().contains("invalid rule pattern"), "{err}");
    }

    #[test]
    fn pattern_serializes_as_source() {
        let p = Pattern::new("^a(?P<b>c)$").unwrap();
        assert_eq!(serde_json::to_string(&p).unwrap(), r#""^a(?P<b>c)$""#);
    }
}
