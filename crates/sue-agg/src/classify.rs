//! Rule-based classification of one du row into one aggregation group.
//!
//! Pure logic. No IO, no state between rows.

use sue_du::Row;
use tracing::warn;

use crate::aggregator::AggregatorError;
use crate::labels::{AggregationGroup, Labels, DELETED};
use crate::rule::AggregationRule;

#[derive(Debug, Clone)]
pub struct Classifier {
    labels_with_defaults: Labels,
    rules: Vec<AggregationRule>,
}

impl Classifier {
    /// Fails when the caller tries to define the reserved [`DELETED`] label.
    ///
    /// Named groups and static labels that name no configured label can never
    /// take effect; they are reported as warnings.
    pub fn new(
        labels_with_defaults: Labels,
        rules: Vec<AggregationRule>,
    ) -> Result<Self, AggregatorError> {
        if labels_with_defaults.contains_key(DELETED) {
            return Err(AggregatorError::ReservedLabel(DELETED.to_string()));
        }
        for (i, rule) in rules.iter().enumerate() {
            for name in rule.pattern.group_names() {
                if !labels_with_defaults.contains_key(name) {
                    warn!(rule = i, group = name, "named group is not a configured label");
                }
            }
            for name in rule.static_labels.keys() {
                if !labels_with_defaults.contains_key(name) {
                    warn!(rule = i, label = %name, "static label is not a configured label");
                }
            }
        }
        Ok(Self {
            labels_with_defaults,
            rules,
        })
    }

    pub fn labels_with_defaults(&self) -> &Labels {
        &self.labels_with_defaults
    }

    /// First matching rule wins; no match falls back to the defaults verbatim.
    pub fn classify(&self, row: &Row) -> AggregationGroup {
        let deleted = row.is_deleted();
        for rule in &self.rules {
            let Some(caps) = rule.pattern.regex().captures(&row.dir) else {
                continue;
            };
            let labels = self
                .labels_with_defaults
                .iter()
                .map(|(label, default_val)| {
                    let value = first_non_empty(&[
                        caps.name(label).map(|m| m.as_str()),
                        rule.static_labels.get(label).map(String::as_str),
                        Some(default_val.as_str()),
                    ]);
                    (label.clone(), value.to_string())
                })
                .collect();
            return AggregationGroup::new(labels, deleted);
        }
        AggregationGroup::new(self.labels_with_defaults.clone(), deleted)
    }
}

/// Empty strings count as absent.
fn first_non_empty<'a>(candidates: &[Option<&'a str>]) -> &'a str {
    candidates
        .iter()
        .flatten()
        .copied()
        .find(|s| !s.is_empty())
        .unwrap_or("")
}
