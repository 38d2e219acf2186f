//! sue-config
//!
//! Layered YAML configuration for the exporter.
//!
//! Documents are merged in order (earlier = base, later = override; maps merge
//! key by key, everything else is replaced), then deserialized into [`Config`].
//! The merged document is canonicalised and hashed so a running exporter can
//! log exactly which effective configuration it was started with.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sue_agg::{AggregationRule, Labels};
use sue_du::local::LocalInventoryConfig;

pub const DEFAULT_METRIC_NAMESPACE: &str = "azure";
pub const DEFAULT_METRIC_SUBSYSTEM: &str = "storage";
pub const DEFAULT_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub inventory: Option<LocalInventoryConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Label names with their default values.
    #[serde(default, deserialize_with = "sue_agg::deserialize_labels")]
    pub labels: Labels,
    #[serde(default)]
    pub rules: Vec<AggregationRule>,
}

impl Config {
    /// The inventory section; required to start the exporter.
    pub fn inventory(&self) -> Result<&LocalInventoryConfig> {
        match &self.inventory {
            Some(inventory) => Ok(inventory),
            None => bail!("inventory config is required"),
        }
    }

    /// CLI/env override of `inventory.root`; creates the section when absent.
    pub fn override_inventory_root(&mut self, root: impl Into<PathBuf>) {
        let root = root.into();
        match &mut self.inventory {
            Some(inventory) => inventory.root = root,
            None => self.inventory = Some(LocalInventoryConfig::new(root)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metric_namespace")]
    pub metric_namespace: String,
    #[serde(default = "default_metric_subsystem")]
    pub metric_subsystem: String,
    /// Maximum number of usage series published (cardinality cap).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metric_namespace: default_metric_namespace(),
            metric_subsystem: default_metric_subsystem(),
            limit: DEFAULT_LIMIT,
        }
    }
}

fn default_metric_namespace() -> String {
    DEFAULT_METRIC_NAMESPACE.to_string()
}

fn default_metric_subsystem() -> String {
    DEFAULT_METRIC_SUBSYSTEM.to_string()
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
    pub canonical_json: String,
}

pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    if paths.is_empty() {
        bail!("at least one config file is required");
    }
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let p = p.as_ref();
        let raw = fs::read_to_string(p)
            .with_context(|| format!("failed to read yaml path: {}", p.display()))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for (i, raw) in yaml_docs.iter().enumerate() {
        let v_yaml: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("invalid yaml (layer {i})"))?;
        if v_yaml.is_null() {
            // empty document
            continue;
        }
        let v_json = serde_json::to_value(v_yaml)
            .with_context(|| format!("yaml->json conversion failed (layer {i})"))?;
        merged = deep_merge(merged, v_json);
    }

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    let config: Config =
        serde_json::from_value(merged).context("config does not match the expected schema")?;

    Ok(LoadedConfig {
        config,
        config_hash,
        canonical_json,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// `serde_json::Map` is ordered by key (no `preserve_order`), so this is stable
/// regardless of key order in the source documents.
fn canonicalize_json(v: &Value) -> Result<String> {
    serde_json::to_string(v).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
