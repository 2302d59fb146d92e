use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CONFIG_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "type": "object",
  "properties": {
    "transformers": {
      "type": "object",
      "additionalProperties": { "type": "boolean" }
    },
    "world": {
      "type": "object",
      "properties": {
        "retryCount": { "type": "integer", "minimum": 1, "maximum": 100 },
        "retryDelayMs": { "type": "integer", "minimum": 0, "maximum": 5000 }
      }
    },
    "interactionTimeout": {
      "type": "object",
      "properties": {
        "baseTimeoutMs": { "type": "integer", "minimum": 0 },
        "pingMultiplier": { "type": "number", "minimum": 0 }
      }
    },
    "early": {
      "type": "object",
      "properties": {
        "logging": {
          "type": "object",
          "properties": {
            "verbose": { "type": "boolean" }
          }
        }
      }
    }
  }
}"#;

/// On-disk `config.json`. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EarlyPluginConfig {
    /// Transformer name to enabled flag; names not listed stay enabled.
    pub transformers: BTreeMap<String, bool>,
    pub world: WorldConfig,
    pub interaction_timeout: InteractionTimeoutConfig,
    pub early: EarlyConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldConfig {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_delay_ms: 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractionTimeoutConfig {
    pub base_timeout_ms: i64,
    pub ping_multiplier: f64,
}

impl Default for InteractionTimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 6000,
            ping_multiplier: 3.0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EarlyConfig {
    pub logging: EarlyLoggingConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EarlyLoggingConfig {
    pub verbose: bool,
}

/// Read-only view of the configuration consumed by the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigSnapshot {
    enabled: BTreeMap<String, bool>,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub base_timeout_ms: i64,
    pub ping_multiplier: f64,
    pub verbose: bool,
}

impl ConfigSnapshot {
    pub fn is_enabled(&self, transformer: &str) -> bool {
        self.enabled.get(transformer).copied().unwrap_or(true)
    }

    /// Copy with one transformer switched on or off.
    pub fn with_enabled(mut self, transformer: &str, enabled: bool) -> Self {
        self.enabled.insert(transformer.to_string(), enabled);
        self
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        EarlyPluginConfig::default().into()
    }
}

impl From<EarlyPluginConfig> for ConfigSnapshot {
    fn from(config: EarlyPluginConfig) -> Self {
        Self {
            enabled: config.transformers,
            retry_count: config.world.retry_count,
            retry_delay_ms: config.world.retry_delay_ms,
            base_timeout_ms: config.interaction_timeout.base_timeout_ms,
            ping_multiplier: config.interaction_timeout.ping_multiplier,
            verbose: config.early.logging.verbose,
        }
    }
}

/// Validate `text` against the embedded schema and deserialize it.
pub fn parse_config(text: &str) -> Result<EarlyPluginConfig> {
    let instance: Value = serde_json::from_str(text).context("config is not valid JSON")?;
    let schema: Value =
        serde_json::from_str(CONFIG_SCHEMA).context("embedded config schema is not valid JSON")?;
    let compiled = JSONSchema::compile(&schema)
        .map_err(|error| anyhow::anyhow!("embedded config schema does not compile: {error}"))?;
    if let Err(errors) = compiled.validate(&instance) {
        let messages: Vec<String> = errors
            .map(|error| error.to_string())
            .collect();
        anyhow::bail!("config does not match schema: {}", messages.join("; "));
    }
    serde_json::from_value(instance).context("failed to deserialize config")
}

pub fn load_config(path: &Path) -> Result<ConfigSnapshot> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config = parse_config(&text).with_context(|| format!("invalid {}", path.display()))?;
    Ok(config.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = parse_config("{}").expect("parse config");
        let snapshot = ConfigSnapshot::from(config);

        assert_eq!(ConfigSnapshot::default(), snapshot);
        assert_eq!(5, snapshot.retry_count);
        assert_eq!(20, snapshot.retry_delay_ms);
        assert_eq!(6000, snapshot.base_timeout_ms);
        assert_eq!(3.0, snapshot.ping_multiplier);
        assert!(!snapshot.verbose);
    }

    #[test]
    fn unknown_transformers_default_to_enabled() {
        let config = parse_config(r#"{"transformers": {"world": false}}"#).expect("parse config");
        let snapshot = ConfigSnapshot::from(config);

        assert!(!snapshot.is_enabled("world"));
        assert!(snapshot.is_enabled("tickingThread"));
    }

    #[test]
    fn nested_values_are_read_in_camel_case() {
        let config = parse_config(
            r#"{
                "world": {"retryCount": 8, "retryDelayMs": 50},
                "interactionTimeout": {"baseTimeoutMs": 9000, "pingMultiplier": 4.5},
                "early": {"logging": {"verbose": true}}
            }"#,
        )
        .expect("parse config");

        assert_eq!(8, config.world.retry_count);
        assert_eq!(50, config.world.retry_delay_ms);
        assert_eq!(9000, config.interaction_timeout.base_timeout_ms);
        assert_eq!(4.5, config.interaction_timeout.ping_multiplier);
        assert!(config.early.logging.verbose);
    }

    #[test]
    fn schema_rejects_out_of_range_retry_count() {
        let error = parse_config(r#"{"world": {"retryCount": 0}}"#).expect_err("schema violation");

        assert!(format!("{error:#}").contains("does not match schema"));
    }

    #[test]
    fn schema_rejects_non_boolean_flags() {
        assert!(parse_config(r#"{"transformers": {"world": "yes"}}"#).is_err());
    }

    #[test]
    fn load_config_reads_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"world": {"retryCount": 3}}"#).expect("write config");

        let snapshot = load_config(&path).expect("load config");

        assert_eq!(3, snapshot.retry_count);
        assert_eq!(20, snapshot.retry_delay_ms);
    }
}
