//! Scheduler configuration parsing.

use crate::builder::{
    BuilderConfig, get_first_string_arg, get_integer_prop, get_number_prop, parse_builder,
};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHAIN_STOP_RETRIES: u32 = 3;

/// Coordinator-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Claim owner identity. Generated when not configured.
    pub coordinator: Option<String>,
    /// Upper bound on how long a queue sleeps without a trigger.
    pub poll_interval: Duration,
    /// How many times a chain stop re-walks a chain that changed shape.
    pub chain_stop_retries: u32,
    pub urgency: UrgencyWeights,
    pub builders: Vec<BuilderConfig>,
}

/// Weights of the default builder urgency function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UrgencyWeights {
    /// Urgency per second the oldest ready request has waited.
    pub wait_weight: f64,
    /// Urgency per ready request queued on the builder.
    pub depth_weight: f64,
}

impl Default for UrgencyWeights {
    fn default() -> Self {
        Self {
            wait_weight: 1.0,
            depth_weight: 30.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coordinator: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            chain_stop_retries: DEFAULT_CHAIN_STOP_RETRIES,
            urgency: UrgencyWeights::default(),
            builders: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn builder(&self, name: &str) -> Option<&BuilderConfig> {
        self.builders.iter().find(|b| b.name == name)
    }
}

/// Parse scheduler configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SchedulerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SchedulerConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "coordinator" => {
                config.coordinator = get_first_string_arg(node);
                if let Some(secs) = get_integer_prop(node, "poll-interval-secs")? {
                    config.poll_interval = Duration::from_secs(secs);
                }
                if let Some(retries) = get_integer_prop(node, "chain-stop-retries")? {
                    config.chain_stop_retries =
                        u32::try_from(retries).map_err(|_| ConfigError::InvalidValue {
                            field: "chain-stop-retries".to_string(),
                            message: format!("{} is too large", retries),
                        })?;
                }
            }
            "urgency" => {
                if let Some(w) = get_number_prop(node, "wait-weight") {
                    config.urgency.wait_weight = non_negative("wait-weight", w)?;
                }
                if let Some(w) = get_number_prop(node, "depth-weight") {
                    config.urgency.depth_weight = non_negative("depth-weight", w)?;
                }
            }
            "builder" => {
                let builder = parse_builder(node)?;
                if !seen.insert(builder.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("builder '{}'", builder.name)));
                }
                config.builders.push(builder);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a scheduler configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SchedulerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn non_negative(field: &str, value: f64) -> ConfigResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a non-negative number, got {}", value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            coordinator "coord-a" poll-interval-secs=5 chain-stop-retries=4
            urgency wait-weight=2.0 depth-weight=10

            builder "b1" {
                workers "w1" "w2"
                resume-workers "w3"
                locks "db"
            }

            builder "b2" merge=#false {
                workers "w2"
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.coordinator.as_deref(), Some("coord-a"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.chain_stop_retries, 4);
        assert_eq!(config.urgency.wait_weight, 2.0);
        assert_eq!(config.urgency.depth_weight, 10.0);
        assert_eq!(config.builders.len(), 2);

        let b1 = config.builder("b1").unwrap();
        assert_eq!(b1.start_pool, vec!["w1", "w2"]);
        assert_eq!(b1.resume_pool, Some(vec!["w3".to_string()]));
        assert_eq!(b1.locks, vec!["db"]);
        assert!(b1.merge_requests);

        let b2 = config.builder("b2").unwrap();
        assert!(!b2.merge_requests);
        assert_eq!(b2.resume_pool, None);
    }

    #[test]
    fn test_defaults() {
        let config = parse_system_config(r#"builder "lonely""#).unwrap();
        assert_eq!(config.coordinator, None);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.chain_stop_retries, 3);
        assert_eq!(config.urgency, UrgencyWeights::default());
        assert!(config.builders[0].start_pool.is_empty());
    }

    #[test]
    fn test_duplicate_builder() {
        let kdl = r#"
            builder "b1" { workers "w1"; }
            builder "b1" { workers "w2"; }
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_builder_without_name() {
        let result = parse_system_config("builder { workers \"w1\"; }");
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let result = parse_system_config("coordinator \"c\" poll-interval-secs=0");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_unknown_builder_setting() {
        let result = parse_system_config("builder \"b\" { slaves \"w1\"; }");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
