use crate::patterns::{ObservationParams, Pattern};
use crate::sync::Aggregation;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Number of equal-length bins each beat interval is split into.
    pub subdivisions: usize,
    pub reducer: Aggregation,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subdivisions: 1,
            reducer: Aggregation::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbnConfig {
    pub patterns: Vec<Pattern>,
    /// Probability of leaving the current pattern at any beat, landing on the
    /// downbeat of one of the other patterns.
    pub pattern_change_prob: f64,
}

impl Default for DbnConfig {
    fn default() -> Self {
        Self {
            patterns: vec![Pattern::activation("3/4", 3), Pattern::activation("4/4", 4)],
            pattern_change_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub dbn: DbnConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigValidationIssue {
    pub path: String,
    pub message: String,
}

impl ConfigValidationIssue {
    pub(crate) fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ConfigValidationIssue {}

pub fn validate_core_config(config: &CoreConfig) -> Result<(), ConfigValidationIssue> {
    validate_sync_config(&config.sync)?;
    validate_dbn_config(&config.dbn)
}

pub fn validate_sync_config(sync: &SyncConfig) -> Result<(), ConfigValidationIssue> {
    if sync.subdivisions == 0 {
        return Err(ConfigValidationIssue::new(
            "sync.subdivisions",
            "must be > 0",
        ));
    }
    Ok(())
}

pub fn validate_dbn_config(dbn: &DbnConfig) -> Result<(), ConfigValidationIssue> {
    if dbn.patterns.is_empty() {
        return Err(ConfigValidationIssue::new(
            "dbn.patterns",
            "must contain at least one pattern",
        ));
    }
    for (idx, pattern) in dbn.patterns.iter().enumerate() {
        pattern.validate(&format!("dbn.patterns[{}]", idx))?;
    }

    let first = &dbn.patterns[0].observation;
    for (idx, pattern) in dbn.patterns.iter().enumerate().skip(1) {
        let observation = &pattern.observation;
        if observation.kind() != first.kind() {
            return Err(ConfigValidationIssue::new(
                format!("dbn.patterns[{}].observation", idx),
                format!(
                    "cannot mix {} and {} patterns",
                    first.kind(),
                    observation.kind()
                ),
            ));
        }
        if let ObservationParams::Gaussian { .. } = observation {
            if observation.feature_dim() != first.feature_dim() {
                return Err(ConfigValidationIssue::new(
                    format!("dbn.patterns[{}].observation.means", idx),
                    format!(
                        "feature width {} differs from {} of dbn.patterns[0]",
                        observation.feature_dim(),
                        first.feature_dim()
                    ),
                ));
            }
        }
    }

    let prob = dbn.pattern_change_prob;
    if !prob.is_finite() || !(0.0..=1.0).contains(&prob) {
        return Err(ConfigValidationIssue::new(
            "dbn.pattern_change_prob",
            format!("must be in [0, 1]; got {}", prob),
        ));
    }
    if dbn.patterns.len() == 1 && prob > 0.0 {
        return Err(ConfigValidationIssue::new(
            "dbn.pattern_change_prob",
            format!(
                "must be 0 with a single pattern (no other pattern to change to); got {}",
                prob
            ),
        ));
    }

    Ok(())
}
