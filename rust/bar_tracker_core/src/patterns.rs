use crate::config::ConfigValidationIssue;
use crate::dbn::log_or_neg_inf;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Relative weight of downbeat positions against the rest of the bar.
pub const DEFAULT_OBSERVATION_WEIGHT: f64 = 100.0;

/// A rhythmic hypothesis: a bar length and what each bar position is
/// expected to look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pattern {
    pub name: String,
    pub beats_per_bar: usize,
    #[serde(default)]
    pub observation: ObservationParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationParams {
    /// Scalar observation holding the probability that the beat is a
    /// downbeat. The remaining mass is spread over the other
    /// `observation_weight - 1` positions.
    Activation { observation_weight: f64 },
    /// Diagonal Gaussian per bar position, one row per position.
    Gaussian {
        means: Vec<Vec<f64>>,
        variances: Vec<Vec<f64>>,
    },
}

impl Default for ObservationParams {
    fn default() -> Self {
        Self::Activation {
            observation_weight: DEFAULT_OBSERVATION_WEIGHT,
        }
    }
}

impl Pattern {
    pub fn activation(name: impl Into<String>, beats_per_bar: usize) -> Self {
        Self {
            name: name.into(),
            beats_per_bar,
            observation: ObservationParams::default(),
        }
    }

    pub fn gaussian(
        name: impl Into<String>,
        means: Vec<Vec<f64>>,
        variances: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            name: name.into(),
            beats_per_bar: means.len(),
            observation: ObservationParams::Gaussian { means, variances },
        }
    }

    pub fn with_observation_weight(mut self, observation_weight: f64) -> Self {
        self.observation = ObservationParams::Activation { observation_weight };
        self
    }

    pub(crate) fn validate(&self, path: &str) -> Result<(), ConfigValidationIssue> {
        if self.beats_per_bar == 0 {
            return Err(ConfigValidationIssue::new(
                format!("{}.beats_per_bar", path),
                "must be > 0",
            ));
        }
        match &self.observation {
            ObservationParams::Activation { observation_weight } => {
                if !observation_weight.is_finite() || *observation_weight <= 1.0 {
                    return Err(ConfigValidationIssue::new(
                        format!("{}.observation.observation_weight", path),
                        format!("must be > 1; got {}", observation_weight),
                    ));
                }
            }
            ObservationParams::Gaussian { means, variances } => {
                validate_rows(&format!("{}.observation.means", path), means, self.beats_per_bar)?;
                validate_rows(
                    &format!("{}.observation.variances", path),
                    variances,
                    self.beats_per_bar,
                )?;
                let width = means[0].len();
                if variances[0].len() != width {
                    return Err(ConfigValidationIssue::new(
                        format!("{}.observation.variances", path),
                        format!(
                            "width {} differs from means width {}",
                            variances[0].len(),
                            width
                        ),
                    ));
                }
                if variances.iter().flatten().any(|v| *v <= 0.0) {
                    return Err(ConfigValidationIssue::new(
                        format!("{}.observation.variances", path),
                        "all values must be > 0",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_rows(
    path: &str,
    rows: &[Vec<f64>],
    beats_per_bar: usize,
) -> Result<(), ConfigValidationIssue> {
    if rows.len() != beats_per_bar {
        return Err(ConfigValidationIssue::new(
            path,
            format!("expected one row per bar position ({}), got {}", beats_per_bar, rows.len()),
        ));
    }
    let width = rows[0].len();
    if width == 0 {
        return Err(ConfigValidationIssue::new(path, "rows must not be empty"));
    }
    if rows.iter().any(|row| row.len() != width) {
        return Err(ConfigValidationIssue::new(
            path,
            "all rows must have the same width",
        ));
    }
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(ConfigValidationIssue::new(path, "all values must be finite"));
    }
    Ok(())
}

impl ObservationParams {
    /// Width of the observation vectors this model scores.
    pub fn feature_dim(&self) -> usize {
        match self {
            Self::Activation { .. } => 1,
            Self::Gaussian { means, .. } => means.first().map_or(0, Vec::len),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Activation { .. } => "activation",
            Self::Gaussian { .. } => "gaussian",
        }
    }

    /// Log density of `observation` for a beat at bar `position`.
    ///
    /// Non-finite observations and zero densities score negative infinity.
    pub fn log_density(&self, position: usize, observation: ArrayView1<'_, f32>) -> f64 {
        if observation.iter().any(|v| !v.is_finite()) {
            return f64::NEG_INFINITY;
        }
        match self {
            Self::Activation { observation_weight } => {
                let activation = observation[0] as f64;
                if position == 0 {
                    log_or_neg_inf(activation)
                } else {
                    log_or_neg_inf((1.0 - activation) / (observation_weight - 1.0))
                }
            }
            Self::Gaussian { means, variances } => {
                let mut log_density = 0.0;
                for ((&x, &mean), &variance) in observation
                    .iter()
                    .zip(means[position].iter())
                    .zip(variances[position].iter())
                {
                    let diff = x as f64 - mean;
                    log_density -= 0.5 * ((2.0 * PI * variance).ln() + diff * diff / variance);
                }
                if log_density.is_nan() {
                    f64::NEG_INFINITY
                } else {
                    log_density
                }
            }
        }
    }
}
