//! Downbeat tracking over beat-synchronous observations.
//!
//! Two independent stages: [`BeatSynchronizer`] folds a frame-level feature
//! stream into one vector per beat (or beat subdivision), and [`BarTracker`]
//! decodes the bar position of every beat with a multi-pattern HMM.

mod config;
mod dbn;
pub mod io;
mod patterns;
mod sync;
mod types;

pub use config::{
    validate_core_config, validate_dbn_config, validate_sync_config, ConfigValidationIssue,
    CoreConfig, DbnConfig, SyncConfig,
};
pub use dbn::{decode, BarTracker};
pub use patterns::{ObservationParams, Pattern, DEFAULT_OBSERVATION_WEIGHT};
pub use sync::{synchronize, Aggregation, BeatSyncFeatures, BeatSynchronizer, Reducer};
pub use types::{BarState, DecodedBars, DownbeatRow};

use ndarray::ArrayView2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarTrackError {
    #[error("shape mismatch: expected {expected} {what}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("empty input: {0}")]
    EmptyInput(String),
    #[error("no decoding path with nonzero probability across {num_beats} beats")]
    Unreachable { num_beats: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigValidationIssue),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Decode bar positions from per-frame features.
///
/// Frames are synchronized to the beats with the configured reducer; each
/// beat row concatenates its subdivisions before it reaches the decoder.
pub fn track_bars(
    frame_features: ArrayView2<'_, f32>,
    frame_times: &[f32],
    beat_times: &[f32],
    config: &CoreConfig,
) -> Result<DecodedBars, BarTrackError> {
    validate_core_config(config)?;
    let synchronizer = BeatSynchronizer::new(&config.sync)?;
    let tracker = BarTracker::new(config.dbn.clone())?;

    emit_stage("sync:start");
    let synced = synchronizer.synchronize(frame_features, frame_times, beat_times)?;
    let per_beat = synced.per_beat()?;
    emit_stage("sync:end");

    emit_stage("dbn:start");
    let decoded = tracker.decode(per_beat.view(), beat_times)?;
    emit_stage("dbn:end");
    Ok(decoded)
}

/// Decode bar positions from one downbeat activation per beat.
pub fn track_bars_from_activations(
    activations: &[f32],
    beat_times: &[f32],
    config: &CoreConfig,
) -> Result<DecodedBars, BarTrackError> {
    let tracker = BarTracker::new(config.dbn.clone())?;
    emit_stage("dbn:start");
    let decoded = tracker.decode_activations(activations, beat_times)?;
    emit_stage("dbn:end");
    Ok(decoded)
}

/// Timestamps must be finite and strictly increasing.
pub(crate) fn validate_timestamps(label: &str, times: &[f32]) -> Result<(), BarTrackError> {
    if let Some(idx) = times.iter().position(|t| !t.is_finite()) {
        return Err(BarTrackError::InvalidInput(format!(
            "{}[{}] is not finite ({})",
            label, idx, times[idx]
        )));
    }
    if let Some(idx) = times.windows(2).position(|w| w[1] <= w[0]) {
        return Err(BarTrackError::InvalidInput(format!(
            "{} must be strictly increasing; {}[{}]={} followed by {}",
            label,
            label,
            idx,
            times[idx],
            times[idx + 1]
        )));
    }
    Ok(())
}

fn emit_stage(stage: &str) {
    log::debug!("bar_tracker stage={}", stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn timestamps_reject_repeats_and_nan() {
        assert!(validate_timestamps("beat_times", &[0.1, 0.5, 0.9]).is_ok());
        assert!(matches!(
            validate_timestamps("beat_times", &[0.1, 0.5, 0.5]),
            Err(BarTrackError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_timestamps("beat_times", &[0.1, f32::NAN]),
            Err(BarTrackError::InvalidInput(_))
        ));
    }

    #[test]
    fn activations_pipeline_uses_configured_patterns() {
        let mut config = CoreConfig::default();
        config.dbn.patterns = vec![Pattern::activation("3/4", 3)];
        let activations = [0.9, 0.1, 0.1, 0.9, 0.1, 0.1];
        let beats = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
        let decoded = track_bars_from_activations(&activations, &beats, &config).unwrap();
        assert_eq!(decoded.beat_numbers(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn feature_pipeline_synchronizes_before_decoding() {
        // 100 fps, one feature that is high on every third beat.
        let beats: Vec<f32> = (0..9).map(|i| 0.5 + 0.5 * i as f32).collect();
        let num_frames = 500;
        let frame_times: Vec<f32> = (0..num_frames).map(|i| i as f32 / 100.0).collect();
        let mut features = Array2::<f32>::zeros((num_frames, 1));
        for (i, t) in frame_times.iter().enumerate() {
            let beat = ((t - 0.5) / 0.5).floor();
            if *t >= 0.5 && (beat as i64) % 3 == 1 {
                features[[i, 0]] = 1.0;
            }
        }

        let mut config = CoreConfig::default();
        config.dbn.patterns = vec![Pattern::gaussian(
            "3/4",
            vec![vec![1.0], vec![0.0], vec![0.0]],
            vec![vec![0.1], vec![0.1], vec![0.1]],
        )];
        let decoded = track_bars(features.view(), &frame_times, &beats, &config).unwrap();
        assert_eq!(decoded.beat_numbers(), vec![3, 1, 2, 3, 1, 2, 3, 1, 2]);
        assert_eq!(decoded.rows[1].time_sec, 1.0);
    }
}
