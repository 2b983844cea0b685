use crate::config::{validate_sync_config, SyncConfig};
use crate::{validate_timestamps, BarTrackError};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Collapses the frames of one bin into a single vector of the same width.
pub trait Reducer {
    fn reduce(&self, frames: ArrayView2<'_, f32>) -> Array1<f32>;
}

impl<F> Reducer for F
where
    F: Fn(ArrayView2<'_, f32>) -> Array1<f32>,
{
    fn reduce(&self, frames: ArrayView2<'_, f32>) -> Array1<f32> {
        self(frames)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Sum,
    Max,
    Min,
    Median,
}

impl Reducer for Aggregation {
    fn reduce(&self, frames: ArrayView2<'_, f32>) -> Array1<f32> {
        match self {
            Self::Mean => frames
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(frames.ncols())),
            Self::Sum => frames.sum_axis(Axis(0)),
            Self::Max => frames.fold_axis(Axis(0), f32::NEG_INFINITY, |acc, v| acc.max(*v)),
            Self::Min => frames.fold_axis(Axis(0), f32::INFINITY, |acc, v| acc.min(*v)),
            Self::Median => frames.columns().into_iter().map(median).collect(),
        }
    }
}

fn median(column: ArrayView1<'_, f32>) -> f32 {
    let mut values = column.to_vec();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Beat-synchronous features, one row per (beat, subdivision), beat-major.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatSyncFeatures {
    pub data: Array2<f32>,
    pub subdivisions: usize,
}

impl BeatSyncFeatures {
    pub fn num_beats(&self) -> usize {
        self.data.nrows() / self.subdivisions
    }

    /// One row per beat with the subdivision vectors laid side by side.
    pub fn per_beat(&self) -> Result<Array2<f32>, BarTrackError> {
        let num_beats = self.num_beats();
        let width = self.data.ncols() * self.subdivisions;
        self.data
            .as_standard_layout()
            .into_owned()
            .into_shape((num_beats, width))
            .map_err(|_| BarTrackError::ShapeMismatch {
                what: "beat-synchronous values",
                expected: num_beats * width,
                actual: self.data.len(),
            })
    }
}

/// Folds frame-level features onto the beat grid.
#[derive(Debug, Clone)]
pub struct BeatSynchronizer {
    subdivisions: usize,
    reducer: Aggregation,
}

impl BeatSynchronizer {
    pub fn new(config: &SyncConfig) -> Result<Self, BarTrackError> {
        validate_sync_config(config)?;
        Ok(Self {
            subdivisions: config.subdivisions,
            reducer: config.reducer,
        })
    }

    /// Synchronize with the configured aggregation.
    pub fn synchronize(
        &self,
        frame_features: ArrayView2<'_, f32>,
        frame_times: &[f32],
        beat_times: &[f32],
    ) -> Result<BeatSyncFeatures, BarTrackError> {
        synchronize(
            frame_features,
            frame_times,
            beat_times,
            self.subdivisions,
            &self.reducer,
        )
    }

    /// Synchronize with a caller-supplied reducer.
    pub fn synchronize_with(
        &self,
        frame_features: ArrayView2<'_, f32>,
        frame_times: &[f32],
        beat_times: &[f32],
        reducer: &dyn Reducer,
    ) -> Result<BeatSyncFeatures, BarTrackError> {
        synchronize(
            frame_features,
            frame_times,
            beat_times,
            self.subdivisions,
            reducer,
        )
    }

    /// Synchronize frames sampled at a fixed rate; frame `i` sits at `i / fps`.
    pub fn synchronize_with_fps(
        &self,
        frame_features: ArrayView2<'_, f32>,
        fps: f32,
        beat_times: &[f32],
    ) -> Result<BeatSyncFeatures, BarTrackError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(BarTrackError::InvalidInput(format!(
                "fps must be > 0; got {}",
                fps
            )));
        }
        let frame_times: Vec<f32> = (0..frame_features.nrows())
            .map(|i| i as f32 / fps)
            .collect();
        self.synchronize(frame_features, &frame_times, beat_times)
    }
}

/// Aggregate the frames falling into every beat (sub-)interval.
///
/// Beat `k` spans up to the next beat; the last beat repeats the previous
/// inter-beat interval, and a lone beat spans up to the last frame. Each span
/// is cut into `subdivisions` equal bins. Empty bins stay zero.
pub fn synchronize(
    frame_features: ArrayView2<'_, f32>,
    frame_times: &[f32],
    beat_times: &[f32],
    subdivisions: usize,
    reducer: &dyn Reducer,
) -> Result<BeatSyncFeatures, BarTrackError> {
    validate_sync_config(&SyncConfig {
        subdivisions,
        ..SyncConfig::default()
    })?;
    if frame_times.len() != frame_features.nrows() {
        return Err(BarTrackError::ShapeMismatch {
            what: "frame_times (one per frame)",
            expected: frame_features.nrows(),
            actual: frame_times.len(),
        });
    }
    validate_timestamps("frame_times", frame_times)?;
    validate_timestamps("beat_times", beat_times)?;

    let width = frame_features.ncols();
    let num_beats = beat_times.len();
    let mut data = Array2::<f32>::zeros((num_beats * subdivisions, width));
    let Some(&last_frame) = frame_times.last() else {
        log::debug!("sync: no frames, {} beats left at zero", num_beats);
        return Ok(BeatSyncFeatures { data, subdivisions });
    };

    let mut empty_bins = 0usize;
    for (beat, &start) in beat_times.iter().enumerate() {
        let (end, closed) = if beat + 1 < num_beats {
            (beat_times[beat + 1], false)
        } else if num_beats >= 2 {
            (start + (start - beat_times[beat - 1]), false)
        } else {
            (last_frame.max(start), true)
        };
        let step = (end - start) / subdivisions as f32;

        for sub in 0..subdivisions {
            let lo = start + step * sub as f32;
            let last_sub = sub + 1 == subdivisions;
            let hi = if last_sub {
                end
            } else {
                start + step * (sub + 1) as f32
            };
            let first = frame_times.partition_point(|&t| t < lo);
            let stop = if closed && last_sub {
                frame_times.partition_point(|&t| t <= hi)
            } else {
                frame_times.partition_point(|&t| t < hi)
            };
            if stop <= first {
                empty_bins += 1;
                continue;
            }

            let reduced = reducer.reduce(frame_features.slice(s![first..stop, ..]));
            if reduced.len() != width {
                return Err(BarTrackError::ShapeMismatch {
                    what: "reduced feature width",
                    expected: width,
                    actual: reduced.len(),
                });
            }
            data.row_mut(beat * subdivisions + sub).assign(&reduced);
        }
    }

    log::debug!(
        "sync: {} frames -> {} beats x {} subdivisions ({} empty bins)",
        frame_times.len(),
        num_beats,
        subdivisions,
        empty_bins
    );
    Ok(BeatSyncFeatures { data, subdivisions })
}
