use serde::{Deserialize, Serialize};

/// A hidden state: which pattern is active and where in its bar the beat sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarState {
    pub pattern: usize,
    pub position: usize,
}

impl BarState {
    /// 1-based beat number within the bar.
    pub fn beat_number(&self) -> u32 {
        self.position as u32 + 1
    }

    pub fn is_downbeat(&self) -> bool {
        self.position == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownbeatRow {
    pub time_sec: f32,
    pub beat_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedBars {
    pub rows: Vec<DownbeatRow>,
    pub log_likelihood: f64,
    pub path: Vec<BarState>,
}

impl DecodedBars {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn beat_times(&self) -> Vec<f32> {
        self.rows.iter().map(|row| row.time_sec).collect()
    }

    pub fn beat_numbers(&self) -> Vec<u32> {
        self.rows.iter().map(|row| row.beat_number).collect()
    }

    pub fn downbeat_times(&self) -> Vec<f32> {
        self.rows
            .iter()
            .filter(|row| row.beat_number == 1)
            .map(|row| row.time_sec)
            .collect()
    }

    /// Index of the active pattern at every beat.
    pub fn pattern_indices(&self) -> Vec<usize> {
        self.path.iter().map(|state| state.pattern).collect()
    }
}
