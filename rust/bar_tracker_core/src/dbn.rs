use crate::config::{validate_dbn_config, ConfigValidationIssue, DbnConfig};
use crate::patterns::Pattern;
use crate::types::{BarState, DecodedBars, DownbeatRow};
use crate::{validate_timestamps, BarTrackError};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Decode bar positions with a one-off tracker for `patterns`.
pub fn decode(
    observations: ArrayView2<'_, f32>,
    beat_times: &[f32],
    patterns: &[Pattern],
    pattern_change_prob: f64,
) -> Result<DecodedBars, BarTrackError> {
    BarTracker::new(DbnConfig {
        patterns: patterns.to_vec(),
        pattern_change_prob,
    })?
    .decode(observations, beat_times)
}

/// Bar tracker over a fixed set of patterns.
///
/// Only the validated configuration is kept; the state space, transition
/// table and observation densities are rebuilt on every call.
#[derive(Debug, Clone)]
pub struct BarTracker {
    config: DbnConfig,
}

impl BarTracker {
    pub fn new(config: DbnConfig) -> Result<Self, BarTrackError> {
        validate_dbn_config(&config)?;
        Ok(Self { config })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.config.patterns
    }

    /// Width every observation row must have.
    pub fn observation_dim(&self) -> usize {
        self.config.patterns[0].observation.feature_dim()
    }

    /// Total number of hidden states (sum of all bar lengths).
    pub fn num_states(&self) -> usize {
        self.config.patterns.iter().map(|p| p.beats_per_bar).sum()
    }

    /// Most likely bar position of every beat. One observation row per beat.
    pub fn decode(
        &self,
        observations: ArrayView2<'_, f32>,
        beat_times: &[f32],
    ) -> Result<DecodedBars, BarTrackError> {
        check_observations(observations, beat_times.len(), self.observation_dim())?;
        validate_timestamps("beat_times", beat_times)?;

        let hmm = BarHmm::new(&self.config)?;
        let log_densities = hmm.log_densities(observations);
        let num_beats = beat_times.len();
        log::debug!(
            "dbn: decoding {} beats over {} states ({} patterns)",
            num_beats,
            hmm.state_space.num_states,
            self.config.patterns.len()
        );

        let (path, log_likelihood) = hmm.viterbi(&log_densities);
        if path.is_empty() {
            return Err(BarTrackError::Unreachable { num_beats });
        }

        let path: Vec<BarState> = path.iter().map(|&s| hmm.state_space.state(s)).collect();
        let rows = beat_times
            .iter()
            .zip(path.iter())
            .map(|(&time_sec, state)| DownbeatRow {
                time_sec,
                beat_number: state.beat_number(),
            })
            .collect();
        log::debug!("dbn: log_likelihood={:.6}", log_likelihood);

        Ok(DecodedBars {
            rows,
            log_likelihood,
            path,
        })
    }

    /// Decode with one scalar downbeat activation per beat.
    pub fn decode_activations(
        &self,
        activations: &[f32],
        beat_times: &[f32],
    ) -> Result<DecodedBars, BarTrackError> {
        self.decode(activation_column(activations), beat_times)
    }

    /// Log-probability of `path`: initial, transition and observation terms
    /// summed along it in the same order the decoder accumulates them.
    pub fn path_log_likelihood(
        &self,
        observations: ArrayView2<'_, f32>,
        path: &[BarState],
    ) -> Result<f64, BarTrackError> {
        check_observations(observations, path.len(), self.observation_dim())?;

        let hmm = BarHmm::new(&self.config)?;
        let states = path
            .iter()
            .map(|state| {
                hmm.state_space.index(*state).ok_or_else(|| {
                    BarTrackError::InvalidInput(format!(
                        "{:?} is not a state of this model",
                        state
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let log_densities = hmm.log_densities(observations);

        let mut total = hmm.log_initial() + log_densities[[0, states[0]]];
        for beat in 1..states.len() {
            let trans = hmm
                .transition_model
                .log_probability(states[beat - 1], states[beat]);
            total = total + trans + log_densities[[beat, states[beat]]];
        }
        Ok(total)
    }

    /// Name of the active pattern at every decoded beat.
    pub fn pattern_names<'a>(&'a self, decoded: &DecodedBars) -> Vec<&'a str> {
        decoded
            .path
            .iter()
            .map(|state| self.config.patterns[state.pattern].name.as_str())
            .collect()
    }
}

pub(crate) fn activation_column(activations: &[f32]) -> ArrayView2<'_, f32> {
    ArrayView1::from(activations).insert_axis(Axis(1))
}

fn check_observations(
    observations: ArrayView2<'_, f32>,
    num_beats: usize,
    observation_dim: usize,
) -> Result<(), BarTrackError> {
    if num_beats == 0 {
        return Err(BarTrackError::EmptyInput("no beats to decode".to_string()));
    }
    if observations.nrows() != num_beats {
        return Err(BarTrackError::ShapeMismatch {
            what: "observations (one per beat)",
            expected: num_beats,
            actual: observations.nrows(),
        });
    }
    if observations.ncols() != observation_dim {
        return Err(BarTrackError::ShapeMismatch {
            what: "observation width",
            expected: observation_dim,
            actual: observations.ncols(),
        });
    }
    Ok(())
}

/// Flat state space: patterns in configuration order, positions ascending.
#[derive(Debug, Clone)]
struct BarStateSpace {
    num_states: usize,
    state_patterns: Vec<usize>,
    state_positions: Vec<usize>,
    /// Downbeat state of every pattern.
    first_states: Vec<usize>,
    beats_per_bar: Vec<usize>,
}

impl BarStateSpace {
    fn new(patterns: &[Pattern]) -> Self {
        let num_states = patterns.iter().map(|p| p.beats_per_bar).sum();
        let mut state_patterns = Vec::with_capacity(num_states);
        let mut state_positions = Vec::with_capacity(num_states);
        let mut first_states = Vec::with_capacity(patterns.len());
        let mut beats_per_bar = Vec::with_capacity(patterns.len());
        for (pattern, p) in patterns.iter().enumerate() {
            first_states.push(state_patterns.len());
            beats_per_bar.push(p.beats_per_bar);
            for position in 0..p.beats_per_bar {
                state_patterns.push(pattern);
                state_positions.push(position);
            }
        }
        Self {
            num_states,
            state_patterns,
            state_positions,
            first_states,
            beats_per_bar,
        }
    }

    fn state(&self, index: usize) -> BarState {
        BarState {
            pattern: self.state_patterns[index],
            position: self.state_positions[index],
        }
    }

    fn index(&self, state: BarState) -> Option<usize> {
        let first = *self.first_states.get(state.pattern)?;
        (state.position < self.beats_per_bar[state.pattern]).then_some(first + state.position)
    }

    /// State reached by advancing one beat within the same pattern.
    fn next_state(&self, index: usize) -> usize {
        let pattern = self.state_patterns[index];
        let position = (self.state_positions[index] + 1) % self.beats_per_bar[pattern];
        self.first_states[pattern] + position
    }
}

/// Sparse transitions keyed by destination: the predecessors of state `s`
/// are `states[pointers[s]..pointers[s + 1]]`, in ascending order.
#[derive(Debug, Clone)]
struct TransitionModel {
    states: Vec<usize>,
    pointers: Vec<usize>,
    log_probabilities: Vec<f64>,
}

impl TransitionModel {
    fn new(state_space: &BarStateSpace, pattern_change_prob: f64) -> Result<Self, BarTrackError> {
        let num_patterns = state_space.first_states.len();
        let mut states = Vec::new();
        let mut prev_states = Vec::new();
        let mut probabilities = Vec::new();

        for state in 0..state_space.num_states {
            let pattern = state_space.state_patterns[state];
            states.push(state_space.next_state(state));
            prev_states.push(state);
            probabilities.push(1.0 - pattern_change_prob);

            if num_patterns > 1 {
                let switch_prob = pattern_change_prob / (num_patterns - 1) as f64;
                for (other, &first) in state_space.first_states.iter().enumerate() {
                    if other != pattern {
                        states.push(first);
                        prev_states.push(state);
                        probabilities.push(switch_prob);
                    }
                }
            }
        }

        make_sparse(
            state_space.num_states,
            &states,
            &prev_states,
            &probabilities,
        )
    }

    fn predecessors(&self, state: usize) -> std::ops::Range<usize> {
        self.pointers[state]..self.pointers[state + 1]
    }

    fn log_probability(&self, from: usize, to: usize) -> f64 {
        self.predecessors(to)
            .find(|&idx| self.states[idx] == from)
            .map_or(f64::NEG_INFINITY, |idx| self.log_probabilities[idx])
    }
}

fn make_sparse(
    num_states: usize,
    states: &[usize],
    prev_states: &[usize],
    probabilities: &[f64],
) -> Result<TransitionModel, BarTrackError> {
    let mut sums = vec![0.0f64; num_states];
    for (&prev, &prob) in prev_states.iter().zip(probabilities.iter()) {
        sums[prev] += prob;
    }
    if let Some((state, sum)) = sums
        .iter()
        .enumerate()
        .find(|(_, sum)| (*sum - 1.0).abs() > 1e-9)
    {
        return Err(BarTrackError::InvalidConfiguration(
            ConfigValidationIssue::new(
                "dbn.pattern_change_prob",
                format!(
                    "transition probabilities from state {} sum to {}, not 1",
                    state, sum
                ),
            ),
        ));
    }

    // Entries arrive grouped by ascending source state, which keeps every
    // predecessor list sorted.
    let mut per_state: Vec<Vec<(usize, f64)>> = vec![Vec::new(); num_states];
    for ((&state, &prev), &prob) in states
        .iter()
        .zip(prev_states.iter())
        .zip(probabilities.iter())
    {
        if prob > 0.0 {
            per_state[state].push((prev, prob));
        }
    }

    let mut out_states = Vec::with_capacity(states.len());
    let mut pointers = Vec::with_capacity(num_states + 1);
    let mut log_probabilities = Vec::with_capacity(states.len());
    pointers.push(0);
    for list in per_state {
        for (prev, prob) in list {
            out_states.push(prev);
            log_probabilities.push(log_or_neg_inf(prob));
        }
        pointers.push(out_states.len());
    }
    Ok(TransitionModel {
        states: out_states,
        pointers,
        log_probabilities,
    })
}

struct BarHmm<'a> {
    patterns: &'a [Pattern],
    state_space: BarStateSpace,
    transition_model: TransitionModel,
}

impl<'a> BarHmm<'a> {
    fn new(config: &'a DbnConfig) -> Result<Self, BarTrackError> {
        let state_space = BarStateSpace::new(&config.patterns);
        let transition_model = TransitionModel::new(&state_space, config.pattern_change_prob)?;
        Ok(Self {
            patterns: &config.patterns,
            state_space,
            transition_model,
        })
    }

    /// Uniform over all states.
    fn log_initial(&self) -> f64 {
        -(self.state_space.num_states as f64).ln()
    }

    /// `beats x states` table of observation log densities.
    fn log_densities(&self, observations: ArrayView2<'_, f32>) -> Array2<f64> {
        let num_states = self.state_space.num_states;
        let mut out = Array2::from_elem((observations.nrows(), num_states), f64::NEG_INFINITY);
        for (mut row, obs) in out.outer_iter_mut().zip(observations.outer_iter()) {
            for state in 0..num_states {
                let pattern = &self.patterns[self.state_space.state_patterns[state]];
                row[state] = pattern
                    .observation
                    .log_density(self.state_space.state_positions[state], obs);
            }
        }
        out
    }

    /// Best state path and its log-probability. An empty path means every
    /// path has probability zero.
    fn viterbi(&self, log_densities: &Array2<f64>) -> (Vec<usize>, f64) {
        let num_states = self.state_space.num_states;
        let num_beats = log_densities.nrows();
        if num_beats == 0 {
            return (Vec::new(), f64::NEG_INFINITY);
        }

        let log_initial = self.log_initial();
        let mut previous: Vec<f64> = log_densities
            .row(0)
            .iter()
            .map(|density| log_initial + density)
            .collect();
        let mut current = vec![f64::NEG_INFINITY; num_states];
        let mut bt = vec![0usize; num_states * num_beats];

        for (beat, dens) in log_densities.outer_iter().enumerate().skip(1) {
            for state in 0..num_states {
                let mut best = f64::NEG_INFINITY;
                let mut best_prev = state;
                for idx in self.transition_model.predecessors(state) {
                    let prev_state = self.transition_model.states[idx];
                    let score = previous[prev_state] + self.transition_model.log_probabilities[idx];
                    if score > best {
                        best = score;
                        best_prev = prev_state;
                    }
                }
                current[state] = best + dens[state];
                bt[beat * num_states + state] = best_prev;
            }
            std::mem::swap(&mut previous, &mut current);
        }

        let mut best_state = 0usize;
        let mut best_log = f64::NEG_INFINITY;
        for (i, v) in previous.iter().enumerate() {
            if *v > best_log {
                best_log = *v;
                best_state = i;
            }
        }
        if best_log == f64::NEG_INFINITY {
            return (Vec::new(), best_log);
        }

        let mut path = vec![0usize; num_beats];
        let mut state = best_state;
        for beat in (0..num_beats).rev() {
            path[beat] = state;
            state = bt[beat * num_states + state];
        }
        (path, best_log)
    }
}

pub(crate) fn log_or_neg_inf(v: f64) -> f64 {
    if v > 0.0 {
        v.ln()
    } else {
        f64::NEG_INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn meters(beats: &[usize], pattern_change_prob: f64) -> DbnConfig {
        DbnConfig {
            patterns: beats
                .iter()
                .map(|&b| Pattern::activation(format!("{}/4", b), b))
                .collect(),
            pattern_change_prob,
        }
    }

    #[test]
    fn state_space_is_flat_and_ordered() {
        let config = meters(&[3, 4], 0.0);
        let st = BarStateSpace::new(&config.patterns);
        assert_eq!(st.num_states, 7);
        assert_eq!(st.first_states, vec![0, 3]);
        assert_eq!(st.state(4), BarState { pattern: 1, position: 1 });
        assert_eq!(st.index(BarState { pattern: 1, position: 3 }), Some(6));
        assert_eq!(st.index(BarState { pattern: 0, position: 3 }), None);
        assert_eq!(st.next_state(2), 0);
        assert_eq!(st.next_state(6), 3);
    }

    #[test]
    fn transitions_leave_each_state_with_unit_mass() {
        let config = meters(&[2, 3, 4], 0.3);
        let st = BarStateSpace::new(&config.patterns);
        let tm = TransitionModel::new(&st, config.pattern_change_prob).unwrap();
        for from in 0..st.num_states {
            let total: f64 = (0..st.num_states)
                .map(|to| tm.log_probability(from, to).exp())
                .sum();
            assert!((total - 1.0).abs() < 1e-12, "state {} sums to {}", from, total);
        }
        // Pattern changes only land on downbeats.
        assert!((tm.log_probability(1, 2) - 0.15f64.ln()).abs() < 1e-12);
        assert!((tm.log_probability(1, 5) - 0.15f64.ln()).abs() < 1e-12);
        assert_eq!(tm.log_probability(1, 3), f64::NEG_INFINITY);
        assert!((tm.log_probability(1, 0) - 0.7f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn predecessor_lists_are_sorted() {
        let config = meters(&[3, 4], 0.1);
        let st = BarStateSpace::new(&config.patterns);
        let tm = TransitionModel::new(&st, config.pattern_change_prob).unwrap();
        for state in 0..st.num_states {
            let prev = &tm.states[tm.predecessors(state)];
            assert!(prev.windows(2).all(|w| w[0] < w[1]));
        }
        // Downbeat of 4/4: its own last beat plus every 3/4 state.
        assert_eq!(&tm.states[tm.predecessors(3)], &[0, 1, 2, 6]);
    }

    #[test]
    fn zero_change_prob_keeps_patterns_disjoint() {
        let config = meters(&[3, 4], 0.0);
        let st = BarStateSpace::new(&config.patterns);
        let tm = TransitionModel::new(&st, 0.0).unwrap();
        assert_eq!(tm.log_probability(2, 3), f64::NEG_INFINITY);
        assert_eq!(tm.log_probability(2, 0), 0.0);
        assert_eq!(tm.states.len(), st.num_states);
    }

    #[test]
    fn ties_resolve_to_first_state() {
        // Uniform likelihoods everywhere: every phase scores the same, the
        // first maximal terminal state (the downbeat) wins and the rest of the
        // path follows the cycle backwards from it.
        let pattern = Pattern::gaussian("4/4", vec![vec![0.0]; 4], vec![vec![1.0]; 4]);
        let tracker = BarTracker::new(DbnConfig {
            patterns: vec![pattern],
            pattern_change_prob: 0.0,
        })
        .unwrap();
        let obs = Array2::<f32>::zeros((6, 1));
        let beats = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
        let decoded = tracker.decode(obs.view(), &beats).unwrap();
        assert_eq!(decoded.beat_numbers(), vec![4, 1, 2, 3, 4, 1]);
    }

    #[test]
    fn all_zero_paths_are_unreachable() {
        // Activation of exactly 1 forces a downbeat; two in a row cannot
        // happen in 3/4 without a pattern change.
        let tracker = BarTracker::new(meters(&[3], 0.0)).unwrap();
        let err = tracker
            .decode_activations(&[1.0, 1.0], &[0.5, 1.0])
            .unwrap_err();
        assert!(matches!(err, BarTrackError::Unreachable { num_beats: 2 }));
    }

    #[test]
    fn one_beat_bar_marks_every_beat_as_downbeat() {
        let tracker = BarTracker::new(meters(&[1], 0.0)).unwrap();
        let decoded = tracker
            .decode_activations(&[0.2, 0.9, 0.4], &[0.5, 1.0, 1.5])
            .unwrap();
        assert_eq!(decoded.beat_numbers(), vec![1, 1, 1]);
    }

    #[test]
    fn path_likelihood_rejects_foreign_states() {
        let tracker = BarTracker::new(meters(&[3], 0.0)).unwrap();
        let obs = Array2::<f32>::from_elem((1, 1), 0.5);
        let err = tracker
            .path_log_likelihood(obs.view(), &[BarState { pattern: 0, position: 3 }])
            .unwrap_err();
        assert!(matches!(err, BarTrackError::InvalidInput(_)));
    }

    #[test]
    fn pattern_names_follow_path() {
        let tracker = BarTracker::new(meters(&[3, 4], 0.05)).unwrap();
        let obs = [0.9, 0.1, 0.1, 0.9, 0.1, 0.1, 0.9, 0.1, 0.1, 0.1, 0.9, 0.1, 0.1, 0.1, 0.9, 0.1];
        let beats: Vec<f32> = (0..obs.len()).map(|i| 0.5 * i as f32).collect();
        let decoded = tracker.decode_activations(&obs, &beats).unwrap();
        let names = tracker.pattern_names(&decoded);
        assert_eq!(names[0], "3/4");
        assert_eq!(names[15], "4/4");
    }
}
