//! Loading observations and beat annotations, writing decoded tables.

use crate::types::DecodedBars;
use crate::BarTrackError;
use ndarray::{Array2, ArrayD, Ix2, IxDyn, OwnedRepr};
use ndarray_npy::{read_npy, NpzReader};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

/// Array names tried, in order, when an `.npz` file holds several arrays.
const OBSERVATION_KEYS: [&str; 2] = ["activations", "features"];

pub struct NpzArrays {
    arrays: HashMap<String, ArrayD<f32>>,
}

impl NpzArrays {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BarTrackError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| BarTrackError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.arrays.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Array `name` as an observation matrix (1-D arrays become one column).
    pub fn array2(&self, name: &str) -> Result<Array2<f32>, BarTrackError> {
        observation_matrix(self.by_name(name)?.clone())
    }

    /// The observation array: `activations`, else `features`, else the only
    /// array in the archive.
    pub fn observations(&self) -> Result<Array2<f32>, BarTrackError> {
        for key in OBSERVATION_KEYS {
            if self.arrays.contains_key(key) {
                return self.array2(key);
            }
        }
        match self.names().as_slice() {
            [only] => self.array2(only),
            names => Err(BarTrackError::Io(format!(
                "cannot pick an observation array among {:?}",
                names
            ))),
        }
    }

    fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, BarTrackError> {
        let mut npz = NpzReader::new(reader).map_err(|e| BarTrackError::Io(e.to_string()))?;
        let names = npz.names().map_err(|e| BarTrackError::Io(e.to_string()))?;
        let mut arrays = HashMap::with_capacity(names.len());
        for name in names {
            let array = npz
                .by_name::<OwnedRepr<f32>, IxDyn>(&name)
                .map_err(|e| BarTrackError::Io(e.to_string()))?;
            arrays.insert(normalize_key(&name), array);
        }
        Ok(Self { arrays })
    }

    fn by_name(&self, name: &str) -> Result<&ArrayD<f32>, BarTrackError> {
        let key = normalize_key(name);
        self.arrays
            .get(&key)
            .ok_or_else(|| BarTrackError::Io(format!("array not found in npz: {}", name)))
    }
}

fn normalize_key(name: &str) -> String {
    name.strip_suffix(".npy").unwrap_or(name).to_string()
}

fn observation_matrix(array: ArrayD<f32>) -> Result<Array2<f32>, BarTrackError> {
    match array.ndim() {
        1 => {
            let len = array.len();
            array
                .into_shape((len, 1))
                .map_err(|e| BarTrackError::Io(e.to_string()))
        }
        2 => array
            .into_dimensionality::<Ix2>()
            .map_err(|e| BarTrackError::Io(e.to_string())),
        n => Err(BarTrackError::Io(format!(
            "expected a 1-D or 2-D observation array, got {}-D",
            n
        ))),
    }
}

/// Per-beat observations from an `.npy` or `.npz` file, one row per beat.
pub fn load_observations(path: impl AsRef<Path>) -> Result<Array2<f32>, BarTrackError> {
    let path = path.as_ref();
    let is_npz = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("npz"));
    if is_npz {
        return NpzArrays::open(path)?.observations();
    }
    let array: ArrayD<f32> = read_npy(path)
        .map_err(|e| BarTrackError::Io(format!("{}: {}", path.display(), e)))?;
    observation_matrix(array)
}

/// Beat times from an annotation file (first column of every line).
pub fn load_beat_times(path: impl AsRef<Path>) -> Result<Vec<f32>, BarTrackError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| BarTrackError::Io(format!("{}: {}", path.display(), e)))?;
    parse_beat_times(&text)
        .map_err(|e| BarTrackError::Io(format!("{}: {}", path.display(), e)))
}

/// Parse annotation text. Blank lines and `#` comments are skipped; further
/// columns (e.g. annotated beat numbers) are ignored.
pub fn parse_beat_times(text: &str) -> Result<Vec<f32>, String> {
    let mut times = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        let time = first
            .parse::<f32>()
            .map_err(|e| format!("line {}: {:?} is not a time ({})", line_no + 1, first, e))?;
        times.push(time);
    }
    Ok(times)
}

/// `time<TAB>beat_number` per beat.
pub fn write_beats<W: Write>(mut writer: W, decoded: &DecodedBars) -> Result<(), BarTrackError> {
    for row in &decoded.rows {
        writeln!(writer, "{:.3}\t{}", row.time_sec, row.beat_number)
            .map_err(|e| BarTrackError::Io(e.to_string()))?;
    }
    writer.flush().map_err(|e| BarTrackError::Io(e.to_string()))
}

/// Downbeat times only, one per line.
pub fn write_downbeats<W: Write>(
    mut writer: W,
    decoded: &DecodedBars,
) -> Result<(), BarTrackError> {
    for time in decoded.downbeat_times() {
        writeln!(writer, "{:.3}", time).map_err(|e| BarTrackError::Io(e.to_string()))?;
    }
    writer.flush().map_err(|e| BarTrackError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarState, DownbeatRow};
    use ndarray::{arr1, arr2};
    use ndarray_npy::{write_npy, NpzWriter};

    fn decoded() -> DecodedBars {
        let numbers = [3u32, 1, 2, 3];
        DecodedBars {
            rows: numbers
                .iter()
                .enumerate()
                .map(|(i, &beat_number)| DownbeatRow {
                    time_sec: 0.5 + 0.5 * i as f32,
                    beat_number,
                })
                .collect(),
            log_likelihood: -3.0,
            path: numbers
                .iter()
                .map(|&n| BarState {
                    pattern: 0,
                    position: n as usize - 1,
                })
                .collect(),
        }
    }

    #[test]
    fn beat_file_parsing_skips_comments_and_extra_columns() {
        let text = "# beats\n0.0913\t1\n\n0.7997 2\n1.4806   # trailing\n";
        assert_eq!(parse_beat_times(text).unwrap(), vec![0.0913, 0.7997, 1.4806]);
    }

    #[test]
    fn beat_file_parsing_reports_line() {
        let err = parse_beat_times("0.5\nabc\n").unwrap_err();
        assert!(err.starts_with("line 2"), "{}", err);
    }

    #[test]
    fn beats_table_format() {
        let mut out = Vec::new();
        write_beats(&mut out, &decoded()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0.500\t3\n1.000\t1\n1.500\t2\n2.000\t3\n"
        );

        let mut out = Vec::new();
        write_downbeats(&mut out, &decoded()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1.000\n");
    }

    #[test]
    fn npy_vectors_become_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.npy");
        write_npy(&path, &arr1(&[0.1f32, 0.2, 0.3])).unwrap();
        let obs = load_observations(&path).unwrap();
        assert_eq!(obs.dim(), (3, 1));
        assert_eq!(obs[[2, 0]], 0.3);
    }

    #[test]
    fn npz_prefers_activations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.npz");
        {
            let file = File::create(&path).unwrap();
            let mut npz = NpzWriter::new(file);
            npz.add_array("features", &arr2(&[[1.0f32, 2.0], [3.0, 4.0]]))
                .unwrap();
            npz.add_array("activations", &arr1(&[0.5f32, 0.25])).unwrap();
            npz.finish().unwrap();
        }
        let arrays = NpzArrays::open(&path).unwrap();
        assert_eq!(arrays.names(), vec!["activations", "features"]);
        assert_eq!(load_observations(&path).unwrap(), arr2(&[[0.5], [0.25]]));
        assert_eq!(arrays.array2("features").unwrap().dim(), (2, 2));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_beat_times("/nonexistent/track.beats").unwrap_err();
        assert!(matches!(err, BarTrackError::Io(_)));
    }
}
