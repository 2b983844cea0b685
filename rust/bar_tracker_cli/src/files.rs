//! Pairing observation files with their beat annotations in batch mode.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// File name of `path` with `suffix` removed, if it ends with it.
pub fn strip_suffix<'a>(path: &'a Path, suffix: &str) -> Option<&'a str> {
    path.file_name()?.to_str()?.strip_suffix(suffix)
}

/// Files among `files` whose name ends with `suffix`, in the given order.
pub fn with_suffix<'a>(files: &'a [PathBuf], suffix: &str) -> Vec<&'a PathBuf> {
    files
        .iter()
        .filter(|path| strip_suffix(path, suffix).is_some())
        .collect()
}

/// The beat file sharing `input`'s stem.
///
/// `Ok(None)` when nothing matches; more than one match is an error.
pub fn match_beat_file<'a>(
    input: &Path,
    input_suffix: &str,
    candidates: &[&'a PathBuf],
    beat_suffix: &str,
) -> Result<Option<&'a PathBuf>> {
    let Some(stem) = strip_suffix(input, input_suffix) else {
        return Ok(None);
    };
    let matches: Vec<&PathBuf> = candidates
        .iter()
        .copied()
        .filter(|path| strip_suffix(path, beat_suffix) == Some(stem))
        .collect();
    match matches.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        many => bail!(
            "{} beat files match {}: {:?}",
            many.len(),
            input.display(),
            many
        ),
    }
}

/// Where the result for `input` goes: `output_dir` if given, otherwise next
/// to the input.
pub fn output_path(
    input: &Path,
    input_suffix: &str,
    output_dir: Option<&Path>,
    output_suffix: &str,
) -> Option<PathBuf> {
    let stem = strip_suffix(input, input_suffix)?;
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Some(dir.join(format!("{}{}", stem, output_suffix)))
}
