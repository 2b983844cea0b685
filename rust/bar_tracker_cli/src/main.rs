mod files;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use bar_tracker_core::io::{load_beat_times, load_observations, write_beats, write_downbeats};
use bar_tracker_core::{
    validate_core_config, BarTracker, CoreConfig, DecodedBars, ObservationParams, Pattern,
};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "bar-tracker",
    about = "Infer bar positions of beats with a multi-pattern bar-position HMM"
)]
struct Cli {
    #[command(flatten)]
    options: DecodeOptions,
    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct DecodeOptions {
    /// JSON config file (same layout as the default config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Probability of switching to another pattern at a beat
    #[arg(long, global = true)]
    pattern_change_prob: Option<f64>,
    /// Beats per bar, one activation pattern per value (e.g. 3,4)
    #[arg(long, value_delimiter = ',', global = true)]
    beats_per_bar: Vec<usize>,
    /// Weight of the downbeat state in the activation observation model
    #[arg(long, global = true)]
    observation_weight: Option<f64>,
    /// Only write downbeat times
    #[arg(long, global = true)]
    downbeats: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode one observation file with its beat annotations
    Single {
        /// Per-beat observations (.npy or .npz)
        input: PathBuf,
        /// Beat annotation file
        beats: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode many files, pairing each input with the beat file of the same stem
    Batch {
        /// Observation and beat files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Output directory (next to each input if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = ".npy")]
        input_suffix: String,
        #[arg(long, default_value = ".beats")]
        beat_suffix: String,
        #[arg(long, default_value = ".beats.txt")]
        output_suffix: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli.options)?;
    let tracker = BarTracker::new(config.dbn).context("building the bar tracker")?;
    log::info!(
        "{} patterns, {} states",
        tracker.patterns().len(),
        tracker.num_states()
    );
    let downbeats = cli.options.downbeats;

    match cli.command {
        Commands::Single {
            input,
            beats,
            output,
        } => {
            let decoded = decode_file(&tracker, &input, &beats)?;
            match output {
                Some(path) => write_file(&path, &decoded, downbeats)?,
                None => write_table(io::stdout().lock(), &decoded, downbeats)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Batch {
            files,
            output,
            input_suffix,
            beat_suffix,
            output_suffix,
        } => run_batch(
            &tracker,
            &files,
            output.as_deref(),
            &input_suffix,
            &beat_suffix,
            &output_suffix,
            downbeats,
        ),
    }
}

/// Defaults, then the config file, then individual flags.
fn build_config(options: &DecodeOptions) -> Result<CoreConfig> {
    let mut config = match &options.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };

    if !options.beats_per_bar.is_empty() {
        config.dbn.patterns = options
            .beats_per_bar
            .iter()
            .map(|&n| Pattern::activation(format!("{}/4", n), n))
            .collect();
    }
    if let Some(weight) = options.observation_weight {
        for pattern in &mut config.dbn.patterns {
            if !matches!(pattern.observation, ObservationParams::Activation { .. }) {
                bail!(
                    "--observation-weight only applies to activation patterns, {} is not one",
                    pattern.name
                );
            }
            *pattern = pattern.clone().with_observation_weight(weight);
        }
    }
    if let Some(prob) = options.pattern_change_prob {
        config.dbn.pattern_change_prob = prob;
    }

    validate_core_config(&config).context("invalid configuration")?;
    Ok(config)
}

fn decode_file(tracker: &BarTracker, input: &Path, beats: &Path) -> Result<DecodedBars> {
    let observations = load_observations(input)
        .with_context(|| format!("loading observations {}", input.display()))?;
    let beat_times = load_beat_times(beats)
        .with_context(|| format!("loading beats {}", beats.display()))?;
    let decoded = tracker
        .decode(observations.view(), &beat_times)
        .with_context(|| format!("decoding {}", input.display()))?;
    log::info!(
        "{}: {} beats, {} downbeats, log-likelihood {:.4}",
        input.display(),
        decoded.len(),
        decoded.downbeat_times().len(),
        decoded.log_likelihood
    );
    Ok(decoded)
}

#[allow(clippy::too_many_arguments)]
fn run_batch(
    tracker: &BarTracker,
    files: &[PathBuf],
    output_dir: Option<&Path>,
    input_suffix: &str,
    beat_suffix: &str,
    output_suffix: &str,
    downbeats: bool,
) -> Result<ExitCode> {
    if let Some(dir) = output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }
    let beat_files = files::with_suffix(files, beat_suffix);
    let inputs = files::with_suffix(files, input_suffix);
    let mut processed = 0usize;

    for input in inputs {
        let Some(beats) = files::match_beat_file(input, input_suffix, &beat_files, beat_suffix)?
        else {
            log::warn!("no beat file for {}, skipping", input.display());
            continue;
        };
        let Some(out) = files::output_path(input, input_suffix, output_dir, output_suffix) else {
            continue;
        };
        let decoded = decode_file(tracker, input, beats)?;
        write_file(&out, &decoded, downbeats)?;
        processed += 1;
    }

    log::info!("processed {} files", processed);
    Ok(ExitCode::SUCCESS)
}

fn write_file(path: &Path, decoded: &DecodedBars, downbeats: bool) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_table(BufWriter::new(file), decoded, downbeats)
        .with_context(|| format!("writing {}", path.display()))
}

fn write_table<W: Write>(writer: W, decoded: &DecodedBars, downbeats: bool) -> Result<()> {
    if downbeats {
        write_downbeats(writer, decoded)?;
    } else {
        write_beats(writer, decoded)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DecodeOptions {
        DecodeOptions::default()
    }

    #[test]
    fn flags_override_defaults() {
        let config = build_config(&DecodeOptions {
            beats_per_bar: vec![2, 3],
            observation_weight: Some(50.0),
            pattern_change_prob: Some(0.01),
            ..options()
        })
        .unwrap();
        let names: Vec<&str> = config.dbn.patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["2/4", "3/4"]);
        assert_eq!(config.dbn.pattern_change_prob, 0.01);
        assert!(config.dbn.patterns.iter().all(|p| p.observation
            == ObservationParams::Activation {
                observation_weight: 50.0
            }));
    }

    #[test]
    fn beats_per_bar_list_leaves_subcommand_alone() {
        let cli = Cli::try_parse_from([
            "bar-tracker",
            "--beats-per-bar",
            "3,4",
            "single",
            "a.npy",
            "a.beats",
        ])
        .unwrap();
        assert_eq!(cli.options.beats_per_bar, vec![3, 4]);
        assert!(matches!(cli.command, Commands::Single { .. }));

        let cli = Cli::try_parse_from([
            "bar-tracker",
            "single",
            "a.npy",
            "a.beats",
            "--beats-per-bar",
            "2",
            "--beats-per-bar",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.options.beats_per_bar, vec![2, 3]);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let err = build_config(&DecodeOptions {
            beats_per_bar: vec![4],
            pattern_change_prob: Some(0.1),
            ..options()
        })
        .unwrap_err();
        assert!(format!("{:#}", err).contains("dbn.pattern_change_prob"));
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"dbn": {"patterns": [{"name": "waltz", "beats_per_bar": 3}], "pattern_change_prob": 0.0}}"#,
        )
        .unwrap();
        let config = build_config(&DecodeOptions {
            config: Some(path),
            ..options()
        })
        .unwrap();
        assert_eq!(config.dbn.patterns.len(), 1);
        assert_eq!(config.dbn.patterns[0].name, "waltz");
    }

    #[test]
    fn batch_decodes_matched_files_and_skips_others() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("song.npy");
        let orphan = dir.path().join("orphan.npy");
        let beats = dir.path().join("song.beats");
        let activations = ndarray::arr1(&[0.48208269f32, 0.12524545, 0.1998145, 0.48208269]);
        ndarray_npy::write_npy(&input, &activations).unwrap();
        ndarray_npy::write_npy(&orphan, &activations).unwrap();
        fs::write(&beats, "0.0913\n0.7997\n1.4806\n2.1478\n").unwrap();

        let config = build_config(&DecodeOptions {
            beats_per_bar: vec![3],
            ..options()
        })
        .unwrap();
        let tracker = BarTracker::new(config.dbn).unwrap();
        let out_dir = dir.path().join("out");
        let files = vec![input, orphan, beats];
        run_batch(
            &tracker,
            &files,
            Some(&out_dir),
            ".npy",
            ".beats",
            ".beats.txt",
            false,
        )
        .unwrap();

        let written = fs::read_to_string(out_dir.join("song.beats.txt")).unwrap();
        assert_eq!(written, "0.091\t1\n0.800\t2\n1.481\t3\n2.148\t1\n");
        assert!(!out_dir.join("orphan.beats.txt").exists());
    }
}
