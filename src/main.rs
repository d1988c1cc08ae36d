use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use cellsort::classify::{ArtifactSet, CellGroup};
use cellsort::contamination::{add_contamination_status, ContaminationConfig, DEFAULT_THRESHOLD};
use cellsort::intervals::{
    default_chromosomes, generate_intervals, genome_size, split_interval, GenomicInterval,
    ReferenceIndex,
};
use cellsort::merge::{generate_group_bams, GroupOutputs, MergeConfig};
use cellsort::metadata::{assemble_metadata, write_metadata, ProducedFile, ResultType};
use cellsort::metrics::MetricsTable;
use cellsort::run_metadata::{add_metadata, read_input_data, RunMetadata};
use cellsort::tagging::{cell_id_from_bam, tag_bam_with_cell_id};

/// Parse a number that may have metric suffix (k/K=1000, m/M=1e6, g/G=1e9)
fn parse_metric_number(s: &str) -> Result<u64, String> {
    if s.is_empty() {
        return Err("Empty string".to_string());
    }

    let (num_part, suffix) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - c.len_utf8()], Some(c)),
        _ => (s, None),
    };

    let base: f64 = num_part
        .parse()
        .map_err(|e| format!("Invalid number: {e}"))?;

    let multiplier = match suffix {
        Some('k') | Some('K') => 1000.0,
        Some('m') | Some('M') => 1_000_000.0,
        Some('g') | Some('G') => 1_000_000_000.0,
        Some(c) => {
            return Err(format!(
                "Unknown suffix '{c}'. Use k/K (1000), m/M (1e6), or g/G (1e9)"
            ))
        }
        None => 1.0,
    };

    let result = base * multiplier;
    if result < 1.0 || result.fract() != 0.0 {
        return Err(format!("Value {result} is not a positive integer"));
    }
    if result > u64::MAX as f64 {
        return Err(format!("Value {result} too large for u64"));
    }

    Ok(result as u64)
}

/// cellsort - single-cell alignment triage
///
/// Contamination calling, control/contaminated/pass merging of per-cell BAMs,
/// run metadata, and genomic interval sharding.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Only log warnings and errors
    #[clap(long = "quiet", global = true)]
    quiet: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print `name:start-end` chunks tiling the target chromosomes
    GenerateIntervals {
        /// Reference FASTA (indexed) or .fai file
        #[clap(long = "reference")]
        reference: PathBuf,

        /// Target chromosomes (default 1-22, X, Y)
        #[clap(long = "chromosomes", num_args = 1..)]
        chromosomes: Option<Vec<String>>,

        /// Chunk size
        #[clap(long = "size", default_value = "1M", value_parser = parse_metric_number)]
        size: u64,

        /// Output file (stdout if not specified)
        #[clap(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Split one `name:start-end` interval into contiguous pieces
    SplitInterval {
        #[clap(long = "interval")]
        interval: GenomicInterval,

        #[clap(long = "num-splits", value_parser = parse_metric_number)]
        num_splits: u64,

        /// Output file (stdout if not specified)
        #[clap(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Print the total length of the target chromosomes
    GenomeSize {
        #[clap(long = "reference")]
        reference: PathBuf,

        #[clap(long = "chromosomes", num_args = 1..)]
        chromosomes: Option<Vec<String>>,
    },

    /// Flag contaminated cells in a metrics table
    AddContaminationStatus {
        /// Metrics CSV (optionally gzipped)
        #[clap(short = 'i', long = "input")]
        input: PathBuf,

        #[clap(short = 'o', long = "output")]
        output: PathBuf,

        /// Primary reference organism
        #[clap(long = "reference", default_value = "grch37")]
        reference: String,

        #[clap(long = "threshold", default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,
    },

    /// Copy per-cell run metadata annotations into a metrics table
    AddMetadata {
        /// Metrics CSV (optionally gzipped)
        #[clap(long = "metrics")]
        metrics: PathBuf,

        /// Run metadata YAML
        #[clap(long = "metadata")]
        metadata: PathBuf,

        #[clap(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// Merge per-cell BAMs into control, contaminated and pass BAMs
    MergeCells {
        /// Per-cell BAM files
        #[clap(long = "bams", num_args = 1.., required = true)]
        bams: Vec<PathBuf>,

        /// Cell ids, parallel to --bams
        #[clap(long = "cell-ids", num_args = 1.., required = true)]
        cell_ids: Vec<String>,

        #[clap(long = "metrics")]
        metrics: PathBuf,

        /// Reference FASTA (indexed) or .fai file
        #[clap(long = "reference")]
        reference: PathBuf,

        #[clap(long = "control-outfile")]
        control_outfile: PathBuf,

        #[clap(long = "contaminated-outfile")]
        contaminated_outfile: PathBuf,

        #[clap(long = "pass-outfile")]
        pass_outfile: PathBuf,

        /// Directory for intermediate files
        #[clap(long = "tempdir")]
        tempdir: PathBuf,

        /// Number of threads for sorting cells
        #[clap(short = 't', long = "threads", default_value = "1")]
        threads: usize,

        /// Maximum intermediate files merged at once
        #[clap(long = "max-open-files", default_value = "256")]
        max_open_files: usize,

        /// Coverage summary window
        #[clap(long = "count-window", default_value = "25")]
        count_window: u32,
    },

    /// Add a CB tag carrying the cell id to every record of a BAM
    TagBam {
        #[clap(short = 'i', long = "input")]
        input: PathBuf,

        #[clap(short = 'o', long = "output")]
        output: PathBuf,

        #[clap(long = "cell-id")]
        cell_id: String,
    },

    /// Print the cell id stored in the CB tag of a BAM
    GetCellId {
        #[clap(long = "bam")]
        bam: PathBuf,
    },

    /// Check a run metadata YAML
    ValidateMetadata {
        #[clap(long = "metadata")]
        metadata: PathBuf,

        /// Input data JSON; its flowcells and lanes must be in the metadata
        #[clap(long = "input-data")]
        input_data: Option<PathBuf>,
    },

    /// Describe the files produced by a run
    GenerateMetadata {
        /// Run metadata YAML the run was configured with
        #[clap(long = "metadata-input")]
        metadata_input: PathBuf,

        #[clap(long = "metadata-output")]
        metadata_output: PathBuf,

        #[clap(long = "metrics", num_args = 1..)]
        metrics: Vec<PathBuf>,

        #[clap(long = "gc-metrics", num_args = 1..)]
        gc_metrics: Vec<PathBuf>,

        #[clap(long = "pass-bam")]
        pass_bam: Option<PathBuf>,

        #[clap(long = "control-bam")]
        control_bam: Option<PathBuf>,

        #[clap(long = "contaminated-bam")]
        contaminated_bam: Option<PathBuf>,

        #[clap(long = "fastqscreen", num_args = 1..)]
        fastqscreen: Vec<PathBuf>,

        #[clap(long = "tarfile")]
        tarfile: Option<PathBuf>,
    },
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match args.command {
        Command::GenerateIntervals {
            reference,
            chromosomes,
            size,
            output,
        } => {
            let reference = ReferenceIndex::from_path(&reference)?;
            let targets = chromosomes.unwrap_or_else(default_chromosomes);
            let mut out = open_output(output.as_deref())?;
            for interval in generate_intervals(&reference, &targets, size)? {
                writeln!(out, "{interval}")?;
            }
            out.flush()?;
        }

        Command::SplitInterval {
            interval,
            num_splits,
            output,
        } => {
            let mut out = open_output(output.as_deref())?;
            for piece in split_interval(&interval, num_splits)? {
                writeln!(out, "{piece}")?;
            }
            out.flush()?;
        }

        Command::GenomeSize {
            reference,
            chromosomes,
        } => {
            let reference = ReferenceIndex::from_path(&reference)?;
            let targets = chromosomes.unwrap_or_else(default_chromosomes);
            println!("{}", genome_size(&reference, &targets)?);
        }

        Command::AddContaminationStatus {
            input,
            output,
            reference,
            threshold,
        } => {
            let config = ContaminationConfig::new(reference).with_threshold(threshold);
            add_contamination_status(&input, &output, &config)?;
        }

        Command::MergeCells {
            bams,
            cell_ids,
            metrics,
            reference,
            control_outfile,
            contaminated_outfile,
            pass_outfile,
            tempdir,
            threads,
            max_open_files,
            count_window,
        } => {
            let artifacts = ArtifactSet::from_parallel(&cell_ids, &bams)?;
            let metrics = MetricsTable::read(&metrics)?;
            let reference = ReferenceIndex::from_path(&reference)?;
            let outputs = GroupOutputs {
                control: control_outfile,
                contaminated: contaminated_outfile,
                pass: pass_outfile,
            };
            let mut config = MergeConfig::default()
                .with_workers(threads)
                .with_max_open_files(max_open_files);
            config.count_window = count_window;

            let merged =
                generate_group_bams(&artifacts, &metrics, &reference, &outputs, &tempdir, &config)?;
            for group in &merged {
                info!(
                    "{}: {} cells -> {}",
                    group.group,
                    group.cells.len(),
                    group.bam.display()
                );
            }
        }

        Command::TagBam {
            input,
            output,
            cell_id,
        } => {
            tag_bam_with_cell_id(&input, &output, &cell_id)?;
        }

        Command::GetCellId { bam } => {
            println!("{}", cell_id_from_bam(&bam)?);
        }

        Command::AddMetadata {
            metrics,
            metadata,
            output,
        } => {
            add_metadata(&metrics, &metadata, &output)?;
        }

        Command::ValidateMetadata {
            metadata,
            input_data,
        } => {
            let run = RunMetadata::from_path(&metadata)?;
            if let Some(input_data) = input_data {
                run.check_input_lanes(&read_input_data(&input_data)?)?;
            }
            run.validate()?;
            info!("{} is valid", metadata.display());
        }

        Command::GenerateMetadata {
            metadata_input,
            metadata_output,
            metrics,
            gc_metrics,
            pass_bam,
            control_bam,
            contaminated_bam,
            fastqscreen,
            tarfile,
        } => {
            let run = RunMetadata::from_path(&metadata_input)?;

            let mut files: Vec<ProducedFile> = Vec::new();
            files.extend(
                metrics
                    .into_iter()
                    .map(|p| ProducedFile::new(p, ResultType::AlignmentMetrics)),
            );
            files.extend(
                gc_metrics
                    .into_iter()
                    .map(|p| ProducedFile::new(p, ResultType::AlignmentGcMetrics)),
            );
            for (bam, group) in [
                (pass_bam, CellGroup::Pass),
                (control_bam, CellGroup::Control),
                (contaminated_bam, CellGroup::Contaminated),
            ] {
                if let Some(bam) = bam {
                    files.push(ProducedFile::merged_bam(bam, group));
                }
            }
            files.extend(
                fastqscreen
                    .into_iter()
                    .map(|p| ProducedFile::new(p, ResultType::DetailedFastqscreenBreakdown)),
            );
            if let Some(tarfile) = tarfile {
                files.push(ProducedFile::new(tarfile, ResultType::AlignmentMetricsPlots));
            }

            let record = assemble_metadata(&files, &run)?;
            write_metadata(&record, &metadata_output)?;
        }
    }

    Ok(())
}
