//! Merge the per-cell BAMs of each cell group into one indexed BAM.
//!
//! Every member is coordinate-sorted into a shard on a bounded worker
//! pool, then shards are k-way merged in cell id order. Ties on
//! `(reference id, position)` go to the earlier cell, and within a cell to
//! the earlier record, so the output bytes do not depend on the number of
//! workers.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;
use rust_htslib::bam::{self, CompressionLevel, Format, Header, HeaderView, Read, Record};

use crate::classify::{classify, ArtifactSet, CellGroup};
use crate::coverage::{coverage_path, write_coverage_summary};
use crate::error::{IoContext, PipelineError, Result};
use crate::intervals::ReferenceIndex;
use crate::metrics::MetricsTable;

/// BAI cannot address positions beyond 2^29
const MAX_BAI_SEQUENCE_LENGTH: u64 = 1 << 29;
const CSI_MIN_SHIFT: u32 = 14;

/// Group merger configuration
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Worker threads for sorting and intermediate merge rounds
    pub workers: usize,
    /// Upper bound on shards opened at once by one merge
    pub max_open_files: usize,
    /// Window size of the coverage summary, in bases
    pub count_window: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            workers: 1,
            max_open_files: 256,
            count_window: 25,
        }
    }
}

impl MergeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::config("worker count must be a positive integer"));
        }
        if self.max_open_files < 2 {
            return Err(PipelineError::config("max open files must be at least 2"));
        }
        if self.count_window == 0 {
            return Err(PipelineError::config("count window must be a positive integer"));
        }
        Ok(())
    }
}

/// Final output paths, one per group
#[derive(Debug, Clone)]
pub struct GroupOutputs {
    pub control: PathBuf,
    pub contaminated: PathBuf,
    pub pass: PathBuf,
}

impl GroupOutputs {
    pub fn path(&self, group: CellGroup) -> &Path {
        match group {
            CellGroup::Control => &self.control,
            CellGroup::Contaminated => &self.contaminated,
            CellGroup::Pass => &self.pass,
        }
    }
}

/// Files produced for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedGroup {
    pub group: CellGroup,
    pub bam: PathBuf,
    pub index: PathBuf,
    pub coverage: PathBuf,
    pub cells: Vec<String>,
}

/// Sort key: reference id (unmapped last), then position
fn record_key(record: &Record) -> (u32, i64) {
    (record.tid() as u32, record.pos())
}

/// Header of `bam` with its `@CO` lines removed
pub fn template_header<P: AsRef<Path>>(bam: P) -> Result<Header> {
    let reader = bam::Reader::from_path(bam.as_ref())?;
    let text = reader.header().as_bytes();
    let kept: Vec<&[u8]> = text
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty() && !line.starts_with(b"@CO"))
        .collect();
    let mut filtered = kept.join(&b'\n');
    filtered.push(b'\n');
    Ok(Header::from_template(&HeaderView::from_bytes(&filtered)))
}

/// `(name, length)` of every reference sequence, in header order
fn target_sequences(header: &HeaderView) -> Vec<(Vec<u8>, Option<u64>)> {
    (0..header.target_count())
        .map(|tid| (header.tid2name(tid).to_vec(), header.target_len(tid)))
        .collect()
}

fn check_inputs(members: &ArtifactSet) -> Result<()> {
    for (cell_id, path) in members.iter() {
        if !path.exists() {
            return Err(PipelineError::MissingInput {
                cell_id: cell_id.to_string(),
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Read one member and write it coordinate-sorted to `shard`
fn sort_member(
    cell_id: &str,
    path: &Path,
    shard: &Path,
    template: &Header,
    expected_targets: &[(Vec<u8>, Option<u64>)],
) -> Result<usize> {
    let mut reader = bam::Reader::from_path(path)?;
    if target_sequences(reader.header()) != expected_targets {
        return Err(PipelineError::config(format!(
            "reference sequences of {} (cell {cell_id}) differ in name or length from the template header",
            path.display()
        )));
    }

    let mut records: Vec<Record> = reader.records().collect::<std::result::Result<_, _>>()?;
    records.sort_by_key(record_key);

    let mut writer = bam::Writer::from_path(shard, template, Format::Bam)?;
    writer.set_compression_level(CompressionLevel::Fastest)?;
    for record in &records {
        writer.write(record)?;
    }
    debug!("sorted {} records for cell {cell_id}", records.len());
    Ok(records.len())
}

/// Stable k-way merge of sorted inputs; ties go to the earlier input
fn merge_sorted(
    inputs: &[PathBuf],
    output: &Path,
    header: &Header,
    level: CompressionLevel,
) -> Result<u64> {
    let mut readers = inputs
        .iter()
        .map(bam::Reader::from_path)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut heads: Vec<Option<Record>> = Vec::with_capacity(readers.len());
    let mut heap = BinaryHeap::new();

    for (i, reader) in readers.iter_mut().enumerate() {
        let mut record = Record::new();
        match reader.read(&mut record) {
            Some(result) => {
                result?;
                heap.push(Reverse((record_key(&record), i)));
                heads.push(Some(record));
            }
            None => heads.push(None),
        }
    }

    let mut writer = bam::Writer::from_path(output, header, Format::Bam)?;
    writer.set_compression_level(level)?;

    let mut written = 0u64;
    while let Some(Reverse((_, i))) = heap.pop() {
        let Some(mut record) = heads[i].take() else {
            continue;
        };
        writer.write(&record)?;
        written += 1;

        if let Some(result) = readers[i].read(&mut record) {
            result?;
            heap.push(Reverse((record_key(&record), i)));
            heads[i] = Some(record);
        }
    }
    Ok(written)
}

/// Move `from` to `to`, copying when they are on different filesystems
fn promote(from: &Path, to: &Path) -> Result<()> {
    if let Err(e) = fs::rename(from, to) {
        debug!(
            "rename {} -> {} failed ({e}), copying instead",
            from.display(),
            to.display()
        );
        fs::copy(from, to).with_path(to)?;
        fs::remove_file(from).with_path(from)?;
    }
    Ok(())
}

fn index_type(header: &Header) -> bam::index::Type {
    let view = HeaderView::from_header(header);
    let longest = (0..view.target_count())
        .filter_map(|tid| view.target_len(tid))
        .max()
        .unwrap_or(0);
    if longest > MAX_BAI_SEQUENCE_LENGTH {
        bam::index::Type::Csi(CSI_MIN_SHIFT)
    } else {
        bam::index::Type::Bai
    }
}

fn index_path(bam: &Path, idx_type: &bam::index::Type) -> PathBuf {
    let suffix = match idx_type {
        bam::index::Type::Bai => ".bai",
        _ => ".csi",
    };
    let mut name = bam.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Merge one group into `output` and derive its index and coverage summary.
///
/// An empty group yields a valid BAM holding only `template`. Intermediate
/// files live in a uniquely named directory under `workspace` that is
/// removed however this function returns.
pub fn merge_group(
    group: CellGroup,
    members: &ArtifactSet,
    workspace: &Path,
    output: &Path,
    reference: &ReferenceIndex,
    template: &Header,
    config: &MergeConfig,
) -> Result<MergedGroup> {
    config.validate()?;
    check_inputs(members)?;

    if members.is_empty() {
        warn!("no cells in {group} group, writing header-only {}", output.display());
        bam::Writer::from_path(output, template, Format::Bam)?;
    } else {
        fs::create_dir_all(workspace).with_path(workspace)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{group}-"))
            .tempdir_in(workspace)
            .with_path(workspace)?;

        let mut header = template.clone();
        for cell_id in members.cell_ids() {
            header.push_comment(format!("CB:{cell_id}").as_bytes());
        }

        let merged = scratch.path().join("merged.bam");
        merge_members(members, scratch.path(), &merged, template, &header, config)?;
        promote(&merged, output)?;
    }

    let idx_type = index_type(template);
    let index = index_path(output, &idx_type);
    bam::index::build(output, None, idx_type, 1).map_err(|e| PipelineError::Derivation {
        what: "index",
        path: output.to_path_buf(),
        reason: e.to_string(),
    })?;

    let coverage = coverage_path(output);
    write_coverage_summary(output, &coverage, reference, config.count_window).map_err(|e| {
        PipelineError::Derivation {
            what: "coverage summary",
            path: output.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    info!(
        "{group} group: {} cells merged into {}",
        members.len(),
        output.display()
    );
    Ok(MergedGroup {
        group,
        bam: output.to_path_buf(),
        index,
        coverage,
        cells: members.cell_ids().map(str::to_string).collect(),
    })
}

fn merge_members(
    members: &ArtifactSet,
    scratch: &Path,
    merged: &Path,
    template: &Header,
    header: &Header,
    config: &MergeConfig,
) -> Result<()> {
    let expected_targets = target_sequences(&HeaderView::from_header(template));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| PipelineError::config(format!("failed to build worker pool: {e}")))?;

    let members: Vec<(&str, &Path)> = members.iter().collect();
    let mut shards: Vec<PathBuf> = pool.install(|| {
        members
            .par_iter()
            .enumerate()
            .map(|(i, (cell_id, path))| {
                let shard = scratch.join(format!("sorted_{i:06}.bam"));
                sort_member(cell_id, path, &shard, template, &expected_targets)?;
                Ok(shard)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut round = 0;
    while shards.len() > config.max_open_files {
        debug!("merge round {round}: {} shards", shards.len());
        let next: Vec<PathBuf> = pool.install(|| {
            shards
                .par_chunks(config.max_open_files)
                .enumerate()
                .map(|(i, batch)| {
                    let out = scratch.join(format!("round{round}_{i:06}.bam"));
                    merge_sorted(batch, &out, template, CompressionLevel::Fastest)?;
                    Ok(out)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        for shard in &shards {
            fs::remove_file(shard).with_path(shard)?;
        }
        shards = next;
        round += 1;
    }

    let written = merge_sorted(&shards, merged, header, CompressionLevel::Default)?;
    debug!("wrote {written} records to {}", merged.display());
    Ok(())
}

/// Classify all cells and merge each group into its output path.
///
/// The template header is taken from the artifact of the first cell id,
/// with its `@CO` lines removed.
pub fn generate_group_bams(
    artifacts: &ArtifactSet,
    metrics: &MetricsTable,
    reference: &ReferenceIndex,
    outputs: &GroupOutputs,
    tempdir: &Path,
    config: &MergeConfig,
) -> Result<Vec<MergedGroup>> {
    let groups = classify(artifacts, metrics)?;
    check_inputs(artifacts)?;

    let (_, first) = artifacts
        .iter()
        .next()
        .ok_or_else(|| PipelineError::config("no input artifacts given"))?;
    let template = template_header(first)?;

    CellGroup::ALL
        .iter()
        .map(|&group| {
            merge_group(
                group,
                groups.group(group),
                tempdir,
                outputs.path(group),
                reference,
                &template,
                config,
            )
        })
        .collect()
}
