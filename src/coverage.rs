//! Windowed read depth summary of a BAM, written as variableStep WIG.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rust_htslib::bam::{self, record::Cigar, Read, Record};

use crate::error::{IoContext, PipelineError, Result};
use crate::intervals::ReferenceIndex;

/// Path of the coverage sidecar of a BAM
pub fn coverage_path(bam: &Path) -> PathBuf {
    let mut name = bam.as_os_str().to_owned();
    name.push(".wig");
    PathBuf::from(name)
}

/// Aligned bases per window, per reference id
#[derive(Debug, Default)]
struct WindowCounts {
    window: u64,
    bases: BTreeMap<u32, BTreeMap<u64, u64>>,
}

impl WindowCounts {
    fn new(window: u32) -> Self {
        WindowCounts {
            window: window as u64,
            bases: BTreeMap::new(),
        }
    }

    fn add_span(&mut self, tid: u32, mut start: u64, mut len: u64) {
        let windows = self.bases.entry(tid).or_default();
        while len > 0 {
            let w = start / self.window;
            let take = len.min((w + 1) * self.window - start);
            *windows.entry(w).or_insert(0) += take;
            start += take;
            len -= take;
        }
    }

    fn add_record(&mut self, record: &Record) {
        let tid = record.tid() as u32;
        let mut pos = record.pos() as u64;
        for op in record.cigar().iter() {
            match *op {
                Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                    self.add_span(tid, pos, len as u64);
                    pos += len as u64;
                }
                Cigar::Del(len) | Cigar::RefSkip(len) => pos += len as u64,
                _ => {}
            }
        }
    }
}

fn counted(record: &Record) -> bool {
    !(record.is_unmapped()
        || record.is_secondary()
        || record.is_quality_check_failed()
        || record.is_duplicate())
}

/// Write mean depth per `window` bases for every covered window of `bam`.
///
/// The BAM's sequences must all be present in `reference` with matching
/// lengths.
pub fn write_coverage_summary(
    bam: &Path,
    out: &Path,
    reference: &ReferenceIndex,
    window: u32,
) -> Result<()> {
    if window == 0 {
        return Err(PipelineError::config("count window must be a positive integer"));
    }

    let mut reader = bam::Reader::from_path(bam)?;
    let header = reader.header().clone();

    let mut sequences = Vec::with_capacity(header.target_count() as usize);
    for tid in 0..header.target_count() {
        let name = String::from_utf8_lossy(header.tid2name(tid)).into_owned();
        let length = header.target_len(tid).unwrap_or(0);
        match reference.length(&name) {
            Some(ref_len) if ref_len == length => sequences.push((name, length)),
            Some(ref_len) => {
                return Err(PipelineError::config(format!(
                    "sequence '{name}' is {length} bp in {} but {ref_len} bp in the reference",
                    bam.display()
                )))
            }
            None => {
                return Err(PipelineError::config(format!(
                    "sequence '{name}' of {} is not in the reference",
                    bam.display()
                )))
            }
        }
    }

    let mut counts = WindowCounts::new(window);
    let mut record = Record::new();
    while let Some(result) = reader.read(&mut record) {
        result?;
        if counted(&record) {
            counts.add_record(&record);
        }
    }

    let file = File::create(out).with_path(out)?;
    let mut writer = BufWriter::new(file);
    let track = bam
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    writeln!(writer, "track type=wiggle_0 name=\"{track}\"").with_path(out)?;

    let window = window as u64;
    for (tid, windows) in &counts.bases {
        let Some((name, length)) = sequences.get(*tid as usize) else {
            continue;
        };
        writeln!(writer, "variableStep chrom={name} span={window}").with_path(out)?;
        for (&w, &bases) in windows {
            let start = w * window;
            let span = window.min(length.saturating_sub(start)).max(1);
            writeln!(writer, "{} {:.3}", start + 1, bases as f64 / span as f64).with_path(out)?;
        }
    }
    writer.flush().with_path(out)?;
    Ok(())
}
