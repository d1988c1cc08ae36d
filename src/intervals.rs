//! Genomic interval partitioning for sharded downstream work.
//!
//! A reference is tiled into fixed-size chunks per target sequence, and
//! any single interval can be split again into near-equal pieces.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use log::debug;
use rust_htslib::faidx;

use crate::error::{IoContext, PipelineError, Result};

/// Ordered sequence name -> length index of a reference genome
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    /// Names in reference order (position is the sequence id)
    names: Vec<String>,
    lengths: Vec<u64>,
    name_to_id: HashMap<String, usize>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, length)` pairs, keeping their order
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for (name, length) in pairs {
            index.push(name.into(), length)?;
        }
        Ok(index)
    }

    fn push(&mut self, name: String, length: u64) -> Result<()> {
        if self.name_to_id.contains_key(&name) {
            return Err(PipelineError::config(format!(
                "duplicate sequence name '{name}' in reference"
            )));
        }
        self.name_to_id.insert(name.clone(), self.names.len());
        self.names.push(name);
        self.lengths.push(length);
        Ok(())
    }

    /// Load from a `.fai` file, or from a FASTA through its faidx index.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) == Some("fai") {
            Self::from_fai(path)
        } else {
            Self::from_fasta(path)
        }
    }

    fn from_fai(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path).with_path(path)?);
        let mut index = Self::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.with_path(path)?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (name, length) = match (fields.next(), fields.next()) {
                (Some(name), Some(length)) => (name, length),
                _ => {
                    return Err(PipelineError::config(format!(
                        "{}:{}: expected at least two columns",
                        path.display(),
                        lineno + 1
                    )))
                }
            };
            let length = length.parse::<u64>().map_err(|_| {
                PipelineError::config(format!(
                    "{}:{}: invalid sequence length '{length}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            index.push(name.to_string(), length)?;
        }
        Ok(index)
    }

    fn from_fasta(path: &Path) -> Result<Self> {
        let reader = faidx::Reader::from_path(path)?;
        let mut index = Self::new();
        for i in 0..reader.n_seqs() {
            let name = reader.seq_name(i as i32)?;
            let length = reader.fetch_seq_len(&name);
            index.push(name, length)?;
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    /// Length of a sequence (None if the name is unknown)
    pub fn length(&self, name: &str) -> Option<u64> {
        self.name_to_id.get(name).map(|&id| self.lengths[id])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.names
            .iter()
            .zip(self.lengths.iter())
            .map(|(n, &l)| (n.as_str(), l))
    }

    fn check_targets<S: AsRef<str>>(&self, targets: &[S]) -> Result<HashSet<String>> {
        let mut wanted = HashSet::with_capacity(targets.len());
        for target in targets {
            let target = target.as_ref();
            if !self.contains(target) {
                return Err(PipelineError::config(format!(
                    "sequence '{target}' not found in reference"
                )));
            }
            wanted.insert(target.to_string());
        }
        Ok(wanted)
    }
}

/// A 1-based, inclusive coordinate range on one reference sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenomicInterval {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl GenomicInterval {
    pub fn new(name: impl Into<String>, start: u64, end: u64) -> Result<Self> {
        let name = name.into();
        if start == 0 || start > end {
            return Err(PipelineError::config(format!(
                "invalid interval {name}:{start}-{end}: need 1 <= start <= end"
            )));
        }
        Ok(GenomicInterval { name, start, end })
    }

    /// Number of bases covered
    pub fn span(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.name, self.start, self.end)
    }
}

impl FromStr for GenomicInterval {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || PipelineError::config(format!("invalid interval '{s}', expected name:start-end"));

        // Sequence names may contain ':' themselves
        let (name, coords) = s.rsplit_once(':').ok_or_else(bad)?;
        let (start, end) = coords.split_once('-').ok_or_else(bad)?;
        let start = start.trim().parse::<u64>().map_err(|_| bad())?;
        let end = end.trim().parse::<u64>().map_err(|_| bad())?;
        if name.is_empty() {
            return Err(bad());
        }
        GenomicInterval::new(name, start, end)
    }
}

/// Lazy chunk iterator over the target sequences of a reference.
///
/// Cloning yields an independent iterator from the current position, so a
/// fresh clone of a freshly generated value restarts the sequence.
#[derive(Debug, Clone)]
pub struct Intervals<'a> {
    reference: &'a ReferenceIndex,
    targets: HashSet<String>,
    chunk_size: u64,
    seq_id: usize,
    chunk: u64,
}

impl<'a> Iterator for Intervals<'a> {
    type Item = GenomicInterval;

    fn next(&mut self) -> Option<GenomicInterval> {
        while self.seq_id < self.reference.len() {
            let name = &self.reference.names[self.seq_id];
            let length = self.reference.lengths[self.seq_id];

            if !self.targets.contains(name) {
                self.seq_id += 1;
                self.chunk = 0;
                continue;
            }

            let start = match self.chunk.checked_mul(self.chunk_size).and_then(|s| s.checked_add(1)) {
                Some(start) if start <= length => start,
                _ => {
                    self.seq_id += 1;
                    self.chunk = 0;
                    continue;
                }
            };
            let end = (self.chunk + 1).saturating_mul(self.chunk_size).min(length);
            self.chunk += 1;

            return Some(GenomicInterval {
                name: name.clone(),
                start,
                end,
            });
        }
        None
    }
}

/// Tile every target sequence into chunks of `chunk_size` bases.
///
/// Sequences are visited in reference order; reference sequences that
/// are not targets are skipped. A target that is absent from the
/// reference is an error.
pub fn generate_intervals<'a, S: AsRef<str>>(
    reference: &'a ReferenceIndex,
    targets: &[S],
    chunk_size: u64,
) -> Result<Intervals<'a>> {
    if chunk_size == 0 {
        return Err(PipelineError::config("chunk size must be a positive integer"));
    }
    let targets = reference.check_targets(targets)?;
    debug!(
        "generating intervals of {chunk_size} bp over {} target sequences",
        targets.len()
    );

    Ok(Intervals {
        reference,
        targets,
        chunk_size,
        seq_id: 0,
        chunk: 0,
    })
}

/// Split one interval into at most `num_splits` contiguous pieces.
///
/// The nominal step is `ceil((end - start) / num_splits)`; emission stops
/// as soon as a piece reaches `end`, so short intervals may yield fewer
/// than `num_splits` pieces.
pub fn split_interval(interval: &GenomicInterval, num_splits: u64) -> Result<Vec<GenomicInterval>> {
    if num_splits == 0 {
        return Err(PipelineError::config("number of splits must be a positive integer"));
    }

    let step = (interval.end - interval.start).div_ceil(num_splits);
    let mut pieces = Vec::new();
    let mut curr = interval.start;

    for _ in 0..num_splits {
        let piece_end = curr.saturating_add(step);
        if piece_end >= interval.end {
            pieces.push(GenomicInterval {
                name: interval.name.clone(),
                start: curr,
                end: interval.end,
            });
            break;
        }
        pieces.push(GenomicInterval {
            name: interval.name.clone(),
            start: curr,
            end: piece_end,
        });
        curr = piece_end + 1;
    }

    Ok(pieces)
}

/// Total length of the target sequences
pub fn genome_size<S: AsRef<str>>(reference: &ReferenceIndex, targets: &[S]) -> Result<u64> {
    let targets = reference.check_targets(targets)?;
    Ok(reference
        .iter()
        .filter(|(name, _)| targets.contains(*name))
        .map(|(_, length)| length)
        .sum())
}

/// Default target sequences: autosomes 1-22 plus X and Y
pub fn default_chromosomes() -> Vec<String> {
    (1..=22)
        .map(|i| i.to_string())
        .chain(["X".to_string(), "Y".to_string()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ReferenceIndex {
        ReferenceIndex::from_pairs([("chr1", 2_500_000u64), ("chr2", 100), ("chrM", 16_569)])
            .unwrap()
    }

    fn render(ivs: impl IntoIterator<Item = GenomicInterval>) -> Vec<String> {
        ivs.into_iter().map(|iv| iv.to_string()).collect()
    }

    #[test]
    fn test_generate_intervals_example() {
        let reference = reference();
        let ivs = generate_intervals(&reference, &["chr1"], 1_000_000).unwrap();
        assert_eq!(
            render(ivs),
            vec!["chr1:1-1000000", "chr1:1000001-2000000", "chr1:2000001-2500000"]
        );
    }

    #[test]
    fn test_generate_intervals_follows_reference_order() {
        let reference = reference();
        // Target order is irrelevant; reference order wins
        let ivs = generate_intervals(&reference, &["chr2", "chr1"], 1_000_000).unwrap();
        let names: Vec<String> = ivs.map(|iv| iv.name).collect();
        assert_eq!(names, vec!["chr1", "chr1", "chr1", "chr2"]);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let reference = ReferenceIndex::from_pairs([("1", 2_000_000u64)]).unwrap();
        let ivs: Vec<_> = generate_intervals(&reference, &["1"], 1_000_000).unwrap().collect();
        assert_eq!(ivs.len(), 2);
        assert_eq!(ivs[1].end, 2_000_000);
    }

    #[test]
    fn test_generate_intervals_restartable() {
        let reference = reference();
        let ivs = generate_intervals(&reference, &["chr1", "chrM"], 10_000).unwrap();
        let first: Vec<_> = ivs.clone().collect();
        let second: Vec<_> = ivs.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_huge_chunk_size() {
        let reference = reference();
        let ivs = generate_intervals(&reference, &["chr2", "chrM"], u64::MAX).unwrap();
        assert_eq!(render(ivs), vec!["chr2:1-100", "chrM:1-16569"]);

        let iv = GenomicInterval::new("chr1", u64::MAX - 10, u64::MAX).unwrap();
        let pieces = split_interval(&iv, 2).unwrap();
        assert_eq!(pieces.first().unwrap().start, u64::MAX - 10);
        assert_eq!(pieces.last().unwrap().end, u64::MAX);
    }

    #[test]
    fn test_generate_intervals_unknown_target() {
        let reference = reference();
        let err = generate_intervals(&reference, &["chr9"], 1000).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("chr9"));
    }

    #[test]
    fn test_generate_intervals_zero_chunk() {
        let reference = reference();
        assert!(generate_intervals(&reference, &["chr1"], 0).is_err());
    }

    #[test]
    fn test_split_interval_example() {
        let iv: GenomicInterval = "chr2:1-100".parse().unwrap();
        let pieces = split_interval(&iv, 3).unwrap();
        assert_eq!(render(pieces), vec!["chr2:1-34", "chr2:35-68", "chr2:69-100"]);
    }

    #[test]
    fn test_split_interval_stops_early() {
        let iv: GenomicInterval = "chr2:10-12".parse().unwrap();
        let pieces = split_interval(&iv, 5).unwrap();
        assert_eq!(render(pieces), vec!["chr2:10-11", "chr2:12-12"]);
    }

    #[test]
    fn test_split_single_base() {
        let iv = GenomicInterval::new("chrX", 7, 7).unwrap();
        assert_eq!(render(split_interval(&iv, 4).unwrap()), vec!["chrX:7-7"]);
        assert!(split_interval(&iv, 0).is_err());
    }

    #[test]
    fn test_parse_interval() {
        let iv: GenomicInterval = "HLA-A*01:01:1-300".parse().unwrap();
        assert_eq!(iv.name, "HLA-A*01:01");
        assert_eq!((iv.start, iv.end), (1, 300));

        assert!("chr1:0-10".parse::<GenomicInterval>().is_err());
        assert!("chr1:20-10".parse::<GenomicInterval>().is_err());
        assert!("chr1".parse::<GenomicInterval>().is_err());
        assert!(":1-2".parse::<GenomicInterval>().is_err());
    }

    #[test]
    fn test_genome_size() {
        let reference = reference();
        assert_eq!(genome_size(&reference, &["chr2", "chrM"]).unwrap(), 16_669);
        assert!(genome_size(&reference, &["chr3"]).is_err());
    }

    #[test]
    fn test_duplicate_reference_names() {
        assert!(ReferenceIndex::from_pairs([("a", 1u64), ("a", 2)]).is_err());
    }

    #[test]
    fn test_default_chromosomes() {
        let chroms = default_chromosomes();
        assert_eq!(chroms.len(), 24);
        assert_eq!(chroms[0], "1");
        assert_eq!(chroms[23], "Y");
    }
}
