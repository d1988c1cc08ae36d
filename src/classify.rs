//! Partition per-cell artifacts into control, contaminated and pass groups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;

use crate::error::{PipelineError, Result};
use crate::metrics::MetricsTable;

/// Output partition of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellGroup {
    Control,
    Contaminated,
    Pass,
}

impl CellGroup {
    pub const ALL: [CellGroup; 3] = [CellGroup::Control, CellGroup::Contaminated, CellGroup::Pass];

    pub fn as_str(&self) -> &'static str {
        match self {
            CellGroup::Control => "control",
            CellGroup::Contaminated => "contaminated",
            CellGroup::Pass => "pass",
        }
    }

    /// Label used for the `filtering` field of run metadata
    pub fn filtering_label(&self) -> &'static str {
        match self {
            CellGroup::Control => "control",
            CellGroup::Contaminated => "contaminated",
            CellGroup::Pass => "passed",
        }
    }

    /// Group of a cell from its two flags. Controls win over contamination.
    pub fn from_flags(is_control: bool, is_contaminated: bool) -> Self {
        match (is_control, is_contaminated) {
            (true, _) => CellGroup::Control,
            (false, true) => CellGroup::Contaminated,
            (false, false) => CellGroup::Pass,
        }
    }
}

impl fmt::Display for CellGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellGroup {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control" => Ok(CellGroup::Control),
            "contaminated" => Ok(CellGroup::Contaminated),
            "pass" | "passed" => Ok(CellGroup::Pass),
            _ => Err(PipelineError::config(format!("unknown cell group '{s}'"))),
        }
    }
}

/// Per-cell artifacts keyed by cell id, iterated in cell id order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet(BTreeMap<String, PathBuf>);

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair parallel cell id and path lists. Lists of different lengths or
    /// a repeated cell id are rejected.
    pub fn from_parallel<S, P>(cell_ids: &[S], paths: &[P]) -> Result<Self>
    where
        S: AsRef<str>,
        P: AsRef<Path>,
    {
        if cell_ids.len() != paths.len() {
            return Err(PipelineError::config(format!(
                "got {} cell ids for {} input files",
                cell_ids.len(),
                paths.len()
            )));
        }
        let mut set = Self::new();
        for (cell_id, path) in cell_ids.iter().zip(paths) {
            set.insert(cell_id.as_ref(), path.as_ref())?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, cell_id: &str, path: &Path) -> Result<()> {
        if self.0.contains_key(cell_id) {
            return Err(PipelineError::config(format!(
                "cell id '{cell_id}' given for more than one input file"
            )));
        }
        self.0.insert(cell_id.to_string(), path.to_path_buf());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, cell_id: &str) -> Option<&Path> {
        self.0.get(cell_id).map(PathBuf::as_path)
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0.iter().map(|(c, p)| (c.as_str(), p.as_path()))
    }
}

impl FromIterator<(String, PathBuf)> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = (String, PathBuf)>>(iter: I) -> Self {
        ArtifactSet(iter.into_iter().collect())
    }
}

/// The three disjoint groups of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub control: ArtifactSet,
    pub contaminated: ArtifactSet,
    pub pass: ArtifactSet,
}

impl Classification {
    pub fn group(&self, group: CellGroup) -> &ArtifactSet {
        match group {
            CellGroup::Control => &self.control,
            CellGroup::Contaminated => &self.contaminated,
            CellGroup::Pass => &self.pass,
        }
    }

    fn group_mut(&mut self, group: CellGroup) -> &mut ArtifactSet {
        match group {
            CellGroup::Control => &mut self.control,
            CellGroup::Contaminated => &mut self.contaminated,
            CellGroup::Pass => &mut self.pass,
        }
    }
}

/// Fails unless `cell_ids` (the cells of `other`) are exactly the metrics
/// cell ids.
pub(crate) fn check_same_cells<'a>(
    other: &'static str,
    cell_ids: impl Iterator<Item = &'a str>,
    metrics: &MetricsTable,
) -> Result<()> {
    let metric_ids = metrics.cell_ids();
    let other_ids: BTreeSet<&str> = cell_ids.collect();

    let only_in_other: Vec<String> = other_ids
        .difference(&metric_ids)
        .map(|c| c.to_string())
        .collect();
    let only_in_metrics: Vec<String> = metric_ids
        .difference(&other_ids)
        .map(|c| c.to_string())
        .collect();
    if !only_in_other.is_empty() || !only_in_metrics.is_empty() {
        return Err(PipelineError::SetMismatch {
            other,
            only_in_other,
            only_in_metrics,
        });
    }
    Ok(())
}

/// Split artifacts into groups using the metrics flags.
///
/// The artifact cell ids must be exactly the metrics cell ids.
pub fn classify(artifacts: &ArtifactSet, metrics: &MetricsTable) -> Result<Classification> {
    check_same_cells("artifacts", artifacts.cell_ids(), metrics)?;

    let mut groups = Classification::default();
    for row in metrics.rows() {
        let group = CellGroup::from_flags(row.is_control, row.is_contaminated);
        if let Some(path) = artifacts.get(&row.cell_id) {
            groups.group_mut(group).insert(&row.cell_id, path)?;
        }
    }

    info!(
        "classified {} cells: {} control, {} contaminated, {} pass",
        artifacts.len(),
        groups.control.len(),
        groups.contaminated.len(),
        groups.pass.len()
    );
    Ok(groups)
}
