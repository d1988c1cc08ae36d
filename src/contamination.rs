//! Cross-organism contamination calls from fastq screen counts.

use std::path::Path;

use log::info;

use crate::error::{PipelineError, Result};
use crate::metrics::{fastqscreen_genomes, CellMetrics, ColumnType, MetricsTable, IS_CONTAMINATED};

pub const DEFAULT_THRESHOLD: f64 = 0.05;
const TOTAL_READS: &str = "fastqscreen_total_reads";

/// Contamination detector configuration
#[derive(Debug, Clone)]
pub struct ContaminationConfig {
    /// Primary reference organism, e.g. `grch37`
    pub reference: String,
    /// A cell is contaminated when some other organism's unique read
    /// fraction is strictly greater than this
    pub threshold: f64,
}

impl ContaminationConfig {
    pub fn new(reference: impl Into<String>) -> Self {
        ContaminationConfig {
            reference: reference.into(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Unique (non multi-hit) read fraction of one organism in one cell.
///
/// A zero denominator follows float division: a positive count gives an
/// infinite ratio, a zero count gives NaN, which never exceeds a threshold.
pub fn unique_ratio(cell: &CellMetrics, organism: &str) -> Option<f64> {
    let mapped = cell.number(&format!("fastqscreen_{organism}"))?;
    let multihit = cell.number(&format!("fastqscreen_{organism}_multihit"))?;
    let total = cell.number(TOTAL_READS)?;
    Some((mapped - multihit) / total)
}

/// Screened organisms other than the primary reference.
///
/// Fails when the primary reference has no counts in the table.
pub fn alternate_organisms(table: &MetricsTable, reference: &str) -> Result<Vec<String>> {
    let organisms = fastqscreen_genomes(&table.columns());
    if !organisms.iter().any(|o| o == reference) {
        return Err(PipelineError::config(format!(
            "could not find fastq screen counts for reference organism '{reference}' \
             (screened organisms: {organisms:?})"
        )));
    }
    if !table.schema().contains_key(TOTAL_READS) {
        return Err(PipelineError::config(format!(
            "metrics table has no '{TOTAL_READS}' column"
        )));
    }
    Ok(organisms.into_iter().filter(|o| o != reference).collect())
}

/// Overwrite `is_contaminated` on every row; returns the number of
/// contaminated cells.
pub fn call_contamination(table: &mut MetricsTable, config: &ContaminationConfig) -> Result<usize> {
    let alternates = alternate_organisms(table, &config.reference)?;

    let mut contaminated = 0;
    for cell in table.rows_mut() {
        cell.is_contaminated = alternates.iter().any(|organism| {
            unique_ratio(cell, organism).is_some_and(|ratio| ratio > config.threshold)
        });
        if cell.is_contaminated {
            contaminated += 1;
        }
    }
    table.set_column_type(IS_CONTAMINATED, ColumnType::Bool);

    Ok(contaminated)
}

/// Read a metrics table, call contamination and write the augmented table
/// plus its schema sidecar.
pub fn add_contamination_status<P: AsRef<Path>, Q: AsRef<Path>>(
    infile: P,
    outfile: Q,
    config: &ContaminationConfig,
) -> Result<()> {
    let mut table = MetricsTable::read(infile.as_ref())?;
    let contaminated = call_contamination(&mut table, config)?;
    info!(
        "{contaminated} of {} cells contaminated (reference {}, threshold {})",
        table.len(),
        config.reference,
        config.threshold
    );
    table.write(outfile.as_ref())
}
