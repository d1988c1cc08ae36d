//! Run metadata YAML: per-cell sample/library annotations and lane info.
//!
//! ```yaml
//! meta:
//!   lanes:
//!     FLOWCELL1:
//!       "1":
//!         sequencing_centre: CENTRE
//!   cells:
//!     SA1-A1-R1-C1:
//!       sample_id: SA1
//!       library_id: A1
//!       is_control: false
//!       pick_met: C1
//!       condition: A
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use indexmap::IndexMap;
use log::info;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::classify::check_same_cells;
use crate::error::{IoContext, PipelineError, Result};
use crate::metrics::{
    fastqscreen_genomes, metrics_schema, ColumnType, MetricsTable, Value, CELL_ID, IS_CONTAMINATED,
    IS_CONTROL,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellInfo {
    pub sample_id: String,
    pub library_id: String,
    pub is_control: bool,
    pub pick_met: String,
    pub condition: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl CellInfo {
    /// Every annotation of the cell as `(column, value)`, required fields first
    pub fn fields(&self) -> Vec<(String, serde_yaml::Value)> {
        let mut fields = vec![
            ("sample_id".to_string(), self.sample_id.clone().into()),
            ("library_id".to_string(), self.library_id.clone().into()),
            (IS_CONTROL.to_string(), self.is_control.into()),
            ("pick_met".to_string(), self.pick_met.clone().into()),
            ("condition".to_string(), self.condition.clone().into()),
        ];
        fields.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneInfo {
    #[serde(default)]
    pub sequencing_centre: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaSection {
    /// flowcell id -> lane id -> lane info
    #[serde(default)]
    pub lanes: BTreeMap<String, BTreeMap<String, LaneInfo>>,
    pub cells: BTreeMap<String, CellInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub meta: MetaSection,
}

impl RunMetadata {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_path(path)?;
        Self::from_yaml(&text)
            .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Checks beyond the required per-cell fields enforced on load
    pub fn validate(&self) -> Result<()> {
        let samples: BTreeSet<&str> = self
            .meta
            .cells
            .values()
            .filter(|c| !c.is_control)
            .map(|c| c.sample_id.as_str())
            .collect();
        // zero is fine: every cell may be a control
        if samples.len() > 1 {
            return Err(PipelineError::config(format!(
                "only one sample id expected in non control cells, found {samples:?}"
            )));
        }

        for (flowcell, lanes) in &self.meta.lanes {
            for (lane, info) in lanes {
                if info.sequencing_centre.is_none() {
                    return Err(PipelineError::config(format!(
                        "sequencing centre missing for flowcell {flowcell} lane {lane}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn cell_ids(&self) -> Vec<String> {
        self.meta.cells.keys().cloned().collect()
    }

    pub fn sample_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self.meta.cells.values().map(|c| &c.sample_id).collect();
        ids.into_iter().cloned().collect()
    }

    pub fn library_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self.meta.cells.values().map(|c| &c.library_id).collect();
        ids.into_iter().cloned().collect()
    }

    /// flowcell id -> sorted lane ids
    pub fn lane_ids(&self) -> BTreeMap<String, Vec<String>> {
        self.meta
            .lanes
            .iter()
            .map(|(flowcell, lanes)| (flowcell.clone(), lanes.keys().cloned().collect()))
            .collect()
    }

    /// Every flowcell and lane sequenced for the run inputs must be
    /// described under `meta.lanes`.
    pub fn check_input_lanes(&self, inputs: &[InputCellData]) -> Result<()> {
        let mut wanted: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for lane in inputs.iter().flat_map(|cell| &cell.lanes) {
            wanted
                .entry(lane.flowcell_id.as_str())
                .or_default()
                .insert(lane.lane_id.as_str());
        }

        for (flowcell, lanes) in wanted {
            let Some(known) = self.meta.lanes.get(flowcell) else {
                return Err(PipelineError::config(format!(
                    "missing flowcell {flowcell} in metadata yaml"
                )));
            };
            if let Some(lane) = lanes.into_iter().find(|l| !known.contains_key(*l)) {
                return Err(PipelineError::config(format!(
                    "missing lane {lane} for flowcell {flowcell} in metadata yaml"
                )));
            }
        }
        Ok(())
    }
}

/// One sequenced lane of a cell's input fastqs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputLane {
    #[serde(deserialize_with = "identifier")]
    pub flowcell_id: String,
    #[serde(deserialize_with = "identifier")]
    pub lane_id: String,
}

/// Per-cell entry of the input data JSON; only the lanes are read
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputCellData {
    #[serde(default)]
    pub lanes: Vec<InputLane>,
}

/// Identifiers may be written as JSON strings or numbers
fn identifier<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number identifier, got {other}"
        ))),
    }
}

/// Load the input data JSON: a list of cells, each with its `lanes`
pub fn read_input_data<P: AsRef<Path>>(path: P) -> Result<Vec<InputCellData>> {
    let path = path.as_ref();
    let file = File::open(path).with_path(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
}

fn raw_field(value: &serde_yaml::Value) -> Result<String> {
    Ok(match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => Value::Bool(*b).to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)?.trim_end().to_string(),
    })
}

fn inferred_type(value: &serde_yaml::Value) -> ColumnType {
    match value {
        serde_yaml::Value::Bool(_) => ColumnType::Bool,
        serde_yaml::Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Int,
        serde_yaml::Value::Number(_) => ColumnType::Float,
        _ => ColumnType::Str,
    }
}

/// Copy every per-cell annotation of `run` into the metrics rows.
///
/// The run metadata cells must be exactly the metrics cells. Columns
/// unknown to the table take their built-in type, or one inferred from the
/// YAML values (`str` when cells disagree).
pub fn add_run_metadata(table: &mut MetricsTable, run: &RunMetadata) -> Result<()> {
    check_same_cells("run metadata", run.meta.cells.keys().map(String::as_str), table)?;

    let builtin = metrics_schema(&fastqscreen_genomes(&table.columns()));
    let mut types: IndexMap<String, ColumnType> = IndexMap::new();
    for cell in run.meta.cells.values() {
        for (column, value) in cell.fields() {
            let dtype = table
                .schema()
                .get(&column)
                .or_else(|| builtin.get(&column))
                .copied()
                .unwrap_or_else(|| inferred_type(&value));
            match types.get(&column) {
                Some(known) if *known != dtype => {
                    types.insert(column, ColumnType::Str);
                }
                Some(_) => {}
                None => {
                    types.insert(column, dtype);
                }
            }
        }
    }

    for row in table.rows_mut() {
        let Some(cell) = run.meta.cells.get(&row.cell_id) else {
            continue;
        };
        for (column, value) in cell.fields() {
            let dtype = types.get(&column).copied().unwrap_or(ColumnType::Str);
            let raw = raw_field(&value)?;
            let parsed = Value::parse(&raw, dtype).ok_or_else(|| {
                PipelineError::config(format!(
                    "metadata value '{raw}' of '{column}' for cell {} is not a valid {dtype:?}",
                    row.cell_id
                ))
            })?;
            if column == CELL_ID {
                continue;
            }
            if column == IS_CONTROL || column == IS_CONTAMINATED {
                let flag = match parsed {
                    Value::Bool(flag) => flag,
                    other => {
                        return Err(PipelineError::config(format!(
                            "expected a boolean for '{column}' of cell {}, got {other:?}",
                            row.cell_id
                        )))
                    }
                };
                if column == IS_CONTROL {
                    row.is_control = flag;
                } else {
                    row.is_contaminated = flag;
                }
            } else {
                row.set_value(column, parsed);
            }
        }
    }

    for (column, dtype) in types {
        if column != CELL_ID {
            table.set_column_type(&column, dtype);
        }
    }
    Ok(())
}

/// Read a metrics table, annotate it with the run metadata and write it
/// with its schema sidecar.
pub fn add_metadata<P, M, Q>(infile: P, metadata: M, outfile: Q) -> Result<()>
where
    P: AsRef<Path>,
    M: AsRef<Path>,
    Q: AsRef<Path>,
{
    let mut table = MetricsTable::read(infile.as_ref())?;
    let run = RunMetadata::from_path(metadata)?;
    add_run_metadata(&mut table, &run)?;
    info!(
        "added run metadata to {} cells, writing {}",
        table.len(),
        outfile.as_ref().display()
    );
    table.write(outfile)
}
