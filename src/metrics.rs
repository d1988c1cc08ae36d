//! Per-cell metrics tables.
//!
//! A table is a CSV file (gzip-compressed when the path ends in `.gz`)
//! with a YAML sidecar at `<path>.yaml` listing every column and its type.
//! Values are parsed against the column types once, when the table is
//! loaded; after that rows are typed records.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{IoContext, PipelineError, Result};

pub const CELL_ID: &str = "cell_id";
pub const IS_CONTROL: &str = "is_control";
pub const IS_CONTAMINATED: &str = "is_contaminated";

/// Column storage type, named as in the schema sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    Str,
    Category,
}

/// Ordered column name -> type mapping
pub type Schema = IndexMap<String, ColumnType>;

/// Static schema of the alignment metrics table for a set of screened genomes
pub fn metrics_schema<S: AsRef<str>>(fastqscreen_genomes: &[S]) -> Schema {
    use ColumnType::*;

    let fixed: &[(&str, ColumnType)] = &[
        ("cell_id", Category),
        ("total_mapped_reads", Int),
        ("library_id", Category),
        ("unpaired_mapped_reads", Int),
        ("paired_mapped_reads", Int),
        ("unpaired_duplicate_reads", Int),
        ("paired_duplicate_reads", Int),
        ("unmapped_reads", Int),
        ("percent_duplicate_reads", Float),
        ("estimated_library_size", Int),
        ("total_reads", Int),
        ("total_duplicate_reads", Int),
        ("total_properly_paired", Int),
        ("coverage_breadth", Float),
        ("coverage_depth", Float),
        ("median_insert_size", Float),
        ("mean_insert_size", Float),
        ("standard_deviation_insert_size", Float),
        ("cell_call", Str),
        ("column", Int),
        ("experimental_condition", Str),
        ("img_col", Int),
        ("index_i5", Str),
        ("index_i7", Str),
        ("primer_i5", Str),
        ("primer_i7", Str),
        ("row", Int),
        ("sample_type", Str),
        ("is_contaminated", Bool),
        ("trim", Bool),
        ("sample_id", Category),
        ("species", Str),
        ("condition", Str),
        ("index_sequence", Str),
        ("pick_met", Str),
        ("is_control", Bool),
        ("aligned", Float),
        ("expected", Float),
        ("overlap_with_all_filters", Float),
        ("overlap_with_all_filters_and_qual", Float),
        ("overlap_with_dups", Float),
        ("overlap_without_dups", Float),
        ("fastqscreen_nohit", Int),
        ("fastqscreen_total_reads", Int),
        ("fastqscreen_nohit_ratio", Float),
        ("tss_enrichment_score", Float),
    ];

    let mut schema: Schema = fixed.iter().map(|(n, t)| (n.to_string(), *t)).collect();
    for genome in fastqscreen_genomes {
        let genome = genome.as_ref();
        schema.insert(format!("fastqscreen_{genome}"), Int);
        schema.insert(format!("fastqscreen_{genome}_multihit"), Int);
        schema.insert(format!("fastqscreen_{genome}_ratio"), Float);
    }
    schema
}

/// Screened organisms named by `fastqscreen_<organism>[_...]` columns,
/// sorted and de-duplicated, excluding the `nohit` and `total` columns.
pub fn fastqscreen_genomes<S: AsRef<str>>(columns: &[S]) -> Vec<String> {
    let genomes: BTreeSet<String> = columns
        .iter()
        .filter_map(|c| c.as_ref().strip_prefix("fastqscreen_"))
        .filter_map(|rest| rest.split('_').next())
        .filter(|g| !g.is_empty() && *g != "nohit" && *g != "total")
        .map(str::to_string)
        .collect();
    genomes.into_iter().collect()
}

/// A single typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Parse a raw field against its column type; empty is `Missing`
    pub fn parse(raw: &str, dtype: ColumnType) -> Option<Value> {
        if raw.is_empty() {
            return Some(Value::Missing);
        }
        match dtype {
            ColumnType::Int => raw.parse::<i64>().ok().map(Value::Int).or_else(|| {
                // Integer columns written through a float type, e.g. "12.0"
                raw.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::Int(f as i64))
            }),
            ColumnType::Float => raw.parse::<f64>().ok().map(Value::Float),
            ColumnType::Bool => parse_bool(raw).map(Value::Bool),
            ColumnType::Str | ColumnType::Category => Some(Value::Str(raw.to_string())),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Value::Str(s) => f.write_str(s),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "True" | "true" | "TRUE" | "1" => Some(true),
        "False" | "false" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

/// One row of the metrics table
#[derive(Debug, Clone, PartialEq)]
pub struct CellMetrics {
    pub cell_id: String,
    pub is_control: bool,
    pub is_contaminated: bool,
    /// Every other column, keyed by name
    values: HashMap<String, Value>,
}

impl CellMetrics {
    pub fn new(cell_id: impl Into<String>, is_control: bool, is_contaminated: bool) -> Self {
        CellMetrics {
            cell_id: cell_id.into(),
            is_control,
            is_contaminated,
            values: HashMap::new(),
        }
    }

    pub fn with_value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn set_value(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Numeric value of a column; None when absent, missing or non-numeric
    pub fn number(&self, column: &str) -> Option<f64> {
        self.values.get(column).and_then(Value::as_f64)
    }

    fn render(&self, column: &str) -> String {
        match column {
            CELL_ID => self.cell_id.clone(),
            IS_CONTROL => Value::Bool(self.is_control).to_string(),
            IS_CONTAMINATED => Value::Bool(self.is_contaminated).to_string(),
            _ => self
                .values
                .get(column)
                .map(Value::to_string)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnSpec {
    name: String,
    dtype: ColumnType,
}

/// Contents of the `<table>.yaml` schema sidecar
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    header: bool,
    sep: String,
    columns: Vec<ColumnSpec>,
}

/// Path of the schema sidecar for a table
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".yaml");
    PathBuf::from(name)
}

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Metrics table with typed rows in file order
#[derive(Debug, Clone, Default)]
pub struct MetricsTable {
    schema: Schema,
    rows: Vec<CellMetrics>,
}

impl MetricsTable {
    /// Build a table in memory; `schema` must contain `cell_id` and `is_control`
    pub fn from_rows(schema: Schema, rows: Vec<CellMetrics>) -> Result<Self> {
        for required in [CELL_ID, IS_CONTROL] {
            if !schema.contains_key(required) {
                return Err(PipelineError::config(format!(
                    "metrics table has no '{required}' column"
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for row in &rows {
            if !seen.insert(row.cell_id.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate cell id '{}' in metrics table",
                    row.cell_id
                )));
            }
        }
        Ok(MetricsTable { schema, rows })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_path(path)?;
        let input: Box<dyn Read> = if is_gzip(path) {
            Box::new(MultiGzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let sidecar = sidecar_path(path);
        let mut delimiter = b',';
        let declared: Option<Schema> = if sidecar.exists() {
            let reader = File::open(&sidecar).with_path(&sidecar)?;
            let layout: Sidecar = serde_yaml::from_reader(reader)?;
            if !layout.header {
                return Err(PipelineError::config(format!(
                    "{} declares a table without a header row",
                    sidecar.display()
                )));
            }
            delimiter = match layout.sep.as_bytes() {
                [b] => *b,
                _ => {
                    return Err(PipelineError::config(format!(
                        "{}: separator must be a single byte, got {:?}",
                        sidecar.display(),
                        layout.sep
                    )))
                }
            };
            Some(layout.columns.into_iter().map(|c| (c.name, c.dtype)).collect())
        } else {
            None
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .from_reader(input);
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut seen = BTreeSet::new();
        for col in &header {
            if !seen.insert(col.as_str()) {
                return Err(PipelineError::config(format!(
                    "column '{col}' appears more than once in {}",
                    path.display()
                )));
            }
        }

        let schema: Schema = match declared {
            Some(declared) => header
                .iter()
                .map(|col| {
                    declared.get(col).map(|t| (col.clone(), *t)).ok_or_else(|| {
                        PipelineError::config(format!(
                            "column '{col}' of {} is not declared in {}",
                            path.display(),
                            sidecar.display()
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => {
                let builtin = metrics_schema(&fastqscreen_genomes(&header));
                header
                    .iter()
                    .map(|col| (col.clone(), *builtin.get(col).unwrap_or(&ColumnType::Str)))
                    .collect()
            }
        };

        let mut rows = Vec::new();
        for (lineno, record) in reader.records().enumerate() {
            let record = record?;
            let at = || format!("{}:{}", path.display(), lineno + 2);

            let mut row = CellMetrics::new(String::new(), false, false);
            let mut has_control = false;
            for ((column, dtype), raw) in schema.iter().zip(record.iter()) {
                let value = Value::parse(raw, *dtype).ok_or_else(|| {
                    PipelineError::config(format!(
                        "{}: value '{raw}' of column '{column}' is not a valid {dtype:?}",
                        at()
                    ))
                })?;
                match (column.as_str(), value) {
                    (CELL_ID, Value::Str(id)) => row.cell_id = id,
                    (CELL_ID, _) => {
                        return Err(PipelineError::config(format!("{}: empty cell id", at())))
                    }
                    (IS_CONTROL, Value::Bool(b)) => {
                        row.is_control = b;
                        has_control = true;
                    }
                    (IS_CONTAMINATED, Value::Bool(b)) => row.is_contaminated = b,
                    (IS_CONTAMINATED, Value::Missing) => row.is_contaminated = false,
                    (IS_CONTROL | IS_CONTAMINATED, other) => {
                        return Err(PipelineError::config(format!(
                            "{}: expected a boolean for '{column}', got {other:?}",
                            at()
                        )))
                    }
                    (_, value) => {
                        row.values.insert(column.clone(), value);
                    }
                }
            }
            if schema.contains_key(IS_CONTROL) && !has_control {
                return Err(PipelineError::config(format!(
                    "{}: missing is_control value for cell '{}'",
                    at(),
                    row.cell_id
                )));
            }
            rows.push(row);
        }

        debug!("loaded {} cells from {}", rows.len(), path.display());
        MetricsTable::from_rows(schema, rows)
    }

    /// Write the table and its schema sidecar
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_path(path)?;
        if is_gzip(path) {
            let encoder = self.write_csv(
                GzEncoder::new(BufWriter::new(file), Compression::default()),
                path,
            )?;
            encoder.finish().with_path(path)?.flush().with_path(path)?;
        } else {
            self.write_csv(BufWriter::new(file), path)?
                .flush()
                .with_path(path)?;
        }

        let sidecar = Sidecar {
            header: true,
            sep: ",".to_string(),
            columns: self
                .schema
                .iter()
                .map(|(name, dtype)| ColumnSpec {
                    name: name.clone(),
                    dtype: *dtype,
                })
                .collect(),
        };
        let sidecar_file = sidecar_path(path);
        let out = File::create(&sidecar_file).with_path(&sidecar_file)?;
        serde_yaml::to_writer(out, &sidecar)?;
        Ok(())
    }

    fn write_csv<W: Write>(&self, out: W, path: &Path) -> Result<W> {
        let mut writer = csv::WriterBuilder::new().from_writer(out);
        writer.write_record(self.schema.keys())?;
        for row in &self.rows {
            writer.write_record(self.schema.keys().map(|col| row.render(col)))?;
        }
        writer.into_inner().map_err(|e| {
            PipelineError::io(path, std::io::Error::new(e.error().kind(), e.error().to_string()))
        })
    }

    pub fn columns(&self) -> Vec<&str> {
        self.schema.keys().map(String::as_str).collect()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[CellMetrics] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [CellMetrics] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, cell_id: &str) -> Option<&CellMetrics> {
        self.rows.iter().find(|r| r.cell_id == cell_id)
    }

    pub fn cell_ids(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.cell_id.as_str()).collect()
    }

    /// Declare (or retype) a column; existing columns keep their position
    pub fn set_column_type(&mut self, column: &str, dtype: ColumnType) {
        self.schema.insert(column.to_string(), dtype);
    }
}
