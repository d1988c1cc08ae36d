//! Run result metadata: produced files, their roles and run identifiers.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::classify::CellGroup;
use crate::error::{IoContext, PipelineError, Result};
use crate::run_metadata::RunMetadata;

pub const WORKFLOW_TYPE: &str = "alignment";

/// Sidecar suffixes looked up next to each produced file
const SIDECAR_SUFFIXES: [&str; 4] = ["yaml", "bai", "csi", "wig"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    AlignmentMetrics,
    AlignmentGcMetrics,
    MergedCellsBam,
    DetailedFastqscreenBreakdown,
    AlignmentMetricsPlots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filtering {
    Passed,
    Control,
    Contaminated,
}

impl From<CellGroup> for Filtering {
    fn from(group: CellGroup) -> Self {
        match group {
            CellGroup::Pass => Filtering::Passed,
            CellGroup::Control => Filtering::Control,
            CellGroup::Contaminated => Filtering::Contaminated,
        }
    }
}

/// A file written by the run together with its declared role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub result_type: ResultType,
    pub filtering: Option<Filtering>,
}

impl ProducedFile {
    pub fn new<P: Into<PathBuf>>(path: P, result_type: ResultType) -> Self {
        ProducedFile {
            path: path.into(),
            result_type,
            filtering: None,
        }
    }

    pub fn merged_bam<P: Into<PathBuf>>(path: P, group: CellGroup) -> Self {
        ProducedFile {
            path: path.into(),
            result_type: ResultType::MergedCellsBam,
            filtering: Some(group.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub result_type: ResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtering: Option<Filtering>,
    #[serde(default)]
    pub auxiliary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaBlock {
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub version: String,
    pub sample_ids: Vec<String>,
    pub library_ids: Vec<String>,
    pub cell_ids: Vec<String>,
    #[serde(default)]
    pub lane_ids: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub files: BTreeMap<String, FileEntry>,
    pub meta: MetaBlock,
}

impl MetadataRecord {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_path(path)?;
        Self::from_yaml(&text)
    }
}

/// File names of the sidecars of `path` that exist on disk
pub fn auxiliary_files(path: &Path) -> Vec<String> {
    SIDECAR_SUFFIXES
        .iter()
        .filter_map(|suffix| {
            let mut name = path.as_os_str().to_owned();
            name.push(".");
            name.push(suffix);
            let sidecar = PathBuf::from(name);
            if sidecar.is_file() {
                sidecar.file_name().map(|n| n.to_string_lossy().into_owned())
            } else {
                None
            }
        })
        .collect()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            PipelineError::config(format!("produced path {} has no file name", path.display()))
        })
}

/// Build the metadata record of a run from its produced files and the run
/// metadata it was configured with. Two files with the same name are rejected.
pub fn assemble_metadata(files: &[ProducedFile], run: &RunMetadata) -> Result<MetadataRecord> {
    let mut entries = BTreeMap::new();
    for file in files {
        let name = file_name(&file.path)?;
        let entry = FileEntry {
            result_type: file.result_type,
            filtering: file.filtering,
            auxiliary: auxiliary_files(&file.path),
        };
        if entries.insert(name.clone(), entry).is_some() {
            return Err(PipelineError::config(format!(
                "file name '{name}' produced more than once"
            )));
        }
    }

    let meta = MetaBlock {
        workflow_type: WORKFLOW_TYPE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sample_ids: run.sample_ids(),
        library_ids: run.library_ids(),
        cell_ids: run.cell_ids(),
        lane_ids: run.lane_ids(),
    };

    Ok(MetadataRecord {
        files: entries,
        meta,
    })
}

pub fn write_metadata<P: AsRef<Path>>(record: &MetadataRecord, path: P) -> Result<()> {
    let path = path.as_ref();
    let text = record.to_yaml()?;
    let mut writer = BufWriter::new(File::create(path).with_path(path)?);
    writer.write_all(text.as_bytes()).with_path(path)?;
    writer.flush().with_path(path)?;
    info!(
        "wrote metadata for {} files to {}",
        record.files.len(),
        path.display()
    );
    Ok(())
}
