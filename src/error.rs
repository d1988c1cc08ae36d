//! Error taxonomy shared by every pipeline stage.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad or missing static input: absent reference organism, unknown
    /// sequence name, non-positive numeric parameter, malformed table.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cell ids of `other` (artifacts, run metadata) and the metrics
    /// cell ids are not the same set.
    #[error(
        "cell id mismatch between {other} and metrics: \
         only in {other} {only_in_other:?}, only in metrics {only_in_metrics:?}"
    )]
    SetMismatch {
        other: &'static str,
        only_in_other: Vec<String>,
        only_in_metrics: Vec<String>,
    },

    #[error("missing input for cell {cell_id}: {path:?} does not exist")]
    MissingInput { cell_id: String, path: PathBuf },

    /// Index or coverage generation failed after the merged artifact was
    /// written. The artifact is left in place.
    #[error("failed to derive {what} for {path:?}: {reason}")]
    Derivation {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("htslib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attach a path to a raw `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}
