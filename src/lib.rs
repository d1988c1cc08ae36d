// Library exports for cellsort
pub mod classify;
pub mod contamination;
pub mod coverage;
pub mod error;
pub mod intervals;
pub mod merge;
pub mod metadata;
pub mod metrics;
pub mod run_metadata;
pub mod tagging;

pub use error::{PipelineError, Result};
