//! Cell barcode (`CB`) tagging of per-cell BAMs.

use std::path::Path;

use log::info;
use rust_htslib::bam::{self, record::Aux, Format, Header, Read, Record};

use crate::error::{PipelineError, Result};

pub const CELL_BARCODE_TAG: &[u8; 2] = b"CB";

/// Copy `infile` to `outfile`, adding `CB:Z:<cell_id>` to every record that
/// has no `CB` tag yet. Returns the number of records written.
pub fn tag_bam_with_cell_id<P: AsRef<Path>, Q: AsRef<Path>>(
    infile: P,
    outfile: Q,
    cell_id: &str,
) -> Result<u64> {
    let mut reader = bam::Reader::from_path(infile.as_ref())?;
    let header = Header::from_template(reader.header());
    let mut writer = bam::Writer::from_path(outfile.as_ref(), &header, Format::Bam)?;

    let mut record = Record::new();
    let mut written = 0u64;
    while let Some(result) = reader.read(&mut record) {
        result?;
        if record.aux(CELL_BARCODE_TAG).is_err() {
            record.push_aux(CELL_BARCODE_TAG, Aux::String(cell_id))?;
        }
        writer.write(&record)?;
        written += 1;
    }

    info!(
        "tagged {written} records of {} with cell id {cell_id}",
        infile.as_ref().display()
    );
    Ok(written)
}

/// Cell id carried by the `CB` tag of the first record of a BAM
pub fn cell_id_from_bam<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let mut reader = bam::Reader::from_path(path)?;
    let mut record = Record::new();

    match reader.read(&mut record) {
        Some(result) => result?,
        None => {
            return Err(PipelineError::config(format!(
                "{} has no records to read a cell id from",
                path.display()
            )))
        }
    }

    match record.aux(CELL_BARCODE_TAG) {
        Ok(Aux::String(cell_id)) => Ok(cell_id.to_string()),
        Ok(other) => Err(PipelineError::config(format!(
            "CB tag of the first record in {} is not a string: {other:?}",
            path.display()
        ))),
        Err(_) => Err(PipelineError::config(format!(
            "first record in {} has no CB tag",
            path.display()
        ))),
    }
}
