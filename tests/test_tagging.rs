/// Cell barcode tagging of per-cell BAMs
mod common;

use anyhow::Result;
use rust_htslib::bam::{self, record::Aux, Read};
use tempfile::TempDir;

use cellsort::tagging::{cell_id_from_bam, tag_bam_with_cell_id};
use cellsort::PipelineError;

use common::{cell_reads, header, record, write_bam, TestRead};

#[test]
fn test_tag_then_read_back() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = temp_dir.path().join("untagged.bam");
    let output = temp_dir.path().join("tagged.bam");
    write_bam(&input, &cell_reads(0, 4), None);

    let written = tag_bam_with_cell_id(&input, &output, "SA1-A1-R01-C07")?;
    assert_eq!(written, 5);
    assert_eq!(cell_id_from_bam(&output)?, "SA1-A1-R01-C07");

    let mut reader = bam::Reader::from_path(&output)?;
    for record in reader.records() {
        let record = record?;
        assert!(matches!(record.aux(b"CB")?, Aux::String("SA1-A1-R01-C07")));
    }
    Ok(())
}

#[test]
fn test_existing_tag_kept() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = temp_dir.path().join("mixed.bam");
    let output = temp_dir.path().join("tagged.bam");

    let mut writer = bam::Writer::from_path(&input, &header(&[]), bam::Format::Bam)?;
    writer.write(&record(&TestRead::mapped("r1", 0, 10, 20), Some("ORIGINAL")))?;
    writer.write(&record(&TestRead::mapped("r2", 0, 20, 20), None))?;
    drop(writer);

    tag_bam_with_cell_id(&input, &output, "NEW")?;

    let mut reader = bam::Reader::from_path(&output)?;
    let tags: Vec<String> = reader
        .records()
        .map(|r| match r.unwrap().aux(b"CB") {
            Ok(Aux::String(s)) => s.to_string(),
            other => panic!("unexpected CB tag {other:?}"),
        })
        .collect();
    assert_eq!(tags, vec!["ORIGINAL", "NEW"]);
    Ok(())
}

#[test]
fn test_cell_id_errors() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let empty = temp_dir.path().join("empty.bam");
    write_bam(&empty, &[], None);
    assert!(matches!(
        cell_id_from_bam(&empty),
        Err(PipelineError::Configuration(_))
    ));

    let untagged = temp_dir.path().join("untagged.bam");
    write_bam(&untagged, &cell_reads(1, 2), None);
    let err = cell_id_from_bam(&untagged).unwrap_err();
    assert!(err.to_string().contains("no CB tag"));
    Ok(())
}
