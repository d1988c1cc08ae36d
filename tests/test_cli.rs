/// End-to-end tests of the cellsort command line
mod common;

use std::fs;
use std::process::{Command, Output};

use anyhow::Result;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use cellsort::metadata::{Filtering, MetadataRecord, ResultType};
use cellsort::metrics::{sidecar_path, MetricsTable, Value};

use common::{cell_reads, write_bam, write_fai};

fn cellsort(args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_cellsort"))
        .arg("--quiet")
        .args(args)
        .output()?)
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_generate_intervals_command() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let fai = write_fai(temp_dir.path());

    let output = cellsort(&[
        "generate-intervals",
        "--reference",
        fai.to_str().unwrap(),
        "--chromosomes",
        "chr2",
        "chr1",
        "--size",
        "400",
    ])?;
    assert!(output.status.success());
    assert_eq!(
        stdout_lines(&output),
        vec![
            "chr1:1-400",
            "chr1:401-800",
            "chr1:801-1000",
            "chr2:1-400",
            "chr2:401-500",
        ]
    );
    Ok(())
}

#[test]
fn test_unknown_chromosome_fails() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let fai = write_fai(temp_dir.path());

    let output = cellsort(&[
        "generate-intervals",
        "--reference",
        fai.to_str().unwrap(),
        "--chromosomes",
        "chrZ",
    ])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("chrZ"), "Should name the sequence, got: {stderr}");
    Ok(())
}

#[test]
fn test_split_and_genome_size_commands() -> Result<()> {
    let output = cellsort(&["split-interval", "--interval", "chr1:1-100", "--num-splits", "4"])?;
    assert!(output.status.success());
    assert_eq!(
        stdout_lines(&output),
        vec!["chr1:1-26", "chr1:27-52", "chr1:53-78", "chr1:79-100"]
    );

    let temp_dir = TempDir::new()?;
    let fai = write_fai(temp_dir.path());
    let output = cellsort(&[
        "genome-size",
        "--reference",
        fai.to_str().unwrap(),
        "--chromosomes",
        "chr1",
        "chr2",
    ])?;
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), vec!["1500"]);
    Ok(())
}

#[test]
fn test_tag_and_get_cell_id_commands() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = temp_dir.path().join("in.bam");
    let output_bam = temp_dir.path().join("out.bam");
    write_bam(&input, &cell_reads(2, 3), None);

    let output = cellsort(&[
        "tag-bam",
        "-i",
        input.to_str().unwrap(),
        "-o",
        output_bam.to_str().unwrap(),
        "--cell-id",
        "SA1-A1-R02-C05",
    ])?;
    assert!(output.status.success());

    let output = cellsort(&["get-cell-id", "--bam", output_bam.to_str().unwrap()])?;
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), vec!["SA1-A1-R02-C05"]);
    Ok(())
}

const RUN_METADATA: &str = r#"
meta:
  lanes:
    FC1:
      "1":
        sequencing_centre: GSC
  cells:
    SA1-A1-R01-C02:
      sample_id: SA1
      library_id: A1
      is_control: false
      pick_met: C1
      condition: A
    SA1-A1-R01-C01:
      sample_id: SA1
      library_id: A1
      is_control: false
      pick_met: C1
      condition: A
"#;

#[test]
fn test_validate_metadata_command() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let good = temp_dir.path().join("good.yaml");
    fs::write(&good, RUN_METADATA)?;
    assert!(cellsort(&["validate-metadata", "--metadata", good.to_str().unwrap()])?
        .status
        .success());

    let bad = temp_dir.path().join("bad.yaml");
    fs::write(&bad, RUN_METADATA.replace("        sequencing_centre: GSC\n", "        x: 1\n"))?;
    let output = cellsort(&["validate-metadata", "--metadata", bad.to_str().unwrap()])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("sequencing centre"));
    Ok(())
}

#[test]
fn test_validate_metadata_checks_input_lanes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let metadata = temp_dir.path().join("meta.yaml");
    fs::write(&metadata, RUN_METADATA)?;
    let validate = |lanes: &str| -> Result<Output> {
        let input = temp_dir.path().join("input.json");
        fs::write(&input, format!(r#"[{{"cell_id": "SA1-A1-R01-C01", "lanes": [{lanes}]}}]"#))?;
        cellsort(&[
            "validate-metadata",
            "--metadata",
            metadata.to_str().unwrap(),
            "--input-data",
            input.to_str().unwrap(),
        ])
    };

    assert!(validate(r#"{"flowcell_id": "FC1", "lane_id": 1}"#)?.status.success());

    let output = validate(r#"{"flowcell_id": "FC7", "lane_id": "1"}"#)?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing flowcell FC7 in metadata yaml"));

    let output = validate(r#"{"flowcell_id": "FC1", "lane_id": "4"}"#)?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("missing lane 4 for flowcell FC1 in metadata yaml"));
    Ok(())
}

#[test]
fn test_add_metadata_command() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    let metadata = dir.join("meta.yaml");
    fs::write(&metadata, RUN_METADATA)?;
    let metrics = dir.join("metrics.csv");
    fs::write(
        &metrics,
        "cell_id,is_control,total_reads\nSA1-A1-R01-C01,False,12\nSA1-A1-R01-C02,False,30\n",
    )?;
    let output = dir.join("annotated.csv.gz");

    let run = cellsort(&[
        "add-metadata",
        "--metrics",
        metrics.to_str().unwrap(),
        "--metadata",
        metadata.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    assert!(run.status.success());
    assert!(sidecar_path(&output).exists());

    let table = MetricsTable::read(&output)?;
    let cell = table.get("SA1-A1-R01-C02").unwrap();
    assert_eq!(cell.get("sample_id"), Some(&Value::Str("SA1".into())));
    assert_eq!(cell.get("pick_met"), Some(&Value::Str("C1".into())));
    assert_eq!(cell.get("total_reads"), Some(&Value::Int(30)));

    fs::write(
        &metrics,
        "cell_id,is_control,total_reads\nSA1-A1-R01-C01,False,12\nSA1-A1-R01-C03,False,30\n",
    )?;
    let run = cellsort(&[
        "add-metadata",
        "--metrics",
        metrics.to_str().unwrap(),
        "--metadata",
        metadata.to_str().unwrap(),
        "-o",
        dir.join("mismatch.csv").to_str().unwrap(),
    ])?;
    assert!(!run.status.success());
    assert!(String::from_utf8_lossy(&run.stderr).contains("only in metrics [\"SA1-A1-R01-C03\"]"));
    assert!(!dir.join("mismatch.csv").exists());
    Ok(())
}

#[test]
fn test_merge_cells_then_generate_metadata() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    let fai = write_fai(dir);

    let mut bams = Vec::new();
    for (i, cell_id) in ["SA1-A1-R01-C01", "SA1-A1-R01-C02"].iter().enumerate() {
        let bam = dir.join(format!("{cell_id}.bam"));
        write_bam(&bam, &cell_reads(i, 4), Some(cell_id));
        bams.push(bam.to_string_lossy().into_owned());
    }
    let metrics = dir.join("metrics.csv");
    fs::write(
        &metrics,
        "cell_id,is_control,is_contaminated\n\
         SA1-A1-R01-C01,False,False\n\
         SA1-A1-R01-C02,False,True\n",
    )?;

    let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
    let output = cellsort(&[
        "merge-cells",
        "--bams",
        &bams[0],
        &bams[1],
        "--cell-ids",
        "SA1-A1-R01-C01",
        "SA1-A1-R01-C02",
        "--metrics",
        &path("metrics.csv"),
        "--reference",
        fai.to_str().unwrap(),
        "--control-outfile",
        &path("control.bam"),
        "--contaminated-outfile",
        &path("contaminated.bam"),
        "--pass-outfile",
        &path("pass.bam"),
        "--tempdir",
        &path("tmp"),
        "--threads",
        "2",
    ])?;
    assert!(
        output.status.success(),
        "merge failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    for name in ["control.bam", "contaminated.bam", "pass.bam"] {
        assert!(dir.join(name).exists());
        assert!(dir.join(format!("{name}.bai")).exists());
        assert!(dir.join(format!("{name}.wig")).exists());
    }

    fs::write(dir.join("run.yaml"), RUN_METADATA)?;
    let output = cellsort(&[
        "generate-metadata",
        "--metadata-input",
        &path("run.yaml"),
        "--metadata-output",
        &path("metadata.yaml"),
        "--metrics",
        &path("metrics.csv"),
        "--pass-bam",
        &path("pass.bam"),
        "--control-bam",
        &path("control.bam"),
        "--contaminated-bam",
        &path("contaminated.bam"),
    ])?;
    assert!(output.status.success());

    let text = fs::read_to_string(dir.join("metadata.yaml"))?;
    let record = MetadataRecord::from_yaml(&text)?;
    assert_eq!(record.to_yaml()?, text);

    let names: Vec<&str> = record.files.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec!["contaminated.bam", "control.bam", "metrics.csv", "pass.bam"]
    );
    let pass = &record.files["pass.bam"];
    assert_eq!(pass.result_type, ResultType::MergedCellsBam);
    assert_eq!(pass.filtering, Some(Filtering::Passed));
    assert_eq!(pass.auxiliary, vec!["pass.bam.bai", "pass.bam.wig"]);
    assert_eq!(record.files["metrics.csv"].filtering, None);
    assert_eq!(
        record.meta.cell_ids,
        vec!["SA1-A1-R01-C01", "SA1-A1-R01-C02"]
    );
    assert_eq!(record.meta.lane_ids["FC1"], vec!["1"]);
    Ok(())
}
