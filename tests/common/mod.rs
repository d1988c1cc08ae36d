//! Shared fixtures: tiny reference indexes and per-cell BAMs.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::record::{Aux, Cigar, CigarString};
use rust_htslib::bam::{self, Format, Header, Read, Record};

pub const REFERENCE: [(&str, u64); 2] = [("chr1", 1000), ("chr2", 500)];

/// A read placed at `pos` (0-based) on `tid`, or unmapped when `tid < 0`
#[derive(Debug, Clone)]
pub struct TestRead {
    pub name: String,
    pub tid: i32,
    pub pos: i64,
    pub len: u32,
}

impl TestRead {
    pub fn mapped(name: &str, tid: i32, pos: i64, len: u32) -> Self {
        TestRead {
            name: name.to_string(),
            tid,
            pos,
            len,
        }
    }

    pub fn unmapped(name: &str, len: u32) -> Self {
        TestRead {
            name: name.to_string(),
            tid: -1,
            pos: -1,
            len,
        }
    }
}

pub fn header(comments: &[&str]) -> Header {
    header_with_sequences(&REFERENCE, comments)
}

pub fn header_with_sequences(sequences: &[(&str, u64)], comments: &[&str]) -> Header {
    let mut header = Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", "1.6");
    hd.push_tag(b"SO", "unsorted");
    header.push_record(&hd);
    for &(name, length) in sequences {
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", name);
        sq.push_tag(b"LN", length);
        header.push_record(&sq);
    }
    for comment in comments {
        header.push_comment(comment.as_bytes());
    }
    header
}

/// Write `<dir>/reference.fa.fai` matching `REFERENCE`
pub fn write_fai(dir: &Path) -> PathBuf {
    let path = dir.join("reference.fa.fai");
    let mut text = String::new();
    let mut offset = 0;
    for (name, length) in REFERENCE {
        offset += name.len() as u64 + 2;
        text.push_str(&format!("{name}\t{length}\t{offset}\t60\t61\n"));
        offset += length + length.div_ceil(60);
    }
    fs::write(&path, text).unwrap();
    path
}

pub fn record(read: &TestRead, cell_id: Option<&str>) -> Record {
    let seq = vec![b'A'; read.len as usize];
    let qual = vec![30u8; read.len as usize];
    let mut record = Record::new();
    if read.tid >= 0 {
        let cigar = CigarString(vec![Cigar::Match(read.len)]);
        record.set(read.name.as_bytes(), Some(&cigar), &seq, &qual);
        record.set_tid(read.tid);
        record.set_pos(read.pos);
        record.set_mapq(60);
        record.set_flags(0);
    } else {
        record.set(read.name.as_bytes(), None, &seq, &qual);
        record.set_tid(-1);
        record.set_pos(-1);
        record.set_mapq(0);
        record.set_flags(0x4);
    }
    record.set_mtid(-1);
    record.set_mpos(-1);
    record.set_insert_size(0);
    if let Some(cell_id) = cell_id {
        record.push_aux(b"CB", Aux::String(cell_id)).unwrap();
    }
    record
}

/// Write a per-cell BAM, tagging every read with `cell_id` when given
pub fn write_bam(path: &Path, reads: &[TestRead], cell_id: Option<&str>) {
    write_bam_with_header(path, &header(&[]), reads, cell_id);
}

pub fn write_bam_with_header(path: &Path, header: &Header, reads: &[TestRead], cell_id: Option<&str>) {
    let mut writer = bam::Writer::from_path(path, header, Format::Bam).unwrap();
    for read in reads {
        writer.write(&record(read, cell_id)).unwrap();
    }
}

/// `(qname, tid, pos)` of every record, in file order
pub fn read_positions(path: &Path) -> Vec<(String, i32, i64)> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| {
            let r = r.unwrap();
            (String::from_utf8_lossy(r.qname()).into_owned(), r.tid(), r.pos())
        })
        .collect()
}

pub fn header_text(path: &Path) -> String {
    let reader = bam::Reader::from_path(path).unwrap();
    String::from_utf8_lossy(reader.header().as_bytes()).into_owned()
}

/// Deterministic reads for a cell: mapped on both sequences plus one unmapped
pub fn cell_reads(cell: usize, count: usize) -> Vec<TestRead> {
    let mut reads: Vec<TestRead> = (0..count)
        .map(|i| {
            let tid = (i % 2) as i32;
            let span = REFERENCE[tid as usize].1 as i64 - 50;
            let pos = ((cell * 37 + i * 91) as i64) % span;
            TestRead::mapped(&format!("c{cell}r{i}"), tid, pos, 50)
        })
        .collect();
    reads.push(TestRead::unmapped(&format!("c{cell}u"), 50));
    reads
}
