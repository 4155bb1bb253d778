//! Reading and writing portable table files.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::PortableRecord;
use crate::error::{MigrateError, Result};

/// Record count and checksum of a finished file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub path: PathBuf,
    pub records: u64,
    pub sha256: String,
}

/// Streams records into a portable file.
///
/// Writes go to `<file>.tmp`, which is renamed into place by
/// [`PortableWriter::finish`]; an abandoned writer never leaves a file that
/// looks complete.
pub struct PortableWriter {
    path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
    hasher: Sha256,
    records: u64,
}

impl PortableWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let temp_path = path.with_extension("jsonl.tmp");
        let file = File::create(&temp_path)?;
        Ok(Self {
            path,
            temp_path,
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
            records: 0,
        })
    }

    pub fn write(&mut self, record: &PortableRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.hasher.update(&line);
        self.writer.write_all(&line)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn finish(mut self) -> Result<FileSummary> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.temp_path, &self.path)?;
        Ok(FileSummary {
            path: self.path,
            records: self.records,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

/// Forward-only reader over a portable file.
pub struct PortableReader {
    path: PathBuf,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl PortableReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)
            .map_err(|e| MigrateError::portable(&path, format!("cannot open: {}", e)))?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    /// Next record, or `None` at end of file. Blank lines are skipped.
    pub fn next_record(&mut self) -> Result<Option<PortableRecord>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                MigrateError::portable(&self.path, format!("line {}: {}", self.line_no, e))
            })?;
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Up to `size` records; empty at end of file.
    pub fn next_batch(&mut self, size: usize) -> Result<Vec<PortableRecord>> {
        let mut batch = Vec::with_capacity(size.min(4_096));
        while batch.len() < size {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }
}

/// Check that the SHA-256 of `path` matches `expected` (hex).
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let mut file =
        File::open(path).map_err(|e| MigrateError::portable(path, format!("cannot open: {}", e)))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(MigrateError::portable(
            path,
            format!("checksum mismatch (manifest {}, file {})", expected, actual),
        ));
    }
    Ok(())
}
