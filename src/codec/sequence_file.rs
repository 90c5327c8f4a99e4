//! Binary sequence-file format: a record-oriented input container,
//! distinct from the sorted-file shuffle hand-off. Layout (little-endian
//! numerics):
//!
//! ```text
//! repeat: [ u32 key_len | key bytes | u32 value_len | value bytes ]
//! footer: [ u64 record_count | i32 magic = 0x5EC0 ]
//! ```
//!
//! The footer lets a reader learn the record count, and thus split the
//! file into record-range units, without a prior sequential scan.

use crate::error::{CoreError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const MAGIC: i32 = 0x5EC0;
const FOOTER_LEN: u64 = 8 + 4; // record_count (u64) + magic (i32)

pub struct SequenceFileWriter {
    file: BufWriter<File>,
    record_count: u64,
}

impl SequenceFileWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            record_count: 0,
        })
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.file.write_all(&(key.len() as u32).to_le_bytes())?;
        self.file.write_all(key)?;
        self.file.write_all(&(value.len() as u32).to_le_bytes())?;
        self.file.write_all(value)?;
        self.record_count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.file.write_all(&self.record_count.to_le_bytes())?;
        self.file.write_all(&MAGIC.to_le_bytes())?;
        self.file.flush()?;
        Ok(self.record_count)
    }
}

pub struct SequenceFileReader {
    file: BufReader<File>,
    record_count: u64,
    records_end: u64,
}

impl SequenceFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let total_len = file.metadata()?.len();
        if total_len < FOOTER_LEN {
            return Err(CoreError::codec("sequence file truncated: shorter than footer"));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        let record_count = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let magic = i32::from_le_bytes(footer[8..12].try_into().unwrap());
        if magic != MAGIC {
            return Err(CoreError::codec("sequence file footer magic mismatch"));
        }

        Ok(Self {
            file: BufReader::new(file),
            record_count,
            records_end: total_len - FOOTER_LEN,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    fn read_one(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let key_len = u32::from_le_bytes(len_buf) as usize;
        let mut key = vec![0u8; key_len];
        self.file.read_exact(&mut key)?;

        self.file.read_exact(&mut len_buf)?;
        let value_len = u32::from_le_bytes(len_buf) as usize;
        let mut value = vec![0u8; value_len];
        self.file.read_exact(&mut value)?;

        Ok((key, value))
    }

    /// Reads every record in the file, in append order.
    pub fn read_all(mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.record_count as usize);
        while self.file.stream_position()? < self.records_end {
            out.push(self.read_one()?);
        }
        Ok(out)
    }

    /// Reads the `[start_record, start_record+count)` range. Sequence-file
    /// records have no fixed width, so a range is reached by scanning from
    /// the front rather than seeking directly, unlike the sorted-file's
    /// indexed `locate`.
    pub fn read_range(mut self, start_record: u64, count: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let end_record = start_record + count;
        let mut out = Vec::with_capacity(count as usize);
        let mut record_no = 0u64;
        while self.file.stream_position()? < self.records_end && record_no < end_record {
            if record_no >= start_record {
                out.push(self.read_one()?);
            } else {
                skip_one(&mut self.file)?;
            }
            record_no += 1;
        }
        Ok(out)
    }
}

fn skip_one(file: &mut BufReader<File>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let key_len = u32::from_le_bytes(len_buf) as i64;
    file.seek(SeekFrom::Current(key_len))?;

    file.read_exact(&mut len_buf)?;
    let value_len = u32::from_le_bytes(len_buf) as i64;
    file.seek(SeekFrom::Current(value_len))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_all_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.seq");
        let mut writer = SequenceFileWriter::create(&path).unwrap();
        for i in 0..20u32 {
            writer.append(format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        let count = writer.finish().unwrap();
        assert_eq!(count, 20);

        let reader = SequenceFileReader::open(&path).unwrap();
        assert_eq!(reader.record_count(), 20);
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(records[0].0, b"k000");
        assert_eq!(records[19].0, b"k019");
    }

    #[test]
    fn read_range_returns_only_the_requested_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.seq");
        let mut writer = SequenceFileWriter::create(&path).unwrap();
        for i in 0..10u32 {
            writer.append(format!("k{i:03}").as_bytes(), b"v").unwrap();
        }
        writer.finish().unwrap();

        let reader = SequenceFileReader::open(&path).unwrap();
        let records = reader.read_range(3, 4).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].0, b"k003");
        assert_eq!(records[3].0, b"k006");
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.seq");
        std::fs::write(&path, b"short").unwrap();
        assert!(SequenceFileReader::open(&path).is_err());
    }
}
