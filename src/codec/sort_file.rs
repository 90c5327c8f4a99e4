//! On-disk sorted-file format: the compatibility-critical container
//! passed between stages. Layout (little-endian numerics):
//!
//! ```text
//! repeat: [ u32 compressed_block_size | snappy(DataBlock) ]
//!         [ u32 compressed_index_size | snappy(IndexBlock) ]
//!         [ i64 index_absolute_offset ]
//!         [ i32 magic = 0x55AA ]
//! ```
//!
//! `DataBlock` is a bincode-serialized ascending sequence of key/value
//! pairs targeting roughly one block's uncompressed byte budget.
//! `IndexBlock` is a bincode-serialized list of (first key of block,
//! absolute offset of block), sparsified by halving until it is at most
//! the configured maximum number of entries.

use crate::error::{CoreError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const MAGIC: i32 = 0x55AA;
const TRAILER_LEN: u64 = 8 + 4; // index_absolute_offset (i64) + magic (i32)

type IndexEntry = (Vec<u8>, i64);

pub struct SortFileWriter {
    file: BufWriter<File>,
    offset: u64,
    block_target: u64,
    max_index_entries: usize,
    current_block: Vec<(Vec<u8>, Vec<u8>)>,
    current_block_bytes: u64,
    index: Vec<IndexEntry>,
    last_key: Option<Vec<u8>>,
}

impl SortFileWriter {
    pub fn create(path: impl AsRef<Path>, block_target: u64, max_index_entries: usize) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            offset: 0,
            block_target,
            max_index_entries,
            current_block: Vec::new(),
            current_block_bytes: 0,
            index: Vec::new(),
            last_key: None,
        })
    }

    /// Appends one record. Keys must arrive in non-decreasing order; the
    /// writer enforces this since an out-of-order sorted file would
    /// silently break every downstream `Locate`.
    pub fn append(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key < *last {
                return Err(CoreError::codec("sort file writer received out-of-order key"));
            }
        }
        self.current_block_bytes += (key.len() + value.len()) as u64;
        self.last_key = Some(key.clone());
        self.current_block.push((key, value));
        if self.current_block_bytes >= self.block_target {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let first_key = self.current_block[0].0.clone();
        let block_offset = self.offset;
        let encoded = bincode::serialize(&self.current_block)?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&encoded)
            .map_err(CoreError::codec)?;
        self.write_framed(&compressed)?;
        self.index.push((first_key, block_offset as i64));
        self.current_block.clear();
        self.current_block_bytes = 0;
        Ok(())
    }

    fn write_framed(&mut self, compressed: &[u8]) -> Result<()> {
        let len = compressed.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(compressed)?;
        self.offset += 4 + compressed.len() as u64;
        Ok(())
    }

    /// Flushes the last partial block, writes the (sparsified) index and
    /// trailer, and returns the finished file's total size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;
        sparsify(&mut self.index, self.max_index_entries);

        let index_offset = self.offset;
        let encoded = bincode::serialize(&self.index)?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&encoded)
            .map_err(CoreError::codec)?;
        self.write_framed(&compressed)?;

        self.file.write_all(&(index_offset as i64).to_le_bytes())?;
        self.file.write_all(&MAGIC.to_le_bytes())?;
        self.offset += TRAILER_LEN;
        self.file.flush()?;
        Ok(self.offset)
    }
}

/// Halves the index by dropping every other entry until it is within
/// `max_entries`. Coarsens `Locate` resolution but never its correctness:
/// callers always fall back to a sequential scan from the located block.
fn sparsify(index: &mut Vec<IndexEntry>, max_entries: usize) {
    while index.len() > max_entries {
        let halved: Vec<IndexEntry> = index.iter().step_by(2).cloned().collect();
        *index = halved;
    }
}

pub struct SortFileReader {
    file: BufReader<File>,
    index: Vec<IndexEntry>,
    data_region_end: u64,
}

impl SortFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let total_len = file.metadata()?.len();
        if total_len < TRAILER_LEN {
            return Err(CoreError::codec("sort file truncated: shorter than trailer"));
        }

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact(&mut trailer)?;
        let index_offset = i64::from_le_bytes(trailer[0..8].try_into().unwrap());
        let magic = i32::from_le_bytes(trailer[8..12].try_into().unwrap());
        if magic != MAGIC {
            return Err(CoreError::codec("sort file trailer magic mismatch"));
        }

        file.seek(SeekFrom::Start(index_offset as u64))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; len];
        file.read_exact(&mut compressed)?;
        let decompressed = snap::raw::Decoder::new().decompress_vec(&compressed).map_err(CoreError::codec)?;
        let index: Vec<IndexEntry> = bincode::deserialize(&decompressed)?;

        Ok(Self {
            file: BufReader::new(file),
            index,
            data_region_end: index_offset as u64,
        })
    }

    /// Binary-searches the sparse index for the last block whose first
    /// key is `<= key`, returning that block's absolute offset. Scanning
    /// from there (via `scan_from`) finds the exact record, if present.
    pub fn locate(&self, key: &[u8]) -> Option<i64> {
        match self.index.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => Some(self.index[i].1),
            Err(0) => None,
            Err(i) => Some(self.index[i - 1].1),
        }
    }

    /// Reads the length-prefixed block at `offset`, returning its decoded
    /// records plus the number of bytes the frame occupied (so callers
    /// can advance to the next block without re-reading the length).
    fn read_block_at(&mut self, offset: u64) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, u64)> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; len];
        self.file.read_exact(&mut compressed)?;
        let decompressed = snap::raw::Decoder::new().decompress_vec(&compressed).map_err(CoreError::codec)?;
        let records = bincode::deserialize(&decompressed)?;
        Ok((records, 4 + len as u64))
    }

    /// All records in ascending key order, decoding the whole data region
    /// block by block.
    pub fn scan_all(mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset < self.data_region_end {
            let (block, consumed) = self.read_block_at(offset)?;
            offset += consumed;
            out.extend(block);
        }
        Ok(out)
    }

    /// Records from the block located at or after `key`, onward, in
    /// ascending order. Used by consumers that only need a key range
    /// rather than the whole file.
    pub fn scan_from(mut self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut offset = self.locate(key).unwrap_or(0) as u64;
        let mut out = Vec::new();
        while offset < self.data_region_end {
            let (block, consumed) = self.read_block_at(offset)?;
            offset += consumed;
            out.extend(block.into_iter().filter(|(k, _)| k.as_slice() >= key));
        }
        Ok(out)
    }
}
