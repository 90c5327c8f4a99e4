//! Output-side partitioning contracts. Given a record's raw key, decide
//! which of `R` downstream partitions it belongs to and which byte range
//! of the key the sorted-file codec should actually sort on.

/// Standard polynomial rolling hash, masked to 31 bits so the result is
/// always a non-negative `i32`-sized value regardless of platform.
pub fn polynomial_hash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(b as u32);
    }
    h & 0x7fff_ffff
}

pub trait Partitioner: Send + Sync {
    /// Returns `(partition, sort_key)` for one record's raw key bytes.
    fn partition(&self, raw_key: &[u8], num_partitions: u32) -> (u32, Vec<u8>);
}

/// Fields are delimited by any byte in `separators`; partition is derived
/// from a hash of the first `partition_fields` fields, the sort key is
/// the first `key_fields` fields. `key_fields`/`partition_fields` of 0
/// are treated as 1.
pub struct KeyFieldBasedPartitioner {
    pub separators: Vec<u8>,
    pub key_fields: u32,
    pub partition_fields: u32,
}

impl KeyFieldBasedPartitioner {
    /// Byte offset just past the end of the `n`th field (1-indexed). If
    /// that would land at offset 0 (an empty leading field), advances by
    /// one byte so the field is never empty.
    fn field_boundary(&self, raw_key: &[u8], n: u32) -> usize {
        let n = n.max(1);
        let mut fields_seen = 0u32;
        let mut boundary = raw_key.len();
        for (i, &b) in raw_key.iter().enumerate() {
            if self.separators.contains(&b) {
                fields_seen += 1;
                if fields_seen == n {
                    boundary = i;
                    break;
                }
            }
        }
        if boundary == 0 {
            boundary = 1.min(raw_key.len());
        }
        boundary
    }
}

impl Partitioner for KeyFieldBasedPartitioner {
    fn partition(&self, raw_key: &[u8], num_partitions: u32) -> (u32, Vec<u8>) {
        let partition_boundary = self.field_boundary(raw_key, self.partition_fields);
        let key_boundary = self.field_boundary(raw_key, self.key_fields);
        let partition = polynomial_hash(&raw_key[..partition_boundary]) % num_partitions.max(1);
        (partition, raw_key[..key_boundary].to_vec())
    }
}

/// Record prefix is `"<int> "` followed by the real key; partition is the
/// leading integer mod `R`. If no such prefix parses, falls back to
/// hashing the whole key instead of failing.
pub struct IntHashPartitioner;

impl Partitioner for IntHashPartitioner {
    fn partition(&self, raw_key: &[u8], num_partitions: u32) -> (u32, Vec<u8>) {
        if let Some(space) = raw_key.iter().position(|&b| b == b' ') {
            if let Ok(prefix) = std::str::from_utf8(&raw_key[..space]) {
                if let Ok(n) = prefix.parse::<i64>() {
                    let partition = (n.unsigned_abs() as u32) % num_partitions.max(1);
                    return (partition, raw_key[space + 1..].to_vec());
                }
            }
        }
        (polynomial_hash(raw_key) % num_partitions.max(1), raw_key.to_vec())
    }
}
