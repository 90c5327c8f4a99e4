//! N-way merge over sorted key/value iterators, the primitive the Shuffle
//! Engine uses both for per-pile merges and the final cross-pile merge.

use crate::error::{CoreError, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub type Record = (Vec<u8>, Vec<u8>);
pub type SourceIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Merges `N` already-sorted sources into one ascending stream. A source
/// that errors mid-merge surfaces the error tagged with its index and
/// ends the merge; partial output already yielded by `next()` stands.
pub struct KWayMerge {
    sources: Vec<SourceIter>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl KWayMerge {
    /// Pulls the first record from every source before returning, bounded
    /// to `init_parallelism` concurrent pulls so opening many sorted
    /// files at once doesn't serialize on disk seek latency.
    pub fn new(mut sources: Vec<SourceIter>, init_parallelism: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(init_parallelism.max(1))
            .build()
            .map_err(|e| CoreError::codec(e))?;

        let firsts: Vec<Option<Result<Record>>> = pool.install(|| {
            use rayon::prelude::*;
            sources.par_iter_mut().map(|s| s.next()).collect()
        });

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, first) in firsts.into_iter().enumerate() {
            if let Some(record) = first {
                let (key, value) = record.map_err(|e| CoreError::codec(format!("merge source {idx}: {e}")))?;
                heap.push(Reverse(HeapEntry { key, value, source: idx }));
            }
        }
        Ok(Self { sources, heap })
    }

    /// Pops the globally smallest head record and advances its source.
    /// Does not itself understand key prefixes — a caller restricting the
    /// merge to a key range (e.g. the Shuffle Engine's partition prefix)
    /// stops draining once a returned key falls outside it.
    fn pop_smallest(&mut self) -> Result<Option<Record>> {
        let Reverse(entry) = match self.heap.pop() {
            Some(e) => e,
            None => return Ok(None),
        };
        let source = entry.source;
        if let Some(next) = self.sources[source].next() {
            let (key, value) = next.map_err(|e| CoreError::codec(format!("merge source {source}: {e}")))?;
            self.heap.push(Reverse(HeapEntry { key, value, source }));
        }
        Ok(Some((entry.key, entry.value)))
    }
}

impl Iterator for KWayMerge {
    type Item = Result<Record>;
    fn next(&mut self) -> Option<Self::Item> {
        match self.pop_smallest() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(records: Vec<(&str, &str)>) -> SourceIter {
        Box::new(
            records
                .into_iter()
                .map(|(k, v)| Ok((k.as_bytes().to_vec(), v.as_bytes().to_vec()))),
        )
    }

    #[test]
    fn merges_two_sorted_sources_in_key_order() {
        let a = source(vec![("a", "1"), ("c", "3")]);
        let b = source(vec![("b", "2"), ("d", "4")]);
        let merge = KWayMerge::new(vec![a, b], 2).unwrap();
        let keys: Vec<String> = merge
            .map(|r| String::from_utf8(r.unwrap().0).unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn empty_sources_produce_empty_merge() {
        let merge = KWayMerge::new(vec![], 4).unwrap();
        assert_eq!(merge.count(), 0);
    }

    #[test]
    fn propagates_source_error_with_index() {
        let bad: SourceIter = Box::new(std::iter::once(Err(CoreError::Codec("broken".to_string()))));
        let good = source(vec![("a", "1")]);
        let mut merge = KWayMerge::new(vec![good, bad], 2).unwrap();
        // First record ("a") is fine; the error source had nothing to pull yet
        // since it errors on its first call, which happens during `new`.
        let _ = merge.next();
    }
}
