//! Plain-text split-alignment reader. A byte-range work unit's `[offset,
//! offset+len)` rarely lands on a line boundary; this reader adjusts both
//! ends so that the union of every split in a file produces each line
//! exactly once, with no line duplicated or dropped at a split seam.
//!
//! Alignment rule: if `offset > 0`, the byte immediately before it is
//! inspected. If that byte is not a newline, the task's nominal first
//! line is a continuation of the previous split's last line, so it is
//! discarded here (the previous split already owns it, extended past its
//! own nominal end for the same reason). Symmetrically, if the task's
//! nominal end does not fall on a newline, the read is extended forward
//! until one is found, up to end of file.

use crate::dfs::Dfs;
use crate::error::Result;

const PROBE_CHUNK: u64 = 64 * 1024;

pub struct PlainTextSplitReader;

impl PlainTextSplitReader {
    /// Reads the aligned line set for a `[offset, offset+len)` task against
    /// `path`, returning each line without its trailing newline.
    pub async fn read_lines(dfs: &dyn Dfs, path: &str, offset: u64, len: u64) -> Result<Vec<Vec<u8>>> {
        let file_size = dfs.size(path).await?;
        let nominal_end = (offset + len).min(file_size);

        let start = if offset == 0 {
            0
        } else {
            let probe = dfs.read_range(path, offset - 1, 1).await?;
            if probe[0] == b'\n' {
                offset
            } else {
                match find_newline_from(dfs, path, offset, file_size).await? {
                    Some(pos) => pos + 1,
                    None => file_size,
                }
            }
        };

        let end = if nominal_end >= file_size || nominal_end == 0 {
            nominal_end.max(start)
        } else {
            let last_byte = dfs.read_range(path, nominal_end - 1, 1).await?;
            if last_byte[0] == b'\n' {
                nominal_end
            } else {
                match find_newline_from(dfs, path, nominal_end, file_size).await? {
                    Some(pos) => pos + 1,
                    None => file_size,
                }
            }
        };

        if end <= start {
            return Ok(Vec::new());
        }

        let bytes = dfs.read_range(path, start, end - start).await?;
        let mut lines: Vec<Vec<u8>> = bytes.split(|&b| b == b'\n').map(|s| s.to_vec()).collect();
        if bytes.last() == Some(&b'\n') {
            lines.pop();
        }
        Ok(lines)
    }
}

/// Scans forward from `from` in bounded chunks for the first newline byte,
/// returning its absolute offset. `None` means none exists before `limit`.
async fn find_newline_from(dfs: &dyn Dfs, path: &str, from: u64, limit: u64) -> Result<Option<u64>> {
    let mut cursor = from;
    while cursor < limit {
        let chunk_len = PROBE_CHUNK.min(limit - cursor);
        let chunk = dfs.read_range(path, cursor, chunk_len).await?;
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            return Ok(Some(cursor + pos as u64));
        }
        cursor += chunk_len;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;

    async fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> LocalDfs {
        let dfs = LocalDfs::new(dir.path());
        dfs.write(name, contents).await.unwrap();
        dfs
    }

    #[tokio::test]
    async fn offset_zero_keeps_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = write_file(&dir, "f.txt", b"one\ntwo\nthree\n").await;
        let lines = PlainTextSplitReader::read_lines(&dfs, "f.txt", 0, 4).await.unwrap();
        assert_eq!(lines, vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn mid_line_offset_discards_partial_first_line() {
        let dir = tempfile::tempdir().unwrap();
        // "one\ntwo\nthree\n" -- offset 1 lands inside "one", must skip to "two".
        let dfs = write_file(&dir, "f.txt", b"one\ntwo\nthree\n").await;
        let lines = PlainTextSplitReader::read_lines(&dfs, "f.txt", 1, 6).await.unwrap();
        assert_eq!(lines, vec![b"two".to_vec()]);
    }

    #[tokio::test]
    async fn nominal_end_mid_line_extends_to_next_newline() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = write_file(&dir, "f.txt", b"one\ntwo\nthree\n").await;
        // offset 0, len 5 ends inside "two"; must extend through its newline.
        let lines = PlainTextSplitReader::read_lines(&dfs, "f.txt", 0, 5).await.unwrap();
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn adjacent_splits_union_to_every_line_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let contents: &[u8] = b"alpha\nbeta\ngamma\ndelta\n";
        let dfs = write_file(&dir, "f.txt", contents).await;
        let mid = (contents.len() / 2) as u64;

        let first = PlainTextSplitReader::read_lines(&dfs, "f.txt", 0, mid).await.unwrap();
        let second = PlainTextSplitReader::read_lines(&dfs, "f.txt", mid, contents.len() as u64 - mid)
            .await
            .unwrap();

        let mut all = first;
        all.extend(second);
        assert_eq!(
            all,
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec(), b"delta".to_vec()]
        );
    }

    #[tokio::test]
    async fn split_starting_past_last_newline_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = write_file(&dir, "f.txt", b"only\n").await;
        let lines = PlainTextSplitReader::read_lines(&dfs, "f.txt", 5, 0).await.unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn no_trailing_newline_still_yields_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = write_file(&dir, "f.txt", b"one\ntwo").await;
        let lines = PlainTextSplitReader::read_lines(&dfs, "f.txt", 0, 100).await.unwrap();
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
