//! Distributed-filesystem and name-service boundaries. The core only
//! needs the operations below; the concrete cluster DFS (credentials,
//! replication, the actual wire protocol) is a deployment detail behind
//! these traits. `LocalDfs` backs single-machine runs and tests.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[async_trait]
pub trait Dfs: Send + Sync {
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn size(&self, path: &str) -> Result<u64>;
    /// Atomic within a directory; used to publish pile files and commit
    /// output-stage results.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn list(&self, dir: &str) -> Result<Vec<String>>;
    /// Supports `*` and `?` only, matched against the final path segment.
    async fn glob(&self, pattern: &str) -> Result<Vec<String>>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Backs the DFS interface with the local filesystem under `root`. Used
/// for single-machine deployments and tests; `rename` relies on the
/// platform rename syscall being atomic within one directory, same as it
/// would be against a real cluster DFS.
pub struct LocalDfs {
    root: PathBuf,
}

impl LocalDfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Dfs for LocalDfs {
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = fs::File::open(self.resolve(path)).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(full).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(self.resolve(path)).await?.len())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_full = self.resolve(to);
        if let Some(parent) = to_full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.resolve(from), to_full).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path)).await?;
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.resolve(dir)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let path = Path::new(pattern);
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let file_pattern = path.file_name().and_then(|n| n.to_str()).unwrap_or("*");
        let dir_str = dir.to_string_lossy();

        let names = self.list(&dir_str).await.unwrap_or_default();
        Ok(names
            .into_iter()
            .filter(|name| wildcard_match(file_pattern, name))
            .map(|name| {
                if dir_str.is_empty() {
                    name
                } else {
                    format!("{dir_str}/{name}")
                }
            })
            .collect())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }
}

/// Matches `*` (any run of characters) and `?` (any single character)
/// against `name`, anchored at both ends.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn go(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&pattern[1..], name) || (!name.is_empty() && go(pattern, &name[1..])),
            (Some(b'?'), Some(_)) => go(&pattern[1..], &name[1..]),
            (Some(&p), Some(&n)) if p == n => go(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}

/// Coordinator leader election and address resolution: the leader stores
/// its RPC address under a key and holds a session-scoped lock; loss of
/// that session means another process may now be leader, so the holder
/// must exit rather than risk split-brain.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn register(&self, key: &str, address: &str) -> Result<()>;
    async fn resolve(&self, key: &str) -> Result<Option<String>>;
    /// Returns `Err(CoreError::NameServiceSessionLost)` once the held
    /// session lock is confirmed lost.
    async fn check_session(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_range_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new(dir.path());
        dfs.write("a/b.txt", b"hello world").await.unwrap();
        let chunk = dfs.read_range("a/b.txt", 6, 5).await.unwrap();
        assert_eq!(chunk, b"world");
    }

    #[tokio::test]
    async fn rename_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new(dir.path());
        dfs.write("tmp.pile", b"data").await.unwrap();
        dfs.rename("tmp.pile", "0.pile").await.unwrap();
        assert!(!dfs.exists("tmp.pile").await.unwrap());
        assert!(dfs.exists("0.pile").await.unwrap());
    }

    #[tokio::test]
    async fn glob_matches_star_and_question_mark() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new(dir.path());
        dfs.write("piles/0.pile", b"a").await.unwrap();
        dfs.write("piles/1.pile", b"b").await.unwrap();
        dfs.write("piles/readme.txt", b"c").await.unwrap();
        let matched = dfs.glob("piles/?.pile").await.unwrap();
        assert_eq!(matched.len(), 2);
        let matched_star = dfs.glob("piles/*.pile").await.unwrap();
        assert_eq!(matched_star.len(), 2);
    }

    #[test]
    fn wildcard_match_handles_prefix_and_suffix_star() {
        assert!(wildcard_match("*.pile", "12.pile"));
        assert!(!wildcard_match("*.pile", "12.txt"));
        assert!(wildcard_match("1?.pile", "12.pile"));
    }
}
