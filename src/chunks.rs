//! On-disk layout for transient chunks and merged uploads.
//!
//! ```text
//! <chunk_dir>/<task_id>/<index>.chunk     written by the chunk receiver
//! <upload_dir>/<task_id>.<ext>            written by the merge stage
//! ```
//!
//! Chunk writes go to a temp file that is renamed into place, so a failed
//! write never leaves a partial chunk behind. The merged path is derived
//! from the task id, so re-running a merge overwrites instead of
//! accumulating copies.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use resource_share_core::classify::normalized_extension;
use resource_share_core::models::UploadTask;

/// Outcome of streaming one chunk to disk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkWrite {
    Written(u64),
    /// The payload exceeded the limit; nothing was kept.
    TooLarge,
}

#[derive(Debug, Clone)]
pub struct ChunkStorage {
    chunk_root: PathBuf,
    upload_root: PathBuf,
}

impl ChunkStorage {
    pub fn new(chunk_root: impl Into<PathBuf>, upload_root: impl Into<PathBuf>) -> Self {
        Self {
            chunk_root: chunk_root.into(),
            upload_root: upload_root.into(),
        }
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.chunk_root).await?;
        fs::create_dir_all(&self.upload_root).await
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.chunk_root.join(task_id)
    }

    pub fn chunk_path(&self, task_id: &str, index: u32) -> PathBuf {
        self.task_dir(task_id).join(format!("{}.chunk", index))
    }

    /// Permanent location of the merged file for `task`.
    pub fn merged_path(&self, task: &UploadTask) -> PathBuf {
        match normalized_extension(&task.file_name) {
            Some(ext) => self.upload_root.join(format!("{}.{}", task.id, ext)),
            None => self.upload_root.join(&task.id),
        }
    }

    /// Streams `reader` into the chunk file, accepting at most `limit` bytes.
    pub async fn write_chunk<R>(
        &self,
        task_id: &str,
        index: u32,
        reader: R,
        limit: u64,
    ) -> io::Result<ChunkWrite>
    where
        R: AsyncRead + Unpin,
    {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(task_id, index);
        let temp_path = dir.join(format!(".{}.tmp.{}", index, Uuid::new_v4()));

        let result = copy_limited(reader, &temp_path, limit).await;
        match result {
            Ok(Some(written)) => {
                if let Err(e) = fs::rename(&temp_path, &final_path).await {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e);
                }
                Ok(ChunkWrite::Written(written))
            }
            Ok(None) => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ChunkWrite::TooLarge)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    /// Concatenates chunks `0..total` in index order into `dest`.
    /// Returns the number of bytes written.
    pub async fn merge_chunks(&self, task_id: &str, total: u32, dest: &Path) -> io::Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(dest).await?;
        let mut out = BufWriter::new(file);
        let mut written = 0u64;

        for index in 0..total {
            let path = self.chunk_path(task_id, index);
            let mut chunk = fs::File::open(&path).await.map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("cannot open chunk {} ({}): {}", index, path.display(), e),
                )
            })?;
            written += tokio::io::copy(&mut chunk, &mut out).await?;
        }

        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(written)
    }

    /// Removes the task's chunk directory. A missing directory is fine.
    pub async fn remove_task_dir(&self, task_id: &str) -> io::Result<()> {
        ignore_not_found(fs::remove_dir_all(self.task_dir(task_id)).await)
    }
}

/// Removes a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    ignore_not_found(fs::remove_file(path).await)
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copies into `path`; `Ok(None)` when the input is longer than `limit`.
async fn copy_limited<R>(reader: R, path: &Path, limit: u64) -> io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let file = fs::File::create(path).await?;
    let mut out = BufWriter::new(file);
    let mut limited = reader.take(limit.saturating_add(1));
    let written = tokio::io::copy(&mut limited, &mut out).await?;
    if written > limit {
        return Ok(None);
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok(Some(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> ChunkStorage {
        ChunkStorage::new(tmp.path().join("chunks"), tmp.path().join("uploads"))
    }

    #[tokio::test]
    async fn write_then_merge_in_index_order() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.write_chunk("t1", 1, &b"world"[..], 5).await.unwrap();
        s.write_chunk("t1", 0, &b"hello "[..], 6).await.unwrap();

        let dest = tmp.path().join("uploads").join("t1.txt");
        let n = s.merge_chunks("t1", 2, &dest).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn oversized_chunk_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let outcome = s.write_chunk("t1", 0, &b"0123456789"[..], 4).await.unwrap();
        assert_eq!(outcome, ChunkWrite::TooLarge);
        let leftovers: Vec<_> = std::fs::read_dir(s.task_dir("t1")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn merge_fails_on_missing_chunk() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        let dest = tmp.path().join("uploads").join("t2.bin");
        let err = s.merge_chunks("t2", 1, &dest).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("cannot open chunk 0"));
    }

    #[tokio::test]
    async fn remove_task_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let s = storage(&tmp);
        s.write_chunk("t3", 0, &b"x"[..], 1).await.unwrap();
        s.remove_task_dir("t3").await.unwrap();
        assert!(!s.task_dir("t3").exists());
        s.remove_task_dir("t3").await.unwrap();
    }

    #[test]
    fn merged_path_uses_task_id_and_safe_extension() {
        let s = ChunkStorage::new("/c", "/u");
        let mut task = UploadTask::new(1, "Photo.PNG", 10, None, 0).unwrap();
        assert_eq!(
            s.merged_path(&task),
            PathBuf::from("/u").join(format!("{}.png", task.id))
        );
        task.file_name = "../../etc/passwd".to_string();
        assert_eq!(s.merged_path(&task), PathBuf::from("/u").join(&task.id));
    }
}
