// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Resumable download sidecars (`<store-id>.dig.part`).
//!
//! Layout: the first `total_size` bytes are the payload area, written in
//! place as chunks arrive. A manifest trailer follows:
//! `manifest_json || manifest_len(u32 LE) || MAGIC(8)`. Finalizing truncates
//! the trailer away and renames `*.part` to `*.dig`, so the committed file
//! is exactly the payload and the rename is the atomic commit point.

use crate::core::types::StoreId;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const PART_MAGIC: &[u8; 8] = b"DIGPART1";
const TRAILER_FIXED: u64 = 4 + 8; // len field + magic

/// Chunk size used by the parallel download path.
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Sidecar errors.
#[derive(Debug, Error)]
pub enum PartError {
    /// Filesystem failure.
    #[error("part io: {0}")]
    Io(String),
    /// Trailer missing or inconsistent with the requested download.
    #[error("part manifest mismatch")]
    Mismatch,
    /// Chunk write outside the payload area.
    #[error("chunk out of range")]
    OutOfRange,
}

impl From<std::io::Error> for PartError {
    fn from(e: std::io::Error) -> Self {
        PartError::Io(e.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PartManifest {
    store_id: StoreId,
    total_size: u64,
    chunk_size: u64,
    received: Vec<u32>,
}

/// Number of chunks a download of `total_size` splits into.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u32 {
    if total_size == 0 {
        return 0;
    }
    (total_size.div_ceil(chunk_size)) as u32
}

/// Inclusive byte bounds of chunk `index`.
pub fn chunk_bounds(index: u32, total_size: u64, chunk_size: u64) -> Option<(u64, u64)> {
    let start = u64::from(index) * chunk_size;
    if start >= total_size {
        return None;
    }
    let end = (start + chunk_size - 1).min(total_size - 1);
    Some((start, end))
}

/// An in-flight download persisted to a `.part` sidecar.
pub struct PartialDownload {
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    manifest: PartManifest,
}

impl PartialDownload {
    /// Open or create the sidecar for `store_id` under `home`. When an
    /// existing sidecar matches `total_size`/`chunk_size` its acknowledged
    /// chunks are resumed; a mismatched sidecar is discarded and restarted.
    pub async fn create_or_resume(
        home: &std::path::Path,
        store_id: StoreId,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self, PartError> {
        let part_path = home.join(store_id.part_file_name());
        let final_path = home.join(store_id.file_name());

        if part_path.is_file() {
            match Self::resume(&part_path, &final_path, &store_id, total_size, chunk_size).await {
                Ok(existing) => return Ok(existing),
                Err(e) => {
                    tracing::debug!(store = %store_id, err = %e, "discarding stale .part");
                    let _ = tokio::fs::remove_file(&part_path).await;
                }
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .await?;
        file.set_len(total_size).await?;

        let manifest = PartManifest { store_id, total_size, chunk_size, received: Vec::new() };
        let mut this = Self { part_path, final_path, file, manifest };
        this.write_trailer().await?;
        Ok(this)
    }

    async fn resume(
        part_path: &std::path::Path,
        final_path: &std::path::Path,
        store_id: &StoreId,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self, PartError> {
        let mut file = OpenOptions::new().read(true).write(true).open(part_path).await?;
        let len = file.metadata().await?.len();
        if len < total_size + TRAILER_FIXED {
            return Err(PartError::Mismatch);
        }

        let mut tail = [0u8; (TRAILER_FIXED) as usize];
        file.seek(SeekFrom::End(-(TRAILER_FIXED as i64))).await?;
        file.read_exact(&mut tail).await?;
        if &tail[4..] != PART_MAGIC {
            return Err(PartError::Mismatch);
        }
        let manifest_len = u32::from_le_bytes(tail[..4].try_into().expect("fixed slice")) as u64;
        if total_size + manifest_len + TRAILER_FIXED != len {
            return Err(PartError::Mismatch);
        }

        let mut manifest_bytes = vec![0u8; manifest_len as usize];
        file.seek(SeekFrom::Start(total_size)).await?;
        file.read_exact(&mut manifest_bytes).await?;
        let manifest: PartManifest =
            serde_json::from_slice(&manifest_bytes).map_err(|_| PartError::Mismatch)?;

        if manifest.store_id != *store_id
            || manifest.total_size != total_size
            || manifest.chunk_size != chunk_size
        {
            return Err(PartError::Mismatch);
        }

        Ok(Self {
            part_path: part_path.to_path_buf(),
            final_path: final_path.to_path_buf(),
            file,
            manifest,
        })
    }

    /// Chunk indices not yet acknowledged, in order.
    pub fn missing_chunks(&self) -> Vec<u32> {
        let total = chunk_count(self.manifest.total_size, self.manifest.chunk_size);
        (0..total)
            .filter(|i| !self.manifest.received.contains(i))
            .collect()
    }

    /// Number of acknowledged chunks.
    pub fn received_count(&self) -> usize {
        self.manifest.received.len()
    }

    /// True when every chunk is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.missing_chunks().is_empty()
    }

    /// Total payload size.
    pub fn total_size(&self) -> u64 {
        self.manifest.total_size
    }

    /// Write one chunk's bytes and acknowledge it in the manifest.
    pub async fn write_chunk(&mut self, index: u32, bytes: &[u8]) -> Result<(), PartError> {
        let (start, end) =
            chunk_bounds(index, self.manifest.total_size, self.manifest.chunk_size)
                .ok_or(PartError::OutOfRange)?;
        if bytes.len() as u64 != end - start + 1 {
            return Err(PartError::OutOfRange);
        }

        self.file.seek(SeekFrom::Start(start)).await?;
        self.file.write_all(bytes).await?;

        if !self.manifest.received.contains(&index) {
            self.manifest.received.push(index);
            self.manifest.received.sort_unstable();
        }
        self.write_trailer().await
    }

    async fn write_trailer(&mut self) -> Result<(), PartError> {
        let manifest_bytes =
            serde_json::to_vec(&self.manifest).map_err(|e| PartError::Io(e.to_string()))?;
        self.file.seek(SeekFrom::Start(self.manifest.total_size)).await?;
        self.file.write_all(&manifest_bytes).await?;
        self.file.write_all(&(manifest_bytes.len() as u32).to_le_bytes()).await?;
        self.file.write_all(PART_MAGIC).await?;
        self.file
            .set_len(self.manifest.total_size + manifest_bytes.len() as u64 + TRAILER_FIXED)
            .await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Read back the full payload area (for hashing before commit).
    pub async fn read_payload(&mut self) -> Result<Vec<u8>, PartError> {
        let mut buf = vec![0u8; self.manifest.total_size as usize];
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Truncate the trailer and atomically rename `*.part` to `*.dig`.
    pub async fn commit(mut self) -> Result<PathBuf, PartError> {
        if !self.is_complete() {
            return Err(PartError::Mismatch);
        }
        self.file.set_len(self.manifest.total_size).await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        Ok(self.final_path)
    }

    /// Delete the sidecar (integrity failure or abandoned download).
    pub async fn discard(self) -> Result<(), PartError> {
        drop(self.file);
        tokio::fs::remove_file(&self.part_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> StoreId {
        StoreId::new(&"ab".repeat(24)).unwrap()
    }

    #[test]
    fn chunk_maths() {
        // 1 MiB + 1 byte at 256 KiB: four full chunks and a single byte.
        let total = 1_048_577u64;
        assert_eq!(chunk_count(total, CHUNK_SIZE), 5);
        assert_eq!(chunk_bounds(0, total, CHUNK_SIZE), Some((0, 262_143)));
        assert_eq!(chunk_bounds(3, total, CHUNK_SIZE), Some((786_432, 1_048_575)));
        assert_eq!(chunk_bounds(4, total, CHUNK_SIZE), Some((1_048_576, 1_048_576)));
        assert_eq!(chunk_bounds(5, total, CHUNK_SIZE), None);
    }

    #[tokio::test]
    async fn resume_reports_missing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let total = CHUNK_SIZE * 2 + 10;

        let mut part =
            PartialDownload::create_or_resume(dir.path(), id(), total, CHUNK_SIZE).await.unwrap();
        assert_eq!(part.missing_chunks(), vec![0, 1, 2]);
        part.write_chunk(1, &vec![7u8; CHUNK_SIZE as usize]).await.unwrap();
        drop(part);

        let part =
            PartialDownload::create_or_resume(dir.path(), id(), total, CHUNK_SIZE).await.unwrap();
        assert_eq!(part.missing_chunks(), vec![0, 2]);
    }

    #[tokio::test]
    async fn commit_truncates_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let total = 12u64;

        let mut part =
            PartialDownload::create_or_resume(dir.path(), id(), total, CHUNK_SIZE).await.unwrap();
        part.write_chunk(0, b"hello world!").await.unwrap();
        assert!(part.is_complete());
        let final_path = part.commit().await.unwrap();

        let bytes = std::fs::read(&final_path).unwrap();
        assert_eq!(bytes, b"hello world!");
        assert!(!dir.path().join(id().part_file_name()).exists());
    }
}
