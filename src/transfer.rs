//! File transfer engine (C3, spec §4.3).
//!
//! Sender pipeline: stream-hash a source file into the managed attachments
//! directory, then lazily produce `(fileId, index, total, dataBase64)`
//! chunks. Receiver pipeline: an arena of in-flight [`IncomingTransfer`]s
//! keyed by `fileId`, each holding its own write stream and running hash so
//! memory use is bounded by `CHUNK_SIZE`, not file size — the same
//! streaming discipline the teacher applies to its file table, generalized
//! from BLOB-in-SQLite to streaming-to-disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{TransferError, ValidationError};

pub const MAX_FILE_SIZE: u64 = 200 * 1024 * 1024;
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Replace forbidden characters and control bytes, trim, and fall back to
/// `arquivo` when nothing is left (§4.3 sanitization rule).
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if "<>:\"/\\|?*".contains(c) || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "arquivo".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn attachment_path(root: &Path, message_id: &str, file_name: &str) -> PathBuf {
    root.join(format!("{message_id}_{}", sanitize_file_name(file_name)))
}

pub fn chunk_count(size: u64) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(CHUNK_SIZE as u64)
    }
}

/// Copies `source` into the managed attachments directory and computes its
/// SHA-256 and size by streaming, never holding the whole file in memory.
pub async fn prepare_outgoing_file(
    source: &Path,
    attachments_root: &Path,
    message_id: &str,
    file_name: &str,
) -> Result<(PathBuf, String, u64), TransferError> {
    tokio::fs::create_dir_all(attachments_root).await?;
    let dest = attachment_path(attachments_root, message_id, file_name);

    let metadata = tokio::fs::metadata(source).await?;
    if metadata.len() > MAX_FILE_SIZE {
        return Err(ValidationError::FileTooLarge {
            max: MAX_FILE_SIZE,
            actual: metadata.len(),
        }
        .into());
    }

    let mut reader = File::open(source).await?;
    let mut writer = File::create(&dest).await?;
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    Ok((dest, hex::encode(hasher.finalize()), total))
}

/// Produces the ordered chunk sequence for an already-hashed file on disk,
/// optionally resuming from `start_index` (§4.3 "the sender may start at
/// `index=N` to resume").
pub struct ChunkReader {
    file: File,
    total: u64,
    size: u64,
}

impl ChunkReader {
    pub async fn open(path: &Path, start_index: u64) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        let total = chunk_count(size);
        let mut file = File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(start_index * CHUNK_SIZE as u64))
            .await?;
        Ok(Self { file, total, size })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the next `(index, dataBase64)` pair, or `None` once every
    /// chunk has been emitted. An empty file still emits one zero-length
    /// chunk (§4.3).
    pub async fn next_chunk(&mut self, index: u64) -> Result<Option<(u64, String)>, TransferError> {
        if index >= self.total {
            return Ok(None);
        }
        let remaining_in_file = self.size.saturating_sub(index * CHUNK_SIZE as u64);
        let want = (CHUNK_SIZE as u64).min(remaining_in_file) as usize;
        let mut buf = vec![0u8; want];
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Some((index, BASE64.encode(&buf))))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Delivered { path: PathBuf },
    Failed,
}

/// One in-flight inbound transfer, keyed by `fileId` in the receiver's
/// arena (§9 "explicit arena of transfers indexed by fileId").
pub struct IncomingTransfer {
    pub file_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub total: u64,
    pub expected_sha256: String,
    pub expected_size: u64,
    pub path: PathBuf,
    file: File,
    hasher: Sha256,
    transferred_bytes: u64,
    received_chunks: u64,
    seen_indices: std::collections::HashSet<u64>,
}

impl IncomingTransfer {
    pub async fn open(
        attachments_root: &Path,
        message_id: &str,
        sender_device_id: &str,
        file_id: &str,
        file_name: &str,
        total: u64,
        expected_sha256: &str,
        expected_size: u64,
    ) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(attachments_root).await?;
        let path = attachment_path(attachments_root, message_id, file_name);
        let file = File::create(&path).await?;
        Ok(Self {
            file_id: file_id.to_string(),
            message_id: message_id.to_string(),
            sender_device_id: sender_device_id.to_string(),
            total,
            expected_sha256: expected_sha256.to_string(),
            expected_size,
            path,
            file,
            hasher: Sha256::new(),
            transferred_bytes: 0,
            received_chunks: 0,
            seen_indices: std::collections::HashSet::new(),
        })
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    /// Validates `0 <= index < total`, discards duplicates, appends to the
    /// write stream, and updates the running hash (§4.3 step 2).
    pub async fn accept_chunk(
        &mut self,
        index: u64,
        total: u64,
        data_base64: &str,
    ) -> Result<(), TransferError> {
        if total != self.total {
            return Err(ValidationError::ChunkTotalMismatch {
                expected: self.total,
                actual: total,
            }
            .into());
        }
        if index >= total {
            return Err(ValidationError::InvalidChunkIndex { index, total }.into());
        }
        if !self.seen_indices.insert(index) {
            return Ok(());
        }
        let bytes = BASE64
            .decode(data_base64)
            .map_err(|_| ValidationError::InvalidPath("invalid base64 chunk".to_string()))?;
        self.hasher.update(&bytes);
        self.file.write_all(&bytes).await?;
        self.transferred_bytes += bytes.len() as u64;
        self.received_chunks += 1;
        Ok(())
    }

    /// `file:complete` (§4.3 step 3): verifies hash, byte count, and chunk
    /// count all agree; on failure unlinks the partial file.
    pub async fn finalize(mut self) -> Result<TransferOutcome, TransferError> {
        self.file.flush().await?;
        drop(self.file);

        let hash = hex::encode(self.hasher.finalize());
        let ok = hash == self.expected_sha256
            && self.received_chunks == self.total
            && self.transferred_bytes == self.expected_size;

        if ok {
            Ok(TransferOutcome::Delivered { path: self.path })
        } else {
            tokio::fs::remove_file(&self.path).await.ok();
            Ok(TransferOutcome::Failed)
        }
    }

    pub async fn abort(self) {
        drop(self.file);
        tokio::fs::remove_file(&self.path).await.ok();
    }
}

/// Arena of in-flight inbound transfers (§9). Not `Send`-shared: owned by
/// whichever single task runs the receiver pipeline (§5).
#[derive(Default)]
pub struct TransferArena {
    inflight: HashMap<String, IncomingTransfer>,
}

impl TransferArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, file_id: &str) -> Option<&mut IncomingTransfer> {
        self.inflight.get_mut(file_id)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.inflight.contains_key(file_id)
    }

    pub fn insert(&mut self, transfer: IncomingTransfer) {
        self.inflight.insert(transfer.file_id.clone(), transfer);
    }

    pub async fn remove_and_abort(&mut self, file_id: &str) {
        if let Some(transfer) = self.inflight.remove(file_id) {
            transfer.abort().await;
        }
    }

    pub fn remove(&mut self, file_id: &str) -> Option<IncomingTransfer> {
        self.inflight.remove(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f"), "a_b_c_d_e_f");
    }

    #[test]
    fn sanitize_empty_falls_back_to_arquivo() {
        assert_eq!(sanitize_file_name("   "), "arquivo");
        assert_eq!(sanitize_file_name(""), "arquivo");
    }

    #[test]
    fn chunk_count_rounds_up_and_handles_empty() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
    }

    #[tokio::test]
    async fn file_round_trips_through_offer_chunks_complete() {
        let dir = std::env::temp_dir().join(format!("lantern_xfer_test_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let source = dir.join("source.bin");
        let payload = vec![7u8; CHUNK_SIZE * 2 + 123];
        tokio::fs::write(&source, &payload).await.unwrap();

        let attachments = dir.join("attachments");
        let (path, sha, size) =
            prepare_outgoing_file(&source, &attachments, "msg1", "pic.png").await.unwrap();
        assert_eq!(size, payload.len() as u64);

        let mut reader = ChunkReader::open(&path, 0).await.unwrap();
        let total = reader.total();

        let mut incoming = IncomingTransfer::open(
            &dir.join("inbox"),
            "msg1",
            "alice",
            "file1",
            "pic.png",
            total,
            &sha,
            size,
        )
        .await
        .unwrap();

        let mut index = 0;
        while let Some((idx, data)) = reader.next_chunk(index).await.unwrap() {
            incoming.accept_chunk(idx, total, &data).await.unwrap();
            index += 1;
        }

        let outcome = incoming.finalize().await.unwrap();
        match outcome {
            TransferOutcome::Delivered { path } => {
                let bytes = tokio::fs::read(&path).await.unwrap();
                assert_eq!(bytes, payload);
            }
            TransferOutcome::Failed => panic!("expected delivered"),
        }
    }

    #[tokio::test]
    async fn hash_mismatch_on_finalize_removes_partial_file() {
        let dir = std::env::temp_dir().join(format!("lantern_xfer_fail_{}", uuid::Uuid::new_v4()));
        let mut incoming = IncomingTransfer::open(&dir, "msg2", "alice", "file2", "a.bin", 1, "deadbeef", 5)
            .await
            .unwrap();
        incoming.accept_chunk(0, 1, &BASE64.encode(b"hello")).await.unwrap();
        let path = incoming.path.clone();
        let outcome = incoming.finalize().await.unwrap();
        assert_eq!(outcome, TransferOutcome::Failed);
        assert!(!path.exists());
    }
}
