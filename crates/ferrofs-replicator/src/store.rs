//! Chunk store facade: staging-file allocation, checksum-aligned appends,
//! version finalize, and release.
//!
//! The replicator never sees the on-disk layout. It allocates an incomplete
//! chunk at version 0, appends in checksum-block-aligned writes, finalizes
//! the file at the chosen version, and releases the handle with a final
//! status on every exit path. A staging file still at version 0 after a
//! crash marks the chunk for deletion on restart.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::checksum::{block_count, first_mismatch, CHECKSUM_BLOCK_SIZE};
use crate::error::{ReplicationError, ReplicationResult};
use crate::op::{ChunkId, ChunkVersion, FileId};

/// Opaque handle to a staging file.
pub type FileHandle = u64;

/// Parameters for allocating a staging chunk.
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    /// Owning file.
    pub file_id: FileId,
    /// Chunk being replicated.
    pub chunk_id: ChunkId,
    /// On-disk version of the staging file; always 0 during replication.
    pub version: ChunkVersion,
    /// Minimum storage tier for placement.
    pub min_storage_tier: u8,
    /// Version the chunk will be finalized at.
    pub target_version: ChunkVersion,
    /// Marks the chunk as not yet part of the readable table.
    pub being_replicated: bool,
    /// Require the chunk to already exist.
    pub must_exist: bool,
}

/// Local chunk store operations used by the replicator.
pub trait ChunkStore: Send + Sync {
    /// Allocates a new incomplete chunk.
    ///
    /// Fails with [`ReplicationError::AlreadyExists`] when a readable chunk
    /// at the target version is already present.
    fn allocate(&self, req: &AllocateRequest) -> ReplicationResult<FileHandle>;

    /// Appends `data` at `offset`.
    ///
    /// The offset must be a multiple of the checksum block size and equal to
    /// the bytes staged so far; `checksums`, when supplied, carries one
    /// digest per covered block. Returns the bytes written.
    fn write(
        &self,
        handle: FileHandle,
        offset: i64,
        data: &[u8],
        checksums: Option<&[u32]>,
    ) -> ReplicationResult<usize>;

    /// Atomically records the final version, making the chunk readable once
    /// released with a non-negative status.
    fn finalize(
        &self,
        handle: FileHandle,
        version: ChunkVersion,
        stable: bool,
    ) -> ReplicationResult<()>;

    /// Returns the handle; a negative status discards the staging file.
    fn release(&self, handle: FileHandle, status: i32);
}

/// One write accepted by the store, for order and size assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Chunk written to.
    pub chunk_id: ChunkId,
    /// Offset of the write.
    pub offset: i64,
    /// Length of the write.
    pub len: usize,
    /// Whether per-block checksums accompanied the write.
    pub with_checksums: bool,
}

#[derive(Debug)]
struct Staging {
    file_id: FileId,
    chunk_id: ChunkId,
    version: ChunkVersion,
    target_version: ChunkVersion,
    data: Vec<u8>,
    stable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredChunk {
    version: ChunkVersion,
    data: Vec<u8>,
}

#[derive(Default)]
struct StoreState {
    chunks: HashMap<ChunkId, StoredChunk>,
    staging: HashMap<FileHandle, Staging>,
    next_handle: FileHandle,
    write_log: Vec<WriteRecord>,
}

/// In-memory [`ChunkStore`] used by the test harness and by local tooling.
#[derive(Default)]
pub struct InMemoryChunkStore {
    state: Mutex<StoreState>,
}

impl InMemoryChunkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a readable chunk, as a prior replication would have.
    pub fn insert_chunk(&self, chunk_id: ChunkId, version: ChunkVersion, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.chunks.insert(chunk_id, StoredChunk { version, data });
    }

    /// The readable chunk's version and contents, if present.
    pub fn chunk(&self, chunk_id: ChunkId) -> Option<(ChunkVersion, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        state
            .chunks
            .get(&chunk_id)
            .map(|c| (c.version, c.data.clone()))
    }

    /// Number of live staging files.
    pub fn staging_count(&self) -> usize {
        self.state.lock().unwrap().staging.len()
    }

    /// Every write accepted so far, in acceptance order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().write_log.clone()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn allocate(&self, req: &AllocateRequest) -> ReplicationResult<FileHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.chunks.get(&req.chunk_id) {
            if existing.version == req.target_version {
                return Err(ReplicationError::AlreadyExists {
                    chunk_id: req.chunk_id,
                    version: req.target_version,
                });
            }
        }
        if req.must_exist && !state.chunks.contains_key(&req.chunk_id) {
            return Err(ReplicationError::NotFound {
                chunk_id: req.chunk_id,
            });
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.staging.insert(
            handle,
            Staging {
                file_id: req.file_id,
                chunk_id: req.chunk_id,
                version: req.version,
                target_version: req.target_version,
                data: Vec::new(),
                stable: false,
            },
        );
        debug!(
            chunk = req.chunk_id,
            file = req.file_id,
            target_version = req.target_version,
            handle,
            "allocated staging chunk"
        );
        Ok(handle)
    }

    fn write(
        &self,
        handle: FileHandle,
        offset: i64,
        data: &[u8],
        checksums: Option<&[u32]>,
    ) -> ReplicationResult<usize> {
        let mut state = self.state.lock().unwrap();
        let staging = state
            .staging
            .get_mut(&handle)
            .ok_or_else(|| ReplicationError::Io {
                reason: format!("write on released handle {handle}"),
            })?;
        if offset < 0 || offset % CHECKSUM_BLOCK_SIZE as i64 != 0 {
            return Err(ReplicationError::Invalid {
                reason: format!("write offset {offset} not checksum block aligned"),
            });
        }
        if offset as usize != staging.data.len() {
            return Err(ReplicationError::Invalid {
                reason: format!(
                    "non-contiguous write at {offset}, staged {}",
                    staging.data.len()
                ),
            });
        }
        if let Some(sums) = checksums {
            if sums.len() != block_count(data.len()) {
                return Err(ReplicationError::Invalid {
                    reason: format!(
                        "checksum count {} for {} bytes",
                        sums.len(),
                        data.len()
                    ),
                });
            }
            if let Some(idx) = first_mismatch(data, sums) {
                return Err(ReplicationError::BadChecksum {
                    offset: offset + (idx * CHECKSUM_BLOCK_SIZE) as i64,
                    expected: sums[idx],
                    actual: crate::checksum::compute_block_checksums(data)[idx],
                });
            }
        }
        staging.data.extend_from_slice(data);
        let chunk_id = staging.chunk_id;
        state.write_log.push(WriteRecord {
            chunk_id,
            offset,
            len: data.len(),
            with_checksums: checksums.is_some(),
        });
        Ok(data.len())
    }

    fn finalize(
        &self,
        handle: FileHandle,
        version: ChunkVersion,
        stable: bool,
    ) -> ReplicationResult<()> {
        let mut state = self.state.lock().unwrap();
        let staging = state
            .staging
            .get_mut(&handle)
            .ok_or_else(|| ReplicationError::Io {
                reason: format!("finalize on released handle {handle}"),
            })?;
        staging.version = version;
        staging.stable = stable;
        debug!(
            chunk = staging.chunk_id,
            version, stable, "finalized staging chunk"
        );
        Ok(())
    }

    fn release(&self, handle: FileHandle, status: i32) {
        let mut state = self.state.lock().unwrap();
        let Some(staging) = state.staging.remove(&handle) else {
            return;
        };
        if status >= 0 && staging.stable && staging.version != 0 {
            debug!(
                chunk = staging.chunk_id,
                version = staging.version,
                size = staging.data.len(),
                "staging chunk promoted"
            );
            state.chunks.insert(
                staging.chunk_id,
                StoredChunk {
                    version: staging.version,
                    data: staging.data,
                },
            );
        } else {
            debug!(
                chunk = staging.chunk_id,
                file = staging.file_id,
                status, "staging chunk discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_block_checksums;

    fn alloc_req(chunk_id: ChunkId, target_version: ChunkVersion) -> AllocateRequest {
        AllocateRequest {
            file_id: 1,
            chunk_id,
            version: 0,
            min_storage_tier: 0,
            target_version,
            being_replicated: true,
            must_exist: false,
        }
    }

    #[test]
    fn test_allocate_write_finalize_release() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(5, 3)).unwrap();
        let data = vec![9u8; CHECKSUM_BLOCK_SIZE];
        let sums = compute_block_checksums(&data);
        assert_eq!(store.write(h, 0, &data, Some(&sums)).unwrap(), data.len());
        store.finalize(h, 3, true).unwrap();
        store.release(h, 0);
        let (version, stored) = store.chunk(5).unwrap();
        assert_eq!(version, 3);
        assert_eq!(stored, data);
        assert_eq!(store.staging_count(), 0);
    }

    #[test]
    fn test_allocate_conflict_with_readable_chunk() {
        let store = InMemoryChunkStore::new();
        store.insert_chunk(5, 3, vec![1, 2, 3]);
        let err = store.allocate(&alloc_req(5, 3)).unwrap_err();
        assert!(matches!(err, ReplicationError::AlreadyExists { .. }));
        // A different target version is fine.
        assert!(store.allocate(&alloc_req(5, 4)).is_ok());
    }

    #[test]
    fn test_release_negative_status_discards() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(7, 2)).unwrap();
        store.write(h, 0, &[1u8; 100], None).unwrap();
        store.release(h, -125);
        assert!(store.chunk(7).is_none());
        assert_eq!(store.staging_count(), 0);
    }

    #[test]
    fn test_release_without_finalize_discards() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(7, 2)).unwrap();
        store.write(h, 0, &[1u8; 100], None).unwrap();
        // Status zero but never finalized: still version 0, a dirty chunk.
        store.release(h, 0);
        assert!(store.chunk(7).is_none());
    }

    #[test]
    fn test_write_rejects_misaligned_offset() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(1, 1)).unwrap();
        let err = store.write(h, 17, &[0u8; 4], None).unwrap_err();
        assert!(matches!(err, ReplicationError::Invalid { .. }));
    }

    #[test]
    fn test_write_rejects_gap() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(1, 1)).unwrap();
        let err = store
            .write(h, CHECKSUM_BLOCK_SIZE as i64, &[0u8; 4], None)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Invalid { .. }));
    }

    #[test]
    fn test_write_rejects_wrong_checksum_count() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(1, 1)).unwrap();
        let data = vec![0u8; 2 * CHECKSUM_BLOCK_SIZE];
        let err = store.write(h, 0, &data, Some(&[1])).unwrap_err();
        assert!(matches!(err, ReplicationError::Invalid { .. }));
    }

    #[test]
    fn test_write_detects_checksum_mismatch() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(1, 1)).unwrap();
        let data = vec![0u8; CHECKSUM_BLOCK_SIZE];
        let err = store.write(h, 0, &data, Some(&[0xDEAD])).unwrap_err();
        assert!(matches!(err, ReplicationError::BadChecksum { .. }));
    }

    #[test]
    fn test_write_log_records_order() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(9, 1)).unwrap();
        store
            .write(h, 0, &[0u8; CHECKSUM_BLOCK_SIZE], None)
            .unwrap();
        store
            .write(h, CHECKSUM_BLOCK_SIZE as i64, &[0u8; 10], None)
            .unwrap();
        let log = store.write_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].offset, 0);
        assert_eq!(log[1].offset, CHECKSUM_BLOCK_SIZE as i64);
        assert_eq!(log[1].len, 10);
    }

    #[test]
    fn test_write_after_release_fails() {
        let store = InMemoryChunkStore::new();
        let h = store.allocate(&alloc_req(9, 1)).unwrap();
        store.release(h, -1);
        let err = store.write(h, 0, &[0u8; 4], None).unwrap_err();
        assert!(matches!(err, ReplicationError::Io { .. }));
    }

    #[test]
    fn test_must_exist() {
        let store = InMemoryChunkStore::new();
        let mut req = alloc_req(11, 1);
        req.must_exist = true;
        let err = store.allocate(&req).unwrap_err();
        assert!(matches!(err, ReplicationError::NotFound { .. }));
    }
}
