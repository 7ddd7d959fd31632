//! The replication state machine.
//!
//! Both modes share one lifecycle: reserve buffers, learn the chunk size,
//! allocate a version-0 staging file, stream checksum-aligned writes, then
//! finalize and report. [`ReplicatorCore`] carries the shared state and the
//! terminal path; [`Replicator`] drives it against a source peer for direct
//! replication. Locks are never held across collaborator calls, so a
//! cancellation arriving from inside a completion cannot deadlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::admission::{AdmissionClient, AdmissionOutcome, BufferAdmission, GrantCallback};
use crate::checksum::{block_count, CHECKSUM_BLOCK_SIZE};
use crate::config::{CHUNK_SIZE, DEFAULT_READ_SIZE, MIN_ADMISSION_BYTES};
use crate::counters::ReplicatorCounters;
use crate::error::{ReplicationError, ReplicationResult};
use crate::op::{ChunkId, ChunkVersion, FileId, ReplicateChunkOp, ResponseSink};
use crate::peer::{PeerReadReply, PeerReader};
use crate::registry::{CancelTarget, Registration, ReplicatorRegistry};
use crate::store::{AllocateRequest, ChunkStore, FileHandle};

/// How the chunk is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Byte copy from a source peer.
    Direct,
    /// Reconstruction through the striped reader.
    Recovery,
}

/// Collaborators shared by every replicator in the process.
pub struct ReplicationContext {
    /// Local chunk store.
    pub store: Arc<dyn ChunkStore>,
    /// Buffer admission service.
    pub admission: Arc<dyn BufferAdmission>,
    /// In-flight replication index.
    pub registry: Arc<ReplicatorRegistry>,
    /// Process-wide counters.
    pub counters: Arc<ReplicatorCounters>,
    /// Completion sink towards the metadata server.
    pub sink: Arc<dyn ResponseSink>,
}

pub(crate) struct CoreState {
    op: Option<ReplicateChunkOp>,
    chunk_version: ChunkVersion,
    chunk_size: i64,
    offset: i64,
    done: bool,
    completed: bool,
    file_handle: Option<FileHandle>,
    waiting_for_buffers: bool,
    registration: Option<Registration>,
    admission_client: Option<AdmissionClient>,
    admitted_bytes: u64,
}

/// State and terminal path shared by both modes.
pub(crate) struct ReplicatorCore {
    ctx: Arc<ReplicationContext>,
    mode: ReplicationMode,
    file_id: FileId,
    chunk_id: ChunkId,
    cancelled: Arc<AtomicBool>,
    state: Mutex<CoreState>,
}

/// Outcome of one streaming step.
enum Step {
    /// Keep streaming.
    Continue,
    /// The replicator reached a terminal state.
    Stop,
}

impl ReplicatorCore {
    pub(crate) fn new(ctx: Arc<ReplicationContext>, mode: ReplicationMode, op: ReplicateChunkOp) -> Self {
        ctx.counters.replicator_created();
        let chunk_version = op.chunk_version;
        Self {
            mode,
            file_id: op.file_id,
            chunk_id: op.chunk_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(CoreState {
                op: Some(op),
                chunk_version,
                chunk_size: 0,
                offset: 0,
                done: false,
                completed: false,
                file_handle: None,
                waiting_for_buffers: false,
                registration: None,
                admission_client: None,
                admitted_bytes: 0,
            }),
            ctx,
        }
    }

    pub(crate) fn ctx(&self) -> &Arc<ReplicationContext> {
        &self.ctx
    }

    pub(crate) fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The version this replication would finalize at.
    pub(crate) fn effective_target_version(&self) -> ChunkVersion {
        let state = self.state.lock().unwrap();
        match state.op.as_ref() {
            Some(op) if op.target_version >= 0 => op.target_version,
            Some(_) => state.chunk_version,
            None => -1,
        }
    }

    /// Inserts this replicator into the registry, pre-empting any previous
    /// one, then re-checks its own cancel flag as required for the
    /// pre-emption race.
    pub(crate) fn register(&self, target: Arc<dyn CancelTarget>) -> bool {
        let registration = self.ctx.registry.register(self.chunk_id, target);
        self.state.lock().unwrap().registration = Some(registration);
        if self.is_cancelled() {
            self.finish(Err(ReplicationError::Cancelled));
            return false;
        }
        true
    }

    /// Reserves `required` bytes, floored at the admission minimum.
    pub(crate) fn admit(&self, required: u64, on_grant: GrantCallback) -> AdmissionOutcome {
        let bytes = required.max(MIN_ADMISSION_BYTES);
        let client = self.ctx.admission.new_client(self.cancelled.clone());
        {
            let mut state = self.state.lock().unwrap();
            state.admission_client = Some(client.clone());
            state.admitted_bytes = bytes;
        }
        if self.ctx.admission.is_over_quota(&client, bytes) {
            error!(
                chunk = self.chunk_id,
                bytes,
                quota = self.ctx.admission.max_client_quota(),
                "replication: buffer reservation over quota"
            );
            self.state.lock().unwrap().admitted_bytes = 0;
            return AdmissionOutcome::OverQuota;
        }
        let outcome = self.ctx.admission.request_for_io(&client, bytes, on_grant);
        match outcome {
            AdmissionOutcome::Granted => {}
            AdmissionOutcome::Queued => {
                info!(
                    chunk = self.chunk_id,
                    bytes, "replication: waiting for buffers"
                );
                self.state.lock().unwrap().waiting_for_buffers = true;
            }
            AdmissionOutcome::OverQuota => {
                self.state.lock().unwrap().admitted_bytes = 0;
            }
        }
        outcome
    }

    /// Marks the queued reservation as granted.
    pub(crate) fn grant_received(&self) {
        self.state.lock().unwrap().waiting_for_buffers = false;
    }

    /// Validates the probed size, records the version, and allocates the
    /// version-0 staging file.
    pub(crate) fn begin_streaming(
        &self,
        chunk_size: i64,
        chunk_version: ChunkVersion,
    ) -> ReplicationResult<()> {
        if !(0..=CHUNK_SIZE).contains(&chunk_size) {
            info!(
                chunk = self.chunk_id,
                chunk_size, "replication: invalid chunk size"
            );
            return Err(ReplicationError::Invalid {
                reason: format!("chunk size {chunk_size} out of range"),
            });
        }
        let (min_storage_tier, target_version) = {
            let mut state = self.state.lock().unwrap();
            state.chunk_size = chunk_size;
            state.chunk_version = chunk_version;
            let op = state.op.as_ref().expect("op taken before streaming");
            let target = if op.target_version >= 0 {
                op.target_version
            } else {
                chunk_version
            };
            (op.min_storage_tier, target)
        };
        let req = AllocateRequest {
            file_id: self.file_id,
            chunk_id: self.chunk_id,
            version: 0,
            min_storage_tier,
            target_version,
            being_replicated: true,
            must_exist: false,
        };
        match self.ctx.store.allocate(&req) {
            Ok(handle) => {
                let mut state = self.state.lock().unwrap();
                state.file_handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                if matches!(err, ReplicationError::AlreadyExists { .. }) {
                    let mut state = self.state.lock().unwrap();
                    if let Some(op) = state.op.as_mut() {
                        op.status_msg =
                            "readable chunk with target version already exists".to_string();
                    }
                }
                Err(err)
            }
        }
    }

    pub(crate) fn position(&self) -> (i64, i64, ChunkVersion) {
        let state = self.state.lock().unwrap();
        (state.offset, state.chunk_size, state.chunk_version)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    /// Records the invalid-stripe report on the op.
    pub(crate) fn set_invalid_stripes(&self, report: String) {
        let mut state = self.state.lock().unwrap();
        if let Some(op) = state.op.as_mut() {
            op.invalid_stripe_idx = report;
        }
    }

    pub(crate) fn set_chunk_size(&self, chunk_size: i64) {
        self.state.lock().unwrap().chunk_size = chunk_size;
    }

    /// Appends one checksum-aligned write and advances the stream position.
    pub(crate) fn write_and_advance(
        &self,
        offset: i64,
        data: &[u8],
        checksums: Option<&[u32]>,
    ) -> ReplicationResult<usize> {
        let handle = self
            .state
            .lock()
            .unwrap()
            .file_handle
            .ok_or(ReplicationError::Cancelled)?;
        let written = self.ctx.store.write(handle, offset, data, checksums)?;
        let mut state = self.state.lock().unwrap();
        state.offset += written as i64;
        Ok(written)
    }

    /// Successful exit: finalize the staging file at the learned version.
    pub(crate) fn terminate_ok(&self) {
        let (handle, version) = {
            let mut state = self.state.lock().unwrap();
            state.done = true;
            (state.file_handle, state.chunk_version)
        };
        let Some(handle) = handle else {
            self.finish(Err(ReplicationError::Io {
                reason: "staging file handle lost before finalize".to_string(),
            }));
            return;
        };
        info!(
            chunk = self.chunk_id,
            version, "replication: finished, finalizing"
        );
        match self.ctx.store.finalize(handle, version, true) {
            Ok(()) => self.finish(Ok(())),
            Err(err) => self.finish(Err(err)),
        }
    }

    /// Terminal path: release resources, mutate the op's result fields,
    /// bump counters, deregister, and submit the response. Idempotent.
    pub(crate) fn finish(&self, result: Result<(), ReplicationError>) {
        let (op, handle, registration, client, admitted, waiting, chunk_version, done) = {
            let mut state = self.state.lock().unwrap();
            if state.completed {
                return;
            }
            state.completed = true;
            (
                state.op.take(),
                state.file_handle.take(),
                state.registration.take(),
                state.admission_client.take(),
                std::mem::take(&mut state.admitted_bytes),
                std::mem::take(&mut state.waiting_for_buffers),
                state.chunk_version,
                state.done,
            )
        };
        let status = match &result {
            Ok(()) => 0,
            Err(err) => err.status_code(),
        };
        if let Some(client) = client.as_ref() {
            if waiting {
                self.ctx.admission.cancel_request(client);
            }
            if admitted > 0 && !waiting {
                self.ctx.admission.release(client, admitted);
            }
        }
        if let Some(handle) = handle {
            self.ctx.store.release(handle, status);
        }
        if let Some(registration) = registration {
            self.ctx.registry.deregister(registration);
        }
        let Some(mut op) = op else {
            self.ctx.counters.replicator_destroyed();
            return;
        };
        match &result {
            Ok(()) => {
                debug_assert!(done, "successful exit before end of chunk");
                op.status = 0;
                op.chunk_version = chunk_version;
                info!(
                    chunk = self.chunk_id,
                    version = chunk_version,
                    "replication: done"
                );
            }
            Err(err) => {
                op.fail(err);
                let cancelled = matches!(err, ReplicationError::Cancelled);
                match (self.mode, cancelled) {
                    (ReplicationMode::Direct, true) => self.ctx.counters.replication_canceled(),
                    (ReplicationMode::Direct, false) => self.ctx.counters.replication_failed(),
                    (ReplicationMode::Recovery, true) => self.ctx.counters.recovery_canceled(),
                    (ReplicationMode::Recovery, false) => self.ctx.counters.recovery_failed(),
                }
                error!(
                    chunk = self.chunk_id,
                    status,
                    cancelled,
                    "replication: {}",
                    if cancelled { "cancelled" } else { "failed" }
                );
            }
        }
        self.ctx.counters.replicator_destroyed();
        self.ctx.sink.submit(op);
    }

    /// Edge-triggered cancel shared by both modes: releases the staging
    /// file immediately and, when parked on the buffer queue, terminates
    /// on the spot. An in-flight completion observes the flag and converts
    /// itself to a cancelled exit.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let (handle, waiting, client) = {
            let mut state = self.state.lock().unwrap();
            if state.completed {
                return;
            }
            (
                state.file_handle.take(),
                state.waiting_for_buffers,
                state.admission_client.clone(),
            )
        };
        if let Some(handle) = handle {
            self.ctx
                .store
                .release(handle, ReplicationError::Cancelled.status_code());
        }
        if waiting {
            if let Some(client) = client.as_ref() {
                self.ctx.admission.cancel_request(client);
            }
            self.finish(Err(ReplicationError::Cancelled));
        }
    }
}

/// Direct replication: stream the chunk from a source peer.
pub struct Replicator {
    core: ReplicatorCore,
    peer: Arc<dyn PeerReader>,
    skip_verify: AtomicBool,
}

impl Replicator {
    /// Creates a replicator for `op` against an established peer session.
    ///
    /// `read_skip_disk_verify` seeds the skip-verify optimization; a
    /// checksum failure clears it for the rest of this replication.
    pub fn new(
        ctx: Arc<ReplicationContext>,
        op: ReplicateChunkOp,
        peer: Arc<dyn PeerReader>,
        read_skip_disk_verify: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ReplicatorCore::new(ctx, ReplicationMode::Direct, op),
            peer,
            skip_verify: AtomicBool::new(read_skip_disk_verify),
        })
    }

    /// Runs the replication to a terminal state, or parks it on the buffer
    /// queue to be resumed by the grant callback.
    pub fn run(self: &Arc<Self>) {
        let target: Arc<dyn CancelTarget> = self.clone();
        if !self.core.register(target) {
            return;
        }
        let this = self.clone();
        let on_grant: GrantCallback = Box::new(move |bytes| this.granted(bytes));
        match self.core.admit(DEFAULT_READ_SIZE as u64, on_grant) {
            AdmissionOutcome::Granted => self.start(),
            AdmissionOutcome::Queued => {}
            AdmissionOutcome::OverQuota => {
                self.core.finish(Err(ReplicationError::OutOfMemory {
                    requested: DEFAULT_READ_SIZE as u64,
                    quota: self.core.ctx().admission.max_client_quota(),
                }));
            }
        }
    }

    fn granted(self: &Arc<Self>, bytes: u64) {
        info!(
            chunk = self.core.chunk_id(),
            peer = %self.peer.location(),
            granted = bytes,
            "replication: buffers granted"
        );
        self.core.grant_received();
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        self.start();
    }

    /// Size probe, staging allocation, then the streaming loop.
    fn start(self: &Arc<Self>) {
        let meta = self.peer.get_chunk_metadata(self.core.chunk_id());
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        let meta = match meta {
            Ok(meta) => meta,
            Err(err) => {
                info!(
                    chunk = self.core.chunk_id(),
                    peer = %self.peer.location(),
                    error = %err,
                    "replication: chunk metadata probe failed"
                );
                self.core.finish(Err(err));
                return;
            }
        };
        if let Err(err) = self.core.begin_streaming(meta.chunk_size, meta.chunk_version) {
            self.core.finish(Err(err));
            return;
        }
        info!(
            chunk = self.core.chunk_id(),
            peer = %self.peer.location(),
            size = meta.chunk_size,
            "replication: starting"
        );
        self.stream();
    }

    fn stream(self: &Arc<Self>) {
        loop {
            if self.core.is_cancelled() {
                self.core.finish(Err(ReplicationError::Cancelled));
                return;
            }
            let (offset, chunk_size, version) = self.core.position();
            if offset >= chunk_size {
                if offset == chunk_size {
                    self.core.terminate_ok();
                } else {
                    error!(
                        chunk = self.core.chunk_id(),
                        offset, chunk_size, "replication: position past end of chunk"
                    );
                    self.core.finish(Err(ReplicationError::Io {
                        reason: format!("position {offset} past chunk size {chunk_size}"),
                    }));
                }
                return;
            }
            if offset % CHECKSUM_BLOCK_SIZE as i64 != 0 {
                self.skip_verify.store(false, Ordering::SeqCst);
            }
            let num_bytes = (chunk_size - offset).min(DEFAULT_READ_SIZE as i64) as usize;
            let skip = self.skip_verify.load(Ordering::SeqCst);
            let reply = self
                .peer
                .read(self.core.chunk_id(), version, offset, num_bytes, skip);
            match self.complete_read(offset, num_bytes, skip, reply) {
                Step::Continue => {}
                Step::Stop => return,
            }
        }
    }

    /// Read-completion path. The carried tail re-enters here as a synthetic
    /// read, so the final sub-block write flows through the same
    /// validation.
    fn complete_read(
        self: &Arc<Self>,
        offset: i64,
        requested: usize,
        skip_used: bool,
        reply: ReplicationResult<PeerReadReply>,
    ) -> Step {
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return Step::Stop;
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err @ ReplicationError::BadChecksum { .. }) if skip_used => {
                info!(
                    chunk = self.core.chunk_id(),
                    peer = %self.peer.location(),
                    offset,
                    error = %err,
                    "replication: retrying read with disk checksum verify"
                );
                self.skip_verify.store(false, Ordering::SeqCst);
                return Step::Continue;
            }
            Err(err) => {
                info!(
                    chunk = self.core.chunk_id(),
                    peer = %self.peer.location(),
                    offset,
                    error = %err,
                    "replication: read failed"
                );
                self.core.finish(Err(err));
                return Step::Stop;
            }
        };
        let num_rd = reply.data.len();
        let (_, chunk_size, _) = self.core.position();
        if num_rd < requested && offset + (num_rd as i64) < chunk_size {
            error!(
                chunk = self.core.chunk_id(),
                peer = %self.peer.location(),
                got = num_rd,
                expected = requested,
                "replication: short read"
            );
            self.core.finish(Err(ReplicationError::Invalid {
                reason: format!("short read: got {num_rd}, expected {requested}"),
            }));
            return Step::Stop;
        }
        let block = CHECKSUM_BLOCK_SIZE as i64;
        if offset % block != 0
            || (!reply.checksums.is_empty() && reply.checksums.len() != block_count(num_rd))
        {
            panic!(
                "replication: invalid read completion: chunk {} offset {offset} \
                 bytes {num_rd} checksums {}",
                self.core.chunk_id(),
                reply.checksums.len()
            );
        }

        // Writes go to the store in whole checksum blocks; a final unaligned
        // read is split and its tail carried as a synthetic next read.
        let mut write_data = reply.data;
        let mut write_cks = reply.checksums;
        let mut tail: Option<(i64, Vec<u8>, Vec<u32>)> = None;
        if num_rd > CHECKSUM_BLOCK_SIZE {
            let rem = num_rd % CHECKSUM_BLOCK_SIZE;
            if rem != 0 {
                let end = offset + num_rd as i64;
                if end != chunk_size {
                    panic!(
                        "replication: unaligned read not at end of chunk: \
                         chunk {} offset {offset} bytes {num_rd}",
                        self.core.chunk_id()
                    );
                }
                let aligned = num_rd - rem;
                let tail_data = write_data.split_off(aligned);
                // The read covered at least two blocks, so the prefix keeps
                // every checksum but the last and the tail carries that one.
                let tail_cks = match write_cks.pop() {
                    Some(last) => vec![last],
                    None => Vec::new(),
                };
                tail = Some((offset + aligned as i64, tail_data, tail_cks));
            }
        }
        let checksums = if write_cks.is_empty() {
            None
        } else {
            Some(&write_cks[..])
        };
        match self.core.write_and_advance(offset, &write_data, checksums) {
            Ok(written) => {
                debug!(
                    chunk = self.core.chunk_id(),
                    offset, written, "replication: write complete"
                );
            }
            Err(err) => {
                error!(
                    chunk = self.core.chunk_id(),
                    offset,
                    error = %err,
                    "replication: write failed"
                );
                self.core.finish(Err(err));
                return Step::Stop;
            }
        }
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return Step::Stop;
        }
        if let Some((tail_offset, tail_data, tail_cks)) = tail {
            let len = tail_data.len();
            return self.complete_read(
                tail_offset,
                len,
                false,
                Ok(PeerReadReply {
                    data: tail_data,
                    checksums: tail_cks,
                }),
            );
        }
        Step::Continue
    }
}

impl CancelTarget for Replicator {
    fn cancel(&self) {
        self.core.cancel();
    }

    fn effective_target_version(&self) -> ChunkVersion {
        self.core.effective_target_version()
    }
}
