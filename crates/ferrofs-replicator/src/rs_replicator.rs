//! Reed-Solomon recovery specialization of the replicator.
//!
//! Recovery replicators share per-slot metadata-service clients, one slot
//! per client loop, picked round-robin at creation. Authenticated and
//! unauthenticated pools are disjoint. Fresh PSK credentials carried on a
//! request are written through a shared parameter block guarded by a
//! monotonic update counter; a slot reapplies the block to its client only
//! when its own counter lags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::checksum::{compute_block_checksums, CHECKSUM_BLOCK_SIZE};
use crate::config::{MetaClientConfig, RsReaderConfig, CHUNK_SIZE, IO_BUFFER_SIZE, RS_READ_META_AUTH_PREFIX};
use crate::error::{ReplicationError, ReplicationResult};
use crate::op::{AccessCredentials, ChunkVersion, FileId, ReplicateChunkOp, ServerLocation, StriperType};
use crate::registry::CancelTarget;
use crate::replicator::{ReplicationContext, ReplicationMode, ReplicatorCore};
use crate::rs_reader::{
    decode_invalid_stripes, format_invalid_stripes, MockStripeReader, StripeReader,
    StripeReaderParams, StripeReadOutcome,
};

/// Parameter name carrying the PSK key id.
pub const PSK_KEY_ID_PARAM: &str = "chunkServer.rsReadMetaAuth.psk.keyId";
/// Parameter name carrying the PSK key.
pub const PSK_KEY_PARAM: &str = "chunkServer.rsReadMetaAuth.psk.key";

/// Shared authentication parameter block with a monotonic update counter.
#[derive(Default)]
pub struct AuthParamsBlock {
    params: Mutex<HashMap<String, String>>,
    update_count: AtomicU64,
}

impl AuthParamsBlock {
    /// Creates an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current update counter.
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::SeqCst)
    }

    /// Counter plus a copy of the parameters, read atomically.
    pub fn snapshot(&self) -> (u64, HashMap<String, String>) {
        let params = self.params.lock().unwrap().clone();
        (self.update_count.load(Ordering::SeqCst), params)
    }

    /// Writes through the PSK pair from a request, bumping the counter for
    /// each value that actually changed.
    pub fn update_credentials(&self, token: &str, key: &str) {
        let mut params = self.params.lock().unwrap();
        if params.get(PSK_KEY_ID_PARAM).map(String::as_str) != Some(token) {
            params.insert(PSK_KEY_ID_PARAM.to_string(), token.to_string());
            self.update_count.fetch_add(1, Ordering::SeqCst);
        }
        if params.get(PSK_KEY_PARAM).map(String::as_str) != Some(key) {
            params.insert(PSK_KEY_PARAM.to_string(), key.to_string());
            self.update_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Copies every `chunkServer.rsReadMetaAuth.*` key from a property set;
    /// any copied key bumps the counter once.
    pub fn apply_properties(&self, props: &HashMap<String, String>) {
        let mut params = self.params.lock().unwrap();
        let mut copied = false;
        for (k, v) in props {
            if k.starts_with(RS_READ_META_AUTH_PREFIX) {
                params.insert(k.clone(), v.clone());
                copied = true;
            }
        }
        if copied {
            self.update_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct AppliedAuth {
    psk_key_id: String,
    psk_key: String,
}

/// One metadata-service client, owned by a recovery slot.
pub struct MetaClient {
    name: String,
    config: MetaClientConfig,
    location: Mutex<ServerLocation>,
    auth: Option<Mutex<AppliedAuth>>,
}

impl MetaClient {
    fn new(name: String, config: MetaClientConfig, with_auth: bool) -> Self {
        Self {
            name,
            config,
            location: Mutex::new(ServerLocation::default()),
            auth: with_auth.then(|| Mutex::new(AppliedAuth::default())),
        }
    }

    /// The client's name, used as a log prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client's timeout and retry configuration.
    pub fn config(&self) -> &MetaClientConfig {
        &self.config
    }

    /// Whether an authentication context is attached.
    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// The server this client currently points at.
    pub fn location(&self) -> ServerLocation {
        self.location.lock().unwrap().clone()
    }

    /// Points the client at a new server, cancelling pending ops.
    pub fn set_server(&self, location: &ServerLocation) -> ReplicationResult<()> {
        if !location.is_valid() {
            return Err(ReplicationError::HostUnreachable {
                location: location.to_string(),
            });
        }
        *self.location.lock().unwrap() = location.clone();
        Ok(())
    }

    /// The PSK key id currently applied, for verification in tests.
    pub fn applied_key_id(&self) -> Option<String> {
        self.auth
            .as_ref()
            .map(|a| a.lock().unwrap().psk_key_id.clone())
    }

    fn apply_auth(&self, params: &HashMap<String, String>) {
        let auth = self
            .auth
            .as_ref()
            .expect("recovery: invalid null authentication context");
        let mut applied = auth.lock().unwrap();
        applied.psk_key_id = params.get(PSK_KEY_ID_PARAM).cloned().unwrap_or_default();
        applied.psk_key = params.get(PSK_KEY_PARAM).cloned().unwrap_or_default();
    }

    fn reset(&self) {
        *self.location.lock().unwrap() = ServerLocation::default();
        if let Some(auth) = &self.auth {
            let mut applied = auth.lock().unwrap();
            applied.psk_key_id.clear();
            applied.psk_key.clear();
        }
    }
}

/// A pool slot: a client plus the auth counter it last applied.
pub struct MetaClientSlot {
    /// The slot's client.
    pub client: Arc<MetaClient>,
    /// Value of the shared counter when the slot last applied the block.
    pub auth_update_count: AtomicU64,
}

fn build_slots(count: usize, auth: bool, config: &MetaClientConfig) -> Vec<MetaClientSlot> {
    (0..count)
        .map(|i| MetaClientSlot {
            client: Arc::new(MetaClient::new(
                format!("RSR{}{}", if auth { "A" } else { "" }, i),
                config.clone(),
                auth,
            )),
            auth_update_count: AtomicU64::new(0),
        })
        .collect()
}

/// The per-process recovery client pools.
///
/// Slot 0 belongs to the primary network loop; slots 1..N to the client
/// worker loops. The authenticated and unauthenticated pools are separate
/// arrays sharing one round-robin cursor.
pub struct RecoveryClients {
    plain: Vec<MetaClientSlot>,
    authed: Vec<MetaClientSlot>,
    auth_params: AuthParamsBlock,
    last_idx: Mutex<usize>,
}

impl RecoveryClients {
    /// Builds pools with one slot per client loop plus the primary loop.
    pub fn new(client_thread_count: usize, config: &MetaClientConfig) -> Self {
        let count = client_thread_count + 1;
        Self {
            plain: build_slots(count, false, config),
            authed: build_slots(count, true, config),
            auth_params: AuthParamsBlock::new(),
            last_idx: Mutex::new(0),
        }
    }

    /// The shared authentication parameter block.
    pub fn auth_params(&self) -> &AuthParamsBlock {
        &self.auth_params
    }

    /// Number of slots per pool.
    pub fn slot_count(&self) -> usize {
        self.plain.len()
    }

    /// Picks the next slot round-robin among
    /// `min(max_recovery_threads, slot_count)`; slot 0 is used only when no
    /// worker loop is available.
    pub fn pick_slot(&self, max_recovery_threads: usize) -> usize {
        let count = self.plain.len();
        let limit = max_recovery_threads.min(count);
        let mut last = self.last_idx.lock().unwrap();
        *last += 1;
        if *last >= limit {
            *last = if count <= 1 || max_recovery_threads == 0 {
                0
            } else {
                1
            };
        }
        *last
    }

    /// The slot at `idx` in the requested pool.
    pub fn slot(&self, auth: bool, idx: usize) -> &MetaClientSlot {
        if auth {
            &self.authed[idx]
        } else {
            &self.plain[idx]
        }
    }

    /// Resets every client, dropping locations and applied credentials.
    pub fn stop(&self) {
        for slot in self.plain.iter().chain(self.authed.iter()) {
            slot.client.reset();
            slot.auth_update_count.store(0, Ordering::SeqCst);
        }
    }
}

/// Builds reader sessions bound to a slot's metadata client.
pub trait StripeReaderFactory: Send + Sync {
    /// Creates the session for one recovery.
    fn create(
        &self,
        client: &Arc<MetaClient>,
        config: &RsReaderConfig,
        op: &ReplicateChunkOp,
    ) -> Arc<dyn StripeReader>;
}

/// Factory handing out pre-scripted readers by chunk id, for the test
/// harness.
#[derive(Default)]
pub struct MockStripeReaderFactory {
    readers: Mutex<HashMap<i64, Arc<MockStripeReader>>>,
}

impl MockStripeReaderFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reader used for `chunk_id`.
    pub fn add_reader(&self, chunk_id: i64, reader: Arc<MockStripeReader>) {
        self.readers.lock().unwrap().insert(chunk_id, reader);
    }
}

impl StripeReaderFactory for MockStripeReaderFactory {
    fn create(
        &self,
        _client: &Arc<MetaClient>,
        _config: &RsReaderConfig,
        op: &ReplicateChunkOp,
    ) -> Arc<dyn StripeReader> {
        self.readers
            .lock()
            .unwrap()
            .get(&op.chunk_id)
            .cloned()
            .map(|r| r as Arc<dyn StripeReader>)
            .unwrap_or_else(|| Arc::new(MockStripeReader::new(Vec::new())))
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        0
    } else {
        a / gcd(a, b) * b
    }
}

/// Chooses the per-read byte count for a recovery.
///
/// The result is a multiple of the I/O buffer unit and the checksum block,
/// prefers the least common multiple with the stripe size when that fits
/// under the per-stripe buffer budget, and never exceeds the configured
/// ceiling.
pub(crate) fn compute_read_size(
    stripe_size: usize,
    num_stripes: usize,
    max_read_size: usize,
    max_client_quota: u64,
) -> usize {
    let block = CHECKSUM_BLOCK_SIZE;
    debug_assert!(max_read_size >= block && max_read_size % block == 0);
    debug_assert!(block % IO_BUFFER_SIZE == 0 && stripe_size > 0);
    let per_stripe_budget =
        (max_client_quota as usize / (num_stripes + 1).max(1)) / block * block;
    let size = block.max(max_read_size.min(per_stripe_budget));
    if size <= stripe_size {
        debug!(
            stripe_size,
            read_size = size,
            "recovery: stripe larger than read size"
        );
        return size;
    }
    let mut unit = lcm(block, stripe_size);
    if unit > size {
        unit = lcm(IO_BUFFER_SIZE, stripe_size);
        if unit > size {
            warn!(
                max_read_size,
                io_buffer_size = IO_BUFFER_SIZE,
                stripe_size,
                read_size = unit,
                "recovery: stripe parameters force read above the buffer budget"
            );
            return unit;
        }
    }
    size / unit * unit
}

/// Cross-loop handoff state; one transition may be in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsOpState {
    None,
    Start,
    Read,
}

struct RsState {
    op_state: RsOpState,
    read_tail: Vec<u8>,
    pending_read: bool,
    pending_close: bool,
}

struct RsOpInfo {
    file_id: FileId,
    chunk_version: ChunkVersion,
    path_name: String,
    file_size: i64,
    stripe_size: i32,
    num_stripes: i32,
    num_recovery_stripes: i32,
    chunk_offset: i64,
}

enum RsRead {
    /// Tail still below one checksum block; extend with another read.
    Extend,
    /// The read cycle completed with the given result.
    Complete(ReplicationResult<()>),
}

/// Recovery replicator: reconstructs the chunk through a striped reader.
pub struct RsReplicator {
    core: ReplicatorCore,
    reader: Arc<dyn StripeReader>,
    clients: Arc<RecoveryClients>,
    slot_idx: usize,
    auth: bool,
    meta_location: ServerLocation,
    read_size: usize,
    info: RsOpInfo,
    max_recover_chunk_size: i64,
    panic_on_invalid_chunk: bool,
    pending_cancel: AtomicBool,
    rs: Mutex<RsState>,
}

impl RsReplicator {
    /// Creates a recovery replicator, writing any fresh credentials through
    /// the shared parameter block and binding a round-robin client slot.
    pub fn create(
        ctx: Arc<ReplicationContext>,
        op: ReplicateChunkOp,
        credentials: &AccessCredentials,
        clients: Arc<RecoveryClients>,
        factory: &Arc<dyn StripeReaderFactory>,
        config: &RsReaderConfig,
        meta_server_host: &str,
    ) -> Arc<Self> {
        let auth = credentials.is_auth();
        if auth {
            clients
                .auth_params
                .update_credentials(&credentials.token, &credentials.key);
        }
        let slot_idx = clients.pick_slot(config.max_recovery_threads);
        let slot = clients.slot(auth, slot_idx);
        assert!(
            slot.client.has_auth() == auth,
            "recovery: invalid meta server entry"
        );
        let read_size = compute_read_size(
            op.stripe_size as usize,
            op.num_stripes as usize,
            config.max_read_size,
            ctx.admission.max_client_quota(),
        );
        let reader = factory.create(&slot.client, config, &op);
        let meta_location = ServerLocation::new(meta_server_host, op.location.port);
        let info = RsOpInfo {
            file_id: op.file_id,
            chunk_version: op.chunk_version,
            path_name: op.path_name.clone(),
            file_size: op.file_size,
            stripe_size: op.stripe_size,
            num_stripes: op.num_stripes,
            num_recovery_stripes: op.num_recovery_stripes,
            chunk_offset: op.chunk_offset,
        };
        Arc::new(Self {
            core: ReplicatorCore::new(ctx, ReplicationMode::Recovery, op),
            reader,
            clients,
            slot_idx,
            auth,
            meta_location,
            read_size,
            info,
            max_recover_chunk_size: config.max_recover_chunk_size,
            panic_on_invalid_chunk: config.panic_on_invalid_chunk,
            pending_cancel: AtomicBool::new(false),
            rs: Mutex::new(RsState {
                op_state: RsOpState::None,
                read_tail: Vec::new(),
                pending_read: false,
                pending_close: false,
            }),
        })
    }

    /// The read size chosen for this recovery.
    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// The slot this recovery is pinned to.
    pub fn slot_idx(&self) -> usize {
        self.slot_idx
    }

    /// Runs the recovery to a terminal state, or parks it on the buffer
    /// queue.
    pub fn run(self: &Arc<Self>) {
        let target: Arc<dyn CancelTarget> = self.clone();
        if !self.core.register(target) {
            return;
        }
        let required = self.read_size as u64 * (self.info.num_stripes as u64 + 1);
        let this = self.clone();
        let on_grant = Box::new(move |bytes| this.granted(bytes));
        match self.core.admit(required, on_grant) {
            crate::admission::AdmissionOutcome::Granted => self.start(),
            crate::admission::AdmissionOutcome::Queued => {}
            crate::admission::AdmissionOutcome::OverQuota => {
                self.core.finish(Err(ReplicationError::OutOfMemory {
                    requested: required,
                    quota: self.core.ctx().admission.max_client_quota(),
                }));
            }
        }
    }

    fn granted(&self, bytes: u64) {
        info!(
            chunk = self.core.chunk_id(),
            granted = bytes,
            "recovery: buffers granted"
        );
        self.core.grant_received();
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        self.start();
    }

    fn start(&self) {
        if self.pending_cancel.load(Ordering::SeqCst) {
            debug!(
                chunk = self.core.chunk_id(),
                "recovery: ignoring start, cancel pending"
            );
            return;
        }
        if !self.meta_location.is_valid() {
            self.complete_start(Err(ReplicationError::Invalid {
                reason: format!(
                    "invalid meta server location {} or authentication",
                    self.meta_location
                ),
            }));
            return;
        }
        self.enqueue(RsOpState::Start);
    }

    fn enqueue(&self, next: RsOpState) {
        {
            let mut rs = self.rs.lock().unwrap();
            if self.pending_cancel.load(Ordering::SeqCst) {
                if rs.op_state != next {
                    panic!(
                        "recovery: invalid cancel enqueue from {:?} to {:?}",
                        rs.op_state, next
                    );
                }
            } else if rs.op_state != RsOpState::None {
                panic!(
                    "recovery: invalid state transition from {:?} to {:?}",
                    rs.op_state, next
                );
            } else {
                rs.op_state = next;
            }
        }
        self.handle();
    }

    fn handle(&self) {
        if self.pending_cancel.load(Ordering::SeqCst) {
            self.handle_cancel();
            return;
        }
        let state = self.rs.lock().unwrap().op_state;
        match state {
            RsOpState::Start => self.handle_start(),
            RsOpState::Read => self.handle_read(),
            RsOpState::None => panic!("recovery: invalid state"),
        }
    }

    fn handle_start(&self) {
        if self.auth {
            let slot = self.clients.slot(true, self.slot_idx);
            let (global, params) = self.clients.auth_params.snapshot();
            if slot.auth_update_count.load(Ordering::SeqCst) != global {
                debug!(
                    slot = slot.auth_update_count.load(Ordering::SeqCst),
                    global, "recovery: updating authentication context"
                );
                slot.client.apply_auth(&params);
                slot.auth_update_count.store(global, Ordering::SeqCst);
            }
        }
        let slot = self.clients.slot(self.auth, self.slot_idx);
        let current = slot.client.location();
        if current != self.meta_location {
            if current.is_valid() {
                info!(
                    chunk = self.core.chunk_id(),
                    from = %current,
                    to = %self.meta_location,
                    "recovery: meta server client address has changed"
                );
            }
            if let Err(err) = slot.client.set_server(&self.meta_location) {
                self.complete_start(Err(err));
                return;
            }
        }
        let params = StripeReaderParams {
            file_id: self.info.file_id,
            path_name: self.info.path_name.clone(),
            file_size: self.info.file_size,
            striper_type: StriperType::Rs,
            stripe_size: self.info.stripe_size,
            num_stripes: self.info.num_stripes,
            num_recovery_stripes: self.info.num_recovery_stripes,
            chunk_offset: self.info.chunk_offset,
            skip_holes: true,
        };
        let result = self.reader.open(&params);
        self.complete_start(result);
    }

    fn complete_start(&self, result: ReplicationResult<()>) {
        if self.pending_cancel.load(Ordering::SeqCst) {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        self.rs.lock().unwrap().op_state = RsOpState::None;
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        match result {
            Err(err) => {
                info!(
                    chunk = self.core.chunk_id(),
                    error = %err,
                    "recovery: reader open failed"
                );
                self.core.finish(Err(err));
            }
            Ok(()) => {
                // Recovery has no size probe: the chunk size starts at the
                // maximum and is trimmed when the reader reports end of
                // chunk.
                if let Err(err) = self
                    .core
                    .begin_streaming(CHUNK_SIZE, self.info.chunk_version)
                {
                    self.core.finish(Err(err));
                    return;
                }
                info!(
                    chunk = self.core.chunk_id(),
                    read_size = self.read_size,
                    stripes = self.info.num_stripes,
                    "recovery: starting"
                );
                self.stream();
            }
        }
    }

    fn stream(&self) {
        loop {
            if self.core.is_completed() {
                return;
            }
            if self.core.is_cancelled() || self.pending_cancel.load(Ordering::SeqCst) {
                self.core.finish(Err(ReplicationError::Cancelled));
                return;
            }
            let (offset, chunk_size, _) = self.core.position();
            if offset >= chunk_size {
                if offset == chunk_size {
                    self.core.terminate_ok();
                } else {
                    error!(
                        chunk = self.core.chunk_id(),
                        offset, chunk_size, "recovery: position past end of chunk"
                    );
                    self.core.finish(Err(ReplicationError::Io {
                        reason: format!("position {offset} past chunk size {chunk_size}"),
                    }));
                }
                return;
            }
            self.enqueue(RsOpState::Read);
        }
    }

    fn handle_read(&self) {
        loop {
            if self.pending_cancel.load(Ordering::SeqCst) {
                return;
            }
            let (offset, chunk_size, _) = self.core.position();
            if offset >= chunk_size {
                self.complete_read(Ok(()));
                return;
            }
            let tail_len = self.rs.lock().unwrap().read_tail.len();
            let rel_offset = offset + tail_len as i64;
            {
                let mut rs = self.rs.lock().unwrap();
                assert!(!rs.pending_read, "recovery: read already in flight");
                rs.pending_read = true;
            }
            let outcome = self.reader.read(rel_offset, self.read_size);
            self.rs.lock().unwrap().pending_read = false;
            match self.process_outcome(rel_offset, outcome) {
                RsRead::Extend => continue,
                RsRead::Complete(result) => {
                    self.complete_read(result);
                    return;
                }
            }
        }
    }

    fn process_outcome(&self, rel_offset: i64, outcome: StripeReadOutcome) -> RsRead {
        if self.pending_cancel.load(Ordering::SeqCst) {
            return RsRead::Complete(Err(ReplicationError::Cancelled));
        }
        let (offset, chunk_size, _) = self.core.position();
        if outcome.offset != self.info.chunk_offset + rel_offset {
            panic!(
                "recovery: invalid read completion: chunk {} expected offset {} got {}",
                self.core.chunk_id(),
                self.info.chunk_offset + rel_offset,
                outcome.offset
            );
        }
        if outcome.status < 0 {
            if !outcome.data.is_empty() {
                self.report_invalid_stripes(&outcome);
            }
            return RsRead::Complete(Err(ReplicationError::from_status(outcome.status)));
        }
        let tail_len = self.rs.lock().unwrap().read_tail.len();
        let pending = tail_len + outcome.data.len();
        if offset + pending as i64 > self.max_recover_chunk_size {
            panic!(
                "recovery: file {} chunk {} pos {} + {} rdsize {} exceeds {}",
                self.info.file_id,
                self.core.chunk_id(),
                offset,
                tail_len,
                outcome.data.len(),
                self.max_recover_chunk_size
            );
        }
        let end_of_chunk = outcome.data.len() < self.read_size
            || offset + tail_len as i64 + self.read_size as i64 >= chunk_size;
        if end_of_chunk {
            let mut buf = std::mem::take(&mut self.rs.lock().unwrap().read_tail);
            buf.extend_from_slice(&outcome.data);
            self.core.set_chunk_size(offset + buf.len() as i64);
            self.close_reader();
            if buf.is_empty() {
                return RsRead::Complete(Ok(()));
            }
            return RsRead::Complete(self.write_aligned(offset, buf));
        }
        let total = tail_len + outcome.data.len();
        let movable = total / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE;
        if movable == 0 {
            self.rs
                .lock()
                .unwrap()
                .read_tail
                .extend_from_slice(&outcome.data);
            return RsRead::Extend;
        }
        let mut buf = std::mem::take(&mut self.rs.lock().unwrap().read_tail);
        buf.extend_from_slice(&outcome.data);
        let rest = buf.split_off(movable);
        self.rs.lock().unwrap().read_tail = rest;
        RsRead::Complete(self.write_aligned(offset, buf))
    }

    /// Writes one batch, computing checksums only for fully block-aligned
    /// writes.
    fn write_aligned(&self, offset: i64, buf: Vec<u8>) -> ReplicationResult<()> {
        let aligned = offset % CHECKSUM_BLOCK_SIZE as i64 == 0
            && buf.len() % CHECKSUM_BLOCK_SIZE == 0
            && !buf.is_empty();
        let checksums = aligned.then(|| compute_block_checksums(&buf));
        let written = self
            .core
            .write_and_advance(offset, &buf, checksums.as_deref())?;
        debug!(
            chunk = self.core.chunk_id(),
            offset, written, "recovery: write complete"
        );
        Ok(())
    }

    fn close_reader(&self) {
        self.reader.close();
        if self.reader.is_active() {
            self.rs.lock().unwrap().pending_close = true;
            while let Some(done) = self.reader.take_final_done() {
                if done.data.is_empty() && !self.reader.is_active() {
                    debug!(chunk = self.core.chunk_id(), "recovery: chunk reader closed");
                    self.rs.lock().unwrap().pending_close = false;
                    break;
                }
            }
            if self.rs.lock().unwrap().pending_close {
                debug!(
                    chunk = self.core.chunk_id(),
                    "recovery: reader close still pending at shutdown"
                );
            }
        }
    }

    fn report_invalid_stripes(&self, outcome: &StripeReadOutcome) {
        let group = (self.info.num_stripes + self.info.num_recovery_stripes) as usize;
        let stripes = match decode_invalid_stripes(&outcome.data, group) {
            Ok(stripes) => stripes,
            Err(err) => panic!("recovery: completion: {err}"),
        };
        if stripes.is_empty() {
            return;
        }
        let report = format_invalid_stripes(&stripes);
        error!(
            chunk = self.core.chunk_id(),
            status = outcome.status,
            invalid_stripes = %report,
            file_size = self.info.file_size,
            "recovery: invalid stripes detected"
        );
        self.core.set_invalid_stripes(report.clone());
        if self.panic_on_invalid_chunk && self.info.file_size > 0 {
            panic!("recovery: invalid chunk(s) detected: {report}");
        }
    }

    fn complete_read(&self, result: ReplicationResult<()>) {
        if self.pending_cancel.load(Ordering::SeqCst) {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        self.rs.lock().unwrap().op_state = RsOpState::None;
        if self.core.is_cancelled() {
            self.core.finish(Err(ReplicationError::Cancelled));
            return;
        }
        if let Err(err) = result {
            info!(
                chunk = self.core.chunk_id(),
                error = %err,
                "recovery: read failed"
            );
            self.core.finish(Err(err));
        }
    }

    fn handle_cancel(&self) {
        self.reader.shutdown();
        self.core.cancel();
        let in_flight = {
            let rs = self.rs.lock().unwrap();
            rs.pending_read || rs.op_state == RsOpState::Start
        };
        if !in_flight {
            // Nothing will come back to observe the flag; terminate here.
            self.core.finish(Err(ReplicationError::Cancelled));
        }
    }
}

impl CancelTarget for RsReplicator {
    fn cancel(&self) {
        if self.pending_cancel.swap(true, Ordering::SeqCst) {
            return;
        }
        // Re-enqueue the current state; with the cancel flag set this is
        // the one legal same-state transition, and it drains into
        // handle_cancel.
        let state = self.rs.lock().unwrap().op_state;
        self.enqueue(state);
    }

    fn effective_target_version(&self) -> ChunkVersion {
        self.core.effective_target_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_params_write_through_bumps_once_per_change() {
        let block = AuthParamsBlock::new();
        assert_eq!(block.update_count(), 0);
        block.update_credentials("tok1", "key1");
        assert_eq!(block.update_count(), 2);
        // Same values again: no change, no bump.
        block.update_credentials("tok1", "key1");
        assert_eq!(block.update_count(), 2);
        block.update_credentials("tok2", "key1");
        assert_eq!(block.update_count(), 3);
    }

    #[test]
    fn test_auth_params_apply_properties() {
        let block = AuthParamsBlock::new();
        let mut props = HashMap::new();
        props.insert(
            "chunkServer.rsReadMetaAuth.psk.keyId".to_string(),
            "id9".to_string(),
        );
        props.insert("unrelated.key".to_string(), "x".to_string());
        block.apply_properties(&props);
        assert_eq!(block.update_count(), 1);
        let (_, params) = block.snapshot();
        assert_eq!(params.get(PSK_KEY_ID_PARAM).unwrap(), "id9");
        assert!(!params.contains_key("unrelated.key"));
    }

    #[test]
    fn test_slot_pools_are_disjoint() {
        let clients = RecoveryClients::new(3, &MetaClientConfig::default());
        assert_eq!(clients.slot_count(), 4);
        for i in 0..4 {
            assert!(!clients.slot(false, i).client.has_auth());
            assert!(clients.slot(true, i).client.has_auth());
            assert!(!Arc::ptr_eq(
                &clients.slot(false, i).client,
                &clients.slot(true, i).client
            ));
        }
    }

    #[test]
    fn test_pick_slot_round_robin_skips_primary() {
        let clients = RecoveryClients::new(3, &MetaClientConfig::default());
        let picks: Vec<usize> = (0..7).map(|_| clients.pick_slot(16)).collect();
        // Wraps to 1, never revisits the primary slot while workers exist.
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_pick_slot_single_loop_uses_primary() {
        let clients = RecoveryClients::new(0, &MetaClientConfig::default());
        assert_eq!(clients.pick_slot(16), 0);
        assert_eq!(clients.pick_slot(16), 0);
    }

    #[test]
    fn test_pick_slot_respects_thread_cap() {
        let clients = RecoveryClients::new(7, &MetaClientConfig::default());
        let picks: Vec<usize> = (0..6).map(|_| clients.pick_slot(3)).collect();
        assert_eq!(picks, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn test_slot_applies_auth_only_when_counter_lags() {
        let clients = RecoveryClients::new(2, &MetaClientConfig::default());
        clients.auth_params().update_credentials("tokA", "keyA");
        let slot = clients.slot(true, 1);
        let (global, params) = clients.auth_params().snapshot();
        assert_ne!(slot.auth_update_count.load(Ordering::SeqCst), global);
        slot.client.apply_auth(&params);
        slot.auth_update_count.store(global, Ordering::SeqCst);
        assert_eq!(slot.client.applied_key_id().unwrap(), "tokA");
        // A second recovery with unchanged credentials sees no lag.
        clients.auth_params().update_credentials("tokA", "keyA");
        assert_eq!(slot.auth_update_count.load(Ordering::SeqCst), global);
    }

    #[test]
    fn test_meta_client_set_server() {
        let client = MetaClient::new("RSR1".to_string(), MetaClientConfig::default(), false);
        assert!(client
            .set_server(&ServerLocation::new("meta1", 30000))
            .is_ok());
        assert_eq!(client.location(), ServerLocation::new("meta1", 30000));
        let err = client
            .set_server(&ServerLocation::new("", 30000))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::HostUnreachable { .. }));
    }

    #[test]
    fn test_compute_read_size_aligned_to_stripe_lcm() {
        // 64 KiB stripes divide the 1 MiB ceiling evenly.
        let size = compute_read_size(64 * 1024, 6, 1024 * 1024, 64 << 20);
        assert_eq!(size % (64 * 1024), 0);
        assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
        assert!(size <= 1024 * 1024);
    }

    #[test]
    fn test_compute_read_size_large_stripe() {
        // Stripe bigger than the achievable read size: use the plain size.
        let size = compute_read_size(8 << 20, 2, 1024 * 1024, 64 << 20);
        assert_eq!(size, 1024 * 1024);
    }

    #[test]
    fn test_compute_read_size_budget_bound() {
        // A tight client quota shrinks the read below the ceiling.
        let quota = 2 * 1024 * 1024;
        let size = compute_read_size(64 * 1024, 7, 1024 * 1024, quota);
        assert!(size as u64 <= quota / 8);
        assert!(size >= CHECKSUM_BLOCK_SIZE);
    }

    #[test]
    fn test_compute_read_size_stripe_lcm_preferred() {
        // 12 KiB stripes: the block/stripe LCM (192 KiB) fits the budget
        // and the read rounds down to a multiple of it.
        let size = compute_read_size(12 * 1024, 3, 1024 * 1024, 64 << 20);
        assert_eq!(size % (192 * 1024), 0);
        assert!(size <= 1024 * 1024);
    }

    #[test]
    fn test_compute_read_size_falls_back_to_buffer_lcm() {
        // 68 KiB stripes: the block/stripe LCM exceeds the read ceiling,
        // the 4 KiB buffer-unit LCM still fits.
        let size = compute_read_size(68 * 1024, 3, 1024 * 1024, 64 << 20);
        assert_eq!(size % (68 * 1024), 0);
        assert_eq!(size % IO_BUFFER_SIZE, 0);
        assert!(size <= 1024 * 1024);
    }

    #[test]
    fn test_compute_read_size_unalignable_stripe_exceeds_budget() {
        // A stripe that shares no factor with the buffer unit forces a
        // read of one whole LCM above the ceiling.
        let stripe = 512 * 1024 + 1;
        let size = compute_read_size(stripe, 1, 1024 * 1024, 64 << 20);
        assert_eq!(size % stripe, 0);
        assert!(size > 1024 * 1024);
    }

    #[test]
    fn test_gcd_lcm() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(lcm(12, 18), 36);
        assert_eq!(lcm(0, 5), 0);
    }
}
