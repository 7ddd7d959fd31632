//! Striped reader contract for Reed-Solomon recovery.
//!
//! The reader is an external library session bound to one destination
//! chunk: it fetches the stripe group's surviving chunks through the
//! metadata service and serves the reconstructed byte stream. This module
//! defines the session contract, the invalid-stripe report format, and a
//! scripted implementation for the test harness.

use std::sync::Mutex;

use tracing::debug;

use crate::error::{ReplicationError, ReplicationResult};
use crate::op::{FileId, StriperType};

/// Parameters for opening a reader session.
#[derive(Debug, Clone)]
pub struct StripeReaderParams {
    /// File the destination chunk belongs to.
    pub file_id: FileId,
    /// Path name, for lease acquisition and logs.
    pub path_name: String,
    /// Logical file size.
    pub file_size: i64,
    /// Striping layout; must be Reed-Solomon.
    pub striper_type: StriperType,
    /// Stripe size in bytes.
    pub stripe_size: i32,
    /// Data stripes in the group.
    pub num_stripes: i32,
    /// Parity stripes in the group.
    pub num_recovery_stripes: i32,
    /// Byte offset of the destination chunk inside the file.
    pub chunk_offset: i64,
    /// Treat missing stripes below EOF as holes.
    pub skip_holes: bool,
}

/// One invalid stripe identified by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidStripe {
    /// Index within the stripe group.
    pub stripe_idx: i32,
    /// Sibling chunk the stripe lives on.
    pub chunk_id: i64,
    /// Version of that sibling chunk.
    pub chunk_version: i64,
}

/// Byte length of one encoded invalid-stripe triple.
const TRIPLE_LEN: usize = 4 + 8 + 8;

/// Encodes invalid-stripe triples into the reader's completion payload.
pub fn encode_invalid_stripes(stripes: &[InvalidStripe]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(stripes.len() * TRIPLE_LEN);
    for s in stripes {
        buf.extend_from_slice(&s.stripe_idx.to_le_bytes());
        buf.extend_from_slice(&s.chunk_id.to_le_bytes());
        buf.extend_from_slice(&s.chunk_version.to_le_bytes());
    }
    buf
}

/// Decodes the invalid-stripe payload delivered with a failed read.
///
/// `max_stripes` is the stripe group width; more triples than that, an index
/// outside the group, or a truncated triple all mean the completion data is
/// corrupt and the caller must treat it as an invariant violation.
pub fn decode_invalid_stripes(
    buf: &[u8],
    max_stripes: usize,
) -> ReplicationResult<Vec<InvalidStripe>> {
    if buf.len() % TRIPLE_LEN != 0 {
        return Err(ReplicationError::Invalid {
            reason: format!("invalid stripe report size {}", buf.len()),
        });
    }
    let count = buf.len() / TRIPLE_LEN;
    if count > max_stripes {
        return Err(ReplicationError::Invalid {
            reason: format!("{count} bad stripes reported, group holds {max_stripes}"),
        });
    }
    let mut stripes = Vec::with_capacity(count);
    for chunk in buf.chunks_exact(TRIPLE_LEN) {
        let stripe_idx = i32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let chunk_id = i64::from_le_bytes(chunk[4..12].try_into().unwrap());
        let chunk_version = i64::from_le_bytes(chunk[12..20].try_into().unwrap());
        if stripe_idx < 0 || stripe_idx as usize >= max_stripes {
            return Err(ReplicationError::Invalid {
                reason: format!("bad stripe index {stripe_idx}"),
            });
        }
        stripes.push(InvalidStripe {
            stripe_idx,
            chunk_id,
            chunk_version,
        });
    }
    Ok(stripes)
}

/// Renders triples as the space-separated decimal report persisted on the op.
pub fn format_invalid_stripes(stripes: &[InvalidStripe]) -> String {
    let mut out = String::new();
    for s in stripes {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!(
            "{} {} {}",
            s.stripe_idx, s.chunk_id, s.chunk_version
        ));
    }
    out
}

/// Completion of one reader read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeReadOutcome {
    /// Zero on success, a negative status otherwise.
    pub status: i32,
    /// File-absolute offset the read was served at.
    pub offset: i64,
    /// Reconstructed bytes on success; on an unrecoverable stripe error,
    /// the encoded invalid-stripe triples.
    pub data: Vec<u8>,
}

/// A reader session bound to one destination chunk.
pub trait StripeReader: Send + Sync {
    /// Opens the session.
    fn open(&self, params: &StripeReaderParams) -> ReplicationResult<()>;

    /// Reads up to `max_bytes` of reconstructed data at the chunk-relative
    /// `offset`. A reply shorter than requested means end of chunk.
    fn read(&self, offset: i64, max_bytes: usize) -> StripeReadOutcome;

    /// Starts closing the session. The reader may stay active until a final
    /// empty completion, retrievable through [`StripeReader::take_final_done`].
    fn close(&self);

    /// Whether the session still has work in flight.
    fn is_active(&self) -> bool;

    /// The final empty completion of an asynchronous close, once ready.
    fn take_final_done(&self) -> Option<StripeReadOutcome>;

    /// Tears the session down without waiting for completions.
    fn shutdown(&self);
}

#[derive(Default)]
struct MockReaderState {
    chunk_offset: i64,
    opened: bool,
    closed: bool,
    shutdown: bool,
    pending_final: Option<StripeReadOutcome>,
    reads: Vec<(i64, usize)>,
    fail_at: Option<(i64, i32, Vec<u8>)>,
    open_error: Option<ReplicationError>,
}

/// Scripted reader serving a fixed reconstructed chunk image.
pub struct MockStripeReader {
    chunk_data: Vec<u8>,
    async_close: bool,
    state: Mutex<MockReaderState>,
}

impl MockStripeReader {
    /// A reader that reconstructs `chunk_data`.
    pub fn new(chunk_data: Vec<u8>) -> Self {
        Self {
            chunk_data,
            async_close: false,
            state: Mutex::new(MockReaderState::default()),
        }
    }

    /// Makes `close` complete asynchronously through a final empty done.
    pub fn with_async_close(mut self) -> Self {
        self.async_close = true;
        self
    }

    /// Fails the read at the chunk-relative `offset` with `status` and the
    /// given completion payload.
    pub fn fail_read_at(&self, offset: i64, status: i32, payload: Vec<u8>) {
        self.state.lock().unwrap().fail_at = Some((offset, status, payload));
    }

    /// Makes `open` fail with the given error.
    pub fn fail_open(&self, err: ReplicationError) {
        self.state.lock().unwrap().open_error = Some(err);
    }

    /// Whether `close` was called.
    pub fn close_observed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Whether `shutdown` was called.
    pub fn shutdown_observed(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Every read observed as `(offset, max_bytes)`, in order.
    pub fn reads(&self) -> Vec<(i64, usize)> {
        self.state.lock().unwrap().reads.clone()
    }
}

impl StripeReader for MockStripeReader {
    fn open(&self, params: &StripeReaderParams) -> ReplicationResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.open_error.take() {
            return Err(err);
        }
        state.chunk_offset = params.chunk_offset;
        state.opened = true;
        debug!(
            file = params.file_id,
            chunk_offset = params.chunk_offset,
            stripes = params.num_stripes,
            recovery_stripes = params.num_recovery_stripes,
            "mock reader opened"
        );
        Ok(())
    }

    fn read(&self, offset: i64, max_bytes: usize) -> StripeReadOutcome {
        let mut state = self.state.lock().unwrap();
        state.reads.push((offset, max_bytes));
        let abs_offset = state.chunk_offset + offset;
        if let Some((fail_offset, status, payload)) = state.fail_at.clone() {
            if fail_offset == offset {
                state.fail_at = None;
                return StripeReadOutcome {
                    status,
                    offset: abs_offset,
                    data: payload,
                };
            }
        }
        let start = (offset.max(0) as usize).min(self.chunk_data.len());
        let end = (start + max_bytes).min(self.chunk_data.len());
        StripeReadOutcome {
            status: 0,
            offset: abs_offset,
            data: self.chunk_data[start..end].to_vec(),
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if self.async_close {
            let abs = state.chunk_offset + self.chunk_data.len() as i64;
            state.pending_final = Some(StripeReadOutcome {
                status: 0,
                offset: abs,
                data: Vec::new(),
            });
        }
    }

    fn is_active(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.opened && !state.shutdown && (!state.closed || state.pending_final.is_some())
    }

    fn take_final_done(&self) -> Option<StripeReadOutcome> {
        self.state.lock().unwrap().pending_final.take()
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.pending_final = None;
    }
}
