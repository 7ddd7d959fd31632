//! Source peer sessions for direct replication.
//!
//! A peer session answers two ops: a size probe and ranged reads with
//! per-block checksums. Sessions are created per replication or shared
//! through a location-keyed pool when the connection pool is enabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::checksum::compute_block_checksums;
use crate::error::{ReplicationError, ReplicationResult};
use crate::op::{ChunkId, ChunkVersion, ServerLocation};

/// Reply to a chunk size probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Bytes the source holds for this chunk.
    pub chunk_size: i64,
    /// Version the source holds.
    pub chunk_version: ChunkVersion,
}

/// Reply to a ranged read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReadReply {
    /// The bytes read; may be shorter than requested only at end of chunk.
    pub data: Vec<u8>,
    /// One digest per covered checksum block; empty when the source did not
    /// compute them.
    pub checksums: Vec<u32>,
}

/// A session to one source chunk server.
pub trait PeerReader: Send + Sync {
    /// Size probe.
    fn get_chunk_metadata(&self, chunk_id: ChunkId) -> ReplicationResult<ChunkMeta>;

    /// Ranged read of `num_bytes` at `offset`.
    ///
    /// `skip_verify_disk_checksum` lets the source serve the read without
    /// re-verifying its disk blocks; a [`ReplicationError::BadChecksum`]
    /// reply is retried once by the caller with verification enabled.
    fn read(
        &self,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
        skip_verify_disk_checksum: bool,
    ) -> ReplicationResult<PeerReadReply>;

    /// The peer's location, for logs.
    fn location(&self) -> ServerLocation;
}

/// Credentials forwarded to the peer when establishing a session.
#[derive(Debug, Clone, Default)]
pub struct PeerCredentials {
    /// Delegation token; empty without auth.
    pub token: String,
    /// Session key matching the token.
    pub key: String,
    /// Whether clear-text transport is acceptable.
    pub allow_clear_text: bool,
}

/// Establishes sessions to source peers.
pub trait PeerConnector: Send + Sync {
    /// Connects to `location`, or fails with
    /// [`ReplicationError::HostUnreachable`].
    fn connect(
        &self,
        location: &ServerLocation,
        credentials: &PeerCredentials,
    ) -> ReplicationResult<Arc<dyn PeerReader>>;
}

/// Location-keyed cache of peer sessions.
///
/// Enabled by `chunkServer.replicator.useConnetionPool`; sessions are shared
/// across replications from the same source.
pub struct PeerPool {
    connector: Arc<dyn PeerConnector>,
    sessions: Mutex<HashMap<ServerLocation, Arc<dyn PeerReader>>>,
}

impl PeerPool {
    /// Creates a pool over the given connector.
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pooled session for `location`, connecting on first use.
    pub fn find_server(
        &self,
        location: &ServerLocation,
        credentials: &PeerCredentials,
    ) -> ReplicationResult<Arc<dyn PeerReader>> {
        if let Some(session) = self.sessions.lock().unwrap().get(location) {
            debug!(peer = %location, "reusing pooled peer session");
            return Ok(session.clone());
        }
        let session = self.connector.connect(location, credentials)?;
        self.sessions
            .lock()
            .unwrap()
            .insert(location.clone(), session.clone());
        Ok(session)
    }

    /// Number of pooled sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// True when no session is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fault kinds a [`MockPeer`] can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFault {
    /// Fail one read at the given offset with a checksum error.
    BadChecksumAt {
        /// Offset of the poisoned read.
        offset: i64,
        /// Fail only reads that skipped the disk verify.
        only_when_skipping_verify: bool,
    },
    /// Serve fewer bytes than requested at the given offset.
    ShortReadAt {
        /// Offset of the truncated read.
        offset: i64,
        /// Bytes actually served.
        serve: usize,
    },
    /// Fail one read at the given offset with an I/O error.
    IoErrorAt {
        /// Offset of the failing read.
        offset: i64,
    },
}

/// One read observed by a [`MockPeer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedRead {
    /// Offset requested.
    pub offset: i64,
    /// Bytes requested.
    pub num_bytes: usize,
    /// Whether the disk verify was skipped.
    pub skip_verify: bool,
}

struct MockPeerState {
    faults: Vec<PeerFault>,
    reads: Vec<ObservedRead>,
    on_read: Option<Box<dyn FnMut(&ObservedRead) + Send>>,
}

/// Scripted in-process peer serving a fixed chunk image, with fault
/// injection and read recording.
pub struct MockPeer {
    location: ServerLocation,
    chunk_version: ChunkVersion,
    data: Vec<u8>,
    with_checksums: bool,
    state: Mutex<MockPeerState>,
}

impl MockPeer {
    /// A peer at `location` serving `data` at `chunk_version`.
    pub fn new(location: ServerLocation, chunk_version: ChunkVersion, data: Vec<u8>) -> Self {
        Self {
            location,
            chunk_version,
            data,
            with_checksums: true,
            state: Mutex::new(MockPeerState {
                faults: Vec::new(),
                reads: Vec::new(),
                on_read: None,
            }),
        }
    }

    /// Serve reads without checksums.
    pub fn without_checksums(mut self) -> Self {
        self.with_checksums = false;
        self
    }

    /// Adds a one-shot fault.
    pub fn inject(&self, fault: PeerFault) {
        self.state.lock().unwrap().faults.push(fault);
    }

    /// Hook invoked on every read before it is served; used to model
    /// concurrent arrivals such as a pre-empting request.
    pub fn on_read(&self, hook: Box<dyn FnMut(&ObservedRead) + Send>) {
        self.state.lock().unwrap().on_read = Some(hook);
    }

    /// Every read observed, in order.
    pub fn reads(&self) -> Vec<ObservedRead> {
        self.state.lock().unwrap().reads.clone()
    }

    fn take_fault(&self, offset: i64, skip_verify: bool) -> Option<PeerFault> {
        let mut state = self.state.lock().unwrap();
        let idx = state.faults.iter().position(|f| match f {
            PeerFault::BadChecksumAt {
                offset: o,
                only_when_skipping_verify,
            } => *o == offset && (!only_when_skipping_verify || skip_verify),
            PeerFault::ShortReadAt { offset: o, .. } => *o == offset,
            PeerFault::IoErrorAt { offset: o } => *o == offset,
        })?;
        Some(state.faults.remove(idx))
    }
}

impl PeerReader for MockPeer {
    fn get_chunk_metadata(&self, _chunk_id: ChunkId) -> ReplicationResult<ChunkMeta> {
        Ok(ChunkMeta {
            chunk_size: self.data.len() as i64,
            chunk_version: self.chunk_version,
        })
    }

    fn read(
        &self,
        _chunk_id: ChunkId,
        _chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
        skip_verify_disk_checksum: bool,
    ) -> ReplicationResult<PeerReadReply> {
        let observed = ObservedRead {
            offset,
            num_bytes,
            skip_verify: skip_verify_disk_checksum,
        };
        {
            let mut state = self.state.lock().unwrap();
            state.reads.push(observed);
            let hook = state.on_read.take();
            drop(state);
            // The hook runs without the mock's lock so it may re-enter the
            // engine, then is reinstalled.
            if let Some(mut hook) = hook {
                hook(&observed);
                let mut state = self.state.lock().unwrap();
                if state.on_read.is_none() {
                    state.on_read = Some(hook);
                }
            }
        }
        if let Some(fault) = self.take_fault(offset, skip_verify_disk_checksum) {
            match fault {
                PeerFault::BadChecksumAt { .. } => {
                    return Err(ReplicationError::BadChecksum {
                        offset,
                        expected: 0,
                        actual: 0,
                    });
                }
                PeerFault::IoErrorAt { .. } => {
                    return Err(ReplicationError::Io {
                        reason: format!("injected read failure at {offset}"),
                    });
                }
                PeerFault::ShortReadAt { serve, .. } => {
                    let start = offset.max(0) as usize;
                    let end = (start + serve).min(self.data.len());
                    let data = self.data[start.min(self.data.len())..end].to_vec();
                    let checksums = if self.with_checksums {
                        compute_block_checksums(&data)
                    } else {
                        Vec::new()
                    };
                    return Ok(PeerReadReply { data, checksums });
                }
            }
        }
        if offset < 0 || offset as usize > self.data.len() {
            return Err(ReplicationError::Invalid {
                reason: format!("read offset {offset} beyond chunk"),
            });
        }
        let start = offset as usize;
        let end = (start + num_bytes).min(self.data.len());
        let data = self.data[start..end].to_vec();
        let checksums = if self.with_checksums {
            compute_block_checksums(&data)
        } else {
            Vec::new()
        };
        Ok(PeerReadReply { data, checksums })
    }

    fn location(&self) -> ServerLocation {
        self.location.clone()
    }
}

/// Connector over a fixed set of [`MockPeer`]s.
#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<HashMap<ServerLocation, Arc<MockPeer>>>,
}

impl MockConnector {
    /// Creates an empty connector; unknown locations are unreachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer.
    pub fn add_peer(&self, peer: Arc<MockPeer>) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer.location(), peer);
    }
}

impl PeerConnector for MockConnector {
    fn connect(
        &self,
        location: &ServerLocation,
        _credentials: &PeerCredentials,
    ) -> ReplicationResult<Arc<dyn PeerReader>> {
        self.peers
            .lock()
            .unwrap()
            .get(location)
            .map(|p| p.clone() as Arc<dyn PeerReader>)
            .ok_or_else(|| ReplicationError::HostUnreachable {
                location: location.to_string(),
            })
    }
}
