//! ferrofs chunk replication and recovery engine.
//!
//! The metadata service instructs a chunk server to obtain a copy of a
//! chunk, either byte-for-byte from a source peer (direct replication) or
//! by reconstructing it from the surviving members of its Reed-Solomon
//! stripe group (recovery). Both modes stream the chunk into a version-0
//! staging file, validate per-block checksums, finalize at the chosen
//! version, and report completion. A new request for a chunk pre-empts any
//! replication already in flight for it.

pub mod admission;
pub mod checksum;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod op;
pub mod peer;
pub mod registry;
pub mod replicator;
pub mod rs_reader;
pub mod rs_replicator;
pub mod store;

pub use admission::{AdmissionClient, AdmissionOutcome, BufferAdmission, BufferPool, GrantCallback};
pub use checksum::{block_count, compute_block_checksums, crc32c, CHECKSUM_BLOCK_SIZE};
pub use config::{
    Properties, ReplicatorConfig, RsReaderConfig, CHUNK_SIZE, DEFAULT_READ_SIZE, MAX_STRIPE_SIZE,
    MIN_STRIPE_SIZE, STRIPE_ALIGNMENT,
};
pub use counters::{CountersSnapshot, ReplicatorCounters};
pub use engine::ReplicationEngine;
pub use error::{ReplicationError, ReplicationResult};
pub use op::{
    parse_access_header, AccessCredentials, ChunkId, ChunkVersion, CollectingSink, FileId,
    ReplicateChunkOp, ResponseSink, ServerLocation, StriperType,
};
pub use peer::{
    ChunkMeta, MockConnector, MockPeer, ObservedRead, PeerConnector, PeerCredentials, PeerFault,
    PeerPool, PeerReadReply, PeerReader,
};
pub use registry::{CancelTarget, Registration, ReplicatorRegistry};
pub use replicator::{ReplicationContext, ReplicationMode, Replicator};
pub use rs_reader::{
    decode_invalid_stripes, encode_invalid_stripes, format_invalid_stripes, InvalidStripe,
    MockStripeReader, StripeReadOutcome, StripeReader, StripeReaderParams,
};
pub use rs_replicator::{
    AuthParamsBlock, MetaClient, MetaClientSlot, MockStripeReaderFactory, RecoveryClients,
    RsReplicator, StripeReaderFactory,
};
pub use store::{AllocateRequest, ChunkStore, FileHandle, InMemoryChunkStore, WriteRecord};
