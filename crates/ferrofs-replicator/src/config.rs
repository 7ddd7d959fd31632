//! Layout constants and tunable parameters.
//!
//! Parameters arrive from the chunk server's property file as dotted string
//! keys; [`ReplicatorConfig::apply_properties`] and
//! [`RsReaderConfig::apply_properties`] recognize the documented keys and
//! leave everything else untouched, so repeated application is idempotent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::checksum::CHECKSUM_BLOCK_SIZE;

/// Fixed chunk size: every chunk holds at most this many bytes.
pub const CHUNK_SIZE: i64 = 64 * 1024 * 1024;

/// Smallest stripe size accepted for Reed-Solomon recovery.
pub const MIN_STRIPE_SIZE: i32 = 4 * 1024;

/// Largest stripe size accepted for Reed-Solomon recovery.
pub const MAX_STRIPE_SIZE: i32 = CHUNK_SIZE as i32;

/// Stripe sizes must be a multiple of this.
pub const STRIPE_ALIGNMENT: i32 = 4 * 1024;

/// Granule of the I/O buffer pool; read sizes are multiples of it.
pub const IO_BUFFER_SIZE: usize = 4 * 1024;

/// Default per-iteration read size, rounded up to a checksum block multiple.
pub const DEFAULT_READ_SIZE: usize =
    (1024 * 1024 + CHECKSUM_BLOCK_SIZE - 1) / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE;

/// Floor for buffer admission requests; covers the chunk header I/O.
pub const MIN_ADMISSION_BYTES: u64 = 16 * 1024;

/// String key/value parameters as delivered by the chunk server.
pub type Properties = HashMap<String, String>;

fn get_bool(props: &Properties, key: &str, default: bool) -> bool {
    match props.get(key) {
        Some(v) => v.trim() != "0",
        None => default,
    }
}

fn get_u32(props: &Properties, key: &str, default: u32) -> u32 {
    props
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn get_u64(props: &Properties, key: &str, default: u64) -> u64 {
    props
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Direct replication parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Share peer connections across replications of the same source.
    pub use_connection_pool: bool,
    /// Omit the disk checksum verify on source reads; one retry re-enables it.
    pub read_skip_disk_verify: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            use_connection_pool: false,
            read_skip_disk_verify: true,
        }
    }
}

impl ReplicatorConfig {
    /// Applies the recognized `chunkServer.replicator.*` keys.
    ///
    /// The connection pool key spelling is historical and kept for
    /// compatibility with deployed property files.
    pub fn apply_properties(&mut self, props: &Properties) {
        self.use_connection_pool = get_bool(
            props,
            "chunkServer.replicator.useConnetionPool",
            self.use_connection_pool,
        );
        self.read_skip_disk_verify = get_bool(
            props,
            "chunkServer.replicator.readSkipDiskVerify",
            self.read_skip_disk_verify,
        );
    }
}

/// Metadata-service client parameters used by the recovery reader pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaClientConfig {
    /// Retries per metadata op.
    pub max_retry_count: u32,
    /// Seconds between metadata op retries.
    pub time_sec_between_retries: u32,
    /// Per-op timeout in seconds.
    pub op_timeout_sec: u32,
    /// Connection idle timeout in seconds.
    pub idle_timeout_sec: u32,
    /// Drop and re-establish the connection when an op times out.
    pub reset_connection_on_op_timeout: bool,
}

impl Default for MetaClientConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 2,
            time_sec_between_retries: 10,
            op_timeout_sec: 4 * 60,
            idle_timeout_sec: 5 * 60,
            reset_connection_on_op_timeout: true,
        }
    }
}

/// Reed-Solomon recovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsReaderConfig {
    /// Reader retries per op.
    pub max_retry_count: u32,
    /// Seconds between reader retries.
    pub time_sec_between_retries: u32,
    /// Reader per-op timeout in seconds.
    pub op_timeout_sec: u32,
    /// Reader idle timeout in seconds.
    pub idle_timeout_sec: u32,
    /// Read size ceiling in bytes; rounded up to a checksum block multiple.
    pub max_read_size: usize,
    /// Per-chunk read size cap; never below `max_read_size`.
    pub max_chunk_read_size: usize,
    /// Lease retry window in seconds.
    pub lease_retry_timeout: u32,
    /// Lease wait timeout in seconds.
    pub lease_wait_timeout: u32,
    /// Metadata client parameters for the recovery pools.
    pub meta: MetaClientConfig,
    /// Hard cap on bytes admitted from the reader for one chunk.
    pub max_recover_chunk_size: i64,
    /// Upper bound on recovery client threads.
    pub max_recovery_threads: usize,
    /// Abort the process when an invalid stripe is detected.
    pub panic_on_invalid_chunk: bool,
}

impl Default for RsReaderConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            time_sec_between_retries: 10,
            op_timeout_sec: 30,
            idle_timeout_sec: 5 * 30,
            max_read_size: DEFAULT_READ_SIZE,
            max_chunk_read_size: DEFAULT_READ_SIZE.max(1024 * 1024),
            lease_retry_timeout: 3,
            lease_wait_timeout: 30,
            meta: MetaClientConfig::default(),
            max_recover_chunk_size: CHUNK_SIZE,
            max_recovery_threads: 16,
            panic_on_invalid_chunk: false,
        }
    }
}

impl RsReaderConfig {
    /// Applies the recognized `chunkServer.rsReader.*` keys.
    ///
    /// The meta idle timeout and the reset-on-op-timeout flag are separate
    /// keys here; older property files that set the flag through
    /// `meta.idleTimeoutSec` must migrate to
    /// `meta.resetConnectionOnOpTimeout`.
    pub fn apply_properties(&mut self, props: &Properties) {
        self.max_retry_count = get_u32(
            props,
            "chunkServer.rsReader.maxRetryCount",
            self.max_retry_count,
        );
        self.time_sec_between_retries = get_u32(
            props,
            "chunkServer.rsReader.timeSecBetweenRetries",
            self.time_sec_between_retries,
        );
        self.op_timeout_sec = get_u32(
            props,
            "chunkServer.rsReader.opTimeoutSec",
            self.op_timeout_sec,
        );
        self.idle_timeout_sec = get_u32(
            props,
            "chunkServer.rsReader.idleTimeoutSec",
            self.idle_timeout_sec,
        );
        let raw_read_size = get_u64(
            props,
            "chunkServer.rsReader.maxReadSize",
            self.max_read_size as u64,
        )
        .max(1) as usize;
        self.max_read_size = raw_read_size.div_ceil(CHECKSUM_BLOCK_SIZE) * CHECKSUM_BLOCK_SIZE;
        self.max_chunk_read_size = get_u64(
            props,
            "chunkServer.rsReader.maxChunkReadSize",
            self.max_read_size.max(self.max_chunk_read_size) as u64,
        ) as usize;
        self.lease_retry_timeout = get_u32(
            props,
            "chunkServer.rsReader.leaseRetryTimeout",
            self.lease_retry_timeout,
        );
        self.lease_wait_timeout = get_u32(
            props,
            "chunkServer.rsReader.leaseWaitTimeout",
            self.lease_wait_timeout,
        );
        self.meta.max_retry_count = get_u32(
            props,
            "chunkServer.rsReader.meta.maxRetryCount",
            self.meta.max_retry_count,
        );
        self.meta.time_sec_between_retries = get_u32(
            props,
            "chunkServer.rsReader.meta.timeSecBetweenRetries",
            self.meta.time_sec_between_retries,
        );
        self.meta.op_timeout_sec = get_u32(
            props,
            "chunkServer.rsReader.meta.opTimeoutSec",
            self.meta.op_timeout_sec,
        );
        self.meta.idle_timeout_sec = get_u32(
            props,
            "chunkServer.rsReader.meta.idleTimeoutSec",
            self.meta.idle_timeout_sec,
        );
        self.meta.reset_connection_on_op_timeout = get_bool(
            props,
            "chunkServer.rsReader.meta.resetConnectionOnOpTimeout",
            self.meta.reset_connection_on_op_timeout,
        );
        self.max_recover_chunk_size = get_u64(
            props,
            "chunkServer.rsReader.maxRecoverChunkSize",
            self.max_recover_chunk_size as u64,
        ) as i64;
        self.max_recovery_threads = get_u64(
            props,
            "chunkServer.rsReader.maxRecoveryThreads",
            self.max_recovery_threads as u64,
        ) as usize;
        self.panic_on_invalid_chunk = get_bool(
            props,
            "chunkServer.rsReader.panicOnInvalidChunk",
            self.panic_on_invalid_chunk,
        );
    }
}

/// Key prefix for the recovery metadata-client PSK parameters.
pub const RS_READ_META_AUTH_PREFIX: &str = "chunkServer.rsReadMetaAuth.";
