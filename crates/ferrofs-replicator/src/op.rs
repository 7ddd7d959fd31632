//! Replication request and response surface.

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, ReplicationResult};

/// File identifier as assigned by the metadata service.
pub type FileId = i64;
/// Chunk identifier as assigned by the metadata service.
pub type ChunkId = i64;
/// Chunk version; staging files carry version 0 until finalize.
pub type ChunkVersion = i64;

/// A network endpoint.
///
/// In direct mode this addresses the source peer. In recovery mode the host
/// is unset and only the port is meaningful: it selects the metadata-service
/// port the striped reader connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ServerLocation {
    /// Host name or address; empty means unset.
    pub host: String,
    /// Port; zero or negative means unset.
    pub port: i32,
}

impl ServerLocation {
    /// Creates a location from host and port.
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// A location is valid when both host and port are set.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }
}

impl std::fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.is_empty() {
            write!(f, "none:{}", self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// File striping layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StriperType {
    /// Plain, non-striped file.
    #[default]
    None,
    /// Reed-Solomon striped file.
    Rs,
}

/// A replication request from the metadata service, including the mutable
/// result fields reported back on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateChunkOp {
    /// File the chunk belongs to.
    pub file_id: FileId,
    /// Chunk to obtain.
    pub chunk_id: ChunkId,
    /// Version expected at the source; updated to the finalized version on
    /// success and to -1 on any other exit.
    pub chunk_version: ChunkVersion,
    /// Version the finalized replica must carry; negative means "use the
    /// source's version".
    pub target_version: ChunkVersion,
    /// Source peer (direct mode) or metadata port carrier (recovery mode).
    pub location: ServerLocation,
    /// Byte offset of this chunk inside the logical file; recovery only,
    /// must be a multiple of the chunk size.
    pub chunk_offset: i64,
    /// Striping layout; recovery requires [`StriperType::Rs`].
    pub striper_type: StriperType,
    /// Data stripes in the RS group.
    pub num_stripes: i32,
    /// Parity stripes in the RS group.
    pub num_recovery_stripes: i32,
    /// Stripe size in bytes.
    pub stripe_size: i32,
    /// Logical file size; used by the striped reader and by the
    /// panic-on-invalid-chunk policy.
    pub file_size: i64,
    /// File path name handed to the striped reader.
    pub path_name: String,
    /// Minimum storage tier for the staging allocation.
    pub min_storage_tier: u8,
    /// Whether clear-text peer transport is acceptable.
    pub allow_clear_text: bool,
    /// Whitespace-separated access token and session key; both empty or
    /// both present.
    pub chunk_server_access: String,
    /// Completion status; zero on success, a negative code otherwise.
    pub status: i32,
    /// Short human-readable completion message.
    pub status_msg: String,
    /// Space-separated `idx chunkId version` triples identifying invalid
    /// stripes detected during recovery.
    pub invalid_stripe_idx: String,
}

impl ReplicateChunkOp {
    /// A minimal request for the given chunk; callers fill in mode-specific
    /// fields.
    pub fn new(file_id: FileId, chunk_id: ChunkId, chunk_version: ChunkVersion) -> Self {
        Self {
            file_id,
            chunk_id,
            chunk_version,
            target_version: -1,
            location: ServerLocation::default(),
            chunk_offset: 0,
            striper_type: StriperType::None,
            num_stripes: 0,
            num_recovery_stripes: 0,
            stripe_size: 0,
            file_size: -1,
            path_name: String::new(),
            min_storage_tier: 0,
            allow_clear_text: false,
            chunk_server_access: String::new(),
            status: 0,
            status_msg: String::new(),
            invalid_stripe_idx: String::new(),
        }
    }

    /// Direct replication when the location names a reachable peer.
    pub fn is_direct(&self) -> bool {
        self.location.is_valid()
    }

    /// The version the finalized replica must carry: the explicit target
    /// when set, otherwise the version learned from the source.
    pub fn effective_target_version(&self) -> ChunkVersion {
        if self.target_version >= 0 {
            self.target_version
        } else {
            self.chunk_version
        }
    }

    /// Records a failure on the result fields.
    pub fn fail(&mut self, err: &ReplicationError) {
        self.status = err.status_code();
        if self.status_msg.is_empty() {
            self.status_msg = err.to_string();
        }
        self.chunk_version = -1;
    }
}

/// Access token and session key extracted from a request header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessCredentials {
    /// Delegation token; empty when the cluster runs without auth.
    pub token: String,
    /// Session key matching the token.
    pub key: String,
}

impl AccessCredentials {
    /// True when both token and key are present.
    pub fn is_auth(&self) -> bool {
        !self.token.is_empty() && !self.key.is_empty()
    }
}

/// Parses the chunk access header into `(token, key)`.
///
/// The header carries two whitespace-separated ASCII tokens; any trailing
/// content is ignored. A token without a key, or a key without a token,
/// is malformed.
pub fn parse_access_header(header: &str) -> ReplicationResult<AccessCredentials> {
    let mut fields = header.split_ascii_whitespace();
    let token = fields.next().unwrap_or("").to_string();
    let key = fields.next().unwrap_or("").to_string();
    if token.is_empty() != key.is_empty() {
        return Err(ReplicationError::Invalid {
            reason: "malformed chunk access header value".to_string(),
        });
    }
    Ok(AccessCredentials { token, key })
}

/// Receives completed ops; the metadata-server session implements this.
pub trait ResponseSink: Send + Sync {
    /// Delivers the op with its mutated result fields.
    fn submit(&self, op: ReplicateChunkOp);
}

/// A sink that records submitted ops, for tests and draining shutdowns.
#[derive(Default)]
pub struct CollectingSink {
    ops: std::sync::Mutex<Vec<ReplicateChunkOp>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything submitted so far.
    pub fn drain(&self) -> Vec<ReplicateChunkOp> {
        std::mem::take(&mut self.ops.lock().unwrap())
    }

    /// Number of ops submitted so far.
    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// True when nothing has been submitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseSink for CollectingSink {
    fn submit(&self, op: ReplicateChunkOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_validity() {
        assert!(ServerLocation::new("peer1", 20000).is_valid());
        assert!(!ServerLocation::new("", 20000).is_valid());
        assert!(!ServerLocation::new("peer1", 0).is_valid());
        assert!(!ServerLocation::new("peer1", -1).is_valid());
    }

    #[test]
    fn test_location_display() {
        assert_eq!(ServerLocation::new("peer1", 20000).to_string(), "peer1:20000");
        assert_eq!(ServerLocation::new("", 30000).to_string(), "none:30000");
    }

    #[test]
    fn test_effective_target_version() {
        let mut op = ReplicateChunkOp::new(1, 2, 7);
        assert_eq!(op.effective_target_version(), 7);
        op.target_version = 42;
        assert_eq!(op.effective_target_version(), 42);
    }

    #[test]
    fn test_parse_access_header_both_present() {
        let creds = parse_access_header("  tok1   key1  ").unwrap();
        assert_eq!(creds.token, "tok1");
        assert_eq!(creds.key, "key1");
        assert!(creds.is_auth());
    }

    #[test]
    fn test_parse_access_header_empty() {
        let creds = parse_access_header("").unwrap();
        assert!(!creds.is_auth());
        let creds = parse_access_header("   \t ").unwrap();
        assert!(!creds.is_auth());
    }

    #[test]
    fn test_parse_access_header_malformed() {
        let err = parse_access_header("only-token").unwrap_err();
        assert!(matches!(err, ReplicationError::Invalid { .. }));
    }

    #[test]
    fn test_parse_access_header_ignores_trailing() {
        let creds = parse_access_header("t k extra junk").unwrap();
        assert_eq!(creds.token, "t");
        assert_eq!(creds.key, "k");
    }

    #[test]
    fn test_fail_sets_result_fields() {
        let mut op = ReplicateChunkOp::new(1, 2, 3);
        op.fail(&ReplicationError::Cancelled);
        assert_eq!(op.status, -125);
        assert_eq!(op.chunk_version, -1);
        assert!(!op.status_msg.is_empty());
    }

    #[test]
    fn test_fail_keeps_existing_message() {
        let mut op = ReplicateChunkOp::new(1, 2, 3);
        op.status_msg = "readable chunk with target version already exists".to_string();
        op.fail(&ReplicationError::AlreadyExists {
            chunk_id: 2,
            version: 3,
        });
        assert_eq!(
            op.status_msg,
            "readable chunk with target version already exists"
        );
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        assert!(sink.is_empty());
        sink.submit(ReplicateChunkOp::new(1, 2, 3));
        assert_eq!(sink.len(), 1);
        let ops = sink.drain();
        assert_eq!(ops[0].chunk_id, 2);
        assert!(sink.is_empty());
    }
}
