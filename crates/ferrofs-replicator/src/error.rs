//! Error types for the replication subsystem.

use thiserror::Error;

/// Result type alias for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Error variants for chunk replication and recovery.
///
/// Every variant maps to a stable negative status code because completion is
/// reported to the metadata server as a numeric status on the op; `0` means
/// success. Invariant violations are not represented here: those abort the
/// process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    /// Malformed request, size out of range, misaligned offset, or a
    /// parsing failure.
    #[error("invalid: {reason}")]
    Invalid {
        /// Description of the validation failure.
        reason: String,
    },

    /// The requested chunk does not exist.
    #[error("chunk not found: {chunk_id}")]
    NotFound {
        /// The chunk that was not found.
        chunk_id: i64,
    },

    /// A readable chunk already exists at the target version.
    #[error("chunk {chunk_id} already exists at version {version}")]
    AlreadyExists {
        /// The chunk in question.
        chunk_id: i64,
        /// The conflicting version.
        version: i64,
    },

    /// Buffer admission refused the reservation.
    #[error("out of memory: {requested} bytes requested, quota {quota}")]
    OutOfMemory {
        /// Bytes requested from the buffer pool.
        requested: u64,
        /// The per-client quota that was exceeded.
        quota: u64,
    },

    /// A session to the peer could not be established.
    #[error("host unreachable: {location}")]
    HostUnreachable {
        /// The peer location that could not be reached.
        location: String,
    },

    /// An RPC op timeout or idle timeout expired.
    #[error("timeout: {what}")]
    Timeout {
        /// What timed out.
        what: String,
    },

    /// Source-side verification failure; subject to one disk-verify retry.
    #[error("bad checksum at offset {offset}: expected {expected:#x}, actual {actual:#x}")]
    BadChecksum {
        /// Offset of the failing block.
        offset: i64,
        /// The expected checksum value.
        expected: u32,
        /// The recomputed checksum value.
        actual: u32,
    },

    /// Store or peer I/O failure.
    #[error("I/O error: {reason}")]
    Io {
        /// Description of the failure.
        reason: String,
    },

    /// Pre-empted, operator cancel, or shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl ReplicationError {
    /// The stable negative status code reported on the op.
    pub fn status_code(&self) -> i32 {
        match self {
            ReplicationError::Invalid { .. } => -22,
            ReplicationError::NotFound { .. } => -2,
            ReplicationError::AlreadyExists { .. } => -17,
            ReplicationError::OutOfMemory { .. } => -12,
            ReplicationError::HostUnreachable { .. } => -113,
            ReplicationError::Timeout { .. } => -110,
            ReplicationError::BadChecksum { .. } => -74,
            ReplicationError::Io { .. } => -5,
            ReplicationError::Cancelled => -125,
        }
    }

    /// Reconstructs an error kind from a wire status code.
    ///
    /// Used when a collaborator reports completion by numeric status, as the
    /// striped reader does. Unknown negative codes map to [`ReplicationError::Io`].
    pub fn from_status(code: i32) -> ReplicationError {
        match code {
            -22 => ReplicationError::Invalid {
                reason: "invalid request".to_string(),
            },
            -2 => ReplicationError::NotFound { chunk_id: -1 },
            -17 => ReplicationError::AlreadyExists {
                chunk_id: -1,
                version: -1,
            },
            -12 => ReplicationError::OutOfMemory {
                requested: 0,
                quota: 0,
            },
            -113 => ReplicationError::HostUnreachable {
                location: String::new(),
            },
            -110 => ReplicationError::Timeout {
                what: "op".to_string(),
            },
            -74 => ReplicationError::BadChecksum {
                offset: -1,
                expected: 0,
                actual: 0,
            },
            -125 => ReplicationError::Cancelled,
            other => ReplicationError::Io {
                reason: format!("status {other}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative() {
        let errors = [
            ReplicationError::Invalid {
                reason: "x".to_string(),
            },
            ReplicationError::NotFound { chunk_id: 1 },
            ReplicationError::AlreadyExists {
                chunk_id: 1,
                version: 2,
            },
            ReplicationError::OutOfMemory {
                requested: 1,
                quota: 1,
            },
            ReplicationError::HostUnreachable {
                location: "h:1".to_string(),
            },
            ReplicationError::Timeout {
                what: "op".to_string(),
            },
            ReplicationError::BadChecksum {
                offset: 0,
                expected: 1,
                actual: 2,
            },
            ReplicationError::Io {
                reason: "x".to_string(),
            },
            ReplicationError::Cancelled,
        ];
        for e in errors {
            assert!(e.status_code() < 0, "{e} has non-negative code");
        }
    }

    #[test]
    fn test_status_codes_are_distinct() {
        use std::collections::HashSet;
        let codes: HashSet<i32> = [
            ReplicationError::Invalid {
                reason: String::new(),
            }
            .status_code(),
            ReplicationError::NotFound { chunk_id: 0 }.status_code(),
            ReplicationError::AlreadyExists {
                chunk_id: 0,
                version: 0,
            }
            .status_code(),
            ReplicationError::OutOfMemory {
                requested: 0,
                quota: 0,
            }
            .status_code(),
            ReplicationError::HostUnreachable {
                location: String::new(),
            }
            .status_code(),
            ReplicationError::Timeout {
                what: String::new(),
            }
            .status_code(),
            ReplicationError::BadChecksum {
                offset: 0,
                expected: 0,
                actual: 0,
            }
            .status_code(),
            ReplicationError::Io {
                reason: String::new(),
            }
            .status_code(),
            ReplicationError::Cancelled.status_code(),
        ]
        .into_iter()
        .collect();
        assert_eq!(codes.len(), 9);
    }

    #[test]
    fn test_from_status_round_trip() {
        for code in [-22, -2, -17, -12, -113, -110, -74, -125] {
            assert_eq!(ReplicationError::from_status(code).status_code(), code);
        }
    }

    #[test]
    fn test_from_status_unknown_maps_to_io() {
        let e = ReplicationError::from_status(-9999);
        assert!(matches!(e, ReplicationError::Io { .. }));
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(ReplicationError::Cancelled.to_string(), "cancelled");
    }
}
