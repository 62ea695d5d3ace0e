//! Error types for Meridian
//!
//! This module defines the common error taxonomy used by every component.
//! Caller-facing variants carry the node's role and last applied sequence so
//! clients can retry or redirect without another round trip.

use crate::types::{ClusterRole, Epoch, NodeEndpoint, SequenceId};
use std::fmt;
use thiserror::Error;

/// Common result type for Meridian operations
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of divergence a [`Error::Consistency`] reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyKind {
    /// Sequence ids are not contiguous
    SequenceGap { expected: SequenceId, found: SequenceId },
    /// Stored checksum does not match the record contents
    ChecksumMismatch,
    /// Record or payload could not be decoded
    Malformed(String),
    /// The operation code is not known to this build
    UnknownOpCode(u32),
    /// The entry failed validation against the current state
    ApplyFailed { op_code: u32, reason: String },
    /// The local copy of an entry differs from the leader's
    Diverged,
}

impl fmt::Display for ConsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {expected}, found {found}")
            }
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
            Self::Malformed(msg) => write!(f, "malformed record: {msg}"),
            Self::UnknownOpCode(code) => write!(f, "unknown operation code {code}"),
            Self::ApplyFailed { op_code, reason } => {
                write!(f, "apply of operation {op_code} failed: {reason}")
            }
            Self::Diverged => f.write_str("local history diverges from the leader"),
        }
    }
}

/// Common error type for Meridian
#[derive(Debug, Error)]
pub enum Error {
    // Journal errors
    #[error("durability failure at sequence {sequence}: {reason}")]
    Durability { sequence: SequenceId, reason: String },

    #[error("consistency violation at sequence {sequence}: {kind}")]
    Consistency {
        sequence: SequenceId,
        kind: ConsistencyKind,
    },

    #[error("append fenced: epoch {epoch} is older than journal fence {fence}")]
    Fenced { epoch: Epoch, fence: Epoch },

    #[error("journal truncated: first available sequence is {first_available}")]
    JournalTruncated { first_available: SequenceId },

    // Role errors
    #[error(
        "not leader (role {role}, last applied {last_applied}), current leader: {}",
        .leader.as_ref().map_or_else(|| "unknown".to_string(), ToString::to_string)
    )]
    NotLeader {
        role: ClusterRole,
        leader: Option<NodeEndpoint>,
        last_applied: SequenceId,
    },

    #[error("invalid role transition from {from} to {to}")]
    InvalidTransition { from: ClusterRole, to: ClusterRole },

    #[error("node halted: {0}")]
    Halted(String),

    // Request errors
    #[error(
        "request {request_id} timed out after {waited_ms} ms (role {role}, last applied {last_applied})"
    )]
    Timeout {
        request_id: String,
        waited_ms: u64,
        role: ClusterRole,
        last_applied: SequenceId,
    },

    #[error("lock on {region} not acquired within {waited_ms} ms")]
    LockTimeout { region: String, waited_ms: u64 },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // Checkpoint errors
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("image format version {found} is newer than supported version {supported}")]
    VersionSkew { found: u16, supported: u16 },

    // Transport errors
    #[error("replication source unavailable: {0}")]
    Unavailable(String),

    // Internal errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a durability error
    pub fn durability(sequence: SequenceId, reason: impl fmt::Display) -> Self {
        Self::Durability {
            sequence,
            reason: reason.to_string(),
        }
    }

    /// Create a consistency error
    #[must_use]
    pub const fn consistency(sequence: SequenceId, kind: ConsistencyKind) -> Self {
        Self::Consistency { sequence, kind }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. }
                | Self::Timeout { .. }
                | Self::LockTimeout { .. }
                | Self::Unavailable(_)
                | Self::Checkpoint(_)
        )
    }

    /// Check if this error means local state can no longer be trusted
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Consistency { .. } | Self::Halted(_))
    }

    /// Check if a leader hitting this error must give up leadership
    #[must_use]
    pub const fn requires_step_down(&self) -> bool {
        matches!(
            self,
            Self::Durability { .. } | Self::Fenced { .. } | Self::Io(_)
        )
    }

    /// Sequence id the error refers to, if any
    #[must_use]
    pub const fn sequence(&self) -> Option<SequenceId> {
        match self {
            Self::Durability { sequence, .. } | Self::Consistency { sequence, .. } => {
                Some(*sequence)
            }
            Self::NotLeader { last_applied, .. } | Self::Timeout { last_applied, .. } => {
                Some(*last_applied)
            }
            _ => None,
        }
    }

    /// Get HTTP status code for the node API
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidOperation(_) | Self::InvalidTransition { .. } => 400,

            // 409 Conflict
            Self::Fenced { .. } => 409,

            // 410 Gone
            Self::JournalTruncated { .. } => 410,

            // 421 Misdirected Request
            Self::NotLeader { .. } => 421,

            // 423 Locked
            Self::LockTimeout { .. } => 423,

            // 500 Internal Server Error
            Self::Durability { .. }
            | Self::Consistency { .. }
            | Self::Checkpoint(_)
            | Self::VersionSkew { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,

            // 503 Service Unavailable
            Self::Halted(_) | Self::Unavailable(_) => 503,

            // 504 Gateway Timeout
            Self::Timeout { .. } => 504,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
