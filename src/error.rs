use thiserror::Error;

use crate::gsn::Gsn;

/// Crate-wide error type.
///
/// Mirrors the flat, many-variant error enum style used throughout the
/// database core this crate was split out of: one variant per failure
/// kind, string payloads for anything that doesn't need structured data.
#[derive(Error, Debug)]
pub enum RepError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("writeset protocol version {0} is not supported")]
    ProtocolVersionUnsupported(i32),

    #[error("checksum mismatch recovering buffer at gsn {gsn}")]
    ChecksumMismatch { gsn: Gsn },

    #[error("certification conflict on key touched at gsn {conflicting_gsn}")]
    CertificationConflict { conflicting_gsn: Gsn },

    #[error("gcache out of space: requested {requested} bytes")]
    OutOfSpace { requested: usize },

    #[error("monitor entry for gsn {0} was canceled")]
    Interrupted(Gsn),

    #[error("replica state is inconsistent: {0}")]
    InconsistentState(String),

    #[error("invalid transaction state transition: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("group communication error: {0}")]
    GroupComm(String),

    #[error("apply callback failed: {0}")]
    Apply(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for RepError {
    fn clone(&self) -> Self {
        match self {
            RepError::Io(e) => RepError::Internal(format!("io error: {e}")),
            RepError::Serialization(s) => RepError::Serialization(s.clone()),
            RepError::ProtocolVersionUnsupported(v) => RepError::ProtocolVersionUnsupported(*v),
            RepError::ChecksumMismatch { gsn } => RepError::ChecksumMismatch { gsn: *gsn },
            RepError::CertificationConflict { conflicting_gsn } => {
                RepError::CertificationConflict { conflicting_gsn: *conflicting_gsn }
            }
            RepError::OutOfSpace { requested } => RepError::OutOfSpace { requested: *requested },
            RepError::Interrupted(gsn) => RepError::Interrupted(*gsn),
            RepError::InconsistentState(s) => RepError::InconsistentState(s.clone()),
            RepError::InvalidState(s) => RepError::InvalidState(s.clone()),
            RepError::NotFound(s) => RepError::NotFound(s.clone()),
            RepError::Configuration(s) => RepError::Configuration(s.clone()),
            RepError::Timeout(s) => RepError::Timeout(s.clone()),
            RepError::GroupComm(s) => RepError::GroupComm(s.clone()),
            RepError::Apply(s) => RepError::Apply(s.clone()),
            RepError::Internal(s) => RepError::Internal(s.clone()),
        }
    }
}

impl From<bincode::error::EncodeError> for RepError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RepError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RepError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RepError::Serialization(e.to_string())
    }
}

impl RepError {
    /// True for the errors §7 of the design classifies as recoverable: the
    /// transaction FSM absorbs these into an ordinary rollback rather than
    /// tearing down the replicator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RepError::CertificationConflict { .. }
                | RepError::Interrupted(_)
                | RepError::OutOfSpace { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RepError>;
