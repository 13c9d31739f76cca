//! Protocol error types.
//!
//! [`ErrorKind`] is the wire-visible error taxonomy carried in `err`
//! envelopes.  [`ProtocolError`] is what encoding, decoding and payload
//! validation return inside this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error categories shared by both sides of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A buffer could not be allocated in sandbox memory.
    OutOfMemory,
    /// The op code is not part of the protocol.
    UnknownOperation,
    /// A payload field is missing or has the wrong shape.
    InvalidArgument,
    /// The host capability itself failed.
    HostError,
    /// The peer produced bytes that are not a valid envelope.
    MalformedResponse,
    /// A transaction is already open for this invocation.
    TransactionAlreadyOpen,
    /// The transaction handle is not the live one.
    InvalidTransactionHandle,
    /// A call was issued while another call was still in flight.
    Reentrancy,
}

impl ErrorKind {
    /// The snake_case wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out_of_memory",
            Self::UnknownOperation => "unknown_operation",
            Self::InvalidArgument => "invalid_argument",
            Self::HostError => "host_error",
            Self::MalformedResponse => "malformed_response",
            Self::TransactionAlreadyOpen => "transaction_already_open",
            Self::InvalidTransactionHandle => "invalid_transaction_handle",
            Self::Reentrancy => "reentrancy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while encoding, decoding or validating wire data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The integer does not name a declared op.
    #[error("unknown operation code: {0}")]
    UnknownOperation(u32),

    /// The string does not name a declared op.
    #[error("unknown operation name: {0}")]
    UnknownOperationName(String),

    /// A payload field failed validation.
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument {
        /// Name of the offending field (`$` for the payload as a whole).
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Bytes that do not form a valid request or response envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope was written for a protocol version this side does not speak.
    #[error("unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the envelope.
        found: u64,
        /// Version this build speaks.
        expected: u32,
    },

    /// A frame exceeds the configured size cap.
    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::InvalidArgument`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The wire kind this error reports as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownOperation(_) | Self::UnknownOperationName(_) => {
                ErrorKind::UnknownOperation
            }
            Self::InvalidArgument { .. } | Self::UnsupportedVersion { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Malformed(_) | Self::FrameTooLarge { .. } => ErrorKind::MalformedResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidTransactionHandle).unwrap();
        assert_eq!(json, "\"invalid_transaction_handle\"");
        let back: ErrorKind = serde_json::from_str("\"out_of_memory\"").unwrap();
        assert_eq!(back, ErrorKind::OutOfMemory);
    }

    #[test]
    fn as_str_matches_serde() {
        for kind in [
            ErrorKind::OutOfMemory,
            ErrorKind::UnknownOperation,
            ErrorKind::InvalidArgument,
            ErrorKind::HostError,
            ErrorKind::MalformedResponse,
            ErrorKind::TransactionAlreadyOpen,
            ErrorKind::InvalidTransactionHandle,
            ErrorKind::Reentrancy,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_owned()));
        }
    }

    #[test]
    fn invalid_argument_display() {
        let err = ProtocolError::invalid("key", "must not be empty");
        assert_eq!(err.to_string(), "invalid argument `key`: must not be empty");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_operation_kind() {
        assert_eq!(
            ProtocolError::UnknownOperation(99).kind(),
            ErrorKind::UnknownOperation
        );
    }
}
