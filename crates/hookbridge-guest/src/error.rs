//! Sandbox-side error types.
//!
//! Every failure a sandboxed script can observe from a host call surfaces as
//! a [`BridgeError`].  The variant is the error kind; the `Display` output is
//! `"<kind>: <message>"` so a thrown script exception carries both.

use hookbridge_protocol::{ErrorBody, ErrorKind, HostResponse, OpCode, ProtocolError};

/// Typed failure of a host call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// A buffer could not be allocated in linear memory.
    #[error("out_of_memory: {0}")]
    OutOfMemory(String),

    /// The op code is not declared.
    #[error("unknown_operation: op code {0} is not declared")]
    UnknownOperation(u32),

    /// A payload field failed validation.
    #[error("invalid_argument: `{field}` {reason}")]
    InvalidArgument {
        /// Offending field (`$` for the payload as a whole).
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The host capability failed.
    #[error("host_error: {0}")]
    HostError(String),

    /// The host returned bytes that are not a valid response envelope.
    #[error("malformed_response: {0}")]
    MalformedResponse(String),

    /// `begin` was called while a transaction is live.
    #[error("transaction_already_open: {0}")]
    TransactionAlreadyOpen(String),

    /// The handle is not the live transaction (or none is open).
    #[error("invalid_transaction_handle: {0}")]
    InvalidTransactionHandle(String),

    /// A call was issued while another one was in flight.
    #[error("reentrancy: {0}")]
    Reentrancy(String),
}

/// Convenience alias used throughout the guest crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Shorthand for [`BridgeError::InvalidArgument`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The wire kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::HostError(_) => ErrorKind::HostError,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::TransactionAlreadyOpen(_) => ErrorKind::TransactionAlreadyOpen,
            Self::InvalidTransactionHandle(_) => ErrorKind::InvalidTransactionHandle,
            Self::Reentrancy(_) => ErrorKind::Reentrancy,
        }
    }

    /// Rebuild a typed error from a host `err` envelope.
    pub fn from_error_body(op: OpCode, body: ErrorBody) -> Self {
        let ErrorBody {
            kind,
            message,
            field,
        } = body;
        match kind {
            ErrorKind::OutOfMemory => Self::OutOfMemory(message),
            ErrorKind::UnknownOperation => Self::UnknownOperation(op.code()),
            ErrorKind::InvalidArgument => Self::InvalidArgument {
                field: field.unwrap_or_else(|| "$".to_owned()),
                reason: message,
            },
            ErrorKind::HostError => Self::HostError(message),
            ErrorKind::MalformedResponse => Self::MalformedResponse(message),
            ErrorKind::TransactionAlreadyOpen => Self::TransactionAlreadyOpen(message),
            ErrorKind::InvalidTransactionHandle => Self::InvalidTransactionHandle(message),
            ErrorKind::Reentrancy => Self::Reentrancy(message),
        }
    }

    /// Encode as an `err` envelope, e.g. to report a failed hook to the host.
    pub fn to_response(&self) -> HostResponse {
        match self {
            Self::InvalidArgument { field, reason } => {
                HostResponse::invalid_argument(field.clone(), reason.clone())
            }
            other => HostResponse::error(other.kind(), other.message()),
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            Self::UnknownOperation(code) => format!("op code {code} is not declared"),
            Self::InvalidArgument { field, reason } => format!("`{field}` {reason}"),
            Self::OutOfMemory(m)
            | Self::HostError(m)
            | Self::MalformedResponse(m)
            | Self::TransactionAlreadyOpen(m)
            | Self::InvalidTransactionHandle(m)
            | Self::Reentrancy(m) => m.clone(),
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownOperation(code) => Self::UnknownOperation(code),
            ProtocolError::UnknownOperationName(name) => {
                Self::invalid("op", format!("unknown operation `{name}`"))
            }
            ProtocolError::InvalidArgument { field, reason } => {
                Self::InvalidArgument { field, reason }
            }
            other @ (ProtocolError::Malformed(_)
            | ProtocolError::UnsupportedVersion { .. }
            | ProtocolError::FrameTooLarge { .. }) => Self::MalformedResponse(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let err = BridgeError::HostError("database is locked".into());
        assert_eq!(err.to_string(), "host_error: database is locked");
        assert_eq!(err.kind(), ErrorKind::HostError);
    }

    #[test]
    fn invalid_argument_from_body_keeps_field() {
        let body = ErrorBody {
            kind: ErrorKind::InvalidArgument,
            message: "is required".into(),
            field: Some("key".into()),
        };
        let err = BridgeError::from_error_body(OpCode::KvGet, body);
        assert_eq!(err, BridgeError::invalid("key", "is required"));
    }

    #[test]
    fn unknown_operation_from_body_uses_op_code() {
        let body = ErrorBody {
            kind: ErrorKind::UnknownOperation,
            message: "nope".into(),
            field: None,
        };
        assert_eq!(
            BridgeError::from_error_body(OpCode::Utils, body),
            BridgeError::UnknownOperation(13)
        );
    }

    #[test]
    fn protocol_errors_map_to_kinds() {
        let err: BridgeError = ProtocolError::Malformed("garbage".into()).into();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        let err: BridgeError = ProtocolError::UnknownOperation(77).into();
        assert_eq!(err, BridgeError::UnknownOperation(77));
    }

    #[test]
    fn to_response_round_trips_kind() {
        let err = BridgeError::Reentrancy("call already in flight".into());
        match err.to_response() {
            HostResponse::Err(body) => {
                assert_eq!(body.kind, ErrorKind::Reentrancy);
                assert_eq!(body.message, "call already in flight");
            }
            HostResponse::Ok(_) => panic!("expected err envelope"),
        }
    }
}
