//! Host error types.
//!
//! [`HostError`] is what the host's own APIs return (opening databases,
//! loading modules, running hooks).  [`Fault`] is the narrower failure a
//! capability handler reports for a single call; the dispatcher turns every
//! `Fault` into an `err` envelope so it never escapes as a Rust error.

use hookbridge_protocol::{ErrorBody, ErrorKind, HostResponse, OpCode, ProtocolError};

/// Unified error type for the host crate.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Wasm module failed to compile.
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated (e.g. missing imports).
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// The guest broke the calling convention.
    #[error("wasm execution error: {0}")]
    Execution(String),

    /// A Wasm trap was raised during execution.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// The hook consumed its whole fuel budget.
    #[error("fuel exhausted after {limit} units")]
    OutOfFuel {
        /// Fuel the store started with.
        limit: u64,
    },

    /// Module registry error (duplicate name, unknown module, missing export).
    #[error("module error: {reason}")]
    Module {
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// The handler registry does not cover this op.
    #[error("no handler registered for {0}")]
    MissingHandler(OpCode),

    /// Two handlers were registered for one op.
    #[error("handler for {0} registered twice")]
    DuplicateHandler(OpCode),

    /// The hook ran to completion and reported an error envelope.
    #[error("hook failed with {}: {}", .0.kind, .0.message)]
    Guest(ErrorBody),
}

/// Convenience alias used throughout the host crate.
pub type Result<T> = std::result::Result<T, HostError>;

/// Failure of a single host call, reported to the sandbox as an `err` envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    /// Wire error kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Offending payload field, for `invalid_argument`.
    pub field: Option<String>,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    /// `invalid_argument` naming `field`.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// `host_error` with `message`.
    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostError, message)
    }

    /// `invalid_transaction_handle` with `message`.
    pub fn bad_handle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransactionHandle, message)
    }

    /// The `err` envelope for this fault.
    pub fn into_response(self) -> HostResponse {
        HostResponse::Err(ErrorBody {
            kind: self.kind,
            message: self.message,
            field: self.field,
        })
    }
}

impl From<ProtocolError> for Fault {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidArgument { field, reason } => Self::invalid(field, reason),
            ProtocolError::Malformed(_) | ProtocolError::FrameTooLarge { .. } => {
                Self::invalid("$", err.to_string())
            }
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Fault {
    fn from(err: rusqlite::Error) -> Self {
        Self::host(format!("database: {err}"))
    }
}

impl From<serde_json::Error> for Fault {
    fn from(err: serde_json::Error) -> Self {
        Self::host(format!("json: {err}"))
    }
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Self::host(format!("io: {err}"))
    }
}

impl From<HostError> for Fault {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Guest(body) => Self {
                kind: body.kind,
                message: body.message,
                field: body.field,
            },
            other => Self::host(other.to_string()),
        }
    }
}
