//! Operation codes.
//!
//! Every privileged capability the host exposes to sandboxed code is named by
//! exactly one [`OpCode`].  The integer values are part of the wire contract
//! and never change; new capabilities get new codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Closed set of host operations callable from the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum OpCode {
    /// Outbound HTTP request.
    Fetch = 1,
    /// Record query or mutation.
    DbQuery = 2,
    /// Key-value read.
    KvGet = 3,
    /// Key-value write (a `null` value deletes).
    KvSet = 4,
    /// Secret lookup.
    SecretGet = 5,
    /// Background job enqueue.
    JobEnqueue = 6,
    /// Read a record attachment.
    FileRead = 7,
    /// Write a record attachment.
    FileSave = 8,
    /// Nearest-neighbour search over record vectors.
    VectorSearch = 9,
    /// Open a transaction.
    TxBegin = 10,
    /// Commit the open transaction.
    TxCommit = 11,
    /// Roll back the open transaction.
    TxRollback = 12,
    /// Stateless helpers (uuid, hashing, random strings, base64, clock).
    Utils = 13,
}

impl OpCode {
    /// Every declared op code, in wire order.
    pub const ALL: [OpCode; 13] = [
        OpCode::Fetch,
        OpCode::DbQuery,
        OpCode::KvGet,
        OpCode::KvSet,
        OpCode::SecretGet,
        OpCode::JobEnqueue,
        OpCode::FileRead,
        OpCode::FileSave,
        OpCode::VectorSearch,
        OpCode::TxBegin,
        OpCode::TxCommit,
        OpCode::TxRollback,
        OpCode::Utils,
    ];

    /// The integer passed across the boundary.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Look up an op code by its wire integer.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Fetch),
            2 => Some(Self::DbQuery),
            3 => Some(Self::KvGet),
            4 => Some(Self::KvSet),
            5 => Some(Self::SecretGet),
            6 => Some(Self::JobEnqueue),
            7 => Some(Self::FileRead),
            8 => Some(Self::FileSave),
            9 => Some(Self::VectorSearch),
            10 => Some(Self::TxBegin),
            11 => Some(Self::TxCommit),
            12 => Some(Self::TxRollback),
            13 => Some(Self::Utils),
            _ => None,
        }
    }

    /// Stable snake_case name, used in logs and the CLI.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::DbQuery => "db_query",
            Self::KvGet => "kv_get",
            Self::KvSet => "kv_set",
            Self::SecretGet => "secret_get",
            Self::JobEnqueue => "job_enqueue",
            Self::FileRead => "file_read",
            Self::FileSave => "file_save",
            Self::VectorSearch => "vector_search",
            Self::TxBegin => "tx_begin",
            Self::TxCommit => "tx_commit",
            Self::TxRollback => "tx_rollback",
            Self::Utils => "utils",
        }
    }

    /// Ops that open or consume a transaction handle.
    pub const fn is_transaction_control(self) -> bool {
        matches!(self, Self::TxBegin | Self::TxCommit | Self::TxRollback)
    }

    /// Ops that can only run against a live transaction handle.
    pub const fn requires_transaction(self) -> bool {
        matches!(self, Self::TxCommit | Self::TxRollback)
    }
}

impl TryFrom<u32> for OpCode {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ProtocolError::UnknownOperation(code))
    }
}

impl std::str::FromStr for OpCode {
    type Err = ProtocolError;

    /// Accepts either the snake_case name or the wire integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u32>() {
            return Self::try_from(code);
        }
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| ProtocolError::UnknownOperationName(s.to_owned()))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
