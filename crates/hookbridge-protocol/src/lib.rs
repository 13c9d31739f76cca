//! Wire protocol shared by the hookbridge sandbox and host.
//!
//! Sandboxed scripts reach privileged host capabilities by passing an integer
//! op code plus a JSON request envelope through linear memory.  This crate
//! owns everything both sides must agree on:
//!
//! - **[`opcode`]** -- the closed [`OpCode`] enumeration and its fixed integers.
//! - **[`envelope`]** -- [`HostRequest`] / [`HostResponse`] and their strict codecs.
//! - **[`frame`]** -- the length-prefixed response buffer layout.
//! - **[`schema`]** -- per-op payload declarations and [`validate`](schema::validate).
//! - **[`binary`]** -- base64 encoding for file bytes.
//! - **[`error`]** -- the wire [`ErrorKind`] taxonomy and [`ProtocolError`].

pub mod binary;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod opcode;
pub mod schema;

pub use envelope::{ErrorBody, HostRequest, HostResponse, Payload, TransactionHandle, WIRE_VERSION};
pub use error::{ErrorKind, ProtocolError};
pub use frame::{DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN};
pub use opcode::OpCode;
pub use schema::{OpSchema, schema, validate};
