//! Sandbox side of the hookbridge boundary.
//!
//! A hook running inside the sandbox reaches host capabilities through an
//! [`Invocation`].  Underneath, each call is marshaled through linear memory:
//!
//! - **[`abi`]** -- the [`SandboxAbi`] seam and the `wasm32` bindings.
//! - **[`memory`]** -- bounds-checked buffers that free themselves.
//! - **[`adapter`]** -- the per-call state machine with reentrancy guard.
//! - **[`transaction`]** -- the single-live-handle transaction context.
//! - **[`invocation`]** -- the script-facing API.
//! - **[`loopback`]** -- an in-process ABI used by tests and tooling.
//! - **[`error`]** -- [`BridgeError`], one variant per wire error kind.

pub mod abi;
pub mod adapter;
pub mod error;
pub mod invocation;
pub mod loopback;
pub mod memory;
pub mod transaction;

pub use abi::SandboxAbi;
pub use adapter::{CallAdapter, CallState};
pub use error::{BridgeError, Result};
pub use invocation::Invocation;
pub use loopback::{BoxedHost, GuestHeap, LoopbackAbi};
pub use memory::{Marshaler, MemoryHandle, MemoryStats};
pub use transaction::{TransactionContext, TxOutcome, TxState};

pub use hookbridge_protocol::{OpCode, Payload, TransactionHandle};
