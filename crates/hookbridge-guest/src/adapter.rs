//! The call adapter: one host call, start to finish.
//!
//! A call walks `Idle -> Allocating -> Writing -> Invoking -> Reading ->
//! Freeing -> Resolved | Failed -> Idle`.  Only an `Idle` adapter accepts a
//! new call; anything else is rejected with [`BridgeError::Reentrancy`]
//! before touching memory.  Payloads are validated against the op schema
//! before any buffer is allocated.

use std::cell::Cell;
use std::fmt;

use futures::future::{Ready, ready};
use hookbridge_protocol::{HostRequest, HostResponse, OpCode, frame, schema};
use serde_json::Value;

use crate::abi::SandboxAbi;
use crate::error::{BridgeError, Result};
use crate::memory::Marshaler;

/// Where the adapter is in the life of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Allocating,
    Writing,
    Invoking,
    Reading,
    Freeing,
    Resolved,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Allocating => "allocating",
            Self::Writing => "writing",
            Self::Invoking => "invoking",
            Self::Reading => "reading",
            Self::Freeing => "freeing",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Turns a [`HostRequest`] into a host call over linear memory.
pub struct CallAdapter<A: SandboxAbi> {
    memory: Marshaler<A>,
    state: Cell<CallState>,
}

impl<A: SandboxAbi> CallAdapter<A> {
    /// Adapter over `abi` with default limits.
    pub fn new(abi: A) -> Self {
        Self::with_marshaler(Marshaler::new(abi))
    }

    /// Adapter over a pre-configured marshaler.
    pub fn with_marshaler(memory: Marshaler<A>) -> Self {
        Self {
            memory,
            state: Cell::new(CallState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> CallState {
        self.state.get()
    }

    /// The underlying marshaler, for stats and inspection.
    pub fn memory(&self) -> &Marshaler<A> {
        &self.memory
    }

    /// Perform `request` synchronously and return the decoded `ok` value.
    pub fn call(&self, request: HostRequest) -> Result<Value> {
        let current = self.state.get();
        if current != CallState::Idle {
            tracing::warn!(op = %request.op, state = %current, "nested host call rejected");
            return Err(BridgeError::Reentrancy(format!(
                "cannot call {} while another host call is {current}",
                request.op
            )));
        }

        let op = request.op;
        let outcome = self.drive(request);
        match &outcome {
            Ok(_) => {
                self.state.set(CallState::Resolved);
                tracing::trace!(op = %op, "host call resolved");
            }
            Err(err) => {
                self.state.set(CallState::Failed);
                tracing::debug!(op = %op, kind = %err.kind(), error = %err, "host call failed");
            }
        }
        self.state.set(CallState::Idle);
        outcome
    }

    /// Future-returning form of [`call`](Self::call).
    ///
    /// The host call itself is synchronous; the returned future is already
    /// complete and resolves to the same value.
    pub fn call_async(&self, request: HostRequest) -> Ready<Result<Value>> {
        ready(self.call(request))
    }

    fn drive(&self, request: HostRequest) -> Result<Value> {
        let HostRequest { op, payload, tx } = request;
        let payload = schema::validate(op, payload)?;
        if op.requires_transaction() && tx.is_none() {
            return Err(BridgeError::InvalidTransactionHandle(format!(
                "{op} requires an open transaction"
            )));
        }

        let bytes = HostRequest { op, payload, tx }.encode()?;
        frame::check_len(bytes.len(), self.memory.max_frame_len())
            .map_err(|e| BridgeError::invalid("$frame", e.to_string()))?;

        self.state.set(CallState::Allocating);
        let request_buf = self.memory.allocate(bytes.len())?;

        self.state.set(CallState::Writing);
        self.memory.write(&request_buf, &bytes)?;

        self.state.set(CallState::Invoking);
        let response_buf = self.memory.invoke(op, &request_buf)?;

        self.state.set(CallState::Reading);
        let body = self.memory.read_frame(&response_buf);

        self.state.set(CallState::Freeing);
        drop(response_buf);
        drop(request_buf);

        decode_response(op, &body?)
    }
}

fn decode_response(op: OpCode, body: &[u8]) -> Result<Value> {
    HostResponse::decode(body)
        .map_err(|e| BridgeError::MalformedResponse(e.to_string()))?
        .into_result()
        .map_err(|body| BridgeError::from_error_body(op, body))
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::loopback::LoopbackAbi;

    fn payload(value: Value) -> hookbridge_protocol::Payload {
        value.as_object().cloned().unwrap()
    }

    fn kv_host(_op: u32, _req: &[u8]) -> Vec<u8> {
        br#"{"ok":{"value":null}}"#.to_vec()
    }

    #[test]
    fn call_returns_ok_value_and_returns_to_idle() {
        let adapter = CallAdapter::new(LoopbackAbi::new(4096, kv_host));
        let value = adapter
            .call(HostRequest::new(OpCode::KvGet, payload(json!({"key": "a"}))))
            .unwrap();
        assert_eq!(value, json!({"value": null}));
        assert_eq!(adapter.state(), CallState::Idle);
        assert_eq!(adapter.memory().stats().outstanding(), 0);
    }

    #[test]
    fn invalid_payload_never_allocates() {
        let adapter = CallAdapter::new(LoopbackAbi::new(4096, kv_host));
        let err = adapter
            .call(HostRequest::new(OpCode::KvGet, payload(json!({}))))
            .unwrap_err();
        assert_eq!(err, BridgeError::invalid("key", "is required"));
        assert_eq!(adapter.memory().stats().allocations, 0);
        assert_eq!(adapter.memory().abi().invocations(), 0);
    }

    #[test]
    fn commit_without_handle_is_rejected_locally() {
        let adapter = CallAdapter::new(LoopbackAbi::new(4096, kv_host));
        let err = adapter
            .call(HostRequest::new(OpCode::TxCommit, payload(json!({"txId": "t"}))))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTransactionHandle(_)));
        assert_eq!(adapter.memory().abi().invocations(), 0);
    }

    #[test]
    fn malformed_host_bytes_are_reported() {
        let adapter = CallAdapter::new(LoopbackAbi::new(4096, |_, _: &[u8]| b"\"hello\"".to_vec()));
        let err = adapter
            .call(HostRequest::new(OpCode::KvGet, payload(json!({"key": "a"}))))
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));
        assert_eq!(adapter.state(), CallState::Idle);
        assert_eq!(adapter.memory().stats().outstanding(), 0);
    }

    #[test]
    fn no_room_for_request_is_out_of_memory() {
        let adapter = CallAdapter::new(LoopbackAbi::new(32, kv_host));
        let err = adapter
            .call(HostRequest::new(
                OpCode::KvGet,
                payload(json!({"key": "a-rather-long-key-that-does-not-fit"})),
            ))
            .unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory(_)));
        assert_eq!(adapter.memory().stats().outstanding(), 0);
    }

    #[test]
    fn no_room_for_response_is_out_of_memory() {
        // Request fits; the 1 KiB response does not.
        let big = format!(r#"{{"ok":"{}"}}"#, "x".repeat(1024));
        let adapter = CallAdapter::new(LoopbackAbi::new(256, move |_, _: &[u8]| {
            big.clone().into_bytes()
        }));
        let err = adapter
            .call(HostRequest::new(OpCode::KvGet, payload(json!({"key": "a"}))))
            .unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory(_)));
        assert_eq!(adapter.memory().stats().outstanding(), 0);
        assert_eq!(adapter.memory().abi().heap().live(), 0);
    }

    #[test]
    fn call_async_resolves_like_call() {
        let adapter = CallAdapter::new(LoopbackAbi::new(4096, kv_host));
        let value = adapter
            .call_async(HostRequest::new(OpCode::KvGet, payload(json!({"key": "a"}))))
            .now_or_never()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!({"value": null}));
    }

    #[test]
    fn state_display() {
        assert_eq!(CallState::Invoking.to_string(), "invoking");
    }
}
