//! Op handler registry and dispatcher.
//!
//! [`HandlerRegistry`] collects one [`OpHandler`] per [`OpCode`]; turning it
//! into a [`Dispatcher`] fails unless every declared op is covered, so a
//! running host can never meet an op without a handler.
//!
//! [`Dispatcher::dispatch`] is the host end of the boundary.  It takes the raw
//! op integer and request bytes and always returns encoded response bytes:
//! every failure (bad frame, unknown op, invalid payload, foreign transaction,
//! handler fault) becomes an `err` envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use hookbridge_protocol::frame;
use hookbridge_protocol::{ErrorKind, HostRequest, HostResponse, OpCode, Payload, TransactionHandle};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Fault, HostError, Result};
use crate::session::Session;
use crate::tx::TransactionManager;

/// Last-resort response when even an error envelope cannot be encoded.
const ENCODE_FAILURE: &[u8] =
    br#"{"err":{"kind":"host_error","message":"response encoding failed"}}"#;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub session: &'a Session,
    /// Transaction the call runs in.  Ownership is already verified.
    pub tx: Option<&'a TransactionHandle>,
}

/// Implementation of one op.
pub trait OpHandler: Send + Sync {
    fn op(&self) -> OpCode;

    /// Serve a call whose payload already passed schema validation.
    fn handle(&self, ctx: &CallContext<'_>, payload: Payload) -> std::result::Result<Value, Fault>;
}

/// [`OpHandler`] backed by a closure.
pub struct FnHandler<F> {
    op: OpCode,
    f: F,
}

/// Wrap a closure as an [`OpHandler`].
pub fn handler_fn<F>(op: OpCode, f: F) -> FnHandler<F>
where
    F: Fn(&CallContext<'_>, Payload) -> std::result::Result<Value, Fault> + Send + Sync,
{
    FnHandler { op, f }
}

impl<F> OpHandler for FnHandler<F>
where
    F: Fn(&CallContext<'_>, Payload) -> std::result::Result<Value, Fault> + Send + Sync,
{
    fn op(&self) -> OpCode {
        self.op
    }

    fn handle(&self, ctx: &CallContext<'_>, payload: Payload) -> std::result::Result<Value, Fault> {
        (self.f)(ctx, payload)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers collected before the host starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OpCode, Arc<dyn OpHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; each op may be registered once.
    pub fn register(&mut self, handler: impl OpHandler + 'static) -> Result<()> {
        let op = handler.op();
        if self.handlers.contains_key(&op) {
            return Err(HostError::DuplicateHandler(op));
        }
        self.handlers.insert(op, Arc::new(handler));
        Ok(())
    }

    /// Swap the handler for an op, returning the previous one.
    pub fn replace(&mut self, handler: impl OpHandler + 'static) -> Option<Arc<dyn OpHandler>> {
        self.handlers.insert(handler.op(), Arc::new(handler))
    }

    pub fn contains(&self, op: OpCode) -> bool {
        self.handlers.contains_key(&op)
    }

    /// Ops declared by the protocol but not registered yet.
    pub fn missing(&self) -> Vec<OpCode> {
        OpCode::ALL
            .into_iter()
            .filter(|op| !self.handlers.contains_key(op))
            .collect()
    }

    /// Freeze into a dispatcher.  Fails if any op has no handler.
    pub fn into_dispatcher(
        self,
        transactions: Arc<TransactionManager>,
        max_frame_len: usize,
    ) -> Result<Dispatcher> {
        if let Some(op) = self.missing().into_iter().next() {
            return Err(HostError::MissingHandler(op));
        }
        Ok(Dispatcher {
            handlers: self.handlers,
            transactions,
            max_frame_len,
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes raw host calls to their handlers.
pub struct Dispatcher {
    handlers: HashMap<OpCode, Arc<dyn OpHandler>>,
    transactions: Arc<TransactionManager>,
    max_frame_len: usize,
}

impl Dispatcher {
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Serve one call and return the encoded response envelope (unframed).
    pub fn dispatch(&self, code: u32, request: &[u8], session: &Session) -> Vec<u8> {
        let started = Instant::now();
        let seq = session.record_call();
        let response = match self.serve(code, request, session) {
            Ok(value) => {
                debug!(
                    op = code,
                    session = session.id(),
                    seq,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "host call ok"
                );
                HostResponse::ok(value)
            }
            Err(fault) => {
                if fault.kind == ErrorKind::HostError {
                    warn!(
                        op = code,
                        session = session.id(),
                        seq,
                        error = %fault,
                        "host call failed"
                    );
                } else {
                    debug!(
                        op = code,
                        session = session.id(),
                        seq,
                        error = %fault,
                        "host call rejected"
                    );
                }
                fault.into_response()
            }
        };
        self.encode(response)
    }

    fn serve(
        &self,
        code: u32,
        request: &[u8],
        session: &Session,
    ) -> std::result::Result<Value, Fault> {
        frame::check_len(request.len(), self.max_frame_len)
            .map_err(|e| Fault::invalid("$frame", e.to_string()))?;
        let request = HostRequest::decode(code, request)?;
        let payload = hookbridge_protocol::validate(request.op, request.payload)?;

        if let Some(tx) = &request.tx {
            self.transactions.check(tx, session)?;
        }
        if request.op.requires_transaction() {
            let Some(tx) = &request.tx else {
                return Err(Fault::bad_handle(format!(
                    "{} must be sent inside its transaction",
                    request.op
                )));
            };
            let named = payload.get("txId").and_then(Value::as_str).unwrap_or_default();
            if named != tx.as_str() {
                return Err(Fault::bad_handle(format!(
                    "txId {named} does not match the live transaction"
                )));
            }
        }

        let handler = self.handlers.get(&request.op).ok_or_else(|| {
            Fault::new(ErrorKind::UnknownOperation, format!("no handler for {}", request.op))
        })?;
        let ctx = CallContext {
            session,
            tx: request.tx.as_ref(),
        };
        handler.handle(&ctx, payload)
    }

    fn encode(&self, response: HostResponse) -> Vec<u8> {
        let fault = match response.encode() {
            Ok(bytes) if bytes.len() <= self.max_frame_len => return bytes,
            Ok(bytes) => Fault::host(format!(
                "response of {} bytes exceeds frame limit of {}",
                bytes.len(),
                self.max_frame_len
            )),
            Err(e) => Fault::host(e.to_string()),
        };
        warn!(error = %fault, "replacing unencodable response");
        fault
            .into_response()
            .encode()
            .unwrap_or_else(|_| ENCODE_FAILURE.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::JobQueue;
    use crate::kv::KvStore;
    use crate::records::RecordStore;

    fn transactions() -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(
            RecordStore::open_in_memory().unwrap(),
            Arc::new(KvStore::new(10)),
            Arc::new(JobQueue::new()),
        ))
    }

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for op in OpCode::ALL {
            registry
                .register(handler_fn(op, move |ctx, payload| {
                    Ok(json!({
                        "op": op.code(),
                        "payload": payload,
                        "tx": ctx.tx.map(|t| t.to_string()),
                    }))
                }))
                .unwrap();
        }
        registry
    }

    fn decode(bytes: Vec<u8>) -> HostResponse {
        HostResponse::decode(&bytes).unwrap()
    }

    #[test]
    fn missing_handlers_fail_the_build() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(handler_fn(OpCode::Utils, |_, _| Ok(Value::Null)))
            .unwrap();
        assert_eq!(registry.missing().len(), 12);
        let err = registry.into_dispatcher(transactions(), 1024).err().unwrap();
        assert!(matches!(err, HostError::MissingHandler(OpCode::Fetch)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = echo_registry();
        let err = registry
            .register(handler_fn(OpCode::KvGet, |_, _| Ok(Value::Null)))
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateHandler(OpCode::KvGet)));
        assert!(registry.replace(handler_fn(OpCode::KvGet, |_, _| Ok(Value::Null))).is_some());
    }

    #[test]
    fn dispatch_validates_and_fills_defaults() {
        let dispatcher = echo_registry().into_dispatcher(transactions(), 4096).unwrap();
        let session = Session::new();
        let request = br#"{"v":1,"payload":{"key":"a","value":1}}"#;
        let resp = decode(dispatcher.dispatch(4, request, &session));
        let HostResponse::Ok(value) = resp else { panic!("expected ok") };
        assert_eq!(value["payload"]["ttl"], 0);
        assert_eq!(session.calls(), 1);
    }

    #[test]
    fn dispatch_reports_every_failure_as_envelope() {
        let dispatcher = echo_registry().into_dispatcher(transactions(), 64).unwrap();
        let session = Session::new();

        let cases: [(u32, &[u8], ErrorKind); 5] = [
            (999, br#"{"v":1,"payload":{}}"#, ErrorKind::UnknownOperation),
            (3, b"not json", ErrorKind::InvalidArgument),
            (3, br#"{"v":1,"payload":{}}"#, ErrorKind::InvalidArgument),
            (
                3,
                br#"{"v":1,"tx":"ghost","payload":{"key":"a"}}"#,
                ErrorKind::InvalidTransactionHandle,
            ),
            (11, br#"{"v":1,"payload":{"txId":"t"}}"#, ErrorKind::InvalidTransactionHandle),
        ];
        for (code, body, kind) in cases {
            match decode(dispatcher.dispatch(code, body, &session)) {
                HostResponse::Err(err) => assert_eq!(err.kind, kind, "{code}"),
                HostResponse::Ok(v) => panic!("expected {kind} for {code}, got {v}"),
            }
        }

        let big = vec![b' '; 65];
        match decode(dispatcher.dispatch(3, &big, &session)) {
            HostResponse::Err(err) => assert_eq!(err.field.as_deref(), Some("$frame")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_response_becomes_host_error() {
        let mut registry = echo_registry();
        registry.replace(handler_fn(OpCode::Utils, |_, _| Ok(json!("x".repeat(500)))));
        let dispatcher = registry.into_dispatcher(transactions(), 256).unwrap();
        let resp = decode(dispatcher.dispatch(
            13,
            br#"{"v":1,"payload":{"op":"uuid"}}"#,
            &Session::new(),
        ));
        match resp {
            HostResponse::Err(err) => assert_eq!(err.kind, ErrorKind::HostError),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commit_txid_must_match_envelope() {
        let txs = transactions();
        let dispatcher = echo_registry().into_dispatcher(Arc::clone(&txs), 4096).unwrap();
        let session = Session::new();
        let handle = txs.begin(&session).unwrap();

        let mismatched = format!(r#"{{"v":1,"tx":"{handle}","payload":{{"txId":"other"}}}}"#);
        match decode(dispatcher.dispatch(11, mismatched.as_bytes(), &session)) {
            HostResponse::Err(err) => assert_eq!(err.kind, ErrorKind::InvalidTransactionHandle),
            other => panic!("unexpected {other:?}"),
        }

        let matched = format!(r#"{{"v":1,"tx":"{handle}","payload":{{"txId":"{handle}"}}}}"#);
        let resp = decode(dispatcher.dispatch(11, matched.as_bytes(), &session));
        let HostResponse::Ok(value) = resp else {
            panic!("expected ok")
        };
        assert_eq!(value["tx"], handle.as_str());

        // Another session cannot even reference the handle.
        match decode(dispatcher.dispatch(11, matched.as_bytes(), &Session::new())) {
            HostResponse::Err(err) => assert_eq!(err.kind, ErrorKind::InvalidTransactionHandle),
            other => panic!("unexpected {other:?}"),
        }
    }
}
