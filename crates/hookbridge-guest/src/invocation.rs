//! The script-facing surface: one invocation of a hook.
//!
//! [`Invocation`] composes the [`CallAdapter`] with a [`TransactionContext`]:
//!
//! - Every call made while a transaction is open carries its handle.
//! - `TxBegin`, `TxCommit` and `TxRollback` go through the transaction state
//!   machine even when issued as raw op codes.
//! - A `host_error` inside an open transaction rolls it back before the error
//!   reaches the script.
//! - A transaction still open when the invocation ends is rolled back.

use futures::future::{Ready, ready};
use hookbridge_protocol::{HostRequest, OpCode, Payload, TransactionHandle};
use serde_json::{Value, json};

use crate::abi::SandboxAbi;
use crate::adapter::CallAdapter;
use crate::error::{BridgeError, Result};
use crate::transaction::{TransactionContext, TxOutcome, TxState};

/// A single run of a sandboxed hook.
pub struct Invocation<A: SandboxAbi> {
    adapter: CallAdapter<A>,
    tx: TransactionContext,
    finished: std::cell::Cell<bool>,
}

impl<A: SandboxAbi> Invocation<A> {
    /// Start an invocation over `abi`.
    pub fn new(abi: A) -> Self {
        Self::from_adapter(CallAdapter::new(abi))
    }

    /// Start an invocation over a configured adapter.
    pub fn from_adapter(adapter: CallAdapter<A>) -> Self {
        Self {
            adapter,
            tx: TransactionContext::new(),
            finished: std::cell::Cell::new(false),
        }
    }

    pub fn adapter(&self) -> &CallAdapter<A> {
        &self.adapter
    }

    pub fn transactions(&self) -> &TransactionContext {
        &self.tx
    }

    pub fn transaction_state(&self) -> TxState {
        self.tx.state()
    }

    /// Call `op` with `payload` and return the host's `ok` value.
    pub fn call(&self, op: OpCode, payload: Payload) -> Result<Value> {
        match op {
            OpCode::TxBegin => {
                let handle = self.begin()?;
                Ok(json!({ "txId": handle.as_str() }))
            }
            OpCode::TxCommit => {
                self.commit(&handle_from(&payload)?)?;
                Ok(json!({ "committed": true }))
            }
            OpCode::TxRollback => {
                self.rollback(&handle_from(&payload)?)?;
                Ok(json!({ "rolledBack": true }))
            }
            _ => self.dispatch(op, payload),
        }
    }

    /// Call by raw op code, as a dynamically typed script would.
    pub fn call_code(&self, code: u32, payload: Value) -> Result<Value> {
        let op = OpCode::try_from(code)?;
        let Value::Object(payload) = payload else {
            return Err(BridgeError::invalid("$", "payload must be an object"));
        };
        self.call(op, payload)
    }

    /// Future-returning form of [`call`](Self::call).
    ///
    /// Resolves to exactly what `call` returns; the host call has already
    /// completed when the future is handed back.
    pub fn call_async(&self, op: OpCode, payload: Payload) -> Ready<Result<Value>> {
        ready(self.call(op, payload))
    }

    /// Open a transaction.
    pub fn begin(&self) -> Result<TransactionHandle> {
        self.tx.ensure_can_begin()?;
        let value = self
            .adapter
            .call(HostRequest::new(OpCode::TxBegin, Payload::new()))?;
        let id = value
            .get("txId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                BridgeError::MalformedResponse("tx_begin response has no `txId`".into())
            })?;
        let handle = TransactionHandle::new(id);
        self.tx.opened(handle.clone());
        tracing::debug!(tx = %handle, "transaction opened");
        Ok(handle)
    }

    /// Commit the live transaction.
    ///
    /// A `host_error` from the commit itself rolls the transaction back.
    pub fn commit(&self, handle: &TransactionHandle) -> Result<()> {
        self.tx.ensure_live(handle)?;
        match self.adapter.call(tx_request(OpCode::TxCommit, handle)) {
            Ok(_) => {
                self.tx.close(TxOutcome::Committed);
                tracing::debug!(tx = %handle, "transaction committed");
                Ok(())
            }
            Err(err @ BridgeError::HostError(_)) => {
                self.rollback_live("commit failed");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Roll back the live transaction.
    pub fn rollback(&self, handle: &TransactionHandle) -> Result<()> {
        self.tx.ensure_live(handle)?;
        let result = self.adapter.call(tx_request(OpCode::TxRollback, handle));
        match result {
            Err(BridgeError::Reentrancy(_)) => {}
            // The host discards the transaction on its side either way.
            _ => {
                self.tx.close(TxOutcome::RolledBack);
                tracing::debug!(tx = %handle, "transaction rolled back");
            }
        }
        result.map(|_| ())
    }

    /// Run `body` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Self, &TransactionHandle) -> std::result::Result<T, E>,
        E: From<BridgeError>,
    {
        let handle = self.begin()?;
        match body(self, &handle) {
            Ok(value) => {
                self.commit(&handle)?;
                Ok(value)
            }
            Err(err) => {
                if self.tx.current().as_ref() == Some(&handle) {
                    if let Err(rollback) = self.rollback(&handle) {
                        tracing::warn!(tx = %handle, error = %rollback, "rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// End the invocation, rolling back any transaction left open.
    pub fn finish(self) -> Result<()> {
        self.cleanup()
    }

    fn dispatch(&self, op: OpCode, payload: Payload) -> Result<Value> {
        let request = HostRequest::new(op, payload).with_transaction(self.tx.current());
        let result = self.adapter.call(request);
        if let Err(BridgeError::HostError(message)) = &result {
            if self.tx.is_open() {
                tracing::warn!(op = %op, error = %message, "host error inside transaction");
                self.rollback_live("host error");
            }
        }
        result
    }

    fn rollback_live(&self, reason: &str) {
        let Some(handle) = self.tx.current() else {
            return;
        };
        match self.rollback(&handle) {
            Ok(()) => tracing::info!(tx = %handle, reason, "transaction rolled back"),
            Err(err) => tracing::warn!(tx = %handle, reason, error = %err, "rollback failed"),
        }
    }

    fn cleanup(&self) -> Result<()> {
        if self.finished.replace(true) {
            return Ok(());
        }
        match self.tx.current() {
            Some(handle) => {
                tracing::warn!(tx = %handle, "invocation ended with an open transaction");
                self.rollback(&handle)
            }
            None => Ok(()),
        }
    }
}

impl<A: SandboxAbi> Drop for Invocation<A> {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            tracing::warn!(error = %err, "cleanup rollback failed");
        }
    }
}

fn handle_from(payload: &Payload) -> Result<TransactionHandle> {
    payload
        .get("txId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(TransactionHandle::new)
        .ok_or_else(|| BridgeError::invalid("txId", "is required"))
}

fn tx_request(op: OpCode, handle: &TransactionHandle) -> HostRequest {
    let mut payload = Payload::new();
    payload.insert("txId".into(), Value::String(handle.as_str().to_owned()));
    HostRequest::new(op, payload).with_transaction(Some(handle.clone()))
}
