//! Per-invocation transaction state.
//!
//! At most one transaction is live at a time.  The context moves
//! `NoTransaction -> Open(handle) -> NoTransaction`, recording whether each
//! transaction ended committed or rolled back.

use std::cell::{Cell, RefCell};

use hookbridge_protocol::TransactionHandle;

use crate::error::{BridgeError, Result};

/// Observable transaction state of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    NoTransaction,
    Open(TransactionHandle),
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

/// Tracks the single live transaction handle.
#[derive(Debug, Default)]
pub struct TransactionContext {
    live: RefCell<Option<TransactionHandle>>,
    committed: Cell<u64>,
    rolled_back: Cell<u64>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TxState {
        match self.current() {
            Some(handle) => TxState::Open(handle),
            None => TxState::NoTransaction,
        }
    }

    /// The live handle, if any.
    pub fn current(&self) -> Option<TransactionHandle> {
        self.live.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.live.borrow().is_some()
    }

    /// Fail with `TransactionAlreadyOpen` if a transaction is live.
    pub fn ensure_can_begin(&self) -> Result<()> {
        match self.live.borrow().as_ref() {
            Some(handle) => Err(BridgeError::TransactionAlreadyOpen(format!(
                "transaction {handle} is still open"
            ))),
            None => Ok(()),
        }
    }

    /// Record a freshly opened transaction.
    pub fn opened(&self, handle: TransactionHandle) {
        *self.live.borrow_mut() = Some(handle);
    }

    /// Fail with `InvalidTransactionHandle` unless `handle` is the live one.
    pub fn ensure_live(&self, handle: &TransactionHandle) -> Result<()> {
        match self.live.borrow().as_ref() {
            Some(live) if live == handle => Ok(()),
            Some(live) => Err(BridgeError::InvalidTransactionHandle(format!(
                "{handle} is not the open transaction ({live})"
            ))),
            None => Err(BridgeError::InvalidTransactionHandle(format!(
                "{handle} is not open"
            ))),
        }
    }

    /// Close the live transaction, returning its handle.
    pub fn close(&self, outcome: TxOutcome) -> Option<TransactionHandle> {
        let handle = self.live.borrow_mut().take()?;
        let counter = match outcome {
            TxOutcome::Committed => &self.committed,
            TxOutcome::RolledBack => &self.rolled_back,
        };
        counter.set(counter.get() + 1);
        Some(handle)
    }

    /// Transactions committed so far.
    pub fn committed(&self) -> u64 {
        self.committed.get()
    }

    /// Transactions rolled back so far.
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_commit() {
        let ctx = TransactionContext::new();
        assert_eq!(ctx.state(), TxState::NoTransaction);
        let handle = TransactionHandle::new("t1");
        ctx.ensure_can_begin().unwrap();
        ctx.opened(handle.clone());
        assert_eq!(ctx.state(), TxState::Open(handle.clone()));
        assert!(ctx.ensure_can_begin().is_err());
        ctx.ensure_live(&handle).unwrap();
        assert_eq!(ctx.close(TxOutcome::Committed), Some(handle));
        assert_eq!(ctx.committed(), 1);
        assert_eq!(ctx.state(), TxState::NoTransaction);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let ctx = TransactionContext::new();
        let first = TransactionHandle::new("t1");
        ctx.opened(first.clone());
        ctx.close(TxOutcome::RolledBack);
        let err = ctx.ensure_live(&first).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTransactionHandle(_)));

        ctx.opened(TransactionHandle::new("t2"));
        assert!(ctx.ensure_live(&first).is_err());
        assert_eq!(ctx.rolled_back(), 1);
    }

    #[test]
    fn close_without_transaction_is_noop() {
        let ctx = TransactionContext::new();
        assert_eq!(ctx.close(TxOutcome::Committed), None);
        assert_eq!(ctx.committed(), 0);
    }
}
