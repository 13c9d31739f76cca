//! Host-side transaction bookkeeping.
//!
//! A transaction owns a dedicated SQLite connection holding `BEGIN IMMEDIATE`
//! plus a list of staged KV writes and jobs.  Record writes become visible on
//! `COMMIT`; staged writes are applied under the same locks right after, so a
//! commit either lands everything or nothing.  Rollback discards both.
//!
//! Each transaction belongs to the [`Session`] that opened it.  A session may
//! hold at most one open transaction, and a handle presented from another
//! session is rejected as invalid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use hookbridge_protocol::{ErrorKind, TransactionHandle};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Fault;
use crate::jobs::{Job, JobQueue};
use crate::kv::KvStore;
use crate::records::RecordStore;
use crate::session::Session;

/// A write deferred until commit.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    Kv { key: String, value: Value, ttl_secs: u64 },
    Job(Job),
}

struct OpenTransaction {
    session: String,
    conn: Mutex<Connection>,
    staged: Mutex<Vec<StagedWrite>>,
    opened_at: Instant,
}

/// Counters reported by [`TransactionManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxStats {
    pub open: usize,
    pub committed: u64,
    pub rolled_back: u64,
}

pub struct TransactionManager {
    records: RecordStore,
    kv: Arc<KvStore>,
    jobs: Arc<JobQueue>,
    open: DashMap<String, Arc<OpenTransaction>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl TransactionManager {
    pub fn new(records: RecordStore, kv: Arc<KvStore>, jobs: Arc<JobQueue>) -> Self {
        Self {
            records,
            kv,
            jobs,
            open: DashMap::new(),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        }
    }

    /// Open a transaction for `session`.
    pub fn begin(&self, session: &Session) -> Result<TransactionHandle, Fault> {
        if let Some(existing) = self
            .open
            .iter()
            .find(|e| e.value().session == session.id())
        {
            return Err(Fault::new(
                ErrorKind::TransactionAlreadyOpen,
                format!("transaction {} is already open", existing.key()),
            ));
        }
        let conn = self.records.begin().map_err(Fault::from)?;
        let id = uuid::Uuid::now_v7().to_string();
        self.open.insert(
            id.clone(),
            Arc::new(OpenTransaction {
                session: session.id().to_owned(),
                conn: Mutex::new(conn),
                staged: Mutex::new(Vec::new()),
                opened_at: Instant::now(),
            }),
        );
        info!(tx = %id, session = session.id(), "transaction opened");
        Ok(TransactionHandle::new(id))
    }

    /// Confirm `handle` is open and owned by `session`.
    pub fn check(&self, handle: &TransactionHandle, session: &Session) -> Result<(), Fault> {
        self.lookup(handle, session).map(|_| ())
    }

    fn lookup(
        &self,
        handle: &TransactionHandle,
        session: &Session,
    ) -> Result<Arc<OpenTransaction>, Fault> {
        let tx = self
            .open
            .get(handle.as_str())
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Fault::bad_handle(format!("transaction {handle} is not open")))?;
        if tx.session != session.id() {
            return Err(Fault::bad_handle(format!(
                "transaction {handle} belongs to another invocation"
            )));
        }
        Ok(tx)
    }

    /// Run `f` on the transaction's connection.
    pub fn with_connection<T, F>(
        &self,
        handle: &TransactionHandle,
        session: &Session,
        f: F,
    ) -> Result<T, Fault>
    where
        F: FnOnce(&Connection) -> Result<T, Fault>,
    {
        let tx = self.lookup(handle, session)?;
        let conn = tx
            .conn
            .lock()
            .map_err(|e| Fault::host(format!("transaction connection poisoned: {e}")))?;
        f(&conn)
    }

    /// Defer `write` until commit.
    pub fn stage(
        &self,
        handle: &TransactionHandle,
        session: &Session,
        write: StagedWrite,
    ) -> Result<(), Fault> {
        let tx = self.lookup(handle, session)?;
        tx.staged
            .lock()
            .map_err(|e| Fault::host(format!("transaction stage poisoned: {e}")))?
            .push(write);
        Ok(())
    }

    /// The latest staged value of `key`, if this transaction wrote it.
    ///
    /// `Some(Value::Null)` means the key was deleted inside the transaction.
    pub fn staged_kv(
        &self,
        handle: &TransactionHandle,
        session: &Session,
        key: &str,
    ) -> Result<Option<Value>, Fault> {
        let tx = self.lookup(handle, session)?;
        let staged = tx
            .staged
            .lock()
            .map_err(|e| Fault::host(format!("transaction stage poisoned: {e}")))?;
        Ok(staged.iter().rev().find_map(|w| match w {
            StagedWrite::Kv { key: k, value, .. } if k == key => Some(value.clone()),
            _ => None,
        }))
    }

    fn take(
        &self,
        handle: &TransactionHandle,
        session: &Session,
    ) -> Result<Arc<OpenTransaction>, Fault> {
        self.lookup(handle, session)?;
        self.open
            .remove(handle.as_str())
            .map(|(_, tx)| tx)
            .ok_or_else(|| Fault::bad_handle(format!("transaction {handle} is not open")))
    }

    /// Commit record writes and apply staged writes, all or nothing.
    ///
    /// Every step that can fail runs before `COMMIT`.  If one does, the
    /// transaction is rolled back and none of its writes become visible.
    pub fn commit(&self, handle: &TransactionHandle, session: &Session) -> Result<(), Fault> {
        let tx = self.take(handle, session)?;
        match self.finish_commit(&tx) {
            Ok(applied) => {
                self.committed.fetch_add(1, Ordering::Relaxed);
                info!(
                    tx = %handle,
                    applied,
                    elapsed_ms = tx.opened_at.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                Ok(())
            }
            Err(fault) => {
                warn!(tx = %handle, error = %fault, "commit failed, rolling back");
                self.discard(handle.as_str(), &tx);
                Err(fault)
            }
        }
    }

    /// Lock everything the commit touches, `COMMIT`, then apply the staged
    /// writes, which cannot fail once the locks are held.
    fn finish_commit(&self, tx: &OpenTransaction) -> Result<usize, Fault> {
        let conn = tx
            .conn
            .lock()
            .map_err(|e| Fault::host(format!("transaction connection poisoned: {e}")))?;
        let mut staged = tx
            .staged
            .lock()
            .map_err(|e| Fault::host(format!("transaction stage poisoned: {e}")))?;
        let mut jobs = self.jobs.batch()?;

        conn.execute_batch("COMMIT")
            .map_err(|e| Fault::host(format!("commit failed: {e}")))?;

        let applied = staged.len();
        for write in staged.drain(..) {
            match write {
                StagedWrite::Kv { key, value, ttl_secs } => self.kv.set(&key, value, ttl_secs),
                StagedWrite::Job(job) => jobs.push(job),
            }
        }
        Ok(applied)
    }

    /// Discard record writes and staged writes.
    pub fn rollback(&self, handle: &TransactionHandle, session: &Session) -> Result<(), Fault> {
        let tx = self.take(handle, session)?;
        self.discard(handle.as_str(), &tx);
        Ok(())
    }

    fn discard(&self, id: &str, tx: &OpenTransaction) {
        match tx.conn.lock() {
            Ok(conn) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(tx = id, error = %e, "rollback statement failed");
                }
            }
            Err(e) => warn!(tx = id, error = %e, "transaction connection poisoned"),
        }
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        info!(tx = id, "transaction rolled back");
    }

    /// Roll back every transaction still open for `session_id`.
    pub fn rollback_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .open
            .iter()
            .filter(|e| e.value().session == session_id)
            .map(|e| e.key().clone())
            .collect();
        let mut n = 0;
        for id in ids {
            if let Some((_, tx)) = self.open.remove(&id) {
                warn!(tx = %id, session = session_id, "rolling back transaction left open");
                self.discard(&id, &tx);
                n += 1;
            }
        }
        n
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            open: self.open.len(),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::NewJob;
    use crate::records;

    fn manager() -> (TransactionManager, RecordStore, Arc<KvStore>) {
        manager_with(Arc::new(KvStore::new(100)), Arc::new(JobQueue::new()))
    }

    fn manager_with(
        kv: Arc<KvStore>,
        jobs: Arc<JobQueue>,
    ) -> (TransactionManager, RecordStore, Arc<KvStore>) {
        let store = RecordStore::open_in_memory().unwrap();
        let mgr = TransactionManager::new(store.clone(), Arc::clone(&kv), jobs);
        (mgr, store, kv)
    }

    fn stage_kv(mgr: &TransactionManager, h: &TransactionHandle, s: &Session, key: &str) {
        mgr.stage(
            h,
            s,
            StagedWrite::Kv {
                key: key.into(),
                value: json!(1),
                ttl_secs: 0,
            },
        )
        .unwrap();
    }

    fn count(store: &RecordStore) -> usize {
        store
            .with_connection(|c| Ok(records::load(c, "c")?.len()))
            .unwrap()
    }

    #[test]
    fn one_transaction_per_session() {
        let (mgr, _, _) = manager();
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        let err = mgr.begin(&s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransactionAlreadyOpen);
        mgr.rollback(&h, &s).unwrap();
        assert!(mgr.begin(&s).is_ok());
    }

    #[test]
    fn foreign_and_stale_handles_are_rejected() {
        let (mgr, _, _) = manager();
        let owner = Session::new();
        let other = Session::new();
        let h = mgr.begin(&owner).unwrap();
        assert_eq!(mgr.check(&h, &other).unwrap_err().kind, ErrorKind::InvalidTransactionHandle);
        assert_eq!(mgr.commit(&h, &other).unwrap_err().kind, ErrorKind::InvalidTransactionHandle);
        mgr.commit(&h, &owner).unwrap();
        assert_eq!(mgr.check(&h, &owner).unwrap_err().kind, ErrorKind::InvalidTransactionHandle);
        let bogus = TransactionHandle::new("nope");
        assert!(mgr.rollback(&bogus, &owner).is_err());
    }

    #[test]
    fn commit_applies_records_and_staged_kv() {
        let (mgr, store, kv) = manager();
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        mgr.with_connection(&h, &s, |c| records::insert(c, "c", serde_json::Map::new()))
            .unwrap();
        mgr.stage(
            &h,
            &s,
            StagedWrite::Kv {
                key: "k".into(),
                value: json!(1),
                ttl_secs: 0,
            },
        )
        .unwrap();
        assert_eq!(mgr.staged_kv(&h, &s, "k").unwrap(), Some(json!(1)));
        assert_eq!(kv.get("k"), None);

        mgr.commit(&h, &s).unwrap();
        assert_eq!(count(&store), 1);
        assert_eq!(kv.get("k"), Some(json!(1)));
        assert_eq!(
            mgr.stats(),
            TxStats {
                open: 0,
                committed: 1,
                rolled_back: 0
            }
        );
    }

    #[test]
    fn commit_into_full_kv_store_lands_every_write() {
        let kv = Arc::new(KvStore::new(1));
        kv.set("existing", json!(0), 0);
        let (mgr, store, kv) = manager_with(kv, Arc::new(JobQueue::new()));
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        mgr.with_connection(&h, &s, |c| records::insert(c, "c", serde_json::Map::new()))
            .unwrap();
        stage_kv(&mgr, &h, &s, "k");

        mgr.commit(&h, &s).unwrap();
        assert_eq!(count(&store), 1);
        assert_eq!(kv.get("k"), Some(json!(1)));
        assert!(kv.len() <= 1);
    }

    #[test]
    fn commit_that_cannot_apply_staged_writes_rolls_back() {
        let jobs = Arc::new(JobQueue::new());
        let (mgr, store, kv) = manager_with(Arc::new(KvStore::new(100)), Arc::clone(&jobs));
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        mgr.with_connection(&h, &s, |c| records::insert(c, "c", serde_json::Map::new()))
            .unwrap();
        stage_kv(&mgr, &h, &s, "k");
        let job = jobs.prepare(NewJob {
            topic: "t".into(),
            payload: Value::Null,
            delay_secs: 0,
            priority: 5,
            max_retries: 3,
        });
        mgr.stage(&h, &s, StagedWrite::Job(job)).unwrap();
        jobs.poison();

        let err = mgr.commit(&h, &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::HostError);
        assert_eq!(count(&store), 0);
        assert_eq!(kv.get("k"), None);
        assert_eq!(
            mgr.stats(),
            TxStats {
                open: 0,
                committed: 0,
                rolled_back: 1
            }
        );
    }

    #[test]
    fn rollback_discards_everything() {
        let (mgr, store, kv) = manager();
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        mgr.with_connection(&h, &s, |c| records::insert(c, "c", serde_json::Map::new()))
            .unwrap();
        mgr.stage(
            &h,
            &s,
            StagedWrite::Kv {
                key: "k".into(),
                value: json!(1),
                ttl_secs: 0,
            },
        )
        .unwrap();
        mgr.rollback(&h, &s).unwrap();
        assert_eq!(count(&store), 0);
        assert_eq!(kv.get("k"), None);
        assert_eq!(mgr.stats().rolled_back, 1);
    }

    #[test]
    fn session_cleanup_rolls_back() {
        let (mgr, store, _) = manager();
        let s = Session::new();
        let h = mgr.begin(&s).unwrap();
        mgr.with_connection(&h, &s, |c| records::insert(c, "c", serde_json::Map::new()))
            .unwrap();
        assert_eq!(mgr.rollback_session(s.id()), 1);
        assert_eq!(mgr.rollback_session(s.id()), 0);
        assert_eq!(count(&store), 0);
        assert_eq!(mgr.stats().open, 0);
    }
}
