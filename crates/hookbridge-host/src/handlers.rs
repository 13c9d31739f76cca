//! Standard op handlers.
//!
//! One handler per [`OpCode`], each a thin adapter from a validated payload
//! to a call on [`Services`].  Calls carrying a transaction handle read and
//! write through the transaction:
//!
//! - `DbQuery` and `VectorSearch` run on the transaction's connection.
//! - `KvSet` and `JobEnqueue` are staged until commit; `KvGet` sees staged
//!   writes first.
//! - `FileSave` writes immediately; attachments are not transactional.

use std::sync::Arc;

use hookbridge_protocol::{OpCode, Payload, binary};
use serde_json::{Value, json};

use crate::error::{Fault, Result};
use crate::filter::Filter;
use crate::jobs::NewJob;
use crate::records::{self, DbQuery};
use crate::registry::{CallContext, HandlerRegistry, OpHandler};
use crate::services::Services;
use crate::tx::StagedWrite;
use crate::{utils, vector};

/// A registry holding a handler for every op, all backed by `services`.
pub fn standard_handlers(services: &Arc<Services>) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    let s = || Arc::clone(services);
    registry.register(Fetch(s()))?;
    registry.register(DbQueryHandler(s()))?;
    registry.register(KvGet(s()))?;
    registry.register(KvSet(s()))?;
    registry.register(SecretGet(s()))?;
    registry.register(JobEnqueue(s()))?;
    registry.register(FileRead(s()))?;
    registry.register(FileSave(s()))?;
    registry.register(VectorSearch(s()))?;
    registry.register(TxBegin(s()))?;
    registry.register(TxCommit(s()))?;
    registry.register(TxRollback(s()))?;
    registry.register(Utils)?;
    Ok(registry)
}

fn text<'a>(payload: &'a Payload, name: &str) -> std::result::Result<&'a str, Fault> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::invalid(name, "is required"))
}

fn uint(payload: &Payload, name: &str, default: u64) -> u64 {
    payload.get(name).and_then(Value::as_u64).unwrap_or(default)
}

/// Run `f` on the transaction's connection, or the primary one outside a transaction.
fn on_connection<T>(
    services: &Services,
    ctx: &CallContext<'_>,
    f: impl FnOnce(&rusqlite::Connection) -> std::result::Result<T, Fault>,
) -> std::result::Result<T, Fault> {
    match ctx.tx {
        Some(handle) => services.transactions.with_connection(handle, ctx.session, f),
        None => services.records.with_connection(f),
    }
}

fn live_tx<'a>(
    ctx: &CallContext<'a>,
) -> std::result::Result<&'a hookbridge_protocol::TransactionHandle, Fault> {
    ctx.tx
        .ok_or_else(|| Fault::bad_handle("no transaction on this call"))
}

// ---------------------------------------------------------------------------
// Network and data
// ---------------------------------------------------------------------------

struct Fetch(Arc<Services>);

impl OpHandler for Fetch {
    fn op(&self) -> OpCode {
        OpCode::Fetch
    }

    fn handle(
        &self,
        _ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let request = self.0.fetch.prepare(&payload)?;
        self.0.fetch.execute(request)
    }
}

struct DbQueryHandler(Arc<Services>);

impl OpHandler for DbQueryHandler {
    fn op(&self) -> OpCode {
        OpCode::DbQuery
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let query = DbQuery::from_payload(&payload)?;
        on_connection(&self.0, ctx, |conn| records::execute(conn, &query))
    }
}

struct VectorSearch(Arc<Services>);

impl OpHandler for VectorSearch {
    fn op(&self) -> OpCode {
        OpCode::VectorSearch
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let collection = text(&payload, "col")?;
        let field = text(&payload, "field")?;
        let query = payload
            .get("vector")
            .and_then(vector::as_vector)
            .ok_or_else(|| Fault::invalid("vector", "expected number[]"))?;
        let filter = payload
            .get("filter")
            .and_then(Value::as_str)
            .map(Filter::parse)
            .transpose()?;
        let top = uint(&payload, "top", 10) as usize;

        let candidates = on_connection(&self.0, ctx, |conn| {
            records::select(conn, collection, filter.as_ref())
        })?;
        Ok(Value::Array(vector::search(candidates, &query, field, top)))
    }
}

// ---------------------------------------------------------------------------
// Key-value, secrets, jobs
// ---------------------------------------------------------------------------

struct KvGet(Arc<Services>);

impl OpHandler for KvGet {
    fn op(&self) -> OpCode {
        OpCode::KvGet
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let key = text(&payload, "key")?;
        if let Some(handle) = ctx.tx {
            if let Some(staged) = self.0.transactions.staged_kv(handle, ctx.session, key)? {
                return Ok(json!({ "value": staged }));
            }
        }
        Ok(json!({ "value": self.0.kv.get(key) }))
    }
}

struct KvSet(Arc<Services>);

impl OpHandler for KvSet {
    fn op(&self) -> OpCode {
        OpCode::KvSet
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        mut payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let key = text(&payload, "key")?.to_owned();
        let ttl_secs = uint(&payload, "ttl", 0);
        let value = payload.remove("value").unwrap_or(Value::Null);
        match ctx.tx {
            Some(handle) => self.0.transactions.stage(
                handle,
                ctx.session,
                StagedWrite::Kv {
                    key,
                    value,
                    ttl_secs,
                },
            )?,
            None => self.0.kv.set(&key, value, ttl_secs),
        }
        Ok(json!({ "ok": true }))
    }
}

struct SecretGet(Arc<Services>);

impl OpHandler for SecretGet {
    fn op(&self) -> OpCode {
        OpCode::SecretGet
    }

    fn handle(
        &self,
        _ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let key = text(&payload, "key")?;
        Ok(json!({ "value": self.0.secrets.get(key) }))
    }
}

struct JobEnqueue(Arc<Services>);

impl OpHandler for JobEnqueue {
    fn op(&self) -> OpCode {
        OpCode::JobEnqueue
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let new_job = NewJob::from_payload(&payload)?;
        let job = match ctx.tx {
            Some(handle) => {
                let job = self.0.jobs.prepare(new_job);
                self.0
                    .transactions
                    .stage(handle, ctx.session, StagedWrite::Job(job.clone()))?;
                job
            }
            None => self.0.jobs.enqueue(new_job)?,
        };
        Ok(json!({ "id": job.id }))
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

struct FileRead(Arc<Services>);

impl OpHandler for FileRead {
    fn op(&self) -> OpCode {
        OpCode::FileRead
    }

    fn handle(
        &self,
        _ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let filename = text(&payload, "filename")?;
        let bytes = self.0.files.read(
            text(&payload, "collection")?,
            text(&payload, "recordId")?,
            filename,
        )?;
        Ok(json!({
            "filename": filename,
            "size": bytes.len(),
            "data": binary::encode(&bytes),
        }))
    }
}

struct FileSave(Arc<Services>);

impl OpHandler for FileSave {
    fn op(&self) -> OpCode {
        OpCode::FileSave
    }

    fn handle(
        &self,
        _ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let filename = text(&payload, "filename")?;
        let bytes = binary::decode("data", text(&payload, "data")?)?;
        let size = self.0.files.save(
            text(&payload, "collection")?,
            text(&payload, "recordId")?,
            filename,
            &bytes,
        )?;
        Ok(json!({ "filename": filename, "size": size }))
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

struct TxBegin(Arc<Services>);

impl OpHandler for TxBegin {
    fn op(&self) -> OpCode {
        OpCode::TxBegin
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        _payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        let handle = self.0.transactions.begin(ctx.session)?;
        Ok(json!({ "txId": handle.as_str() }))
    }
}

struct TxCommit(Arc<Services>);

impl OpHandler for TxCommit {
    fn op(&self) -> OpCode {
        OpCode::TxCommit
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        _payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        self.0.transactions.commit(live_tx(ctx)?, ctx.session)?;
        Ok(json!({ "committed": true }))
    }
}

struct TxRollback(Arc<Services>);

impl OpHandler for TxRollback {
    fn op(&self) -> OpCode {
        OpCode::TxRollback
    }

    fn handle(
        &self,
        ctx: &CallContext<'_>,
        _payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        self.0.transactions.rollback(live_tx(ctx)?, ctx.session)?;
        Ok(json!({ "rolledBack": true }))
    }
}

// ---------------------------------------------------------------------------
// Utils
// ---------------------------------------------------------------------------

struct Utils;

impl OpHandler for Utils {
    fn op(&self) -> OpCode {
        OpCode::Utils
    }

    fn handle(
        &self,
        _ctx: &CallContext<'_>,
        payload: Payload,
    ) -> std::result::Result<Value, Fault> {
        utils::run(
            text(&payload, "op")?,
            payload.get("input").and_then(Value::as_str),
            uint(&payload, "len", 16) as usize,
        )
    }
}
