//! SQLite-backed record store.
//!
//! Records are JSON objects keyed by `(collection, id)` with `created` and
//! `updated` timestamps.  [`RecordStore`] wraps the primary connection behind
//! an `Arc<Mutex<>>`; transactions get their own connection from
//! [`RecordStore::begin`] so their writes stay invisible until commit.
//!
//! File databases run in WAL mode.  Without a path the store uses a named
//! in-memory database in shared-cache mode, so transaction connections see
//! the same data as the primary one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use hookbridge_protocol::Payload;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Fault, Result};
use crate::filter::{self, Filter, SortKey};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    data       TEXT NOT NULL,
    created    TEXT NOT NULL,
    updated    TEXT NOT NULL,
    PRIMARY KEY (collection, id)
) WITHOUT ROWID;
";

/// Keys managed by the store and stripped from stored data.
const SYSTEM_FIELDS: [&str; 4] = ["id", "collectionName", "created", "updated"];

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Memory(String),
}

/// Thread-safe handle to the record database.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
    source: Source,
}

impl RecordStore {
    /// Open (or create) a database file and apply pragmas.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening record store");
        Self::with_source(Source::File(path.to_path_buf()))
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:hookbridge-{}?mode=memory&cache=shared",
            uuid::Uuid::now_v7().simple()
        );
        debug!(%uri, "opening in-memory record store");
        Self::with_source(Source::Memory(uri))
    }

    /// Open according to `config`.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    fn with_source(source: Source) -> Result<Self> {
        let conn = connect(&source)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            source,
        })
    }

    /// Open a dedicated connection holding a write transaction (`BEGIN IMMEDIATE`).
    pub fn begin(&self) -> Result<Connection> {
        let conn = connect(&self.source)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(conn)
    }

    /// Run `f` against the primary connection.
    pub fn with_connection<T, F>(&self, f: F) -> std::result::Result<T, Fault>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, Fault>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Fault::host(format!("record store mutex poisoned: {e}")))?;
        f(&conn)
    }
}

fn connect(source: &Source) -> Result<Connection> {
    let conn = match source {
        Source::File(path) => {
            let conn = Connection::open(path)?;
            apply_pragmas(&conn)?;
            conn
        }
        Source::Memory(uri) => {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let conn = Connection::open_with_flags(uri, flags)?;
            conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
            conn
        }
    };
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    // WAL: readers keep working while a transaction connection writes.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // Writers wait for an open transaction instead of failing immediately.
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    debug!("record store pragmas applied (WAL, busy_timeout 5s)");
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// `(collection, id, data, created, updated)` as read from a row.
type RawRecord = (String, String, String, String, String);

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub collection: String,
    pub data: Map<String, Value>,
    pub created: String,
    pub updated: String,
}

impl Record {
    /// The JSON shape returned to sandboxed code.
    pub fn to_value(&self) -> Value {
        let mut out = Map::with_capacity(self.data.len() + 4);
        out.insert("id".into(), Value::String(self.id.clone()));
        out.insert(
            "collectionName".into(),
            Value::String(self.collection.clone()),
        );
        out.insert("created".into(), Value::String(self.created.clone()));
        out.insert("updated".into(), Value::String(self.updated.clone()));
        for (k, v) in &self.data {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode(raw: RawRecord) -> std::result::Result<Self, Fault> {
        let (collection, id, data, created, updated) = raw;
        let data = match serde_json::from_str::<Value>(&data)? {
            Value::Object(map) => map,
            _ => return Err(Fault::host(format!("record {collection}/{id} is not an object"))),
        };
        Ok(Self {
            id,
            collection,
            data,
            created,
            updated,
        })
    }
}

fn strip_system_fields(mut data: Map<String, Value>) -> Map<String, Value> {
    for key in SYSTEM_FIELDS {
        data.remove(key);
    }
    data
}

/// Look up one record.
pub fn find(
    conn: &Connection,
    collection: &str,
    id: &str,
) -> std::result::Result<Option<Record>, Fault> {
    let raw = conn
        .query_row(
            "SELECT collection, id, data, created, updated FROM records
             WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            Record::from_row,
        )
        .optional()?;
    raw.map(Record::decode).transpose()
}

/// Every record of `collection`, ordered by id (UUIDv7 ids sort by creation).
pub fn load(conn: &Connection, collection: &str) -> std::result::Result<Vec<Record>, Fault> {
    let mut stmt = conn.prepare_cached(
        "SELECT collection, id, data, created, updated FROM records
         WHERE collection = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![collection], Record::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(Record::decode(row?)?);
    }
    Ok(out)
}

/// Insert a record, generating a UUIDv7 id unless `data.id` is given.
pub fn insert(
    conn: &Connection,
    collection: &str,
    data: Map<String, Value>,
) -> std::result::Result<Record, Fault> {
    let id = match data.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::String(_)) | Some(Value::Null) | None => uuid::Uuid::now_v7().to_string(),
        Some(_) => return Err(Fault::invalid("data", "`id` must be a string")),
    };
    let data = strip_system_fields(data);
    let ts = now();
    conn.execute(
        "INSERT INTO records (collection, id, data, created, updated) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![collection, id, serde_json::to_string(&data)?, ts],
    )?;
    Ok(Record {
        id,
        collection: collection.to_owned(),
        data,
        created: ts.clone(),
        updated: ts,
    })
}

/// Merge `patch` into an existing record.
pub fn update(
    conn: &Connection,
    collection: &str,
    id: &str,
    patch: Map<String, Value>,
) -> std::result::Result<Record, Fault> {
    let mut record = find(conn, collection, id)?
        .ok_or_else(|| Fault::host(format!("record {collection}/{id} not found")))?;
    for (k, v) in strip_system_fields(patch) {
        record.data.insert(k, v);
    }
    record.updated = now();
    conn.execute(
        "UPDATE records SET data = ?3, updated = ?4 WHERE collection = ?1 AND id = ?2",
        params![collection, id, serde_json::to_string(&record.data)?, record.updated],
    )?;
    Ok(record)
}

/// Delete one record, returning whether it existed.
pub fn delete(conn: &Connection, collection: &str, id: &str) -> std::result::Result<bool, Fault> {
    let n = conn.execute(
        "DELETE FROM records WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    Ok(n > 0)
}

/// Records of `collection` passing `filter`, as JSON values.
pub fn select(
    conn: &Connection,
    collection: &str,
    filter: Option<&Filter>,
) -> std::result::Result<Vec<Value>, Fault> {
    Ok(load(conn, collection)?
        .iter()
        .map(Record::to_value)
        .filter(|v| filter.is_none_or(|f| f.matches(v)))
        .collect())
}

// ---------------------------------------------------------------------------
// DbQuery
// ---------------------------------------------------------------------------

/// What a `DbQuery` call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbAction {
    One,
    List,
    Create,
    Update,
    Delete,
    Count,
}

/// A validated `DbQuery` payload.
#[derive(Debug, Clone)]
pub struct DbQuery {
    pub action: DbAction,
    pub collection: String,
    pub id: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub page: usize,
    pub per_page: usize,
    pub filter: Option<Filter>,
    pub sort: Vec<SortKey>,
}

impl DbQuery {
    /// Build from a payload that already passed schema validation.
    pub fn from_payload(payload: &Payload) -> std::result::Result<Self, Fault> {
        let action = match payload.get("op").and_then(Value::as_str) {
            Some("one") => DbAction::One,
            Some("list") => DbAction::List,
            Some("create") => DbAction::Create,
            Some("update") => DbAction::Update,
            Some("delete") => DbAction::Delete,
            Some("count") => DbAction::Count,
            _ => return Err(Fault::invalid("op", "unknown query action")),
        };
        let text = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_owned);
        let count = |name: &str, default: usize| {
            payload
                .get(name)
                .and_then(Value::as_u64)
                .map_or(default, |n| n as usize)
        };
        Ok(Self {
            action,
            collection: text("col").ok_or_else(|| Fault::invalid("col", "is required"))?,
            id: text("id"),
            data: payload.get("data").and_then(Value::as_object).cloned(),
            page: count("page", 1).max(1),
            per_page: count("perPage", 20).max(1),
            filter: text("filter").as_deref().map(Filter::parse).transpose()?,
            sort: text("sort")
                .as_deref()
                .map(filter::parse_sort)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    fn require_id(&self) -> std::result::Result<&str, Fault> {
        self.id
            .as_deref()
            .ok_or_else(|| Fault::invalid("id", "is required"))
    }

    fn take_data(&self) -> std::result::Result<Map<String, Value>, Fault> {
        self.data
            .clone()
            .ok_or_else(|| Fault::invalid("data", "is required"))
    }
}

/// Run `query` on `conn`.
pub fn execute(conn: &Connection, query: &DbQuery) -> std::result::Result<Value, Fault> {
    let col = query.collection.as_str();
    match query.action {
        DbAction::One => {
            let id = query.require_id()?;
            find(conn, col, id)?
                .map(|r| r.to_value())
                .ok_or_else(|| Fault::host(format!("record {col}/{id} not found")))
        }
        DbAction::Create => Ok(insert(conn, col, query.take_data()?)?.to_value()),
        DbAction::Update => {
            let id = query.require_id()?;
            Ok(update(conn, col, id, query.take_data()?)?.to_value())
        }
        DbAction::List => {
            let mut items = select(conn, col, query.filter.as_ref())?;
            if !query.sort.is_empty() {
                items.sort_by(|a, b| filter::compare(a, b, &query.sort));
            }
            let total = items.len();
            let items: Vec<Value> = items
                .into_iter()
                .skip((query.page - 1).saturating_mul(query.per_page))
                .take(query.per_page)
                .collect();
            Ok(json!({
                "page": query.page,
                "perPage": query.per_page,
                "totalItems": total,
                "items": items,
            }))
        }
        DbAction::Count => {
            let count = select(conn, col, query.filter.as_ref())?.len();
            Ok(json!({ "count": count }))
        }
        DbAction::Delete => {
            let targets: Vec<String> = match (&query.id, &query.filter) {
                (Some(id), None) => vec![id.clone()],
                (Some(id), Some(f)) => find(conn, col, id)?
                    .filter(|r| f.matches(&r.to_value()))
                    .map(|r| r.id)
                    .into_iter()
                    .collect(),
                (None, Some(f)) => select(conn, col, Some(f))?
                    .iter()
                    .filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_owned))
                    .collect(),
                (None, None) => return Err(Fault::invalid("id", "delete needs `id` or `filter`")),
            };
            let mut deleted = 0u64;
            for id in &targets {
                if delete(conn, col, id)? {
                    deleted += 1;
                }
            }
            debug!(collection = col, deleted, "records deleted");
            Ok(json!({ "deleted": deleted }))
        }
    }
}
