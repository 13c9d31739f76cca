//! Per-op payload schemas.
//!
//! Each [`OpCode`] declares its required fields, its optional fields and their
//! defaults, and the shape of its success payload.  [`validate`] checks a
//! payload against the declaration, fills in defaults, and applies the
//! op-specific rules.  Both sides run it: the sandbox before allocating any
//! memory for a call, the host again before touching a capability.
//!
//! Binary data (file contents) is always carried as a standard base64 string
//! in the `data` field; see [`crate::binary`].

use serde_json::{Number, Value};

use crate::envelope::Payload;
use crate::error::ProtocolError;
use crate::opcode::OpCode;

/// JSON shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string.  Required strings must also be non-empty.
    String,
    /// Whole JSON number.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON object.
    Object,
    /// Array of JSON numbers.
    NumberArray,
    /// Any JSON value, including `null`.
    Any,
}

impl FieldKind {
    /// Short name used in error messages and listings.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Object => "object",
            Self::NumberArray => "number[]",
            Self::Any => "any",
        }
    }
}

/// Value filled in when an optional field is absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    /// String literal.
    Str(&'static str),
    /// Integer literal.
    Int(i64),
    /// JSON `null`.
    Null,
    /// `{}`.
    EmptyObject,
}

impl DefaultValue {
    /// Materialize as a JSON value.
    pub fn to_value(self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.to_owned()),
            Self::Int(n) => Value::Number(n.into()),
            Self::Null => Value::Null,
            Self::EmptyObject => Value::Object(Payload::new()),
        }
    }
}

/// Whether a field must be supplied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Presence {
    /// Must be present (and non-null unless the kind is [`FieldKind::Any`]).
    Required,
    /// May be omitted; the default is filled in when one is declared.
    Optional(Option<DefaultValue>),
}

/// One declared payload field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    /// Wire name.
    pub name: &'static str,
    /// Expected shape.
    pub kind: FieldKind,
    /// Required or optional.
    pub presence: Presence,
}

impl Field {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            presence: Presence::Required,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            presence: Presence::Optional(None),
        }
    }

    const fn defaulted(name: &'static str, kind: FieldKind, default: DefaultValue) -> Self {
        Self {
            name,
            kind,
            presence: Presence::Optional(Some(default)),
        }
    }
}

/// Declared contract of one op.
#[derive(Debug)]
pub struct OpSchema {
    /// The op this schema belongs to.
    pub op: OpCode,
    /// Declared request fields.
    pub fields: &'static [Field],
    /// Shape of the success payload, for documentation and listings.
    pub returns: &'static str,
}

/// Sub-operations accepted by `DbQuery`.
pub const DB_ACTIONS: &[&str] = &["one", "list", "create", "update", "delete", "count"];

/// Sub-operations accepted by `Utils`.
pub const UTIL_FUNCS: &[&str] = &[
    "uuid",
    "hash",
    "randomString",
    "base64Encode",
    "base64Decode",
    "now",
];

/// HTTP methods accepted by `Fetch`.
pub const FETCH_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Largest `top` a vector search may ask for.
pub const MAX_VECTOR_TOP: i64 = 1000;

/// Largest page size a record listing may ask for.
pub const MAX_PER_PAGE: i64 = 500;

/// Longest random string `Utils` will generate.
pub const MAX_RANDOM_LEN: i64 = 1024;

/// Longest `KvSet` TTL in seconds (ten years).
pub const MAX_KV_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

use DefaultValue as D;
use FieldKind as K;

static FETCH: OpSchema = OpSchema {
    op: OpCode::Fetch,
    fields: &[
        Field::required("url", K::String),
        Field::defaulted("method", K::String, D::Str("GET")),
        Field::defaulted("headers", K::Object, D::EmptyObject),
        Field::optional("body", K::String),
        Field::defaulted("timeout", K::Integer, D::Int(30)),
    ],
    returns: "{status: integer, headers: object, body: string}",
};

static DB_QUERY: OpSchema = OpSchema {
    op: OpCode::DbQuery,
    fields: &[
        Field::required("op", K::String),
        Field::required("col", K::String),
        Field::optional("id", K::String),
        Field::optional("data", K::Object),
        Field::defaulted("page", K::Integer, D::Int(1)),
        Field::defaulted("perPage", K::Integer, D::Int(20)),
        Field::optional("filter", K::String),
        Field::optional("sort", K::String),
    ],
    returns: "record | {page, perPage, totalItems, items} | {deleted} | {count}",
};

static KV_GET: OpSchema = OpSchema {
    op: OpCode::KvGet,
    fields: &[Field::required("key", K::String)],
    returns: "{value: any | null}",
};

static KV_SET: OpSchema = OpSchema {
    op: OpCode::KvSet,
    fields: &[
        Field::required("key", K::String),
        Field::required("value", K::Any),
        Field::defaulted("ttl", K::Integer, D::Int(0)),
    ],
    returns: "{ok: true}",
};

static SECRET_GET: OpSchema = OpSchema {
    op: OpCode::SecretGet,
    fields: &[Field::required("key", K::String)],
    returns: "{value: string | null}",
};

static JOB_ENQUEUE: OpSchema = OpSchema {
    op: OpCode::JobEnqueue,
    fields: &[
        Field::required("topic", K::String),
        Field::defaulted("payload", K::Any, D::Null),
        Field::defaulted("delay", K::Integer, D::Int(0)),
        Field::defaulted("priority", K::Integer, D::Int(5)),
        Field::defaulted("maxRetries", K::Integer, D::Int(3)),
    ],
    returns: "{id: string}",
};

static FILE_READ: OpSchema = OpSchema {
    op: OpCode::FileRead,
    fields: &[
        Field::required("collection", K::String),
        Field::required("recordId", K::String),
        Field::required("filename", K::String),
    ],
    returns: "{filename: string, size: integer, data: base64 string}",
};

static FILE_SAVE: OpSchema = OpSchema {
    op: OpCode::FileSave,
    fields: &[
        Field::required("collection", K::String),
        Field::required("recordId", K::String),
        Field::required("filename", K::String),
        Field::required("data", K::String),
    ],
    returns: "{filename: string, size: integer}",
};

static VECTOR_SEARCH: OpSchema = OpSchema {
    op: OpCode::VectorSearch,
    fields: &[
        Field::required("col", K::String),
        Field::required("vector", K::NumberArray),
        Field::required("field", K::String),
        Field::optional("filter", K::String),
        Field::defaulted("top", K::Integer, D::Int(10)),
    ],
    returns: "[{id, distance, record}] closest first, length <= top",
};

static TX_BEGIN: OpSchema = OpSchema {
    op: OpCode::TxBegin,
    fields: &[],
    returns: "{txId: string}",
};

static TX_COMMIT: OpSchema = OpSchema {
    op: OpCode::TxCommit,
    fields: &[Field::required("txId", K::String)],
    returns: "{committed: true}",
};

static TX_ROLLBACK: OpSchema = OpSchema {
    op: OpCode::TxRollback,
    fields: &[Field::required("txId", K::String)],
    returns: "{rolledBack: true}",
};

static UTILS: OpSchema = OpSchema {
    op: OpCode::Utils,
    fields: &[
        Field::required("op", K::String),
        Field::optional("input", K::String),
        Field::defaulted("len", K::Integer, D::Int(16)),
    ],
    returns: "{value: string}",
};

/// The declared schema for `op`.
pub fn schema(op: OpCode) -> &'static OpSchema {
    match op {
        OpCode::Fetch => &FETCH,
        OpCode::DbQuery => &DB_QUERY,
        OpCode::KvGet => &KV_GET,
        OpCode::KvSet => &KV_SET,
        OpCode::SecretGet => &SECRET_GET,
        OpCode::JobEnqueue => &JOB_ENQUEUE,
        OpCode::FileRead => &FILE_READ,
        OpCode::FileSave => &FILE_SAVE,
        OpCode::VectorSearch => &VECTOR_SEARCH,
        OpCode::TxBegin => &TX_BEGIN,
        OpCode::TxCommit => &TX_COMMIT,
        OpCode::TxRollback => &TX_ROLLBACK,
        OpCode::Utils => &UTILS,
    }
}

/// Validate `payload` for `op`, returning it with defaults filled in.
pub fn validate(op: OpCode, payload: Payload) -> Result<Payload, ProtocolError> {
    schema(op).validate(payload)
}

impl OpSchema {
    /// Check declared fields, fill defaults, then apply op-specific rules.
    ///
    /// Undeclared fields pass through untouched.
    pub fn validate(&self, mut payload: Payload) -> Result<Payload, ProtocolError> {
        for field in self.fields {
            check_field(field, &mut payload)?;
        }
        check_rules(self.op, &mut payload)?;
        Ok(payload)
    }

    /// Look up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn check_field(field: &Field, payload: &mut Payload) -> Result<(), ProtocolError> {
    let present = match payload.get(field.name) {
        None => false,
        Some(Value::Null) => field.kind == FieldKind::Any,
        Some(_) => true,
    };

    if !present {
        match field.presence {
            Presence::Required => {
                return Err(ProtocolError::invalid(field.name, "is required"));
            }
            Presence::Optional(default) => {
                payload.remove(field.name);
                if let Some(default) = default {
                    payload.insert(field.name.to_owned(), default.to_value());
                }
                return Ok(());
            }
        }
    }

    let Some(value) = payload.get_mut(field.name) else {
        return Ok(());
    };
    let ok = match field.kind {
        FieldKind::String => match value.as_str() {
            Some(s) => !(s.is_empty() && field.presence == Presence::Required),
            None => false,
        },
        FieldKind::Integer => normalize_integer(value),
        FieldKind::Number => value.is_number(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Object => value.is_object(),
        FieldKind::NumberArray => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_number)),
        FieldKind::Any => true,
    };

    if ok {
        Ok(())
    } else if field.kind == FieldKind::String && value.is_string() {
        Err(ProtocolError::invalid(field.name, "must not be empty"))
    } else {
        Err(ProtocolError::invalid(
            field.name,
            format!("expected {}", field.kind.describe()),
        ))
    }
}

/// Accept whole numbers written as floats (`5.0`) and rewrite them as integers.
fn normalize_integer(value: &mut Value) -> bool {
    if value.is_i64() || value.is_u64() {
        return true;
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            *value = Value::Number(Number::from(f as i64));
            true
        }
        _ => false,
    }
}

fn str_of<'a>(payload: &'a Payload, name: &str) -> Option<&'a str> {
    payload.get(name).and_then(Value::as_str)
}

fn int_of(payload: &Payload, name: &str) -> Option<i64> {
    payload.get(name).and_then(Value::as_i64)
}

fn check_range(payload: &Payload, name: &str, min: i64, max: i64) -> Result<(), ProtocolError> {
    match payload.get(name) {
        None => Ok(()),
        Some(_) => match int_of(payload, name) {
            Some(n) if (min..=max).contains(&n) => Ok(()),
            _ => Err(ProtocolError::invalid(
                name,
                format!("must be between {min} and {max}"),
            )),
        },
    }
}

fn check_one_of(payload: &Payload, name: &str, allowed: &[&str]) -> Result<(), ProtocolError> {
    match str_of(payload, name) {
        Some(s) if allowed.contains(&s) => Ok(()),
        _ => Err(ProtocolError::invalid(
            name,
            format!("must be one of: {}", allowed.join(", ")),
        )),
    }
}

fn require(payload: &Payload, name: &str, context: &str) -> Result<(), ProtocolError> {
    match payload.get(name) {
        Some(Value::Null) | None => Err(ProtocolError::invalid(
            name,
            format!("is required for {context}"),
        )),
        Some(_) => Ok(()),
    }
}

/// Whether `segment` is safe to use as a single path component.
pub fn is_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 255
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

fn check_rules(op: OpCode, payload: &mut Payload) -> Result<(), ProtocolError> {
    match op {
        OpCode::Fetch => {
            if let Some(method) = str_of(payload, "method") {
                let upper = method.to_ascii_uppercase();
                payload.insert("method".into(), Value::String(upper));
            }
            check_one_of(payload, "method", FETCH_METHODS)?;
            check_range(payload, "timeout", 1, 300)?;
            if let Some(Value::Object(headers)) = payload.get("headers") {
                if let Some((name, _)) = headers.iter().find(|(_, v)| !v.is_string()) {
                    return Err(ProtocolError::invalid(
                        "headers",
                        format!("header `{name}` must be a string"),
                    ));
                }
            }
        }
        OpCode::DbQuery => {
            check_one_of(payload, "op", DB_ACTIONS)?;
            let action = str_of(payload, "op").unwrap_or_default().to_owned();
            match action.as_str() {
                "one" => require(payload, "id", "op `one`")?,
                "create" => require(payload, "data", "op `create`")?,
                "update" => {
                    require(payload, "id", "op `update`")?;
                    require(payload, "data", "op `update`")?;
                }
                "delete" => {
                    if !payload.contains_key("id") && !payload.contains_key("filter") {
                        return Err(ProtocolError::invalid(
                            "id",
                            "op `delete` requires `id` or `filter`",
                        ));
                    }
                }
                _ => {}
            }
            check_range(payload, "page", 1, i64::MAX)?;
            check_range(payload, "perPage", 1, MAX_PER_PAGE)?;
        }
        OpCode::KvSet => check_range(payload, "ttl", 0, MAX_KV_TTL_SECS)?,
        OpCode::JobEnqueue => {
            check_range(payload, "delay", 0, i64::MAX)?;
            check_range(payload, "priority", 1, 10)?;
            check_range(payload, "maxRetries", 0, 100)?;
        }
        OpCode::FileRead | OpCode::FileSave => {
            for name in ["collection", "recordId", "filename"] {
                if !str_of(payload, name).is_some_and(is_path_segment) {
                    return Err(ProtocolError::invalid(
                        name,
                        "must be a single path segment",
                    ));
                }
            }
        }
        OpCode::VectorSearch => {
            let empty = payload
                .get("vector")
                .and_then(Value::as_array)
                .is_none_or(Vec::is_empty);
            if empty {
                return Err(ProtocolError::invalid("vector", "must not be empty"));
            }
            check_range(payload, "top", 1, MAX_VECTOR_TOP)?;
        }
        OpCode::Utils => {
            check_one_of(payload, "op", UTIL_FUNCS)?;
            let func = str_of(payload, "op").unwrap_or_default();
            if matches!(func, "hash" | "base64Encode" | "base64Decode") {
                let context = format!("op `{func}`");
                require(payload, "input", &context)?;
            }
            check_range(payload, "len", 0, MAX_RANDOM_LEN)?;
        }
        OpCode::KvGet
        | OpCode::SecretGet
        | OpCode::TxBegin
        | OpCode::TxCommit
        | OpCode::TxRollback => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn field_of(err: ProtocolError) -> String {
        match err {
            ProtocolError::InvalidArgument { field, .. } => field,
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn every_op_has_a_schema() {
        for op in OpCode::ALL {
            assert_eq!(schema(op).op, op);
        }
    }

    #[test]
    fn kv_get_requires_key() {
        let err = validate(OpCode::KvGet, obj(json!({}))).unwrap_err();
        assert_eq!(field_of(err), "key");

        let err = validate(OpCode::KvGet, obj(json!({"key": ""}))).unwrap_err();
        assert_eq!(field_of(err), "key");

        let err = validate(OpCode::KvGet, obj(json!({"key": 5}))).unwrap_err();
        assert_eq!(field_of(err), "key");

        assert!(validate(OpCode::KvGet, obj(json!({"key": "foo"}))).is_ok());
    }

    #[test]
    fn kv_set_accepts_null_value() {
        let payload = validate(OpCode::KvSet, obj(json!({"key": "a", "value": null}))).unwrap();
        assert_eq!(payload["value"], Value::Null);
        assert_eq!(payload["ttl"], 0);
    }

    #[test]
    fn kv_set_ttl_is_bounded() {
        let payload = obj(json!({"key": "a", "value": 1, "ttl": MAX_KV_TTL_SECS}));
        assert!(validate(OpCode::KvSet, payload).is_ok());

        let err = validate(OpCode::KvSet, obj(json!({"key": "a", "value": 1, "ttl": i64::MAX})))
            .unwrap_err();
        assert_eq!(field_of(err), "ttl");
    }

    #[test]
    fn kv_set_requires_value_key() {
        let err = validate(OpCode::KvSet, obj(json!({"key": "a"}))).unwrap_err();
        assert_eq!(field_of(err), "value");
    }

    #[test]
    fn defaults_are_filled() {
        let payload = validate(OpCode::Fetch, obj(json!({"url": "https://x.test"}))).unwrap();
        assert_eq!(payload["method"], "GET");
        assert_eq!(payload["headers"], json!({}));
        assert_eq!(payload["timeout"], 30);
        assert!(!payload.contains_key("body"));
    }

    #[test]
    fn null_optional_is_treated_as_absent() {
        let payload = validate(
            OpCode::DbQuery,
            obj(json!({"op": "list", "col": "posts", "filter": null, "page": null})),
        )
        .unwrap();
        assert!(!payload.contains_key("filter"));
        assert_eq!(payload["page"], 1);
    }

    #[test]
    fn float_integers_are_normalized() {
        let payload = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [0.1], "field": "embedding", "top": 5.0})),
        )
        .unwrap();
        assert_eq!(payload["top"].as_i64(), Some(5));

        let err = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [0.1], "field": "embedding", "top": 2.5})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "top");
    }

    #[test]
    fn vector_search_rules() {
        let err = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [], "field": "e"})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "vector");

        let err = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [1, "x"], "field": "e"})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "vector");

        let err = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [1.0]})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "field");

        let err = validate(
            OpCode::VectorSearch,
            obj(json!({"col": "docs", "vector": [1.0], "field": "e", "top": 0})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "top");
    }

    #[test]
    fn db_query_action_rules() {
        let err = validate(OpCode::DbQuery, obj(json!({"op": "drop", "col": "x"}))).unwrap_err();
        assert_eq!(field_of(err), "op");

        let err = validate(OpCode::DbQuery, obj(json!({"op": "one", "col": "x"}))).unwrap_err();
        assert_eq!(field_of(err), "id");

        let err =
            validate(OpCode::DbQuery, obj(json!({"op": "update", "col": "x", "id": "1"})))
                .unwrap_err();
        assert_eq!(field_of(err), "data");

        let err = validate(OpCode::DbQuery, obj(json!({"op": "delete", "col": "x"}))).unwrap_err();
        assert_eq!(field_of(err), "id");

        assert!(
            validate(
                OpCode::DbQuery,
                obj(json!({"op": "delete", "col": "x", "filter": "author = 'a'"}))
            )
            .is_ok()
        );

        let err = validate(
            OpCode::DbQuery,
            obj(json!({"op": "list", "col": "x", "perPage": 501})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "perPage");
    }

    #[test]
    fn utils_rules() {
        assert!(validate(OpCode::Utils, obj(json!({"op": "uuid"}))).is_ok());

        let err = validate(OpCode::Utils, obj(json!({"op": "hash"}))).unwrap_err();
        assert_eq!(field_of(err), "input");

        let err = validate(OpCode::Utils, obj(json!({"op": "teleport"}))).unwrap_err();
        assert_eq!(field_of(err), "op");

        let err =
            validate(OpCode::Utils, obj(json!({"op": "randomString", "len": 5000}))).unwrap_err();
        assert_eq!(field_of(err), "len");
    }

    #[test]
    fn file_segments_are_checked() {
        let err = validate(
            OpCode::FileRead,
            obj(json!({"collection": "users", "recordId": "..", "filename": "a.png"})),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "recordId");

        let err = validate(
            OpCode::FileSave,
            obj(json!({
                "collection": "users",
                "recordId": "r1",
                "filename": "a/b",
                "data": "AA==",
            })),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "filename");
    }

    #[test]
    fn fetch_method_is_uppercased() {
        let payload =
            validate(OpCode::Fetch, obj(json!({"url": "https://x.test", "method": "post"})))
                .unwrap();
        assert_eq!(payload["method"], "POST");

        let err = validate(OpCode::Fetch, obj(json!({"url": "https://x.test", "method": "brew"})))
            .unwrap_err();
        assert_eq!(field_of(err), "method");
    }

    #[test]
    fn unknown_fields_pass_through() {
        let payload = validate(OpCode::KvGet, obj(json!({"key": "a", "hint": 1}))).unwrap();
        assert_eq!(payload["hint"], 1);
    }

    #[test]
    fn path_segment_check() {
        assert!(is_path_segment("avatar.jpg"));
        assert!(!is_path_segment(".hidden"));
        assert!(!is_path_segment("a\\b"));
        assert!(!is_path_segment(""));
    }
}
