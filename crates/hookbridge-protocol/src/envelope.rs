//! Request and response envelopes.
//!
//! Requests travel as `{"v": 1, "tx": "...", "payload": {...}}`; the op code
//! is passed separately as the integer argument of the host entrypoint.
//! Responses are exactly one of `{"ok": ...}` or `{"err": {...}}`.  Decoding
//! is strict: anything else is [`ProtocolError::Malformed`], never a
//! best-effort success value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, ProtocolError};
use crate::opcode::OpCode;

/// Version stamped into every request envelope.
pub const WIRE_VERSION: u32 = 1;

/// Structured request payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Opaque identifier returned by `TxBegin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionHandle(String);

impl TransactionHandle {
    /// Wrap a host-issued transaction id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One call from the sandbox to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRequest {
    /// Which capability to invoke.
    pub op: OpCode,
    /// Op-specific arguments.
    pub payload: Payload,
    /// Live transaction the call belongs to, if any.
    pub tx: Option<TransactionHandle>,
}

#[derive(Serialize)]
struct RequestFrameRef<'a> {
    v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx: Option<&'a TransactionHandle>,
    payload: &'a Payload,
}

impl HostRequest {
    /// Build a request outside any transaction.
    pub fn new(op: OpCode, payload: Payload) -> Self {
        Self {
            op,
            payload,
            tx: None,
        }
    }

    /// Attach a transaction handle.
    #[must_use]
    pub fn with_transaction(mut self, tx: Option<TransactionHandle>) -> Self {
        self.tx = tx;
        self
    }

    /// Serialize the envelope (the op code is not part of the bytes).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&RequestFrameRef {
            v: WIRE_VERSION,
            tx: self.tx.as_ref(),
            payload: &self.payload,
        })
        .map_err(|e| ProtocolError::Malformed(format!("request encode failed: {e}")))
    }

    /// Parse request bytes received alongside the integer op `code`.
    ///
    /// Unknown top-level fields are ignored so that newer sandboxes can add
    /// optional data without breaking older hosts.
    pub fn decode(code: u32, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let op = OpCode::try_from(code)?;
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("request is not JSON: {e}")))?;
        let Value::Object(mut frame) = value else {
            return Err(ProtocolError::Malformed(
                "request envelope must be an object".into(),
            ));
        };

        match frame.get("v").and_then(Value::as_u64) {
            Some(v) if v == u64::from(WIRE_VERSION) => {}
            Some(found) => {
                return Err(ProtocolError::UnsupportedVersion {
                    found,
                    expected: WIRE_VERSION,
                });
            }
            None => return Err(ProtocolError::invalid("v", "missing wire version")),
        }

        let tx = match frame.remove("tx") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if !id.is_empty() => Some(TransactionHandle(id)),
            Some(_) => {
                return Err(ProtocolError::invalid(
                    "tx",
                    "transaction handle must be a non-empty string",
                ));
            }
        };

        let payload = match frame.remove("payload") {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(ProtocolError::invalid("payload", "must be an object")),
        };

        Ok(Self { op, payload, tx })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Error half of a [`HostResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Wire error category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Offending payload field for `invalid_argument`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Tagged result of a host call: exactly one variant is populated.
#[derive(Debug, Clone, PartialEq)]
pub enum HostResponse {
    /// The call succeeded with this payload.
    Ok(Value),
    /// The call failed.
    Err(ErrorBody),
}

impl HostResponse {
    /// Success envelope.
    pub fn ok(value: Value) -> Self {
        Self::Ok(value)
    }

    /// Failure envelope without a field.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Err(ErrorBody {
            kind,
            message: message.into(),
            field: None,
        })
    }

    /// `invalid_argument` failure naming the offending field.
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Err(ErrorBody {
            kind: ErrorKind::InvalidArgument,
            message: message.into(),
            field: Some(field.into()),
        })
    }

    /// Serialize to envelope bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Map::with_capacity(1);
        match self {
            Self::Ok(value) => {
                frame.insert("ok".into(), value.clone());
            }
            Self::Err(body) => {
                let body = serde_json::to_value(body)
                    .map_err(|e| ProtocolError::Malformed(format!("error encode failed: {e}")))?;
                frame.insert("err".into(), body);
            }
        }
        serde_json::to_vec(&Value::Object(frame))
            .map_err(|e| ProtocolError::Malformed(format!("response encode failed: {e}")))
    }

    /// Parse envelope bytes, rejecting anything that is not exactly one of
    /// `{"ok": ...}` or `{"err": {...}}`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("response is not JSON: {e}")))?;
        let Value::Object(mut frame) = value else {
            return Err(ProtocolError::Malformed(
                "response envelope must be an object".into(),
            ));
        };
        if frame.len() != 1 {
            return Err(ProtocolError::Malformed(format!(
                "response envelope must have exactly one of `ok` or `err`, found {} keys",
                frame.len()
            )));
        }

        if let Some(value) = frame.remove("ok") {
            return Ok(Self::Ok(value));
        }
        if let Some(body) = frame.remove("err") {
            let body: ErrorBody = serde_json::from_value(body)
                .map_err(|e| ProtocolError::Malformed(format!("invalid error body: {e}")))?;
            return Ok(Self::Err(body));
        }

        let key = frame.keys().next().cloned().unwrap_or_default();
        Err(ProtocolError::Malformed(format!(
            "unexpected response key `{key}`"
        )))
    }

    /// Convert into a standard `Result`.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err(body) => Err(body),
        }
    }
}

impl From<ProtocolError> for HostResponse {
    fn from(err: ProtocolError) -> Self {
        match &err {
            ProtocolError::InvalidArgument { field, reason } => {
                Self::invalid_argument(field.clone(), reason.clone())
            }
            ProtocolError::Malformed(_) | ProtocolError::FrameTooLarge { .. } => {
                Self::invalid_argument("$", err.to_string())
            }
            _ => Self::error(err.kind(), err.to_string()),
        }
    }
}
