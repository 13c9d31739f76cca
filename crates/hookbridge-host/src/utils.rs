//! Stateless helpers behind the `Utils` op.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{SecondsFormat, Utc};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::{Value, json};

use crate::error::Fault;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Run the helper named by `func`.
pub fn run(func: &str, input: Option<&str>, len: usize) -> Result<Value, Fault> {
    let input = || {
        input.ok_or_else(|| Fault::invalid("input", format!("is required for op `{func}`")))
    };
    let value = match func {
        "uuid" => uuid::Uuid::now_v7().to_string(),
        "hash" => sha256_hex(input()?.as_bytes()),
        "randomString" => random_string(len)?,
        "base64Encode" => STANDARD.encode(input()?),
        "base64Decode" => {
            let bytes = STANDARD
                .decode(input()?)
                .map_err(|e| Fault::invalid("input", format!("invalid base64: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|_| Fault::invalid("input", "decoded bytes are not UTF-8"))?
        }
        "now" => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        other => return Err(Fault::invalid("op", format!("unknown helper `{other}`"))),
    };
    Ok(json!({ "value": value }))
}

/// Lower-case hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA256, bytes);
    digest.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Alphanumeric string from the system CSPRNG.
pub fn random_string(len: usize) -> Result<String, Fault> {
    let rng = SystemRandom::new();
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    // 62 * 4 = 248; bytes at or above it are rejected to keep the draw uniform.
    let limit = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;
    while out.len() < len {
        rng.fill(&mut buf)
            .map_err(|_| Fault::host("system random source failed"))?;
        for &b in &buf {
            if b < limit && out.len() < len {
                out.push(ALPHANUMERIC[b as usize % ALPHANUMERIC.len()] as char);
            }
        }
    }
    Ok(out)
}
