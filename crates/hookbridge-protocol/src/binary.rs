//! Binary payload encoding.
//!
//! File contents cross the boundary as standard (padded) base64 strings in a
//! `data` field.  Both sides use these helpers so the alphabet never drifts.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::ProtocolError;

/// Encode raw bytes for a JSON payload.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the base64 string found in payload field `field`.
pub fn decode(field: &str, text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::invalid(field, format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(encode(b"Hello, World!"), "SGVsbG8sIFdvcmxkIQ==");
        assert_eq!(decode("data", "SGVsbG8sIFdvcmxkIQ==").unwrap(), b"Hello, World!");
    }

    #[test]
    fn invalid_input_names_field() {
        let err = decode("data", "invalid!!!").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument { ref field, .. } if field == "data"));
    }
}
