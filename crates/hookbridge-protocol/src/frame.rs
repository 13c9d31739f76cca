//! Length-prefixed response frames.
//!
//! The pointer returned by the host entrypoint addresses a buffer laid out as
//! `[u32 little-endian body length][body]`.  The length travels with the
//! buffer, so no side channel or global "last response length" is needed.

use crate::error::ProtocolError;

/// Size of the length header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default cap on a single frame body (4 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Body length declared by a frame header.
pub fn body_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_le_bytes(header) as usize
}

/// Reject bodies larger than `limit`.
pub fn check_len(len: usize, limit: usize) -> Result<(), ProtocolError> {
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { len, limit });
    }
    Ok(())
}

/// Split a complete in-memory frame into its body.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    let Some((header, rest)) = frame.split_first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(ProtocolError::Malformed(format!(
            "frame shorter than its {FRAME_HEADER_LEN}-byte header"
        )));
    };
    let len = body_len(*header);
    rest.get(..len).ok_or_else(|| {
        ProtocolError::Malformed(format!(
            "frame declares {len} bytes but only {} follow",
            rest.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian_length() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[5, 0, 0, 0]);
        assert_eq!(&frame[4..], b"hello");
        assert_eq!(body_len([5, 0, 0, 0]), 5);
    }

    #[test]
    fn decode_returns_body() {
        let frame = encode_frame(br#"{"ok":1}"#).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), br#"{"ok":1}"#);
    }

    #[test]
    fn empty_body() {
        let frame = encode_frame(b"").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn truncated_frame_is_malformed() {
        assert!(decode_frame(&[1, 0]).is_err());
        assert!(decode_frame(&[9, 0, 0, 0, b'x']).is_err());
    }

    #[test]
    fn check_len_enforces_limit() {
        assert!(check_len(10, 10).is_ok());
        assert_eq!(
            check_len(11, 10),
            Err(ProtocolError::FrameTooLarge { len: 11, limit: 10 })
        );
    }
}
