//! Binary codec for device link frames.
//!
//! Wire format:
//! ```text
//! [magic:4][len:4][version:1][cmd:1][payload:len-3][checksum:1]
//! ```
//! `len` counts version + cmd + payload + checksum.  All multi-byte integers
//! are little-endian.  The checksum is the sum of every preceding byte of the
//! frame, modulo 256.
//!
//! The decoder validates the checksum *before* interpreting the version and
//! command bytes, so any corruption inside the body surfaces as
//! [`ProtocolError::BadChecksum`] rather than as a confusing "unknown command".

use crate::protocol::messages::{
    Command, Frame, Payload, HEADER_SIZE, MAGIC, MIN_FRAME_SIZE, PROTOCOL_VERSION,
};
use thiserror::Error;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first four bytes are not [`MAGIC`].
    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// Fewer bytes are available than the header or the declared length requires.
    #[error("truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The trailing checksum byte disagrees with the computed sum.
    #[error("bad checksum: computed 0x{expected:02X}, frame carries 0x{actual:02X}")]
    BadChecksum { expected: u8, actual: u8 },

    /// The command byte is not a known [`Command`].
    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    /// The version byte is not [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload does not fit the 32-bit length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `command` and `payload` into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload cannot be
/// described by the 32-bit length field.
///
/// # Examples
///
/// ```rust
/// use maix_core::protocol::{decode_frame, encode_frame};
/// use maix_core::protocol::messages::{Command, Payload};
///
/// let bytes = encode_frame(Command::Run, Payload::Text("print(1)")).unwrap();
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.command, Command::Run);
/// assert_eq!(frame.payload, b"print(1)");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(command: Command, payload: Payload<'_>) -> Result<Vec<u8>, ProtocolError> {
    let number;
    let body: &[u8] = match payload {
        Payload::Empty => &[],
        Payload::Number(n) => {
            number = n.to_le_bytes();
            &number
        }
        Payload::Text(s) => s.as_bytes(),
        Payload::Bytes(b) => b,
    };

    // version + cmd + payload + checksum
    let len = u32::try_from(body.len() + 3).map_err(|_| ProtocolError::PayloadTooLarge(body.len()))?;

    let mut buf = Vec::with_capacity(MIN_FRAME_SIZE + body.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(command as u8);
    buf.extend_from_slice(body);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupied, so a caller holding
/// several concatenated frames can advance its cursor.
///
/// # Errors
///
/// See [`ProtocolError`].  Decoding never panics on arbitrary input.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let frame_end = HEADER_SIZE.saturating_add(len);
    if len < 3 || bytes.len() < frame_end {
        return Err(ProtocolError::Truncated {
            needed: frame_end.max(MIN_FRAME_SIZE),
            available: bytes.len(),
        });
    }

    let expected = checksum(&bytes[..frame_end - 1]);
    let actual = bytes[frame_end - 1];
    if expected != actual {
        return Err(ProtocolError::BadChecksum { expected, actual });
    }

    let version = bytes[HEADER_SIZE];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let cmd_byte = bytes[HEADER_SIZE + 1];
    let command = Command::try_from(cmd_byte).map_err(|_| ProtocolError::UnknownCommand(cmd_byte))?;

    let payload = bytes[HEADER_SIZE + 2..frame_end - 1].to_vec();
    Ok((Frame { command, payload }, frame_end))
}

/// Sum of `bytes` modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
