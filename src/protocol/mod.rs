//! Decoders for the RuuviTag broadcast payload formats.
//!
//! Three wire formats are supported, dispatched on the leading version
//! byte: RAWv1 (version 3), RAWv2 (version 5) and the air-quality format
//! (version 6). Formats are documented at
//! <https://github.com/ruuvi/ruuvi-sensor-protocols>.
//!
//! A payload that does not match the fixed layout of its declared format
//! (wrong length, wrong interior version byte, unknown version) is a
//! [`DecodeError`] -- it means the dispatch table and the device disagree
//! and must never be silently dropped. A payload whose fields sit at their
//! reserved "sensor not ready" sentinels is not an error: with validation
//! enabled it decodes to `Ok(None)` and the packet is discarded upstream.

pub mod v3;
pub mod v5;
pub mod v6;

use crate::measurement::{Acceleration, Measurement};
use thiserror::Error;

/// Contract violations between a payload and the decoder it dispatched to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The leading version byte names a format this build has no parser for.
    #[error("a parser for protocol version {0} is not implemented")]
    UnsupportedVersion(u8),
    /// The payload length does not match the fixed layout of the format.
    #[error("invalid length for version {version} data: expected {expected}, actual {actual}")]
    InvalidLength {
        version: u8,
        expected: usize,
        actual: usize,
    },
    /// The interior version byte disagrees with the dispatched parser.
    #[error("invalid data version: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u8, actual: u8 },
}

/// Decode a manufacturer-data payload into a [`Measurement`].
///
/// With `validate` set, readings whose fields sit exactly at a documented
/// sentinel/extreme are rejected as "sensor not ready" and `Ok(None)` is
/// returned. An empty payload also yields `Ok(None)`: there is nothing to
/// dispatch on, which is routine for foreign advertisements.
pub fn decode(data: &[u8], validate: bool) -> Result<Option<Measurement>, DecodeError> {
    let Some(&version) = data.first() else {
        return Ok(None);
    };

    match version {
        v3::VERSION => v3::decode(data, validate),
        v5::VERSION => v5::decode(data, validate),
        v6::VERSION => v6::decode(data, validate),
        other => Err(DecodeError::UnsupportedVersion(other)),
    }
}

pub(crate) fn ensure_version_and_length(
    data: &[u8],
    version: u8,
    length: usize,
) -> Result<(), DecodeError> {
    if data.len() != length {
        return Err(DecodeError::InvalidLength {
            version,
            expected: length,
            actual: data.len(),
        });
    }

    if data[0] != version {
        return Err(DecodeError::VersionMismatch {
            expected: version,
            actual: data[0],
        });
    }

    Ok(())
}

/// Big-endian u16 at `offset`.
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Big-endian two's-complement 16-bit value at `offset`.
pub(crate) fn read_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Three consecutive signed 16-bit milli-g axes starting at `offset`.
pub(crate) fn read_acceleration(data: &[u8], offset: usize) -> Acceleration {
    Acceleration {
        x: f64::from(read_i16(data, offset)) / 1000.0,
        y: f64::from(read_i16(data, offset + 2)) / 1000.0,
        z: f64::from(read_i16(data, offset + 4)) / 1000.0,
    }
}

/// Round to two decimal places.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
pub(crate) fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_has_no_parser() {
        assert_eq!(decode(&[], true), Ok(None));
        assert_eq!(decode(&[], false), Ok(None));
    }

    #[test]
    fn test_unknown_version_is_a_hard_error() {
        let data = [0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            decode(&data, false),
            Err(DecodeError::UnsupportedVersion(4))
        );
    }

    #[test]
    fn test_dispatches_on_version_byte() {
        // A single recognized version byte with a truncated body must fail
        // on length, proving the dispatch reached the right parser.
        assert_eq!(
            decode(&[0x03, 0x00], false),
            Err(DecodeError::InvalidLength {
                version: 3,
                expected: v3::PAYLOAD_LENGTH,
                actual: 2
            })
        );
        assert_eq!(
            decode(&[0x05, 0x00], false),
            Err(DecodeError::InvalidLength {
                version: 5,
                expected: v5::PAYLOAD_LENGTH,
                actual: 2
            })
        );
        assert_eq!(
            decode(&[0x06, 0x00], false),
            Err(DecodeError::InvalidLength {
                version: 6,
                expected: v6::PAYLOAD_LENGTH,
                actual: 2
            })
        );
    }

    #[test]
    fn test_read_i16_sign() {
        assert_eq!(read_i16(&[0xFF, 0xFC], 0), -4);
        assert_eq!(read_i16(&[0x00, 0x04], 0), 4);
        assert_eq!(read_i16(&[0x80, 0x01], 0), -32767);
    }

    #[test]
    fn test_round2() {
        assert_close(round2(13026.674), 13026.67);
        assert_close(round2(0.005), 0.01);
    }
}
