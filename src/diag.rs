//! Interpretation helpers for replies that do not decode.
//!
//! The offset sweep and the Float24 scan are developer tools for
//! mapping underdocumented payloads from a capture. The error report is
//! part of the production path: the link layer surfaces it whenever a
//! reply fails its CRC check, since error replies from the meter arrive
//! framed differently and fail validation.

use crate::client::{DecodedField, decode_fields};
use crate::schema::Fields;

/// Try a schema at every start offset in `0..max_offset`, returning the
/// decoded field list per offset. Useful when a reply clearly carries
/// the right data but not where the schema says it should.
#[must_use]
pub fn sweep_offsets(
    body: &[u8],
    fields: Fields,
    max_offset: usize,
) -> Vec<(usize, Vec<DecodedField>)> {
    (0..max_offset)
        .map(|offset| {
            let slice = if offset <= body.len() {
                &body[offset..]
            } else {
                &[][..]
            };
            (offset, decode_fields(slice, fields))
        })
        .collect()
}

/// Decode every aligned 3-byte block as a Float24.
#[must_use]
pub fn scan_float24(body: &[u8]) -> Vec<(usize, f32)> {
    body.chunks_exact(3)
        .enumerate()
        .map(|(i, b)| (i * 3, f32::from_le_bytes([0, b[0], b[1], b[2]])))
        .collect()
}

/// Decoded error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Hardware subsystems flagged in the bitmask at byte 3.
    pub hardware: Vec<&'static str>,
    /// Communication error code at byte 7.
    pub code: u8,
    /// Meaning of the code, when known.
    pub meaning: Option<&'static str>,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.meaning {
            Some(m) => write!(f, "code {:#04x} ({m})", self.code)?,
            None => write!(f, "code {:#04x} (unknown)", self.code)?,
        }
        if !self.hardware.is_empty() {
            write!(f, ", hardware: {}", self.hardware.join(", "))?;
        }
        Ok(())
    }
}

const HARDWARE_BITS: [&str; 8] = [
    "flash",
    "clock",
    "A/D converter",
    "reserved",
    "display",
    "RAM",
    "reserved",
    "reserved",
];

/// Interpret a reply as an error report. Returns `None` when the reply
/// is too short to carry one.
#[must_use]
pub fn error_report(reply: &[u8]) -> Option<ErrorReport> {
    if reply.len() < 8 {
        return None;
    }
    let hw = reply[3];
    let code = reply[7];
    let hardware = (0..8)
        .filter(|bit| hw & (1 << bit) != 0)
        .map(|bit| HARDWARE_BITS[bit as usize])
        .collect();
    let meaning = match code {
        0x36 => Some("command requires a password (no session open)"),
        0x37 => Some("meter busy"),
        0x39 => Some("command not implemented"),
        0x40 => Some("meter occurrence (see subcode)"),
        0x43 => Some("initialization error"),
        0x44 => Some("meter already initialized"),
        0x46 => Some("invalid parameter"),
        _ => None,
    };
    Some(ErrorReport {
        hardware,
        code,
        meaning,
    })
}
