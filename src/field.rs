//! Field-level decoding of reply payloads.
//!
//! Replies carry fixed-width typed blocks back to back; the per-command
//! layout lives in [`crate::schema`]. This module turns one block into a
//! [`Value`] according to its [`FieldType`] tag.

use serde::Serialize;

/// Type tag of one field in a command schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    /// IEEE-754 binary32, little-endian.
    Float32,
    /// Vendor 24-bit float: a binary32 with its lowest byte dropped.
    Float24,
    /// Unsigned big-endian integer of the given byte width.
    Uint(u8),
    /// Signed big-endian integer of the given byte width.
    Int(u8),
    /// ASCII text of the given length.
    Ascii(u8),
    /// Bitmask rendered as a big-endian bit string.
    Bits(u8),
    /// 6-byte calendar value.
    DateTime,
}

impl FieldType {
    /// Number of payload bytes this field occupies.
    #[must_use]
    pub fn width(&self) -> usize {
        match self {
            FieldType::Float32 => 4,
            FieldType::Float24 => 3,
            FieldType::Uint(n) | FieldType::Int(n) | FieldType::Ascii(n) | FieldType::Bits(n) => {
                usize::from(*n)
            }
            FieldType::DateTime => 6,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FieldType::Float32 => write!(f, "F4"),
            FieldType::Float24 => write!(f, "Float24"),
            FieldType::Uint(n) => write!(f, "U{n}"),
            FieldType::Int(n) => write!(f, "I{n}"),
            FieldType::Ascii(n) => write!(f, "A{n}"),
            FieldType::Bits(n) => write!(f, "B{n}"),
            FieldType::DateTime => write!(f, "T6"),
        }
    }
}

/// Calendar value carried by `T6` fields. Years are counted from 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateTime {
    /// Full year (2000 + wire byte).
    pub year: u16,
    /// Month, 1–12.
    pub month: u8,
    /// Day of month, 1–31.
    pub day: u8,
    /// Hour, 0–23.
    pub hour: u8,
    /// Minute, 0–59.
    pub minute: u8,
    /// Second, 0–59.
    pub second: u8,
}

impl DateTime {
    /// Decode a 6-byte block, if its fields are in range.
    #[must_use]
    pub fn from_t6(b: &[u8]) -> Option<Self> {
        if b.len() != 6 {
            return None;
        }
        let dt = Self {
            year: 2000 + u16::from(b[0]),
            month: b[1],
            day: b[2],
            hour: b[3],
            minute: b[4],
            second: b[5],
        };
        let ok = (1..=12).contains(&dt.month)
            && (1..=31).contains(&dt.day)
            && dt.hour <= 23
            && dt.minute <= 59
            && dt.second <= 59;
        ok.then_some(dt)
    }
}

impl std::fmt::Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:02}/{:02}/{} {:02}:{:02}:{:02}",
            self.day, self.month, self.year, self.hour, self.minute, self.second
        )
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    /// Float32 or Float24 content.
    Float(f32),
    /// Unsigned integer content.
    Uint(u64),
    /// Signed integer content.
    Int(i64),
    /// ASCII content.
    Text(String),
    /// Bit string, e.g. `0b00000001`.
    Bits(String),
    /// In-range calendar value.
    DateTime(DateTime),
    /// Out-of-range calendar value.
    Invalid,
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            // Floats are presented rounded to four decimals.
            Value::Float(v) => write!(f, "{v:.4}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bits(s) => write!(f, "{s}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::Invalid => write!(f, "[invalid datetime]"),
        }
    }
}

/// Why one field failed to decode. Never aborts the whole record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The slice handed in does not match the tag's width.
    #[error("wrong width: want {want} bytes, got {got}")]
    WrongWidth {
        /// Width required by the type tag.
        want: usize,
        /// Length of the slice handed in.
        got: usize,
    },
    /// ASCII field with no recoverable bytes at all.
    #[error("no decodable ASCII content")]
    BadEncoding,
}

/// Decode one typed block.
pub fn decode(bytes: &[u8], tag: FieldType) -> Result<Value, DecodeError> {
    let want = tag.width();
    if bytes.len() != want {
        return Err(DecodeError::WrongWidth {
            want,
            got: bytes.len(),
        });
    }
    Ok(match tag {
        FieldType::Float32 => {
            Value::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        FieldType::Float24 => {
            // Left-pad to a full binary32.
            Value::Float(f32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]))
        }
        FieldType::Uint(_) => Value::Uint(be_uint(bytes)),
        FieldType::Int(_) => {
            let raw = be_uint(bytes);
            let shift = 64 - 8 * bytes.len() as u32;
            Value::Int(((raw << shift) as i64) >> shift)
        }
        FieldType::Ascii(_) => {
            if bytes.iter().all(|b| !b.is_ascii()) {
                return Err(DecodeError::BadEncoding);
            }
            // Drop non-ASCII bytes and NULs, then trim the padding.
            let text: String = bytes
                .iter()
                .filter(|b| b.is_ascii() && **b != 0)
                .map(|&b| char::from(b))
                .collect();
            Value::Text(text.trim().to_string())
        }
        FieldType::Bits(_) => {
            let mut s = String::with_capacity(2 + 8 * bytes.len());
            s.push_str("0b");
            for b in bytes {
                s.push_str(&format!("{b:08b}"));
            }
            Value::Bits(s)
        }
        FieldType::DateTime => match DateTime::from_t6(bytes) {
            Some(dt) => Value::DateTime(dt),
            None => Value::Invalid,
        },
    })
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
