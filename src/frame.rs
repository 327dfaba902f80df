//! Building and parsing the 66-byte Saga 1000 frames.
//!
//! Two framings are in the field. The *generic* dialect is Modbus-like:
//! plaintext frames starting `01 99` with a little-endian CRC trailer,
//! sent without any handshake. The *ABNT* dialect is the handshaked one:
//! plaintext padded to 64 bytes, big-endian CRC appended, and the whole
//! 66-byte buffer bit-complemented before it goes out behind an ENQ.
//!
//! Neither parser applies the complement itself: replies are validated
//! exactly as received, which is how the meters answer. To parse a
//! locally built ABNT frame, [`complement`][crate::complement::complement]
//! it first.

use log::{debug, trace};

use crate::crc::crc16;
use crate::complement::complement_in_place;
use crate::{Error, Result};

/// Frame length without the leading ENQ.
pub const FRAME_LEN: usize = 66;

/// Bytes covered by the CRC: everything before the two trailer bytes.
pub const DATA_LEN: usize = FRAME_LEN - 2;

/// Start marker of generic-dialect frames.
pub const START_MARKER: [u8; 2] = [0x01, 0x99];

/// Filler octets some meter firmware inserts before the start marker.
pub const FILLER: [u8; 3] = [0xFF, 0xFB, 0xFD];

/// Which framing a buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `01 99` header, little-endian CRC, no complement, no handshake.
    Generic,
    /// Complemented frame behind an ENQ, big-endian CRC.
    Abnt,
}

/// A reply with framing stripped and CRC verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command (or control) code the reply answers.
    pub command: u8,
    /// Field region of the payload.
    pub body: Vec<u8>,
}

/// Build a generic-dialect query: `01 99`, command, reader, parameter,
/// zero padding, CRC little-endian.
#[must_use]
pub fn build_generic(command: u8, reader: u8, param: u8) -> [u8; FRAME_LEN] {
    let mut f = [0u8; FRAME_LEN];
    f[..2].copy_from_slice(&START_MARKER);
    f[2] = command;
    f[3] = reader;
    f[4] = param;
    let crc = crc16(&f[..DATA_LEN]);
    f[DATA_LEN..].copy_from_slice(&crc.to_le_bytes());
    f
}

/// Build an ABNT-dialect request: command, payload, zero padding, CRC
/// big-endian, then the whole frame complemented.
///
/// The caller (the link layer) prepends the ENQ byte for the wire.
#[must_use]
pub fn build_abnt(command: u8, payload: &[u8]) -> [u8; FRAME_LEN] {
    assert!(payload.len() < DATA_LEN, "payload does not fit one frame");
    let mut f = [0u8; FRAME_LEN];
    f[0] = command;
    f[1..1 + payload.len()].copy_from_slice(payload);
    let crc = crc16(&f[..DATA_LEN]);
    f[DATA_LEN..].copy_from_slice(&crc.to_be_bytes());
    complement_in_place(&mut f);
    f
}

/// Build the command 0x14 (fiscal page) request for a reader serial
/// number. The serial travels as three big-endian bytes.
#[must_use]
pub fn build_cmd14(serial: u32) -> [u8; FRAME_LEN] {
    let s = (serial & 0x00FF_FFFF).to_be_bytes();
    build_abnt(0x14, &s[1..])
}

/// Strip framing from a reply and verify its CRC.
pub fn parse_response(bytes: &[u8], dialect: Dialect) -> Result<Frame> {
    if bytes.len() < 3 {
        return Err(Error::TooShort(bytes.len()));
    }
    match dialect {
        Dialect::Generic => parse_generic(bytes),
        Dialect::Abnt => parse_abnt(bytes),
    }
}

fn parse_generic(bytes: &[u8]) -> Result<Frame> {
    let start = bytes
        .windows(2)
        .position(|w| w == START_MARKER)
        .ok_or(Error::NoStart)?;
    if start > 0 {
        let skipped = &bytes[..start];
        if skipped.iter().all(|b| FILLER.contains(b)) {
            trace!("discarding {start} filler bytes before start marker");
        } else {
            debug!("discarding {start} unexpected bytes before start marker: {skipped:02x?}");
        }
    }
    let msg = &bytes[start..];
    if msg.len() < 6 {
        return Err(Error::TooShort(msg.len()));
    }
    let (data, trailer) = msg.split_at(msg.len() - 2);
    let got = u16::from_le_bytes([trailer[0], trailer[1]]);
    let want = crc16(data);
    if got != want {
        return Err(Error::BadCrc { got, want });
    }
    // Header is marker, command, one pad byte; fields start at offset 4.
    Ok(Frame {
        command: msg[2],
        body: data[4..].to_vec(),
    })
}

fn parse_abnt(bytes: &[u8]) -> Result<Frame> {
    let (data, trailer) = bytes.split_at(bytes.len() - 2);
    let got = u16::from_be_bytes([trailer[0], trailer[1]]);
    let want = crc16(data);
    if got != want {
        return Err(Error::BadCrc { got, want });
    }
    Ok(Frame {
        command: bytes[0],
        body: data[1..].to_vec(),
    })
}
