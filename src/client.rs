//! Top-level meter client.
//!
//! Ties the pieces together: fire the UDP activation probe, open the
//! TCP transport, drive the link state machine, decode the reply
//! against the command's schema and hand the finished [`Record`] to a
//! [`Sink`].

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;

use crate::activation::{Activate, ActivationProbe};
use crate::field::{self, FieldType, Value};
use crate::frame::{Dialect, FRAME_LEN, build_abnt, build_cmd14, build_generic, parse_response};
use crate::link::{Link, LinkConfig};
use crate::schema::{self, Fields};
use crate::transport::{TcpTransport, Transport};
use crate::{CancelToken, Error, Result};

/// The fiscal-page command, the only one whose request carries a reader
/// serial number.
pub const CMD_FISCAL_PAGE: u8 = 0x14;

/// Serial number used when the operator does not provide one.
pub const DEFAULT_SERIAL: u32 = 0x010203;

/// Second byte of a generic read query; the meter expects 0x63 here.
const GENERIC_OP: u8 = 0x63;

/// Everything needed to reach one meter.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Meter address.
    pub host: IpAddr,
    /// Meter TCP port.
    pub port: u16,
    /// TCP connect deadline.
    pub connect_deadline: Duration,
    /// Link-layer tuning.
    pub link: LinkConfig,
    /// Activation packets per probe.
    pub probe_attempts: u32,
    /// Spacing between activation packets.
    pub probe_interval: Duration,
}

impl ClientConfig {
    /// Config with the production defaults for the given meter.
    #[must_use]
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            connect_deadline: Duration::from_secs(5),
            link: LinkConfig::default(),
            probe_attempts: 3,
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// One decoded field of a reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedField {
    /// Human label from the schema.
    pub name: &'static str,
    /// Type tag from the schema.
    pub kind: FieldType,
    /// Outcome for this field.
    pub data: FieldData,
}

/// What became of one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldData {
    /// Decoded fine.
    Value(Value),
    /// Decoder rejected the block; the rest of the record is unaffected.
    Error(String),
    /// The reply ended before this field. No further fields follow.
    Truncated,
}

/// A decoded reply, as delivered to the [`Sink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Command code the meter answered.
    pub command: u8,
    /// Decoded fields, in schema order.
    pub fields: Vec<DecodedField>,
    /// Hex payload for commands without a schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Receives decoded records. Printing, storing and forwarding all live
/// behind this.
pub trait Sink {
    /// One reply was decoded.
    fn record(&mut self, rec: &Record);
}

/// Decode a reply body against a schema, field by field.
///
/// The result has one entry per schema field unless the body runs out,
/// in which case the first missing field is marked
/// [`FieldData::Truncated`] and the rest are absent.
#[must_use]
pub fn decode_fields(body: &[u8], fields: Fields) -> Vec<DecodedField> {
    let mut out = Vec::with_capacity(fields.len());
    let mut pos = 0;
    for &(name, kind) in fields {
        let width = kind.width();
        if pos + width > body.len() {
            out.push(DecodedField {
                name,
                kind,
                data: FieldData::Truncated,
            });
            break;
        }
        let data = match field::decode(&body[pos..pos + width], kind) {
            Ok(v) => FieldData::Value(v),
            Err(e) => FieldData::Error(e.to_string()),
        };
        out.push(DecodedField { name, kind, data });
        pos += width;
    }
    out
}

fn decode_record(command: u8, body: &[u8]) -> Record {
    match schema::lookup(command) {
        Some(fields) => Record {
            command,
            fields: decode_fields(body, fields),
            raw: None,
        },
        None => {
            debug!("{}", Error::NoSchema(command));
            Record {
                command,
                fields: Vec::new(),
                raw: Some(hex_string(body)),
            }
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Client for one meter.
pub struct Client {
    cfg: ClientConfig,
    cancel: CancelToken,
}

impl Client {
    /// New client. Nothing is contacted until a query runs.
    #[must_use]
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            cancel: CancelToken::new(),
        }
    }

    /// Attach an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts this client's sessions when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one handshaked (ABNT dialect) command and deliver the
    /// decoded reply to `sink`.
    ///
    /// `serial` only matters for command 0x14 and falls back to
    /// [`DEFAULT_SERIAL`].
    pub fn run(&self, command: u8, serial: Option<u32>, sink: &mut dyn Sink) -> Result<()> {
        let probe = ActivationProbe::new(self.cfg.host)
            .with_schedule(self.cfg.probe_attempts, self.cfg.probe_interval);
        probe.activate();

        let addr = SocketAddr::new(self.cfg.host, self.cfg.port);
        let mut t = TcpTransport::connect(addr, self.cfg.connect_deadline)?;
        info!("connected to meter at {}", t.peer_addr()?);

        let wire_frame = if command == CMD_FISCAL_PAGE {
            build_cmd14(serial.unwrap_or(DEFAULT_SERIAL))
        } else {
            build_abnt(command, &[GENERIC_OP, 0x00])
        };

        let link = Link::new(self.cfg.link.clone(), Dialect::Abnt)
            .with_probe(&probe)
            .with_cancel(self.cancel.clone());
        let reply = link.send_command(&mut t, &wire_frame)?;

        let frame = parse_response(&reply, Dialect::Abnt)?;
        sink.record(&decode_record(frame.command, &frame.body));
        Ok(())
    }

    /// Run one generic-dialect query: no activation, no handshake, just
    /// a `01 99` frame and a framed reply.
    pub fn query_generic(
        &self,
        command: u8,
        reader: u8,
        param: u8,
        sink: &mut dyn Sink,
    ) -> Result<()> {
        let addr = SocketAddr::new(self.cfg.host, self.cfg.port);
        let mut t = TcpTransport::connect(addr, self.cfg.connect_deadline)?;
        info!("connected to meter at {}", t.peer_addr()?);

        t.send(&build_generic(command, reader, param))?;

        // Replies can trickle in; keep reading until one whole frame is
        // buffered.
        let deadline = Instant::now() + self.cfg.link.reply_deadline;
        let mut buf = Vec::with_capacity(FRAME_LEN);
        while buf.len() < FRAME_LEN {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimeoutReply);
            }
            match t.recv(self.cfg.link.recv_max, remaining) {
                Ok(v) if v.is_empty() => return Err(Error::TimeoutReply),
                Ok(v) => buf.extend_from_slice(&v),
                Err(Error::Timeout) => return Err(Error::TimeoutReply),
                Err(e) => return Err(e),
            }
        }

        let frame = parse_response(&buf, Dialect::Generic)?;
        sink.record(&decode_record(frame.command, &frame.body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DateTime;

    fn fiscal_body() -> Vec<u8> {
        let mut body = vec![0x18, 0x06, 0x1A, 0x0F, 0x1E, 0x2D];
        body.extend_from_slice(&220.5f32.to_le_bytes());
        body.extend_from_slice(&219.75f32.to_le_bytes());
        body.extend_from_slice(&0.92f32.to_le_bytes());
        body.resize(63, 0);
        body
    }

    #[test]
    fn fiscal_page_decodes_fully() {
        let rec = decode_record(0x14, &fiscal_body());
        assert_eq!(rec.command, 0x14);
        assert!(rec.raw.is_none());
        assert_eq!(rec.fields.len(), 4);
        assert_eq!(
            rec.fields[0].data,
            FieldData::Value(Value::DateTime(DateTime {
                year: 2024,
                month: 6,
                day: 26,
                hour: 15,
                minute: 30,
                second: 45,
            }))
        );
        assert_eq!(rec.fields[1].data, FieldData::Value(Value::Float(220.5)));
        assert_eq!(rec.fields[2].data, FieldData::Value(Value::Float(219.75)));
        assert_eq!(rec.fields[3].data, FieldData::Value(Value::Float(0.92)));
    }

    #[test]
    fn truncated_body_marks_first_missing_field() {
        let fields = schema::lookup(0x14).unwrap();
        // Enough for the datetime, one byte short of the first float.
        let decoded = decode_fields(&fiscal_body()[..9], fields);
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0].data, FieldData::Value(_)));
        assert_eq!(decoded[1].data, FieldData::Truncated);
        assert_eq!(decoded[1].name, "Inst1");
    }

    #[test]
    fn field_count_matches_schema_for_full_bodies() {
        for cmd in [0x14u8, 0x20, 0x26, 0x80] {
            let fields = schema::lookup(cmd).unwrap();
            let body = vec![0u8; 63];
            assert_eq!(decode_fields(&body, fields).len(), fields.len());
        }
    }

    #[test]
    fn unknown_command_keeps_raw_payload() {
        let rec = decode_record(0x99, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(rec.fields.is_empty());
        assert_eq!(rec.raw.as_deref(), Some("DEADBEEF"));
    }

    #[test]
    fn record_serializes_to_json() {
        let rec = decode_record(0x31, &[0x00, 0x0F]);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"DemandInterval\""), "{json}");
        assert!(json.contains("15"), "{json}");
        // No raw key for known commands.
        assert!(!json.contains("\"raw\""), "{json}");
    }
}
