//! Link-layer state machine for the handshaked ABNT dialect.
//!
//! One call to [`Link::send_command`] is one session: wake the meter
//! with a burst of ALO bytes, wait for its ENQ, transmit the frame, then
//! classify whatever comes back. WAIT, NAK, stray control bytes and
//! corrupted replies all loop back into the machine under bounded
//! counters; only counter exhaustion, cancellation and hard transport
//! errors escape.
//!
//! ```text
//! Waking ──► AwaitEnq ──► Send ──► AwaitReply ──► Classify
//!   ▲            ▲                     ▲              │
//!   │            └── WAIT ─────────────┼──────────────┤
//!   │                                  └─── ACK ──────┤
//!   ├──────────── NAK / bad CRC / timeout ────────────┤
//!   │                                                 ▼
//!   └───────────────────────────────────── valid frame: ACK, done
//! ```

use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::activation::Activate;
use crate::diag;
use crate::frame::{Dialect, FRAME_LEN, parse_response};
use crate::transport::Transport;
use crate::{CancelToken, Error, Result};

/// Enquiry: either side signals intent to talk.
pub const ENQ: u8 = 0x05;
/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;
/// Meter is busy, try again.
pub const WAIT: u8 = 0x10;
/// Meter-specific wake-up byte. Not an ASCII control character.
pub const ALO: u8 = 0xFF;

/// Tuning knobs for one link session. The defaults are the values the
/// meters are known to work with.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long to wait for the meter's ENQ.
    pub enq_deadline: Duration,
    /// How long to wait for a reply after transmitting.
    pub reply_deadline: Duration,
    /// NAK budget per session.
    pub max_naks: u32,
    /// WAIT budget per session.
    pub max_waits: u32,
    /// Whole-cycle retry budget per session.
    pub max_retries: u32,
    /// Number of ALO bytes in a wake-up burst.
    pub alo_repeat: u32,
    /// Receive buffer size for replies.
    pub recv_max: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enq_deadline: Duration::from_secs(20),
            reply_deadline: Duration::from_secs(5),
            max_naks: 7,
            max_waits: 12,
            max_retries: 7,
            alo_repeat: 5,
            recv_max: 512,
        }
    }
}

enum State {
    Waking,
    AwaitEnq,
    Send,
    AwaitReply,
}

/// Driver for the command/response exchange.
pub struct Link<'a> {
    cfg: LinkConfig,
    dialect: Dialect,
    probe: Option<&'a dyn Activate>,
    cancel: CancelToken,
}

impl<'a> Link<'a> {
    /// New link for the given dialect.
    #[must_use]
    pub fn new(cfg: LinkConfig, dialect: Dialect) -> Self {
        Self {
            cfg,
            dialect,
            probe: None,
            cancel: CancelToken::new(),
        }
    }

    /// Attach the activation probe re-fired after a corrupted reply.
    #[must_use]
    pub fn with_probe(mut self, probe: &'a dyn Activate) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Attach an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one session: deliver `frame` and return the meter's reply,
    /// CRC-verified and acknowledged.
    ///
    /// The NAK/WAIT/retry counters start at zero on every call and are
    /// never reset within one.
    pub fn send_command<T: Transport>(&self, t: &mut T, frame: &[u8]) -> Result<Vec<u8>> {
        let wire = match self.dialect {
            Dialect::Abnt => {
                let mut w = Vec::with_capacity(frame.len() + 1);
                w.push(ENQ);
                w.extend_from_slice(frame);
                w
            }
            Dialect::Generic => frame.to_vec(),
        };

        let mut naks = 0u32;
        let mut waits = 0u32;
        let mut retries = 0u32;
        let mut state = State::Waking;

        loop {
            self.check_cancel()?;
            state = match state {
                State::Waking => {
                    debug!("waking meter ({}x ALO)", self.cfg.alo_repeat);
                    for _ in 0..self.cfg.alo_repeat {
                        t.send(&[ALO])?;
                    }
                    State::AwaitEnq
                }

                State::AwaitEnq => match self.await_enq(t) {
                    Ok(()) => State::Send,
                    Err(Error::TimeoutEnq) => {
                        retries += 1;
                        debug!("no ENQ from meter, retry {retries}/{}", self.cfg.max_retries);
                        if retries > self.cfg.max_retries {
                            return Err(Error::MaxRetries);
                        }
                        State::Waking
                    }
                    Err(e) => return Err(e),
                },

                State::Send => {
                    debug!("transmitting {} byte frame", wire.len());
                    t.send(&wire)?;
                    State::AwaitReply
                }

                State::AwaitReply => {
                    let reply = match self.recv_reply(t) {
                        Ok(r) => r,
                        Err(Error::TimeoutReply) => {
                            retries += 1;
                            debug!("no reply, retry {retries}/{}", self.cfg.max_retries);
                            if retries > self.cfg.max_retries {
                                return Err(Error::MaxRetries);
                            }
                            state = State::Waking;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    match reply[0] {
                        WAIT => {
                            waits += 1;
                            debug!("WAIT ({waits}/{})", self.cfg.max_waits);
                            if waits > self.cfg.max_waits {
                                return Err(Error::MaxWaits);
                            }
                            State::AwaitEnq
                        }
                        NAK => {
                            naks += 1;
                            debug!("NAK ({naks}/{})", self.cfg.max_naks);
                            if naks > self.cfg.max_naks {
                                return Err(Error::MaxNaks);
                            }
                            State::Waking
                        }
                        ENQ => {
                            debug!("unexpected ENQ, retransmitting");
                            State::Send
                        }
                        ACK => {
                            debug!("unexpected ACK, keeping waiting for data");
                            State::AwaitReply
                        }
                        _ => match self.complete_frame(t, reply) {
                            Ok(resp) => match parse_response(&resp, self.dialect) {
                                Ok(_) => {
                                    t.send(&[ACK])?;
                                    info!("reply accepted after {naks} NAKs, {waits} WAITs, {retries} retries");
                                    return Ok(resp);
                                }
                                Err(e) => {
                                    debug!("reply rejected: {e}");
                                    // Error replies from the meter are framed
                                    // differently and land here; interpret
                                    // them before retrying.
                                    if let Some(report) = diag::error_report(&resp) {
                                        warn!("meter error report: {report}");
                                    }
                                    t.send(&[NAK])?;
                                    naks += 1;
                                    if naks > self.cfg.max_naks {
                                        return Err(Error::MaxNaks);
                                    }
                                    if let Some(p) = self.probe {
                                        debug!("re-activating meter after corrupt reply");
                                        p.activate();
                                    }
                                    State::Waking
                                }
                            },
                            Err(Error::TimeoutReply) => {
                                retries += 1;
                                debug!("reply truncated, retry {retries}/{}", self.cfg.max_retries);
                                if retries > self.cfg.max_retries {
                                    return Err(Error::MaxRetries);
                                }
                                State::Waking
                            }
                            Err(e) => return Err(e),
                        },
                    }
                }
            };
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Read one byte at a time until the meter's ENQ shows up,
    /// discarding everything else.
    fn await_enq<T: Transport>(&self, t: &mut T) -> Result<()> {
        let deadline = Instant::now() + self.cfg.enq_deadline;
        loop {
            self.check_cancel()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimeoutEnq);
            }
            match t.recv(1, remaining) {
                Ok(b) if b.is_empty() => return Err(Error::TimeoutEnq),
                Ok(b) if b[0] == ENQ => return Ok(()),
                Ok(b) => trace!("discarding {:#04x} while waiting for ENQ", b[0]),
                Err(Error::Timeout) => return Err(Error::TimeoutEnq),
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_reply<T: Transport>(&self, t: &mut T) -> Result<Vec<u8>> {
        match t.recv(self.cfg.recv_max, self.cfg.reply_deadline) {
            Ok(v) if v.is_empty() => Err(Error::TimeoutReply),
            Ok(v) => Ok(v),
            Err(Error::Timeout) => Err(Error::TimeoutReply),
            Err(e) => Err(e),
        }
    }

    /// Keep reading until a whole 66-byte reply is buffered. The first
    /// chunk has already been classified as data by its first byte.
    fn complete_frame<T: Transport>(&self, t: &mut T, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.cfg.reply_deadline;
        while buf.len() < FRAME_LEN {
            self.check_cancel()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimeoutReply);
            }
            match t.recv(self.cfg.recv_max, remaining) {
                Ok(v) if v.is_empty() => return Err(Error::TimeoutReply),
                Ok(v) => buf.extend_from_slice(&v),
                Err(Error::Timeout) => return Err(Error::TimeoutReply),
                Err(e) => return Err(e),
            }
        }
        buf.truncate(FRAME_LEN);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use crate::frame::{DATA_LEN, build_abnt};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Step {
        Read(Vec<u8>),
        Timeout,
    }

    /// Transport whose reads follow a fixed script and whose writes are
    /// recorded.
    struct ScriptTransport {
        steps: VecDeque<Step>,
        sends: Vec<Vec<u8>>,
    }

    impl ScriptTransport {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                sends: Vec::new(),
            }
        }

        fn frame_transmissions(&self, wire: &[u8]) -> usize {
            self.sends.iter().filter(|s| s.as_slice() == wire).count()
        }
    }

    impl Transport for ScriptTransport {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sends.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, max: usize, _deadline: Duration) -> Result<Vec<u8>> {
            match self.steps.front_mut() {
                None => Err(Error::Timeout),
                Some(Step::Timeout) => {
                    self.steps.pop_front();
                    Err(Error::Timeout)
                }
                Some(Step::Read(buf)) => {
                    let n = max.min(buf.len());
                    let out: Vec<u8> = buf.drain(..n).collect();
                    if buf.is_empty() {
                        self.steps.pop_front();
                    }
                    Ok(out)
                }
            }
        }

        fn peer_addr(&self) -> Result<std::net::SocketAddr> {
            Ok("127.0.0.1:5001".parse().unwrap())
        }
    }

    #[derive(Default)]
    struct CountingProbe(AtomicUsize);

    impl Activate for CountingProbe {
        fn activate(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_cfg() -> LinkConfig {
        LinkConfig {
            enq_deadline: Duration::from_millis(50),
            reply_deadline: Duration::from_millis(50),
            ..LinkConfig::default()
        }
    }

    /// A reply as the meter sends it: big-endian CRC, checkable as-is.
    fn reply_frame(command: u8, body: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; FRAME_LEN];
        f[0] = command;
        f[1..1 + body.len()].copy_from_slice(body);
        let crc = crc16(&f[..DATA_LEN]);
        f[DATA_LEN..].copy_from_slice(&crc.to_be_bytes());
        f
    }

    fn wire_of(frame: &[u8]) -> Vec<u8> {
        let mut w = vec![ENQ];
        w.extend_from_slice(frame);
        w
    }

    #[test]
    fn happy_path_discards_noise_before_enq() -> Result<()> {
        let frame = build_abnt(0x20, &[0x63, 0x00]);
        let reply = reply_frame(0x20, &[1, 2, 3]);
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![0x00, 0x00, ENQ]),
            Step::Read(reply.clone()),
        ]);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        let got = link.send_command(&mut t, &frame)?;
        assert_eq!(got, reply);
        // Five ALO bytes, then the wire frame, then the final ACK.
        assert_eq!(&t.sends[..5], &vec![vec![ALO]; 5][..]);
        assert_eq!(t.sends[5], wire_of(&frame));
        assert_eq!(t.sends.last().unwrap(), &vec![ACK]);
        Ok(())
    }

    #[test]
    fn wait_replies_defer_and_resend() -> Result<()> {
        let frame = build_abnt(0x21, &[0x63, 0x00]);
        let reply = reply_frame(0x21, &[]);
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![ENQ]),
            Step::Read(vec![WAIT]),
            Step::Read(vec![ENQ]),
            Step::Read(vec![WAIT]),
            Step::Read(vec![ENQ]),
            Step::Read(reply.clone()),
        ]);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        let got = link.send_command(&mut t, &frame)?;
        assert_eq!(got, reply);
        // Initial transmission plus one after each WAIT.
        assert_eq!(t.frame_transmissions(&wire_of(&frame)), 3);
        Ok(())
    }

    #[test]
    fn wait_budget_exhausted() {
        let frame = build_abnt(0x21, &[0x63, 0x00]);
        let mut steps = vec![Step::Read(vec![ENQ])];
        for _ in 0..13 {
            steps.push(Step::Read(vec![WAIT]));
            steps.push(Step::Read(vec![ENQ]));
        }
        let mut t = ScriptTransport::new(steps);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert!(matches!(
            link.send_command(&mut t, &frame),
            Err(Error::MaxWaits)
        ));
    }

    #[test]
    fn eight_naks_abort_without_a_ninth_transmit() {
        let frame = build_abnt(0x22, &[0x63, 0x00]);
        let mut steps = Vec::new();
        for _ in 0..8 {
            steps.push(Step::Read(vec![ENQ]));
            steps.push(Step::Read(vec![NAK]));
        }
        let mut t = ScriptTransport::new(steps);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert!(matches!(
            link.send_command(&mut t, &frame),
            Err(Error::MaxNaks)
        ));
        assert_eq!(t.frame_transmissions(&wire_of(&frame)), 8);
    }

    #[test]
    fn corrupt_reply_naks_probes_and_recovers() -> Result<()> {
        let frame = build_abnt(0x14, &[0x01, 0x02, 0x03]);
        let good = reply_frame(0x14, &[0x18, 0x06, 0x1A, 0x0F, 0x1E, 0x2D]);
        let mut bad = good.clone();
        bad[64] ^= 0xFF;
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![ENQ]),
            Step::Read(bad),
            Step::Read(vec![ENQ]),
            Step::Read(good.clone()),
        ]);
        let probe = CountingProbe::default();
        let link = Link::new(test_cfg(), Dialect::Abnt).with_probe(&probe);
        let got = link.send_command(&mut t, &frame)?;
        assert_eq!(got, good);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
        assert!(t.sends.contains(&vec![NAK]));
        assert_eq!(t.sends.last().unwrap(), &vec![ACK]);
        assert_eq!(t.frame_transmissions(&wire_of(&frame)), 2);
        Ok(())
    }

    #[test]
    fn enq_silence_exhausts_retries() {
        let frame = build_abnt(0x20, &[0x63, 0x00]);
        let steps = (0..8).map(|_| Step::Timeout).collect();
        let mut t = ScriptTransport::new(steps);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert!(matches!(
            link.send_command(&mut t, &frame),
            Err(Error::MaxRetries)
        ));
        // Eight wake-up bursts of five ALOs each, no frame ever sent.
        assert_eq!(t.sends.len(), 40);
    }

    #[test]
    fn closed_connection_counts_as_retry() {
        let frame = build_abnt(0x20, &[0x63, 0x00]);
        let mut steps = Vec::new();
        for _ in 0..8 {
            steps.push(Step::Read(vec![ENQ]));
            steps.push(Step::Read(vec![]));
        }
        let mut t = ScriptTransport::new(steps);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert!(matches!(
            link.send_command(&mut t, &frame),
            Err(Error::MaxRetries)
        ));
    }

    #[test]
    fn stray_ack_keeps_waiting_for_data() -> Result<()> {
        let frame = build_abnt(0x26, &[0x63, 0x00]);
        let reply = reply_frame(0x26, &[0, 0, 0, 1]);
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![ENQ]),
            Step::Read(vec![ACK]),
            Step::Read(reply.clone()),
        ]);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert_eq!(link.send_command(&mut t, &frame)?, reply);
        Ok(())
    }

    #[test]
    fn stray_enq_retransmits() -> Result<()> {
        let frame = build_abnt(0x26, &[0x63, 0x00]);
        let reply = reply_frame(0x26, &[]);
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![ENQ]),
            Step::Read(vec![ENQ]),
            Step::Read(reply.clone()),
        ]);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert_eq!(link.send_command(&mut t, &frame)?, reply);
        assert_eq!(t.frame_transmissions(&wire_of(&frame)), 2);
        Ok(())
    }

    #[test]
    fn reply_split_across_reads() -> Result<()> {
        let frame = build_abnt(0x80, &[0x63, 0x00]);
        let reply = reply_frame(0x80, &[9, 9, 9, 9]);
        let mut t = ScriptTransport::new(vec![
            Step::Read(vec![ENQ]),
            Step::Read(reply[..10].to_vec()),
            Step::Read(reply[10..].to_vec()),
        ]);
        let link = Link::new(test_cfg(), Dialect::Abnt);
        assert_eq!(link.send_command(&mut t, &frame)?, reply);
        Ok(())
    }

    #[test]
    fn cancellation_aborts_immediately() {
        let frame = build_abnt(0x20, &[0x63, 0x00]);
        let mut t = ScriptTransport::new(vec![Step::Read(vec![ENQ])]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let link = Link::new(test_cfg(), Dialect::Abnt).with_cancel(cancel);
        assert!(matches!(
            link.send_command(&mut t, &frame),
            Err(Error::Cancelled)
        ));
        assert!(t.sends.is_empty());
    }
}
