//! UDP activation probe.
//!
//! Some Saga 1000 units only start answering on TCP after receiving a
//! magic packet on UDP port 65535, and a wedged meter can be revived the
//! same way mid-session. The probe is strictly best-effort: send errors
//! are logged and swallowed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use log::{debug, warn};

/// Destination port of the activation packet.
pub const ACTIVATION_PORT: u16 = 65535;

/// The fixed activation payload.
pub const ACTIVATION_MAGIC: [u8; 6] = [0x02, 0x01, 0x21, 0xC0, 0x38, 0x03];

/// Something that can nudge the meter awake. The link layer triggers
/// this after a corrupted reply; tests count invocations.
pub trait Activate {
    /// Fire the wake-up, best effort.
    fn activate(&self);
}

/// Sends the activation magic to the meter a few times over UDP.
#[derive(Debug, Clone)]
pub struct ActivationProbe {
    target: IpAddr,
    attempts: u32,
    interval: Duration,
}

impl ActivationProbe {
    /// Probe with the production schedule: three packets, one second
    /// apart.
    #[must_use]
    pub fn new(target: IpAddr) -> Self {
        Self {
            target,
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }

    /// Override the packet count and spacing.
    #[must_use]
    pub fn with_schedule(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }
}

impl Activate for ActivationProbe {
    fn activate(&self) {
        let bind = if self.target.is_ipv6() {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        };
        let sock = match UdpSocket::bind(bind) {
            Ok(s) => s,
            Err(e) => {
                warn!("activation probe: cannot open UDP socket: {e}");
                return;
            }
        };
        let dst = SocketAddr::new(self.target, ACTIVATION_PORT);
        for i in 0..self.attempts {
            if i > 0 {
                std::thread::sleep(self.interval);
            }
            match sock.send_to(&ACTIVATION_MAGIC, dst) {
                Ok(_) => debug!("activation packet {}/{} sent to {dst}", i + 1, self.attempts),
                Err(e) => warn!("activation packet {}/{} failed: {e}", i + 1, self.attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_magic_packet() -> anyhow::Result<()> {
        let receiver = UdpSocket::bind(("127.0.0.1", ACTIVATION_PORT))?;
        receiver.set_read_timeout(Some(Duration::from_secs(2)))?;

        ActivationProbe::new("127.0.0.1".parse()?)
            .with_schedule(1, Duration::ZERO)
            .activate();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf)?;
        assert_eq!(&buf[..n], &ACTIVATION_MAGIC);
        Ok(())
    }

    #[test]
    fn unreachable_target_is_swallowed() {
        // No listener anywhere near this; must not panic or error.
        ActivationProbe::new("127.0.0.1".parse().unwrap())
            .with_schedule(2, Duration::ZERO)
            .activate();
    }
}
