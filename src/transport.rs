//! Byte-stream transport to the meter.
//!
//! The link layer only ever needs deadline-bounded reads and blocking
//! writes, so that is the whole trait. Tests script it in memory; the
//! real thing is a TCP connection.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use log::trace;

use crate::{Error, Result};

/// A connected byte stream with deadline-bounded reads.
///
/// Closing is dropping.
pub trait Transport {
    /// Write all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `max` bytes, waiting at most `deadline`.
    ///
    /// Returns [`Error::Timeout`] when the deadline fires with nothing
    /// read, and an empty buffer when the peer closed the connection.
    fn recv(&mut self, max: usize, deadline: Duration) -> Result<Vec<u8>>;

    /// Address of the meter on the other end.
    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// Blocking TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to the meter, honoring a connect deadline.
    pub fn connect(addr: SocketAddr, deadline: Duration) -> Result<Self> {
        let stream =
            TcpStream::connect_timeout(&addr, deadline).map_err(|err| Error::ConnectFailed {
                addr,
                err,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("send {} bytes: {data:02x?}", data.len());
        self.stream.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, max: usize, deadline: Duration) -> Result<Vec<u8>> {
        // A zero timeout would disable the deadline entirely.
        self.stream
            .set_read_timeout(Some(deadline.max(Duration::from_millis(1))))?;
        let mut buf = vec![0u8; max];
        match self.stream.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                trace!("recv {n} bytes: {buf:02x?}");
                Ok(buf)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(Error::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_honors_deadline() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let _keepalive = std::thread::spawn(move || listener.accept());
        let mut t = TcpTransport::connect(addr, Duration::from_secs(1))?;
        let got = t.recv(16, Duration::from_millis(20));
        assert!(matches!(got, Err(Error::Timeout)), "{got:?}");
        Ok(())
    }

    #[test]
    fn recv_returns_partial_data() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(&[1, 2, 3]).unwrap();
        });
        let mut t = TcpTransport::connect(addr, Duration::from_secs(1))?;
        let got = t.recv(512, Duration::from_secs(1))?;
        assert_eq!(got, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn recv_empty_on_close() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            drop(s);
        });
        let mut t = TcpTransport::connect(addr, Duration::from_secs(1))?;
        let got = t.recv(512, Duration::from_secs(1))?;
        assert!(got.is_empty());
        Ok(())
    }
}
