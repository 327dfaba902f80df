#![warn(missing_docs)]
/*! Client library for Saga 1000 electricity meters.

The Saga 1000 family speaks the [ABNT NBR 14522][abnt] serial protocol,
here tunneled over a plain TCP connection, with an auxiliary UDP
"activation" packet used to wake the meter up. This crate implements the
client side: the link-layer handshake (ALO wake-up, ENQ/ACK/NAK/WAIT,
bounded retransmission), the 66-byte command frames of both observed
dialects, CRC-16 integrity checking, and field-level decoding of replies
against a per-command schema.

# Architecture overview

```text
      [ Client ]
          ↓ wakes the meter
  [ ActivationProbe ] (UDP)
          ↓
     [ Transport ] (TCP)
          ↓
       [ Link ]  ── FrameBuilder / FrameParser / crc16 / complement
          ↓
 [ schema + field decode ]
          ↓
       [ Sink ]
```

One session is strictly sequential: every write completes before the next
read is issued, and no reply is acknowledged before its CRC has been
verified. Multiple meters are handled by running independent [`Client`]s.

# Example

```no_run
use saga1000::client::{Client, ClientConfig, Record, Sink};

struct Print;
impl Sink for Print {
    fn record(&mut self, rec: &Record) {
        println!("{rec:?}");
    }
}

let cfg = ClientConfig::new("172.16.0.42".parse().unwrap(), 5001);
let client = Client::new(cfg);
client.run(0x14, Some(0x010203), &mut Print)?;
# Ok::<(), saga1000::Error>(())
```

[abnt]: https://www.abntcatalogo.com.br/

[`Client`]: client::Client
 */

pub mod activation;
pub mod client;
pub mod complement;
pub mod crc;
pub mod diag;
pub mod field;
pub mod frame;
pub mod link;
pub mod schema;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Saga 1000 client error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP connect failed or the socket could not be set up.
    #[error("connect to {addr} failed: {err}")]
    ConnectFailed {
        /// Peer we tried to reach.
        addr: std::net::SocketAddr,
        /// Underlying socket error.
        err: std::io::Error,
    },

    /// A read deadline expired.
    #[error("read deadline exceeded")]
    Timeout,

    /// The meter never sent ENQ within the handshake deadline.
    #[error("timed out waiting for ENQ")]
    TimeoutEnq,

    /// The meter accepted the command but never replied.
    #[error("timed out waiting for reply")]
    TimeoutReply,

    /// Too many NAKs in one session.
    #[error("NAK limit exceeded")]
    MaxNaks,

    /// Too many WAITs in one session.
    #[error("WAIT limit exceeded")]
    MaxWaits,

    /// Too many whole-cycle retries in one session.
    #[error("retry limit exceeded")]
    MaxRetries,

    /// Reply frame failed its CRC check.
    #[error("frame CRC mismatch: got {got:#06x}, want {want:#06x}")]
    BadCrc {
        /// CRC carried in the frame trailer.
        got: u16,
        /// CRC computed over the frame body.
        want: u16,
    },

    /// Reply too short to contain framing and trailer.
    #[error("reply too short: {0} bytes")]
    TooShort(usize),

    /// The `01 99` start marker was not found in a generic-dialect reply.
    #[error("response start marker not found")]
    NoStart,

    /// No schema is registered for this command code.
    ///
    /// Non-fatal: callers still get the raw payload.
    #[error("no schema for command {0:#04x}")]
    NoSchema(u8),

    /// The session was cancelled from the outside.
    #[error("cancelled")]
    Cancelled,

    /// Any other I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cooperative cancellation flag, shared between a session and whoever
/// wants to abort it (typically a Ctrl-C handler).
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All sessions holding a clone will abort at
    /// their next blocking point with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
