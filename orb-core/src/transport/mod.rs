//! Non-blocking transport state machines.
//!
//! A [`Transceiver`] never blocks and never registers with an event
//! loop itself: every call returns the [`SocketOp`] the caller must
//! wait for before calling again. That keeps the machines synchronous,
//! deterministic, and testable with sockets that are never ready.

mod ssl;
mod tcp;
mod tunnel;

pub use ssl::{PeerVerifier, SslAcceptor, SslConnector, SslTransceiver, VerifyInfo};
pub use tcp::{StdSocket, TcpAcceptor, TcpConnector, TcpTransceiver};
pub use tunnel::ProxyTunnel;

use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::error::OrbError;

// ── SocketOp ─────────────────────────────────────────────────────

/// What the caller must wait for before re-driving a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOp {
    /// Nothing: the requested work is complete.
    None,
    /// Wait for the socket to become readable.
    Read,
    /// Wait for the socket to become writable.
    Write,
    /// Wait for the pending connect to resolve.
    Connect,
}

// ── IoBuffer ─────────────────────────────────────────────────────

/// Byte buffer with a progress cursor, filled or drained across
/// multiple partial operations.
#[derive(Debug)]
pub struct IoBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl IoBuffer {
    /// Buffer expecting exactly `len` bytes to be read into it.
    pub fn for_read(len: usize) -> Self {
        IoBuffer {
            buf: vec![0; len],
            pos: 0,
        }
    }

    /// Buffer holding bytes to be written out.
    pub fn for_write(data: Vec<u8>) -> Self {
        IoBuffer { buf: data, pos: 0 }
    }

    pub fn is_complete(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Unfilled tail, for reads.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    /// Unsent tail, for writes.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.buf.len());
        self.pos += n;
    }

    /// The completed contents.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

// ── Socket / Transceiver ─────────────────────────────────────────

/// Minimal non-blocking socket surface, mockable in tests.
///
/// `read` and `write` follow `std::io` semantics: `WouldBlock` means
/// not ready, `Ok(0)` from a read means the peer closed.
pub trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// `Ok(false)` while the connect is still in flight.
    fn finish_connect(&mut self) -> io::Result<bool>;
}

/// A connection-oriented byte transport driven entirely by its caller.
pub trait Transceiver: Send {
    /// Advance connection setup (connect, tunnel, handshake). Returns
    /// `SocketOp::None` once application data can flow.
    fn initialize(&mut self) -> Result<SocketOp, OrbError>;

    /// Fill `buf` with application data. `SocketOp::None` means the
    /// buffer is complete.
    fn read(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError>;

    /// Drain `buf` as application data. `SocketOp::None` means the
    /// buffer was fully written.
    fn write(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError>;

    /// Close the transport. Idempotent; failures during shutdown
    /// notices are swallowed.
    fn close(&mut self);
}

// ── Connector / Acceptor ─────────────────────────────────────────

/// Creates outgoing transceivers for one endpoint.
pub trait Connector: Send {
    fn connect(&self) -> Result<Box<dyn Transceiver>, OrbError>;
    fn endpoint(&self) -> &Endpoint;
}

/// Accepts incoming transceivers on one bound endpoint.
pub trait Acceptor: Send {
    /// `Ok(None)` when no connection is pending.
    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, OrbError>;
    fn endpoint(&self) -> &Endpoint;
}

// ── Endpoint ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Tcp,
    Ssl,
}

/// One parsed endpoint: `tcp|ssl -h <host> -p <port> [-t <timeoutMs>]
/// [-z]`. A missing `-h` leaves the host to the configured default
/// (or the wildcard address when binding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointType,
    pub host: Option<String>,
    pub port: u16,
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl Endpoint {
    pub fn host_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.host.as_deref().unwrap_or(default)
    }
}

impl FromStr for Endpoint {
    type Err = OrbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &'static str| OrbError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason,
        };

        let mut tokens = s.split_whitespace();
        let kind = match tokens.next() {
            Some("tcp") => EndpointType::Tcp,
            Some("ssl") => EndpointType::Ssl,
            Some(_) => return Err(invalid("unknown transport")),
            None => return Err(invalid("empty endpoint")),
        };

        let mut host = None;
        let mut port = None;
        let mut timeout = None;
        let mut compress = false;
        while let Some(token) = tokens.next() {
            match token {
                "-h" => {
                    let v = tokens.next().ok_or_else(|| invalid("-h requires a value"))?;
                    host = Some(v.to_string());
                }
                "-p" => {
                    let v = tokens.next().ok_or_else(|| invalid("-p requires a value"))?;
                    port = Some(v.parse::<u16>().map_err(|_| invalid("invalid port"))?);
                }
                "-t" => {
                    let v = tokens.next().ok_or_else(|| invalid("-t requires a value"))?;
                    let ms = v.parse::<u64>().map_err(|_| invalid("invalid timeout"))?;
                    timeout = Some(Duration::from_millis(ms));
                }
                "-z" => compress = true,
                _ => return Err(invalid("unknown option")),
            }
        }

        Ok(Endpoint {
            kind,
            host,
            port: port.ok_or_else(|| invalid("missing -p"))?,
            timeout,
            compress,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EndpointType::Tcp => f.write_str("tcp")?,
            EndpointType::Ssl => f.write_str("ssl")?,
        }
        if let Some(host) = &self.host {
            write!(f, " -h {host}")?;
        }
        write!(f, " -p {}", self.port)?;
        if let Some(t) = self.timeout {
            write!(f, " -t {}", t.as_millis())?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_full() {
        let ep: Endpoint = "ssl -h example.com -p 4062 -t 5000 -z".parse().unwrap();
        assert_eq!(ep.kind, EndpointType::Ssl);
        assert_eq!(ep.host.as_deref(), Some("example.com"));
        assert_eq!(ep.port, 4062);
        assert_eq!(ep.timeout, Some(Duration::from_millis(5000)));
        assert!(ep.compress);
    }

    #[test]
    fn endpoint_parse_minimal_and_default_host() {
        let ep: Endpoint = "tcp -p 10000".parse().unwrap();
        assert_eq!(ep.kind, EndpointType::Tcp);
        assert_eq!(ep.host, None);
        assert_eq!(ep.host_or("0.0.0.0"), "0.0.0.0");
        assert_eq!(ep.timeout, None);
        assert!(!ep.compress);
    }

    #[test]
    fn endpoint_parse_errors() {
        for bad in [
            "",
            "udp -p 1",
            "tcp",
            "tcp -h localhost",
            "tcp -p notaport",
            "tcp -p 1 -t soon",
            "tcp -p 1 -x",
            "tcp -h",
        ] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(OrbError::InvalidEndpoint { .. })),
                "expected parse failure for {bad:?}"
            );
        }
    }

    #[test]
    fn endpoint_display_roundtrip() {
        for s in ["tcp -p 10000", "ssl -h 127.0.0.1 -p 443 -t 100 -z"] {
            let ep: Endpoint = s.parse().unwrap();
            assert_eq!(ep.to_string(), s);
            assert_eq!(ep.to_string().parse::<Endpoint>().unwrap(), ep);
        }
    }

    #[test]
    fn io_buffer_tracks_progress() {
        let mut buf = IoBuffer::for_write(vec![1, 2, 3, 4]);
        assert_eq!(buf.pending(), &[1, 2, 3, 4]);
        buf.advance(3);
        assert_eq!(buf.pending(), &[4]);
        assert!(!buf.is_complete());
        buf.advance(1);
        assert!(buf.is_complete());

        let mut buf = IoBuffer::for_read(2);
        buf.unfilled()[0] = 9;
        buf.advance(2);
        assert!(buf.is_complete());
        assert_eq!(buf.into_inner()[0], 9);
    }
}
