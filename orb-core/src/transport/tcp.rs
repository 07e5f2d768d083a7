//! Plain TCP transceiver and its connector/acceptor.

use std::io;
use std::net::{TcpListener, TcpStream};

use tracing::debug;

use crate::error::OrbError;

use super::{Acceptor, Connector, Endpoint, IoBuffer, Socket, SocketOp, Transceiver};

// ── StdSocket ────────────────────────────────────────────────────

/// Non-blocking wrapper around a std TCP stream.
pub struct StdSocket {
    stream: TcpStream,
}

impl StdSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(StdSocket { stream })
    }
}

impl Socket for StdSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.stream, buf)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ── TcpTransceiver ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    ConnectPending,
    Connected,
    Closed,
}

/// Cleartext byte transport over a non-blocking socket.
pub struct TcpTransceiver {
    socket: Box<dyn Socket>,
    state: TcpState,
}

impl TcpTransceiver {
    /// Transceiver for a socket whose connect may still be in flight.
    pub fn connecting(socket: Box<dyn Socket>) -> Self {
        TcpTransceiver {
            socket,
            state: TcpState::ConnectPending,
        }
    }

    /// Transceiver for an accepted (already connected) socket.
    pub fn connected(socket: Box<dyn Socket>) -> Self {
        TcpTransceiver {
            socket,
            state: TcpState::Connected,
        }
    }
}

impl Transceiver for TcpTransceiver {
    fn initialize(&mut self) -> Result<SocketOp, OrbError> {
        match self.state {
            TcpState::ConnectPending => {
                if self.socket.finish_connect()? {
                    self.state = TcpState::Connected;
                    Ok(SocketOp::None)
                } else {
                    Ok(SocketOp::Connect)
                }
            }
            TcpState::Connected => Ok(SocketOp::None),
            TcpState::Closed => Err(OrbError::ConnectionLost),
        }
    }

    fn read(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError> {
        if self.state != TcpState::Connected {
            return Err(OrbError::ConnectionLost);
        }
        while !buf.is_complete() {
            match self.socket.read(buf.unfilled()) {
                Ok(0) => {
                    self.state = TcpState::Closed;
                    return Err(OrbError::ConnectionLost);
                }
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SocketOp::None)
    }

    fn write(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError> {
        if self.state != TcpState::Connected {
            return Err(OrbError::ConnectionLost);
        }
        while !buf.is_complete() {
            match self.socket.write(buf.pending()) {
                Ok(0) => {
                    self.state = TcpState::Closed;
                    return Err(OrbError::ConnectionLost);
                }
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Write),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SocketOp::None)
    }

    fn close(&mut self) {
        if self.state != TcpState::Closed {
            debug!("closing tcp transceiver");
            self.state = TcpState::Closed;
        }
    }
}

// ── Connector / Acceptor ─────────────────────────────────────────

pub struct TcpConnector {
    endpoint: Endpoint,
    default_host: String,
}

impl TcpConnector {
    pub fn new(endpoint: Endpoint, default_host: impl Into<String>) -> Self {
        TcpConnector {
            endpoint,
            default_host: default_host.into(),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Box<dyn Transceiver>, OrbError> {
        let host = self.endpoint.host_or(&self.default_host);
        let stream = TcpStream::connect((host, self.endpoint.port))?;
        let socket = StdSocket::new(stream)?;
        Ok(Box::new(TcpTransceiver::connecting(Box::new(socket))))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

pub struct TcpAcceptor {
    endpoint: Endpoint,
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind the endpoint; a missing host binds the wildcard address.
    pub fn bind(endpoint: Endpoint) -> Result<Self, OrbError> {
        let host = endpoint.host_or("0.0.0.0").to_string();
        let listener = TcpListener::bind((host.as_str(), endpoint.port))?;
        listener.set_nonblocking(true)?;
        Ok(TcpAcceptor { endpoint, listener })
    }

    pub fn local_port(&self) -> Result<u16, OrbError> {
        Ok(self.listener.local_addr()?.port())
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, OrbError> {
        match self.listener.accept() {
            Ok((stream, _peer)) => {
                let socket = StdSocket::new(stream)?;
                Ok(Some(Box::new(TcpTransceiver::connected(Box::new(socket)))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

// ── Tests ────────────────────────────────────────────────────────
