//! TLS transceiver driving the rustls engine over a non-blocking
//! socket.
//!
//! The machine owns three distinct byte domains: the cleartext proxy
//! tunnel (finished before any TLS byte), the TLS record buffers
//! inside `rustls::Connection`, and the caller's application-data
//! buffers. Every call advances as far as the socket allows and
//! reports the operation it is stalled on.

use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::{debug, trace};

use crate::error::OrbError;

use super::{Acceptor, Connector, Endpoint, IoBuffer, Socket, SocketOp, Transceiver};
use super::tcp::StdSocket;
use super::tunnel::ProxyTunnel;

/// Plaintext handed to the TLS engine per write pass; larger writes
/// iterate so record buffering stays bounded.
const WRITE_CHUNK: usize = 16 * 1024;

// ── Peer verification ────────────────────────────────────────────

/// What a post-handshake verifier gets to inspect.
pub struct VerifyInfo<'a> {
    /// Peer certificate chain, leaf first. Empty when the peer sent
    /// no certificate.
    pub certificates: &'a [CertificateDer<'a>],
    /// Remote host (outgoing) or peer description (incoming).
    pub address: &'a str,
    /// True on the accepting side.
    pub incoming: bool,
}

/// Application veto over an otherwise successful handshake.
/// Rejection is fatal to the connection.
pub type PeerVerifier = Box<dyn Fn(&VerifyInfo<'_>) -> bool + Send>;

// ── State machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslState {
    NeedConnect,
    ConnectPending,
    ProxyConnectRequest,
    ProxyConnectRequestPending,
    Connected,
    HandshakeComplete,
    Closed,
}

pub struct SslTransceiver {
    socket: Box<dyn Socket>,
    tls: Connection,
    state: SslState,
    tunnel: Option<ProxyTunnel>,
    verifier: Option<PeerVerifier>,
    address: String,
    incoming: bool,
}

impl SslTransceiver {
    /// Outgoing transceiver. The tunnel, when present, is completed in
    /// cleartext before the first TLS byte.
    pub fn client(
        socket: Box<dyn Socket>,
        config: Arc<ClientConfig>,
        host: &str,
        tunnel: Option<ProxyTunnel>,
    ) -> Result<Self, OrbError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| OrbError::TlsConfig(format!("invalid server name: {host}")))?;
        let tls = ClientConnection::new(config, server_name)
            .map_err(|e| OrbError::TlsConfig(e.to_string()))?;
        Ok(SslTransceiver {
            socket,
            tls: Connection::from(tls),
            state: SslState::NeedConnect,
            tunnel,
            verifier: None,
            address: host.to_string(),
            incoming: false,
        })
    }

    /// Incoming transceiver over an accepted socket.
    pub fn server(
        socket: Box<dyn Socket>,
        config: Arc<ServerConfig>,
        peer: &str,
    ) -> Result<Self, OrbError> {
        let tls = ServerConnection::new(config).map_err(|e| OrbError::TlsConfig(e.to_string()))?;
        Ok(SslTransceiver {
            socket,
            tls: Connection::from(tls),
            state: SslState::Connected,
            tunnel: None,
            verifier: None,
            address: peer.to_string(),
            incoming: true,
        })
    }

    pub fn with_verifier(mut self, verifier: PeerVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn flush_tls(&mut self) -> Result<SocketOp, OrbError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut SocketIo(self.socket.as_mut())) {
                Ok(0) => return Err(OrbError::ConnectionLost),
                Ok(n) => trace!(bytes = n, "tls records written"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Write),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SocketOp::None)
    }

    /// One NEED_WRAP/NEED_UNWRAP style pass: flush what the engine
    /// wants out, feed it what the socket has, repeat until the
    /// handshake finishes or the socket stalls.
    fn drive_handshake(&mut self) -> Result<SocketOp, OrbError> {
        loop {
            match self.flush_tls()? {
                SocketOp::None => {}
                op => return Ok(op),
            }
            if !self.tls.is_handshaking() {
                return Ok(SocketOp::None);
            }
            match self.tls.read_tls(&mut SocketIo(self.socket.as_mut())) {
                Ok(0) => return Err(OrbError::ConnectionLost),
                Ok(_) => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| OrbError::HandshakeFailed(e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Read),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn verify_peer(&self) -> Result<(), OrbError> {
        if let Some(verifier) = &self.verifier {
            let certificates = self.tls.peer_certificates().unwrap_or_default();
            let info = VerifyInfo {
                certificates,
                address: &self.address,
                incoming: self.incoming,
            };
            if !verifier(&info) {
                return Err(OrbError::PeerRejected);
            }
        }
        Ok(())
    }
}

impl Transceiver for SslTransceiver {
    fn initialize(&mut self) -> Result<SocketOp, OrbError> {
        loop {
            match self.state {
                SslState::NeedConnect => self.state = SslState::ConnectPending,
                SslState::ConnectPending => {
                    if !self.socket.finish_connect()? {
                        return Ok(SocketOp::Connect);
                    }
                    self.state = if self.tunnel.is_some() {
                        SslState::ProxyConnectRequest
                    } else {
                        SslState::Connected
                    };
                }
                SslState::ProxyConnectRequest => {
                    let tunnel = self.tunnel.as_mut().expect("state implies tunnel");
                    match tunnel.write_request(self.socket.as_mut())? {
                        SocketOp::None => self.state = SslState::ProxyConnectRequestPending,
                        op => return Ok(op),
                    }
                }
                SslState::ProxyConnectRequestPending => {
                    let tunnel = self.tunnel.as_mut().expect("state implies tunnel");
                    match tunnel.read_response(self.socket.as_mut())? {
                        SocketOp::None => {
                            debug!(address = %self.address, "proxy tunnel established");
                            self.tunnel = None;
                            self.state = SslState::Connected;
                        }
                        op => return Ok(op),
                    }
                }
                SslState::Connected => match self.drive_handshake()? {
                    SocketOp::None => {
                        self.verify_peer()?;
                        debug!(address = %self.address, incoming = self.incoming, "tls handshake complete");
                        self.state = SslState::HandshakeComplete;
                        return Ok(SocketOp::None);
                    }
                    op => return Ok(op),
                },
                SslState::HandshakeComplete => return Ok(SocketOp::None),
                SslState::Closed => return Err(OrbError::ConnectionLost),
            }
        }
    }

    fn read(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError> {
        match self.state {
            SslState::HandshakeComplete => {}
            SslState::Closed => return Err(OrbError::ConnectionLost),
            _ => return Err(OrbError::ProtocolViolation("ssl transceiver not initialized")),
        }
        loop {
            // Drain decrypted plaintext first.
            while !buf.is_complete() {
                match io::Read::read(&mut self.tls.reader(), buf.unfilled()) {
                    Ok(0) => return Err(OrbError::ConnectionLost),
                    Ok(n) => buf.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            if buf.is_complete() {
                return Ok(SocketOp::None);
            }
            // Pull more records off the socket.
            match self.tls.read_tls(&mut SocketIo(self.socket.as_mut())) {
                Ok(0) => return Err(OrbError::ConnectionLost),
                Ok(_) => {
                    self.tls.process_new_packets()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Read),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &mut IoBuffer) -> Result<SocketOp, OrbError> {
        match self.state {
            SslState::HandshakeComplete => {}
            SslState::Closed => return Err(OrbError::ConnectionLost),
            _ => return Err(OrbError::ProtocolViolation("ssl transceiver not initialized")),
        }
        // Records from an interrupted earlier write go out first.
        match self.flush_tls()? {
            SocketOp::None => {}
            op => return Ok(op),
        }
        while !buf.is_complete() {
            let chunk_len = buf.pending().len().min(WRITE_CHUNK);
            let n = io::Write::write(&mut self.tls.writer(), &buf.pending()[..chunk_len])
                .map_err(OrbError::from)?;
            buf.advance(n);
            match self.flush_tls()? {
                SocketOp::None => {}
                op => return Ok(op),
            }
        }
        Ok(SocketOp::None)
    }

    fn close(&mut self) {
        if self.state == SslState::Closed {
            return;
        }
        if matches!(self.state, SslState::Connected | SslState::HandshakeComplete) {
            // Best effort close_notify; failures are swallowed.
            self.tls.send_close_notify();
            let _ = self.tls.write_tls(&mut SocketIo(self.socket.as_mut()));
        }
        debug!(address = %self.address, "ssl transceiver closed");
        self.state = SslState::Closed;
    }
}

/// Adapts the `Socket` trait to the `std::io` traits rustls drives.
struct SocketIo<'a>(&'a mut dyn Socket);

impl io::Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl io::Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Connector / Acceptor ─────────────────────────────────────────

pub struct SslConnector {
    endpoint: Endpoint,
    config: Arc<ClientConfig>,
    default_host: String,
}

impl SslConnector {
    pub fn new(endpoint: Endpoint, config: Arc<ClientConfig>, default_host: impl Into<String>) -> Self {
        SslConnector {
            endpoint,
            config,
            default_host: default_host.into(),
        }
    }
}

impl Connector for SslConnector {
    fn connect(&self) -> Result<Box<dyn Transceiver>, OrbError> {
        let host = self.endpoint.host_or(&self.default_host).to_string();
        let stream = std::net::TcpStream::connect((host.as_str(), self.endpoint.port))?;
        let socket = StdSocket::new(stream)?;
        let transceiver =
            SslTransceiver::client(Box::new(socket), self.config.clone(), &host, None)?;
        Ok(Box::new(transceiver))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

pub struct SslAcceptor {
    endpoint: Endpoint,
    listener: std::net::TcpListener,
    config: Arc<ServerConfig>,
}

impl SslAcceptor {
    pub fn bind(endpoint: Endpoint, config: Arc<ServerConfig>) -> Result<Self, OrbError> {
        let host = endpoint.host_or("0.0.0.0").to_string();
        let listener = std::net::TcpListener::bind((host.as_str(), endpoint.port))?;
        listener.set_nonblocking(true)?;
        Ok(SslAcceptor {
            endpoint,
            listener,
            config,
        })
    }
}

impl Acceptor for SslAcceptor {
    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, OrbError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let socket = StdSocket::new(stream)?;
                let transceiver =
                    SslTransceiver::server(Box::new(socket), self.config.clone(), &peer.to_string())?;
                Ok(Some(Box::new(transceiver)))
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
