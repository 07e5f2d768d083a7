//! Cleartext proxy tunnels established before any TLS byte is sent.

use std::io;
use std::net::Ipv4Addr;

use crate::error::OrbError;

use super::{IoBuffer, Socket, SocketOp};

const MAX_HTTP_RESPONSE: usize = 8 * 1024;
const SOCKS4_RESPONSE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelKind {
    HttpConnect,
    Socks4,
}

/// One in-flight CONNECT or SOCKS4 exchange. The response is read
/// byte-by-byte so no byte belonging to the tunneled protocol is ever
/// consumed here.
pub struct ProxyTunnel {
    kind: TunnelKind,
    request: IoBuffer,
    response: Vec<u8>,
}

impl ProxyTunnel {
    /// `CONNECT host:port` through an HTTP proxy.
    pub fn http_connect(host: &str, port: u16) -> Self {
        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        ProxyTunnel {
            kind: TunnelKind::HttpConnect,
            request: IoBuffer::for_write(request.into_bytes()),
            response: Vec::new(),
        }
    }

    /// SOCKS4 CONNECT to a literal IPv4 address.
    pub fn socks4(addr: Ipv4Addr, port: u16) -> Self {
        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&port.to_be_bytes());
        request.extend_from_slice(&addr.octets());
        request.push(0x00); // empty user id
        ProxyTunnel {
            kind: TunnelKind::Socks4,
            request: IoBuffer::for_write(request),
            response: Vec::new(),
        }
    }

    /// Drive the request out. `SocketOp::None` once fully sent.
    pub fn write_request(&mut self, socket: &mut dyn Socket) -> Result<SocketOp, OrbError> {
        while !self.request.is_complete() {
            match socket.write(self.request.pending()) {
                Ok(0) => return Err(OrbError::ConnectionLost),
                Ok(n) => self.request.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Write),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SocketOp::None)
    }

    /// Drive the response in. `SocketOp::None` once the proxy granted
    /// the tunnel; a refusal is an error.
    pub fn read_response(&mut self, socket: &mut dyn Socket) -> Result<SocketOp, OrbError> {
        loop {
            if self.is_response_complete() {
                return self.check_response().map(|_| SocketOp::None);
            }
            let mut byte = [0u8; 1];
            match socket.read(&mut byte) {
                Ok(0) => return Err(OrbError::ConnectionLost),
                Ok(_) => self.response.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SocketOp::Read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if self.kind == TunnelKind::HttpConnect && self.response.len() > MAX_HTTP_RESPONSE {
                return Err(OrbError::ProxyTunnel("oversized proxy response".to_string()));
            }
        }
    }

    fn is_response_complete(&self) -> bool {
        match self.kind {
            TunnelKind::HttpConnect => self.response.ends_with(b"\r\n\r\n"),
            TunnelKind::Socks4 => self.response.len() == SOCKS4_RESPONSE_LEN,
        }
    }

    fn check_response(&self) -> Result<(), OrbError> {
        match self.kind {
            TunnelKind::HttpConnect => {
                let head = String::from_utf8_lossy(&self.response);
                let status_line = head.lines().next().unwrap_or_default();
                let mut parts = status_line.split_whitespace();
                let version = parts.next().unwrap_or_default();
                let code = parts.next().unwrap_or_default();
                if version.starts_with("HTTP/") && code == "200" {
                    Ok(())
                } else {
                    Err(OrbError::ProxyTunnel(format!(
                        "proxy refused CONNECT: {status_line}"
                    )))
                }
            }
            TunnelKind::Socks4 => {
                if self.response[1] == 0x5A {
                    Ok(())
                } else {
                    Err(OrbError::ProxyTunnel(format!(
                        "socks4 request rejected: {:#04x}",
                        self.response[1]
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::tests::PipeSocket;

    fn drive_request(tunnel: &mut ProxyTunnel, socket: &mut dyn Socket) {
        assert_eq!(tunnel.write_request(socket).unwrap(), SocketOp::None);
    }

    #[test]
    fn http_connect_granted() {
        let (mut near, mut far) = PipeSocket::pair();
        let mut tunnel = ProxyTunnel::http_connect("backend.internal", 4062);
        drive_request(&mut tunnel, &mut near);

        // Proxy side sees the CONNECT line.
        let mut sent = vec![0u8; 256];
        let n = far.read(&mut sent).unwrap();
        let text = String::from_utf8_lossy(&sent[..n]).to_string();
        assert!(text.starts_with("CONNECT backend.internal:4062 HTTP/1.1\r\n"));

        // Not complete until the blank line arrives; trailing bytes
        // stay untouched.
        far.write(b"HTTP/1.1 200 Connection established\r\n").unwrap();
        assert_eq!(tunnel.read_response(&mut near).unwrap(), SocketOp::Read);
        far.write(b"\r\n\x16\x03").unwrap();
        assert_eq!(tunnel.read_response(&mut near).unwrap(), SocketOp::None);

        let mut rest = [0u8; 4];
        assert_eq!(near.read(&mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], &[0x16, 0x03]);
    }

    #[test]
    fn http_connect_refused() {
        let (mut near, mut far) = PipeSocket::pair();
        let mut tunnel = ProxyTunnel::http_connect("h", 1);
        drive_request(&mut tunnel, &mut near);
        far.write(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").unwrap();
        assert!(matches!(
            tunnel.read_response(&mut near),
            Err(OrbError::ProxyTunnel(_))
        ));
    }

    #[test]
    fn socks4_exchange() {
        let (mut near, mut far) = PipeSocket::pair();
        let mut tunnel = ProxyTunnel::socks4(Ipv4Addr::new(10, 0, 0, 7), 4062);
        drive_request(&mut tunnel, &mut near);

        let mut sent = [0u8; 16];
        let n = far.read(&mut sent).unwrap();
        assert_eq!(&sent[..n], &[0x04, 0x01, 0x0F, 0xDE, 10, 0, 0, 7, 0x00]);

        far.write(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(tunnel.read_response(&mut near).unwrap(), SocketOp::None);
    }

    #[test]
    fn socks4_rejection() {
        let (mut near, mut far) = PipeSocket::pair();
        let mut tunnel = ProxyTunnel::socks4(Ipv4Addr::LOCALHOST, 80);
        drive_request(&mut tunnel, &mut near);
        far.write(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            tunnel.read_response(&mut near),
            Err(OrbError::ProxyTunnel(_))
        ));
    }
}
