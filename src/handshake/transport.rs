use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{HandshakeError, HandshakeMessage};

/// Largest handshake datagram accepted; a server hello with a certificate chain fits.
pub const MAX_HANDSHAKE_DATAGRAM: usize = 8 * 1024;

/// True for the error kinds a socket read timeout produces.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Binds a UDP socket. An unspecified IPv6 address accepts IPv4 peers as well.
pub fn bind_datagram(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let IpAddr::V6(ip) = addr.ip() {
        if ip.is_unspecified() {
            socket.set_only_v6(false)?;
        }
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Unspecified address of the same family as `peer`, for client-side binds.
pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// A decoded handshake datagram plus the exact bytes it arrived as.
#[derive(Debug)]
pub struct Inbound {
    pub message: HandshakeMessage,
    pub raw: Vec<u8>,
    pub peer: SocketAddr,
}

/// CBOR-over-UDP framing for handshake datagrams.
#[derive(Debug)]
pub struct CborUdpTransport<'a> {
    socket: &'a UdpSocket,
    max_size: usize,
}

impl<'a> CborUdpTransport<'a> {
    pub fn new(socket: &'a UdpSocket) -> Self {
        Self {
            socket,
            max_size: MAX_HANDSHAKE_DATAGRAM,
        }
    }

    /// Sends `msg` and returns the encoded bytes for transcript hashing.
    pub fn send_to(&self, msg: &HandshakeMessage, peer: SocketAddr) -> Result<Vec<u8>, HandshakeError> {
        let bytes = serde_cbor::to_vec(msg)
            .map_err(|e| HandshakeError::Protocol(format!("encode: {}", e)))?;
        self.socket.send_to(&bytes, peer)?;
        Ok(bytes)
    }

    /// Sends on a connected socket.
    pub fn send(&self, msg: &HandshakeMessage) -> Result<Vec<u8>, HandshakeError> {
        let bytes = serde_cbor::to_vec(msg)
            .map_err(|e| HandshakeError::Protocol(format!("encode: {}", e)))?;
        self.socket.send(&bytes)?;
        Ok(bytes)
    }

    /// Receives one datagram. `Ok(None)` means the socket read timeout expired.
    pub fn recv(&self) -> Result<Option<Inbound>, HandshakeError> {
        let mut buf = vec![0u8; self.max_size];
        let (len, peer) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        buf.truncate(len);
        let message = serde_cbor::from_slice(&buf)
            .map_err(|e| HandshakeError::Protocol(format!("decode from {}: {}", peer, e)))?;
        Ok(Some(Inbound {
            message,
            raw: buf,
            peer,
        }))
    }

    /// Waits until a datagram decodes or `deadline` passes.
    ///
    /// Undecodable datagrams are skipped; they may be stray traffic.
    pub fn recv_until(&self, deadline: Instant, what: &'static str) -> Result<Inbound, HandshakeError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HandshakeError::Timeout(what));
            }
            self.socket.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
            match self.recv() {
                Ok(Some(inbound)) => return Ok(inbound),
                Ok(None) => continue,
                Err(HandshakeError::Protocol(reason)) => {
                    tracing::debug!(%reason, "skipping undecodable handshake datagram");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HelloVerifyRequest;

    #[test]
    fn round_trip_over_loopback() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let msg = HandshakeMessage::HelloVerifyRequest(HelloVerifyRequest { cookie: vec![7; 32] });
        let sent = CborUdpTransport::new(&a)
            .send_to(&msg, b.local_addr().unwrap())
            .unwrap();
        let inbound = CborUdpTransport::new(&b)
            .recv_until(Instant::now() + Duration::from_secs(2), "test message")
            .unwrap();
        assert_eq!(inbound.message, msg);
        assert_eq!(inbound.raw, sent);
        assert_eq!(inbound.peer, a.local_addr().unwrap());
    }

    #[test]
    fn recv_until_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = CborUdpTransport::new(&socket)
            .recv_until(Instant::now() + Duration::from_millis(50), "nothing")
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout("nothing")));
    }

    #[test]
    fn dual_stack_bind_accepts_ipv4_peers() {
        let server = match bind_datagram("[::]:0".parse().unwrap()) {
            Ok(socket) => socket,
            // Hosts without IPv6 cannot run this check.
            Err(_) => return,
        };
        let port = server.local_addr().unwrap().port();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", ("127.0.0.1", port)).unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 8];
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
