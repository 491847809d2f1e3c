//! Byte transport seam between the broker core and the socket layer.
//!
//! The core never owns a poller; it drives a [`Transport`] with
//! non-blocking calls and records the interest mask it wants via
//! [`Transport::set_event_mask`]. `WouldBlock` from the transport is a
//! control signal, not an error.

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

bitflags::bitflags! {
    /// Poll-interest / readiness mask for a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// A non-blocking byte stream attached to one connection.
pub trait Transport: Send {
    /// Read available bytes into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream. `WouldBlock` means no
    /// bytes are available right now.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes from `buf`, returning how many were accepted.
    ///
    /// `flush` is set when these are the final bytes of the final queued
    /// packet; implementations buffering internally should push to the
    /// wire at that boundary.
    fn send(&mut self, buf: &[u8], flush: bool) -> io::Result<usize>;

    /// Replace the poll-interest mask for this connection.
    fn set_event_mask(&mut self, events: Events) -> io::Result<()>;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// [`Transport`] over a mio TCP stream.
///
/// Interest changes reregister the stream with the poll registry the
/// driver created it under.
pub struct TcpTransport {
    stream: TcpStream,
    registry: Registry,
    token: Token,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap an accepted stream already registered under `token`.
    pub fn new(stream: TcpStream, registry: Registry, token: Token) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            registry,
            token,
            peer,
        }
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8], flush: bool) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        if flush && n == buf.len() {
            self.stream.flush()?;
        }
        Ok(n)
    }

    fn set_event_mask(&mut self, events: Events) -> io::Result<()> {
        let mut interest = None;
        if events.contains(Events::READABLE) {
            interest = Some(Interest::READABLE);
        }
        if events.contains(Events::WRITABLE) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        match interest {
            Some(i) => self.registry.reregister(&mut self.stream, self.token, i),
            // mio has no empty interest; deregister instead.
            None => self.registry.deregister(&mut self.stream),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_mock_recv_respects_buffer_len() {
        let (mut transport, handle) = MockTransport::pair();
        handle.push_recv(b"abcdef");

        let mut buf = [0u8; 4];
        assert_eq!(transport.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(transport.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(
            transport.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_mock_send_budget() {
        let (mut transport, handle) = MockTransport::pair();
        handle.set_send_budget(Some(3));

        assert_eq!(transport.send(b"hello", true).unwrap(), 3);
        assert_eq!(
            transport.send(b"lo", true).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(handle.sent(), b"hel");
    }

    #[test]
    fn test_mock_counts_flush_hints() {
        let (mut transport, handle) = MockTransport::pair();
        transport.send(b"a", false).unwrap();
        transport.send(b"b", true).unwrap();
        assert_eq!(handle.flushes(), 1);
    }

    #[test]
    fn test_mock_peer_close_after_drain() {
        let (mut transport, handle) = MockTransport::pair();
        handle.push_recv(b"x");
        handle.close_peer();

        let mut buf = [0u8; 8];
        assert_eq!(transport.recv(&mut buf).unwrap(), 1);
        assert_eq!(transport.recv(&mut buf).unwrap(), 0);
    }
}
