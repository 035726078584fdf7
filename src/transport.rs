//! Non-blocking transport abstraction
//!
//! The session performs all I/O through `Transport`, so the same read and
//! write paths run over a plain TCP stream, a TLS stream, or the in-memory
//! mock the test harness uses. Operations never block: they move what they
//! can and report `WouldBlock`, leaving the embedding event loop to re-arm
//! interest.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

/// Outcome of one read or write pass over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketResult {
    /// Progress was made and more may be possible.
    Continue,
    /// The transport cannot move more bytes right now.
    WouldBlock,
    /// The peer closed the stream.
    Closed,
    Error,
}

/// A connected (or connecting) byte stream.
pub trait Transport: Read + Write {
    /// After a writable event on a connecting socket: did the connect
    /// succeed?
    fn check_connected(&mut self) -> io::Result<()>;

    /// Half-close towards the peer; best effort.
    fn shutdown(&mut self);
}

/// Reads into `buf`, classifying the result the way the session's I/O
/// engine wants it.
pub fn read_step(t: &mut dyn Transport, buf: &mut [u8]) -> (usize, SocketResult) {
    if buf.is_empty() {
        return (0, SocketResult::WouldBlock);
    }
    match t.read(buf) {
        Ok(0) => (0, SocketResult::Closed),
        Ok(n) => (n, SocketResult::Continue),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => (0, SocketResult::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => (0, SocketResult::Continue),
        Err(_) => (0, SocketResult::Error),
    }
}

pub fn write_step(t: &mut dyn Transport, buf: &[u8]) -> (usize, SocketResult) {
    match t.write(buf) {
        Ok(0) => (0, SocketResult::Closed),
        Ok(n) => (n, SocketResult::Continue),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => (0, SocketResult::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => (0, SocketResult::Continue),
        Err(_) => (0, SocketResult::Error),
    }
}

/// A non-blocking TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &SocketAddr) -> io::Result<Self> {
        // A true async connect would use a raw socket with connect(2)
        // returning EINPROGRESS; TcpStream::connect followed by
        // set_nonblocking keeps the std surface and the session still
        // treats the socket as connecting until the writable event.
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn check_connected(&mut self) -> io::Result<()> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }
}

/// Opens transports for the session. Swapped for a scripted fake in tests.
pub trait Connector {
    fn connect(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Transport>>;
}

#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(addr)?))
    }
}
