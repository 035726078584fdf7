//! TLS for the backend connection
//!
//! The session optionally wraps its transport in TLS. The handshake is
//! driven step by step from the event loop: each step either completes,
//! wants the socket readable, or wants it writable, and the session arms
//! watchers and timers accordingly. ALPN must land on `h2` or the connect
//! attempt fails.

use std::io::{self, Read, Write};

use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::X509VerifyResult;
use thiserror::Error;

use crate::transport::Transport;

pub const ALPN_H2: &[u8] = b"h2";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<Vec<u8>>),

    #[error("certificate verification failed: {0}")]
    CertificateVerify(String),
}

/// One step of a non-blocking handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    WantRead,
    WantWrite,
}

/// Client-side TLS context shared by every connection attempt of a
/// session. ALPN always offers exactly `h2`.
pub struct TlsContext {
    ctx: SslContext,
}

impl TlsContext {
    pub fn new(insecure: bool) -> Result<Self, TlsError> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

        // Wire format: length-prefixed protocol list.
        let mut alpn = Vec::with_capacity(ALPN_H2.len() + 1);
        alpn.push(ALPN_H2.len() as u8);
        alpn.extend_from_slice(ALPN_H2);
        builder.set_alpn_protos(&alpn)?;

        if insecure {
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            builder.set_verify(SslVerifyMode::PEER);
            builder.set_default_verify_paths()?;
        }

        Ok(TlsContext {
            ctx: builder.build(),
        })
    }

    /// Binds a TLS client session to an established transport. The
    /// handshake has not run yet; drive it with `handshake_step`.
    pub fn start_connect(
        &self,
        sni_name: Option<&str>,
        transport: Box<dyn Transport>,
    ) -> Result<TlsTransport, TlsError> {
        let mut ssl = Ssl::new(&self.ctx)?;
        if let Some(name) = sni_name {
            ssl.set_hostname(name)?;
        }
        ssl.set_connect_state();
        let stream = SslStream::new(ssl, transport)
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
        Ok(TlsTransport {
            stream,
            handshake_done: false,
        })
    }
}

/// A TLS-wrapped transport.
pub struct TlsTransport {
    stream: SslStream<Box<dyn Transport>>,
    handshake_done: bool,
}

impl TlsTransport {
    pub fn handshake_step(&mut self) -> Result<HandshakeStatus, TlsError> {
        if self.handshake_done {
            return Ok(HandshakeStatus::Done);
        }
        match self.stream.do_handshake() {
            Ok(()) => {
                self.handshake_done = true;
                Ok(HandshakeStatus::Done)
            }
            Err(e) => match e.code() {
                openssl::ssl::ErrorCode::WANT_READ => Ok(HandshakeStatus::WantRead),
                openssl::ssl::ErrorCode::WANT_WRITE => Ok(HandshakeStatus::WantWrite),
                _ => Err(TlsError::HandshakeFailed(e.to_string())),
            },
        }
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn session_reused(&self) -> bool {
        self.stream.ssl().session_reused()
    }

    /// The ALPN outcome. The session requires `h2` exactly.
    pub fn negotiated_h2(&self) -> Result<(), TlsError> {
        match self.stream.ssl().selected_alpn_protocol() {
            Some(proto) if proto == ALPN_H2 => Ok(()),
            other => Err(TlsError::AlpnFailed(other.map(|p| p.to_vec()))),
        }
    }

    /// The peer certificate chain verification outcome.
    pub fn check_cert(&self) -> Result<(), TlsError> {
        let result = self.stream.ssl().verify_result();
        if result == X509VerifyResult::OK {
            Ok(())
        } else {
            Err(TlsError::CertificateVerify(
                result.error_string().to_string(),
            ))
        }
    }

    /// Whether the negotiated parameters satisfy the HTTP/2 TLS profile:
    /// TLS 1.2 with a forward-secret AEAD suite, or TLS 1.3.
    pub fn check_h2_requirement(&self) -> bool {
        let ssl = self.stream.ssl();
        match ssl.version_str() {
            "TLSv1.3" => true,
            "TLSv1.2" => ssl
                .current_cipher()
                .map(|c| {
                    let name = c.name();
                    (name.starts_with("ECDHE") || name.starts_with("DHE"))
                        && (name.contains("GCM") || name.contains("CHACHA"))
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Close-notify towards the peer; best effort, may be cut short by a
    /// non-blocking socket.
    pub fn send_shutdown(&mut self) {
        let _ = self.stream.shutdown();
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SslStream maps WANT_READ to WouldBlock. WANT_WRITE during a read
        // means renegotiation, which the session refuses.
        self.stream.read(buf)
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TlsTransport {
    fn check_connected(&mut self) -> io::Result<()> {
        self.stream.get_mut().check_connected()
    }

    fn shutdown(&mut self) {
        self.send_shutdown();
        self.stream.get_mut().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builds() {
        assert!(TlsContext::new(false).is_ok());
        assert!(TlsContext::new(true).is_ok());
    }

    #[test]
    fn test_alpn_wire_format() {
        let mut alpn = Vec::new();
        alpn.push(ALPN_H2.len() as u8);
        alpn.extend_from_slice(ALPN_H2);
        assert_eq!(alpn, b"\x02h2");
    }
}
