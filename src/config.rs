//! Session configuration
//!
//! Everything the backend session needs to know about its target: the
//! backend endpoint, the optional forward proxy, TLS behavior, timeouts,
//! and the initial HTTP/2 settings it advertises.

use std::net::SocketAddr;
use std::time::Duration;

/// Forward HTTP proxy used to reach the backend via a CONNECT tunnel.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy hostname, for logging only; the session connects to `addr`.
    pub host: String,
    /// Resolved proxy address.
    pub addr: SocketAddr,
    /// `user:password` for `Proxy-Authorization: Basic`, if required.
    pub userinfo: Option<String>,
}

/// The backend endpoint this session multiplexes onto.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Resolved backend address.
    pub addr: SocketAddr,
    /// Backend hostname; SNI source and `Host:` header of the CONNECT
    /// request.
    pub host: String,
    /// `host:port` as it appears on the CONNECT request line.
    pub hostport: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub proxy: Option<ProxyConfig>,

    /// Overrides `backend.host` as the SNI name.
    pub tls_sni_name: Option<String>,
    /// Talk clear text to the backend.
    pub no_tls: bool,
    /// Skip certificate verification.
    pub insecure: bool,

    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How long to wait for the peer to ACK our SETTINGS.
    pub settings_timeout: Duration,
    /// Idle interval after which the connection must prove liveness with a
    /// PING before new requests are submitted.
    pub connection_check_interval: Duration,

    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised to the backend.
    pub max_concurrent_streams: u32,
    /// Stream-level initial window is `(1 << window_bits) - 1`.
    pub window_bits: u8,
    /// Connection-level window exponent; above 16 the session sends a
    /// WINDOW_UPDATE for the delta over the protocol default.
    pub connection_window_bits: u8,

    /// Frame padding target in bytes; zero disables the padding callback.
    pub padding: usize,

    /// Upper bound on the cumulative size of one response's header block.
    pub max_response_header_sum: usize,
}

impl Config {
    /// Configuration for a clear-text backend, no proxy, with the defaults
    /// the daemon ships.
    pub fn for_backend(addr: SocketAddr, host: impl Into<String>) -> Self {
        let host = host.into();
        let hostport = format!("{}:{}", host, addr.port());
        Config {
            backend: BackendConfig {
                addr,
                host,
                hostport,
            },
            proxy: None,
            tls_sni_name: None,
            no_tls: true,
            insecure: false,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            settings_timeout: Duration::from_secs(10),
            connection_check_interval: Duration::from_secs(5),
            max_concurrent_streams: 100,
            window_bits: 16,
            connection_window_bits: 16,
            padding: 0,
            max_response_header_sum: 32 * 1024,
        }
    }

    /// The SNI name to present, unless it is a bare address literal.
    pub fn sni_name(&self) -> Option<&str> {
        let name = self
            .tls_sni_name
            .as_deref()
            .unwrap_or(&self.backend.host);
        if name.is_empty() || name.parse::<std::net::IpAddr>().is_ok() {
            None
        } else {
            Some(name)
        }
    }

    /// Stream-level initial window advertised in SETTINGS.
    pub fn initial_window_size(&self) -> u32 {
        (1u32 << self.window_bits) - 1
    }

    /// Connection window the session wants; `None` when the protocol
    /// default (65535) already covers it.
    pub fn connection_window_delta(&self) -> Option<u32> {
        if self.connection_window_bits > 16 {
            let want = (1u32 << self.connection_window_bits) - 1;
            Some(want - crate::h2::DEFAULT_INITIAL_WINDOW_SIZE)
        } else {
            None
        }
    }
}
