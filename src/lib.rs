//! h2relay - backend HTTP/2 session core for a reverse proxy
//!
//! This crate provides the downstream half of a reverse proxy: a long-lived
//! session object that owns one connection to a backend server (optionally
//! through an HTTP CONNECT tunnel, optionally TLS with ALPN), drives a
//! client-side HTTP/2 engine over it, and brokers frames between any number
//! of in-flight requests and the upstream handlers that own them.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod h2;
pub mod http1;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use session::{BackendSession, DownstreamConnection, UpstreamHandler};
