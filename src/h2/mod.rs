//! Client-side HTTP/2 protocol engine
//!
//! The backend session drives this engine the way it would drive an
//! external codec library: bytes in through `mem_recv`, bytes out through
//! `mem_send`, and per-frame hooks dispatched to the session in between.
//! The engine owns framing, HPACK, SETTINGS bookkeeping, and flow control;
//! everything request-level (stream records, upstream notification, error
//! classification) stays with the session.

pub mod codec;
pub mod engine;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod settings;
pub mod stream;

pub use engine::{
    BodyChunk, BodySource, Engine, EngineHooks, FrameEvent, HeadersCategory, Submissions,
};
pub use error::{EngineError, ErrorCode};
pub use frames::{FrameFlags, FrameHeader, FrameType};
pub use settings::Settings;
pub use stream::StreamId;

/// HTTP/2 client connection preface (RFC 7540 Section 3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial flow-control window (RFC 7540 Section 6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame payload size (RFC 7540 Section 4.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Stream ID 0: the connection itself.
pub const CONNECTION_STREAM_ID: u32 = 0;
