//! HTTP/2 error codes and engine errors

use std::fmt;

/// Errors the engine reports to the session. Any of these on the receive
/// path means the connection is no longer usable.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("frame size error: {0}")]
    FrameSize(String),

    #[error("flow control error: {0}")]
    FlowControl(String),

    #[error("header compression error: {0}")]
    Compression(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection is shutting down")]
    Closing,

    #[error("too many concurrent streams")]
    StreamLimit,

    #[error("unknown stream: {0}")]
    UnknownStream(u32),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// HTTP/2 error codes as defined in RFC 7540 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Unknown codes map to `InternalError`, per RFC 7540 Section 7.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}
