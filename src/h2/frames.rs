//! HTTP/2 frame types (RFC 7540 Section 6)

use super::error::ErrorCode;
use bytes::Bytes;
use std::fmt;

/// Frame header size on the wire (9 bytes).
pub const FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;
    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;
    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;
    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: usize,
    pub frame_type: Option<FrameType>,
    pub flags: FrameFlags,
    pub stream_id: u32,
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Padding length when the PADDED flag is set.
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 targets the connection window.
    pub stream_id: u32,
    pub size_increment: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Data.as_u8(), 0x0);
        assert_eq!(FrameType::Continuation.as_u8(), 0x9);

        assert_eq!(FrameType::from_u8(0x5), Some(FrameType::PushPromise));
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.is_end_stream());

        flags.set(FrameFlags::END_STREAM);
        flags.set(FrameFlags::END_HEADERS);
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
        assert!(!flags.is_padded());
    }

    #[test]
    fn test_ping_frame() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        assert!(!PingFrame::new(data).ack);
        assert!(PingFrame::ack(data).ack);
    }
}
