//! HTTP/2 frame encoding and incremental decoding
//!
//! Encoding builds complete wire frames into `Bytes`. Decoding is
//! incremental: the engine appends whatever the transport produced and
//! pulls out one `(header, payload)` pair at a time, leaving partial
//! frames buffered.

use super::error::{EngineError, Result};
use super::frames::*;
use super::settings::{Settings, SettingsParameter};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame encode/decode entry points.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit zero)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5] = ((stream_id >> 24) & 0xFF) as u8;
        header[6] = ((stream_id >> 16) & 0xFF) as u8;
        header[7] = ((stream_id >> 8) & 0xFF) as u8;
        header[8] = (stream_id & 0xFF) as u8;

        header
    }

    pub fn decode_header(bytes: &[u8]) -> FrameHeader {
        debug_assert!(bytes.len() >= FRAME_HEADER_SIZE);
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let frame_type = FrameType::from_u8(bytes[3]);
        let flags = FrameFlags::from_u8(bytes[4]);
        let stream_id = (((bytes[5] & 0x7F) as u32) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        }
    }

    /// Pulls the next complete frame out of `buf`, or returns `None` if
    /// more bytes are needed. Oversized frames are a connection error.
    pub fn decode_next(
        buf: &mut BytesMut,
        max_frame_size: u32,
    ) -> Result<Option<(FrameHeader, Bytes)>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = Self::decode_header(&buf[..FRAME_HEADER_SIZE]);
        if header.length > max_frame_size as usize {
            return Err(EngineError::FrameSize(format!(
                "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
                header.length, max_frame_size
            )));
        }
        if buf.len() < FRAME_HEADER_SIZE + header.length {
            return Ok(None);
        }
        let _ = buf.split_to(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length).freeze();
        Ok(Some((header, payload)))
    }

    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        let padding_len = if let Some(pad) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad as usize;
            pad
        } else {
            0
        };

        buf.put_slice(&Self::encode_header(
            FrameType::Data,
            flags,
            frame.stream_id,
            payload_len,
        ));
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.data);
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        let padding_len = if let Some(pad) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad as usize;
            pad
        } else {
            0
        };

        buf.put_slice(&Self::encode_header(
            FrameType::Headers,
            flags,
            frame.stream_id,
            payload_len,
        ));
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.header_block);
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    pub fn encode_settings_frame(settings: &Settings, ack: bool) -> Bytes {
        let mut buf = BytesMut::new();
        let flags = if ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut payload = BytesMut::new();
        if !ack {
            for (param, value) in settings.entries() {
                payload.put_u16(param.as_u16());
                payload.put_u32(value);
            }
        }

        buf.put_slice(&Self::encode_header(
            FrameType::Settings,
            flags,
            0,
            payload.len(),
        ));
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Parses the payload of a non-ACK SETTINGS frame. Unknown parameters
    /// are ignored per RFC 7540 Section 6.5.2.
    pub fn decode_settings_payload(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(EngineError::FrameSize(
                "SETTINGS payload not a multiple of 6".to_string(),
            ));
        }
        let mut settings = Settings::new();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => {
                    settings.header_table_size = Some(value)
                }
                Some(SettingsParameter::EnablePush) => settings.enable_push = Some(value != 0),
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => {}
            }
        }
        settings
            .validate()
            .map_err(EngineError::Protocol)?;
        Ok(settings)
    }

    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::new();
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();
        let payload_len = 8 + frame.debug_data.len();
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway,
            FrameFlags::empty(),
            0,
            payload_len,
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Strips the pad-length prefix and trailing padding from a PADDED
    /// DATA or HEADERS payload.
    pub fn strip_padding(payload: Bytes) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(EngineError::Protocol(
                "padded frame with empty payload".to_string(),
            ));
        }
        let pad_len = payload[0] as usize;
        let body_len = payload.len() - 1;
        if pad_len > body_len {
            return Err(EngineError::Protocol(
                "padding exceeds frame payload".to_string(),
            ));
        }
        Ok(payload.slice(1..1 + (body_len - pad_len)))
    }
}
