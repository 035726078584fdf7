//! The callback-driven HTTP/2 client engine
//!
//! `Engine` is the protocol half of the backend session: bytes from the
//! transport go in through `mem_recv`, wire chunks come out of `mem_send`,
//! and everything in between is reported to the session through
//! `EngineHooks`. Hook implementations act on the engine through a
//! `Submissions` queue that is applied once the dispatch returns, so a
//! callback can reset a stream or return flow-control credit without
//! aliasing the engine it was called from.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};

use super::codec::FrameCodec;
use super::error::{EngineError, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::*;
use super::settings::Settings;
use super::stream::{StreamId, StreamTable};
use super::{CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};

/// How the engine classified a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersCategory {
    /// Locally submitted request headers.
    Request,
    /// First header block received on a stream.
    Response,
    /// Later blocks: a final response after 1xx, or trailers.
    Headers,
}

/// A frame the engine received or is handing to the transport.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Data {
        stream_id: StreamId,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        category: HeadersCategory,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
    },
    Ping {
        ack: bool,
    },
    Goaway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
}

/// Verdict of a per-header callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    Accept,
    /// Abort this header block; remaining headers are dropped and no
    /// frame-received hook fires for it.
    Veto,
}

/// Engine actions queued from inside a hook and applied after dispatch.
#[derive(Debug, Default)]
pub struct Submissions {
    rst: Vec<(StreamId, ErrorCode)>,
    consume: Vec<(StreamId, usize)>,
}

impl Submissions {
    pub fn new() -> Self {
        Submissions::default()
    }

    /// Queue RST_STREAM for `stream_id`.
    pub fn rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.rst.push((stream_id, error_code));
    }

    /// Return `len` bytes of flow-control credit for `stream_id`.
    pub fn consume(&mut self, stream_id: StreamId, len: usize) {
        self.consume.push((stream_id, len));
    }
}

/// Per-frame callbacks the session registers with the engine.
pub trait EngineHooks {
    fn on_begin_headers(
        &mut self,
        _stream_id: StreamId,
        _category: HeadersCategory,
        _subs: &mut Submissions,
    ) {
    }

    fn on_header(
        &mut self,
        _stream_id: StreamId,
        _category: HeadersCategory,
        _name: &[u8],
        _value: &[u8],
        _subs: &mut Submissions,
    ) -> HeaderOutcome {
        HeaderOutcome::Accept
    }

    fn on_frame_recv(&mut self, _event: &FrameEvent, _subs: &mut Submissions) {}

    fn on_data_chunk_recv(&mut self, _stream_id: StreamId, _data: &[u8], _subs: &mut Submissions) {}

    fn on_stream_close(
        &mut self,
        _stream_id: StreamId,
        _error_code: ErrorCode,
        _subs: &mut Submissions,
    ) {
    }

    fn on_frame_send(&mut self, _event: &FrameEvent, _subs: &mut Submissions) {}

    fn on_frame_not_send(&mut self, _event: &FrameEvent, _subs: &mut Submissions) {}

    /// Padded payload length for an outgoing DATA frame; only consulted
    /// when the engine was built with padding enabled.
    fn select_padding(&mut self, payload_len: usize, _max_payload_len: usize) -> usize {
        payload_len
    }
}

/// One pull from a request body source.
#[derive(Debug)]
pub enum BodyChunk {
    /// Data (possibly empty) and whether the request body ends here.
    Chunk { data: Bytes, end_stream: bool },
    /// Nothing available now; the stream sleeps until `resume_data`.
    Deferred,
}

/// Pull interface for request bodies.
pub trait BodySource {
    fn pull(&mut self, max_len: usize) -> BodyChunk;
}

struct OutFrame {
    event: FrameEvent,
    bytes: Bytes,
}

struct PendingHeaders {
    stream_id: StreamId,
    end_stream: bool,
    /// Set for PUSH_PROMISE blocks; their headers are decoded and dropped.
    promised: Option<StreamId>,
    block: BytesMut,
}

/// Client-side HTTP/2 protocol engine.
pub struct Engine {
    recv_buf: BytesMut,
    pending_headers: Option<PendingHeaders>,

    hpack_encoder: HpackEncoder<'static>,
    hpack_decoder: HpackDecoder<'static>,

    streams: StreamTable,
    bodies: HashMap<StreamId, Box<dyn BodySource>>,

    conn_send_window: FlowControlWindow,
    conn_recv_window: FlowControlWindow,
    /// Connection-window consume accumulator for WINDOW_UPDATE batching.
    conn_consumed: usize,
    stream_consumed: HashMap<StreamId, usize>,
    /// Local connection window target, grown by submit_window_update.
    local_conn_window: u32,

    local_settings: Settings,
    remote_settings: Settings,

    outq: VecDeque<OutFrame>,
    sent_goaway: Option<ErrorCode>,
    recv_goaway: Option<(StreamId, ErrorCode)>,
    /// Highest promised stream id seen, for GOAWAY's last-stream-id.
    max_promised_id: StreamId,

    padding_enabled: bool,
}

impl Engine {
    pub fn new_client(local_settings: Settings, padding_enabled: bool) -> Self {
        Engine {
            recv_buf: BytesMut::with_capacity(16 * 1024),
            pending_headers: None,
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::new(),
            streams: StreamTable::new(),
            bodies: HashMap::new(),
            conn_send_window: FlowControlWindow::new(),
            conn_recv_window: FlowControlWindow::new(),
            conn_consumed: 0,
            stream_consumed: HashMap::new(),
            local_conn_window: DEFAULT_INITIAL_WINDOW_SIZE,
            local_settings,
            remote_settings: Settings::protocol_defaults(),
            outq: VecDeque::new(),
            sent_goaway: None,
            recv_goaway: None,
            max_promised_id: 0,
            padding_enabled,
        }
    }

    // ---- submit surface ------------------------------------------------

    /// Opens a new request stream. `user_data` is the opaque key handed
    /// back by every callback touching this stream.
    pub fn submit_request(
        &mut self,
        headers: &[(Vec<u8>, Vec<u8>)],
        body: Option<Box<dyn BodySource>>,
        user_data: u64,
    ) -> Result<StreamId> {
        if self.sent_goaway.is_some() || self.recv_goaway.is_some() {
            return Err(EngineError::Closing);
        }

        let stream_id = self.streams.open_local(
            self.remote_settings.get_initial_window_size(),
            self.local_settings.get_initial_window_size(),
            user_data,
            self.remote_settings.max_concurrent_streams,
        )?;

        let mut block = Vec::new();
        let refs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.as_slice(), v.as_slice()))
            .collect();
        self.hpack_encoder
            .encode_into(refs, &mut block)
            .map_err(|e| EngineError::Compression(e.to_string()))?;

        let end_stream = body.is_none();
        if let Some(source) = body {
            self.bodies.insert(stream_id, source);
        }
        if end_stream {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.send_closed = true;
            }
        }

        let frame = HeadersFrame::new(stream_id, Bytes::from(block), end_stream, true);
        self.outq.push_back(OutFrame {
            event: FrameEvent::Headers {
                stream_id,
                category: HeadersCategory::Request,
                end_stream,
            },
            bytes: FrameCodec::encode_headers_frame(&frame),
        });

        Ok(stream_id)
    }

    pub fn submit_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.queue_rst(stream_id, error_code);
    }

    pub fn submit_settings(&mut self, settings: Settings) -> Result<()> {
        settings.validate().map_err(EngineError::Protocol)?;
        if let Some(new_size) = settings.initial_window_size {
            // Local initial window applies to our receive side.
            let ids = self.streams.ids();
            for id in ids {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.recv_window.update_initial_size(new_size)?;
                }
            }
        }
        self.local_settings.merge(&settings);
        self.outq.push_back(OutFrame {
            event: FrameEvent::Settings { ack: false },
            bytes: FrameCodec::encode_settings_frame(&settings, false),
        });
        Ok(())
    }

    pub fn submit_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<()> {
        if stream_id == CONNECTION_STREAM_ID {
            self.conn_recv_window.increase(increment)?;
            self.local_conn_window = self.local_conn_window.saturating_add(increment);
        } else if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.recv_window.increase(increment)?;
        }
        self.outq.push_back(OutFrame {
            event: FrameEvent::WindowUpdate {
                stream_id,
                increment,
            },
            bytes: FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
                stream_id,
                size_increment: increment,
            }),
        });
        Ok(())
    }

    pub fn submit_ping(&mut self) {
        self.outq.push_back(OutFrame {
            event: FrameEvent::Ping { ack: false },
            bytes: FrameCodec::encode_ping_frame(&PingFrame::new([0; 8])),
        });
    }

    /// Queues GOAWAY and refuses further stream submission.
    pub fn terminate(&mut self, error_code: ErrorCode) {
        if self.sent_goaway.is_some() {
            return;
        }
        self.sent_goaway = Some(error_code);
        self.outq.push_back(OutFrame {
            event: FrameEvent::Goaway {
                last_stream_id: self.max_promised_id,
                error_code,
            },
            bytes: FrameCodec::encode_goaway_frame(&GoawayFrame {
                last_stream_id: self.max_promised_id,
                error_code,
                debug_data: Bytes::new(),
            }),
        });
    }

    /// Returns flow-control credit for received DATA. Safe on unknown
    /// streams; the connection-level credit is returned regardless.
    pub fn consume(&mut self, stream_id: StreamId, len: usize) {
        self.apply_consume(stream_id, len);
    }

    /// Wakes a deferred request body. Unknown streams are success, so a
    /// caller resuming an already-finished stream is a no-op.
    pub fn resume_data(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.deferred = false;
        }
    }

    pub fn stream_user_data(&self, stream_id: StreamId) -> Option<u64> {
        self.streams.get(stream_id).map(|s| s.user_data())
    }

    pub fn open_stream_ids(&self) -> Vec<StreamId> {
        self.streams.ids()
    }

    pub fn want_read(&self) -> bool {
        let closing = self.sent_goaway.is_some() || self.recv_goaway.is_some();
        !(closing && self.streams.is_empty() && self.outq.is_empty())
    }

    pub fn want_write(&self) -> bool {
        if !self.outq.is_empty() {
            return true;
        }
        self.bodies.keys().any(|id| {
            self.streams
                .get(*id)
                .map(|s| !s.send_closed && !s.deferred && !s.rst_queued)
                .unwrap_or(false)
        })
    }

    // ---- receive path --------------------------------------------------

    /// Feeds transport bytes through the frame decoder, dispatching hooks
    /// for everything that completes. Always consumes all of `data`.
    pub fn mem_recv<H: EngineHooks>(&mut self, data: &[u8], hooks: &mut H) -> Result<usize> {
        self.recv_buf.extend_from_slice(data);
        loop {
            let max = self.local_settings.get_max_frame_size();
            match FrameCodec::decode_next(&mut self.recv_buf, max)? {
                None => break,
                Some((header, payload)) => self.dispatch_frame(header, payload, hooks)?,
            }
        }
        Ok(data.len())
    }

    fn dispatch_frame<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if self.pending_headers.is_some()
            && header.frame_type != Some(FrameType::Continuation)
        {
            return Err(EngineError::Protocol(
                "expected CONTINUATION frame".to_string(),
            ));
        }

        match header.frame_type {
            Some(FrameType::Data) => self.recv_data(header, payload, hooks),
            Some(FrameType::Headers) => self.recv_headers(header, payload, hooks),
            Some(FrameType::Continuation) => self.recv_continuation(header, payload, hooks),
            Some(FrameType::RstStream) => self.recv_rst_stream(header, payload, hooks),
            Some(FrameType::Settings) => self.recv_settings(header, payload, hooks),
            Some(FrameType::PushPromise) => self.recv_push_promise(header, payload, hooks),
            Some(FrameType::Ping) => self.recv_ping(header, payload, hooks),
            Some(FrameType::Goaway) => self.recv_goaway_frame(header, payload, hooks),
            Some(FrameType::WindowUpdate) => self.recv_window_update(header, payload, hooks),
            // PRIORITY and unknown frame types are ignored.
            Some(FrameType::Priority) | None => Ok(()),
        }
    }

    fn recv_data<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        let stream_id = header.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            return Err(EngineError::Protocol("DATA on stream 0".to_string()));
        }
        let whole_len = header.length;
        let data = if header.flags.is_padded() {
            FrameCodec::strip_padding(payload)?
        } else {
            payload
        };
        let end_stream = header.flags.is_end_stream();

        self.conn_recv_window.decrease(whole_len)?;

        if !self.streams.contains(stream_id) {
            // A stream we already tore down; return the connection credit
            // so the peer's window does not leak away.
            self.apply_consume(stream_id, whole_len);
            return Ok(());
        }
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.recv_window.decrease(whole_len)?;
        }

        if !data.is_empty() {
            let mut subs = Submissions::new();
            hooks.on_data_chunk_recv(stream_id, &data, &mut subs);
            self.apply_submissions(subs);
        }

        let mut subs = Submissions::new();
        hooks.on_frame_recv(
            &FrameEvent::Data {
                stream_id,
                end_stream,
            },
            &mut subs,
        );
        self.apply_submissions(subs);

        if end_stream {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.recv_closed = true;
            }
            self.close_if_done(stream_id, ErrorCode::NoError, hooks);
        }
        Ok(())
    }

    fn recv_headers<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        let mut block = if header.flags.is_padded() {
            FrameCodec::strip_padding(payload)?
        } else {
            payload
        };
        if header.flags.is_priority() {
            if block.len() < 5 {
                return Err(EngineError::FrameSize(
                    "HEADERS priority field truncated".to_string(),
                ));
            }
            block = block.slice(5..);
        }

        let pending = PendingHeaders {
            stream_id: header.stream_id,
            end_stream: header.flags.is_end_stream(),
            promised: None,
            block: BytesMut::from(&block[..]),
        };
        if header.flags.is_end_headers() {
            self.finish_header_block(pending, hooks)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn recv_continuation<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        let mut pending = self.pending_headers.take().ok_or_else(|| {
            EngineError::Protocol("CONTINUATION without open header block".to_string())
        })?;
        if pending.stream_id != header.stream_id {
            return Err(EngineError::Protocol(
                "CONTINUATION on wrong stream".to_string(),
            ));
        }
        pending.block.extend_from_slice(&payload);
        if header.flags.is_end_headers() {
            self.finish_header_block(pending, hooks)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn finish_header_block<H: EngineHooks>(
        &mut self,
        pending: PendingHeaders,
        hooks: &mut H,
    ) -> Result<()> {
        // The block must run through HPACK even if nobody wants it, or
        // the shared dynamic table desynchronizes.
        let headers = self
            .hpack_decoder
            .decode(&pending.block)
            .map_err(|e| EngineError::Compression(format!("{:?}", e)))?;

        if let Some(promised_stream_id) = pending.promised {
            // The promised request's headers were decoded and dropped;
            // surface the promise itself so the session can refuse it.
            let mut subs = Submissions::new();
            hooks.on_frame_recv(
                &FrameEvent::PushPromise {
                    stream_id: pending.stream_id,
                    promised_stream_id,
                },
                &mut subs,
            );
            self.apply_submissions(subs);
            return Ok(());
        }
        if !self.streams.contains(pending.stream_id) {
            return Ok(());
        }
        let stream_id = pending.stream_id;

        let category = {
            let stream = self.streams.get_mut(stream_id).expect("checked above");
            if stream.response_headers_seen {
                HeadersCategory::Headers
            } else {
                stream.response_headers_seen = true;
                HeadersCategory::Response
            }
        };

        let mut subs = Submissions::new();
        hooks.on_begin_headers(stream_id, category, &mut subs);
        self.apply_submissions(subs);

        let mut vetoed = false;
        let mut subs = Submissions::new();
        for (name, value) in &headers {
            match hooks.on_header(stream_id, category, name, value, &mut subs) {
                HeaderOutcome::Accept => {}
                HeaderOutcome::Veto => {
                    vetoed = true;
                    break;
                }
            }
        }
        self.apply_submissions(subs);
        if vetoed {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.header_veto = true;
            }
        } else {
            let mut subs = Submissions::new();
            hooks.on_frame_recv(
                &FrameEvent::Headers {
                    stream_id,
                    category,
                    end_stream: pending.end_stream,
                },
                &mut subs,
            );
            self.apply_submissions(subs);
        }

        if pending.end_stream {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.recv_closed = true;
            }
            self.close_if_done(stream_id, ErrorCode::NoError, hooks);
        }
        Ok(())
    }

    fn recv_rst_stream<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if payload.len() != 4 {
            return Err(EngineError::FrameSize(
                "RST_STREAM payload must be 4 bytes".to_string(),
            ));
        }
        let code = ErrorCode::from_u32(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        let stream_id = header.stream_id;

        if self.streams.contains(stream_id) {
            let mut subs = Submissions::new();
            hooks.on_frame_recv(
                &FrameEvent::RstStream {
                    stream_id,
                    error_code: code,
                },
                &mut subs,
            );
            self.apply_submissions(subs);
            self.close_stream(stream_id, code, hooks);
        }
        Ok(())
    }

    fn recv_settings<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if header.stream_id != CONNECTION_STREAM_ID {
            return Err(EngineError::Protocol(
                "SETTINGS on non-zero stream".to_string(),
            ));
        }
        if header.flags.is_ack() {
            if !payload.is_empty() {
                return Err(EngineError::FrameSize(
                    "SETTINGS ACK with payload".to_string(),
                ));
            }
            let mut subs = Submissions::new();
            hooks.on_frame_recv(&FrameEvent::Settings { ack: true }, &mut subs);
            self.apply_submissions(subs);
            return Ok(());
        }

        let settings = FrameCodec::decode_settings_payload(&payload)?;
        if let Some(new_size) = settings.initial_window_size {
            self.streams.update_send_initial_size(new_size)?;
        }
        self.remote_settings.merge(&settings);

        self.outq.push_back(OutFrame {
            event: FrameEvent::Settings { ack: true },
            bytes: FrameCodec::encode_settings_frame(&Settings::new(), true),
        });

        let mut subs = Submissions::new();
        hooks.on_frame_recv(&FrameEvent::Settings { ack: false }, &mut subs);
        self.apply_submissions(subs);
        Ok(())
    }

    fn recv_push_promise<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        let block = if header.flags.is_padded() {
            FrameCodec::strip_padding(payload)?
        } else {
            payload
        };
        if block.len() < 4 {
            return Err(EngineError::FrameSize(
                "PUSH_PROMISE payload truncated".to_string(),
            ));
        }
        let promised_stream_id =
            u32::from_be_bytes([block[0], block[1], block[2], block[3]]) & 0x7FFF_FFFF;
        let fragment = block.slice(4..);
        self.max_promised_id = self.max_promised_id.max(promised_stream_id);

        let pending = PendingHeaders {
            stream_id: header.stream_id,
            end_stream: false,
            promised: Some(promised_stream_id),
            block: BytesMut::from(&fragment[..]),
        };
        if header.flags.is_end_headers() {
            self.finish_header_block(pending, hooks)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn recv_ping<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if payload.len() != 8 {
            return Err(EngineError::FrameSize(
                "PING payload must be 8 bytes".to_string(),
            ));
        }
        let ack = header.flags.is_ack();
        if !ack {
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            self.outq.push_back(OutFrame {
                event: FrameEvent::Ping { ack: true },
                bytes: FrameCodec::encode_ping_frame(&PingFrame::ack(data)),
            });
        }
        let mut subs = Submissions::new();
        hooks.on_frame_recv(&FrameEvent::Ping { ack }, &mut subs);
        self.apply_submissions(subs);
        Ok(())
    }

    fn recv_goaway_frame<H: EngineHooks>(
        &mut self,
        _header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if payload.len() < 8 {
            return Err(EngineError::FrameSize(
                "GOAWAY payload truncated".to_string(),
            ));
        }
        let last_stream_id =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        let error_code =
            ErrorCode::from_u32(u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]));
        self.recv_goaway = Some((last_stream_id, error_code));

        let mut subs = Submissions::new();
        hooks.on_frame_recv(
            &FrameEvent::Goaway {
                last_stream_id,
                error_code,
            },
            &mut subs,
        );
        self.apply_submissions(subs);
        Ok(())
    }

    fn recv_window_update<H: EngineHooks>(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        hooks: &mut H,
    ) -> Result<()> {
        if payload.len() != 4 {
            return Err(EngineError::FrameSize(
                "WINDOW_UPDATE payload must be 4 bytes".to_string(),
            ));
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        if header.stream_id == CONNECTION_STREAM_ID {
            self.conn_send_window.increase(increment)?;
        } else if let Some(stream) = self.streams.get_mut(header.stream_id) {
            stream.send_window.increase(increment)?;
        }

        let mut subs = Submissions::new();
        hooks.on_frame_recv(
            &FrameEvent::WindowUpdate {
                stream_id: header.stream_id,
                increment,
            },
            &mut subs,
        );
        self.apply_submissions(subs);
        Ok(())
    }

    // ---- send path -----------------------------------------------------

    /// Produces the next wire chunk, or `None` when the engine has nothing
    /// to send right now.
    pub fn mem_send<H: EngineHooks>(&mut self, hooks: &mut H) -> Option<Bytes> {
        while let Some(frame) = self.outq.pop_front() {
            if let FrameEvent::Headers {
                stream_id,
                category: HeadersCategory::Request,
                ..
            } = frame.event
            {
                let refused = self
                    .recv_goaway
                    .map(|(last, _)| stream_id > last)
                    .unwrap_or(false);
                if refused {
                    let mut subs = Submissions::new();
                    hooks.on_frame_not_send(&frame.event, &mut subs);
                    self.apply_submissions(subs);
                    self.close_stream(stream_id, ErrorCode::RefusedStream, hooks);
                    continue;
                }
            }

            let mut subs = Submissions::new();
            hooks.on_frame_send(&frame.event, &mut subs);
            self.apply_submissions(subs);

            if let FrameEvent::RstStream {
                stream_id,
                error_code,
            } = frame.event
            {
                self.close_stream(stream_id, error_code, hooks);
            }
            return Some(frame.bytes);
        }

        self.produce_data(hooks)
    }

    fn produce_data<H: EngineHooks>(&mut self, hooks: &mut H) -> Option<Bytes> {
        let max_frame = self.remote_settings.get_max_frame_size() as usize;
        for stream_id in self.streams.ids() {
            let (send_closed, deferred, rst_queued, stream_window) = {
                let stream = self.streams.get(stream_id)?;
                (
                    stream.send_closed,
                    stream.deferred,
                    stream.rst_queued,
                    stream.send_window.size(),
                )
            };
            if send_closed || deferred || rst_queued {
                continue;
            }
            if !self.bodies.contains_key(&stream_id) {
                continue;
            }
            let window = stream_window.min(self.conn_send_window.size());
            if window <= 0 {
                continue;
            }
            let max_len = (window as usize).min(max_frame);

            let chunk = self
                .bodies
                .get_mut(&stream_id)
                .map(|source| source.pull(max_len))?;

            match chunk {
                BodyChunk::Deferred => {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.deferred = true;
                    }
                }
                BodyChunk::Chunk { data, end_stream } => {
                    if data.is_empty() && !end_stream {
                        if let Some(stream) = self.streams.get_mut(stream_id) {
                            stream.deferred = true;
                        }
                        continue;
                    }

                    self.conn_send_window.consume(data.len());
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.send_window.consume(data.len());
                    }

                    let mut frame = DataFrame::new(stream_id, data, end_stream);
                    if self.padding_enabled {
                        let padded = hooks.select_padding(frame.data.len(), max_frame);
                        let pad = padded.saturating_sub(frame.data.len());
                        if pad > 0 && pad <= u8::MAX as usize {
                            frame = frame.with_padding(pad as u8);
                        }
                    }
                    let bytes = FrameCodec::encode_data_frame(&frame);

                    let mut subs = Submissions::new();
                    hooks.on_frame_send(
                        &FrameEvent::Data {
                            stream_id,
                            end_stream,
                        },
                        &mut subs,
                    );
                    self.apply_submissions(subs);

                    if end_stream {
                        self.bodies.remove(&stream_id);
                        if let Some(stream) = self.streams.get_mut(stream_id) {
                            stream.send_closed = true;
                        }
                        self.close_if_done(stream_id, ErrorCode::NoError, hooks);
                    }
                    return Some(bytes);
                }
            }
        }
        None
    }

    // ---- internals -----------------------------------------------------

    fn apply_submissions(&mut self, mut subs: Submissions) {
        for (stream_id, code) in subs.rst.drain(..) {
            self.queue_rst(stream_id, code);
        }
        for (stream_id, len) in subs.consume.drain(..) {
            self.apply_consume(stream_id, len);
        }
    }

    fn queue_rst(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.rst_queued {
                return;
            }
            stream.rst_queued = true;
        }
        self.outq.push_back(OutFrame {
            event: FrameEvent::RstStream {
                stream_id,
                error_code,
            },
            bytes: FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
                stream_id,
                error_code,
            }),
        });
    }

    fn apply_consume(&mut self, stream_id: StreamId, len: usize) {
        self.conn_consumed += len;
        if self.conn_consumed * 2 >= self.local_conn_window as usize {
            let increment = self.conn_consumed as u32;
            self.conn_consumed = 0;
            let _ = self.conn_recv_window.increase(increment);
            self.outq.push_back(OutFrame {
                event: FrameEvent::WindowUpdate {
                    stream_id: CONNECTION_STREAM_ID,
                    increment,
                },
                bytes: FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
                    stream_id: CONNECTION_STREAM_ID,
                    size_increment: increment,
                }),
            });
        }

        if !self.streams.contains(stream_id) {
            self.stream_consumed.remove(&stream_id);
            return;
        }
        let window = self.local_settings.get_initial_window_size() as usize;
        let acc = self.stream_consumed.entry(stream_id).or_insert(0);
        *acc += len;
        if *acc * 2 >= window {
            let increment = *acc as u32;
            *acc = 0;
            if let Some(stream) = self.streams.get_mut(stream_id) {
                let _ = stream.recv_window.increase(increment);
            }
            self.outq.push_back(OutFrame {
                event: FrameEvent::WindowUpdate {
                    stream_id,
                    increment,
                },
                bytes: FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
                    stream_id,
                    size_increment: increment,
                }),
            });
        }
    }

    fn close_if_done<H: EngineHooks>(
        &mut self,
        stream_id: StreamId,
        error_code: ErrorCode,
        hooks: &mut H,
    ) {
        let done = self
            .streams
            .get(stream_id)
            .map(|s| s.fully_closed())
            .unwrap_or(false);
        if done {
            self.close_stream(stream_id, error_code, hooks);
        }
    }

    fn close_stream<H: EngineHooks>(
        &mut self,
        stream_id: StreamId,
        error_code: ErrorCode,
        hooks: &mut H,
    ) {
        if self.streams.remove(stream_id).is_some() {
            self.bodies.remove(&stream_id);
            self.stream_consumed.remove(&stream_id);
            let mut subs = Submissions::new();
            hooks.on_stream_close(stream_id, error_code, &mut subs);
            self.apply_submissions(subs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHooks {
        frames: Vec<String>,
        headers: Vec<(StreamId, String, String)>,
        chunks: Vec<(StreamId, Vec<u8>)>,
        closed: Vec<(StreamId, ErrorCode)>,
        veto_header: Option<Vec<u8>>,
    }

    impl EngineHooks for RecordingHooks {
        fn on_header(
            &mut self,
            stream_id: StreamId,
            _category: HeadersCategory,
            name: &[u8],
            value: &[u8],
            subs: &mut Submissions,
        ) -> HeaderOutcome {
            if self.veto_header.as_deref() == Some(name) {
                subs.rst_stream(stream_id, ErrorCode::ProtocolError);
                return HeaderOutcome::Veto;
            }
            self.headers.push((
                stream_id,
                String::from_utf8_lossy(name).to_string(),
                String::from_utf8_lossy(value).to_string(),
            ));
            HeaderOutcome::Accept
        }

        fn on_frame_recv(&mut self, event: &FrameEvent, _subs: &mut Submissions) {
            self.frames.push(format!("recv:{:?}", event));
        }

        fn on_data_chunk_recv(
            &mut self,
            stream_id: StreamId,
            data: &[u8],
            subs: &mut Submissions,
        ) {
            self.chunks.push((stream_id, data.to_vec()));
            subs.consume(stream_id, data.len());
        }

        fn on_stream_close(
            &mut self,
            stream_id: StreamId,
            error_code: ErrorCode,
            _subs: &mut Submissions,
        ) {
            self.closed.push((stream_id, error_code));
        }

        fn on_frame_send(&mut self, event: &FrameEvent, _subs: &mut Submissions) {
            self.frames.push(format!("send:{:?}", event));
        }

        fn on_frame_not_send(&mut self, event: &FrameEvent, _subs: &mut Submissions) {
            self.frames.push(format!("notsend:{:?}", event));
        }
    }

    fn server_headers_frame(
        encoder: &mut HpackEncoder<'_>,
        stream_id: StreamId,
        headers: &[(&[u8], &[u8])],
        end_stream: bool,
    ) -> Bytes {
        let mut block = Vec::new();
        encoder
            .encode_into(headers.iter().copied(), &mut block)
            .unwrap();
        FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::from(block),
            end_stream,
            true,
        ))
    }

    fn drain_send(engine: &mut Engine, hooks: &mut RecordingHooks) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = engine.mem_send(hooks) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_request_response_roundtrip() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        let headers = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":scheme".to_vec(), b"http".to_vec()),
            (b":authority".to_vec(), b"backend".to_vec()),
            (b":path".to_vec(), b"/".to_vec()),
        ];
        let id = engine.submit_request(&headers, None, 7).unwrap();
        assert_eq!(id, 1);
        assert_eq!(engine.stream_user_data(id), Some(7));
        assert!(engine.want_write());

        let wire = drain_send(&mut engine, &mut hooks);
        assert!(!wire.is_empty());
        assert!(hooks.frames.iter().any(|f| f.starts_with("send:Headers")));

        // Server side: response headers + body.
        let mut server_encoder = HpackEncoder::new();
        let resp = server_headers_frame(
            &mut server_encoder,
            id,
            &[(b":status", b"200"), (b"content-length", b"5")],
            false,
        );
        engine.mem_recv(&resp, &mut hooks).unwrap();
        assert_eq!(hooks.headers.len(), 2);
        assert_eq!(hooks.headers[0].1, ":status");

        let data =
            FrameCodec::encode_data_frame(&DataFrame::new(id, Bytes::from("hello"), true));
        engine.mem_recv(&data, &mut hooks).unwrap();
        assert_eq!(hooks.chunks, vec![(id, b"hello".to_vec())]);
        assert_eq!(hooks.closed, vec![(id, ErrorCode::NoError)]);
        assert!(engine.stream_user_data(id).is_none());
    }

    #[test]
    fn test_settings_recv_is_acked() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        let settings = Settings {
            initial_window_size: Some(1_000_000),
            max_concurrent_streams: Some(10),
            ..Settings::new()
        };
        let frame = FrameCodec::encode_settings_frame(&settings, false);
        engine.mem_recv(&frame, &mut hooks).unwrap();

        let wire = drain_send(&mut engine, &mut hooks);
        // The queued ACK: empty SETTINGS with the ACK flag.
        assert_eq!(&wire[0..3], &[0, 0, 0]);
        assert_eq!(wire[3], FrameType::Settings.as_u8());
        assert_eq!(wire[4], FrameFlags::ACK);
    }

    #[test]
    fn test_ping_is_ponged() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([9; 8]));
        engine.mem_recv(&ping, &mut hooks).unwrap();

        let wire = drain_send(&mut engine, &mut hooks);
        assert_eq!(wire[3], FrameType::Ping.as_u8());
        assert_eq!(wire[4], FrameFlags::ACK);
        assert_eq!(&wire[9..17], &[9; 8]);
    }

    #[test]
    fn test_header_veto_resets_stream() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks {
            veto_header: Some(b"x-evil".to_vec()),
            ..Default::default()
        };

        let id = engine
            .submit_request(&[(b":method".to_vec(), b"GET".to_vec())], None, 0)
            .unwrap();
        drain_send(&mut engine, &mut hooks);

        let mut server_encoder = HpackEncoder::new();
        let resp = server_headers_frame(
            &mut server_encoder,
            id,
            &[(b":status", b"200"), (b"x-evil", b"1"), (b"a", b"b")],
            false,
        );
        engine.mem_recv(&resp, &mut hooks).unwrap();

        // Veto: no Headers frame event was dispatched, RST is queued.
        assert!(!hooks.frames.iter().any(|f| f.starts_with("recv:Headers")));
        let wire = drain_send(&mut engine, &mut hooks);
        assert_eq!(wire[3], FrameType::RstStream.as_u8());
        // Stream closes with the RST code once the frame is sent.
        assert_eq!(hooks.closed, vec![(id, ErrorCode::ProtocolError)]);
    }

    #[test]
    fn test_body_respects_stream_window() {
        struct StaticBody {
            data: Bytes,
        }
        impl BodySource for StaticBody {
            fn pull(&mut self, max_len: usize) -> BodyChunk {
                let n = self.data.len().min(max_len);
                let data = self.data.split_to(n);
                BodyChunk::Chunk {
                    data,
                    end_stream: self.data.is_empty(),
                }
            }
        }

        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        // Peer allows only 10 bytes per stream.
        let peer_settings = Settings {
            initial_window_size: Some(10),
            ..Settings::new()
        };
        let frame = FrameCodec::encode_settings_frame(&peer_settings, false);
        engine.mem_recv(&frame, &mut hooks).unwrap();

        let id = engine
            .submit_request(
                &[(b":method".to_vec(), b"POST".to_vec())],
                Some(Box::new(StaticBody {
                    data: Bytes::from(vec![0x61; 25]),
                })),
                0,
            )
            .unwrap();

        let wire = drain_send(&mut engine, &mut hooks);
        // HEADERS + ACK + one DATA frame capped at 10 bytes.
        let data_frames: Vec<String> = hooks
            .frames
            .iter()
            .filter(|f| f.starts_with("send:Data"))
            .cloned()
            .collect();
        assert_eq!(data_frames.len(), 1);
        assert!(!wire.is_empty());
        assert!(engine.want_write());

        // Window refill lets the rest flow.
        let wu = FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
            stream_id: id,
            size_increment: 100,
        });
        engine.mem_recv(&wu, &mut hooks).unwrap();
        drain_send(&mut engine, &mut hooks);
        let data_frames = hooks
            .frames
            .iter()
            .filter(|f| f.starts_with("send:Data"))
            .count();
        assert_eq!(data_frames, 2);
        assert!(!engine.want_write());
    }

    #[test]
    fn test_deferred_body_and_resume() {
        struct DeferredOnce {
            polled: bool,
        }
        impl BodySource for DeferredOnce {
            fn pull(&mut self, _max_len: usize) -> BodyChunk {
                if self.polled {
                    BodyChunk::Chunk {
                        data: Bytes::from("x"),
                        end_stream: true,
                    }
                } else {
                    self.polled = true;
                    BodyChunk::Deferred
                }
            }
        }

        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();
        let id = engine
            .submit_request(
                &[(b":method".to_vec(), b"POST".to_vec())],
                Some(Box::new(DeferredOnce { polled: false })),
                0,
            )
            .unwrap();

        drain_send(&mut engine, &mut hooks);
        assert!(!engine.want_write());

        engine.resume_data(id);
        assert!(engine.want_write());
        drain_send(&mut engine, &mut hooks);
        assert!(hooks.frames.iter().any(|f| f.starts_with("send:Data")));
    }

    #[test]
    fn test_goaway_refuses_unsent_request() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        let id = engine
            .submit_request(&[(b":method".to_vec(), b"GET".to_vec())], None, 0)
            .unwrap();

        // GOAWAY arrives before the HEADERS frame went out.
        let goaway = FrameCodec::encode_goaway_frame(&GoawayFrame {
            last_stream_id: 0,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        engine.mem_recv(&goaway, &mut hooks).unwrap();

        while engine.mem_send(&mut hooks).is_some() {}
        assert!(hooks.frames.iter().any(|f| f.starts_with("notsend:")));
        assert_eq!(hooks.closed, vec![(id, ErrorCode::RefusedStream)]);
        assert!(!engine.want_read());
    }

    #[test]
    fn test_terminate_queues_goaway_once() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        engine.terminate(ErrorCode::SettingsTimeout);
        engine.terminate(ErrorCode::NoError);

        let wire = drain_send(&mut engine, &mut hooks);
        assert_eq!(wire[3], FrameType::Goaway.as_u8());
        assert_eq!(
            u32::from_be_bytes([wire[13], wire[14], wire[15], wire[16]]),
            ErrorCode::SettingsTimeout.as_u32()
        );
        assert_eq!(wire.len(), 9 + 8);
        assert!(engine
            .submit_request(&[(b":method".to_vec(), b"GET".to_vec())], None, 0)
            .is_err());
    }

    #[test]
    fn test_consume_restores_connection_window() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        let id = engine
            .submit_request(&[(b":method".to_vec(), b"GET".to_vec())], None, 0)
            .unwrap();
        drain_send(&mut engine, &mut hooks);

        let mut server_encoder = HpackEncoder::new();
        let resp = server_headers_frame(&mut server_encoder, id, &[(b":status", b"200")], false);
        engine.mem_recv(&resp, &mut hooks).unwrap();

        // 40000 bytes of DATA; chunk hook consumes, crossing the half-
        // window threshold, so a WINDOW_UPDATE gets queued.
        let body = vec![0x62u8; 16384];
        for _ in 0..2 {
            let frame =
                FrameCodec::encode_data_frame(&DataFrame::new(id, Bytes::from(body.clone()), false));
            engine.mem_recv(&frame, &mut hooks).unwrap();
        }
        let wire = drain_send(&mut engine, &mut hooks);
        assert!(hooks
            .frames
            .iter()
            .any(|f| f.starts_with("send:WindowUpdate")));
        assert!(!wire.is_empty());
    }

    #[test]
    fn test_rst_on_unknown_stream_creates_no_stream() {
        let mut engine = Engine::new_client(Settings::new(), false);
        let mut hooks = RecordingHooks::default();

        engine.submit_rst_stream(4, ErrorCode::RefusedStream);
        assert!(engine.stream_user_data(4).is_none());

        let wire = drain_send(&mut engine, &mut hooks);
        assert_eq!(wire[3], FrameType::RstStream.as_u8());
        assert_eq!(&wire[5..9], &[0, 0, 0, 4]);
        // No stream existed, so nothing closed.
        assert!(hooks.closed.is_empty());
    }
}
