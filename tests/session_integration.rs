//! Backend session integration tests
//!
//! These drive a `BackendSession` against a scripted in-memory transport
//! and a virtual clock: connection establishment (direct, tunneled,
//! failed), the HTTP/2 engine bridge, liveness checking, timer behavior,
//! and teardown semantics.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hpack::Encoder as HpackEncoder;

use h2relay::clock::Clock;
use h2relay::config::{Config, ProxyConfig};
use h2relay::h2::codec::FrameCodec;
use h2relay::h2::frames::{
    DataFrame, FrameFlags, FrameType, HeadersFrame, RstStreamFrame, WindowUpdateFrame,
};
use h2relay::h2::{ErrorCode, Settings, CONNECTION_PREFACE};
use h2relay::session::{
    BackendSession, ConnCheckState, DownstreamConnection, MsgState, RequestHead, State,
    UpstreamHandler,
};
use h2relay::transport::{Connector, Transport};

// ---- mock transport -----------------------------------------------------

#[derive(Default)]
struct WireState {
    incoming: VecDeque<u8>,
    eof: bool,
    written: Vec<u8>,
    /// Remaining bytes the transport accepts; `None` is unlimited.
    write_budget: Option<usize>,
}

impl WireState {
    fn feed(&mut self, data: &[u8]) {
        self.incoming.extend(data.iter().copied());
    }
}

struct MockTransport {
    state: Rc<RefCell<WireState>>,
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.incoming.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.incoming.len());
        for b in buf.iter_mut().take(n) {
            *b = state.incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let n = match state.write_budget {
            Some(budget) => {
                if budget == 0 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                let n = buf.len().min(budget);
                state.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn check_connected(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

struct MockConnector {
    wires: VecDeque<Rc<RefCell<WireState>>>,
    connects: Rc<RefCell<Vec<SocketAddr>>>,
}

impl Connector for MockConnector {
    fn connect(&mut self, addr: &SocketAddr) -> io::Result<Box<dyn Transport>> {
        self.connects.borrow_mut().push(*addr);
        let state = self
            .wires
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no wire scripted"))?;
        Ok(Box::new(MockTransport { state }))
    }
}

// ---- virtual clock ------------------------------------------------------

struct TestClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl TestClock {
    fn new() -> Self {
        TestClock {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

// ---- mock upstream handler ----------------------------------------------

#[derive(Default)]
struct MockUpstream {
    header_batches: Vec<Vec<(String, String)>>,
    body: Vec<u8>,
    body_completes: u32,
    aborts: Vec<u16>,
    resets: Vec<bool>,
    resumes: u32,
    reads: u32,
    /// Attached during the next `on_downstream_reset`.
    reattach_next: Vec<Rc<RefCell<DownstreamConnection>>>,
}

impl UpstreamHandler for MockUpstream {
    fn on_downstream_header_complete(
        &mut self,
        dconn: &mut DownstreamConnection,
    ) -> Result<(), ()> {
        self.header_batches.push(dconn.take_response_headers());
        Ok(())
    }

    fn on_downstream_body(
        &mut self,
        _dconn: &mut DownstreamConnection,
        data: &[u8],
    ) -> Result<(), ()> {
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn on_downstream_body_complete(
        &mut self,
        _dconn: &mut DownstreamConnection,
    ) -> Result<(), ()> {
        self.body_completes += 1;
        Ok(())
    }

    fn on_downstream_abort_request(&mut self, _dconn: &mut DownstreamConnection, status: u16) {
        self.aborts.push(status);
    }

    fn resume_read(&mut self, _dconn: &mut DownstreamConnection) {
        self.resumes += 1;
    }

    fn downstream_read(&mut self, _dconn: &mut DownstreamConnection) -> Result<(), ()> {
        self.reads += 1;
        Ok(())
    }

    fn on_downstream_reset(
        &mut self,
        hard: bool,
        reattach: &mut Vec<Rc<RefCell<DownstreamConnection>>>,
    ) -> bool {
        self.resets.push(hard);
        reattach.append(&mut self.reattach_next);
        false
    }
}

// ---- harness ------------------------------------------------------------

struct Harness {
    session: BackendSession,
    wire: Rc<RefCell<WireState>>,
    spare_wire: Rc<RefCell<WireState>>,
    clock: Rc<TestClock>,
    connects: Rc<RefCell<Vec<SocketAddr>>>,
}

fn harness(cfg: Config) -> Harness {
    let wire = Rc::new(RefCell::new(WireState::default()));
    let spare_wire = Rc::new(RefCell::new(WireState::default()));
    let connects = Rc::new(RefCell::new(Vec::new()));
    let connector = MockConnector {
        wires: VecDeque::from([wire.clone(), spare_wire.clone()]),
        connects: connects.clone(),
    };
    let clock = Rc::new(TestClock::new());
    let session = BackendSession::new(cfg, Box::new(connector), clock.clone()).unwrap();
    Harness {
        session,
        wire,
        spare_wire,
        clock,
        connects,
    }
}

fn backend_config() -> Config {
    Config::for_backend("127.0.0.1:80".parse().unwrap(), "backend.example")
}

/// Drives a clear-text, proxy-less session to CONNECTED and flushes the
/// preface and initial frames.
fn connect(h: &mut Harness) {
    h.session.initiate_connection().unwrap();
    assert_eq!(h.session.state(), State::Connecting);
    h.session.on_writable();
    assert_eq!(h.session.state(), State::Connected);
    h.session.prepare();
}

fn new_dconn(
    request: RequestHead,
    upstream: &Rc<RefCell<MockUpstream>>,
) -> Rc<RefCell<DownstreamConnection>> {
    let dconn = Rc::new(RefCell::new(DownstreamConnection::new(request)));
    let handler: Rc<RefCell<dyn UpstreamHandler>> = upstream.clone();
    dconn.borrow_mut().attach_upstream(handler);
    dconn
}

#[derive(Debug)]
struct WireFrame {
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

/// Splits raw wire bytes (after the preface, if any) into frames.
fn parse_frames(mut bytes: &[u8]) -> Vec<WireFrame> {
    if bytes.starts_with(CONNECTION_PREFACE) {
        bytes = &bytes[CONNECTION_PREFACE.len()..];
    }
    let mut frames = Vec::new();
    while bytes.len() >= 9 {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize;
        let frame_type = bytes[3];
        let flags = bytes[4];
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);
        assert!(bytes.len() >= 9 + length, "truncated frame on the wire");
        frames.push(WireFrame {
            frame_type,
            flags,
            stream_id,
            payload: bytes[9..9 + length].to_vec(),
        });
        bytes = &bytes[9 + length..];
    }
    assert!(bytes.is_empty(), "trailing bytes after last frame");
    frames
}

fn settings_entries(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect()
}

fn server_headers(
    encoder: &mut HpackEncoder<'_>,
    stream_id: u32,
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

// ---- S1: no proxy, clear text, happy path -------------------------------

#[test]
fn test_clear_text_connect_sends_preface_and_settings() {
    let mut h = harness(backend_config());

    h.session.initiate_connection().unwrap();
    assert_eq!(h.session.state(), State::Connecting);
    assert!(h.session.should_hard_fail());

    h.session.on_writable();
    assert_eq!(h.session.state(), State::Connected);
    assert!(!h.session.should_hard_fail());
    // Before the write pass runs, the preface heads the outbound buffer.
    assert!(h.session.outbound_buffered().starts_with(CONNECTION_PREFACE));

    h.session.prepare();
    let written = h.wire.borrow().written.clone();
    assert!(written.starts_with(CONNECTION_PREFACE));

    let frames = parse_frames(&written);
    assert_eq!(frames[0].frame_type, FrameType::Settings.as_u8());
    assert_eq!(frames[0].stream_id, 0);
    assert_eq!(
        settings_entries(&frames[0].payload),
        vec![(0x2, 0), (0x3, 100), (0x4, 65535)],
    );

    let expected: Vec<SocketAddr> = vec!["127.0.0.1:80".parse().unwrap()];
    assert_eq!(*h.connects.borrow(), expected);
}

#[test]
fn test_connection_window_update_above_16_bits() {
    let mut cfg = backend_config();
    cfg.connection_window_bits = 20;
    let mut h = harness(cfg);
    connect(&mut h);

    let written = h.wire.borrow().written.clone();
    let frames = parse_frames(&written);
    assert_eq!(frames[0].frame_type, FrameType::Settings.as_u8());
    assert_eq!(frames[1].frame_type, FrameType::WindowUpdate.as_u8());
    assert_eq!(frames[1].stream_id, 0);
    let increment = u32::from_be_bytes([
        frames[1].payload[0],
        frames[1].payload[1],
        frames[1].payload[2],
        frames[1].payload[3],
    ]);
    assert_eq!(increment, (1 << 20) - 1 - 65535);
}

// ---- S2/S3: proxy tunnel ------------------------------------------------

fn proxy_config(userinfo: Option<&str>) -> Config {
    let mut cfg = backend_config();
    cfg.proxy = Some(ProxyConfig {
        host: "px.example".to_string(),
        addr: "127.0.0.1:3128".parse().unwrap(),
        userinfo: userinfo.map(|s| s.to_string()),
    });
    cfg
}

#[test]
fn test_proxy_tunnel_success() {
    let mut h = harness(proxy_config(None));

    h.session.initiate_connection().unwrap();
    assert_eq!(h.session.state(), State::ProxyConnecting);
    assert!(h.session.should_hard_fail());
    let expected: Vec<SocketAddr> = vec!["127.0.0.1:3128".parse().unwrap()];
    assert_eq!(*h.connects.borrow(), expected);

    h.session.on_writable();
    assert_eq!(
        h.wire.borrow().written,
        b"CONNECT backend.example:80 HTTP/1.1\r\nHost: backend.example\r\n\r\n".to_vec()
    );

    h.wire
        .borrow_mut()
        .feed(b"HTTP/1.1 200 Connection established\r\n\r\n");
    h.session.on_readable();
    // 200 tunnels straight through: PROXY_CONNECTED, then the clear-text
    // finalization lands on CONNECTED.
    assert_eq!(h.session.state(), State::Connected);

    h.session.prepare();
    let written = h.wire.borrow().written.clone();
    let preface_at = written
        .windows(CONNECTION_PREFACE.len())
        .position(|w| w == CONNECTION_PREFACE)
        .expect("preface follows the tunnel establishment");
    let frames = parse_frames(&written[preface_at..]);
    assert_eq!(frames[0].frame_type, FrameType::Settings.as_u8());
}

#[test]
fn test_proxy_authorization_header() {
    let mut h = harness(proxy_config(Some("user:pass")));

    h.session.initiate_connection().unwrap();
    h.session.on_writable();

    let written = String::from_utf8(h.wire.borrow().written.clone()).unwrap();
    assert!(written.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

#[test]
fn test_proxy_tunnel_failure_hard_fails_pending_requests() {
    let mut h = harness(proxy_config(None));

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(
        RequestHead::new("GET", "backend.example", "/"),
        &upstream,
    );
    h.session.add_downstream_connection(&dconn);

    h.session.initiate_connection().unwrap();
    h.session.on_writable();

    h.wire
        .borrow_mut()
        .feed(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
    h.session.on_readable();

    // The failed attempt tears down hard; the handler sees hard=true and
    // is expected to answer 502-class upstream.
    assert_eq!(upstream.borrow().resets, vec![true]);
    assert_eq!(h.session.state(), State::Disconnected);
}

// ---- S4: settings ACK timeout -------------------------------------------

#[test]
fn test_settings_ack_timeout_sends_goaway_and_disconnects() {
    let mut h = harness(backend_config());
    connect(&mut h);

    // No ACK arrives; ten seconds later the session gives up.
    h.clock.advance(Duration::from_secs(10));
    h.session.poll_timers();
    h.session.prepare();

    let written = h.wire.borrow().written.clone();
    let frames = parse_frames(&written);
    let goaway = frames
        .iter()
        .find(|f| f.frame_type == FrameType::Goaway.as_u8())
        .expect("GOAWAY was sent");
    let code = u32::from_be_bytes([
        goaway.payload[4],
        goaway.payload[5],
        goaway.payload[6],
        goaway.payload[7],
    ]);
    assert_eq!(code, ErrorCode::SettingsTimeout.as_u32());
    assert_eq!(h.session.state(), State::Disconnected);
}

#[test]
fn test_settings_ack_disarms_the_timer() {
    let mut h = harness(backend_config());
    connect(&mut h);

    // SETTINGS ACK from the backend.
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_settings_frame(&Settings::new(), true));
    h.session.on_readable();

    // Well past the 10s SETTINGS deadline (but short of the read
    // timeout): nothing fires.
    h.clock.advance(Duration::from_secs(15));
    h.session.poll_timers();
    h.session.prepare();

    let written = h.wire.borrow().written.clone();
    let frames = parse_frames(&written);
    assert!(!frames
        .iter()
        .any(|f| f.frame_type == FrameType::Goaway.as_u8()));
    assert_eq!(h.session.state(), State::Connected);
}

// ---- request/response bridging ------------------------------------------

fn submit_get(h: &mut Harness, upstream: &Rc<RefCell<MockUpstream>>) -> Rc<RefCell<DownstreamConnection>> {
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), upstream);
    h.session.add_downstream_connection(&dconn);
    h.session.submit_request(&dconn).unwrap();
    h.session.prepare();
    dconn
}

#[test]
fn test_response_roundtrip() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();
    assert_eq!(stream_id, 1);

    // Registry parity while the stream is open.
    assert_eq!(h.session.stream_record_ids(), vec![1]);
    assert_eq!(h.session.engine_stream_ids(), vec![1]);

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"200"), (b"content-length", b"5")],
        false,
    ));
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_data_frame(&DataFrame::new(
            stream_id,
            Bytes::from("hello"),
            true,
        )));
    h.session.on_readable();

    assert_eq!(dconn.borrow().response_status(), 200);
    assert_eq!(dconn.borrow().response_state(), MsgState::MsgComplete);
    assert_eq!(upstream.borrow().body, b"hello");
    assert_eq!(upstream.borrow().body_completes, 1);
    assert_eq!(upstream.borrow().header_batches.len(), 1);
    assert!(upstream.borrow().header_batches[0]
        .iter()
        .any(|(n, v)| n == "content-length" && v == "5"));

    // Stream closed on both sides: registry parity again.
    assert!(h.session.stream_record_ids().is_empty());
    assert!(h.session.engine_stream_ids().is_empty());
}

#[test]
fn test_response_without_content_length_gets_chunked_framing() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"200")],
        false,
    ));
    h.session.on_readable();

    assert!(dconn.borrow().chunked_response());
    assert!(upstream.borrow().header_batches[0]
        .iter()
        .any(|(n, v)| n == "transfer-encoding" && v == "chunked"));
}

#[test]
fn test_informational_then_final_response() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"103"), (b"link", b"</style.css>; rel=preload")],
        false,
    ));
    h.session.on_readable();
    assert!(dconn.borrow().expect_final_response());
    assert_eq!(upstream.borrow().header_batches.len(), 1);

    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"204")],
        true,
    ));
    h.session.on_readable();

    assert_eq!(dconn.borrow().response_status(), 204);
    assert_eq!(upstream.borrow().header_batches.len(), 2);
    assert_eq!(dconn.borrow().response_state(), MsgState::MsgComplete);
}

// ---- S5: bad content-length ---------------------------------------------

#[test]
fn test_duplicate_content_length_resets_stream() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();
    let flushed = h.wire.borrow().written.len();

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[
            (b":status", b"200"),
            (b"content-length", b"5"),
            (b"content-length", b"5"),
        ],
        false,
    ));
    h.session.on_readable();

    assert_eq!(dconn.borrow().response_state(), MsgState::MsgBadHeader);

    h.session.prepare();
    let written = h.wire.borrow().written[flushed..].to_vec();
    let frames = parse_frames(&written);
    let rst = frames
        .iter()
        .find(|f| f.frame_type == FrameType::RstStream.as_u8())
        .expect("RST_STREAM was sent");
    assert_eq!(rst.stream_id, stream_id);
    let code =
        u32::from_be_bytes([rst.payload[0], rst.payload[1], rst.payload[2], rst.payload[3]]);
    assert_eq!(code, ErrorCode::ProtocolError.as_u32());
}

#[test]
fn test_disallowed_connection_header_resets_stream() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();
    let flushed = h.wire.borrow().written.len();

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"200"), (b"connection", b"close")],
        false,
    ));
    h.session.on_readable();
    h.session.prepare();

    let written = h.wire.borrow().written[flushed..].to_vec();
    let frames = parse_frames(&written);
    assert!(frames
        .iter()
        .any(|f| f.frame_type == FrameType::RstStream.as_u8()));
}

// ---- S6: push refusal ---------------------------------------------------

#[test]
fn test_pushed_stream_is_refused() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();
    let flushed = h.wire.borrow().written.len();

    // PUSH_PROMISE for promised stream 4 on our request stream, with an
    // empty header fragment.
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u32.to_be_bytes());
    let mut frame = Vec::new();
    frame.extend_from_slice(&FrameCodec::encode_header(
        FrameType::PushPromise,
        FrameFlags::from_u8(FrameFlags::END_HEADERS),
        stream_id,
        payload.len(),
    ));
    frame.extend_from_slice(&payload);
    h.wire.borrow_mut().feed(&frame);
    h.session.on_readable();

    // No record was ever created for the promised id.
    assert_eq!(h.session.stream_record_ids(), vec![stream_id]);
    assert_eq!(h.session.engine_stream_ids(), vec![stream_id]);

    h.session.prepare();
    let written = h.wire.borrow().written[flushed..].to_vec();
    let frames = parse_frames(&written);
    let rst = frames
        .iter()
        .find(|f| f.frame_type == FrameType::RstStream.as_u8())
        .expect("RST_STREAM was sent");
    assert_eq!(rst.stream_id, 4);
    let code =
        u32::from_be_bytes([rst.payload[0], rst.payload[1], rst.payload[2], rst.payload[3]]);
    assert_eq!(code, ErrorCode::RefusedStream.as_u32());
}

// ---- RST_STREAM from the backend ----------------------------------------

#[test]
fn test_remote_rst_records_error_and_drops_record() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = submit_get(&mut h, &upstream);
    let stream_id = dconn.borrow().stream_id().unwrap();

    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id,
            error_code: ErrorCode::Cancel,
        }));
    h.session.on_readable();

    assert_eq!(dconn.borrow().rst_error_code(), Some(ErrorCode::Cancel));
    assert_eq!(dconn.borrow().response_state(), MsgState::MsgReset);
    assert!(h.session.stream_record_ids().is_empty());
    assert!(h.session.engine_stream_ids().is_empty());
}

// ---- request body, flow control, pending-data tail ----------------------

#[test]
fn test_large_upload_survives_partial_buffers_in_order() {
    let mut h = harness(backend_config());
    connect(&mut h);

    // The backend opens up: 100 KB frames, wide windows.
    let peer_settings = Settings {
        initial_window_size: Some(400_000),
        max_frame_size: Some(100_000),
        ..Settings::new()
    };
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_settings_frame(&peer_settings, false));
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
            stream_id: 0,
            size_increment: 400_000,
        }));
    h.session.on_readable();
    h.session.prepare();

    let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("POST", "backend.example", "/upload"), &upstream);
    dconn.borrow_mut().push_upload_data(Bytes::from(body.clone()));
    dconn.borrow_mut().end_upload_data();

    h.session.add_downstream_connection(&dconn);
    let flushed = h.wire.borrow().written.len();
    h.session.submit_request(&dconn).unwrap();
    h.session.prepare();

    let written = h.wire.borrow().written[flushed..].to_vec();
    let frames = parse_frames(&written);
    let mut sent_body = Vec::new();
    let mut saw_end_stream = false;
    for frame in &frames {
        if frame.frame_type == FrameType::Data.as_u8() {
            assert!(!saw_end_stream, "DATA after END_STREAM");
            sent_body.extend_from_slice(&frame.payload);
            if frame.flags & FrameFlags::END_STREAM != 0 {
                saw_end_stream = true;
            }
        }
    }
    // 100 KB frames do not fit the 64 KB outbound buffer in one piece,
    // so this only holds if the pending tail preserved every byte in
    // order.
    assert_eq!(sent_body, body);
    assert!(saw_end_stream);
}

#[test]
fn test_write_budget_drip_preserves_byte_stream() {
    let mut h = harness(backend_config());
    h.wire.borrow_mut().write_budget = Some(0);

    h.session.initiate_connection().unwrap();
    h.session.on_writable();
    assert_eq!(h.session.state(), State::Connected);
    h.session.prepare();
    assert!(h.wire.borrow().written.is_empty());

    // Drip seven bytes of transport space at a time.
    loop {
        {
            let mut wire = h.wire.borrow_mut();
            wire.write_budget = Some(7);
        }
        h.session.signal_write();
        h.session.prepare();
        let done = {
            let wire = h.wire.borrow();
            wire.write_budget != Some(0)
        };
        if done && h.session.outbound_buffered().is_empty() {
            break;
        }
    }

    let written = h.wire.borrow().written.clone();
    assert!(written.starts_with(CONNECTION_PREFACE));
    let frames = parse_frames(&written);
    assert_eq!(frames[0].frame_type, FrameType::Settings.as_u8());
    assert_eq!(
        settings_entries(&frames[0].payload),
        vec![(0x2, 0), (0x3, 100), (0x4, 65535)],
    );
}

// ---- write coalescing ----------------------------------------------------

#[test]
fn test_signal_write_coalesces_to_one_pass() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let before = h.wire.borrow().written.len();
    h.session.signal_write();
    h.session.signal_write();
    h.session.signal_write();
    assert!(h.session.write_requested());

    h.session.prepare();
    assert!(!h.session.write_requested());

    // Nothing new to send: the passes did not amplify into output.
    assert_eq!(h.wire.borrow().written.len(), before);

    // A prepare without a request is a no-op.
    h.session.prepare();
    assert_eq!(h.wire.borrow().written.len(), before);
}

// ---- liveness check ------------------------------------------------------

#[test]
fn test_idle_interval_requires_connection_check() {
    let mut h = harness(backend_config());
    connect(&mut h);
    assert_eq!(h.session.check_state(), ConnCheckState::None);

    // I/O keeps pushing the idle deadline out.
    h.clock.advance(Duration::from_secs(4));
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_settings_frame(&Settings::new(), true));
    h.session.on_readable();

    h.clock.advance(Duration::from_secs(4));
    h.session.poll_timers();
    assert_eq!(h.session.check_state(), ConnCheckState::None);

    h.clock.advance(Duration::from_secs(2));
    h.session.poll_timers();
    assert_eq!(h.session.check_state(), ConnCheckState::Required);
}

#[test]
fn test_liveness_check_submits_exactly_one_ping() {
    let mut h = harness(backend_config());
    connect(&mut h);

    h.clock.advance(Duration::from_secs(6));
    h.session.poll_timers();
    assert_eq!(h.session.check_state(), ConnCheckState::Required);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);

    // Submission is gated and kicks off the PING probe.
    assert!(h.session.submit_request(&dconn).is_err());
    assert_eq!(h.session.check_state(), ConnCheckState::Started);

    // Another submission attempt while the check is in flight must not
    // produce a second PING.
    assert!(h.session.submit_request(&dconn).is_err());
    assert_eq!(h.session.check_state(), ConnCheckState::Started);

    h.session.prepare();
    let count_pings = |bytes: &[u8]| {
        parse_frames(bytes)
            .iter()
            .filter(|f| f.frame_type == FrameType::Ping.as_u8() && f.flags & FrameFlags::ACK == 0)
            .count()
    };
    assert_eq!(count_pings(&h.wire.borrow().written), 1);

    // Successful I/O (the PING flush above, then the ACK) marks the
    // connection alive again.
    h.wire
        .borrow_mut()
        .feed(&FrameCodec::encode_ping_frame(
            &h2relay::h2::frames::PingFrame::ack([0; 8]),
        ));
    h.session.on_readable();
    assert_eq!(h.session.check_state(), ConnCheckState::None);
    assert!(h.session.can_push_request());
    assert_eq!(count_pings(&h.wire.borrow().written), 1);
}

#[test]
fn test_submission_gating() {
    let mut h = harness(backend_config());
    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);

    // Not connected yet.
    assert!(!h.session.can_push_request());
    assert!(h.session.submit_request(&dconn).is_err());

    connect(&mut h);
    assert!(h.session.can_push_request());
    h.session.submit_request(&dconn).unwrap();
    assert!(dconn.borrow().stream_id().is_some());
}

// ---- pending requests are pushed on connect ------------------------------

#[test]
fn test_pending_requests_flush_on_connect() {
    let mut h = harness(backend_config());

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/early"), &upstream);
    h.session.add_downstream_connection(&dconn);

    connect(&mut h);

    assert_eq!(dconn.borrow().stream_id(), Some(1));
    assert_eq!(upstream.borrow().resumes, 1);
    let written = h.wire.borrow().written.clone();
    let frames = parse_frames(&written);
    assert!(frames
        .iter()
        .any(|f| f.frame_type == FrameType::Headers.as_u8() && f.stream_id == 1));
}

// ---- teardown -------------------------------------------------------------

#[test]
fn test_disconnect_notifies_and_preserves_reattached_dconns() {
    let mut h = harness(backend_config());

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);
    connect(&mut h);
    // The pending request went out with the connect.
    assert_eq!(h.session.stream_record_ids().len(), 1);

    // The handler re-attaches a replacement request mid-teardown.
    let replacement = new_dconn(RequestHead::new("GET", "backend.example", "/retry"), &upstream);
    replacement
        .borrow_mut()
        .set_request_state(MsgState::MsgComplete);
    upstream.borrow_mut().reattach_next.push(replacement.clone());

    h.session.disconnect(false);

    assert_eq!(h.session.state(), State::Disconnected);
    assert_eq!(upstream.borrow().resets, vec![false]);
    assert!(h.session.stream_record_ids().is_empty());
    // The replacement survived teardown and is pending.
    assert_eq!(h.session.pending_dconn_count(), 1);

    // Second attempt picks it up.
    h.session.initiate_connection().unwrap();
    h.session.on_writable();
    assert_eq!(h.session.state(), State::Connected);
    assert_eq!(replacement.borrow().stream_id(), Some(1));
    h.session.prepare();
    let written = h.spare_wire.borrow().written.clone();
    assert!(written.starts_with(CONNECTION_PREFACE));
}

#[test]
fn test_disconnect_is_idempotent() {
    let mut h = harness(backend_config());
    connect(&mut h);
    h.session.disconnect(false);
    h.session.disconnect(true);
    h.session.disconnect(false);
    assert_eq!(h.session.state(), State::Disconnected);
}

#[test]
fn test_eof_on_established_session_soft_resets() {
    let mut h = harness(backend_config());

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);
    connect(&mut h);

    h.wire.borrow_mut().eof = true;
    h.session.on_readable();

    assert_eq!(h.session.state(), State::Disconnected);
    // Established session: handlers may re-queue (soft).
    assert_eq!(upstream.borrow().resets, vec![false]);
}

#[test]
fn test_read_timeout_while_connecting_is_hard() {
    let mut h = harness(backend_config());

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("GET", "backend.example", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);

    h.session.initiate_connection().unwrap();
    assert_eq!(h.session.state(), State::Connecting);

    // The connect never completes; the write timer fires.
    h.clock.advance(Duration::from_secs(31));
    h.session.poll_timers();

    assert_eq!(h.session.state(), State::Disconnected);
    assert_eq!(upstream.borrow().resets, vec![true]);
}

// ---- CONNECT request handling --------------------------------------------

#[test]
fn test_connect_request_upgrade_flow() {
    let mut h = harness(backend_config());
    connect(&mut h);

    let upstream = Rc::new(RefCell::new(MockUpstream::default()));
    let dconn = new_dconn(RequestHead::new("CONNECT", "target.example:443", "/"), &upstream);
    h.session.add_downstream_connection(&dconn);
    h.session.submit_request(&dconn).unwrap();
    h.session.prepare();
    let stream_id = dconn.borrow().stream_id().unwrap();

    let mut encoder = HpackEncoder::new();
    h.wire.borrow_mut().feed(&server_headers(
        &mut encoder,
        stream_id,
        &[(b":status", b"200")],
        false,
    ));
    h.session.on_readable();

    let d = dconn.borrow();
    assert!(d.upgraded());
    assert!(d.response_connection_close());
    assert_eq!(d.response_state(), MsgState::HeaderComplete);
    assert_eq!(d.request_state(), MsgState::HeaderComplete);
    assert!(!d.chunked_response());
    drop(d);
    assert!(upstream.borrow().resumes >= 1);
}
