//! The backend HTTP/2 session
//!
//! One `BackendSession` owns one connection to the backend server and
//! multiplexes every upstream handler's requests onto it. Establishment
//! walks a state machine (optional CONNECT tunnel through a forward
//! proxy, optional TLS with ALPN), after which the session bridges the
//! HTTP/2 engine to its transport: reads feed `mem_recv`, writes drain
//! `mem_send`, and engine hooks fan frames out to the downstream
//! connections' upstream handlers.
//!
//! The session is event-driven and single-threaded: the embedding loop
//! calls `on_readable`, `on_writable`, `prepare` (once per tick) and
//! `poll_timers`, and everything else happens inside those calls.

pub mod upstream;

pub use upstream::{DconnBodySource, DownstreamConnection, MsgState, RequestHead, UpstreamHandler};

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::buffer::IoBuffer;
use crate::clock::{Clock, TimerKind, TimerSet};
use crate::config::Config;
use crate::h2::engine::{
    Engine, EngineHooks, FrameEvent, HeaderOutcome, HeadersCategory, Submissions,
};
use crate::h2::{EngineError, ErrorCode, Settings, StreamId, CONNECTION_PREFACE};
use crate::http1::ResponseHeadParser;
use crate::tls::{HandshakeStatus, TlsContext, TlsError, TlsTransport};
use crate::transport::{read_step, write_step, Connector, SocketResult, Transport};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Connection establishment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    ProxyConnecting,
    ProxyConnected,
    ProxyFailed,
    Connecting,
    ConnectFailing,
    Connected,
}

/// Liveness probe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCheckState {
    None,
    /// The idle interval elapsed; new submissions wait for a PING.
    Required,
    /// The PING is in flight.
    Started,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("proxy refused tunnel: status {0}")]
    ProxyRejected(u16),

    #[error("proxy response: {0}")]
    ProxyParse(#[from] crate::http1::ParseError),

    #[error("connection closed by peer")]
    Eof,

    #[error("transport error")]
    Transport,

    #[error("nothing left to read or write on this session")]
    Quiesced,

    #[error("outbound buffer too small")]
    BufferOverflow,

    #[error("session cannot accept requests right now")]
    NotReady,

    #[error("operation invalid in state {0:?}")]
    InvalidState(State),
}

pub type Result<T> = std::result::Result<T, SessionError>;

enum Wire {
    None,
    Plain(Box<dyn Transport>),
    Tls(TlsTransport),
}

impl Wire {
    fn transport_mut(&mut self) -> Option<&mut dyn Transport> {
        match self {
            Wire::None => None,
            Wire::Plain(t) => Some(t.as_mut()),
            Wire::Tls(t) => Some(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadRole {
    Noop,
    TlsHandshake,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteRole {
    Noop,
    /// Waiting for the asynchronous connect to finish.
    Connected,
    TlsHandshake,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnReadRole {
    Noop,
    ProxyResponse,
    H2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnWriteRole {
    Noop,
    ProxyConnect,
    H2,
}

/// Session-level reactions collected while engine hooks run, applied
/// once the engine call returns.
enum PostOp {
    StartSettingsTimer,
    StopSettingsTimer,
    ResumeUpload(StreamId),
}

struct StreamRecord {
    dconn: Option<Weak<RefCell<DownstreamConnection>>>,
}

/// The engine-facing half of the session: stream records, downstream
/// connections, and the frame hook logic. Split from `BackendSession` so
/// the engine can borrow it while the session still owns the engine.
struct Bridge {
    cfg: Rc<Config>,
    dconns: HashMap<u64, Weak<RefCell<DownstreamConnection>>>,
    streams: HashMap<StreamId, StreamRecord>,
    ops: Vec<PostOp>,
}

impl Bridge {
    fn new(cfg: Rc<Config>) -> Self {
        Bridge {
            cfg,
            dconns: HashMap::new(),
            streams: HashMap::new(),
            ops: Vec::new(),
        }
    }

    /// The downstream connection behind `stream_id`, if the record still
    /// points at a live one agreeing on the stream id.
    fn record_dconn(&self, stream_id: StreamId) -> Option<Rc<RefCell<DownstreamConnection>>> {
        let record = self.streams.get(&stream_id)?;
        let rc = record.dconn.as_ref()?.upgrade()?;
        if rc.borrow().stream_id() != Some(stream_id) {
            return None;
        }
        Some(rc)
    }

    /// Post-event notification towards the upstream; a failing handler
    /// gets dropped, taking its pending requests with it.
    fn notify_read(&mut self, rc: &Rc<RefCell<DownstreamConnection>>) {
        let Some(up) = rc.borrow().upstream_rc() else {
            return;
        };
        let result = {
            let mut d = rc.borrow_mut();
            up.borrow_mut().downstream_read(&mut d)
        };
        if result.is_err() {
            let id = rc.borrow().id();
            tracing::warn!(dconn = id, "upstream handler failed, dropping it");
            rc.borrow_mut().clear_upstream();
            self.dconns.remove(&id);
        }
    }

    fn notify_header_complete(
        &mut self,
        rc: &Rc<RefCell<DownstreamConnection>>,
    ) -> std::result::Result<(), ()> {
        let Some(up) = rc.borrow().upstream_rc() else {
            return Ok(());
        };
        let mut d = rc.borrow_mut();
        let result = up.borrow_mut().on_downstream_header_complete(&mut d);
        result
    }

    fn notify_body_complete(&mut self, rc: &Rc<RefCell<DownstreamConnection>>) {
        let Some(up) = rc.borrow().upstream_rc() else {
            return;
        };
        let failed = {
            let mut d = rc.borrow_mut();
            up.borrow_mut().on_downstream_body_complete(&mut d).is_err()
        };
        if failed {
            rc.borrow_mut().set_response_state(MsgState::MsgReset);
        }
    }

    /// The "on response headers" routine: status validation, implicit
    /// framing decisions, upgrade handling, upstream notification.
    fn on_response_headers(
        &mut self,
        stream_id: StreamId,
        rc: &Rc<RefCell<DownstreamConnection>>,
        subs: &mut Submissions,
    ) {
        let status = {
            let mut d = rc.borrow_mut();
            d.set_expect_final_response(false);
            let status = d.response_header(":status").and_then(parse_status_code);
            match status {
                Some(code) => {
                    d.set_response_status(code);
                    code
                }
                None => {
                    subs.rst_stream(stream_id, ErrorCode::ProtocolError);
                    d.set_response_state(MsgState::MsgReset);
                    drop(d);
                    self.notify_read(rc);
                    return;
                }
            }
        };
        tracing::debug!(stream_id, status, "response headers");

        if rc.borrow().non_final_response() {
            rc.borrow_mut().set_expect_final_response(true);
            let outcome = self.notify_header_complete(rc);
            // The informational batch is done with; the final response
            // starts a fresh one.
            let _ = rc.borrow_mut().take_response_headers();
            if outcome.is_err() {
                subs.rst_stream(stream_id, ErrorCode::ProtocolError);
                rc.borrow_mut().set_response_state(MsgState::MsgReset);
            }
            return;
        }

        {
            let mut d = rc.borrow_mut();
            if d.response_content_length().is_none() && d.expect_response_body() {
                if d.request.major == 0 || (d.request.major == 1 && d.request.minor == 0) {
                    // Pre-HTTP/1.1 upstream cannot take chunked framing;
                    // delimit the body by closing the connection.
                    d.set_response_connection_close(true);
                } else if d.request.method != "CONNECT" {
                    d.add_response_header(b"transfer-encoding", b"chunked");
                    d.set_chunked_response(true);
                }
            }
            d.set_response_state(MsgState::HeaderComplete);
            d.check_upgrade_fulfilled();
        }

        if rc.borrow().upgraded() {
            tracing::debug!(stream_id, "upgrade fulfilled");
            rc.borrow_mut().set_response_connection_close(true);
            let up = rc.borrow().upstream_rc();
            if let Some(up) = up {
                let mut d = rc.borrow_mut();
                up.borrow_mut().resume_read(&mut d);
            }
            rc.borrow_mut().set_request_state(MsgState::HeaderComplete);
        } else if rc.borrow().request.method == "CONNECT" {
            // End the upload side so the stream cannot stall waiting for
            // request body that will never come.
            rc.borrow_mut().end_upload_data();
            self.ops.push(PostOp::ResumeUpload(stream_id));
        }

        if self.notify_header_complete(rc).is_err() {
            subs.rst_stream(stream_id, ErrorCode::ProtocolError);
            rc.borrow_mut().set_response_state(MsgState::MsgReset);
        }
    }
}

impl EngineHooks for Bridge {
    fn on_begin_headers(
        &mut self,
        stream_id: StreamId,
        category: HeadersCategory,
        subs: &mut Submissions,
    ) {
        if category == HeadersCategory::Response && self.record_dconn(stream_id).is_none() {
            subs.rst_stream(stream_id, ErrorCode::InternalError);
        }
    }

    fn on_header(
        &mut self,
        stream_id: StreamId,
        category: HeadersCategory,
        name: &[u8],
        value: &[u8],
        subs: &mut Submissions,
    ) -> HeaderOutcome {
        let Some(rc) = self.record_dconn(stream_id) else {
            return HeaderOutcome::Accept;
        };
        let mut d = rc.borrow_mut();

        let relevant = category == HeadersCategory::Response
            || (category == HeadersCategory::Headers && d.expect_final_response());
        if !relevant {
            return HeaderOutcome::Accept;
        }

        if d.response_headers_sum() > self.cfg.max_response_header_sum {
            tracing::debug!(stream_id, "response header block too large");
            subs.rst_stream(stream_id, ErrorCode::InternalError);
            return HeaderOutcome::Veto;
        }
        if !valid_header_pair(name, value) {
            return HeaderOutcome::Accept;
        }
        if name.starts_with(b":") {
            if name != b":status" {
                subs.rst_stream(stream_id, ErrorCode::ProtocolError);
                return HeaderOutcome::Veto;
            }
        } else if connection_specific(name) {
            subs.rst_stream(stream_id, ErrorCode::ProtocolError);
            return HeaderOutcome::Veto;
        }

        if name.eq_ignore_ascii_case(b"content-length") {
            let parsed = parse_content_length(value);
            let duplicate = d.response_content_length().is_some();
            match parsed {
                Some(len) if !duplicate => d.set_response_content_length(len),
                _ => {
                    subs.rst_stream(stream_id, ErrorCode::ProtocolError);
                    d.set_response_state(MsgState::MsgBadHeader);
                    return HeaderOutcome::Veto;
                }
            }
        }

        d.add_response_header(name, value);
        HeaderOutcome::Accept
    }

    fn on_frame_recv(&mut self, event: &FrameEvent, subs: &mut Submissions) {
        match event {
            FrameEvent::Data {
                stream_id,
                end_stream,
            } => {
                let Some(rc) = self.record_dconn(*stream_id) else {
                    return;
                };
                if *end_stream && rc.borrow().response_state() == MsgState::HeaderComplete {
                    rc.borrow_mut().set_response_state(MsgState::MsgComplete);
                    self.notify_body_complete(&rc);
                }
                self.notify_read(&rc);
            }
            FrameEvent::Headers {
                stream_id,
                category,
                end_stream,
            } => {
                let Some(rc) = self.record_dconn(*stream_id) else {
                    return;
                };
                match category {
                    HeadersCategory::Response => {
                        self.on_response_headers(*stream_id, &rc, subs);
                    }
                    HeadersCategory::Headers => {
                        if rc.borrow().expect_final_response() {
                            self.on_response_headers(*stream_id, &rc, subs);
                        } else if !*end_stream {
                            // Trailers must end the stream.
                            subs.rst_stream(*stream_id, ErrorCode::ProtocolError);
                            return;
                        }
                    }
                    HeadersCategory::Request => return,
                }

                if *end_stream {
                    if rc.borrow().response_state() == MsgState::HeaderComplete {
                        rc.borrow_mut().set_response_state(MsgState::MsgComplete);
                        self.notify_body_complete(&rc);
                    }
                } else {
                    rc.borrow_mut().reset_read_timer();
                }
                self.notify_read(&rc);
            }
            FrameEvent::RstStream {
                stream_id,
                error_code,
            } => {
                if let Some(rc) = self.record_dconn(*stream_id) {
                    rc.borrow_mut().set_rst_error_code(*error_code);
                    self.notify_read(&rc);
                }
            }
            FrameEvent::Settings { ack: true } => {
                self.ops.push(PostOp::StopSettingsTimer);
            }
            FrameEvent::PushPromise {
                promised_stream_id, ..
            } => {
                tracing::debug!(promised_stream_id, "refusing pushed stream");
                subs.rst_stream(*promised_stream_id, ErrorCode::RefusedStream);
            }
            FrameEvent::Goaway {
                last_stream_id,
                error_code,
            } => {
                tracing::info!(
                    last_stream_id,
                    error_code = %error_code,
                    "backend sent GOAWAY"
                );
            }
            _ => {}
        }
    }

    fn on_data_chunk_recv(&mut self, stream_id: StreamId, data: &[u8], subs: &mut Submissions) {
        let Some(rc) = self.record_dconn(stream_id) else {
            // Flow-control credit must flow back even for streams the
            // session no longer knows.
            subs.rst_stream(stream_id, ErrorCode::InternalError);
            subs.consume(stream_id, data.len());
            return;
        };

        if !rc.borrow().expect_response_body() {
            subs.rst_stream(stream_id, ErrorCode::InternalError);
            subs.consume(stream_id, data.len());
            return;
        }
        if rc.borrow().non_final_response() {
            // DATA after a 1xx is illegal.
            subs.rst_stream(stream_id, ErrorCode::ProtocolError);
            subs.consume(stream_id, data.len());
            return;
        }

        {
            let mut d = rc.borrow_mut();
            d.reset_read_timer();
            d.add_response_body_len(data.len());
        }

        let delivered = {
            let up = rc.borrow().upstream_rc();
            match up {
                Some(up) => {
                    let mut d = rc.borrow_mut();
                    up.borrow_mut().on_downstream_body(&mut d, data).is_ok()
                }
                None => true,
            }
        };
        if delivered {
            subs.consume(stream_id, data.len());
        } else {
            subs.rst_stream(stream_id, ErrorCode::InternalError);
            subs.consume(stream_id, data.len());
            rc.borrow_mut().set_response_state(MsgState::MsgReset);
        }
        self.notify_read(&rc);
    }

    fn on_stream_close(
        &mut self,
        stream_id: StreamId,
        error_code: ErrorCode,
        _subs: &mut Submissions,
    ) {
        tracing::debug!(stream_id, error_code = %error_code, "stream closed");
        let record = self.streams.remove(&stream_id);
        let Some(rc) = record
            .and_then(|r| r.dconn)
            .and_then(|weak| weak.upgrade())
        else {
            return;
        };
        if rc.borrow().stream_id() != Some(stream_id) {
            return;
        }

        let (upgraded, response_state) = {
            let d = rc.borrow();
            (d.upgraded(), d.response_state())
        };
        if upgraded && response_state == MsgState::HeaderComplete {
            // Tunneled stream: finish the body; the upstream tears the
            // rest down once it has flushed.
            self.notify_body_complete(&rc);
            rc.borrow_mut().set_response_state(MsgState::MsgComplete);
        } else if error_code == ErrorCode::NoError {
            match response_state {
                MsgState::MsgComplete | MsgState::MsgBadHeader => {}
                _ => rc.borrow_mut().set_response_state(MsgState::MsgReset),
            }
        } else if response_state != MsgState::MsgBadHeader {
            rc.borrow_mut().set_response_state(MsgState::MsgReset);
        }
        self.notify_read(&rc);
    }

    fn on_frame_send(&mut self, event: &FrameEvent, _subs: &mut Submissions) {
        match event {
            FrameEvent::Data {
                stream_id,
                end_stream: false,
            }
            | FrameEvent::Headers {
                stream_id,
                end_stream: false,
                ..
            } => {
                if let Some(rc) = self.record_dconn(*stream_id) {
                    rc.borrow_mut().reset_read_timer();
                }
            }
            FrameEvent::Settings { ack: false } => {
                self.ops.push(PostOp::StartSettingsTimer);
            }
            _ => {}
        }
    }

    fn on_frame_not_send(&mut self, event: &FrameEvent, _subs: &mut Submissions) {
        let FrameEvent::Headers {
            stream_id,
            category: HeadersCategory::Request,
            ..
        } = event
        else {
            return;
        };
        tracing::debug!(stream_id, "request headers could not be sent");
        if let Some(record) = self.streams.remove(stream_id) {
            if let Some(rc) = record.dconn.and_then(|weak| weak.upgrade()) {
                rc.borrow_mut().set_response_state(MsgState::MsgReset);
                self.notify_read(&rc);
            }
        }
    }

    fn select_padding(&mut self, payload_len: usize, max_payload_len: usize) -> usize {
        (payload_len + self.cfg.padding).min(max_payload_len)
    }
}

/// One backend HTTP/2 session.
pub struct BackendSession {
    cfg: Rc<Config>,
    connector: Box<dyn Connector>,
    tls_ctx: Option<TlsContext>,

    state: State,
    check_state: ConnCheckState,

    wire: Wire,
    read_role: ReadRole,
    write_role: WriteRole,
    on_read_role: OnReadRole,
    on_write_role: OnWriteRole,
    read_interest: bool,
    write_interest: bool,

    rb: IoBuffer,
    wb: IoBuffer,
    /// Engine output that did not fit into `wb`; flushed before the next
    /// `mem_send`.
    pending_tail: Option<Bytes>,

    write_requested: bool,

    timers: TimerSet,
    engine: Option<Engine>,
    bridge: Bridge,
    proxy_parser: Option<ResponseHeadParser>,
}

impl BackendSession {
    pub fn new(
        cfg: Config,
        connector: Box<dyn Connector>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        let tls_ctx = if cfg.no_tls {
            None
        } else {
            Some(TlsContext::new(cfg.insecure)?)
        };
        let mut timers = TimerSet::new(clock);
        timers.set_duration(TimerKind::Read, cfg.read_timeout);
        timers.set_duration(TimerKind::Write, cfg.write_timeout);
        timers.set_duration(TimerKind::SettingsAck, cfg.settings_timeout);
        timers.set_duration(TimerKind::ConnCheck, cfg.connection_check_interval);

        let cfg = Rc::new(cfg);
        Ok(BackendSession {
            cfg: cfg.clone(),
            connector,
            tls_ctx,
            state: State::Disconnected,
            check_state: ConnCheckState::None,
            wire: Wire::None,
            read_role: ReadRole::Noop,
            write_role: WriteRole::Noop,
            on_read_role: OnReadRole::Noop,
            on_write_role: OnWriteRole::Noop,
            read_interest: false,
            write_interest: false,
            rb: IoBuffer::with_capacity(READ_BUFFER_SIZE),
            wb: IoBuffer::with_capacity(WRITE_BUFFER_SIZE),
            pending_tail: None,
            write_requested: false,
            timers,
            engine: None,
            bridge: Bridge::new(cfg),
            proxy_parser: None,
        })
    }

    // ---- observers -----------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn check_state(&self) -> ConnCheckState {
        self.check_state
    }

    pub fn should_hard_fail(&self) -> bool {
        matches!(
            self.state,
            State::ProxyConnecting | State::ProxyFailed | State::Connecting | State::ConnectFailing
        )
    }

    /// New requests are accepted only on a connected session whose
    /// liveness is not in question.
    pub fn can_push_request(&self) -> bool {
        self.state == State::Connected && self.check_state == ConnCheckState::None
    }

    pub fn read_interest(&self) -> bool {
        self.read_interest
    }

    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn write_requested(&self) -> bool {
        self.write_requested
    }

    /// Bytes queued towards the transport but not yet written.
    pub fn outbound_buffered(&self) -> &[u8] {
        self.wb.data()
    }

    /// Stream ids the session holds records for.
    pub fn stream_record_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.bridge.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stream ids the engine still considers open.
    pub fn engine_stream_ids(&self) -> Vec<StreamId> {
        self.engine
            .as_ref()
            .map(|e| e.open_stream_ids())
            .unwrap_or_default()
    }

    pub fn pending_dconn_count(&self) -> usize {
        self.bridge.dconns.len()
    }

    // ---- downstream connection management ------------------------------

    pub fn add_downstream_connection(&mut self, dconn: &Rc<RefCell<DownstreamConnection>>) {
        self.bridge
            .dconns
            .insert(dconn.borrow().id(), Rc::downgrade(dconn));
    }

    /// Detaches the stream data but leaves the record in place; the
    /// engine's stream-close callback stays authoritative for deletion.
    pub fn remove_downstream_connection(&mut self, dconn: &Rc<RefCell<DownstreamConnection>>) {
        self.bridge.dconns.remove(&dconn.borrow().id());
        if let Some(stream_id) = dconn.borrow().stream_id() {
            if let Some(record) = self.bridge.streams.get_mut(&stream_id) {
                record.dconn = None;
            }
        }
        dconn.borrow_mut().detach_stream();
    }

    // ---- request submission --------------------------------------------

    /// Submits the downstream connection's request on a new stream.
    pub fn submit_request(&mut self, dconn: &Rc<RefCell<DownstreamConnection>>) -> Result<()> {
        if !self.can_push_request() {
            if self.check_state == ConnCheckState::Required {
                self.start_checking_connection();
            }
            return Err(SessionError::NotReady);
        }
        self.push_request_headers(dconn)?;
        self.signal_write();
        Ok(())
    }

    pub fn submit_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or(SessionError::InvalidState(self.state))?;
        tracing::debug!(stream_id, error_code = %error_code, "submitting RST_STREAM");
        engine.submit_rst_stream(stream_id, error_code);
        self.signal_write();
        Ok(())
    }

    /// Reserved interface: stream priority is currently not forwarded.
    pub fn submit_priority(
        &mut self,
        _dconn: &Rc<RefCell<DownstreamConnection>>,
        _priority: i32,
    ) -> Result<()> {
        if self.state != State::Connected {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(())
    }

    /// Wakes a deferred request body. Idempotent, including for streams
    /// that already finished.
    pub fn resume_data(&mut self, dconn: &Rc<RefCell<DownstreamConnection>>) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or(SessionError::InvalidState(self.state))?;
        if let Some(stream_id) = dconn.borrow().stream_id() {
            engine.resume_data(stream_id);
        }
        self.signal_write();
        Ok(())
    }

    fn push_request_headers(&mut self, dconn: &Rc<RefCell<DownstreamConnection>>) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or(SessionError::InvalidState(self.state))?;

        let (headers, has_body, key) = {
            let d = dconn.borrow();
            (
                build_request_headers(&d, self.cfg.no_tls),
                d.has_pending_upload(),
                d.id(),
            )
        };
        let body: Option<Box<dyn crate::h2::BodySource>> = if has_body {
            Some(Box::new(DconnBodySource::new(dconn)))
        } else {
            None
        };

        let stream_id = engine.submit_request(&headers, body, key)?;
        dconn.borrow_mut().set_stream_id(stream_id);
        self.bridge.streams.insert(
            stream_id,
            StreamRecord {
                dconn: Some(Rc::downgrade(dconn)),
            },
        );
        tracing::debug!(stream_id, dconn = key, "request submitted");
        Ok(())
    }

    // ---- connection establishment --------------------------------------

    pub fn initiate_connection(&mut self) -> Result<()> {
        if self.cfg.proxy.is_some() && self.state == State::Disconnected {
            let proxy = self.cfg.proxy.clone().expect("checked above");
            tracing::info!(host = %proxy.host, addr = %proxy.addr, "connecting to proxy");

            let transport = self.connector.connect(&proxy.addr)?;
            self.wire = Wire::Plain(transport);

            self.write_interest = true;
            self.timers.reset(TimerKind::Write);

            self.write_role = WriteRole::Connected;
            self.on_read_role = OnReadRole::ProxyResponse;
            self.on_write_role = OnWriteRole::ProxyConnect;
            self.proxy_parser = Some(ResponseHeadParser::new());
            self.state = State::ProxyConnecting;
            return Ok(());
        }

        if self.state == State::Disconnected || self.state == State::ProxyConnected {
            tracing::info!(addr = %self.cfg.backend.addr, "connecting to backend");
            if self.tls_ctx.is_some() {
                // With a tunnel the transport already exists; otherwise
                // open a fresh one, then wrap it in TLS either way.
                let transport = match std::mem::replace(&mut self.wire, Wire::None) {
                    Wire::Plain(t) if self.state == State::ProxyConnected => t,
                    _ => self.connector.connect(&self.cfg.backend.addr)?,
                };
                let tls_ctx = self.tls_ctx.as_ref().expect("checked above");
                let tls = tls_ctx.start_connect(self.cfg.sni_name(), transport)?;
                self.wire = Wire::Tls(tls);
            } else if self.state == State::Disconnected {
                // Clear text, no proxy.
                let transport = self.connector.connect(&self.cfg.backend.addr)?;
                self.wire = Wire::Plain(transport);
            } else {
                // Clear text through the established tunnel: go straight
                // to the connected protocol.
                self.read_role = ReadRole::Io;
                self.write_role = WriteRole::Io;
                self.on_read_role = OnReadRole::H2;
                self.on_write_role = OnWriteRole::H2;
                if let Err(e) = self.on_connect() {
                    self.state = State::ConnectFailing;
                    return Err(e);
                }
                self.timers.reset(TimerKind::Read);
                return Ok(());
            }

            self.write_role = WriteRole::Connected;
            self.on_read_role = OnReadRole::H2;
            self.on_write_role = OnWriteRole::H2;

            self.state = State::Connecting;
            self.write_interest = true;
            self.timers.reset(TimerKind::Write);
            return Ok(());
        }

        tracing::error!(state = ?self.state, "initiate_connection in invalid state");
        Err(SessionError::InvalidState(self.state))
    }

    /// The writable event completing an asynchronous connect.
    fn connected(&mut self) -> Result<()> {
        if let Some(t) = self.wire.transport_mut() {
            t.check_connected()?;
        } else {
            return Err(SessionError::Transport);
        }
        tracing::debug!("connection established");

        self.read_interest = true;

        if let Wire::Tls(tls) = &self.wire {
            if !tls.handshake_done() {
                self.read_role = ReadRole::TlsHandshake;
                self.write_role = WriteRole::TlsHandshake;
                return self.tls_handshake();
            }
        }

        self.read_role = ReadRole::Io;
        self.write_role = WriteRole::Io;

        if self.state == State::ProxyConnecting {
            return self.write_io();
        }

        if let Err(e) = self.on_connect() {
            self.state = State::ConnectFailing;
            return Err(e);
        }
        Ok(())
    }

    fn tls_handshake(&mut self) -> Result<()> {
        self.timers.reset(TimerKind::Read);

        let Wire::Tls(tls) = &mut self.wire else {
            return Err(SessionError::Transport);
        };
        match tls.handshake_step()? {
            HandshakeStatus::WantRead => {
                self.write_interest = false;
                self.timers.cancel(TimerKind::Write);
                Ok(())
            }
            HandshakeStatus::WantWrite => {
                self.write_interest = true;
                self.timers.reset(TimerKind::Write);
                Ok(())
            }
            HandshakeStatus::Done => {
                self.write_interest = false;
                self.timers.cancel(TimerKind::Write);
                if tls.session_reused() {
                    tracing::debug!("TLS session reused");
                }
                tracing::debug!("TLS handshake completed");

                tls.negotiated_h2()?;
                if !self.cfg.insecure {
                    tls.check_cert()?;
                }

                self.read_role = ReadRole::Io;
                self.write_role = WriteRole::Io;

                if let Err(e) = self.on_connect() {
                    self.state = State::ConnectFailing;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// The transport is ready for HTTP/2: build the engine, write the
    /// preface, advertise settings, and flush whatever requests piled up
    /// while we were connecting.
    fn on_connect(&mut self) -> Result<()> {
        self.state = State::Connected;
        tracing::info!(addr = %self.cfg.backend.addr, "backend session connected");

        let mut engine = Engine::new_client(Settings::new(), self.cfg.padding > 0);

        let settings = Settings {
            enable_push: Some(false),
            max_concurrent_streams: Some(self.cfg.max_concurrent_streams),
            initial_window_size: Some(self.cfg.initial_window_size()),
            ..Settings::new()
        };
        engine.submit_settings(settings)?;

        if let Some(delta) = self.cfg.connection_window_delta() {
            engine.submit_window_update(crate::h2::CONNECTION_STREAM_ID, delta)?;
        }

        if self.wb.write(CONNECTION_PREFACE) != CONNECTION_PREFACE.len() {
            tracing::error!("outbound buffer too small for connection preface");
            return Err(SessionError::BufferOverflow);
        }

        let inadequate = match &self.wire {
            Wire::Tls(tls) => !tls.check_h2_requirement(),
            _ => false,
        };
        if inadequate {
            tracing::warn!("negotiated TLS parameters inadequate for HTTP/2");
            engine.terminate(ErrorCode::InadequateSecurity);
            self.engine = Some(engine);
            self.signal_write();
            return Ok(());
        }

        self.engine = Some(engine);
        self.timers.reset(TimerKind::ConnCheck);

        self.submit_pending_requests();
        self.signal_write();
        Ok(())
    }

    /// Pushes every attached downstream connection that is waiting for a
    /// stream; submission failures abort the upstream request with 400.
    fn submit_pending_requests(&mut self) {
        let pending: Vec<Rc<RefCell<DownstreamConnection>>> = self
            .bridge
            .dconns
            .values()
            .filter_map(|weak| weak.upgrade())
            .filter(|rc| rc.borrow().stream_id().is_none())
            .collect();

        for rc in pending {
            match self.push_request_headers(&rc) {
                Ok(()) => {
                    let up = rc.borrow().upstream_rc();
                    if let Some(up) = up {
                        let mut d = rc.borrow_mut();
                        up.borrow_mut().resume_read(&mut d);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "backend request failed");
                    let up = rc.borrow().upstream_rc();
                    if let Some(up) = up {
                        let mut d = rc.borrow_mut();
                        up.borrow_mut().on_downstream_abort_request(&mut d, 400);
                    }
                }
            }
        }
    }

    // ---- liveness ------------------------------------------------------

    /// Called on every I/O event: pushes the idle check out, and if a
    /// check was pending, declares the connection alive and resubmits
    /// whatever was held back.
    pub fn connection_alive(&mut self) {
        if self.state != State::Connected {
            return;
        }
        self.timers.reset(TimerKind::ConnCheck);

        if self.check_state == ConnCheckState::None {
            return;
        }
        tracing::info!("backend connection alive");
        self.check_state = ConnCheckState::None;

        let pending: Vec<Rc<RefCell<DownstreamConnection>>> = self
            .bridge
            .dconns
            .values()
            .filter_map(|weak| weak.upgrade())
            .filter(|rc| {
                let d = rc.borrow();
                d.stream_id().is_none()
                    && matches!(
                        d.request_state(),
                        MsgState::HeaderComplete | MsgState::MsgComplete
                    )
                    && d.response_state() == MsgState::Initial
            })
            .collect();

        for rc in pending {
            match self.push_request_headers(&rc) {
                Ok(()) => {
                    self.signal_write();
                    let up = rc.borrow().upstream_rc();
                    if let Some(up) = up {
                        let mut d = rc.borrow_mut();
                        up.borrow_mut().resume_read(&mut d);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "backend request failed");
                    let up = rc.borrow().upstream_rc();
                    if let Some(up) = up {
                        let mut d = rc.borrow_mut();
                        up.borrow_mut().on_downstream_abort_request(&mut d, 400);
                    }
                }
            }
        }
    }

    /// REQUIRED -> STARTED: one PING probes the idle connection.
    pub fn start_checking_connection(&mut self) {
        if self.state != State::Connected || self.check_state != ConnCheckState::Required {
            return;
        }
        self.check_state = ConnCheckState::Started;
        tracing::info!("checking backend connection with PING");
        if let Some(engine) = self.engine.as_mut() {
            engine.submit_ping();
        }
        self.signal_write();
    }

    // ---- event-loop surface --------------------------------------------

    /// Ask the prepare hook to run the write path this tick.
    pub fn signal_write(&mut self) {
        self.write_requested = true;
    }

    pub fn clear_write_request(&mut self) {
        self.write_requested = false;
    }

    /// Once-per-tick hook: coalesces any number of `signal_write` calls
    /// into at most one write pass (or a connection attempt).
    pub fn prepare(&mut self) {
        if !self.write_requested {
            return;
        }
        self.write_requested = false;
        match self.state {
            State::Disconnected => {
                tracing::info!("write requested, starting backend connection");
                if self.initiate_connection().is_err() {
                    tracing::error!("could not initiate backend connection");
                    self.disconnect(true);
                }
            }
            State::Connected => {
                self.connection_alive();
                if self.do_write().is_err() {
                    let hard = self.should_hard_fail();
                    self.disconnect(hard);
                }
            }
            _ => {}
        }
    }

    pub fn on_readable(&mut self) {
        self.connection_alive();
        if let Err(e) = self.do_read() {
            tracing::debug!(error = %e, "read side failed");
            let hard = self.should_hard_fail();
            self.disconnect(hard);
        }
    }

    pub fn on_writable(&mut self) {
        self.clear_write_request();
        self.connection_alive();
        if let Err(e) = self.do_write() {
            tracing::debug!(error = %e, "write side failed");
            let hard = self.should_hard_fail();
            self.disconnect(hard);
        }
    }

    /// Fires expired timers. The embedding loop calls this after waking
    /// up at `next_deadline`.
    pub fn poll_timers(&mut self) {
        for kind in self.timers.take_expired() {
            self.handle_timeout(kind);
        }
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    pub fn handle_timeout(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Read | TimerKind::Write => {
                tracing::info!(timer = ?kind, state = ?self.state, "backend I/O timeout");
                let hard = self.state == State::Connecting;
                self.disconnect(hard);
            }
            TimerKind::SettingsAck => {
                tracing::info!("SETTINGS timeout");
                match self.engine.as_mut() {
                    Some(engine) => {
                        engine.terminate(ErrorCode::SettingsTimeout);
                        self.signal_write();
                    }
                    None => self.disconnect(false),
                }
            }
            TimerKind::ConnCheck => {
                tracing::info!("connection check required");
                self.check_state = ConnCheckState::Required;
            }
        }
    }

    // ---- I/O engine ----------------------------------------------------

    fn do_read(&mut self) -> Result<()> {
        match self.read_role {
            ReadRole::Noop => Ok(()),
            ReadRole::TlsHandshake => self.tls_handshake(),
            ReadRole::Io => self.read_io(),
        }
    }

    fn do_write(&mut self) -> Result<()> {
        match self.write_role {
            WriteRole::Noop => Ok(()),
            WriteRole::Connected => self.connected(),
            WriteRole::TlsHandshake => self.tls_handshake(),
            WriteRole::Io => self.write_io(),
        }
    }

    fn read_io(&mut self) -> Result<()> {
        self.timers.reset(TimerKind::Read);

        loop {
            // Dispatch buffered bytes before reading more, so an EOF can
            // never clobber data already received.
            if !self.rb.is_empty() {
                self.dispatch_on_read()?;
                if !self.rb.is_empty() {
                    return Ok(());
                }
            }

            let space = self.rb.space();
            if space.is_empty() {
                return Ok(());
            }
            let Some(t) = self.wire.transport_mut() else {
                return Err(SessionError::Transport);
            };
            let (n, result) = read_step(t, space);
            if n > 0 {
                self.rb.fill(n);
            }
            match result {
                SocketResult::Continue => {}
                SocketResult::WouldBlock => {
                    if !self.rb.is_empty() {
                        self.dispatch_on_read()?;
                    }
                    return Ok(());
                }
                SocketResult::Closed => return Err(SessionError::Eof),
                SocketResult::Error => return Err(SessionError::Transport),
            }
        }
    }

    fn write_io(&mut self) -> Result<()> {
        self.timers.reset(TimerKind::Read);

        loop {
            if !self.wb.is_empty() {
                let Some(t) = self.wire.transport_mut() else {
                    return Err(SessionError::Transport);
                };
                let (n, result) = write_step(t, self.wb.data());
                if n > 0 {
                    self.wb.consume(n);
                }
                match result {
                    SocketResult::Continue => continue,
                    SocketResult::WouldBlock => {
                        self.write_interest = true;
                        self.timers.reset(TimerKind::Write);
                        return Ok(());
                    }
                    SocketResult::Closed | SocketResult::Error => {
                        return Err(SessionError::Transport)
                    }
                }
            }

            self.dispatch_on_write()?;
            if self.wb.is_empty() {
                break;
            }
        }

        self.write_interest = false;
        self.timers.cancel(TimerKind::Write);
        Ok(())
    }

    fn dispatch_on_read(&mut self) -> Result<()> {
        match self.on_read_role {
            OnReadRole::Noop => {
                self.rb.clear();
                Ok(())
            }
            OnReadRole::ProxyResponse => self.proxy_read(),
            OnReadRole::H2 => self.h2_read(),
        }
    }

    fn dispatch_on_write(&mut self) -> Result<()> {
        match self.on_write_role {
            OnWriteRole::Noop => Ok(()),
            OnWriteRole::ProxyConnect => self.proxy_write_connect(),
            OnWriteRole::H2 => self.h2_write(),
        }
    }

    // ---- proxy tunnel submachine ---------------------------------------

    /// Emits the CONNECT request towards the forward proxy.
    fn proxy_write_connect(&mut self) -> Result<()> {
        let proxy = self.cfg.proxy.clone().ok_or(SessionError::Transport)?;
        tracing::debug!("connected to the proxy, sending CONNECT");

        let mut req = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            self.cfg.backend.hostport, self.cfg.backend.host
        );
        if let Some(userinfo) = &proxy.userinfo {
            req.push_str("Proxy-Authorization: Basic ");
            req.push_str(&base64_encode(userinfo.as_bytes()));
            req.push_str("\r\n");
        }
        req.push_str("\r\n");

        if self.wb.write(req.as_bytes()) != req.len() {
            tracing::warn!("proxy CONNECT request is too large");
            return Err(SessionError::BufferOverflow);
        }
        self.on_write_role = OnWriteRole::Noop;
        Ok(())
    }

    /// Feeds proxy response bytes to the HTTP/1 parser and advances the
    /// tunnel state machine on completion.
    fn proxy_read(&mut self) -> Result<()> {
        let parser = self.proxy_parser.as_mut().ok_or(SessionError::Transport)?;
        let status = parser.feed(self.rb.data())?;
        self.rb.clear();

        let Some(status) = status else {
            return Ok(());
        };
        if status == 200 {
            tracing::info!("tunneling success");
            self.state = State::ProxyConnected;
            // Layer TLS over the tunnel, or finalize in clear text.
            self.initiate_connection()
        } else {
            tracing::warn!(status, "tunneling failed");
            self.state = State::ProxyFailed;
            Err(SessionError::ProxyRejected(status))
        }
    }

    // ---- h2 bridge I/O -------------------------------------------------

    fn h2_read(&mut self) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or(SessionError::InvalidState(self.state))?;

        let data = self.rb.data().to_vec();
        let consumed = engine.mem_recv(&data, &mut self.bridge).map_err(|e| {
            tracing::error!(error = %e, "engine receive error");
            e
        })?;
        self.rb.consume(consumed);
        self.apply_post_ops();

        self.check_quiesced()?;
        self.signal_write();
        Ok(())
    }

    fn h2_write(&mut self) -> Result<()> {
        // The pending tail has absolute priority; bytes handed out by the
        // engine are never reordered or dropped.
        if let Some(tail) = self.pending_tail.take() {
            let n = self.wb.write(&tail);
            if n < tail.len() {
                self.pending_tail = Some(tail.slice(n..));
                return Ok(());
            }
        }

        let engine = self
            .engine
            .as_mut()
            .ok_or(SessionError::InvalidState(self.state))?;
        while let Some(chunk) = engine.mem_send(&mut self.bridge) {
            let n = self.wb.write(&chunk);
            if n < chunk.len() {
                self.pending_tail = Some(chunk.slice(n..));
                break;
            }
        }
        self.apply_post_ops();

        self.check_quiesced()
    }

    /// A session with nothing to read, nothing to write and nothing
    /// buffered is finished; surface that as an error so the I/O path
    /// tears it down.
    fn check_quiesced(&self) -> Result<()> {
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };
        if !engine.want_read()
            && !engine.want_write()
            && self.wb.is_empty()
            && self.pending_tail.is_none()
        {
            tracing::debug!("no more read/write for this session");
            return Err(SessionError::Quiesced);
        }
        Ok(())
    }

    fn apply_post_ops(&mut self) {
        let ops: Vec<PostOp> = self.bridge.ops.drain(..).collect();
        for op in ops {
            match op {
                PostOp::StartSettingsTimer => self.timers.reset(TimerKind::SettingsAck),
                PostOp::StopSettingsTimer => self.timers.cancel(TimerKind::SettingsAck),
                PostOp::ResumeUpload(stream_id) => {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.resume_data(stream_id);
                    }
                }
            }
        }
    }

    // ---- teardown ------------------------------------------------------

    /// Tears the connection down and notifies every affected upstream
    /// handler. `hard` tells handlers to abort instead of re-queueing.
    /// Idempotent.
    pub fn disconnect(&mut self, hard: bool) {
        tracing::info!(hard, state = ?self.state, "disconnecting backend session");

        self.engine = None;
        self.rb.clear();
        self.wb.clear();
        self.pending_tail = None;

        self.timers.cancel_all();

        self.read_role = ReadRole::Noop;
        self.write_role = WriteRole::Noop;
        self.on_read_role = OnReadRole::Noop;
        self.on_write_role = OnWriteRole::Noop;
        self.read_interest = false;
        self.write_interest = false;
        self.write_requested = false;

        match std::mem::replace(&mut self.wire, Wire::None) {
            Wire::None => {}
            Wire::Plain(mut t) => t.shutdown(),
            Wire::Tls(mut t) => {
                t.send_shutdown();
                Transport::shutdown(&mut t);
            }
        }

        self.proxy_parser = None;
        self.check_state = ConnCheckState::None;
        self.state = State::Disconnected;

        // Swap the live sets out before notifying: handlers may attach
        // replacement downstream connections during the callbacks, and
        // those must land in the fresh sets and survive this teardown.
        let dconns: Vec<Weak<RefCell<DownstreamConnection>>> =
            std::mem::take(&mut self.bridge.dconns).into_values().collect();
        let streams = std::mem::take(&mut self.bridge.streams);

        let mut handlers: Vec<Rc<RefCell<dyn UpstreamHandler>>> = Vec::new();
        for weak in &dconns {
            let Some(rc) = weak.upgrade() else { continue };
            let Some(up) = rc.borrow().upstream_rc() else {
                continue;
            };
            if !handlers.iter().any(|h| Rc::ptr_eq(h, &up)) {
                handlers.push(up);
            }
        }

        let mut reattach: Vec<Rc<RefCell<DownstreamConnection>>> = Vec::new();
        for handler in handlers {
            let delete = handler.borrow_mut().on_downstream_reset(hard, &mut reattach);
            if delete {
                tracing::debug!("upstream handler asked to be dropped");
            }
        }
        for dconn in reattach {
            dconn.borrow_mut().detach_stream();
            self.add_downstream_connection(&dconn);
        }

        // Stream records die with the connection attempt.
        drop(streams);
        for weak in dconns {
            if let Some(rc) = weak.upgrade() {
                rc.borrow_mut().detach_stream();
            }
        }
    }
}

// ---- helpers -----------------------------------------------------------

/// `:status` must be exactly three digits and at least 100.
fn parse_status_code(value: &str) -> Option<u16> {
    if value.len() != 3 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u16 = value.parse().ok()?;
    (code >= 100).then_some(code)
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn valid_header_pair(name: &[u8], value: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }
    let name_ok = name.iter().enumerate().all(|(i, &b)| {
        (b == b':' && i == 0)
            || b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || matches!(b, b'-' | b'_' | b'.' | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
                | b'+' | b'^' | b'`' | b'|' | b'~')
    });
    let value_ok = value.iter().all(|&b| b != b'\r' && b != b'\n' && b != 0);
    name_ok && value_ok
}

/// Connection-specific headers have no place in HTTP/2 responses.
fn connection_specific(name: &[u8]) -> bool {
    const DISALLOWED: [&[u8]; 5] = [
        b"connection",
        b"keep-alive",
        b"proxy-connection",
        b"transfer-encoding",
        b"upgrade",
    ];
    DISALLOWED.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn build_request_headers(d: &DownstreamConnection, no_tls: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    headers.push((b":method".to_vec(), d.request.method.as_bytes().to_vec()));
    if d.request.method != "CONNECT" {
        let scheme = if no_tls { "http" } else { "https" };
        headers.push((b":scheme".to_vec(), scheme.as_bytes().to_vec()));
        headers.push((b":path".to_vec(), d.request.path.as_bytes().to_vec()));
    }
    headers.push((
        b":authority".to_vec(),
        d.request.authority.as_bytes().to_vec(),
    ));
    for (name, value) in &d.request.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || connection_specific(lower.as_bytes()) || lower == "te" {
            continue;
        }
        headers.push((lower.into_bytes(), value.as_bytes().to_vec()));
    }
    headers
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard base64 with padding, for Proxy-Authorization.
fn base64_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3F] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3F] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3F] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3F] as char
        } else {
            '='
        });
    }
    out
}
