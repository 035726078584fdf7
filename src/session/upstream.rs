//! Upstream collaborator surface
//!
//! A `DownstreamConnection` is the session-side record of one in-flight
//! backend request. It is owned by the upstream request handler (the
//! client-facing side of the proxy); the session only keeps weak
//! references, so a handler going away never dangles into the session.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::h2::engine::{BodyChunk, BodySource};
use crate::h2::{ErrorCode, StreamId};

/// Message progress, request or response side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    Initial,
    HeaderComplete,
    MsgComplete,
    /// The message was cut short; the upstream should retry or abort.
    MsgReset,
    /// The response headers themselves were unacceptable.
    MsgBadHeader,
}

/// What the upstream handler exposes to the session.
///
/// `on_downstream_reset` may attach replacement requests through the
/// `reattach` list; they survive the teardown in progress and stay
/// pending for the next connection attempt. Returning `true` asks for
/// the handler itself to be dropped.
pub trait UpstreamHandler {
    fn on_downstream_header_complete(&mut self, dconn: &mut DownstreamConnection)
        -> Result<(), ()>;

    fn on_downstream_body(
        &mut self,
        dconn: &mut DownstreamConnection,
        data: &[u8],
    ) -> Result<(), ()>;

    fn on_downstream_body_complete(&mut self, dconn: &mut DownstreamConnection)
        -> Result<(), ()>;

    fn on_downstream_abort_request(&mut self, dconn: &mut DownstreamConnection, status: u16);

    /// Unblock reads on the upstream connection.
    fn resume_read(&mut self, dconn: &mut DownstreamConnection);

    /// Post-event notification; an error drops the handler.
    fn downstream_read(&mut self, dconn: &mut DownstreamConnection) -> Result<(), ()>;

    fn on_downstream_reset(
        &mut self,
        hard: bool,
        reattach: &mut Vec<Rc<RefCell<DownstreamConnection>>>,
    ) -> bool;
}

/// The request as the upstream parsed it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// HTTP version the upstream client spoke.
    pub major: u8,
    pub minor: u8,
    /// The request carried an Upgrade intent.
    pub upgrade: bool,
}

impl RequestHead {
    /// A plain HTTP/1.1 request head with no extra headers.
    pub fn new(method: &str, authority: &str, path: &str) -> Self {
        RequestHead {
            method: method.to_string(),
            scheme: "http".to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            major: 1,
            minor: 1,
            upgrade: false,
        }
    }
}

static NEXT_DCONN_ID: AtomicU64 = AtomicU64::new(1);

/// One in-flight backend request.
pub struct DownstreamConnection {
    id: u64,
    upstream: Option<Rc<RefCell<dyn UpstreamHandler>>>,

    pub request: RequestHead,
    request_state: MsgState,
    request_body: VecDeque<Bytes>,
    request_body_complete: bool,

    stream_id: Option<StreamId>,

    response_state: MsgState,
    response_status: u16,
    response_headers: Vec<(String, String)>,
    response_headers_sum: usize,
    response_content_length: Option<u64>,
    response_body_len: u64,
    expect_final_response: bool,
    chunked_response: bool,
    response_connection_close: bool,
    upgraded: bool,
    rst_error_code: Option<ErrorCode>,

    /// Read-idle touches; the upstream maps these onto its own timer.
    read_timer_touches: u32,
}

impl DownstreamConnection {
    pub fn new(request: RequestHead) -> Self {
        DownstreamConnection {
            id: NEXT_DCONN_ID.fetch_add(1, Ordering::Relaxed),
            upstream: None,
            request,
            request_state: MsgState::Initial,
            request_body: VecDeque::new(),
            request_body_complete: false,
            stream_id: None,
            response_state: MsgState::Initial,
            response_status: 0,
            response_headers: Vec::new(),
            response_headers_sum: 0,
            response_content_length: None,
            response_body_len: 0,
            expect_final_response: false,
            chunked_response: false,
            response_connection_close: false,
            upgraded: false,
            rst_error_code: None,
            read_timer_touches: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn attach_upstream(&mut self, upstream: Rc<RefCell<dyn UpstreamHandler>>) {
        self.upstream = Some(upstream);
    }

    pub fn clear_upstream(&mut self) {
        self.upstream = None;
    }

    pub fn upstream_rc(&self) -> Option<Rc<RefCell<dyn UpstreamHandler>>> {
        self.upstream.clone()
    }

    // -- stream linkage --

    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        self.stream_id = Some(stream_id);
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub fn detach_stream(&mut self) {
        self.stream_id = None;
    }

    // -- request side --

    pub fn request_state(&self) -> MsgState {
        self.request_state
    }

    pub fn set_request_state(&mut self, state: MsgState) {
        self.request_state = state;
    }

    /// Queue request body bytes for the backend stream.
    pub fn push_upload_data(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.request_body.push_back(data);
        }
    }

    /// No more request body will arrive.
    pub fn end_upload_data(&mut self) {
        self.request_body_complete = true;
    }

    pub fn upload_complete(&self) -> bool {
        self.request_body_complete
    }

    pub fn has_pending_upload(&self) -> bool {
        !self.request_body.is_empty() || !self.request_body_complete
    }

    /// Pull interface used by the engine's body source.
    pub fn take_upload_chunk(&mut self, max_len: usize) -> BodyChunk {
        match self.request_body.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len);
                    self.request_body.push_front(rest);
                }
                let end_stream = self.request_body.is_empty() && self.request_body_complete;
                BodyChunk::Chunk {
                    data: chunk,
                    end_stream,
                }
            }
            None if self.request_body_complete => BodyChunk::Chunk {
                data: Bytes::new(),
                end_stream: true,
            },
            None => BodyChunk::Deferred,
        }
    }

    // -- response side --

    pub fn response_state(&self) -> MsgState {
        self.response_state
    }

    pub fn set_response_state(&mut self, state: MsgState) {
        self.response_state = state;
    }

    pub fn response_status(&self) -> u16 {
        self.response_status
    }

    pub fn set_response_status(&mut self, status: u16) {
        self.response_status = status;
    }

    /// 1xx responses announce a final response still to come.
    pub fn non_final_response(&self) -> bool {
        (100..200).contains(&self.response_status)
    }

    pub fn expect_final_response(&self) -> bool {
        self.expect_final_response
    }

    pub fn set_expect_final_response(&mut self, expect: bool) {
        self.expect_final_response = expect;
    }

    pub fn add_response_header(&mut self, name: &[u8], value: &[u8]) {
        self.response_headers_sum += name.len() + value.len();
        self.response_headers.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }

    pub fn response_headers(&self) -> &[(String, String)] {
        &self.response_headers
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Hands the accumulated header batch to the caller and clears it.
    pub fn take_response_headers(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.response_headers)
    }

    pub fn response_headers_sum(&self) -> usize {
        self.response_headers_sum
    }

    pub fn response_content_length(&self) -> Option<u64> {
        self.response_content_length
    }

    pub fn set_response_content_length(&mut self, len: u64) {
        self.response_content_length = Some(len);
    }

    pub fn add_response_body_len(&mut self, len: usize) {
        self.response_body_len += len as u64;
    }

    pub fn response_body_len(&self) -> u64 {
        self.response_body_len
    }

    /// Whether a body can follow these response headers at all.
    pub fn expect_response_body(&self) -> bool {
        if self.request.method == "HEAD" {
            return false;
        }
        !matches!(self.response_status, 100..=199 | 204 | 304)
    }

    pub fn set_chunked_response(&mut self, chunked: bool) {
        self.chunked_response = chunked;
    }

    pub fn chunked_response(&self) -> bool {
        self.chunked_response
    }

    pub fn set_response_connection_close(&mut self, close: bool) {
        self.response_connection_close = close;
    }

    pub fn response_connection_close(&self) -> bool {
        self.response_connection_close
    }

    /// Checks whether the response fulfilled the request's upgrade
    /// intent: 101 for an Upgrade request, 2xx for CONNECT.
    pub fn check_upgrade_fulfilled(&mut self) {
        if self.request.method == "CONNECT" {
            self.upgraded = (200..300).contains(&self.response_status);
        } else if self.request.upgrade {
            self.upgraded = self.response_status == 101;
        }
    }

    pub fn upgraded(&self) -> bool {
        self.upgraded
    }

    pub fn set_rst_error_code(&mut self, code: ErrorCode) {
        self.rst_error_code = Some(code);
    }

    pub fn rst_error_code(&self) -> Option<ErrorCode> {
        self.rst_error_code
    }

    pub fn reset_read_timer(&mut self) {
        self.read_timer_touches += 1;
    }

    pub fn read_timer_touches(&self) -> u32 {
        self.read_timer_touches
    }
}

/// Adapts a downstream connection's upload queue to the engine's pull
/// interface. Holds a weak reference: if the handler dropped the request,
/// the stream ends instead of stalling.
pub struct DconnBodySource {
    dconn: Weak<RefCell<DownstreamConnection>>,
}

impl DconnBodySource {
    pub fn new(dconn: &Rc<RefCell<DownstreamConnection>>) -> Self {
        DconnBodySource {
            dconn: Rc::downgrade(dconn),
        }
    }
}

impl BodySource for DconnBodySource {
    fn pull(&mut self, max_len: usize) -> BodyChunk {
        match self.dconn.upgrade() {
            Some(rc) => rc.borrow_mut().take_upload_chunk(max_len),
            None => BodyChunk::Chunk {
                data: Bytes::new(),
                end_stream: true,
            },
        }
    }
}
