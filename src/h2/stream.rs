//! Per-stream engine state
//!
//! The engine tracks what the protocol needs per stream: both half-close
//! directions, the send and receive windows, and the opaque user-data slot
//! the session uses to find its own stream record from a callback.

use super::error::{EngineError, Result};
use super::flow_control::FlowControlWindow;
use std::collections::HashMap;

pub type StreamId = u32;

#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    /// We sent END_STREAM.
    pub send_closed: bool,
    /// The peer sent END_STREAM or RST_STREAM.
    pub recv_closed: bool,
    /// A locally submitted RST_STREAM is queued or sent.
    pub rst_queued: bool,
    /// First response HEADERS seen; later blocks are HCAT-style trailers
    /// or final responses after 1xx.
    pub response_headers_seen: bool,
    /// A header callback vetoed this stream's current header block.
    pub header_veto: bool,
    /// Body production is paused until `resume_data`.
    pub deferred: bool,
    pub send_window: FlowControlWindow,
    pub recv_window: FlowControlWindow,
    user_data: u64,
}

impl H2Stream {
    fn new(id: StreamId, send_initial: u32, recv_initial: u32, user_data: u64) -> Self {
        H2Stream {
            id,
            send_closed: false,
            recv_closed: false,
            rst_queued: false,
            response_headers_seen: false,
            header_veto: false,
            deferred: false,
            send_window: FlowControlWindow::with_initial_size(send_initial),
            recv_window: FlowControlWindow::with_initial_size(recv_initial),
            user_data,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Both directions are done; the stream is ready to be dropped.
    pub fn fully_closed(&self) -> bool {
        self.send_closed && self.recv_closed
    }
}

/// All open streams of one client connection. Local stream IDs are odd
/// and allocated in order.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<StreamId, H2Stream>,
    next_stream_id: StreamId,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable {
            streams: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub fn open_local(
        &mut self,
        send_initial: u32,
        recv_initial: u32,
        user_data: u64,
        max_concurrent: Option<u32>,
    ) -> Result<StreamId> {
        if let Some(max) = max_concurrent {
            if self.streams.len() >= max as usize {
                return Err(EngineError::StreamLimit);
            }
        }
        if self.next_stream_id > 0x7FFF_FFFF - 2 {
            return Err(EngineError::Closing);
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        self.streams
            .insert(id, H2Stream::new(id, send_initial, recv_initial, user_data));
        Ok(id)
    }

    pub fn get(&self, id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Applies a peer SETTINGS_INITIAL_WINDOW_SIZE change to every open
    /// stream's send window.
    pub fn update_send_initial_size(&mut self, new_size: u32) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.send_window.update_initial_size(new_size)?;
        }
        Ok(())
    }
}
