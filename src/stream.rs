//! Per-stream state (RFC 9113 Section 5.1).

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::body::BodyChunk;
use crate::error::StreamError;
use crate::flow::{FlowWindow, InflowWindow};
use crate::handler::Request;

/// Stream states a server can observe. `Idle` streams are never stored;
/// the reserved states only exist with server push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether the peer may still send DATA or trailers.
    pub fn can_recv(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }

    /// Whether we may still send.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRemote)
    }

    /// END_STREAM received from the peer.
    pub fn recv_end_stream(self) -> Self {
        match self {
            Self::Idle => Self::HalfClosedRemote,
            Self::Open => Self::HalfClosedRemote,
            Self::HalfClosedLocal => Self::Closed,
            other => other,
        }
    }

    /// END_STREAM sent by us.
    pub fn send_end_stream(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedLocal,
            Self::HalfClosedRemote => Self::Closed,
            other => other,
        }
    }
}

/// Where the application handler for a stream stands.
#[derive(Debug)]
pub(crate) enum HandlerSlot {
    /// Waiting for a free handler slot; the request is held until then.
    Queued(Box<Request>),
    Running,
    Finished,
    /// No handler is attached (refused or answered by the connection).
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseState {
    Pending,
    HeadersSent,
    Done,
}

/// A handler write waiting for flow-control credit.
#[derive(Debug)]
pub(crate) struct PendingData {
    pub data: Bytes,
    pub end_stream: bool,
    pub done: Option<oneshot::Sender<Result<(), StreamError>>>,
}

impl PendingData {
    pub fn complete(&mut self, result: Result<(), StreamError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub content_length: Option<u64>,
    pub received: u64,
    /// Sender side of the handler's body channel, dropped once the body
    /// ended or the handler stopped reading.
    pub body_tx: Option<mpsc::UnboundedSender<BodyChunk>>,
    /// Bytes pushed into the body channel that the handler has not read.
    pub buffered: u32,
    pub recv_window: InflowWindow,
    pub send_window: FlowWindow,
    pub handler: HandlerSlot,
    pub response: ResponseState,
    pub pending: Option<PendingData>,
    /// Terminal error handed to any later handler write.
    pub reset: Option<StreamError>,
    /// Whether we sent RST_STREAM, so late frames from the peer are expected.
    pub reset_sent: bool,
    pub deadline: Option<Instant>,
}

impl Stream {
    pub fn new(id: u32, recv_window: InflowWindow, send_window: FlowWindow) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            content_length: None,
            received: 0,
            body_tx: None,
            buffered: 0,
            recv_window,
            send_window,
            handler: HandlerSlot::Detached,
            response: ResponseState::Pending,
            pending: None,
            reset: None,
            reset_sent: false,
            deadline: None,
        }
    }

    pub fn recv_end_stream(&mut self) {
        self.state = self.state.recv_end_stream();
    }

    pub fn send_end_stream(&mut self) {
        self.response = ResponseState::Done;
        self.state = self.state.send_end_stream();
    }

    /// Push a chunk to the handler. Returns false if nobody is reading.
    pub fn deliver(&mut self, chunk: BodyChunk) -> bool {
        match &self.body_tx {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Close the body channel with a terminal chunk.
    pub fn finish_body(&mut self, chunk: BodyChunk) {
        if let Some(tx) = self.body_tx.take() {
            let _ = tx.send(chunk);
        }
    }

    /// Move to `Closed` and fail every party still waiting on the stream.
    /// Returns the bytes that were buffered for the handler.
    pub fn close_with(&mut self, error: StreamError) -> u32 {
        self.state = StreamState::Closed;
        self.finish_body(BodyChunk::Error(error.clone()));
        if let Some(mut pending) = self.pending.take() {
            pending.complete(Err(error.clone()));
        }
        if let HandlerSlot::Queued(_) = self.handler {
            self.handler = HandlerSlot::Detached;
        }
        self.reset = Some(error);
        std::mem::take(&mut self.buffered)
    }

    /// A stream stays in the table while its handler is still running or
    /// queued, even after both directions closed.
    pub fn is_removable(&self) -> bool {
        self.state == StreamState::Closed
            && matches!(self.handler, HandlerSlot::Finished | HandlerSlot::Detached)
    }

    pub fn is_live(&self) -> bool {
        self.state != StreamState::Closed
    }

    pub fn handler_finished(&self) -> bool {
        matches!(self.handler, HandlerSlot::Finished | HandlerSlot::Detached)
    }

    /// Error for a handler write that arrives after the stream went away.
    pub fn write_error(&self) -> Option<StreamError> {
        if let Some(e) = &self.reset {
            return Some(e.clone());
        }
        if self.response == ResponseState::Done || !self.state.can_send() {
            return Some(StreamError::InvalidState("response already complete"));
        }
        None
    }
}
