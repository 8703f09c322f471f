//! The per-connection state machine.
//!
//! One [`Connection`] owns every piece of mutable connection and stream
//! state. Three kinds of tasks surround it and talk to it only through
//! channels:
//!
//! - a reader task decoding frames off the transport into a bounded channel,
//! - a writer task flushing encoded batches produced by the [`WriteQueue`],
//! - one task per request running the application [`Handler`], which sends
//!   [`Event`]s back through its [`ResponseWriter`] and [`RequestBody`].
//!
//! Frames are processed one at a time in arrival order. Stream-scoped
//! violations end in RST_STREAM; anything that corrupts shared state ends
//! the connection with GOAWAY.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::body::{BodyChunk, RequestBody};
use crate::config::{ServerConfig, Settings};
use crate::error::{ErrorCode, H2Error, HandlerError, ServeError, StreamError};
use crate::flow::{FlowWindow, InflowWindow, DEFAULT_WINDOW_SIZE};
use crate::frame::{header_block_frames, Frame, FrameCodec, FrameError, PrioritySpec, MAX_HEADER_BLOCK_SIZE};
use crate::handler::{Handler, Request, ResponseWriter};
use crate::hpack::{H2Header, HeaderBlockError, HeaderDecoder, HeaderEncoder, RequestHeadBuilder};
use crate::stream::{HandlerSlot, PendingData, ResponseState, Stream, StreamState};
use crate::writer::{writer_task, WriteQueue};

/// Inbound frames buffered between the reader task and the state machine.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Soft size of one batch handed to the writer task.
const WRITE_BATCH_SIZE: usize = 64 << 10;

/// Upper bound on CONTINUATION frames in a single header block.
const MAX_CONTINUATION_FRAMES: usize = 512;

/// Messages from handlers and [`ConnectionHandle`]s to the state machine.
#[derive(Debug)]
pub(crate) enum Event {
    Respond {
        stream_id: u32,
        status: u16,
        headers: Vec<H2Header>,
        end_stream: bool,
        done: oneshot::Sender<Result<(), StreamError>>,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        done: oneshot::Sender<Result<(), StreamError>>,
    },
    Trailers {
        stream_id: u32,
        trailers: Vec<H2Header>,
        done: oneshot::Sender<Result<(), StreamError>>,
    },
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
    BodyConsumed {
        stream_id: u32,
        len: u32,
    },
    BodyClosed {
        stream_id: u32,
    },
    HandlerFinished {
        stream_id: u32,
        result: Result<(), HandlerError>,
    },
    Shutdown,
    Stats(oneshot::Sender<ConnectionStats>),
    Ping(oneshot::Sender<Duration>),
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Entries in the stream table, including closed streams whose handler
    /// is still running.
    pub streams: usize,
    /// Streams counted against SETTINGS_MAX_CONCURRENT_STREAMS.
    pub live_streams: usize,
    pub running_handlers: usize,
    /// Requests waiting for a handler slot, including ones reset while
    /// waiting until the next slot frees.
    pub queued_handlers: usize,
    /// Highest stream id accepted for processing.
    pub last_stream_id: u32,
    /// DATA bytes received whose credit the consumer has not released yet.
    pub recv_window_outstanding: u64,
    pub send_window: i64,
    pub queued_control_frames: usize,
    pub going_away: bool,
}

/// Remote control for a running [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandle {
    /// Start a graceful shutdown: GOAWAY now, close once in-flight streams
    /// are done or the shutdown timeout elapses.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// `None` once the connection has stopped.
    pub async fn stats(&self) -> Option<ConnectionStats> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Send a PING and wait for the acknowledgement. Returns the round-trip
    /// time, or `None` if the connection closed first.
    pub async fn ping(&self) -> Option<Duration> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Ping(tx)).ok()?;
        rx.await.ok()
    }
}

/// Serve one HTTP/2 connection until it closes.
pub async fn serve_connection<T, H>(io: T, config: ServerConfig, handler: H) -> Result<(), ServeError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    let (connection, _handle) = Connection::new(io, config, handler);
    connection.run().await
}

/// A server connection that has not started yet.
pub struct Connection<T> {
    io: T,
    state: ConnState,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new<H: Handler>(io: T, config: ServerConfig, handler: H) -> (Self, ConnectionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            events: events_tx.clone(),
        };
        let state = ConnState::new(config, Arc::new(handler), events_tx);
        (Connection { io, state, events_rx }, handle)
    }

    /// Drive the connection. Returns `Ok` after a clean close (peer hung
    /// up, graceful shutdown) and the fatal error otherwise.
    pub async fn run(self) -> Result<(), ServeError> {
        let Connection {
            io,
            mut state,
            mut events_rx,
        } = self;
        state.config.validate()?;

        let (read_half, write_half) = tokio::io::split(io);
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_frames(read_half, state.config.max_frame_size, frames_tx));
        let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(1);
        let mut writer = tokio::spawn(writer_task(write_half, writer_rx));

        debug!("sending initial settings");
        state.send_preamble();

        let outcome = state
            .process(&mut frames_rx, &mut events_rx, &writer_tx, &mut writer)
            .await;
        reader.abort();

        let result = match outcome {
            Ok(()) => {
                state.flush(writer_tx, writer).await;
                Ok(())
            }
            Err(ServeError::Protocol { code, reason }) => {
                warn!(%code, %reason, last_stream_id = state.last_accepted, "connection error, sending GOAWAY");
                state.queue.push_control(Frame::GoAway {
                    last_stream_id: state.last_accepted,
                    error_code: code,
                    debug_data: Bytes::copy_from_slice(reason.as_bytes()),
                });
                state.flush(writer_tx, writer).await;
                Err(ServeError::Protocol { code, reason })
            }
            Err(e) => {
                warn!(error = %e, "closing connection");
                writer.abort();
                Err(e)
            }
        };
        state.teardown();
        debug!("connection finished");
        result
    }
}

async fn read_frames<R>(io: R, max_frame_size: u32, tx: mpsc::Sender<Result<Frame, FrameError>>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(io, FrameCodec::server(max_frame_size));
    while let Some(item) = frames.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

/// An incomplete header block waiting for CONTINUATION frames.
#[derive(Debug)]
struct HeaderBlock {
    stream_id: u32,
    buf: BytesMut,
    end_stream: bool,
    self_dependent: bool,
    fragments: usize,
}

#[derive(Debug)]
struct PendingPing {
    data: [u8; 8],
    sent: Instant,
    reply: oneshot::Sender<Duration>,
}

struct ConnState {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    events_tx: mpsc::UnboundedSender<Event>,

    local: Settings,
    peer: Settings,
    got_settings: bool,
    settings_acked: bool,

    decoder: HeaderDecoder,
    encoder: HeaderEncoder,
    header_block: Option<HeaderBlock>,

    recv_flow: InflowWindow,
    send_flow: FlowWindow,

    streams: HashMap<u32, Stream>,
    /// Highest client stream id seen, accepted or not.
    max_client_stream_id: u32,
    /// Highest stream id accepted for processing, reported in GOAWAY.
    last_accepted: u32,

    queue: WriteQueue,
    /// Streams with a handler write waiting for credit, in round-robin order.
    ready: VecDeque<u32>,

    running_handlers: usize,
    /// Requests waiting for a handler slot. Ids reset while waiting stay
    /// until a slot frees, so open-then-reset still counts against
    /// `max_queued_handlers`.
    waiting: VecDeque<u32>,

    going_away: bool,
    force_close: bool,
    shutdown_deadline: Option<Instant>,
    idle_since: Option<Instant>,

    pings: VecDeque<PendingPing>,
    ping_counter: u64,
}

impl ConnState {
    fn new(config: ServerConfig, handler: Arc<dyn Handler>, events_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            local: config.local_settings(),
            peer: Settings::default(),
            got_settings: false,
            settings_acked: false,
            decoder: HeaderDecoder::new(config.decoder_header_table_size, config.max_header_list_size),
            encoder: HeaderEncoder::new(config.encoder_header_table_size),
            header_block: None,
            recv_flow: InflowWindow::new(config.initial_connection_window_size),
            send_flow: FlowWindow::new(DEFAULT_WINDOW_SIZE),
            streams: HashMap::new(),
            max_client_stream_id: 0,
            last_accepted: 0,
            queue: WriteQueue::new(config.max_queued_control_frames),
            ready: VecDeque::new(),
            running_handlers: 0,
            waiting: VecDeque::new(),
            going_away: false,
            force_close: false,
            shutdown_deadline: None,
            idle_since: None,
            pings: VecDeque::new(),
            ping_counter: 0,
            config,
            handler,
            events_tx,
        }
    }

    fn send_preamble(&mut self) {
        self.queue.push_control(Frame::Settings {
            ack: false,
            settings: self.local.to_params(),
        });
        let extra = self.config.initial_connection_window_size - DEFAULT_WINDOW_SIZE;
        if extra > 0 {
            self.queue.push_control(Frame::WindowUpdate {
                stream_id: 0,
                increment: extra,
            });
        }
    }

    async fn process(
        &mut self,
        frames: &mut mpsc::Receiver<Result<Frame, FrameError>>,
        events: &mut mpsc::UnboundedReceiver<Event>,
        writer_tx: &mpsc::Sender<Bytes>,
        writer: &mut JoinHandle<io::Result<()>>,
    ) -> Result<(), ServeError> {
        loop {
            self.schedule_data();
            self.queue.check_flood()?;
            self.update_idle();

            if self.force_close {
                return Ok(());
            }
            if self.going_away && self.streams.is_empty() {
                debug!("all streams finished after GOAWAY");
                return Ok(());
            }

            let deadline = self.next_deadline();
            let has_output = !self.queue.is_empty();

            tokio::select! {
                biased;

                permit = writer_tx.reserve(), if has_output => {
                    let permit = permit.map_err(|_| writer_stopped())?;
                    if let Some(batch) = self.queue.next_batch(WRITE_BATCH_SIZE) {
                        permit.send(batch);
                    }
                }

                res = &mut *writer => {
                    return Err(match res {
                        Ok(Ok(())) => writer_stopped(),
                        Ok(Err(e)) => ServeError::Io(e),
                        Err(e) => ServeError::Io(io::Error::new(io::ErrorKind::Other, e)),
                    });
                }

                Some(event) = events.recv() => self.on_event(event),

                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame)?,
                    Some(Err(FrameError::Io(e))) => return Err(ServeError::Io(e)),
                    Some(Err(FrameError::BadPreface)) => return Err(ServeError::BadPreface),
                    Some(Err(e)) => {
                        return Err(ServeError::Protocol {
                            code: e.code(),
                            reason: e.to_string().into(),
                        })
                    }
                    None => {
                        debug!("peer hung up");
                        return Ok(());
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => self.on_timer(),
            }
        }
    }

    /// Best-effort drain of queued output, bounded by the GOAWAY flush
    /// timeout, then close the write side.
    async fn flush(&mut self, writer_tx: mpsc::Sender<Bytes>, writer: JoinHandle<io::Result<()>>) {
        let abort = writer.abort_handle();
        let queue = &mut self.queue;
        let drain = async move {
            while let Some(batch) = queue.next_batch(WRITE_BATCH_SIZE) {
                if writer_tx.send(batch).await.is_err() {
                    break;
                }
            }
            drop(writer_tx);
            let _ = writer.await;
        };
        if timeout(self.config.goaway_flush_timeout, drain).await.is_err() {
            debug!("timed out flushing queued frames");
            abort.abort();
        }
    }

    /// Fail every stream still alive when the connection goes away.
    fn teardown(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.close_with(StreamError::ConnectionClosed);
        }
        self.waiting.clear();
        self.ready.clear();
        self.pings.clear();
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn update_idle(&mut self) {
        if self.streams.is_empty() {
            self.idle_since.get_or_insert_with(Instant::now);
        } else {
            self.idle_since = None;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let idle = match (self.idle_since, self.config.idle_timeout) {
            (Some(since), Some(idle)) if !self.going_away => Some(since + idle),
            _ => None,
        };
        let requests = self
            .streams
            .values()
            .filter(|s| s.is_live())
            .filter_map(|s| s.deadline)
            .min();
        [idle, requests, self.shutdown_deadline].into_iter().flatten().min()
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.shutdown_deadline.map_or(false, |d| now >= d) {
            debug!("graceful shutdown timed out");
            self.force_close = true;
            return;
        }
        if let (Some(since), Some(idle)) = (self.idle_since, self.config.idle_timeout) {
            if !self.going_away && now >= since + idle {
                debug!("idle timeout");
                self.start_shutdown();
            }
        }
        let expired: Vec<u32> = self
            .streams
            .values()
            .filter(|s| s.is_live() && s.deadline.map_or(false, |d| now >= d))
            .map(|s| s.id)
            .collect();
        for stream_id in expired {
            debug!(stream_id, "request timed out");
            self.reset_stream(stream_id, ErrorCode::Cancel, StreamError::Timeout);
        }
    }

    fn start_shutdown(&mut self) {
        if self.going_away {
            return;
        }
        debug!(last_stream_id = self.last_accepted, "starting graceful shutdown");
        self.going_away = true;
        self.queue.push_control(Frame::GoAway {
            last_stream_id: self.last_accepted,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        self.shutdown_deadline = Some(Instant::now() + self.config.shutdown_timeout);
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    fn handle_frame(&mut self, frame: Frame) -> Result<(), ServeError> {
        match self.on_frame(frame) {
            Ok(()) => Ok(()),
            Err(H2Error::Stream {
                stream_id,
                code,
                reason,
            }) => {
                debug!(stream_id, %code, %reason, "stream error");
                self.reset_stream(stream_id, code, StreamError::Reset(code));
                Ok(())
            }
            Err(H2Error::Connection { code, reason }) => Err(ServeError::Protocol { code, reason }),
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        trace!(frame = frame.name(), stream_id = frame.stream_id(), "recv");

        if !self.got_settings {
            if !matches!(frame, Frame::Settings { ack: false, .. }) {
                return Err(H2Error::protocol("first frame must be SETTINGS"));
            }
            self.got_settings = true;
        }

        let needs_stream = matches!(
            frame,
            Frame::Data { .. }
                | Frame::Headers { .. }
                | Frame::Priority { .. }
                | Frame::RstStream { .. }
                | Frame::PushPromise { .. }
                | Frame::Continuation { .. }
        );
        if needs_stream && frame.stream_id() == 0 {
            return Err(H2Error::protocol(format!("{} on stream 0", frame.name())));
        }

        if let Some(block) = &self.header_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == block.stream_id => {}
                other => {
                    return Err(H2Error::protocol(format!(
                        "{} on stream {} while header block for stream {} is open",
                        other.name(),
                        other.stream_id(),
                        block.stream_id
                    )))
                }
            }
        }

        let flow_len = frame.flow_controlled_len();
        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                ..
            } => self.on_data(stream_id, data, end_stream, flow_len as u32),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
                ..
            } => self.on_headers(stream_id, block, end_stream, end_headers, priority),
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => self.on_continuation(stream_id, block, end_headers),
            Frame::Priority { stream_id, spec } => {
                if spec.dependency == stream_id {
                    return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "stream depends on itself"));
                }
                Ok(())
            }
            Frame::RstStream { stream_id, error_code } => self.on_rst_stream(stream_id, error_code),
            Frame::Settings { ack, settings } => self.on_settings(ack, &settings),
            Frame::PushPromise { .. } => Err(H2Error::protocol("client sent PUSH_PROMISE")),
            Frame::Ping { ack, data } => {
                self.on_ping(ack, data);
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                if error_code == ErrorCode::NoError {
                    debug!(last_stream_id, "peer sent GOAWAY");
                } else {
                    debug!(
                        last_stream_id,
                        %error_code,
                        debug = %String::from_utf8_lossy(&debug_data),
                        "peer sent GOAWAY with error"
                    );
                }
                self.start_shutdown();
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            Frame::Unknown { frame_type, .. } => {
                trace!(frame_type, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    /// A stream id the peer has never opened.
    fn is_idle(&self, stream_id: u32) -> bool {
        !self.streams.contains_key(&stream_id) && (stream_id > self.max_client_stream_id || stream_id % 2 == 0)
    }

    fn live_streams(&self) -> usize {
        self.streams.values().filter(|s| s.is_live()).count()
    }

    fn max_header_block(&self) -> usize {
        let list = self.config.max_header_list_size as usize;
        (2 * list)
            .min(MAX_HEADER_BLOCK_SIZE)
            .max(self.config.max_frame_size as usize)
    }

    fn on_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool, len: u32) -> Result<(), H2Error> {
        if self.is_idle(stream_id) {
            return Err(H2Error::protocol(format!("DATA on idle stream {stream_id}")));
        }
        self.recv_flow
            .consume(len)
            .map_err(|e| H2Error::connection(ErrorCode::FlowControlError, e.to_string()))?;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            self.release_connection(len);
            return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, "DATA on closed stream"));
        };

        if !stream.state.can_recv() {
            let expected = stream.state == StreamState::Closed && stream.reset_sent;
            let half_closed = stream.state == StreamState::HalfClosedRemote;
            self.release_connection(len);
            if expected {
                return Ok(());
            }
            let reason = if half_closed {
                "DATA after END_STREAM"
            } else {
                "DATA on closed stream"
            };
            return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, reason));
        }

        if let Err(e) = stream.recv_window.consume(len) {
            self.release_connection(len);
            return Err(H2Error::stream(stream_id, ErrorCode::FlowControlError, e.to_string()));
        }

        let payload = data.len() as u32;
        stream.received += u64::from(payload);
        if let Some(declared) = stream.content_length {
            if stream.received > declared || (end_stream && stream.received != declared) {
                let received = stream.received;
                self.release_connection(len);
                debug!(stream_id, declared, received, "request body does not match content-length");
                self.reset_stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    StreamError::ContentLength { declared, received },
                );
                return Ok(());
            }
        }

        // Padding is never seen by the handler.
        let padding = len - payload;
        let mut stream_update = stream.recv_window.release(padding);
        let mut conn_release = padding;

        if payload > 0 {
            if stream.deliver(BodyChunk::Data(data)) {
                stream.buffered += payload;
            } else {
                // Nobody reads this body any more.
                conn_release += payload;
            }
        }

        if end_stream {
            stream.finish_body(BodyChunk::End);
            stream.recv_end_stream();
            stream_update = None;
        }

        if let Some(increment) = stream_update {
            self.queue.push_control(Frame::WindowUpdate { stream_id, increment });
        }
        self.release_connection(conn_release);
        if end_stream {
            self.maybe_remove(stream_id);
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
    ) -> Result<(), H2Error> {
        let self_dependent = priority.map_or(false, |p| p.dependency == stream_id);
        if end_headers {
            return self.on_header_block(stream_id, block, end_stream, self_dependent);
        }
        if block.len() > self.max_header_block() {
            return Err(self.header_block_too_large(stream_id));
        }
        self.header_block = Some(HeaderBlock {
            stream_id,
            buf: BytesMut::from(&block[..]),
            end_stream,
            self_dependent,
            fragments: 1,
        });
        Ok(())
    }

    fn on_continuation(&mut self, stream_id: u32, block: Bytes, end_headers: bool) -> Result<(), H2Error> {
        let Some(mut pending) = self.header_block.take() else {
            return Err(H2Error::protocol(format!(
                "CONTINUATION on stream {stream_id} without open header block"
            )));
        };
        pending.buf.extend_from_slice(&block);
        pending.fragments += 1;
        if pending.buf.len() > self.max_header_block() || pending.fragments > MAX_CONTINUATION_FRAMES {
            return Err(self.header_block_too_large(pending.stream_id));
        }
        if !end_headers {
            self.header_block = Some(pending);
            return Ok(());
        }
        self.on_header_block(
            pending.stream_id,
            pending.buf.freeze(),
            pending.end_stream,
            pending.self_dependent,
        )
    }

    /// The peer is told the flooding stream was processed so it is not
    /// retried elsewhere.
    fn header_block_too_large(&mut self, stream_id: u32) -> H2Error {
        if stream_id % 2 == 1 {
            self.last_accepted = self.last_accepted.max(stream_id);
        }
        H2Error::connection(ErrorCode::EnhanceYourCalm, "header block too large")
    }

    /// A complete header block: a new request, or trailers on a known stream.
    fn on_header_block(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        self_dependent: bool,
    ) -> Result<(), H2Error> {
        if let Some(state) = self.streams.get(&stream_id).map(|s| s.state) {
            return self.on_trailers(stream_id, block, end_stream, state);
        }
        if stream_id % 2 == 0 {
            return Err(H2Error::protocol(format!("HEADERS on even stream id {stream_id}")));
        }
        if stream_id <= self.max_client_stream_id {
            return Err(H2Error::protocol(format!("HEADERS on closed stream {stream_id}")));
        }
        self.max_client_stream_id = stream_id;

        // Always decode, even for streams that end up refused or ignored,
        // so the HPACK dynamic table stays in sync with the peer.
        let mut builder = RequestHeadBuilder::request();
        let too_large = match self.decoder.decode_header_block(&block, &mut builder) {
            Ok(()) => false,
            Err(HeaderBlockError::ListTooLarge { size, max }) => {
                debug!(stream_id, size, max, "request header list too large");
                true
            }
            Err(HeaderBlockError::Compression(e)) => {
                return Err(H2Error::connection(ErrorCode::CompressionError, e));
            }
        };

        if self.going_away {
            debug!(stream_id, "ignoring new stream after GOAWAY");
            return Ok(());
        }
        if self.live_streams() >= self.config.max_concurrent_streams as usize {
            debug!(stream_id, "refusing stream over the concurrency limit");
            self.queue.push_control(Frame::RstStream {
                stream_id,
                error_code: ErrorCode::RefusedStream,
            });
            return Ok(());
        }
        self.last_accepted = stream_id;

        if too_large {
            self.reply_without_handler(stream_id, 431, end_stream);
            return Ok(());
        }
        let head = builder
            .finish()
            .map_err(|e| H2Error::stream(stream_id, ErrorCode::ProtocolError, e.0))?;
        if self_dependent {
            return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "stream depends on itself"));
        }
        if end_stream && head.content_length.map_or(false, |len| len > 0) {
            return Err(H2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "non-zero content-length on request without body",
            ));
        }

        let initial = self.local.initial_window_size;
        let recv_window = if self.settings_acked {
            InflowWindow::new(initial)
        } else {
            InflowWindow::with_credit(initial, initial.max(DEFAULT_WINDOW_SIZE))
        };
        let mut stream = Stream::new(stream_id, recv_window, FlowWindow::new(self.peer.initial_window_size));
        stream.content_length = head.content_length;
        stream.deadline = self.config.request_timeout.map(|t| Instant::now() + t);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        if end_stream {
            stream.state = StreamState::HalfClosedRemote;
            let _ = body_tx.send(BodyChunk::End);
        } else {
            stream.state = StreamState::Open;
            stream.body_tx = Some(body_tx);
        }

        let request = Request {
            stream_id,
            method: head.method,
            scheme: head.scheme,
            path: head.path,
            authority: head.authority,
            headers: head.headers,
            body: RequestBody::new(stream_id, body_rx, self.events_tx.clone()),
        };
        debug!(stream_id, method = %request.method, path = ?request.path, "new stream");

        if self.running_handlers < self.config.max_concurrent_handlers {
            stream.handler = HandlerSlot::Running;
            self.streams.insert(stream_id, stream);
            self.spawn_handler(request);
        } else {
            if self.waiting.len() >= self.config.max_queued_handlers {
                return Err(H2Error::connection(
                    ErrorCode::EnhanceYourCalm,
                    "too many requests waiting for a handler",
                ));
            }
            debug!(stream_id, "queueing request until a handler slot frees up");
            stream.handler = HandlerSlot::Queued(Box::new(request));
            self.streams.insert(stream_id, stream);
            self.waiting.push_back(stream_id);
        }
        Ok(())
    }

    fn on_trailers(&mut self, stream_id: u32, block: Bytes, end_stream: bool, state: StreamState) -> Result<(), H2Error> {
        let mut builder = RequestHeadBuilder::trailers();
        match self.decoder.decode_header_block(&block, &mut builder) {
            Ok(()) => {}
            Err(HeaderBlockError::Compression(e)) => {
                return Err(H2Error::connection(ErrorCode::CompressionError, e));
            }
            Err(e @ HeaderBlockError::ListTooLarge { .. }) => {
                return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, e.to_string()));
            }
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !state.can_recv() {
            if state == StreamState::Closed && stream.reset_sent {
                return Ok(());
            }
            return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, "HEADERS after END_STREAM"));
        }
        if !end_stream {
            return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "trailers without END_STREAM"));
        }
        let trailers = builder
            .finish_trailers()
            .map_err(|e| H2Error::stream(stream_id, ErrorCode::ProtocolError, e.0))?;

        if let Some(declared) = stream.content_length {
            if stream.received != declared {
                let received = stream.received;
                self.reset_stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    StreamError::ContentLength { declared, received },
                );
                return Ok(());
            }
        }
        stream.finish_body(BodyChunk::Trailers(trailers));
        stream.recv_end_stream();
        self.maybe_remove(stream_id);
        Ok(())
    }

    fn on_rst_stream(&mut self, stream_id: u32, code: ErrorCode) -> Result<(), H2Error> {
        if self.is_idle(stream_id) {
            return Err(H2Error::protocol(format!("RST_STREAM on idle stream {stream_id}")));
        }
        match self.streams.get(&stream_id) {
            Some(stream) if stream.state != StreamState::Closed => {
                debug!(stream_id, %code, "peer reset stream");
                self.close_stream(stream_id, StreamError::Reset(code));
            }
            _ => {}
        }
        Ok(())
    }

    fn on_settings(&mut self, ack: bool, params: &[(u16, u32)]) -> Result<(), H2Error> {
        if ack {
            if !self.settings_acked {
                debug!("peer acknowledged our settings");
                self.settings_acked = true;
                let initial = self.local.initial_window_size;
                if initial < DEFAULT_WINDOW_SIZE {
                    let delta = i64::from(initial) - i64::from(DEFAULT_WINDOW_SIZE);
                    for stream in self.streams.values_mut() {
                        stream.recv_window.adjust(delta);
                    }
                }
            }
            return Ok(());
        }

        let old_initial = self.peer.initial_window_size;
        self.peer
            .apply(params)
            .map_err(|e| H2Error::connection(e.code(), e.to_string()))?;

        let delta = i64::from(self.peer.initial_window_size) - i64::from(old_initial);
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.adjust(delta).map_err(|e| {
                    H2Error::connection(ErrorCode::FlowControlError, e.to_string())
                })?;
            }
        }
        self.encoder.set_peer_table_size(self.peer.header_table_size);
        self.queue.set_max_frame_size(self.peer.max_frame_size);
        trace!(settings = ?self.peer, "applied peer settings");

        self.queue.push_control(Frame::Settings {
            ack: true,
            settings: Vec::new(),
        });
        Ok(())
    }

    fn on_ping(&mut self, ack: bool, data: [u8; 8]) {
        if !ack {
            self.queue.push_control(Frame::Ping { ack: true, data });
            return;
        }
        if let Some(pos) = self.pings.iter().position(|p| p.data == data) {
            if let Some(ping) = self.pings.remove(pos) {
                let _ = ping.reply.send(ping.sent.elapsed());
            }
        }
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            if increment == 0 {
                return Err(H2Error::protocol("WINDOW_UPDATE with zero increment"));
            }
            return self
                .send_flow
                .increase(increment)
                .map_err(|e| H2Error::connection(ErrorCode::FlowControlError, e.to_string()));
        }

        if self.is_idle(stream_id) {
            return Err(H2Error::protocol(format!("WINDOW_UPDATE on idle stream {stream_id}")));
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if stream.state == StreamState::Closed {
            return Ok(());
        }
        if increment == 0 {
            return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"));
        }
        stream
            .send_window
            .increase(increment)
            .map_err(|e| H2Error::stream(stream_id, ErrorCode::FlowControlError, e.to_string()))
    }

    // =========================================================================
    // Handler events
    // =========================================================================

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Respond {
                stream_id,
                status,
                headers,
                end_stream,
                done,
            } => {
                let result = self.send_response(stream_id, status, &headers, end_stream);
                let _ = done.send(result);
                if end_stream {
                    self.after_send_end(stream_id);
                }
            }
            Event::Data {
                stream_id,
                data,
                end_stream,
                done,
            } => self.queue_data(stream_id, data, end_stream, done),
            Event::Trailers {
                stream_id,
                trailers,
                done,
            } => {
                let result = self.send_trailers(stream_id, &trailers);
                let _ = done.send(result);
                self.after_send_end(stream_id);
            }
            Event::Reset { stream_id, code } => {
                if self.streams.get(&stream_id).map_or(false, |s| s.state != StreamState::Closed) {
                    self.reset_stream(stream_id, code, StreamError::Reset(code));
                }
            }
            Event::BodyConsumed { stream_id, len } => self.on_body_consumed(stream_id, len),
            Event::BodyClosed { stream_id } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.body_tx = None;
                    let unread = std::mem::take(&mut stream.buffered);
                    self.release_connection(unread);
                }
            }
            Event::HandlerFinished { stream_id, result } => self.on_handler_finished(stream_id, result),
            Event::Shutdown => self.start_shutdown(),
            Event::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Event::Ping(reply) => {
                self.ping_counter += 1;
                let data = self.ping_counter.to_be_bytes();
                self.queue.push_control(Frame::Ping { ack: false, data });
                self.pings.push_back(PendingPing {
                    data,
                    sent: Instant::now(),
                    reply,
                });
            }
        }
    }

    fn send_response(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[H2Header],
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(StreamError::ConnectionClosed);
        };
        if let Some(e) = stream.write_error() {
            return Err(e);
        }
        if stream.response != ResponseState::Pending {
            return Err(StreamError::InvalidState("response head already sent"));
        }
        let block = self.encoder.encode_response(status, headers);
        let frames = header_block_frames(stream_id, block, end_stream, self.queue.max_frame_size());
        self.queue.push_header_block(stream_id, frames);
        stream.response = ResponseState::HeadersSent;
        if end_stream {
            stream.send_end_stream();
        }
        Ok(())
    }

    fn send_trailers(&mut self, stream_id: u32, trailers: &[H2Header]) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(StreamError::ConnectionClosed);
        };
        if let Some(e) = stream.write_error() {
            return Err(e);
        }
        if stream.response != ResponseState::HeadersSent {
            return Err(StreamError::InvalidState("trailers before response head"));
        }
        if stream.pending.is_some() {
            return Err(StreamError::InvalidState("body write still in progress"));
        }
        let block = self.encoder.encode_trailers(trailers);
        let frames = header_block_frames(stream_id, block, true, self.queue.max_frame_size());
        self.queue.push_header_block(stream_id, frames);
        stream.send_end_stream();
        Ok(())
    }

    fn queue_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        done: oneshot::Sender<Result<(), StreamError>>,
    ) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            let _ = done.send(Err(StreamError::ConnectionClosed));
            return;
        };
        let rejected = if let Some(e) = stream.write_error() {
            Some(e)
        } else if stream.response != ResponseState::HeadersSent {
            Some(StreamError::InvalidState("body data before response head"))
        } else if stream.pending.is_some() {
            Some(StreamError::InvalidState("body write still in progress"))
        } else {
            None
        };
        if let Some(e) = rejected {
            let _ = done.send(Err(e));
            return;
        }
        if data.is_empty() && !end_stream {
            let _ = done.send(Ok(()));
            return;
        }
        stream.pending = Some(PendingData {
            data,
            end_stream,
            done: Some(done),
        });
        self.ready.push_back(stream_id);
    }

    fn on_body_consumed(&mut self, stream_id: u32, len: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let len = len.min(stream.buffered);
        stream.buffered -= len;
        if stream.state.can_recv() {
            if let Some(increment) = stream.recv_window.release(len) {
                self.queue.push_control(Frame::WindowUpdate { stream_id, increment });
            }
        }
        self.release_connection(len);
    }

    fn on_handler_finished(&mut self, stream_id: u32, result: Result<(), HandlerError>) {
        self.running_handlers = self.running_handlers.saturating_sub(1);
        self.finish_handler(stream_id, result);
        self.start_queued_handlers();
    }

    fn finish_handler(&mut self, stream_id: u32, result: Result<(), HandlerError>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        stream.handler = HandlerSlot::Finished;
        if let Err(e) = &result {
            debug!(stream_id, error = %e, "handler failed");
        }

        if stream.reset.is_some() || stream.response == ResponseState::Done {
            self.after_send_end(stream_id);
            return;
        }

        match (result, stream.response) {
            (Ok(()), ResponseState::Pending) => {
                self.implicit_response(stream_id, 200);
            }
            (Ok(()), _) => {
                match stream.pending.as_mut() {
                    Some(pending) => pending.end_stream = true,
                    None => {
                        stream.pending = Some(PendingData {
                            data: Bytes::new(),
                            end_stream: true,
                            done: None,
                        });
                        self.ready.push_back(stream_id);
                    }
                }
            }
            (Err(_), ResponseState::Pending) => {
                self.implicit_response(stream_id, 500);
            }
            (Err(_), _) => {
                self.reset_stream(
                    stream_id,
                    ErrorCode::InternalError,
                    StreamError::Reset(ErrorCode::InternalError),
                );
            }
        }
    }

    /// Respond on behalf of a handler that returned without doing so.
    fn implicit_response(&mut self, stream_id: u32, status: u16) {
        if self.send_response(stream_id, status, &[], true).is_ok() {
            self.after_send_end(stream_id);
        }
    }

    /// Answer a request without running a handler (e.g. 431), resetting
    /// the stream if the peer has not finished sending.
    fn reply_without_handler(&mut self, stream_id: u32, status: u16, end_stream: bool) {
        let block = self.encoder.encode_response(status, &[]);
        let frames = header_block_frames(stream_id, block, true, self.queue.max_frame_size());
        self.queue.push_header_block(stream_id, frames);
        if !end_stream {
            self.queue.push_after_stream(Frame::RstStream {
                stream_id,
                error_code: ErrorCode::NoError,
            });
        }
    }

    fn spawn_handler(&mut self, request: Request) {
        let stream_id = request.stream_id;
        let handler = Arc::clone(&self.handler);
        let response = ResponseWriter::new(stream_id, self.events_tx.clone());
        let events = self.events_tx.clone();
        self.running_handlers += 1;

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(async move { handler.handle(request, response).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(stream_id, "handler panicked");
                    Err("handler panicked".into())
                }
            };
            let _ = events.send(Event::HandlerFinished { stream_id, result });
        });
    }

    /// Runs when a handler slot frees: starts waiting requests and drops the
    /// reset ones ahead of the next request that cannot start yet.
    fn start_queued_handlers(&mut self) {
        while let Some(&stream_id) = self.waiting.front() {
            let queued = self
                .streams
                .get(&stream_id)
                .map_or(false, |s| matches!(s.handler, HandlerSlot::Queued(_)));
            if queued && self.running_handlers >= self.config.max_concurrent_handlers {
                break;
            }
            self.waiting.pop_front();
            if !queued {
                continue;
            }
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                if let HandlerSlot::Queued(request) = std::mem::replace(&mut stream.handler, HandlerSlot::Running) {
                    self.spawn_handler(*request);
                }
            }
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Carve DATA frames from pending handler writes, round-robin, while
    /// flow control and the stream lane allow it.
    fn schedule_data(&mut self) {
        let max_frame = self.queue.max_frame_size();
        let mut budget = self.ready.len();
        while budget > 0 && self.queue.wants_data() {
            budget -= 1;
            let Some(stream_id) = self.ready.pop_front() else {
                break;
            };
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            let Some(pending) = stream.pending.as_mut() else {
                continue;
            };

            let n = pending
                .data
                .len()
                .min(max_frame)
                .min(stream.send_window.available())
                .min(self.send_flow.available());
            if n == 0 && !pending.data.is_empty() {
                self.ready.push_back(stream_id);
                continue;
            }

            let chunk = pending.data.split_to(n);
            let last = pending.data.is_empty();
            let end_stream = last && pending.end_stream;
            stream.send_window.consume(n);
            self.send_flow.consume(n);
            self.queue.push_data(Frame::Data {
                stream_id,
                data: chunk,
                end_stream,
                pad_len: None,
            });

            if !last {
                self.ready.push_back(stream_id);
                continue;
            }
            if let Some(mut pending) = stream.pending.take() {
                pending.complete(Ok(()));
            }
            if end_stream {
                stream.send_end_stream();
                self.after_send_end(stream_id);
            }
        }
    }

    /// After our END_STREAM: if the handler is done but the peer is still
    /// sending, tell it to stop with RST_STREAM(NO_ERROR).
    fn after_send_end(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.response == ResponseState::Done && stream.state.can_recv() && stream.handler_finished() {
            debug!(stream_id, "response complete before request body, resetting");
            self.queue.push_after_stream(Frame::RstStream {
                stream_id,
                error_code: ErrorCode::NoError,
            });
            stream.reset_sent = true;
            stream.state = StreamState::Closed;
            stream.finish_body(BodyChunk::Error(StreamError::Reset(ErrorCode::NoError)));
            let unread = std::mem::take(&mut stream.buffered);
            self.release_connection(unread);
        }
        self.maybe_remove(stream_id);
    }

    /// Send RST_STREAM and close the stream.
    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode, error: StreamError) {
        debug!(stream_id, %code, "resetting stream");
        self.queue.push_control(Frame::RstStream {
            stream_id,
            error_code: code,
        });
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.reset_sent = true;
            self.close_stream(stream_id, error);
        }
    }

    /// Close a stream abnormally: wake its waiters, drop its queued DATA and
    /// return the credit it held.
    fn close_stream(&mut self, stream_id: u32, error: StreamError) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let unread = stream.close_with(error);
        let refund = self.queue.purge_data(stream_id);
        self.send_flow.refund(refund);
        self.release_connection(unread);
        self.ready.retain(|id| *id != stream_id);
        self.maybe_remove(stream_id);
    }

    fn maybe_remove(&mut self, stream_id: u32) {
        if self.streams.get(&stream_id).map_or(false, Stream::is_removable) {
            self.streams.remove(&stream_id);
            trace!(stream_id, "stream removed");
        }
    }

    /// Return drained or discarded bytes at the connection level.
    fn release_connection(&mut self, len: u32) {
        if let Some(increment) = self.recv_flow.release(len) {
            self.queue.push_control(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            streams: self.streams.len(),
            live_streams: self.live_streams(),
            running_handlers: self.running_handlers,
            queued_handlers: self.waiting.len(),
            last_stream_id: self.last_accepted,
            recv_window_outstanding: self.recv_flow.outstanding(),
            send_window: self.send_flow.window(),
            queued_control_frames: self.queue.queued_control_frames(),
            going_away: self.going_away,
        }
    }
}

fn writer_stopped() -> ServeError {
    ServeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "writer task stopped"))
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
