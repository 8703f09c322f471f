//! Outbound frame scheduling and the transport writer task.
//!
//! Frames leave the connection in two lanes. The control lane (SETTINGS,
//! PING, WINDOW_UPDATE, RST_STREAM, GOAWAY) always drains first. The stream
//! lane carries response header blocks and DATA in FIFO order; a header
//! block is a single unit, so its HEADERS and CONTINUATION frames are never
//! split by anything else.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ServeError;
use crate::frame::{Frame, DEFAULT_MAX_FRAME_SIZE};

#[derive(Debug)]
struct Unit {
    stream_id: u32,
    frames: Vec<Frame>,
    /// Flow-controlled bytes in this unit, zero for header blocks.
    data_len: usize,
    size: usize,
}

#[derive(Debug)]
pub(crate) struct WriteQueue {
    control: VecDeque<Frame>,
    streams: VecDeque<Unit>,
    stream_bytes: usize,
    max_control: usize,
    max_frame_size: usize,
}

impl WriteQueue {
    pub fn new(max_control: usize) -> Self {
        Self {
            control: VecDeque::new(),
            streams: VecDeque::new(),
            stream_bytes: 0,
            max_control,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    /// Peer's SETTINGS_MAX_FRAME_SIZE, the unit for outbound DATA.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size as usize;
    }

    pub fn push_control(&mut self, frame: Frame) {
        trace!(frame = frame.name(), stream_id = frame.stream_id(), "queue control frame");
        self.control.push_back(frame);
    }

    /// Fails once more control frames wait for the transport than allowed.
    pub fn check_flood(&self) -> Result<(), ServeError> {
        if self.control.len() > self.max_control {
            return Err(ServeError::ControlFrameFlood(self.control.len()));
        }
        Ok(())
    }

    pub fn queued_control_frames(&self) -> usize {
        self.control.len()
    }

    /// Queue a header block (HEADERS plus CONTINUATIONs) as one unit.
    pub fn push_header_block(&mut self, stream_id: u32, frames: Vec<Frame>) {
        let size = frames.iter().map(Frame::encoded_len).sum();
        self.stream_bytes += size;
        self.streams.push_back(Unit {
            stream_id,
            frames,
            data_len: 0,
            size,
        });
    }

    pub fn push_data(&mut self, frame: Frame) {
        let size = frame.encoded_len();
        let data_len = frame.flow_controlled_len();
        self.stream_bytes += size;
        self.streams.push_back(Unit {
            stream_id: frame.stream_id(),
            frames: vec![frame],
            data_len,
            size,
        });
    }

    /// Queue a frame behind everything already queued for its stream, e.g.
    /// an RST_STREAM(NO_ERROR) that must follow the response it cuts short.
    pub fn push_after_stream(&mut self, frame: Frame) {
        let size = frame.encoded_len();
        self.stream_bytes += size;
        self.streams.push_back(Unit {
            stream_id: frame.stream_id(),
            frames: vec![frame],
            data_len: 0,
            size,
        });
    }

    /// Whether more DATA should be carved from pending handler writes.
    /// Keeps the stream lane short so control frames and other streams are
    /// not stuck behind a long backlog.
    pub fn wants_data(&self) -> bool {
        self.stream_bytes < 2 * self.max_frame_size
    }

    /// Drop queued DATA for a reset stream. Returns the flow-controlled
    /// bytes removed, to be refunded to the connection send window.
    ///
    /// Header blocks stay queued: they were already run through the HPACK
    /// encoder and the peer's decoder has to see them.
    pub fn purge_data(&mut self, stream_id: u32) -> usize {
        let mut refund = 0;
        let mut removed = 0;
        self.streams.retain(|unit| {
            if unit.stream_id == stream_id && is_data(unit) {
                refund += unit.data_len;
                removed += unit.size;
                false
            } else {
                true
            }
        });
        self.stream_bytes -= removed;
        refund
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.streams.is_empty()
    }

    /// Encode up to roughly `limit` bytes, control frames first.
    pub fn next_batch(&mut self, limit: usize) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        let mut buf = BytesMut::new();
        while let Some(frame) = self.control.pop_front() {
            trace!(frame = frame.name(), stream_id = frame.stream_id(), "send");
            frame.encode(&mut buf);
        }
        while buf.len() < limit {
            let Some(unit) = self.streams.pop_front() else { break };
            self.stream_bytes -= unit.size;
            for frame in &unit.frames {
                trace!(frame = frame.name(), stream_id = frame.stream_id(), "send");
                frame.encode(&mut buf);
            }
        }
        Some(buf.freeze())
    }
}

fn is_data(unit: &Unit) -> bool {
    matches!(unit.frames.first(), Some(Frame::Data { .. }))
}

/// Owns the write half of the transport. Each batch is written and flushed
/// before the next one is taken, so a peer that stops reading makes the
/// channel back up into the [`WriteQueue`].
pub(crate) async fn writer_task<W>(mut io: W, mut rx: mpsc::Receiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(batch) = rx.recv().await {
        io.write_all(&batch).await?;
        io.flush().await?;
    }
    io.shutdown().await
}
