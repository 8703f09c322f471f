//! Request body source handed to handlers.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::connection::Event;
use crate::error::StreamError;
use crate::hpack::H2Header;

/// What the connection pushes into a stream's body channel.
#[derive(Debug)]
pub(crate) enum BodyChunk {
    Data(Bytes),
    /// Trailer section; implies end of body.
    Trailers(Vec<H2Header>),
    End,
    Error(StreamError),
}

/// The body of an inbound request.
///
/// Flow-control credit for a chunk is given back to the peer once
/// [`data`](Self::data) has returned it. Dropping the body early discards
/// whatever is still buffered and returns that credit at the connection
/// level.
#[derive(Debug)]
pub struct RequestBody {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<BodyChunk>,
    events: mpsc::UnboundedSender<Event>,
    trailers: Option<Vec<H2Header>>,
    finished: bool,
}

impl RequestBody {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<BodyChunk>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            events,
            trailers: None,
            finished: false,
        }
    }

    /// Next chunk of body data. `None` once the body ended cleanly; an error
    /// is returned exactly once if the stream or connection failed.
    pub async fn data(&mut self) -> Option<Result<Bytes, StreamError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(BodyChunk::Data(data)) => {
                let _ = self.events.send(Event::BodyConsumed {
                    stream_id: self.stream_id,
                    len: data.len() as u32,
                });
                Some(Ok(data))
            }
            Some(BodyChunk::Trailers(trailers)) => {
                self.trailers = Some(trailers);
                self.finished = true;
                None
            }
            Some(BodyChunk::End) => {
                self.finished = true;
                None
            }
            Some(BodyChunk::Error(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                Some(Err(StreamError::ConnectionClosed))
            }
        }
    }

    /// Read the remaining body into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes, StreamError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.data().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Trailers, available once [`data`](Self::data) has returned `None`.
    pub fn trailers(&self) -> Option<&[H2Header]> {
        self.trailers.as_deref()
    }

    pub fn is_end_stream(&self) -> bool {
        self.finished
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        let _ = self.events.send(Event::BodyClosed {
            stream_id: self.stream_id,
        });
    }
}
