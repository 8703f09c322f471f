//! The contract between the connection and application code.
//!
//! Every accepted stream becomes one [`Request`] and one [`ResponseWriter`]
//! passed to [`Handler::handle`], which runs on its own task. The handler
//! talks back to the connection only through those two values.

use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::body::RequestBody;
use crate::connection::Event;
use crate::error::{ErrorCode, HandlerError, StreamError};
use crate::hpack::H2Header;

/// An inbound request.
#[derive(Debug)]
pub struct Request {
    pub stream_id: u32,
    pub method: String,
    /// `None` for CONNECT.
    pub scheme: Option<String>,
    /// `None` for CONNECT.
    pub path: Option<String>,
    pub authority: Option<String>,
    pub headers: Vec<H2Header>,
    pub body: RequestBody,
}

impl Request {
    /// First value of the named header field. `name` must be lowercase.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<H2Header>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(H2Header::new(name, value));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Idle,
    Streaming,
    Done,
}

/// Sink for one stream's response.
///
/// Writes complete once the connection has scheduled the bytes for
/// transmission, so `send_data` is where a handler waits for flow-control
/// credit. If the handler returns without finishing the response, the
/// connection finishes it: `200` with no body when nothing was sent, an
/// empty END_STREAM otherwise.
#[derive(Debug)]
pub struct ResponseWriter {
    stream_id: u32,
    events: mpsc::UnboundedSender<Event>,
    progress: Progress,
}

impl ResponseWriter {
    pub(crate) fn new(stream_id: u32, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            stream_id,
            events,
            progress: Progress::Idle,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Send the response head. With `end_stream` the response has no body.
    pub async fn send_response(&mut self, response: Response, end_stream: bool) -> Result<(), StreamError> {
        if self.progress != Progress::Idle {
            return Err(StreamError::InvalidState("response head already sent"));
        }
        let (done, rx) = oneshot::channel();
        self.submit(
            Event::Respond {
                stream_id: self.stream_id,
                status: response.status,
                headers: response.headers,
                end_stream,
                done,
            },
            rx,
        )
        .await?;
        self.progress = if end_stream { Progress::Done } else { Progress::Streaming };
        Ok(())
    }

    /// Send a chunk of the body. Resolves once every byte was handed to the
    /// write scheduler, which may take several WINDOW_UPDATEs from the peer.
    pub async fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        match self.progress {
            Progress::Idle => return Err(StreamError::InvalidState("body data before response head")),
            Progress::Done => return Err(StreamError::InvalidState("response already complete")),
            Progress::Streaming => {}
        }
        let (done, rx) = oneshot::channel();
        self.submit(
            Event::Data {
                stream_id: self.stream_id,
                data,
                end_stream,
                done,
            },
            rx,
        )
        .await?;
        if end_stream {
            self.progress = Progress::Done;
        }
        Ok(())
    }

    /// End the response with a trailer section.
    pub async fn send_trailers(&mut self, trailers: Vec<H2Header>) -> Result<(), StreamError> {
        match self.progress {
            Progress::Idle => return Err(StreamError::InvalidState("trailers before response head")),
            Progress::Done => return Err(StreamError::InvalidState("response already complete")),
            Progress::Streaming => {}
        }
        let (done, rx) = oneshot::channel();
        self.submit(
            Event::Trailers {
                stream_id: self.stream_id,
                trailers,
                done,
            },
            rx,
        )
        .await?;
        self.progress = Progress::Done;
        Ok(())
    }

    /// Abort the stream with RST_STREAM.
    pub fn reset(&mut self, code: ErrorCode) {
        self.progress = Progress::Done;
        let _ = self.events.send(Event::Reset {
            stream_id: self.stream_id,
            code,
        });
    }

    async fn submit(
        &self,
        event: Event,
        rx: oneshot::Receiver<Result<(), StreamError>>,
    ) -> Result<(), StreamError> {
        self.events
            .send(event)
            .map_err(|_| StreamError::ConnectionClosed)?;
        rx.await.unwrap_or(Err(StreamError::ConnectionClosed))
    }
}

/// Application code serving requests.
///
/// Implemented for any `Fn(Request, ResponseWriter) -> impl Future` closure.
/// An `Err` (or a panic) before the response head was sent becomes a `500`;
/// after that the stream is reset with INTERNAL_ERROR.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, response: ResponseWriter) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, request: Request, response: ResponseWriter) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(request, response))
    }
}
