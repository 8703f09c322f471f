//! h2-serve: a server-side HTTP/2 connection engine on tokio
//!
//! Give it an accepted byte stream (TCP, TLS, anything `AsyncRead +
//! AsyncWrite`) and a request handler; it speaks HTTP/2 on that stream until
//! the connection ends.
//!
//! # Features
//!
//! - **RFC 9113 framing**: all frame types, CONTINUATION reassembly,
//!   stream and connection error handling with RST_STREAM and GOAWAY
//! - **HPACK**: header compression via fluke-hpack, with request header
//!   validation (pseudo-headers, connection-specific fields, content-length)
//! - **Flow control**: batched WINDOW_UPDATEs driven by how fast the handler
//!   drains the request body; response writes wait for peer credit
//! - **Backpressure**: bounded handler concurrency with a waiting queue,
//!   control-frame flood protection, a writer that stops when the peer
//!   stops reading
//! - **Graceful shutdown**: GOAWAY, in-flight streams finish, idle timeout
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use h2_serve::{serve_connection, Request, Response, ResponseWriter, ServerConfig};
//!
//! async fn hello(mut req: Request, mut res: ResponseWriter) -> Result<(), h2_serve::HandlerError> {
//!     let body = req.body.read_to_end().await?;
//!     res.send_response(Response::new(200).with_header("content-type", "text/plain"), false)
//!         .await?;
//!     res.send_data(Bytes::from(format!("got {} bytes\n", body.len())), true)
//!         .await?;
//!     Ok(())
//! }
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     tokio::spawn(serve_connection(socket, ServerConfig::default(), hello));
//! }
//! # }
//! ```
//!
//! # Architecture
//!
//! Each connection is one task owning all protocol state, fed by a reader
//! task (frames in), a writer task (bytes out) and one task per request
//! running the [`Handler`]. Handlers only see [`Request`], [`RequestBody`]
//! and [`ResponseWriter`]; everything they do is a message to the
//! connection task.
//!
//! It does NOT provide:
//! - Listening sockets or TLS (bring your own stream)
//! - HTTP/1.1 or the h2c upgrade dance
//! - Server push or stream priorities

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod handler;
pub mod hpack;
mod stream;
mod writer;

pub use body::RequestBody;
pub use config::{ServerConfig, Settings, SettingsError};
pub use connection::{serve_connection, Connection, ConnectionHandle, ConnectionStats};
pub use error::{ErrorCode, H2Error, HandlerError, ServeError, StreamError};
pub use frame::{
    flags, frame_type, is_h2c_preface, settings_id, Frame, FrameCodec, FrameError, FrameHeader,
    CONNECTION_PREFACE, MAX_HEADER_BLOCK_SIZE,
};
pub use handler::{Handler, Request, Response, ResponseWriter};
pub use hpack::{H2Header, HeaderDecoder, HeaderEncoder};
pub use stream::StreamState;
