//! Error taxonomy for the HTTP/2 engine.
//!
//! Protocol violations are classified by scope (RFC 9113 Section 5.4):
//! a stream error is answered with RST_STREAM and the connection keeps
//! going, a connection error is answered with GOAWAY and the transport is
//! closed. Handlers only ever see [`StreamError`], which is the terminal
//! value delivered on a stream's channels.

use std::borrow::Cow;
use std::io;

/// HTTP/2 error codes (RFC 9113 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    /// A code this implementation does not know. Must be treated like
    /// INTERNAL_ERROR but is kept verbatim so frames re-encode unchanged.
    Other(u32),
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            other => Self::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::NoError => 0x0,
            Self::ProtocolError => 0x1,
            Self::InternalError => 0x2,
            Self::FlowControlError => 0x3,
            Self::SettingsTimeout => 0x4,
            Self::StreamClosed => 0x5,
            Self::FrameSizeError => 0x6,
            Self::RefusedStream => 0x7,
            Self::Cancel => 0x8,
            Self::CompressionError => 0x9,
            Self::ConnectError => 0xa,
            Self::EnhanceYourCalm => 0xb,
            Self::InadequateSecurity => 0xc,
            Self::Http11Required => 0xd,
            Self::Other(v) => v,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
            Self::Other(v) => return write!(f, "UNKNOWN(0x{v:x})"),
        };
        f.write_str(name)
    }
}

/// A protocol violation detected while processing inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum H2Error {
    /// Corrupts shared connection state: GOAWAY, then close.
    #[error("connection error {code}: {reason}")]
    Connection {
        code: ErrorCode,
        reason: Cow<'static, str>,
    },
    /// Scoped to one stream: RST_STREAM, connection continues.
    #[error("stream {stream_id} error {code}: {reason}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        reason: Cow<'static, str>,
    },
}

impl H2Error {
    pub fn connection(code: ErrorCode, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub fn stream(stream_id: u32, code: ErrorCode, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Stream {
            stream_id,
            code,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::connection(ErrorCode::ProtocolError, reason)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection { code, .. } | Self::Stream { code, .. } => *code,
        }
    }
}

/// Terminal error observed by a handler on a stream's body or response
/// channels. Each waiter sees exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream was reset, by the peer or locally.
    #[error("stream reset: {0}")]
    Reset(ErrorCode),
    /// The connection went away (transport error, GOAWAY, teardown).
    #[error("connection closed")]
    ConnectionClosed,
    /// The request body did not match its declared content-length.
    #[error("request body does not match content-length {declared} (received {received})")]
    ContentLength { declared: u64, received: u64 },
    /// The per-request timer fired.
    #[error("request timed out")]
    Timeout,
    /// The handler tried to use the response in the wrong order, e.g. body
    /// data before headers or anything after END_STREAM.
    #[error("invalid response sequence: {0}")]
    InvalidState(&'static str),
}

/// Error produced by the application handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of serving a whole connection.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Transport read or write failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A fatal protocol violation; GOAWAY with `code` was sent.
    #[error("connection error {code}: {reason}")]
    Protocol {
        code: ErrorCode,
        reason: Cow<'static, str>,
    },
    /// The peer stopped reading while we kept queueing control frames.
    #[error("too many queued control frames ({0})")]
    ControlFrameFlood(usize),
    /// The peer sent something other than the HTTP/2 connection preface.
    #[error("client did not send the HTTP/2 connection preface")]
    BadPreface,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
