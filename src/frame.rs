//! HTTP/2 frame codec.
//!
//! Turns bytes into [`Frame`] values and back. The codec itself is
//! stateless apart from the connection preface and the maximum frame size
//! it accepts; all sequencing rules (CONTINUATION ordering, stream-id
//! legality) belong to the connection state machine.
//!
//! Reference: RFC 9113 Sections 4 and 6.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ErrorCode;

/// HTTP/2 frame types (RFC 9113 Section 6)
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 SETTINGS identifiers (RFC 9113 Section 6.5.2)
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub const FRAME_HEADER_LEN: usize = 9;

/// Smallest value SETTINGS_MAX_FRAME_SIZE may take, and the initial value.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest value SETTINGS_MAX_FRAME_SIZE may take.
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Hard ceiling on an accumulated header block (HEADERS + CONTINUATION),
/// whatever the configured header list size.
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// The HTTP/2 connection preface (24 bytes)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Check if data starts with HTTP/2 connection preface (h2c detection)
pub fn is_h2c_preface(data: &[u8]) -> bool {
    data.len() >= CONNECTION_PREFACE.len() && &data[..CONNECTION_PREFACE.len()] == CONNECTION_PREFACE
}

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,    // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32, // 31 bits (high bit reserved)
}

impl FrameHeader {
    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let frame_type = data[3];
        let flags = data[4];
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7FFF_FFFF;

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_LEN);
        dst.put_uint(self.length as u64, 3);
        dst.put_u8(self.frame_type);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7FFF_FFFF);
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_LEN + self.length as usize
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Stream dependency carried by PRIORITY frames and prioritized HEADERS.
/// Parsed and validated, never used for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

impl PrioritySpec {
    fn parse(data: &[u8]) -> Self {
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Self {
            dependency: raw & 0x7FFF_FFFF,
            exclusive: raw & 0x8000_0000 != 0,
            weight: data[4],
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let mut raw = self.dependency & 0x7FFF_FFFF;
        if self.exclusive {
            raw |= 0x8000_0000;
        }
        dst.put_u32(raw);
        dst.put_u8(self.weight);
    }
}

/// One HTTP/2 frame. Padding is stripped on decode; `pad_len` remembers it
/// so flow control can charge for it and encoding can reproduce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        pad_len: Option<u8>,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
        pad_len: Option<u8>,
    },
    Priority {
        stream_id: u32,
        spec: PrioritySpec,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        /// (identifier, value) pairs in wire order. Empty for ACK frames.
        settings: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
        pad_len: Option<u8>,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Extension frame type; read and discarded by the connection.
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

/// Errors raised while decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared length exceeds the size we advertised.
    #[error("frame of type 0x{frame_type:x} is {length} bytes, max frame size is {max}")]
    TooLarge { frame_type: u8, length: u32, max: u32 },
    /// Fixed-size frame with the wrong length.
    #[error("{frame} frame has invalid length {length}")]
    BadLength { frame: &'static str, length: u32 },
    /// Truncated or inconsistent payload.
    #[error("malformed {frame} frame: {reason}")]
    Malformed {
        frame: &'static str,
        reason: &'static str,
    },
    #[error("invalid connection preface")]
    BadPreface,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// The GOAWAY code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } | Self::BadLength { .. } => ErrorCode::FrameSizeError,
            Self::Malformed { .. } | Self::BadPreface => ErrorCode::ProtocolError,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

fn frame_type_name(frame_type: u8) -> &'static str {
    match frame_type {
        frame_type::SETTINGS => "SETTINGS",
        frame_type::PING => "PING",
        _ => "GOAWAY",
    }
}

fn malformed(frame: &'static str, reason: &'static str) -> FrameError {
    FrameError::Malformed { frame, reason }
}

/// Strip the PADDED prefix and trailer. Returns the pad length.
fn strip_padding(frame: &'static str, payload: &mut Bytes) -> Result<u8, FrameError> {
    if payload.is_empty() {
        return Err(malformed(frame, "PADDED flag with empty payload"));
    }
    let pad_len = payload[0];
    if pad_len as usize >= payload.len() {
        return Err(malformed(frame, "padding length exceeds payload"));
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad_len as usize);
    Ok(pad_len)
}

fn put_padded(dst: &mut BytesMut, pad_len: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(pad) = pad_len {
        dst.put_u8(pad);
        body(dst);
        dst.put_bytes(0, pad as usize);
    } else {
        body(dst);
    }
}

fn pad_overhead(pad_len: Option<u8>) -> usize {
    pad_len.map_or(0, |p| p as usize + 1)
}

impl Frame {
    /// Decode the payload of a frame whose header has already been parsed.
    pub fn decode(header: &FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        let stream_id = header.stream_id;
        match header.frame_type {
            frame_type::SETTINGS | frame_type::PING | frame_type::GOAWAY if stream_id != 0 => {
                Err(malformed(frame_type_name(header.frame_type), "connection frame on a stream"))
            }
            frame_type::DATA => {
                let pad_len = if header.has_flag(flags::PADDED) {
                    Some(strip_padding("DATA", &mut payload)?)
                } else {
                    None
                };
                Ok(Frame::Data {
                    stream_id,
                    data: payload,
                    end_stream: header.has_flag(flags::END_STREAM),
                    pad_len,
                })
            }
            frame_type::HEADERS => {
                let pad_len = if header.has_flag(flags::PADDED) {
                    Some(strip_padding("HEADERS", &mut payload)?)
                } else {
                    None
                };
                let priority = if header.has_flag(flags::PRIORITY) {
                    if payload.len() < 5 {
                        return Err(malformed("HEADERS", "PRIORITY flag with truncated priority fields"));
                    }
                    let spec = PrioritySpec::parse(&payload[..5]);
                    payload.advance(5);
                    Some(spec)
                } else {
                    None
                };
                Ok(Frame::Headers {
                    stream_id,
                    block: payload,
                    end_stream: header.has_flag(flags::END_STREAM),
                    end_headers: header.has_flag(flags::END_HEADERS),
                    priority,
                    pad_len,
                })
            }
            frame_type::PRIORITY => {
                if payload.len() != 5 {
                    return Err(FrameError::BadLength { frame: "PRIORITY", length: header.length });
                }
                Ok(Frame::Priority {
                    stream_id,
                    spec: PrioritySpec::parse(&payload),
                })
            }
            frame_type::RST_STREAM => {
                if payload.len() != 4 {
                    return Err(FrameError::BadLength { frame: "RST_STREAM", length: header.length });
                }
                Ok(Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_u32(payload.get_u32()),
                })
            }
            frame_type::SETTINGS => {
                let ack = header.has_flag(flags::ACK);
                if ack && !payload.is_empty() {
                    return Err(FrameError::BadLength { frame: "SETTINGS", length: header.length });
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::BadLength { frame: "SETTINGS", length: header.length });
                }
                // Each setting is 6 bytes: u16 id + u32 value
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    settings.push((id, value));
                }
                Ok(Frame::Settings { ack, settings })
            }
            frame_type::PUSH_PROMISE => {
                let pad_len = if header.has_flag(flags::PADDED) {
                    Some(strip_padding("PUSH_PROMISE", &mut payload)?)
                } else {
                    None
                };
                if payload.len() < 4 {
                    return Err(malformed("PUSH_PROMISE", "missing promised stream id"));
                }
                let promised_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                Ok(Frame::PushPromise {
                    stream_id,
                    promised_stream_id,
                    block: payload,
                    end_headers: header.has_flag(flags::END_HEADERS),
                    pad_len,
                })
            }
            frame_type::PING => {
                if payload.len() != 8 {
                    return Err(FrameError::BadLength { frame: "PING", length: header.length });
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload[..8]);
                Ok(Frame::Ping {
                    ack: header.has_flag(flags::ACK),
                    data,
                })
            }
            frame_type::GOAWAY => {
                if payload.len() < 8 {
                    return Err(FrameError::BadLength { frame: "GOAWAY", length: header.length });
                }
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_u32(payload.get_u32());
                Ok(Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                })
            }
            frame_type::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(FrameError::BadLength { frame: "WINDOW_UPDATE", length: header.length });
                }
                Ok(Frame::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32() & 0x7FFF_FFFF,
                })
            }
            frame_type::CONTINUATION => Ok(Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: header.has_flag(flags::END_HEADERS),
            }),
            other => Ok(Frame::Unknown {
                frame_type: other,
                flags: header.flags,
                stream_id,
                payload,
            }),
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Bytes this frame counts against flow-control windows: the whole
    /// payload of a DATA frame including padding, zero for anything else.
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            Frame::Data { data, pad_len, .. } => data.len() + pad_overhead(*pad_len),
            _ => 0,
        }
    }

    fn header(&self) -> FrameHeader {
        let (frame_type, flags, length) = match self {
            Frame::Data { data, end_stream, pad_len, .. } => {
                let mut f = 0;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
                (frame_type::DATA, f, data.len() + pad_overhead(*pad_len))
            }
            Frame::Headers { block, end_stream, end_headers, priority, pad_len, .. } => {
                let mut f = 0;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
                let mut len = block.len() + pad_overhead(*pad_len);
                if priority.is_some() {
                    f |= flags::PRIORITY;
                    len += 5;
                }
                (frame_type::HEADERS, f, len)
            }
            Frame::Priority { .. } => (frame_type::PRIORITY, 0, 5),
            Frame::RstStream { .. } => (frame_type::RST_STREAM, 0, 4),
            Frame::Settings { ack, settings } => {
                (frame_type::SETTINGS, if *ack { flags::ACK } else { 0 }, settings.len() * 6)
            }
            Frame::PushPromise { block, end_headers, pad_len, .. } => {
                let mut f = 0;
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                if pad_len.is_some() {
                    f |= flags::PADDED;
                }
                (frame_type::PUSH_PROMISE, f, 4 + block.len() + pad_overhead(*pad_len))
            }
            Frame::Ping { ack, .. } => (frame_type::PING, if *ack { flags::ACK } else { 0 }, 8),
            Frame::GoAway { debug_data, .. } => (frame_type::GOAWAY, 0, 8 + debug_data.len()),
            Frame::WindowUpdate { .. } => (frame_type::WINDOW_UPDATE, 0, 4),
            Frame::Continuation { block, end_headers, .. } => (
                frame_type::CONTINUATION,
                if *end_headers { flags::END_HEADERS } else { 0 },
                block.len(),
            ),
            Frame::Unknown { frame_type, flags, payload, .. } => (*frame_type, *flags, payload.len()),
        };
        FrameHeader {
            length: length as u32,
            frame_type,
            flags,
            stream_id: self.stream_id(),
        }
    }

    /// Serialize the frame, header included.
    pub fn encode(&self, dst: &mut BytesMut) {
        let header = self.header();
        dst.reserve(header.total_size());
        header.encode(dst);
        match self {
            Frame::Data { data, pad_len, .. } => {
                put_padded(dst, *pad_len, |dst| dst.put_slice(data));
            }
            Frame::Headers { block, priority, pad_len, .. } => {
                put_padded(dst, *pad_len, |dst| {
                    if let Some(spec) = priority {
                        spec.encode(dst);
                    }
                    dst.put_slice(block);
                });
            }
            Frame::Priority { spec, .. } => spec.encode(dst),
            Frame::RstStream { error_code, .. } => dst.put_u32(error_code.as_u32()),
            Frame::Settings { settings, .. } => {
                for (id, value) in settings {
                    dst.put_u16(*id);
                    dst.put_u32(*value);
                }
            }
            Frame::PushPromise { promised_stream_id, block, pad_len, .. } => {
                put_padded(dst, *pad_len, |dst| {
                    dst.put_u32(*promised_stream_id & 0x7FFF_FFFF);
                    dst.put_slice(block);
                });
            }
            Frame::Ping { data, .. } => dst.put_slice(data),
            Frame::GoAway { last_stream_id, error_code, debug_data } => {
                dst.put_u32(*last_stream_id & 0x7FFF_FFFF);
                dst.put_u32(error_code.as_u32());
                dst.put_slice(debug_data);
            }
            Frame::WindowUpdate { increment, .. } => dst.put_u32(*increment & 0x7FFF_FFFF),
            Frame::Continuation { block, .. } => dst.put_slice(block),
            Frame::Unknown { payload, .. } => dst.put_slice(payload),
        }
    }

    /// Size on the wire, frame header included.
    pub fn encoded_len(&self) -> usize {
        self.header().total_size()
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Split an encoded header block into one HEADERS frame followed by as many
/// CONTINUATION frames as `max_frame_size` requires.
pub fn header_block_frames(
    stream_id: u32,
    mut block: Bytes,
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<Frame> {
    let max_frame_size = max_frame_size.max(1);
    let first = block.split_to(block.len().min(max_frame_size));
    let mut frames = vec![Frame::Headers {
        stream_id,
        block: first,
        end_stream,
        end_headers: block.is_empty(),
        priority: None,
        pad_len: None,
    }];
    while !block.is_empty() {
        let chunk = block.split_to(block.len().min(max_frame_size));
        frames.push(Frame::Continuation {
            stream_id,
            block: chunk,
            end_headers: block.is_empty(),
        });
    }
    frames
}

/// `tokio_util` codec for HTTP/2 frames.
///
/// In server mode the codec first consumes the client connection preface
/// and fails with [`FrameError::BadPreface`] as soon as the bytes diverge
/// from it.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: u32,
    preface_pending: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// A codec that expects frames straight away (client side, tests).
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            preface_pending: false,
        }
    }

    /// A codec that expects the client connection preface first.
    pub fn server(max_frame_size: u32) -> Self {
        Self {
            max_frame_size,
            preface_pending: true,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    pub fn preface_received(&self) -> bool {
        !self.preface_pending
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if self.preface_pending {
            let have = src.len().min(CONNECTION_PREFACE.len());
            if src[..have] != CONNECTION_PREFACE[..have] {
                return Err(FrameError::BadPreface);
            }
            if have < CONNECTION_PREFACE.len() {
                return Ok(None);
            }
            src.advance(CONNECTION_PREFACE.len());
            self.preface_pending = false;
        }

        let header = match FrameHeader::parse(src) {
            Some(h) => h,
            None => return Ok(None),
        };

        if header.length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                frame_type: header.frame_type,
                length: header.length,
                max: self.max_frame_size,
            });
        }

        let total_size = header.total_size();
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(header.length as usize).freeze();
        Frame::decode(&header, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        frame.encode(dst);
        Ok(())
    }
}
