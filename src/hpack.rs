//! HPACK: Header Compression for HTTP/2 (RFC 7541)
//!
//! Thin bridge around `fluke-hpack`. The compression algorithm itself is a
//! black box; this module owns what happens at the connection boundary:
//! header-list size accounting while decoding, structural validation of
//! request and trailer fields, and sanitising response fields before they
//! are encoded.

use std::borrow::Cow;

use bytes::Bytes;

/// Per-field overhead counted toward SETTINGS_MAX_HEADER_LIST_SIZE
/// (RFC 9113 Section 6.5.2).
pub const HEADER_FIELD_OVERHEAD: usize = 32;

/// Table size the HPACK codec starts with on both sides.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// A decoded HTTP/2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Header {
    pub name: String,
    pub value: String,
}

impl H2Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size of this field as counted by SETTINGS_MAX_HEADER_LIST_SIZE.
    pub fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + HEADER_FIELD_OVERHEAD
    }
}

/// Receives decoded fields in block order.
pub trait FieldSink {
    fn field(&mut self, name: &[u8], value: &[u8]);
}

impl<F> FieldSink for F
where
    F: FnMut(&[u8], &[u8]),
{
    fn field(&mut self, name: &[u8], value: &[u8]) {
        self(name, value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderBlockError {
    /// The block could not be decoded. The shared dynamic table is now out
    /// of sync with the peer, so this is always fatal for the connection.
    #[error("HPACK decode error: {0}")]
    Compression(String),
    /// The block decoded fine but the field list is over the limit. The
    /// request is rejected; the connection is unaffected.
    #[error("header list of {size} bytes exceeds limit of {max}")]
    ListTooLarge { size: usize, max: usize },
}

/// HPACK decoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Decoder` which maintains dynamic table state per-connection.
pub struct HeaderDecoder {
    inner: fluke_hpack::Decoder<'static>,
    max_header_list_size: usize,
}

impl std::fmt::Debug for HeaderDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDecoder")
            .field("max_header_list_size", &self.max_header_list_size)
            .finish()
    }
}

impl HeaderDecoder {
    pub fn new(max_table_size: u32, max_header_list_size: u32) -> Self {
        let mut inner = fluke_hpack::Decoder::new();
        inner.set_max_allowed_table_size(max_table_size as usize);
        Self {
            inner,
            max_header_list_size: max_header_list_size as usize,
        }
    }

    /// Decode a complete header block, feeding each field to `sink`.
    ///
    /// The block is always decoded to the end, even once the list is known
    /// to be too large, so the dynamic table stays synchronized with the
    /// peer's encoder. Fields past the limit are not emitted.
    pub fn decode_header_block<S>(&mut self, block: &[u8], sink: &mut S) -> Result<(), HeaderBlockError>
    where
        S: FieldSink + ?Sized,
    {
        let max = self.max_header_list_size;
        let mut size = 0usize;
        self.inner
            .decode_with_cb(block, |name: Cow<[u8]>, value: Cow<[u8]>| {
                size += name.len() + value.len() + HEADER_FIELD_OVERHEAD;
                if size <= max {
                    sink.field(&name, &value);
                }
            })
            .map_err(|e| HeaderBlockError::Compression(format!("{e:?}")))?;

        if size > max {
            return Err(HeaderBlockError::ListTooLarge { size, max });
        }
        Ok(())
    }
}

/// HPACK encoder for response header blocks.
/// Wraps `fluke_hpack::Encoder` which maintains dynamic table state per-connection.
pub struct HeaderEncoder {
    inner: fluke_hpack::Encoder<'static>,
    /// Local ceiling on the dynamic table we are willing to use.
    local_max: u32,
    /// Peer's SETTINGS_HEADER_TABLE_SIZE.
    peer_max: u32,
}

impl std::fmt::Debug for HeaderEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderEncoder")
            .field("table_size", &self.table_size())
            .finish()
    }
}

impl HeaderEncoder {
    pub fn new(local_max: u32) -> Self {
        let mut encoder = Self {
            inner: fluke_hpack::Encoder::new(),
            local_max,
            peer_max: DEFAULT_HEADER_TABLE_SIZE,
        };
        if encoder.table_size() != DEFAULT_HEADER_TABLE_SIZE {
            encoder.inner.set_max_table_size(encoder.table_size() as usize);
        }
        encoder
    }

    /// Dynamic table size currently in effect.
    pub fn table_size(&self) -> u32 {
        self.local_max.min(self.peer_max)
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. A reduction shrinks the
    /// encoder's table before the next block is produced.
    pub fn set_peer_table_size(&mut self, peer_max: u32) {
        let before = self.table_size();
        self.peer_max = peer_max;
        let after = self.table_size();
        if before != after {
            self.inner.set_max_table_size(after as usize);
        }
    }

    /// Encode fields in order into an HPACK header block.
    pub fn encode(&mut self, headers: &[H2Header]) -> Bytes {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()))
            .collect();
        Bytes::from(self.inner.encode(pairs))
    }

    /// Encode a response head: `:status` first, then the sanitised fields.
    pub fn encode_response(&mut self, status: u16, headers: &[H2Header]) -> Bytes {
        let mut fields = Vec::with_capacity(headers.len() + 1);
        fields.push(H2Header::new(":status", status.to_string()));
        fields.extend(sanitize_response_headers(headers));
        self.encode(&fields)
    }

    /// Encode a trailer section (no pseudo-headers).
    pub fn encode_trailers(&mut self, trailers: &[H2Header]) -> Bytes {
        let fields: Vec<H2Header> = sanitize_response_headers(trailers).collect();
        self.encode(&fields)
    }
}

// ============================================================================
// Field validation
// ============================================================================

/// A request or trailer section that is structurally invalid. Always a
/// stream-level PROTOCOL_ERROR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed header block: {0}")]
pub struct MalformedHeaders(pub &'static str);

/// Connection-specific fields that HTTP/2 forbids (RFC 9113 Section 8.2.2).
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// RFC 9113 Section 8.2.1: names must not contain 0x00-0x20, 0x41-0x5a or
/// 0x7f-0xff. Colons only appear as the pseudo-header prefix.
pub fn valid_field_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name
            .iter()
            .all(|&b| b > 0x20 && b < 0x7f && !b.is_ascii_uppercase() && b != b':')
}

/// NUL, CR, LF and DEL are never valid in a field value.
pub fn valid_field_value(value: &[u8]) -> bool {
    !value.iter().any(|&b| matches!(b, 0x00 | b'\r' | b'\n' | 0x7f))
}

fn valid_scheme(scheme: &str) -> bool {
    let mut bytes = scheme.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Validated request head, ready to be handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Absent for CONNECT.
    pub scheme: Option<String>,
    /// Absent for CONNECT.
    pub path: Option<String>,
    /// `:authority`, or the `host` field when the pseudo-header is absent.
    pub authority: Option<String>,
    /// Regular fields in block order, cookies folded into one field.
    pub headers: Vec<H2Header>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Request,
    Trailers,
}

/// A [`FieldSink`] that validates fields as they are decoded. The first
/// violation is remembered and reported by `finish`; decoding itself is
/// never interrupted.
#[derive(Debug)]
pub struct RequestHeadBuilder {
    section: Section,
    method: Option<String>,
    scheme: Option<String>,
    path: Option<String>,
    authority: Option<String>,
    host: Option<String>,
    headers: Vec<H2Header>,
    cookies: Vec<String>,
    content_length: Option<u64>,
    saw_regular: bool,
    error: Option<&'static str>,
}

impl RequestHeadBuilder {
    pub fn request() -> Self {
        Self::with_section(Section::Request)
    }

    pub fn trailers() -> Self {
        Self::with_section(Section::Trailers)
    }

    fn with_section(section: Section) -> Self {
        Self {
            section,
            method: None,
            scheme: None,
            path: None,
            authority: None,
            host: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            content_length: None,
            saw_regular: false,
            error: None,
        }
    }

    fn fail(&mut self, reason: &'static str) {
        if self.error.is_none() {
            self.error = Some(reason);
        }
    }

    fn pseudo(&mut self, name: &[u8], value: &[u8]) {
        if !valid_field_value(value) {
            return self.fail("invalid header field value");
        }
        if self.saw_regular {
            return self.fail("pseudo-header field after regular field");
        }
        if self.section == Section::Trailers {
            return self.fail("pseudo-header field in trailers");
        }
        let value = String::from_utf8_lossy(value).into_owned();
        let (slot, what) = match name {
            b":method" => (&mut self.method, "duplicate :method"),
            b":scheme" => (&mut self.scheme, "duplicate :scheme"),
            b":path" => (&mut self.path, "duplicate :path"),
            b":authority" => (&mut self.authority, "duplicate :authority"),
            _ => return self.fail("unknown or response pseudo-header field"),
        };
        if slot.replace(value).is_some() {
            self.fail(what);
        }
    }

    fn regular(&mut self, name: &[u8], value: &[u8]) {
        self.saw_regular = true;
        if !valid_field_name(name) {
            return self.fail("invalid header field name");
        }
        if !valid_field_value(value) {
            return self.fail("invalid header field value");
        }
        // valid_field_name guarantees ASCII
        let name = String::from_utf8_lossy(name).into_owned();
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return self.fail("connection-specific header field");
        }
        if name == "te" && value != b"trailers" {
            return self.fail("te header field other than \"trailers\"");
        }
        if name == "content-length" && self.section == Section::Request {
            match parse_content_length(value) {
                Some(len) if self.content_length.map_or(true, |prev| prev == len) => {
                    self.content_length = Some(len);
                }
                Some(_) => return self.fail("conflicting content-length values"),
                None => return self.fail("invalid content-length"),
            }
        }
        let value = String::from_utf8_lossy(value).into_owned();
        match name.as_str() {
            "cookie" if self.section == Section::Request => self.cookies.push(value),
            "host" if self.host.is_none() => {
                self.host = Some(value.clone());
                self.headers.push(H2Header { name, value });
            }
            _ => self.headers.push(H2Header { name, value }),
        }
    }

    /// Finish a request header section.
    pub fn finish(self) -> Result<RequestHead, MalformedHeaders> {
        if let Some(reason) = self.error {
            return Err(MalformedHeaders(reason));
        }
        let method = self.method.ok_or(MalformedHeaders("missing :method"))?;

        if method == "CONNECT" {
            if self.scheme.is_some() || self.path.is_some() {
                return Err(MalformedHeaders("CONNECT request with :scheme or :path"));
            }
            if self.authority.is_none() {
                return Err(MalformedHeaders("CONNECT request without :authority"));
            }
        } else {
            match &self.scheme {
                Some(scheme) if valid_scheme(scheme) => {}
                Some(_) => return Err(MalformedHeaders("invalid :scheme")),
                None => return Err(MalformedHeaders("missing :scheme")),
            }
            match &self.path {
                Some(path) if !path.is_empty() => {}
                _ => return Err(MalformedHeaders("missing or empty :path")),
            }
        }

        let mut headers = self.headers;
        if !self.cookies.is_empty() {
            headers.push(H2Header::new("cookie", self.cookies.join("; ")));
        }

        Ok(RequestHead {
            method,
            scheme: self.scheme,
            path: self.path,
            authority: self.authority.or(self.host),
            headers,
            content_length: self.content_length,
        })
    }

    /// Finish a trailer section.
    pub fn finish_trailers(self) -> Result<Vec<H2Header>, MalformedHeaders> {
        match self.error {
            Some(reason) => Err(MalformedHeaders(reason)),
            None => Ok(self.headers),
        }
    }
}

impl FieldSink for RequestHeadBuilder {
    fn field(&mut self, name: &[u8], value: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if name.first() == Some(&b':') {
            self.pseudo(name, value);
        } else {
            self.regular(name, value);
        }
    }
}

/// Lowercase names and drop anything that must not go on the wire: invalid
/// names or values, pseudo-headers, connection-specific fields.
pub fn sanitize_response_headers(headers: &[H2Header]) -> impl Iterator<Item = H2Header> + '_ {
    headers.iter().filter_map(|h| {
        let name = h.name.to_ascii_lowercase();
        if !valid_field_name(name.as_bytes())
            || !valid_field_value(h.value.as_bytes())
            || CONNECTION_SPECIFIC.contains(&name.as_str())
        {
            return None;
        }
        Some(H2Header {
            name,
            value: h.value.clone(),
        })
    })
}

// ============================================================================
// Tests
// ============================================================================
