//! HPACK and header validation tests


use h2_serve::hpack::HeaderDecoder;

/// Decode a block into (name, value) pairs.
pub fn decode_fields(decoder: &mut HeaderDecoder, block: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    decoder
        .decode_header_block(block, &mut |name: &[u8], value: &[u8]| {
            out.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ))
        })
        .unwrap();
    out
}
