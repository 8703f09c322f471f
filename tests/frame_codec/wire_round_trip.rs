//! Raw wire bytes survive decode followed by encode unchanged

use h2_serve::{flags, frame_type, FrameCodec};

use super::decode_all;

fn frame(ty: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, ty, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn wire_frames() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("DATA", frame(frame_type::DATA, 0, 1, b"hello")),
        (
            "padded DATA with END_STREAM",
            frame(frame_type::DATA, flags::PADDED | flags::END_STREAM, 1, b"\x03abc\0\0\0"),
        ),
        ("HEADERS", frame(frame_type::HEADERS, flags::END_HEADERS, 3, b"\x82\x86\x84")),
        (
            "padded HEADERS with PRIORITY",
            frame(
                frame_type::HEADERS,
                flags::PADDED | flags::PRIORITY | flags::END_HEADERS | flags::END_STREAM,
                5,
                b"\x02\x80\x00\x00\x03\x0f\x82\x84\0\0",
            ),
        ),
        ("PRIORITY", frame(frame_type::PRIORITY, 0, 7, b"\x00\x00\x00\x05\x10")),
        ("RST_STREAM", frame(frame_type::RST_STREAM, 0, 7, b"\x00\x00\x00\x08")),
        ("RST_STREAM unknown code", frame(frame_type::RST_STREAM, 0, 9, b"\x00\x00\x01\x00")),
        (
            "SETTINGS",
            frame(frame_type::SETTINGS, 0, 0, b"\x00\x03\x00\x00\x00\x64\x00\x04\x00\x10\x00\x00"),
        ),
        ("SETTINGS ACK", frame(frame_type::SETTINGS, flags::ACK, 0, b"")),
        (
            "PUSH_PROMISE",
            frame(frame_type::PUSH_PROMISE, flags::END_HEADERS, 1, b"\x00\x00\x00\x02\x82"),
        ),
        ("PING", frame(frame_type::PING, 0, 0, b"\x01\x02\x03\x04\x05\x06\x07\x08")),
        ("PING ACK", frame(frame_type::PING, flags::ACK, 0, b"\x00\x00\x00\x00\x00\x00\x00\x2a")),
        (
            "GOAWAY with debug data",
            frame(frame_type::GOAWAY, 0, 0, b"\x00\x00\x00\x07\x00\x00\x00\x0bsee you"),
        ),
        ("WINDOW_UPDATE", frame(frame_type::WINDOW_UPDATE, 0, 0, b"\x00\x01\x00\x00")),
        ("stream WINDOW_UPDATE", frame(frame_type::WINDOW_UPDATE, 0, 3, b"\x7f\xff\xff\xff")),
        ("CONTINUATION", frame(frame_type::CONTINUATION, flags::END_HEADERS, 3, b"\x84\x87")),
        ("unknown type", frame(0xfa, 0x5a, 11, b"extension")),
        ("unknown type on stream 0", frame(0x0b, 0, 0, b"")),
    ]
}

#[test]
fn test_decode_then_encode_reproduces_wire_bytes() {
    for (name, wire) in wire_frames() {
        let mut codec = FrameCodec::new();
        let frames = decode_all(&mut codec, &wire).unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(frames.len(), 1, "{name}");
        assert_eq!(&frames[0].to_bytes()[..], &wire[..], "{name}");
        assert_eq!(frames[0].encoded_len(), wire.len(), "{name}");
    }
}

#[test]
fn test_back_to_back_frames_reencode_as_one_stream() {
    let wire: Vec<u8> = wire_frames().into_iter().flat_map(|(_, bytes)| bytes).collect();
    let mut codec = FrameCodec::new();
    let frames = decode_all(&mut codec, &wire).unwrap();
    let reencoded: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes().to_vec()).collect();
    assert_eq!(reencoded, wire);
}
