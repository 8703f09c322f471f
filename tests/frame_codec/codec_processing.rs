//! Tests for decoding frame streams

use bytes::Bytes;
use h2_serve::{ErrorCode, Frame, FrameCodec, FrameError, CONNECTION_PREFACE};

use super::decode_all;

#[test]
fn test_connection_preface_handling() {
    let mut codec = FrameCodec::server(16_384);
    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);

    let frames = decode_all(&mut codec, &data).unwrap();
    assert!(codec.preface_received());
    assert_eq!(
        frames,
        vec![Frame::Settings {
            ack: false,
            settings: vec![]
        }]
    );
}

#[test]
fn test_partial_preface_waits() {
    let mut codec = FrameCodec::server(16_384);
    let frames = decode_all(&mut codec, &CONNECTION_PREFACE[..10]).unwrap();
    assert!(frames.is_empty());
    assert!(!codec.preface_received());
}

#[test]
fn test_http1_request_is_bad_preface() {
    let mut codec = FrameCodec::server(16_384);
    let err = decode_all(&mut codec, b"GET / HTTP/1.1\r\n").unwrap_err();
    assert!(matches!(err, FrameError::BadPreface));
}

#[test]
fn test_codec_fragmented_frames() {
    let mut codec = FrameCodec::new();
    let frame = Frame::Data {
        stream_id: 1,
        data: Bytes::from_static(b"hello"),
        end_stream: true,
        pad_len: None,
    };
    let bytes = frame.to_bytes();

    let mut buf = bytes::BytesMut::from(&bytes[..4]);
    assert!(tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
    buf.extend_from_slice(&bytes[4..]);
    let decoded = tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap();
    assert_eq!(decoded, Some(frame));
    assert!(buf.is_empty());
}

#[test]
fn test_padded_data_frame() {
    let mut codec = FrameCodec::new();
    // DATA, PADDED, pad length 3, payload "hi"
    let data = [0, 0, 6, 0, 0x8, 0, 0, 0, 1, 3, b'h', b'i', 0, 0, 0];
    let frames = decode_all(&mut codec, &data).unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].flow_controlled_len(), 6);
    match &frames[0] {
        Frame::Data { data, pad_len, .. } => {
            assert_eq!(&data[..], b"hi");
            assert_eq!(*pad_len, Some(3));
        }
        other => panic!("Expected DATA, got {other:?}"),
    }
}

#[test]
fn test_headers_with_priority_flag() {
    let mut codec = FrameCodec::new();
    // HEADERS, END_HEADERS | PRIORITY, dependency 0 exclusive, weight 15, block 0x82
    let data = [0, 0, 6, 1, 0x24, 0, 0, 0, 1, 0x80, 0, 0, 0, 15, 0x82];
    let frames = decode_all(&mut codec, &data).unwrap();

    match &frames[0] {
        Frame::Headers { block, priority, end_headers, .. } => {
            assert_eq!(&block[..], &[0x82]);
            assert!(*end_headers);
            let spec = priority.unwrap();
            assert!(spec.exclusive);
            assert_eq!(spec.dependency, 0);
            assert_eq!(spec.weight, 15);
        }
        other => panic!("Expected HEADERS, got {other:?}"),
    }
}

#[test]
fn test_multiple_frames_in_single_buffer() {
    let mut codec = FrameCodec::new();
    let mut data = Vec::new();
    data.extend_from_slice(&Frame::Ping { ack: false, data: [7; 8] }.to_bytes());
    data.extend_from_slice(
        &Frame::RstStream {
            stream_id: 3,
            error_code: ErrorCode::Cancel,
        }
        .to_bytes(),
    );
    data.extend_from_slice(
        &Frame::GoAway {
            last_stream_id: 5,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::from_static(b"bye"),
        }
        .to_bytes(),
    );

    let frames = decode_all(&mut codec, &data).unwrap();
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[0], Frame::Ping { ack: false, data } if data == [7; 8]));
    assert!(matches!(
        frames[1],
        Frame::RstStream {
            stream_id: 3,
            error_code: ErrorCode::Cancel
        }
    ));
    match &frames[2] {
        Frame::GoAway { last_stream_id, debug_data, .. } => {
            assert_eq!(*last_stream_id, 5);
            assert_eq!(&debug_data[..], b"bye");
        }
        other => panic!("Expected GOAWAY, got {other:?}"),
    }
}

#[test]
fn test_settings_parsing_multiple_settings() {
    let mut codec = FrameCodec::new();
    let frame = Frame::Settings {
        ack: false,
        settings: vec![(0x4, 1 << 20), (0x5, 32_768), (0xff, 9)],
    };
    let frames = decode_all(&mut codec, &frame.to_bytes()).unwrap();
    assert_eq!(frames, vec![frame]);
}

#[test]
fn test_unknown_frame_type_is_kept() {
    let mut codec = FrameCodec::new();
    let data = [0, 0, 2, 0xfa, 0x3, 0, 0, 0, 7, 1, 2];
    let frames = decode_all(&mut codec, &data).unwrap();
    match &frames[0] {
        Frame::Unknown { frame_type, flags, stream_id, payload } => {
            assert_eq!(*frame_type, 0xfa);
            assert_eq!(*flags, 0x3);
            assert_eq!(*stream_id, 7);
            assert_eq!(&payload[..], &[1, 2]);
        }
        other => panic!("Expected unknown frame, got {other:?}"),
    }
}

#[test]
fn test_window_update_clears_reserved_bit() {
    let mut codec = FrameCodec::new();
    let data = [0, 0, 4, 8, 0, 0, 0, 0, 1, 0x80, 0, 0x10, 0];
    let frames = decode_all(&mut codec, &data).unwrap();
    assert_eq!(
        frames,
        vec![Frame::WindowUpdate {
            stream_id: 1,
            increment: 4096
        }]
    );
}
