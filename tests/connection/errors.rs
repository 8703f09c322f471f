//! Protocol violations and how far their damage reaches

use std::sync::Arc;

use bytes::Bytes;
use h2_serve::{
    ErrorCode, Frame, HandlerError, Request, Response, ResponseWriter, ServeError, ServerConfig, StreamError,
    CONNECTION_PREFACE,
};
use tokio::sync::{mpsc, Notify};

use super::support::{ok_handler, stalled_handler, start, start_with_buffer, Client};

async fn assert_connection_alive(client: &mut Client) {
    client.send(Frame::Ping { ack: false, data: [4; 8] }).await;
    client
        .expect(|f| matches!(f, Frame::Ping { ack: true, data } if *data == [4; 8]))
        .await;
}

#[tokio::test]
async fn test_continuation_on_other_stream_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    let block = h.client.request_block("GET", "/", &[]);
    let (first, rest) = block.split_at(1);
    h.client
        .send(Frame::Headers {
            stream_id: 1,
            block: Bytes::copy_from_slice(first),
            end_stream: true,
            end_headers: false,
            priority: None,
            pad_len: None,
        })
        .await;
    h.client
        .send(Frame::Continuation {
            stream_id: 3,
            block: Bytes::copy_from_slice(rest),
            end_headers: true,
        })
        .await;

    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
    h.client.expect_eof().await;
    assert!(matches!(
        h.server_result().await,
        Err(ServeError::Protocol {
            code: ErrorCode::ProtocolError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_continuation_completes_split_request() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    let block = h.client.request_block("GET", "/", &[("x-long", &"v".repeat(100))]);
    let (first, rest) = block.split_at(10);
    h.client
        .send(Frame::Headers {
            stream_id: 1,
            block: Bytes::copy_from_slice(first),
            end_stream: true,
            end_headers: false,
            priority: None,
            pad_len: None,
        })
        .await;
    h.client
        .send(Frame::Continuation {
            stream_id: 1,
            block: Bytes::copy_from_slice(rest),
            end_headers: true,
        })
        .await;
    assert_eq!(h.client.read_response(1).await.status, 200);
}

#[tokio::test]
async fn test_first_frame_must_be_settings() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.send_raw(CONNECTION_PREFACE).await.unwrap();
    h.client.send(Frame::Ping { ack: false, data: [0; 8] }).await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_not_http2_is_bad_preface() {
    let mut h = start(ServerConfig::default(), ok_handler);
    let _ = h.client.send_raw(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n").await;
    assert!(matches!(h.server_result().await, Err(ServeError::BadPreface)));
}

#[tokio::test]
async fn test_data_on_stream_zero_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client.data(0, b"x", false).await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_even_stream_id_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client.request(2, "GET", "/", &[], true).await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_decreasing_stream_id_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client.request(5, "GET", "/", &[], true).await;
    assert_eq!(h.client.read_response(5).await.status, 200);
    h.client.request(3, "GET", "/", &[], true).await;
    assert_eq!(h.client.expect_goaway().await, (5, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_push_promise_from_client_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client
        .send(Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            block: Bytes::new(),
            end_headers: true,
            pad_len: None,
        })
        .await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_malformed_request_is_stream_error() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    let block = h.client.encode(&[(":method", "GET"), (":scheme", "https")]);
    h.client
        .send(Frame::Headers {
            stream_id: 1,
            block,
            end_stream: true,
            end_headers: true,
            priority: None,
            pad_len: None,
        })
        .await;
    assert_eq!(h.client.expect_rst(1).await, ErrorCode::ProtocolError);

    h.client.request(3, "GET", "/", &[("connection", "keep-alive")], true).await;
    assert_eq!(h.client.expect_rst(3).await, ErrorCode::ProtocolError);

    assert_connection_alive(&mut h.client).await;
    h.client.request(5, "GET", "/", &[], true).await;
    assert_eq!(h.client.read_response(5).await.status, 200);
}

#[tokio::test]
async fn test_oversized_header_list_gets_431() {
    let config = ServerConfig {
        max_header_list_size: 200,
        ..ServerConfig::default()
    };
    let mut h = start(config, ok_handler);
    h.client.handshake().await;

    let big = "x".repeat(300);
    h.client.request(1, "GET", "/", &[("x-big", &big)], true).await;
    assert_eq!(h.client.read_response(1).await.status, 431);

    h.client.request(3, "GET", "/", &[], true).await;
    assert_eq!(h.client.read_response(3).await.status, 200);
}

#[tokio::test]
async fn test_self_dependent_priority_is_stream_error() {
    let mut h = start(ServerConfig::default(), stalled_handler);
    h.client.handshake().await;
    h.client.request(1, "GET", "/", &[], false).await;
    h.client
        .send(Frame::Priority {
            stream_id: 1,
            spec: h2_serve::frame::PrioritySpec {
                dependency: 1,
                exclusive: false,
                weight: 16,
            },
        })
        .await;
    assert_eq!(h.client.expect_rst(1).await, ErrorCode::ProtocolError);
    assert_connection_alive(&mut h.client).await;
}

#[tokio::test]
async fn test_data_after_end_stream_is_stream_closed() {
    let handler = |_req: Request, mut res: ResponseWriter| async move {
        res.send_response(Response::new(200), false).await?;
        std::future::pending::<()>().await;
        Ok::<(), HandlerError>(())
    };
    let mut h = start(ServerConfig::default(), handler);
    h.client.handshake().await;
    h.client.request(1, "GET", "/", &[], true).await;
    h.client.expect(|f| matches!(f, Frame::Headers { stream_id: 1, .. })).await;

    h.client.data(1, b"late", false).await;
    assert_eq!(h.client.expect_rst(1).await, ErrorCode::StreamClosed);
}

#[tokio::test]
async fn test_peer_reset_fails_handler_writes() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let resume = Arc::new(Notify::new());
    let handler = {
        let resume = resume.clone();
        move |_req: Request, mut res: ResponseWriter| {
            let (tx, resume) = (tx.clone(), resume.clone());
            async move {
                res.send_response(Response::new(200), false).await?;
                resume.notified().await;
                let _ = tx.send(res.send_data(Bytes::from_static(b"too late"), true).await);
                Ok::<(), HandlerError>(())
            }
        }
    };
    let mut h = start(ServerConfig::default(), handler);
    h.client.handshake().await;

    h.client.request(1, "GET", "/", &[], true).await;
    h.client.expect(|f| matches!(f, Frame::Headers { stream_id: 1, .. })).await;
    h.client
        .send(Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        })
        .await;
    assert_connection_alive(&mut h.client).await;

    resume.notify_one();
    assert_eq!(rx.recv().await.unwrap(), Err(StreamError::Reset(ErrorCode::Cancel)));
}

#[tokio::test]
async fn test_control_frame_flood_closes_connection() {
    let config = ServerConfig {
        max_queued_control_frames: 8,
        ..ServerConfig::default()
    };
    let mut h = start_with_buffer(config, ok_handler, 128);
    h.client.handshake().await;

    // Never read the acknowledgements.
    let mut pings = Vec::new();
    for i in 0..500u32 {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&i.to_be_bytes());
        pings.extend_from_slice(&Frame::Ping { ack: false, data }.to_bytes());
    }
    let _ = h.client.send_raw(&pings).await;

    assert!(matches!(h.server_result().await, Err(ServeError::ControlFrameFlood(_))));
}

#[tokio::test]
async fn test_control_characters_in_pseudo_header_are_stream_error() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    h.client.request(1, "GET", "/a\nb", &[], true).await;
    assert_eq!(h.client.expect_rst(1).await, ErrorCode::ProtocolError);

    let block = h.client.encode(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":path", "/"),
        (":authority", "x\0y"),
    ]);
    h.client
        .send(Frame::Headers {
            stream_id: 3,
            block,
            end_stream: true,
            end_headers: true,
            priority: None,
            pad_len: None,
        })
        .await;
    assert_eq!(h.client.expect_rst(3).await, ErrorCode::ProtocolError);

    assert_connection_alive(&mut h.client).await;
}

#[tokio::test]
async fn test_data_on_idle_stream_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client.data(1, b"x", false).await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_rst_stream_on_idle_stream_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client.request(1, "GET", "/", &[], true).await;
    assert_eq!(h.client.read_response(1).await.status, 200);
    h.client
        .send(Frame::RstStream {
            stream_id: 3,
            error_code: ErrorCode::Cancel,
        })
        .await;
    assert_eq!(h.client.expect_goaway().await, (1, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_window_update_on_idle_stream_is_fatal() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;
    h.client
        .send(Frame::WindowUpdate {
            stream_id: 5,
            increment: 1024,
        })
        .await;
    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::ProtocolError));
}

#[tokio::test]
async fn test_continuation_flood_reports_flooding_stream_as_processed() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    let block = h.client.request_block("GET", "/", &[]);
    let mut flood = Frame::Headers {
        stream_id: 1,
        block,
        end_stream: true,
        end_headers: false,
        priority: None,
        pad_len: None,
    }
    .to_bytes()
    .to_vec();
    for _ in 0..1000 {
        let fragment = Frame::Continuation {
            stream_id: 1,
            block: Bytes::from_static(b"\x00"),
            end_headers: false,
        };
        flood.extend_from_slice(&fragment.to_bytes());
    }
    let _ = h.client.send_raw(&flood).await;

    assert_eq!(h.client.expect_goaway().await, (1, ErrorCode::EnhanceYourCalm));
    assert!(matches!(
        h.server_result().await,
        Err(ServeError::Protocol {
            code: ErrorCode::EnhanceYourCalm,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unknown_frame_types_are_ignored_on_any_stream() {
    let mut h = start(ServerConfig::default(), ok_handler);
    h.client.handshake().await;

    for stream_id in [0, 1, 7] {
        h.client
            .send(Frame::Unknown {
                frame_type: 0xfa,
                flags: 0x3,
                stream_id,
                payload: Bytes::from_static(b"extension"),
            })
            .await;
    }
    assert_connection_alive(&mut h.client).await;
    h.client.request(1, "GET", "/", &[], true).await;
    assert_eq!(h.client.read_response(1).await.status, 200);
}
