//! Flow control in both directions

use bytes::Bytes;
use h2_serve::{
    settings_id, ErrorCode, Frame, HandlerError, Request, Response, ResponseWriter, ServeError, ServerConfig, StreamError,
    CONNECTION_PREFACE,
};
use tokio::sync::mpsc;

use super::support::{echo_handler, start, wait_for_stats};

#[tokio::test]
async fn test_content_length_overrun_resets_and_returns_credit() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |mut req: Request, _res: ResponseWriter| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(req.body.read_to_end().await);
            Ok::<(), HandlerError>(())
        }
    };
    let mut h = start(ServerConfig::default(), handler);
    h.client.handshake().await;

    h.client
        .request(1, "POST", "/", &[("content-length", "4")], false)
        .await;
    h.client.data(1, b"12345", true).await;

    assert_eq!(h.client.expect_rst(1).await, ErrorCode::ProtocolError);
    assert_eq!(
        rx.recv().await.unwrap(),
        Err(StreamError::ContentLength {
            declared: 4,
            received: 5
        })
    );
    let stats = wait_for_stats(&h.handle, |s| s.streams == 0).await;
    assert_eq!(stats.recv_window_outstanding, 0);
}

#[tokio::test]
async fn test_connection_window_overflow_is_fatal() {
    let mut h = start(ServerConfig::default(), echo_handler);
    h.client.handshake().await;

    h.client
        .send(Frame::WindowUpdate {
            stream_id: 0,
            increment: 0x7fff_ffff,
        })
        .await;

    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::FlowControlError));
    h.client.expect_eof().await;
    assert!(matches!(
        h.server_result().await,
        Err(ServeError::Protocol {
            code: ErrorCode::FlowControlError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_window_updates_follow_body_consumption() {
    let config = ServerConfig {
        initial_stream_window_size: 65_535,
        initial_connection_window_size: 65_535,
        ..ServerConfig::default()
    };
    let mut h = start(config, echo_handler);
    h.client.handshake().await;

    h.client.request(1, "POST", "/", &[], false).await;
    let body = vec![b'a'; 40_000];
    for chunk in body.chunks(16_384) {
        h.client.data(1, chunk, false).await;
    }

    let (mut stream_credit, mut conn_credit) = (0, 0);
    while stream_credit == 0 || conn_credit == 0 {
        match h.client.expect(|f| matches!(f, Frame::WindowUpdate { .. })).await {
            Frame::WindowUpdate { stream_id: 1, increment } => stream_credit += increment,
            Frame::WindowUpdate { stream_id: 0, increment } => conn_credit += increment,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(stream_credit >= 32_767);
    assert!(conn_credit >= 32_767);

    h.client.data(1, b"", true).await;
    let response = h.client.read_response(1).await;
    assert_eq!(response.body.len(), 40_000);
}

#[tokio::test]
async fn test_response_waits_for_peer_credit() {
    let handler = |_req: Request, mut res: ResponseWriter| async move {
        res.send_response(Response::new(200), false).await?;
        res.send_data(Bytes::from(vec![b'x'; 25]), true).await?;
        Ok::<(), HandlerError>(())
    };
    let mut h = start(ServerConfig::default(), handler);
    h.client
        .handshake_with(vec![(settings_id::INITIAL_WINDOW_SIZE, 10)])
        .await;

    h.client.request(1, "GET", "/", &[], true).await;
    match h.client.expect(|f| matches!(f, Frame::Data { .. })).await {
        Frame::Data { data, end_stream, .. } => {
            assert_eq!(data.len(), 10);
            assert!(!end_stream);
        }
        _ => unreachable!(),
    }

    h.client
        .send(Frame::WindowUpdate {
            stream_id: 1,
            increment: 15,
        })
        .await;
    match h.client.expect(|f| matches!(f, Frame::Data { .. })).await {
        Frame::Data { data, end_stream, .. } => {
            assert_eq!(data.len(), 15);
            assert!(end_stream);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_initial_window_size_above_max_is_flow_control_error() {
    let mut h = start(ServerConfig::default(), echo_handler);
    h.client.send_raw(CONNECTION_PREFACE).await.unwrap();
    h.client
        .send(Frame::Settings {
            ack: false,
            settings: vec![(settings_id::INITIAL_WINDOW_SIZE, 0x8000_0000)],
        })
        .await;

    assert_eq!(h.client.expect_goaway().await, (0, ErrorCode::FlowControlError));
}

#[tokio::test]
async fn test_window_update_on_stream_overflow_resets_stream() {
    let handler = |_req: Request, mut res: ResponseWriter| async move {
        res.send_response(Response::new(200), false).await?;
        std::future::pending::<()>().await;
        Ok::<(), HandlerError>(())
    };
    let mut h = start(ServerConfig::default(), handler);
    h.client.handshake().await;

    h.client.request(1, "GET", "/", &[], true).await;
    h.client.expect(|f| matches!(f, Frame::Headers { stream_id: 1, .. })).await;
    h.client
        .send(Frame::WindowUpdate {
            stream_id: 1,
            increment: 0x7fff_ffff,
        })
        .await;
    assert_eq!(h.client.expect_rst(1).await, ErrorCode::FlowControlError);

    // The connection itself is fine.
    h.client.send(Frame::Ping { ack: false, data: [9; 8] }).await;
    h.client.expect(|f| matches!(f, Frame::Ping { ack: true, data } if *data == [9; 8])).await;
}
