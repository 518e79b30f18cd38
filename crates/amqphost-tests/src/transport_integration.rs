//! WebSocket and raw socket scenarios.

use std::time::Duration;

use amqphost_types::{condition, DeliveryState, Message, Performative, ProtocolHeader};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client::{self, sender, TestClient};
use crate::harness::{test_settings, Completion, RecordingNode, TestHost};

#[tokio::test]
async fn test_websocket_listener_serves_messages() {
    let host = TestHost::start_on("ws://127.0.0.1:0/amqp", test_settings())
        .await
        .unwrap();
    let node = RecordingNode::new(5, Completion::Accept);
    host.host().register_message_processor("ws-node", node.clone()).unwrap();

    let transport = client::websocket(host.addr(), "/amqp").await.unwrap();
    let client = TestClient::open(transport).await.unwrap();
    client.begin(0).await.unwrap();
    client.attach(0, sender("s1", 0, "ws-node")).await.unwrap();
    client
        .transfer(0, 0, 0, &Message::with_data(vec![7u8; 2000]), false)
        .await
        .unwrap();
    let state = client
        .expect(|_, p| match p {
            Performative::Disposition(d) => Some(d.state.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(state, Some(DeliveryState::Accepted));
    assert_eq!(node.wait_for(1).await.unwrap().len(), 1);
    client.close().await.unwrap();
    host.stop().await;
}

#[tokio::test]
async fn test_websocket_wrong_path_is_refused() {
    let host = TestHost::start_on("ws://127.0.0.1:0/amqp", test_settings())
        .await
        .unwrap();
    assert!(client::websocket(host.addr(), "/other").await.is_err());
    host.stop().await;
}

#[tokio::test]
async fn test_unsupported_header_gets_supported_header() {
    let host = TestHost::start().await.unwrap();
    let mut stream = TcpStream::connect(host.addr()).await.unwrap();
    stream.write_all(b"AMQP\x00\x02\x00\x00").await.unwrap();

    let mut reply = [0u8; 8];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, ProtocolHeader::amqp().to_bytes());
    host.stop().await;
}

#[tokio::test]
async fn test_garbage_frame_closes_with_decode_error() {
    let host = TestHost::start().await.unwrap();
    let client = TestClient::open(client::tcp(host.addr()).await.unwrap())
        .await
        .unwrap();
    client
        .send_raw(Bytes::from_static(&[0, 0, 0, 12, 2, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]))
        .await
        .unwrap();
    let error = client
        .expect(|_, p| match p {
            Performative::Close(c) => Some(c.error.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(error.unwrap().condition, condition::DECODE_ERROR);
    host.stop().await;
}

#[tokio::test]
async fn test_open_advertises_negotiated_limits() {
    let host = TestHost::start().await.unwrap();
    let client = TestClient::open(client::tcp(host.addr()).await.unwrap())
        .await
        .unwrap();
    let open = client.remote_open();
    assert_eq!(open.channel_max, 255);
    assert!(open.max_frame_size >= 512);
    client.close().await.unwrap();
    host.stop().await;
}
