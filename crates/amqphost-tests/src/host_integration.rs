//! End-to-end scenarios against a container host over plain TCP.

use std::sync::Arc;
use std::time::Duration;

use amqphost_types::{
    condition, Body, DeliveryState, Detach, Disposition, Message, Performative, Role, Value,
};
use proptest::prelude::*;

use crate::client::{self, receiver, sender, TestClient};
use crate::harness::{Completion, EchoService, PanickingNode, RecordingNode, TestHost};

async fn connect(host: &TestHost) -> TestClient {
    TestClient::open(client::tcp(host.addr()).await.unwrap())
        .await
        .unwrap()
}

async fn expect_disposition(client: &TestClient) -> Disposition {
    client
        .expect(|_, p| match p {
            Performative::Disposition(d) => Some(d.clone()),
            _ => None,
        })
        .await
        .unwrap()
}

async fn expect_detach(client: &TestClient) -> Detach {
    client
        .expect(|_, p| match p {
            Performative::Detach(d) => Some(d.clone()),
            _ => None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_message_node_accepts_with_configured_credit() {
    let host = TestHost::start().await.unwrap();
    let node = RecordingNode::new(10, Completion::Accept);
    host.host().register_message_processor("echo", node.clone()).unwrap();

    let client = connect(&host).await;
    let channel = client.begin(0).await.unwrap();
    assert_eq!(channel, 0);
    let reply = client.attach(0, sender("s1", 0, "echo")).await.unwrap();
    assert_eq!(reply.role, Role::Receiver);
    assert_eq!(reply.target_address(), Some("echo"));
    assert_eq!(client.expect_credit(reply.handle).await.unwrap(), 10);

    client
        .transfer(0, 0, 0, &Message::with_value("hello"), false)
        .await
        .unwrap();
    let disposition = expect_disposition(&client).await;
    assert_eq!(disposition.role, Role::Receiver);
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert_eq!(disposition.state, Some(DeliveryState::Accepted));

    let messages = node.wait_for(1).await.unwrap();
    assert_eq!(messages[0].body_value(), Some(&Value::from("hello")));

    client.close().await.unwrap();
    let metrics = host.host().metrics();
    assert_eq!(metrics.messages_received, 1);
    assert_eq!(metrics.attaches_accepted, 1);
    host.stop().await;
}

#[tokio::test]
async fn test_address_lookup_ignores_case() {
    let host = TestHost::start().await.unwrap();
    host.host()
        .register_message_processor("Telemetry", RecordingNode::new(1, Completion::Accept))
        .unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    let reply = client.attach(0, sender("s1", 0, "TELEMETRY")).await.unwrap();
    assert!(reply.target.is_some());
    assert_eq!(client.expect_credit(reply.handle).await.unwrap(), 1);
    host.stop().await;
}

#[tokio::test]
async fn test_unknown_address_is_refused_with_not_found() {
    let host = TestHost::start().await.unwrap();
    let client = connect(&host).await;
    client.begin(0).await.unwrap();

    let reply = client.attach(0, sender("s1", 0, "nowhere")).await.unwrap();
    assert!(reply.target.is_none());
    let detach = expect_detach(&client).await;
    assert!(detach.closed);
    let error = detach.error.unwrap();
    assert_eq!(error.condition, condition::NOT_FOUND);
    assert_eq!(error.description.as_deref(), Some("No processor was found at nowhere"));
    assert_eq!(host.host().metrics().attaches_rejected, 1);
    host.stop().await;
}

#[tokio::test]
async fn test_receiver_on_message_node_is_not_allowed() {
    let host = TestHost::start().await.unwrap();
    host.host()
        .register_message_processor("echo", RecordingNode::new(1, Completion::Accept))
        .unwrap();
    let client = connect(&host).await;
    client.begin(0).await.unwrap();

    client.attach(0, receiver("r1", 0, "echo", "me")).await.unwrap();
    let detach = expect_detach(&client).await;
    assert_eq!(detach.error.unwrap().condition, condition::NOT_ALLOWED);
    host.stop().await;
}

#[tokio::test]
async fn test_request_is_answered_on_response_link() {
    let host = TestHost::start().await.unwrap();
    let service = Arc::new(EchoService::default());
    host.host().register_request_processor("svc", service.clone()).unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    let responses = client
        .attach(0, receiver("responses", 0, "svc", "client-reply-1"))
        .await
        .unwrap();
    assert_eq!(responses.role, Role::Sender);
    assert_eq!(responses.initial_delivery_count, Some(0));
    client.flow(0, 0, 0, 10).await.unwrap();

    let requests = client.attach(0, sender("requests", 1, "svc")).await.unwrap();
    assert_eq!(client.expect_credit(requests.handle).await.unwrap(), 300);

    let mut request = Message::with_value("ping");
    request.properties_mut().message_id = Some(Value::from("req-1"));
    request.properties_mut().reply_to = Some("client-reply-1".to_string());
    client.transfer(0, 1, 0, &request, false).await.unwrap();

    let (transfer, response) = client.recv_message(responses.handle).await.unwrap();
    assert_eq!(transfer.settled, Some(true));
    assert_eq!(response.body_value(), Some(&Value::from("ping")));
    assert_eq!(
        response.properties.unwrap().correlation_id,
        Some(Value::from("req-1"))
    );
    assert!(service.failures().is_empty());
    host.stop().await;
}

#[tokio::test]
async fn test_request_without_response_link_is_rejected() {
    let host = TestHost::start().await.unwrap();
    let service = Arc::new(EchoService::default());
    host.host().register_request_processor("svc", service.clone()).unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    client.attach(0, sender("requests", 0, "svc")).await.unwrap();

    let mut request = Message::with_value("ping");
    request.properties_mut().reply_to = Some("nobody".to_string());
    client.transfer(0, 0, 0, &request, false).await.unwrap();

    let disposition = expect_disposition(&client).await;
    assert!(disposition.settled);
    match disposition.state {
        Some(DeliveryState::Rejected { error: Some(error) }) => {
            assert_eq!(error.condition, condition::NOT_FOUND)
        }
        other => panic!("unexpected state {:?}", other),
    }
    host.stop().await;
}

#[tokio::test]
async fn test_duplicate_response_link_is_refused() {
    let host = TestHost::start().await.unwrap();
    host.host()
        .register_request_processor("svc", Arc::new(EchoService::default()))
        .unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    let first = client.attach(0, receiver("a", 0, "svc", "reply")).await.unwrap();
    assert!(first.source.is_some());
    let second = client.attach(0, receiver("b", 1, "svc", "REPLY")).await.unwrap();
    assert!(second.source.is_none());
    let detach = expect_detach(&client).await;
    assert_eq!(detach.error.unwrap().condition, condition::NOT_ALLOWED);
    host.stop().await;
}

#[tokio::test]
async fn test_registration_is_unique_until_unregistered() {
    let host = TestHost::start().await.unwrap();
    let registry = host.host();
    registry
        .register_message_processor("orders", RecordingNode::new(1, Completion::Accept))
        .unwrap();
    assert!(registry
        .register_message_processor("ORDERS", RecordingNode::new(1, Completion::Accept))
        .is_err());

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    client.attach(0, sender("s1", 0, "orders")).await.unwrap();

    registry.unregister_message_processor("orders");
    let detach = expect_detach(&client).await;
    let error = detach.error.unwrap();
    assert_eq!(error.condition, condition::DETACH_FORCED);
    assert_eq!(error.description.as_deref(), Some("Processor was unregistered."));

    registry
        .register_message_processor("orders", RecordingNode::new(1, Completion::Accept))
        .unwrap();
    host.stop().await;
}

#[tokio::test]
async fn test_dispose_settles_once() {
    let host = TestHost::start().await.unwrap();
    let node = RecordingNode::new(5, Completion::Hold);
    host.host().register_message_processor("held", node.clone()).unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    client.attach(0, sender("s1", 0, "held")).await.unwrap();
    client.transfer(0, 0, 0, &Message::with_value(1u32), false).await.unwrap();
    client.transfer(0, 0, 1, &Message::with_value(2u32), false).await.unwrap();
    node.wait_for(2).await.unwrap();

    let held = node.held();
    held[0].accept();
    held[0].accept();
    held[0].reject(None);
    assert!(held[0].is_settled());
    held[1].release();

    let first = expect_disposition(&client).await;
    assert_eq!((first.first, first.state), (0, Some(DeliveryState::Accepted)));
    let second = expect_disposition(&client).await;
    assert_eq!((second.first, second.state), (1, Some(DeliveryState::Released)));
    host.stop().await;
}

#[tokio::test]
async fn test_multi_frame_delivery_is_reassembled() {
    let host = TestHost::start().await.unwrap();
    let node = RecordingNode::new(10, Completion::Accept);
    host.host().register_message_processor("bulk", node.clone()).unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    client.attach(0, sender("s1", 0, "bulk")).await.unwrap();

    let message = Message::with_data(vec![0xAB; 3000]);
    let frames = client.transfer(0, 0, 0, &message, false).await.unwrap();
    assert!(frames > 1);
    let messages = node.wait_for(1).await.unwrap();
    assert_eq!(messages[0].body, message.body);
    assert_eq!(expect_disposition(&client).await.state, Some(DeliveryState::Accepted));
    host.stop().await;
}

#[tokio::test]
async fn test_listener_close_closes_connections() {
    let host = TestHost::start().await.unwrap();
    let client = connect(&host).await;
    client.begin(0).await.unwrap();

    let stopping = tokio::spawn(host.stop());
    let error = client
        .expect(|_, p| match p {
            Performative::Close(c) => Some(c.error.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert!(error.is_none());
    stopping.await.unwrap();
}

#[tokio::test]
async fn test_panicking_processor_leaves_delivery_unsettled() {
    let host = TestHost::start().await.unwrap();
    host.host()
        .register_message_processor("fragile", Arc::new(PanickingNode))
        .unwrap();
    let node = RecordingNode::new(5, Completion::Accept);
    host.host().register_message_processor("steady", node.clone()).unwrap();

    let client = connect(&host).await;
    client.begin(0).await.unwrap();
    client.attach(0, sender("s1", 0, "fragile")).await.unwrap();
    client.attach(0, sender("s2", 1, "steady")).await.unwrap();
    client
        .transfer(0, 0, 0, &Message::with_value("boom"), false)
        .await
        .unwrap();
    client
        .transfer(0, 1, 1, &Message::with_value("fine"), false)
        .await
        .unwrap();

    let disposition = expect_disposition(&client).await;
    assert_eq!(disposition.first, 1);
    assert_eq!(disposition.state, Some(DeliveryState::Accepted));
    assert_eq!(node.wait_for(1).await.unwrap().len(), 1);
    client.close().await.unwrap();

    let listener = &host.host().listeners()[0];
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while host.host().metrics().connections_closed < 1 || !listener.connections().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok());
    let metrics = host.host().metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.connections_closed, 1);
    assert_eq!(metrics.messages_received, 2);
    host.stop().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_any_payload_size_is_delivered_intact(len in 1usize..4096, fill in any::<u8>()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let body = runtime.block_on(async {
            let host = TestHost::start().await.unwrap();
            let node = RecordingNode::new(1, Completion::Accept);
            host.host().register_message_processor("sized", node.clone()).unwrap();
            let client = connect(&host).await;
            client.begin(0).await.unwrap();
            client.attach(0, sender("s1", 0, "sized")).await.unwrap();
            client
                .transfer(0, 0, 0, &Message::with_data(vec![fill; len]), false)
                .await
                .unwrap();
            let messages = node.wait_for(1).await.unwrap();
            host.stop().await;
            messages[0].body.clone()
        });
        prop_assert_eq!(body, Body::Data(vec![bytes::Bytes::from(vec![fill; len])]));
    }
}
