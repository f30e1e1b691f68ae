use super::*;
use std::time::Duration;

use shared::{domain::CallId, protocol::Envelope};

use crate::{
    call::CallPhase,
    test_support::FakeWire,
    transport::TransportConfig,
};

struct StaticAuthorizer;

#[async_trait]
impl CallAuthorizer for StaticAuthorizer {
    async fn issue_call_token(&self, call_id: &CallId) -> Result<String, AuthError> {
        Ok(format!("tok-{call_id}"))
    }
}

async fn fake_client() -> (Arc<FakeWire>, Arc<SessionClient>) {
    let wire = FakeWire::new();
    let settings = ClientSettings {
        transport: TransportConfig {
            reconnect_initial: Duration::from_millis(1),
            ..TransportConfig::default()
        },
        ..ClientSettings::default()
    };
    let client = SessionClient::with_dependencies(
        settings,
        ClientDependencies {
            wire: Arc::clone(&wire) as Arc<dyn WireConnector>,
            authorizer: Arc::new(StaticAuthorizer),
            room_connector: Arc::new(MissingRoomConnector),
            capture: capture::backend_for(capture::Platform::Unsupported, None),
            store: None,
        },
    )
    .await;
    client.open().await.expect("open");
    wire.wait_for_connects(1).await;
    (wire, client)
}

#[tokio::test]
async fn send_message_resolves_with_the_server_ack() {
    let (wire, client) = fake_client().await;

    let send = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.send_message(UserId(7), "hello".into()).await }
    });

    let sent = wire.expect_sent_envelope().await;
    let id = sent.id.expect("correlated request");
    match &sent.body {
        EnvelopeBody::SendMessage { to, body } => {
            assert_eq!(*to, UserId(7));
            assert_eq!(body, "hello");
        }
        other => panic!("unexpected envelope: {other:?}"),
    }

    wire.inject_envelope(&Envelope::response(
        id,
        EnvelopeBody::MessageAck {
            message_id: MessageId(99),
        },
    ));

    let message_id = send.await.expect("join").expect("ack");
    assert_eq!(message_id, MessageId(99));
}

#[tokio::test]
async fn call_connect_failure_surfaces_through_the_error_slot() {
    let (_wire, client) = fake_client().await;

    let err = client
        .calls()
        .connect("tok".into(), CallId::new("call-123"), None)
        .await
        .expect_err("missing connector must fail");
    assert!(matches!(err, CallError::Connect(_)));
    assert_eq!(client.calls().phase().await, CallPhase::Failed);

    let surfaced = client.current_error().expect("error surfaced");
    assert!(surfaced.message.contains("call-123"));
}

#[tokio::test]
async fn error_slot_is_last_write_wins() {
    let slot = LastErrorSlot::new();

    slot.report("first", "first description");
    slot.report("second", "second description");

    let current = slot.current().expect("error present");
    assert_eq!(current.message, "second");
    assert_eq!(current.description, "second description");

    slot.clear();
    assert!(slot.current().is_none());
}

#[tokio::test]
async fn close_is_safe_even_before_open() {
    let wire = FakeWire::new();
    let client = SessionClient::with_dependencies(
        ClientSettings::default(),
        ClientDependencies {
            wire: Arc::clone(&wire) as Arc<dyn WireConnector>,
            authorizer: Arc::new(StaticAuthorizer),
            room_connector: Arc::new(MissingRoomConnector),
            capture: capture::backend_for(capture::Platform::Unsupported, None),
            store: None,
        },
    )
    .await;

    client.close().await;
    assert_eq!(client.calls().phase().await, CallPhase::Idle);
}

#[tokio::test]
async fn close_rejects_requests_in_flight() {
    let (wire, client) = fake_client().await;

    let send = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.send_message(UserId(7), "hello".into()).await }
    });
    wire.expect_sent().await;

    client.close().await;

    let err = send.await.expect("join").expect_err("must fail");
    assert!(matches!(err, ClientError::ConnectionLost));
}
