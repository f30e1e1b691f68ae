use super::*;
use std::time::Duration;

use shared::{
    domain::{CallId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{UserPayload, UserStatus},
};

use crate::test_support::{test_ws_url, FakeWire};

fn fast_config() -> TransportConfig {
    TransportConfig {
        request_timeout: Duration::from_millis(50),
        max_attempts: 3,
        reconnect_initial: Duration::from_millis(1),
        reconnect_max: Duration::from_millis(10),
    }
}

async fn open_transport(config: TransportConfig) -> (Arc<FakeWire>, Arc<SessionTransport>) {
    let wire = FakeWire::new();
    let transport = SessionTransport::new(Arc::clone(&wire) as Arc<dyn WireConnector>, config);
    transport.open(test_ws_url()).await.expect("open");
    wire.wait_for_connects(1).await;
    (wire, transport)
}

fn user_payload(user_id: i64, username: &str) -> UserPayload {
    UserPayload {
        user_id: UserId(user_id),
        username: username.to_string(),
        display: None,
        avatar_url: None,
        status: UserStatus::Online,
        subscription: None,
        public_key: None,
    }
}

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let request = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser {
                    user_id: UserId(42),
                })
                .await
        }
    });

    let sent = wire.expect_sent_envelope().await;
    let id = sent.id.expect("request envelope carries an id");
    assert!(matches!(
        sent.body,
        EnvelopeBody::GetUser {
            user_id: UserId(42)
        }
    ));

    wire.inject_envelope(&Envelope::response(
        id,
        EnvelopeBody::UserResponse {
            user: user_payload(42, "a"),
        },
    ));

    let response = request.await.expect("join").expect("response");
    match response {
        EnvelopeBody::UserResponse { user } => assert_eq!(user.username, "a"),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn responses_correlate_by_id_not_arrival_order() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let first = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser { user_id: UserId(1) })
                .await
        }
    });
    let first_sent = wire.expect_sent_envelope().await;

    let second = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser { user_id: UserId(2) })
                .await
        }
    });
    let second_sent = wire.expect_sent_envelope().await;

    // Answer the second request first.
    wire.inject_envelope(&Envelope::response(
        second_sent.id.expect("id"),
        EnvelopeBody::UserResponse {
            user: user_payload(2, "second"),
        },
    ));
    wire.inject_envelope(&Envelope::response(
        first_sent.id.expect("id"),
        EnvelopeBody::UserResponse {
            user: user_payload(1, "first"),
        },
    ));

    match first.await.expect("join").expect("response") {
        EnvelopeBody::UserResponse { user } => assert_eq!(user.username, "first"),
        other => panic!("unexpected response: {other:?}"),
    }
    match second.await.expect("join").expect("response") {
        EnvelopeBody::UserResponse { user } => assert_eq!(user.username, "second"),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn timeout_retransmits_same_id_then_fails() {
    let (wire, transport) = open_transport(fast_config()).await;

    let request = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser {
                    user_id: UserId(42),
                })
                .await
        }
    });

    // One transmission per attempt, all with the same correlation id.
    let mut ids = Vec::new();
    for _ in 0..3 {
        let sent = wire.expect_sent_envelope().await;
        ids.push(sent.id.expect("id"));
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);

    let err = request.await.expect("join").expect_err("must time out");
    assert!(matches!(err, TransportError::Timeout { attempts: 3 }));

    // The retry budget is exact: no fourth transmission.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(wire.try_next_sent().await.is_none());
}

#[tokio::test]
async fn socket_close_rejects_all_outstanding_requests() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let first = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser { user_id: UserId(1) })
                .await
        }
    });
    let second = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser { user_id: UserId(2) })
                .await
        }
    });
    wire.expect_sent().await;
    wire.expect_sent().await;

    wire.close_socket();

    let first = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .expect("first rejected promptly")
        .expect("join");
    let second = tokio::time::timeout(Duration::from_secs(1), second)
        .await
        .expect("second rejected promptly")
        .expect("join");
    assert!(matches!(first, Err(TransportError::ConnectionLost)));
    assert!(matches!(second, Err(TransportError::ConnectionLost)));
}

#[tokio::test]
async fn close_rejects_outstanding_requests() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let request = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser {
                    user_id: UserId(42),
                })
                .await
        }
    });
    wire.expect_sent().await;

    transport.close().await;

    let result = request.await.expect("join");
    assert!(matches!(result, Err(TransportError::ConnectionLost)));
}

#[tokio::test]
async fn error_response_fails_the_request_with_api_error() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let request = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser {
                    user_id: UserId(42),
                })
                .await
        }
    });
    let sent = wire.expect_sent_envelope().await;

    wire.inject_envelope(&Envelope::response(
        sent.id.expect("id"),
        EnvelopeBody::Error {
            error: ApiError::new(ErrorCode::NotFound, "no such user"),
        },
    ));

    let err = request.await.expect("join").expect_err("must fail");
    match err {
        TransportError::Api(api) => assert_eq!(api.message, "no such user"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn push_handlers_run_in_registration_order_and_wire_order() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    for handler_index in 0..2 {
        let seen_tx = seen_tx.clone();
        transport
            .on_push(PushKind::MessageReceived, move |event| {
                if let PushEvent::Envelope(EnvelopeBody::MessageReceived { message }) = event {
                    let _ = seen_tx.send((handler_index, message.message_id));
                }
            })
            .await;
    }

    for message_id in [1, 2] {
        wire.inject_envelope(&Envelope::push(EnvelopeBody::MessageReceived {
            message: shared::protocol::MessagePayload {
                message_id: MessageId(message_id),
                sender_id: UserId(5),
                recipient_id: UserId(7),
                body: "hi".into(),
                sent_at: "2025-01-01T00:00:00Z".parse().expect("timestamp"),
            },
        }));
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        let entry = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("push delivered")
            .expect("channel open");
        order.push(entry);
    }
    assert_eq!(
        order,
        vec![
            (0, MessageId(1)),
            (1, MessageId(1)),
            (0, MessageId(2)),
            (1, MessageId(2)),
        ]
    );
}

#[tokio::test]
async fn unmatched_response_is_dropped_without_disturbing_others() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    // A response nobody asked for (e.g. answer to a cancelled retry).
    wire.inject_envelope(&Envelope::response(
        shared::protocol::CorrelationId::generate(),
        EnvelopeBody::UserResponse {
            user: user_payload(9, "stray"),
        },
    ));

    let request = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move {
            transport
                .request(EnvelopeBody::GetUser {
                    user_id: UserId(42),
                })
                .await
        }
    });
    let sent = wire.expect_sent_envelope().await;
    wire.inject_envelope(&Envelope::response(
        sent.id.expect("id"),
        EnvelopeBody::UserResponse {
            user: user_payload(42, "a"),
        },
    ));

    assert!(request.await.expect("join").is_ok());
}

#[tokio::test]
async fn reconnect_notifies_push_subscribers() {
    let (wire, transport) = open_transport(fast_config()).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    transport
        .on_push(PushKind::Reconnected, move |event| {
            if matches!(event, PushEvent::Reconnected) {
                let _ = seen_tx.send(());
            }
        })
        .await;

    wire.close_socket();
    wire.wait_for_connects(2).await;

    tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("reconnected push delivered")
        .expect("channel open");
}

#[tokio::test]
async fn send_is_fire_and_forget_without_correlation_id() {
    let (wire, transport) = open_transport(TransportConfig::default()).await;

    transport
        .send(EnvelopeBody::CallInvite {
            call_id: CallId::new("call-123"),
            from: UserId(1),
            to: UserId(7),
        })
        .expect("send");

    let sent = wire.expect_sent_envelope().await;
    assert!(sent.id.is_none());
    assert!(matches!(sent.body, EnvelopeBody::CallInvite { .. }));
}
