// Connection lifecycle: queuing before connect, close semantics, heartbeat
// faulting, authentication, TLS and reconnect limits.
mod common;

use std::time::Duration;

use strom_client::{
    Client, ClientEvent, EventData, ExpectedVersion, OperationError, Settings, TlsMode,
};
use strom_test_harness::HarnessNode;
use tokio::sync::broadcast;

use common::{base_settings, connect_client, node_and_client};

fn test_event() -> EventData {
    EventData::json("ping", &serde_json::json!({})).expect("event")
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_issued_before_connect_complete_after_it() {
    let node = HarnessNode::start().await.expect("start node");
    let client = Client::new(base_settings(&node).build().expect("settings"));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .append_to_stream("pre-1", ExpectedVersion::Any, vec![test_event()])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.connect().expect("connect");

    let result = pending.await.expect("task");
    assert_eq!(result.expect("append").next_expected_version, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_fails_pending_operations_with_connection_closed() {
    let node = HarnessNode::start().await.expect("start node");
    let client = Client::new(base_settings(&node).build().expect("settings"));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .append_to_stream("pre-2", ExpectedVersion::Any, vec![test_event()])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await;

    let result = pending.await.expect("task");
    assert!(matches!(result, Err(OperationError::ConnectionClosed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_queue_bound_rejects_the_overflowing_operation() {
    let node = HarnessNode::start().await.expect("start node");
    let client = Client::new(
        base_settings(&node)
            .max_operation_queue_size(1)
            .build()
            .expect("settings"),
    );

    // Never connected, so the first operation parks in the waiting queue.
    let parked = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .append_to_stream("ovf", ExpectedVersion::Any, vec![test_event()])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .append_to_stream("ovf", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect_err("overflow");
    assert!(matches!(
        err,
        OperationError::OperationQueueOverflow { max: 1 }
    ));

    client.close().await;
    assert!(matches!(
        parked.await.expect("task"),
        Err(OperationError::ConnectionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_timeout_faults_the_channel_and_reconnects() {
    let node = HarnessNode::start().await.expect("start node");
    let client = Client::new(
        base_settings(&node)
            .heartbeat_interval(Duration::from_millis(100))
            .heartbeat_timeout(Duration::from_millis(300))
            .build()
            .expect("settings"),
    );
    let mut events = client.events();
    client.connect().expect("connect");
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Connected(_))
    })
    .await;

    node.mute_heartbeats(true);
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Disconnected(_))
    })
    .await;
    node.mute_heartbeats(false);
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Connected(_))
    })
    .await;

    let result = client
        .append_to_stream("hb-1", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect("append after recovery");
    assert_eq!(result.next_expected_version, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_authentication_closes_the_client() {
    let node = HarnessNode::start().await.expect("start node");
    node.reject_auth(true);
    let client = Client::new(
        base_settings(&node)
            .user_credentials("admin", "wrong")
            .build()
            .expect("settings"),
    );
    let mut events = client.events();
    client.connect().expect("connect");

    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::AuthenticationFailed(_))
    })
    .await;
    wait_for(&mut events, |event| matches!(event, ClientEvent::Closed(_))).await;

    let err = client
        .append_to_stream("auth-1", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect_err("client closed");
    assert!(matches!(err, OperationError::ConnectionClosed));
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_authentication_reaches_connected() {
    let node = HarnessNode::start().await.expect("start node");
    let client = connect_client(base_settings(&node).user_credentials("admin", "changeit"));

    let result = client
        .append_to_stream("auth-2", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect("append");
    assert_eq!(result.next_expected_version, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_with_matching_common_name_works_end_to_end() {
    let node = HarnessNode::start_tls("strom-node").await.expect("start node");
    let client = connect_client(
        Settings::builder()
            .single_node(node.addr())
            .reconnection_delay(Duration::from_millis(50))
            .tls(TlsMode::CommonName("strom-node".to_string())),
    );

    client
        .append_to_stream("tls-1", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect("append over tls");
    let slice = client
        .read_stream_events_forward("tls-1", 0, 10, false)
        .await
        .expect("read over tls");
    assert_eq!(slice.events.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_trust_all_accepts_any_certificate() {
    let node = HarnessNode::start_tls("whoever").await.expect("start node");
    let client = connect_client(
        Settings::builder()
            .single_node(node.addr())
            .reconnection_delay(Duration::from_millis(50))
            .tls(TlsMode::TrustAll),
    );

    client
        .append_to_stream("tls-2", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect("append over tls");
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_reconnect_allowance_closes_the_client() {
    let node = HarnessNode::start().await.expect("start node");
    let client = Client::new(
        base_settings(&node)
            .max_reconnections(0)
            .build()
            .expect("settings"),
    );
    let mut events = client.events();
    client.connect().expect("connect");
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Connected(_))
    })
    .await;

    node.drop_connections();
    wait_for(&mut events, |event| matches!(event, ClientEvent::Closed(_))).await;

    let err = client
        .append_to_stream("rc-1", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect_err("client closed");
    assert!(matches!(err, OperationError::ConnectionClosed));
}

#[tokio::test(flavor = "multi_thread")]
async fn per_operation_credentials_override_the_defaults() {
    let (_node, client) = node_and_client().await;
    let elevated = client.with_credentials(strom_client::Credentials::new("ops", "secret"));
    elevated
        .append_to_stream("cred-1", ExpectedVersion::Any, vec![test_event()])
        .await
        .expect("append with override");
}
