// Transaction semantics: create-on-commit, expectation validation, empty
// commits, parallel writers and deletes racing a commit.
mod common;

use strom_client::{EventData, ExpectedVersion, OperationError};

use common::node_and_client;

fn test_event(kind: &str) -> EventData {
    EventData::json("test", &serde_json::json!({ "kind": kind })).expect("event")
}

#[tokio::test(flavor = "multi_thread")]
async fn starts_on_fresh_stream_and_creates_it_on_commit() {
    let (_node, client) = node_and_client().await;

    let transaction = client
        .start_transaction("tx-1", ExpectedVersion::NoStream)
        .await
        .expect("start");
    transaction
        .write(vec![test_event("transactional")])
        .await
        .expect("write");
    let result = transaction.commit().await.expect("commit");
    assert_eq!(result.next_expected_version, 0);

    let slice = client
        .read_stream_events_forward("tx-1", 0, 1, false)
        .await
        .expect("read");
    assert_eq!(slice.events.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_validates_the_expected_version() {
    let (_node, client) = node_and_client().await;

    let transaction = client
        .start_transaction("tx-2", ExpectedVersion::Exact(100500))
        .await
        .expect("start");
    transaction
        .write(vec![test_event("transactional")])
        .await
        .expect("write");
    let err = transaction.commit().await.expect_err("wrong version");
    assert!(matches!(err, OperationError::WrongExpectedVersion { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_commit_on_fresh_stream_leaves_it_missing() {
    let (_node, client) = node_and_client().await;

    let transaction = client
        .start_transaction("tx-3", ExpectedVersion::NoStream)
        .await
        .expect("start");
    let result = transaction.commit().await.expect("commit");
    assert_eq!(result.next_expected_version, -1);

    let slice = client
        .read_stream_events_forward("tx-3", 0, 1, false)
        .await
        .expect("read");
    assert!(slice.events.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_transaction_and_plain_appends_with_any() {
    let (_node, client) = node_and_client().await;
    const TRANSACTIONAL: usize = 500;
    const PLAIN: usize = 500;

    let transactional = {
        let client = client.clone();
        tokio::spawn(async move {
            let transaction = client
                .start_transaction("tx-4", ExpectedVersion::Any)
                .await
                .expect("start");
            for _ in 0..TRANSACTIONAL {
                transaction
                    .write(vec![test_event("transactional")])
                    .await
                    .expect("write");
            }
            transaction.commit().await.expect("commit");
        })
    };
    let plain = {
        let client = client.clone();
        tokio::spawn(async move {
            for _ in 0..PLAIN {
                client
                    .append_to_stream("tx-4", ExpectedVersion::Any, vec![test_event("plain")])
                    .await
                    .expect("append");
            }
        })
    };
    transactional.await.expect("transactional task");
    plain.await.expect("plain task");

    let slice = client
        .read_stream_events_forward("tx-4", 0, 2000, false)
        .await
        .expect("read");
    assert_eq!(slice.events.len(), TRANSACTIONAL + PLAIN);
    let transactional_count = slice
        .events
        .iter()
        .filter(|event| {
            let record = event.event.as_ref().expect("record");
            let body: serde_json::Value = serde_json::from_slice(&record.data).expect("json");
            body["kind"] == "transactional"
        })
        .count();
    assert_eq!(transactional_count, TRANSACTIONAL);
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_after_hard_delete_fails_with_stream_deleted() {
    let (_node, client) = node_and_client().await;

    let transaction = client
        .start_transaction("tx-5", ExpectedVersion::NoStream)
        .await
        .expect("start");
    transaction
        .write(vec![test_event("transactional")])
        .await
        .expect("write");
    client
        .delete_stream("tx-5", ExpectedVersion::NoStream, true)
        .await
        .expect("delete");
    let err = transaction.commit().await.expect_err("stream deleted");
    assert!(matches!(err, OperationError::StreamDeleted(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_transaction_handle_cannot_be_reused() {
    let (_node, client) = node_and_client().await;

    let transaction = client
        .start_transaction("tx-6", ExpectedVersion::Any)
        .await
        .expect("start");
    transaction.commit().await.expect("commit");
    let err = transaction
        .write(vec![test_event("late")])
        .await
        .expect_err("committed");
    assert!(matches!(err, OperationError::InvalidArgument(_)));
}
