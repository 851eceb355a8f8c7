// Append/read round trips, deletes and stream metadata against the harness
// node.
mod common;

use strom_client::{
    EventData, EventReadStatus, ExpectedVersion, OperationError, Position, SliceReadStatus,
    StreamAcl, StreamMetadata,
};

use common::node_and_client;

fn numbered_events(count: usize) -> Vec<EventData> {
    (0..count)
        .map(|index| {
            EventData::json("counted", &serde_json::json!({ "index": index })).expect("event")
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn append_then_read_forward_returns_events_in_order() {
    let (_node, client) = node_and_client().await;

    let events = numbered_events(10);
    let ids: Vec<_> = events.iter().map(|event| event.event_id).collect();
    let write = client
        .append_to_stream("orders-1", ExpectedVersion::NoStream, events)
        .await
        .expect("append");
    assert_eq!(write.next_expected_version, 9);

    let slice = client
        .read_stream_events_forward("orders-1", 0, 100, false)
        .await
        .expect("read");
    assert_eq!(slice.status, SliceReadStatus::Success);
    assert!(slice.is_end_of_stream);
    let numbers: Vec<i64> = slice
        .events
        .iter()
        .map(|event| event.original_event_number())
        .collect();
    assert_eq!(numbers, (0..10).collect::<Vec<i64>>());
    let read_ids: Vec<_> = slice
        .events
        .iter()
        .map(|event| event.event.as_ref().expect("record").event_id)
        .collect();
    assert_eq!(read_ids, ids);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_backward_returns_events_in_reverse() {
    let (_node, client) = node_and_client().await;
    client
        .append_to_stream("orders-2", ExpectedVersion::Any, numbered_events(5))
        .await
        .expect("append");

    let slice = client
        .read_stream_events_backward("orders-2", -1, 10, false)
        .await
        .expect("read");
    let numbers: Vec<i64> = slice
        .events
        .iter()
        .map(|event| event.original_event_number())
        .collect();
    assert_eq!(numbers, vec![4, 3, 2, 1, 0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_missing_stream_reports_not_found() {
    let (_node, client) = node_and_client().await;
    let slice = client
        .read_stream_events_forward("missing", 0, 10, false)
        .await
        .expect("read");
    assert_eq!(slice.status, SliceReadStatus::StreamNotFound);
    assert!(slice.events.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_event_addresses_the_last_event_with_minus_one() {
    let (_node, client) = node_and_client().await;
    client
        .append_to_stream("orders-3", ExpectedVersion::Any, numbered_events(3))
        .await
        .expect("append");

    let result = client
        .read_event("orders-3", -1, false)
        .await
        .expect("read event");
    assert_eq!(result.status, EventReadStatus::Success);
    assert_eq!(
        result.event.expect("event").original_event_number(),
        2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_expected_version_fails_the_append() {
    let (_node, client) = node_and_client().await;
    client
        .append_to_stream("orders-4", ExpectedVersion::NoStream, numbered_events(1))
        .await
        .expect("append");

    let err = client
        .append_to_stream("orders-4", ExpectedVersion::Exact(7), numbered_events(1))
        .await
        .expect_err("version conflict");
    assert!(matches!(
        err,
        OperationError::WrongExpectedVersion { expected: 7, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_deleted_stream_rejects_appends_and_reads() {
    let (_node, client) = node_and_client().await;
    client
        .append_to_stream("orders-5", ExpectedVersion::NoStream, numbered_events(1))
        .await
        .expect("append");
    client
        .delete_stream("orders-5", ExpectedVersion::Exact(0), true)
        .await
        .expect("delete");

    let err = client
        .append_to_stream("orders-5", ExpectedVersion::Any, numbered_events(1))
        .await
        .expect_err("append to deleted stream");
    assert!(matches!(err, OperationError::StreamDeleted(_)));

    let slice = client
        .read_stream_events_forward("orders-5", 0, 10, false)
        .await
        .expect("read");
    assert_eq!(slice.status, SliceReadStatus::StreamDeleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_all_covers_every_stream() {
    let (_node, client) = node_and_client().await;
    client
        .append_to_stream("all-a", ExpectedVersion::Any, numbered_events(3))
        .await
        .expect("append");
    client
        .append_to_stream("all-b", ExpectedVersion::Any, numbered_events(2))
        .await
        .expect("append");

    let slice = client
        .read_all_events_forward(Position::START, 100, false)
        .await
        .expect("read all");
    assert_eq!(slice.events.len(), 5);
    let positions: Vec<Position> = slice
        .events
        .iter()
        .map(|event| event.original_position().expect("position"))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted);
}

#[tokio::test(flavor = "multi_thread")]
async fn acl_round_trips_through_stream_metadata() {
    let (_node, client) = node_and_client().await;

    let metadata = StreamMetadata {
        max_count: Some(1000),
        acl: Some(StreamAcl {
            read_roles: Some(vec!["ouro".to_string()]),
            write_roles: Some(vec!["ouro".to_string(), "admin".to_string()]),
            ..StreamAcl::default()
        }),
        ..StreamMetadata::default()
    };
    client
        .set_stream_metadata("orders-6", ExpectedVersion::NoStream, metadata.clone())
        .await
        .expect("set metadata");

    let result = client
        .get_stream_metadata("orders-6")
        .await
        .expect("get metadata");
    assert_eq!(result.meta_stream_version, 0);
    assert!(!result.is_stream_deleted);
    assert_eq!(result.metadata, metadata);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_metadata_reads_as_empty() {
    let (_node, client) = node_and_client().await;
    let result = client
        .get_stream_metadata("orders-7")
        .await
        .expect("get metadata");
    assert_eq!(result.meta_stream_version, -1);
    assert_eq!(result.metadata, StreamMetadata::default());
}
