// Volatile and persistent subscription behavior: ordering, drop-once,
// handler failures, reconnect continuity and the ack/nak flow.
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use strom_client::{
    EventData, ExpectedVersion, NakAction, PersistentSubscription,
    PersistentSubscriptionListener, PersistentSubscriptionSettings, ResolvedEvent, Subscription,
    SubscriptionDropReason, SubscriptionListener,
};
use tokio::sync::mpsc;

use common::{expect_silence, node_and_client, recv_many, recv_one};

fn event(index: usize) -> EventData {
    EventData::json("numbered", &serde_json::json!({ "index": index })).expect("event")
}

struct Forwarding {
    events: mpsc::UnboundedSender<i64>,
    closes: mpsc::UnboundedSender<SubscriptionDropReason>,
    fail_on: Option<i64>,
}

impl SubscriptionListener for Forwarding {
    fn on_event(&self, _subscription: &Subscription, event: ResolvedEvent) -> anyhow::Result<()> {
        let number = event.original_event_number();
        if self.fail_on == Some(number) {
            anyhow::bail!("handler rejected event {number}");
        }
        let _ = self.events.send(number);
        Ok(())
    }

    fn on_close(
        &self,
        _subscription: &Subscription,
        reason: SubscriptionDropReason,
        _error: Option<anyhow::Error>,
    ) {
        let _ = self.closes.send(reason);
    }
}

fn forwarding(
    fail_on: Option<i64>,
) -> (
    Arc<Forwarding>,
    mpsc::UnboundedReceiver<i64>,
    mpsc::UnboundedReceiver<SubscriptionDropReason>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (closes_tx, closes_rx) = mpsc::unbounded_channel();
    (
        Arc::new(Forwarding {
            events: events_tx,
            closes: closes_tx,
            fail_on,
        }),
        events_rx,
        closes_rx,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn volatile_subscription_delivers_pushes_in_order() {
    let (_node, client) = node_and_client().await;
    let (listener, mut events, _closes) = forwarding(None);

    let subscription = client
        .subscribe_to_stream("sub-1", false, listener)
        .await
        .expect("subscribe");
    assert_eq!(subscription.stream_id(), "sub-1");

    for index in 0..20 {
        client
            .append_to_stream("sub-1", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }
    let numbers = recv_many(&mut events, 20).await;
    assert_eq!(numbers, (0..20).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_fires_the_close_callback_exactly_once() {
    let (_node, client) = node_and_client().await;
    let (listener, mut events, mut closes) = forwarding(None);

    let subscription = client
        .subscribe_to_stream("sub-2", false, listener)
        .await
        .expect("subscribe");
    subscription.unsubscribe();

    let reason = recv_one(&mut closes).await;
    assert_eq!(reason, SubscriptionDropReason::UserInitiated);
    expect_silence(&mut closes).await;

    // Events appended after the drop never reach the listener.
    client
        .append_to_stream("sub-2", ExpectedVersion::Any, vec![event(0)])
        .await
        .expect("append");
    expect_silence(&mut events).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_drops_with_event_handler_exception() {
    let (_node, client) = node_and_client().await;
    let (listener, mut events, mut closes) = forwarding(Some(1));

    let _subscription = client
        .subscribe_to_stream("sub-3", false, listener)
        .await
        .expect("subscribe");
    for index in 0..3 {
        client
            .append_to_stream("sub-3", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }

    assert_eq!(recv_one(&mut events).await, 0);
    let reason = recv_one(&mut closes).await;
    assert_eq!(reason, SubscriptionDropReason::EventHandlerException);
    expect_silence(&mut events).await;
    expect_silence(&mut closes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_survives_a_reconnect_without_gaps() {
    let (node, client) = node_and_client().await;
    let (listener, mut events, _closes) = forwarding(None);

    let _subscription = client
        .subscribe_to_stream("sub-4", false, listener)
        .await
        .expect("subscribe");
    client
        .append_to_stream("sub-4", ExpectedVersion::Any, vec![event(0)])
        .await
        .expect("append");
    assert_eq!(recv_one(&mut events).await, 0);

    node.drop_connections();

    // Queued on the client side until the channel is re-established; the
    // re-subscription resumes after event 0.
    client
        .append_to_stream("sub-4", ExpectedVersion::Any, vec![event(1)])
        .await
        .expect("append");
    client
        .append_to_stream("sub-4", ExpectedVersion::Any, vec![event(2)])
        .await
        .expect("append");
    assert_eq!(recv_many(&mut events, 2).await, vec![1, 2]);
}

struct PersistentForwarding {
    events: mpsc::UnboundedSender<(i64, i32)>,
    fail_first_retry: AtomicUsize,
}

impl PersistentSubscriptionListener for PersistentForwarding {
    fn on_event(
        &self,
        _subscription: &PersistentSubscription,
        event: ResolvedEvent,
        retry_count: i32,
    ) -> anyhow::Result<()> {
        let number = event.original_event_number();
        if retry_count == 0
            && number == 1
            && self.fail_first_retry.fetch_add(1, Ordering::SeqCst) == 0
        {
            anyhow::bail!("simulated handler failure");
        }
        let _ = self.events.send((number, retry_count));
        Ok(())
    }

    fn failure_action(&self) -> NakAction {
        NakAction::Retry
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_subscription_delivers_history_and_live_events() {
    let (_node, client) = node_and_client().await;
    for index in 0..3 {
        client
            .append_to_stream("ps-1", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }
    client
        .create_persistent_subscription("ps-1", "workers", PersistentSubscriptionSettings {
            start_from: 0,
            ..PersistentSubscriptionSettings::default()
        })
        .await
        .expect("create group");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = Arc::new(PersistentForwarding {
        events: events_tx,
        fail_first_retry: AtomicUsize::new(1),
    });
    let subscription = client
        .connect_to_persistent_subscription("ps-1", "workers", listener)
        .await
        .expect("connect");
    assert_eq!(subscription.group(), "workers");

    let history: Vec<i64> = recv_many(&mut events, 3)
        .await
        .into_iter()
        .map(|(number, _)| number)
        .collect();
    assert_eq!(history, vec![0, 1, 2]);

    client
        .append_to_stream("ps-1", ExpectedVersion::Any, vec![event(3)])
        .await
        .expect("append");
    let (number, retry_count) = recv_one(&mut events).await;
    assert_eq!((number, retry_count), (3, 0));

    subscription.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn nak_with_retry_redelivers_the_event() {
    let (_node, client) = node_and_client().await;
    for index in 0..2 {
        client
            .append_to_stream("ps-2", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }
    client
        .create_persistent_subscription("ps-2", "workers", PersistentSubscriptionSettings {
            start_from: 0,
            ..PersistentSubscriptionSettings::default()
        })
        .await
        .expect("create group");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = Arc::new(PersistentForwarding {
        events: events_tx,
        fail_first_retry: AtomicUsize::new(0),
    });
    let _subscription = client
        .connect_to_persistent_subscription("ps-2", "workers", listener)
        .await
        .expect("connect");

    // Event 0 succeeds, event 1 fails once, is nakked with Retry and comes
    // back with a bumped retry count.
    assert_eq!(recv_one(&mut events).await, (0, 0));
    assert_eq!(recv_one(&mut events).await, (1, 1));
}

#[tokio::test(flavor = "multi_thread")]
async fn connecting_to_a_missing_group_fails() {
    let (_node, client) = node_and_client().await;
    let (events_tx, _events) = mpsc::unbounded_channel();
    let listener = Arc::new(PersistentForwarding {
        events: events_tx,
        fail_first_retry: AtomicUsize::new(1),
    });
    let result = client
        .connect_to_persistent_subscription("ps-3", "missing", listener)
        .await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_group_creation_is_rejected() {
    let (_node, client) = node_and_client().await;
    client
        .create_persistent_subscription(
            "ps-4",
            "workers",
            PersistentSubscriptionSettings::default(),
        )
        .await
        .expect("create group");
    let err = client
        .create_persistent_subscription(
            "ps-4",
            "workers",
            PersistentSubscriptionSettings::default(),
        )
        .await
        .expect_err("duplicate");
    assert!(matches!(
        err,
        strom_client::OperationError::PersistentSubscriptionAlreadyExists { .. }
    ));

    client
        .delete_persistent_subscription("ps-4", "workers")
        .await
        .expect("delete group");
    client
        .create_persistent_subscription(
            "ps-4",
            "workers",
            PersistentSubscriptionSettings::default(),
        )
        .await
        .expect("recreate group");
}
